//! HTTP surface: the WHIP routes plus a small administrative API.
//!
//! This layer is a thin shim: it validates content types, runs the
//! authorization gate, calls into the ingest controller, and shapes the
//! response envelope (Location, ETag, Accept-Patch, Link headers).

use crate::auth;
use crate::config::{GatewayConfig, IceServer, Recipient};
use crate::endpoint::{Endpoint, EndpointDescriptor, Token};
use crate::error::Error;
use crate::ingest::{IngestController, PatchOutcome};
use crate::{SDP_CONTENT_TYPE, TRICKLE_CONTENT_TYPE};
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tower_http::trace::TraceLayer;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub controller: IngestController,
    pub base_path: String,
    pub ice_servers: Vec<IceServer>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(controller: IngestController, config: &GatewayConfig) -> Self {
        Self {
            controller,
            base_path: config.http.base_path.clone(),
            ice_servers: config.ice_servers.clone(),
            started_at: Instant::now(),
        }
    }

    fn location(&self, resource_id: &str) -> String {
        join_location(&self.base_path, resource_id)
    }

    fn ice_servers_for<'a>(&'a self, endpoint: &'a Endpoint) -> &'a [IceServer] {
        endpoint.ice_servers.as_deref().unwrap_or(&self.ice_servers)
    }
}

/// Build the gateway router, nested under the configured base path.
pub fn router(state: AppState) -> Router {
    let base_path = state.base_path.clone();
    let routes = Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/endpoint/{id}", post(publish).options(endpoint_options))
        .route(
            "/resource/{rid}",
            axum::routing::patch(patch_resource)
                .delete(delete_resource)
                .options(resource_options),
        )
        .route("/admin/endpoints", post(admin_create).get(admin_list))
        .route("/admin/endpoints/{id}", delete(admin_destroy))
        .with_state(state);

    let app = if base_path == "/" || base_path.is_empty() {
        routes
    } else {
        Router::new().nest(&base_path, routes)
    };

    // CORS is stamped on by hand rather than with a CorsLayer: the layer
    // would intercept OPTIONS requests outright, and WHIP needs those to
    // reach the handler that advertises ICE servers.
    app.layer(middleware::from_fn(cors_headers))
        .layer(TraceLayer::new_for_http())
}

async fn cors_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PATCH, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Authorization, Content-Type, If-Match"),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Location, Link"),
    );
    response
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Liveness probe.
async fn healthcheck(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        uptime_seconds: state.started_at.elapsed().as_secs_f64(),
        backend_connected: state.controller.backend().is_connected(),
        endpoints: state.controller.registry().len(),
    })
}

/// Publish an ingest: `POST /endpoint/{id}` with an SDP offer.
async fn publish(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, Error> {
    let endpoint = state
        .controller
        .registry()
        .get(&id)
        .ok_or_else(|| Error::EndpointNotFound(id.clone()))?;

    let content_type = header_str(&headers, header::CONTENT_TYPE);
    if !content_type.is_some_and(|value| value.starts_with(SDP_CONTENT_TYPE)) {
        return Err(Error::UnsupportedMedia(format!(
            "expected {}",
            SDP_CONTENT_TYPE
        )));
    }
    auth::authorize(&endpoint, header_str(&headers, header::AUTHORIZATION))?;

    let outcome = state.controller.publish(&id, &body).await?;

    let mut response = Response::builder()
        .status(StatusCode::CREATED)
        .header(header::CONTENT_TYPE, SDP_CONTENT_TYPE)
        .header(header::LOCATION, state.location(&outcome.resource_id))
        .header(header::ETAG, format!("\"{}\"", outcome.etag))
        .header("Accept-Patch", TRICKLE_CONTENT_TYPE);
    for link in ice_links(state.ice_servers_for(&endpoint)) {
        response = response.header(header::LINK, link);
    }
    Ok(response.body(Body::from(outcome.answer_sdp)).unwrap())
}

/// CORS preflight plus the ICE server advertisement. Always silent: an
/// unknown endpoint or a failed authorization just drops the Link
/// headers.
async fn endpoint_options(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let mut response = Response::builder().status(StatusCode::NO_CONTENT);
    if let Some(endpoint) = state.controller.registry().get(&id) {
        if auth::authorize(&endpoint, header_str(&headers, header::AUTHORIZATION)).is_ok() {
            for link in ice_links(state.ice_servers_for(&endpoint)) {
                response = response.header(header::LINK, link);
            }
        }
    }
    response.body(Body::empty()).unwrap()
}

/// CORS preflight for the resource routes.
async fn resource_options() -> Response {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Accept-Patch", TRICKLE_CONTENT_TYPE)
        .body(Body::empty())
        .unwrap()
}

/// Trickle candidates or an ICE restart: `PATCH /resource/{rid}`.
async fn patch_resource(
    State(state): State<AppState>,
    Path(rid): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, Error> {
    let endpoint = state
        .controller
        .registry()
        .lookup_by_resource(&rid)
        .ok_or_else(|| Error::ResourceNotFound(rid.clone()))?;

    let content_type = header_str(&headers, header::CONTENT_TYPE);
    if !content_type.is_some_and(|value| value.starts_with(TRICKLE_CONTENT_TYPE)) {
        return Err(Error::UnsupportedMedia(format!(
            "expected {}",
            TRICKLE_CONTENT_TYPE
        )));
    }
    auth::authorize(&endpoint, header_str(&headers, header::AUTHORIZATION))?;

    let if_match = header_str(&headers, header::IF_MATCH);
    match state.controller.patch(&rid, &body, if_match).await? {
        PatchOutcome::Trickled { etag } => Ok(Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(header::ETAG, format!("\"{}\"", etag))
            .body(Body::empty())
            .unwrap()),
        PatchOutcome::Restarted { etag, fragment } => Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, TRICKLE_CONTENT_TYPE)
            .header(header::ETAG, format!("\"{}\"", etag))
            .body(Body::from(fragment))
            .unwrap()),
    }
}

/// Tear down a session: `DELETE /resource/{rid}`.
async fn delete_resource(
    State(state): State<AppState>,
    Path(rid): Path<String>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let endpoint = state
        .controller
        .registry()
        .lookup_by_resource(&rid)
        .ok_or_else(|| Error::ResourceNotFound(rid.clone()))?;
    auth::authorize(&endpoint, header_str(&headers, header::AUTHORIZATION))?;
    state.controller.teardown_resource(&rid).await?;
    Ok(StatusCode::OK.into_response())
}

/// Administrative endpoint creation. Only static tokens are expressible
/// over HTTP; predicate tokens are a library-embedding feature.
async fn admin_create(
    State(state): State<AppState>,
    Json(request): Json<CreateEndpointRequest>,
) -> Result<Response, Error> {
    let endpoint = state.controller.registry().create(EndpointDescriptor {
        id: request.id,
        room: request.room,
        label: request.label,
        pin: request.pin,
        secret: request.secret,
        admin_key: request.admin_key,
        token: request.token.map(Token::Static),
        ice_servers: request.ice_servers,
        recipient: request.recipient,
    })?;
    Ok((StatusCode::CREATED, Json(project(&endpoint))).into_response())
}

/// Projection listing: presence booleans only, never the credentials.
async fn admin_list(State(state): State<AppState>) -> Json<Vec<EndpointProjection>> {
    let mut endpoints: Vec<EndpointProjection> = state
        .controller
        .registry()
        .list()
        .iter()
        .map(|endpoint| project(endpoint))
        .collect();
    endpoints.sort_by(|a, b| a.id.cmp(&b.id));
    Json(endpoints)
}

/// Destroy an endpoint, tearing down any active session first.
async fn admin_destroy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, Error> {
    state.controller.destroy_endpoint(&id).await?;
    Ok(StatusCode::OK.into_response())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: f64,
    backend_connected: bool,
    endpoints: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateEndpointRequest {
    id: String,
    room: u64,
    label: Option<String>,
    pin: Option<String>,
    secret: Option<String>,
    admin_key: Option<String>,
    token: Option<String>,
    ice_servers: Option<Vec<IceServer>>,
    recipient: Option<Recipient>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EndpointProjection {
    id: String,
    room: u64,
    label: String,
    enabled: bool,
    state: &'static str,
    pin: bool,
    secret: bool,
    admin_key: bool,
    token: bool,
    ice_servers: bool,
    recipient: bool,
    created_at: String,
}

fn project(endpoint: &Endpoint) -> EndpointProjection {
    EndpointProjection {
        id: endpoint.id.clone(),
        room: endpoint.room,
        label: endpoint.label.clone(),
        enabled: !endpoint.is_idle(),
        state: endpoint.phase().as_str(),
        pin: endpoint.pin.is_some(),
        secret: endpoint.secret.is_some(),
        admin_key: endpoint.admin_key.is_some(),
        token: endpoint.token.is_some(),
        ice_servers: endpoint.ice_servers.is_some(),
        recipient: endpoint.recipient.is_some(),
        created_at: endpoint.created_at.to_rfc3339(),
    }
}

fn join_location(base_path: &str, resource_id: &str) -> String {
    format!(
        "{}/resource/{}",
        base_path.trim_end_matches('/'),
        resource_id
    )
}

/// One Link header entry per advertisable ICE server.
fn ice_links(servers: &[IceServer]) -> Vec<String> {
    servers
        .iter()
        .filter(|server| server.has_valid_scheme())
        .map(|server| {
            let mut link = format!("<{}>; rel=\"ice-server\"", server.uri);
            if let (Some(username), Some(credential)) = (&server.username, &server.credential) {
                link.push_str(&format!(
                    "; username=\"{}\"; credential=\"{}\"; credential-type=\"password\"",
                    username, credential
                ));
            }
            link
        })
        .collect()
}

//! WHIP ingestion gateway for the Janus VideoRoom plugin.
//!
//! This crate implements the WebRTC-HTTP Ingestion Protocol (RFC 9725) in
//! front of a Janus media server. Publishers talk plain HTTP to the
//! gateway; the gateway drives the backend over its WebSocket API and
//! never touches a PeerConnection itself.
//!
//! # Architecture
//!
//! ```text
//!   ┌────────────┐  POST /endpoint/{id}   ┌─────────────────┐
//!   │  Publisher │───────────────────────▶│                 │
//!   │ (browser,  │  PATCH /resource/{rid} │     Gateway     │
//!   │  OBS, ...) │───────────────────────▶│                 │
//!   └────────────┘  DELETE /resource/{rid}│ registry+ingest │
//!                                         └────────┬────────┘
//!                                                  │ WebSocket
//!                                                  │ (janus-protocol)
//!                                         ┌────────▼────────┐
//!                                         │  Janus server   │
//!                                         │   (VideoRoom)   │
//!                                         └─────────────────┘
//! ```
//!
//! A publish attaches a VideoRoom handle, joins the endpoint's room with
//! the client's SDP offer, and answers with `201 Created`, a `Location`
//! pointing at the session resource, and an `ETag`. Subsequent `PATCH`
//! requests trickle ICE candidates or, when they carry changed ICE
//! credentials, run a full ICE restart. `DELETE` tears the session down.
//! If the backend connection is lost, every live session is invalidated
//! and the gateway reconnects with backoff; endpoints survive and can be
//! republished to.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use whip_gateway::{
//!     AppState, EndpointDescriptor, EndpointRegistry, GatewayConfig, IngestController,
//!     JanusClient,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = GatewayConfig::default();
//!     let registry = Arc::new(EndpointRegistry::new());
//!     registry
//!         .create(EndpointDescriptor {
//!             id: "abc".into(),
//!             room: 1234,
//!             ..EndpointDescriptor::default()
//!         })
//!         .unwrap();
//!
//!     let (janus, events) = JanusClient::new(config.backend.clone());
//!     let controller = IngestController::new(registry, janus, &config);
//!     // Serve immediately; the backend connection is supervised in the
//!     // background and publishes answer 503 until it is up.
//!     tokio::spawn({
//!         let controller = controller.clone();
//!         async move {
//!             controller.connect_with_retry().await;
//!             controller.run(events).await;
//!         }
//!     });
//!
//!     let app = whip_gateway::http::router(AppState::new(controller, &config));
//!     let listener = tokio::net::TcpListener::bind(&config.http.address).await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

pub mod auth;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod ingest;
pub mod janus;
pub mod protocol;
pub mod registry;
pub mod sdp;

pub use config::{BackendConfig, GatewayConfig, IceServer, Recipient};
pub use endpoint::{Endpoint, EndpointDescriptor, IngestPhase, Token};
pub use error::{Error, Result};
pub use http::AppState;
pub use ingest::{GatewayEvent, IngestController, PatchOutcome, PublishOutcome};
pub use janus::{BackendEvent, ConnectionState, JanusClient, PluginHandle};
pub use registry::EndpointRegistry;

/// Content type of WHIP publish bodies.
pub const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Content type of trickle/restart PATCH bodies.
pub const TRICKLE_CONTENT_TYPE: &str = "application/trickle-ice-sdpfrag";

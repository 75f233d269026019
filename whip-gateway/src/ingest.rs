//! Ingest controller.
//!
//! Drives the per-endpoint state machine (publish, trickle, ICE restart,
//! teardown) against the backend client and the endpoint registry, and
//! supervises the backend connection: on a lost connection every live
//! session is invalidated before reconnection is attempted.

use crate::config::{GatewayConfig, Recipient, ReconnectConfig};
use crate::endpoint::{Endpoint, IngestSession};
use crate::error::{Error, Result};
use crate::janus::{BackendEvent, JanusClient, PluginHandle};
use crate::protocol::{ForwardRequest, PublishRequest};
use crate::registry::{nonce, EndpointRegistry, NONCE_LEN};
use crate::sdp;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Lifecycle notifications observable by embedders (and tests).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum GatewayEvent {
    /// A publish reached ACTIVE.
    EndpointActive { endpoint: String },
    /// A session was torn down, for whatever reason.
    EndpointInactive { endpoint: String },
    /// The backend connection was lost; every session is gone.
    JanusDisconnected,
    /// The backend connection is back.
    JanusReconnected,
}

/// What a successful publish hands back to the HTTP layer.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub resource_id: String,
    pub etag: String,
    pub answer_sdp: String,
}

/// What a successful PATCH hands back to the HTTP layer.
#[derive(Debug, Clone)]
pub enum PatchOutcome {
    /// Candidates forwarded; the ETag is unchanged.
    Trickled { etag: String },
    /// ICE restart completed: fresh ETag plus the answer fragment.
    Restarted { etag: String, fragment: String },
}

struct Inner {
    registry: Arc<EndpointRegistry>,
    janus: JanusClient,
    allow_trickle: bool,
    strict_etags: bool,
    reconnect: ReconnectConfig,
    /// Backend handle -> endpoint id, maintained from attach to teardown
    /// so spontaneous closures can find their owner even while the
    /// publish that created the handle is still in flight.
    handles: Mutex<HashMap<u64, String>>,
    events: broadcast::Sender<GatewayEvent>,
}

/// The per-endpoint ingest state machine. Cheap to clone.
#[derive(Clone)]
pub struct IngestController {
    inner: Arc<Inner>,
}

impl IngestController {
    pub fn new(registry: Arc<EndpointRegistry>, janus: JanusClient, config: &GatewayConfig) -> Self {
        let (events, _) = broadcast::channel(1000);
        Self {
            inner: Arc::new(Inner {
                registry,
                janus,
                allow_trickle: config.allow_trickle,
                strict_etags: config.strict_etags,
                reconnect: config.backend.reconnect.clone(),
                handles: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.inner.registry
    }

    pub fn backend(&self) -> &JanusClient {
        &self.inner.janus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: GatewayEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Publish an SDP offer to an endpoint: attach a backend handle, join
    /// the room, optionally set up RTP forwarding, and commit the session.
    pub async fn publish(&self, id: &str, offer: &str) -> Result<PublishOutcome> {
        let endpoint = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| Error::EndpointNotFound(id.to_string()))?;
        if !sdp::is_sdp(offer) {
            return Err(Error::UnsupportedMedia("body is not an SDP offer".into()));
        }

        let _ops = endpoint.ops().lock().await;
        endpoint.begin_negotiation()?;
        // From here until commit, any exit path (including this future
        // being dropped because the client went away) must put the
        // endpoint back to IDLE.
        let mut guard = PublishGuard::new(self.clone(), endpoint.clone());

        let janus = &self.inner.janus;
        let generation = janus.generation();
        if !janus.is_connected() {
            return Err(Error::BackendUnavailable);
        }

        let resource_id = self.inner.registry.reserve_resource(&endpoint.id);
        guard.resource_id = Some(resource_id.clone());
        let etag = nonce(NONCE_LEN);
        let ice_ufrag = sdp::media_attribute(offer, "ice-ufrag").unwrap_or_default();
        let ice_pwd = sdp::media_attribute(offer, "ice-pwd").unwrap_or_default();

        let handle = match janus.attach().await {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail_publish(&endpoint, None, e).await),
        };
        guard.handle_id = Some(handle.id());
        self.inner
            .handles
            .lock()
            .insert(handle.id(), endpoint.id.clone());

        let join = PublishRequest::new(endpoint.room, endpoint.label.clone(), endpoint.pin.clone());
        let reply = match handle.configure(offer, Some(join)).await {
            Ok(reply) => reply,
            Err(e) => return Err(self.fail_publish(&endpoint, Some(&handle), e).await),
        };
        let publisher_id = reply.publisher_id.unwrap_or_default();

        if let Some(recipient) = endpoint.recipient.as_ref().filter(|r| r.has_targets()) {
            let forward = forward_request(&endpoint, publisher_id, recipient);
            if let Err(e) = handle.start_forward(forward).await {
                return Err(self.fail_publish(&endpoint, Some(&handle), e).await);
            }
        }

        // The negotiated answer is only good on the connection it was
        // negotiated on; if that turned over mid-flight the disconnect
        // sweep owns the endpoint now.
        if janus.generation() != generation || !janus.is_connected() {
            let error = Error::Backend("backend connection lost during publish".into());
            return Err(self.fail_publish(&endpoint, None, error).await);
        }

        guard.commit();
        endpoint.commit_active(IngestSession {
            handle_id: handle.id(),
            publisher_id,
            sdp_offer: offer.to_string(),
            ice_ufrag,
            ice_pwd,
            resource_id: resource_id.clone(),
            etag: etag.clone(),
        });
        info!(
            endpoint = %endpoint.id,
            resource = %resource_id,
            publisher = publisher_id,
            "publish established"
        );
        self.emit(GatewayEvent::EndpointActive {
            endpoint: endpoint.id.clone(),
        });
        Ok(PublishOutcome {
            resource_id,
            etag,
            answer_sdp: reply.sdp,
        })
    }

    /// Best-effort detach plus logging on the publish error path; the
    /// caller's [`PublishGuard`] rolls the bookkeeping back.
    async fn fail_publish(
        &self,
        endpoint: &Arc<Endpoint>,
        handle: Option<&PluginHandle>,
        error: Error,
    ) -> Error {
        if let Some(handle) = handle {
            handle.detach().await;
        }
        warn!(endpoint = %endpoint.id, "publish failed: {}", error);
        error
    }

    /// Apply a trickle fragment to a live resource: forward candidates,
    /// or run an ICE restart when the fragment carries changed
    /// credentials.
    pub async fn patch(
        &self,
        resource_id: &str,
        body: &str,
        if_match: Option<&str>,
    ) -> Result<PatchOutcome> {
        if !self.inner.allow_trickle {
            return Err(Error::TrickleDisabled);
        }
        let endpoint = self
            .inner
            .registry
            .lookup_by_resource(resource_id)
            .ok_or_else(|| Error::ResourceNotFound(resource_id.to_string()))?;

        let _ops = endpoint.ops().lock().await;
        // The session may have been torn down while we waited for our turn.
        let session = endpoint
            .session()
            .ok_or_else(|| Error::ResourceNotFound(resource_id.to_string()))?;
        if !self.inner.janus.is_connected() {
            return Err(Error::BackendUnavailable);
        }

        let fragment = sdp::parse_fragment(body);
        let restart = fragment.has_credentials()
            && (fragment.ice_ufrag.as_deref() != Some(session.ice_ufrag.as_str())
                || fragment.ice_pwd.as_deref() != Some(session.ice_pwd.as_str()));

        if self.inner.strict_etags {
            check_precondition(if_match, &session.etag, restart)?;
        }

        let handle = self.inner.janus.handle(session.handle_id);
        if !restart {
            handle.trickle(&fragment.candidates)?;
            debug!(
                endpoint = %endpoint.id,
                candidates = fragment.candidates.len(),
                "forwarded trickle candidates"
            );
            return Ok(PatchOutcome::Trickled { etag: session.etag });
        }

        let new_ufrag = fragment.ice_ufrag.clone().unwrap_or_default();
        let new_pwd = fragment.ice_pwd.clone().unwrap_or_default();
        let restart_offer = sdp::rewrite_ice_credentials(
            &session.sdp_offer,
            &session.ice_ufrag,
            &session.ice_pwd,
            &new_ufrag,
            &new_pwd,
        );
        let new_etag = nonce(NONCE_LEN);

        let reply = handle.configure(&restart_offer, None).await?;
        endpoint.update_session(|s| {
            s.sdp_offer = restart_offer.clone();
            s.ice_ufrag = new_ufrag.clone();
            s.ice_pwd = new_pwd.clone();
            s.etag = new_etag.clone();
        });
        // Candidates that rode along in the restart request go out only
        // after the answer is in.
        handle.trickle(&fragment.candidates)?;
        info!(endpoint = %endpoint.id, "ICE restart completed");
        Ok(PatchOutcome::Restarted {
            etag: new_etag,
            fragment: sdp::restart_fragment(&reply.sdp),
        })
    }

    /// Tear down the session behind a resource id. Succeeds even when the
    /// backend is gone; the endpoint itself survives.
    pub async fn teardown_resource(&self, resource_id: &str) -> Result<()> {
        let endpoint = self
            .inner
            .registry
            .lookup_by_resource(resource_id)
            .ok_or_else(|| Error::ResourceNotFound(resource_id.to_string()))?;
        let _ops = endpoint.ops().lock().await;
        self.teardown_locked(&endpoint, true).await;
        Ok(())
    }

    /// Tear down any session and remove the endpoint from the registry.
    pub async fn destroy_endpoint(&self, id: &str) -> Result<()> {
        let endpoint = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| Error::EndpointNotFound(id.to_string()))?;
        {
            let _ops = endpoint.ops().lock().await;
            self.teardown_locked(&endpoint, true).await;
        }
        self.inner.registry.remove(id);
        info!(endpoint = %id, "endpoint destroyed");
        Ok(())
    }

    /// Caller holds the endpoint's ops lock.
    async fn teardown_locked(&self, endpoint: &Arc<Endpoint>, detach_handle: bool) {
        let Some(session) = endpoint.session() else {
            return;
        };
        self.inner.handles.lock().remove(&session.handle_id);
        if detach_handle && self.inner.janus.is_connected() {
            self.inner.janus.handle(session.handle_id).detach().await;
        }
        self.inner.registry.release_resource(&session.resource_id);
        endpoint.clear_session();
        info!(
            endpoint = %endpoint.id,
            resource = %session.resource_id,
            "session torn down"
        );
        self.emit(GatewayEvent::EndpointInactive {
            endpoint: endpoint.id.clone(),
        });
    }

    /// The backend closed a handle on its own: tear down the owning
    /// endpoint without detaching (the handle is already gone).
    async fn handle_closed(&self, handle_id: u64) {
        let endpoint_id = self.inner.handles.lock().get(&handle_id).cloned();
        let Some(endpoint_id) = endpoint_id else {
            debug!(handle_id, "closure for unknown handle");
            return;
        };
        let Some(endpoint) = self.inner.registry.get(&endpoint_id) else {
            return;
        };
        // Taking the ops lock orders us after any in-flight request on
        // this handle.
        let _ops = endpoint.ops().lock().await;
        if endpoint.session().map(|s| s.handle_id) != Some(handle_id) {
            return;
        }
        warn!(endpoint = %endpoint_id, handle_id, "backend closed the publisher handle");
        self.teardown_locked(&endpoint, false).await;
    }

    /// The backend connection is gone: every non-idle endpoint goes back
    /// to IDLE, with no detach calls, before reconnection is attempted.
    async fn sweep_after_disconnect(&self) {
        for endpoint in self.inner.registry.list() {
            let _ops = endpoint.ops().lock().await;
            self.teardown_locked(&endpoint, false).await;
        }
        self.inner.handles.lock().clear();
        self.emit(GatewayEvent::JanusDisconnected);
    }

    /// Retry until the backend accepts a connection, per the configured
    /// backoff policy.
    pub async fn connect_with_retry(&self) {
        let mut delay = self.inner.reconnect.initial_delay();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.inner.janus.connect().await {
                Ok(()) => {
                    info!(attempt, "backend connection established");
                    return;
                }
                Err(e) => {
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "backend connection failed: {}", e);
                }
            }
            tokio::time::sleep(delay).await;
            delay = self.inner.reconnect.next_delay(delay);
        }
    }

    /// Drive backend events for the life of the process.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<BackendEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                BackendEvent::HandleClosed { handle_id } => self.handle_closed(handle_id).await,
                BackendEvent::Disconnected => {
                    self.sweep_after_disconnect().await;
                    self.connect_with_retry().await;
                    self.emit(GatewayEvent::JanusReconnected);
                }
            }
        }
    }
}

/// Rolls a publish back to IDLE when the flow errors out or its future is
/// dropped mid-negotiation (the HTTP client went away). Disarmed by
/// `commit` once the session is in place.
struct PublishGuard {
    controller: IngestController,
    endpoint: Arc<Endpoint>,
    resource_id: Option<String>,
    handle_id: Option<u64>,
    committed: bool,
}

impl PublishGuard {
    fn new(controller: IngestController, endpoint: Arc<Endpoint>) -> Self {
        Self {
            controller,
            endpoint,
            resource_id: None,
            handle_id: None,
            committed: false,
        }
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for PublishGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(handle_id) = self.handle_id.take() {
            self.controller.inner.handles.lock().remove(&handle_id);
        }
        if let Some(resource_id) = self.resource_id.take() {
            self.controller.inner.registry.release_resource(&resource_id);
        }
        self.endpoint.clear_session();
        debug!(endpoint = %self.endpoint.id, "publish rolled back");
    }
}

fn check_precondition(if_match: Option<&str>, etag: &str, restart: bool) -> Result<()> {
    // Restarts must assert "*" (quoted, per RFC 7232); plain trickles
    // must assert the current entity tag and may not use the wildcard.
    let expected = if restart {
        "\"*\"".to_string()
    } else {
        format!("\"{}\"", etag)
    };
    match if_match {
        Some(value) if value == expected => Ok(()),
        Some(value) => Err(Error::PreconditionFailed(format!(
            "If-Match {} does not match",
            value
        ))),
        None => Err(Error::PreconditionFailed("If-Match required".into())),
    }
}

fn forward_request(endpoint: &Endpoint, publisher_id: u64, recipient: &Recipient) -> ForwardRequest {
    let mut rng = rand::thread_rng();
    ForwardRequest {
        request: "rtp_forward",
        room: endpoint.room,
        publisher_id,
        host: recipient.host.clone(),
        audio_port: (recipient.audio_port > 0).then_some(recipient.audio_port),
        audio_ssrc: (recipient.audio_port > 0).then(|| rng.gen()),
        video_port: (recipient.video_port > 0).then_some(recipient.video_port),
        video_ssrc: (recipient.video_port > 0).then(|| rng.gen()),
        video_rtcp_port: (recipient.video_rtcp_port > 0).then_some(recipient.video_rtcp_port),
        secret: endpoint.secret.clone(),
        admin_key: endpoint.admin_key.clone(),
    }
}

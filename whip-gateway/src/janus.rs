//! Media backend client.
//!
//! Owns the WebSocket link to the Janus API: exactly one backend session,
//! any number of plugin handles bound to it. Requests are correlated with
//! responses by transaction id over a single asynchronous stream; inbound
//! frames that match no outstanding transaction are surfaced as events
//! (spontaneous hangups, session timeouts). Matching removes the waiter
//! before event dispatch runs, so a frame is never delivered twice.

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    ClientFrame, ConfigureRequest, ForwardRequest, Jsep, PublishRequest, ServerFrame,
    VIDEOROOM_PLUGIN,
};
use crate::registry::{nonce, NONCE_LEN};
use crate::sdp::TrickleCandidate;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

/// Connection lifecycle of the backend link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Unsolicited backend notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    /// The backend closed a plugin handle on its own (remote peer gone).
    HandleClosed { handle_id: u64 },
    /// The transport or the backend session is gone.
    Disconnected,
}

struct Shared {
    config: BackendConfig,
    state: Mutex<ConnectionState>,
    /// Bumped on every teardown; tasks from a previous link compare it to
    /// bail out instead of clobbering a fresh connection.
    generation: AtomicU64,
    session_id: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    waiters: Mutex<HashMap<String, oneshot::Sender<ServerFrame>>>,
    events: mpsc::UnboundedSender<BackendEvent>,
}

/// Client for the media backend's WebSocket API. Cheap to clone; all
/// clones share the same connection.
#[derive(Clone)]
pub struct JanusClient {
    shared: Arc<Shared>,
}

impl JanusClient {
    /// Create a client plus the stream of backend events. Events start
    /// flowing once `connect` succeeds.
    pub fn new(config: BackendConfig) -> (Self, mpsc::UnboundedReceiver<BackendEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let client = Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(ConnectionState::Disconnected),
                generation: AtomicU64::new(0),
                session_id: AtomicU64::new(0),
                outbound: Mutex::new(None),
                waiters: Mutex::new(HashMap::new()),
                events,
            }),
        };
        (client, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current connection generation. Callers snapshot this before a
    /// multi-step exchange and re-check it before committing state that
    /// must not outlive the connection it was negotiated on.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Establish the transport, create the backend session, and start the
    /// keep-alive task. Refuses to overlap an existing connection attempt.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
                _ => {
                    return Err(Error::InvalidArgument(
                        "backend connect already in progress".into(),
                    ))
                }
            }
        }
        let generation = self.generation();
        match self.establish(generation).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.teardown(generation);
                Err(e)
            }
        }
    }

    async fn establish(&self, generation: u64) -> Result<()> {
        let config = &self.shared.config;
        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Backend(format!("invalid backend url: {}", e)))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static("janus-protocol"),
        );

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| Error::Backend(format!("backend dial failed: {}", e)))?;
        debug!(url = %config.url, "backend transport established");
        let (mut sink, mut source) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        *self.shared.outbound.lock() = Some(outbound_tx);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            trace!("backend writer task finished");
        });

        let client = self.clone();
        tokio::spawn(async move {
            while let Some(next) = source.next().await {
                match next {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerFrame>(text.as_str()) {
                            Ok(frame) => client.dispatch(frame),
                            Err(e) => warn!("undecodable backend frame: {}", e),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("backend read error: {}", e);
                        break;
                    }
                }
            }
            client.lose(generation, "transport closed");
        });

        let mut create = ClientFrame::new("create", nonce(NONCE_LEN));
        create.apisecret = config.api_secret.clone();
        let created = self.request(create).await?;
        let session_id = created
            .new_id()
            .ok_or_else(|| Error::Backend("create response carried no session id".into()))?;
        self.shared.session_id.store(session_id, Ordering::SeqCst);

        let client = self.clone();
        tokio::spawn(async move { client.keepalive_loop(generation).await });

        *self.shared.state.lock() = ConnectionState::Connected;
        info!(session_id, "backend session established");
        Ok(())
    }

    /// Destroy the backend session and drop the link, without emitting a
    /// disconnect event.
    pub async fn close(&self) {
        if self.is_connected() {
            if let Ok(frame) = self.session_frame("destroy") {
                let _ = self.request(frame).await;
            }
        }
        self.teardown(self.generation());
    }

    /// Attach a fresh plugin handle to the backend session.
    pub async fn attach(&self) -> Result<PluginHandle> {
        let mut frame = self.session_frame("attach")?;
        frame.plugin = Some(VIDEOROOM_PLUGIN);
        let reply = self.request(frame).await?;
        let handle_id = reply
            .new_id()
            .ok_or_else(|| Error::Backend("attach response carried no handle id".into()))?;
        debug!(handle_id, "attached plugin handle");
        Ok(self.handle(handle_id))
    }

    /// Re-wrap a known handle id.
    pub fn handle(&self, handle_id: u64) -> PluginHandle {
        PluginHandle {
            client: self.clone(),
            id: handle_id,
        }
    }

    async fn keepalive_loop(&self, generation: u64) {
        let mut interval = tokio::time::interval(self.shared.config.keepalive_interval());
        interval.tick().await;
        loop {
            interval.tick().await;
            if self.generation() != generation || !self.is_connected() {
                break;
            }
            let Ok(frame) = self.session_frame("keepalive") else {
                break;
            };
            // Missed acks are not an error; transport failure is what
            // tears the connection down.
            if self.send(&frame).is_err() {
                break;
            }
            trace!("keepalive sent");
        }
        trace!("keepalive task finished");
    }

    /// Register a waiter, send the frame, and wait for its terminal
    /// response. Intermediate acks leave the waiter in place.
    async fn request(&self, frame: ClientFrame) -> Result<ServerFrame> {
        let (sender, receiver) = oneshot::channel();
        let transaction = frame.transaction.clone();
        self.shared
            .waiters
            .lock()
            .insert(transaction.clone(), sender);

        if let Err(e) = self.send(&frame) {
            self.shared.waiters.lock().remove(&transaction);
            return Err(e);
        }

        let reply = match tokio::time::timeout(self.shared.config.request_timeout(), receiver).await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(Error::Backend("backend connection lost".into())),
            Err(_) => {
                self.shared.waiters.lock().remove(&transaction);
                return Err(Error::Backend(format!("'{}' request timed out", frame.janus)));
            }
        };

        if let Some(error) = reply.error_text() {
            return Err(Error::Backend(error));
        }
        Ok(reply)
    }

    fn send(&self, frame: &ClientFrame) -> Result<()> {
        let text = serde_json::to_string(frame)
            .map_err(|e| Error::Backend(format!("frame encode failed: {}", e)))?;
        let outbound = self.shared.outbound.lock();
        let sender = outbound.as_ref().ok_or(Error::BackendUnavailable)?;
        sender
            .send(Message::text(text))
            .map_err(|_| Error::BackendUnavailable)
    }

    fn session_frame(&self, janus: &'static str) -> Result<ClientFrame> {
        let session_id = self.shared.session_id.load(Ordering::SeqCst);
        if session_id == 0 {
            return Err(Error::BackendUnavailable);
        }
        let mut frame = ClientFrame::new(janus, nonce(NONCE_LEN));
        frame.session_id = Some(session_id);
        frame.apisecret = self.shared.config.api_secret.clone();
        Ok(frame)
    }

    /// Route an inbound frame: transaction waiters first, then events.
    fn dispatch(&self, frame: ServerFrame) {
        if let Some(transaction) = frame.transaction.clone() {
            let mut waiters = self.shared.waiters.lock();
            if let Some(sender) = waiters.remove(&transaction) {
                if frame.is_ack() {
                    trace!(%transaction, "ack, waiting for terminal frame");
                    waiters.insert(transaction, sender);
                } else {
                    drop(waiters);
                    let _ = sender.send(frame);
                }
                return;
            }
            drop(waiters);
            // Acks for fire-and-forget requests (trickle, keepalive).
            if frame.is_ack() {
                return;
            }
        }
        self.handle_event(frame);
    }

    fn handle_event(&self, frame: ServerFrame) {
        match frame.janus.as_str() {
            "hangup" | "detached" => {
                if let Some(handle_id) = frame.sender {
                    debug!(
                        handle_id,
                        reason = frame.reason.as_deref().unwrap_or("unknown"),
                        "backend closed handle"
                    );
                    let _ = self
                        .shared
                        .events
                        .send(BackendEvent::HandleClosed { handle_id });
                }
            }
            "timeout" => {
                self.lose(self.generation(), "backend session timed out");
            }
            "webrtcup" | "media" | "slowlink" => {
                trace!(janus = %frame.janus, sender = frame.sender, "media notification");
            }
            other => {
                debug!(janus = %other, "unhandled backend event");
            }
        }
    }

    /// Tear the connection down and, if it had been fully established,
    /// emit a disconnect event. Safe to call from racing tasks: only the
    /// matching generation wins.
    fn lose(&self, generation: u64, reason: &str) {
        if let Some(ConnectionState::Connected) = self.teardown(generation) {
            warn!(reason, "backend connection lost");
            let _ = self.shared.events.send(BackendEvent::Disconnected);
        }
    }

    /// Transition to DISCONNECTED, drop the transport, and drain every
    /// outstanding waiter. Returns the previous state, or `None` when a
    /// newer generation already owns the connection slot.
    fn teardown(&self, generation: u64) -> Option<ConnectionState> {
        if self
            .shared
            .generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        let previous = {
            let mut state = self.shared.state.lock();
            std::mem::replace(&mut *state, ConnectionState::Disconnected)
        };
        *self.shared.outbound.lock() = None;
        self.shared.session_id.store(0, Ordering::SeqCst);
        // Dropping the senders fails every in-flight request with a
        // "backend connection lost" error on the requester side.
        let drained = {
            let mut waiters = self.shared.waiters.lock();
            waiters.drain().count()
        };
        if drained > 0 {
            debug!(drained, "drained outstanding backend requests");
        }
        Some(previous)
    }
}

/// Reply to a configure exchange.
#[derive(Debug, Clone)]
pub struct ConfigureReply {
    pub sdp: String,
    pub publisher_id: Option<u64>,
}

/// A plugin handle bound to the backend session.
#[derive(Clone)]
pub struct PluginHandle {
    client: JanusClient,
    id: u64,
}

impl PluginHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Submit an offer and wait for the answer. Join parameters are
    /// present on the initial publish and absent on ICE restarts.
    pub async fn configure(
        &self,
        offer: &str,
        join: Option<PublishRequest>,
    ) -> Result<ConfigureReply> {
        let body = match join {
            Some(join) => serde_json::to_value(join),
            None => serde_json::to_value(ConfigureRequest::restart()),
        }
        .map_err(|e| Error::Backend(format!("body encode failed: {}", e)))?;

        let mut frame = self.client.session_frame("message")?;
        frame.handle_id = Some(self.id);
        frame.body = Some(body);
        frame.jsep = Some(Jsep::offer(offer));

        let reply = self.client.request(frame).await?;
        let sdp = reply
            .answer_sdp()
            .ok_or_else(|| Error::Backend("backend reply carried no SDP answer".into()))?
            .to_string();
        Ok(ConfigureReply {
            sdp,
            publisher_id: reply.publisher_id(),
        })
    }

    /// Ship candidates to the backend. Fire-and-forget: only transport
    /// failures surface.
    pub fn trickle(&self, candidates: &[TrickleCandidate]) -> Result<()> {
        if candidates.is_empty() {
            return Ok(());
        }
        let mut frame = self.client.session_frame("trickle")?;
        frame.handle_id = Some(self.id);
        if candidates.len() == 1 {
            frame.candidate = Some(candidates[0].clone());
        } else {
            frame.candidates = Some(candidates.to_vec());
        }
        self.client.send(&frame)
    }

    /// Configure a plain-RTP fan-out of this publisher.
    pub async fn start_forward(&self, request: ForwardRequest) -> Result<()> {
        let mut frame = self.client.session_frame("message")?;
        frame.handle_id = Some(self.id);
        frame.body = Some(
            serde_json::to_value(request)
                .map_err(|e| Error::Backend(format!("body encode failed: {}", e)))?,
        );
        self.client.request(frame).await?;
        Ok(())
    }

    /// Tear the handle down. Never raises: a handle that is already gone,
    /// or a backend that is, counts as detached.
    pub async fn detach(&self) {
        let Ok(mut frame) = self.client.session_frame("detach") else {
            return;
        };
        frame.handle_id = Some(self.id);
        if let Err(e) = self.client.request(frame).await {
            debug!(handle_id = self.id, "detach failed: {}", e);
        }
    }
}

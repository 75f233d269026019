//! Endpoint descriptors and per-endpoint ingest state.
//!
//! Endpoints survive publish cycles; the session inside one does not. All
//! cross-references between endpoints, sessions, and backend handles are
//! plain identifiers, the registry owns the maps.

use crate::config::{IceServer, Recipient};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Caller-supplied token predicate.
pub type TokenValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Authorization credential attached to an endpoint: either a literal
/// string compared verbatim, or a predicate invoked with the presented
/// token.
#[derive(Clone)]
pub enum Token {
    Static(String),
    Predicate(TokenValidator),
}

impl Token {
    /// Wrap a predicate function.
    pub fn predicate<F>(validator: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Token::Predicate(Arc::new(validator))
    }

    /// Whether the presented token is acceptable.
    pub fn accepts(&self, presented: &str) -> bool {
        match self {
            Token::Static(expected) => expected == presented,
            Token::Predicate(validator) => validator(presented),
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Static(_) => f.write_str("Token::Static(..)"),
            Token::Predicate(_) => f.write_str("Token::Predicate(..)"),
        }
    }
}

/// Observable ingest phase of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestPhase {
    Idle,
    Negotiating,
    Active,
}

impl IngestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestPhase::Idle => "idle",
            IngestPhase::Negotiating => "negotiating",
            IngestPhase::Active => "active",
        }
    }
}

/// State of a live publish session. Present exactly when the endpoint is
/// not idle and fully populated once it is active.
#[derive(Debug, Clone)]
pub struct IngestSession {
    pub handle_id: u64,
    pub publisher_id: u64,
    pub sdp_offer: String,
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub resource_id: String,
    pub etag: String,
}

enum StateCell {
    Idle,
    Negotiating,
    Active(IngestSession),
}

/// Everything needed to create an endpoint.
#[derive(Debug, Default)]
pub struct EndpointDescriptor {
    pub id: String,
    pub room: u64,
    pub label: Option<String>,
    pub pin: Option<String>,
    pub secret: Option<String>,
    pub admin_key: Option<String>,
    pub token: Option<Token>,
    pub ice_servers: Option<Vec<IceServer>>,
    pub recipient: Option<Recipient>,
}

/// A named entry point publishers POST to.
pub struct Endpoint {
    pub id: String,
    pub room: u64,
    pub label: String,
    pub pin: Option<String>,
    pub secret: Option<String>,
    pub admin_key: Option<String>,
    pub token: Option<Token>,
    pub ice_servers: Option<Vec<IceServer>>,
    pub recipient: Option<Recipient>,
    pub created_at: DateTime<Utc>,
    state: Mutex<StateCell>,
    ops: tokio::sync::Mutex<()>,
}

impl Endpoint {
    pub fn new(descriptor: EndpointDescriptor) -> Self {
        let label = descriptor
            .label
            .unwrap_or_else(|| format!("WHIP Publisher {}", descriptor.room));
        Self {
            id: descriptor.id,
            room: descriptor.room,
            label,
            pin: descriptor.pin,
            secret: descriptor.secret,
            admin_key: descriptor.admin_key,
            token: descriptor.token,
            ice_servers: descriptor.ice_servers,
            recipient: descriptor.recipient,
            created_at: Utc::now(),
            state: Mutex::new(StateCell::Idle),
            ops: tokio::sync::Mutex::new(()),
        }
    }

    /// Per-endpoint operation lock. Publish, trickle, restart, and teardown
    /// all hold this across their suspension points, which gives the
    /// total per-endpoint ordering the state machine relies on.
    pub fn ops(&self) -> &tokio::sync::Mutex<()> {
        &self.ops
    }

    pub fn phase(&self) -> IngestPhase {
        match *self.state.lock() {
            StateCell::Idle => IngestPhase::Idle,
            StateCell::Negotiating => IngestPhase::Negotiating,
            StateCell::Active(_) => IngestPhase::Active,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.phase() == IngestPhase::Idle
    }

    /// IDLE -> NEGOTIATING. Any other starting phase means a publisher is
    /// already attached (or attaching).
    pub fn begin_negotiation(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            StateCell::Idle => {
                *state = StateCell::Negotiating;
                Ok(())
            }
            _ => Err(Error::InUse(self.id.clone())),
        }
    }

    /// NEGOTIATING -> ACTIVE with the freshly negotiated session.
    pub fn commit_active(&self, session: IngestSession) {
        *self.state.lock() = StateCell::Active(session);
    }

    /// Any phase -> IDLE. Returns the active session, if one existed, so
    /// the caller can release its resources.
    pub fn clear_session(&self) -> Option<IngestSession> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, StateCell::Idle) {
            StateCell::Active(session) => Some(session),
            _ => None,
        }
    }

    /// Snapshot of the active session.
    pub fn session(&self) -> Option<IngestSession> {
        match &*self.state.lock() {
            StateCell::Active(session) => Some(session.clone()),
            _ => None,
        }
    }

    /// Mutate the active session in place (restart bookkeeping).
    pub fn update_session(&self, update: impl FnOnce(&mut IngestSession)) {
        if let StateCell::Active(session) = &mut *self.state.lock() {
            update(session);
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("room", &self.room)
            .field("label", &self.label)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new(EndpointDescriptor {
            id: "abc".into(),
            room: 1234,
            ..EndpointDescriptor::default()
        })
    }

    fn session(resource_id: &str) -> IngestSession {
        IngestSession {
            handle_id: 7,
            publisher_id: 99,
            sdp_offer: "v=0\r\n".into(),
            ice_ufrag: "U1".into(),
            ice_pwd: "P1".into(),
            resource_id: resource_id.into(),
            etag: "E1".into(),
        }
    }

    #[test]
    fn test_default_label() {
        let endpoint = endpoint();
        assert_eq!(endpoint.label, "WHIP Publisher 1234");
    }

    #[test]
    fn test_idle_iff_no_session() {
        let endpoint = endpoint();
        assert!(endpoint.is_idle());
        assert!(endpoint.session().is_none());

        endpoint.begin_negotiation().unwrap();
        assert_eq!(endpoint.phase(), IngestPhase::Negotiating);
        assert!(endpoint.session().is_none());

        endpoint.commit_active(session("r1"));
        assert_eq!(endpoint.phase(), IngestPhase::Active);
        assert!(endpoint.session().is_some());

        let cleared = endpoint.clear_session().unwrap();
        assert_eq!(cleared.resource_id, "r1");
        assert!(endpoint.is_idle());
        assert!(endpoint.session().is_none());
    }

    #[test]
    fn test_second_negotiation_rejected() {
        let endpoint = endpoint();
        endpoint.begin_negotiation().unwrap();
        assert!(matches!(endpoint.begin_negotiation(), Err(Error::InUse(_))));

        endpoint.commit_active(session("r1"));
        assert!(matches!(endpoint.begin_negotiation(), Err(Error::InUse(_))));
    }

    #[test]
    fn test_clear_from_negotiating_returns_nothing() {
        let endpoint = endpoint();
        endpoint.begin_negotiation().unwrap();
        assert!(endpoint.clear_session().is_none());
        assert!(endpoint.is_idle());
    }

    #[test]
    fn test_update_session() {
        let endpoint = endpoint();
        endpoint.begin_negotiation().unwrap();
        endpoint.commit_active(session("r1"));
        endpoint.update_session(|s| s.etag = "E2".into());
        assert_eq!(endpoint.session().unwrap().etag, "E2");
    }

    #[test]
    fn test_token_static() {
        let token = Token::Static("secret".into());
        assert!(token.accepts("secret"));
        assert!(!token.accepts("other"));
    }

    #[test]
    fn test_token_predicate() {
        let token = Token::predicate(|t| t.starts_with("ok"));
        assert!(token.accepts("ok-123"));
        assert!(!token.accepts("nope"));
    }
}

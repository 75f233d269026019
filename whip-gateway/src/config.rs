//! Gateway configuration.
//!
//! Configuration comes from an optional TOML file plus command-line
//! overrides. Every section has usable defaults so the gateway starts with
//! no file at all (local Janus, `/whip` base path).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP surface configuration.
    pub http: HttpConfig,

    /// Media backend (Janus) configuration.
    pub backend: BackendConfig,

    /// Accept PATCH trickle/restart requests.
    pub allow_trickle: bool,

    /// Enforce If-Match preconditions on PATCH.
    pub strict_etags: bool,

    /// ICE servers advertised to clients via Link headers.
    pub ice_servers: Vec<IceServer>,

    /// Endpoints created at startup.
    pub endpoints: Vec<StaticEndpoint>,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind address.
    pub address: String,

    /// Path prefix for every route.
    pub base_path: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:7080".to_string(),
            base_path: "/whip".to_string(),
        }
    }
}

/// Media backend connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Janus WebSocket API URL.
    pub url: String,

    /// API secret attached to every request, if the backend requires one.
    pub api_secret: Option<String>,

    /// Seconds between keep-alives while connected.
    pub keepalive_interval_secs: u64,

    /// Seconds a request waits for its terminal response.
    pub request_timeout_secs: u64,

    /// Reconnection policy after a lost connection.
    pub reconnect: ReconnectConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8188".to_string(),
            api_secret: None,
            keepalive_interval_secs: 15,
            request_timeout_secs: 30,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl BackendConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Backoff policy for reconnecting to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectStrategy {
    /// Constant delay between attempts.
    Fixed,
    /// Delay doubles after each failed attempt, capped at `max_delay_ms`.
    Exponential,
}

/// Reconnection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub strategy: ReconnectStrategy,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            strategy: ReconnectStrategy::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Delay to use after `delay` failed, per the configured strategy.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        match self.strategy {
            ReconnectStrategy::Fixed => self.initial_delay(),
            ReconnectStrategy::Exponential => {
                (delay * 2).min(Duration::from_millis(self.max_delay_ms))
            }
        }
    }
}

/// A STUN/TURN server advertised to publishers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Only stun/turn/turns URIs may be advertised.
    pub fn has_valid_scheme(&self) -> bool {
        self.uri.starts_with("stun:")
            || self.uri.starts_with("turn:")
            || self.uri.starts_with("turns:")
    }
}

/// Plain-RTP forwarding target declared on an endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Recipient {
    pub host: String,
    pub audio_port: u16,
    pub video_port: u16,
    pub video_rtcp_port: u16,
}

impl Recipient {
    /// Whether there is anything to forward to.
    pub fn has_targets(&self) -> bool {
        !self.host.is_empty() && (self.audio_port > 0 || self.video_port > 0)
    }
}

/// An endpoint declared in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticEndpoint {
    pub id: String,
    pub room: u64,
    pub label: Option<String>,
    pub pin: Option<String>,
    pub secret: Option<String>,
    pub admin_key: Option<String>,
    pub token: Option<String>,
    pub ice_servers: Option<Vec<IceServer>>,
    pub recipient: Option<Recipient>,
}

impl GatewayConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: GatewayConfig = toml::from_str(&content)
            .map_err(|e| Error::InvalidArgument(format!("config parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.http.address.is_empty() {
            return Err(Error::InvalidArgument("http.address is empty".into()));
        }
        if !self.http.base_path.starts_with('/') {
            return Err(Error::InvalidArgument(
                "http.base_path must start with '/'".into(),
            ));
        }
        if !self.backend.url.starts_with("ws://") && !self.backend.url.starts_with("wss://") {
            return Err(Error::InvalidArgument(
                "backend.url must be a ws:// or wss:// URL".into(),
            ));
        }
        if self.backend.keepalive_interval_secs == 0 {
            return Err(Error::InvalidArgument(
                "backend.keepalive_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            backend: BackendConfig::default(),
            allow_trickle: true,
            strict_etags: false,
            ice_servers: Vec::new(),
            endpoints: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.http.address, "0.0.0.0:7080");
        assert_eq!(config.http.base_path, "/whip");
        assert_eq!(config.backend.url, "ws://127.0.0.1:8188");
        assert_eq!(config.backend.keepalive_interval_secs, 15);
        assert!(config.allow_trickle);
        assert!(!config.strict_etags);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let text = r#"
            allow_trickle = false
            strict_etags = true

            [http]
            address = "127.0.0.1:9000"
            base_path = "/ingest"

            [backend]
            url = "wss://janus.example.net:8989"
            api_secret = "s3cret"

            [backend.reconnect]
            strategy = "fixed"
            initial_delay_ms = 500

            [[ice_servers]]
            uri = "stun:stun.example.net:3478"

            [[endpoints]]
            id = "abc"
            room = 1234
            token = "verysecret"
        "#;
        let config: GatewayConfig = toml::from_str(text).unwrap();
        assert!(!config.allow_trickle);
        assert!(config.strict_etags);
        assert_eq!(config.http.base_path, "/ingest");
        assert_eq!(config.backend.api_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.backend.reconnect.strategy, ReconnectStrategy::Fixed);
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].room, 1234);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = GatewayConfig::default();
        config.http.base_path = "whip".into();
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.backend.url = "http://127.0.0.1:8188".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_delays() {
        let reconnect = ReconnectConfig::default();
        let d1 = reconnect.initial_delay();
        let d2 = reconnect.next_delay(d1);
        assert_eq!(d2, d1 * 2);
        let capped = reconnect.next_delay(Duration::from_millis(25_000));
        assert_eq!(capped, Duration::from_millis(30_000));

        let fixed = ReconnectConfig {
            strategy: ReconnectStrategy::Fixed,
            ..ReconnectConfig::default()
        };
        assert_eq!(fixed.next_delay(Duration::from_secs(9)), fixed.initial_delay());
    }

    #[test]
    fn test_ice_server_scheme() {
        let ok = IceServer {
            uri: "turns:turn.example.net:5349".into(),
            username: None,
            credential: None,
        };
        assert!(ok.has_valid_scheme());
        let bad = IceServer {
            uri: "https://example.net".into(),
            username: None,
            credential: None,
        };
        assert!(!bad.has_valid_scheme());
    }

    #[test]
    fn test_recipient_targets() {
        let mut recipient = Recipient::default();
        assert!(!recipient.has_targets());
        recipient.host = "10.0.0.1".into();
        recipient.video_port = 5004;
        assert!(recipient.has_targets());
    }
}

//! Wire types for the media backend's WebSocket API.
//!
//! The backend speaks Janus-style JSON frames: every request carries a
//! `janus` verb and a `transaction` nonce, responses echo the transaction,
//! and unsolicited events (hangups, detaches, timeouts) arrive on the same
//! stream without one.

use crate::sdp::TrickleCandidate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Plugin the gateway attaches publish handles to.
pub const VIDEOROOM_PLUGIN: &str = "janus.plugin.videoroom";

/// An SDP payload attached to a request or event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl Jsep {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// Outbound request frame.
#[derive(Debug, Clone, Serialize)]
pub struct ClientFrame {
    pub janus: &'static str,
    pub transaction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apisecret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsep: Option<Jsep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<TrickleCandidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<TrickleCandidate>>,
}

impl ClientFrame {
    pub fn new(janus: &'static str, transaction: String) -> Self {
        Self {
            janus,
            transaction,
            session_id: None,
            handle_id: None,
            plugin: None,
            apisecret: None,
            body: None,
            jsep: None,
            candidate: None,
            candidates: None,
        }
    }
}

/// Numeric id payload of `success` responses.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameData {
    pub id: u64,
}

/// Error payload of `error` responses.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameError {
    pub code: i64,
    pub reason: String,
}

/// Plugin payload of `event` responses.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginData {
    pub plugin: String,
    pub data: Value,
}

/// Inbound frame: a response to one of our transactions or an unsolicited
/// event.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerFrame {
    pub janus: String,
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub session_id: Option<u64>,
    #[serde(default)]
    pub sender: Option<u64>,
    #[serde(default)]
    pub data: Option<FrameData>,
    #[serde(default)]
    pub error: Option<FrameError>,
    #[serde(default)]
    pub plugindata: Option<PluginData>,
    #[serde(default)]
    pub jsep: Option<Jsep>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ServerFrame {
    /// Intermediate acknowledgement; the terminal frame follows later.
    pub fn is_ack(&self) -> bool {
        self.janus == "ack"
    }

    /// Error text carried either at the top level or inside the plugin
    /// payload, if this frame reports a failure.
    pub fn error_text(&self) -> Option<String> {
        if self.janus == "error" {
            return Some(match &self.error {
                Some(error) => format!("{} (code {})", error.reason, error.code),
                None => "unspecified backend error".to_string(),
            });
        }
        let data = &self.plugindata.as_ref()?.data;
        let reason = data.get("error").and_then(Value::as_str)?;
        let code = data.get("error_code").and_then(Value::as_i64).unwrap_or(0);
        Some(format!("{} (code {})", reason, code))
    }

    /// SDP answer attached to this frame.
    pub fn answer_sdp(&self) -> Option<&str> {
        self.jsep
            .as_ref()
            .filter(|jsep| jsep.kind == "answer")
            .map(|jsep| jsep.sdp.as_str())
    }

    /// Publisher id assigned by the plugin on join.
    pub fn publisher_id(&self) -> Option<u64> {
        self.plugindata.as_ref()?.data.get("id").and_then(Value::as_u64)
    }

    /// Id minted by `create` and `attach` responses.
    pub fn new_id(&self) -> Option<u64> {
        self.data.as_ref().map(|data| data.id)
    }
}

/// Plugin body for joining a room and publishing in one round trip.
#[derive(Debug, Clone, Serialize)]
pub struct PublishRequest {
    pub request: &'static str,
    pub room: u64,
    pub ptype: &'static str,
    pub display: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin: Option<String>,
    pub audio: bool,
    pub video: bool,
}

impl PublishRequest {
    pub fn new(room: u64, display: impl Into<String>, pin: Option<String>) -> Self {
        Self {
            request: "joinandconfigure",
            room,
            ptype: "publisher",
            display: display.into(),
            pin,
            audio: true,
            video: true,
        }
    }
}

/// Plugin body for renegotiating an established publisher (ICE restart).
#[derive(Debug, Clone, Serialize)]
pub struct ConfigureRequest {
    pub request: &'static str,
    pub audio: bool,
    pub video: bool,
}

impl ConfigureRequest {
    pub fn restart() -> Self {
        Self {
            request: "configure",
            audio: true,
            video: true,
        }
    }
}

/// Plugin body for setting up a plain-RTP fan-out of a publisher.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardRequest {
    pub request: &'static str,
    pub room: u64,
    pub publisher_id: u64,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_ssrc: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_ssrc: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_rtcp_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_key: Option<String>,
}

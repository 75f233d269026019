//! SDP fragment utilities.
//!
//! The gateway never parses SDP semantically; it only needs a handful of
//! named attributes from offers and RFC 8840 trickle fragments. Everything
//! here is line-oriented and tolerates both `\r\n` and `\n` endings.

use serde::Serialize;

/// One parsed entry of a trickle fragment, in the wire form the backend
/// expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TrickleCandidate {
    /// A single `a=candidate:` line.
    Candidate {
        #[serde(rename = "sdpMLineIndex")]
        sdp_m_line_index: u32,
        candidate: String,
    },
    /// The `a=end-of-candidates` sentinel.
    Completed { completed: bool },
}

impl TrickleCandidate {
    pub fn completed() -> Self {
        TrickleCandidate::Completed { completed: true }
    }
}

/// The interesting parts of an `application/trickle-ice-sdpfrag` body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fragment {
    pub ice_ufrag: Option<String>,
    pub ice_pwd: Option<String>,
    pub candidates: Vec<TrickleCandidate>,
}

impl Fragment {
    /// True when the fragment carries both credentials.
    pub fn has_credentials(&self) -> bool {
        self.ice_ufrag.is_some() && self.ice_pwd.is_some()
    }
}

fn lines(sdp: &str) -> impl Iterator<Item = &str> {
    sdp.split('\n').map(|line| line.trim_end_matches('\r'))
}

/// Minimal sanity check for a publish body: an SDP must open a session
/// description (`v=0`).
pub fn is_sdp(body: &str) -> bool {
    lines(body).any(|line| line == "v=0")
}

/// First value of `a=<name>:<value>` in the given SDP, if present.
pub fn media_attribute(sdp: &str, name: &str) -> Option<String> {
    let prefix = format!("a={}:", name);
    lines(sdp)
        .find_map(|line| line.strip_prefix(prefix.as_str()))
        .map(|value| value.to_string())
}

/// Parse a trickle fragment: ICE credentials, candidate lines in order,
/// and the end-of-candidates sentinel.
pub fn parse_fragment(body: &str) -> Fragment {
    let mut fragment = Fragment::default();
    for line in lines(body) {
        if let Some(value) = line.strip_prefix("a=ice-ufrag:") {
            fragment.ice_ufrag = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("a=ice-pwd:") {
            fragment.ice_pwd = Some(value.to_string());
        } else if let Some(rest) = line.strip_prefix("a=candidate:") {
            fragment.candidates.push(TrickleCandidate::Candidate {
                sdp_m_line_index: 0,
                candidate: format!("candidate:{}", rest),
            });
        } else if line == "a=end-of-candidates" {
            fragment.candidates.push(TrickleCandidate::completed());
        }
    }
    fragment
}

/// Rewrite every occurrence of the old ICE credentials in `sdp` to the new
/// ones. Used to turn the stored offer into an ICE-restart offer.
pub fn rewrite_ice_credentials(
    sdp: &str,
    old_ufrag: &str,
    old_pwd: &str,
    new_ufrag: &str,
    new_pwd: &str,
) -> String {
    sdp.replace(
        &format!("a=ice-ufrag:{}", old_ufrag),
        &format!("a=ice-ufrag:{}", new_ufrag),
    )
    .replace(
        &format!("a=ice-pwd:{}", old_pwd),
        &format!("a=ice-pwd:{}", new_pwd),
    )
}

/// Project a full SDP answer down to the trickle fragment returned from a
/// successful ICE restart: at most the first two `m=` sections, keeping
/// only the ICE- and grouping-relevant lines.
pub fn restart_fragment(answer: &str) -> String {
    const KEPT_PREFIXES: [&str; 6] = [
        "a=ice-",
        "a=group:BUNDLE",
        "m=",
        "a=mid:",
        "a=candidate:",
        "a=end-of-candidates",
    ];

    let mut media_sections = 0;
    let mut kept = Vec::new();
    for line in lines(answer) {
        if line.starts_with("m=") {
            media_sections += 1;
            if media_sections > 2 {
                break;
            }
        }
        if KEPT_PREFIXES.iter().any(|prefix| line.starts_with(prefix)) {
            kept.push(line);
        }
    }

    let mut fragment = kept.join("\r\n");
    if !fragment.is_empty() {
        fragment.push_str("\r\n");
    }
    fragment
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=ice-ufrag:U1\r\na=ice-pwd:P1\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:1\r\na=ice-ufrag:U1\r\na=ice-pwd:P1\r\n";

    #[test]
    fn test_is_sdp() {
        assert!(is_sdp(OFFER));
        assert!(is_sdp("v=0\nm=audio 9 RTP/AVP 0\n"));
        assert!(!is_sdp("hello"));
        assert!(!is_sdp("av=0\n"));
    }

    #[test]
    fn test_media_attribute() {
        assert_eq!(media_attribute(OFFER, "ice-ufrag").as_deref(), Some("U1"));
        assert_eq!(media_attribute(OFFER, "ice-pwd").as_deref(), Some("P1"));
        assert_eq!(media_attribute(OFFER, "fingerprint"), None);
    }

    #[test]
    fn test_media_attribute_unix_endings() {
        let sdp = "v=0\na=ice-ufrag:abcd\na=ice-pwd:efgh\n";
        assert_eq!(media_attribute(sdp, "ice-ufrag").as_deref(), Some("abcd"));
        assert_eq!(media_attribute(sdp, "ice-pwd").as_deref(), Some("efgh"));
    }

    #[test]
    fn test_parse_fragment() {
        let body = "a=ice-ufrag:U2\r\na=ice-pwd:P2\r\n\
            a=candidate:1 1 udp 2122260223 192.168.1.5 49203 typ host\r\n\
            a=end-of-candidates\r\n";
        let fragment = parse_fragment(body);
        assert_eq!(fragment.ice_ufrag.as_deref(), Some("U2"));
        assert_eq!(fragment.ice_pwd.as_deref(), Some("P2"));
        assert_eq!(fragment.candidates.len(), 2);
        assert_eq!(
            fragment.candidates[0],
            TrickleCandidate::Candidate {
                sdp_m_line_index: 0,
                candidate: "candidate:1 1 udp 2122260223 192.168.1.5 49203 typ host".into(),
            }
        );
        assert_eq!(fragment.candidates[1], TrickleCandidate::completed());
        assert!(fragment.has_credentials());
    }

    #[test]
    fn test_parse_fragment_candidates_only() {
        let body = "a=candidate:2 1 tcp 1 10.0.0.1 9 typ host tcptype active\n";
        let fragment = parse_fragment(body);
        assert!(!fragment.has_credentials());
        assert_eq!(fragment.candidates.len(), 1);
    }

    #[test]
    fn test_candidate_wire_form() {
        let candidate = TrickleCandidate::Candidate {
            sdp_m_line_index: 0,
            candidate: "candidate:1 1 udp 1 1.2.3.4 1 typ host".into(),
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMLineIndex"], 0);
        assert_eq!(json["candidate"], "candidate:1 1 udp 1 1.2.3.4 1 typ host");

        let json = serde_json::to_value(TrickleCandidate::completed()).unwrap();
        assert_eq!(json["completed"], true);
    }

    #[test]
    fn test_rewrite_ice_credentials() {
        let rewritten = rewrite_ice_credentials(OFFER, "U1", "P1", "U2", "P2");
        assert!(!rewritten.contains("a=ice-ufrag:U1"));
        assert!(!rewritten.contains("a=ice-pwd:P1"));
        assert_eq!(rewritten.matches("a=ice-ufrag:U2").count(), 2);
        assert_eq!(rewritten.matches("a=ice-pwd:P2").count(), 2);
        // Everything else is untouched.
        assert!(rewritten.contains("m=video 9 UDP/TLS/RTP/SAVPF 96"));
    }

    #[test]
    fn test_restart_fragment_truncates_and_projects() {
        let answer = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\n\
            a=group:BUNDLE 0 1 2\r\n\
            m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=ice-ufrag:S1\r\na=ice-pwd:SP1\r\n\
            a=rtpmap:111 opus/48000/2\r\n\
            a=candidate:1 1 udp 1 5.6.7.8 40000 typ host\r\na=end-of-candidates\r\n\
            m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:1\r\na=ice-ufrag:S1\r\na=ice-pwd:SP1\r\n\
            m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:2\r\n";
        let fragment = restart_fragment(answer);
        assert!(fragment.contains("a=group:BUNDLE 0 1 2"));
        assert!(fragment.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111"));
        assert!(fragment.contains("a=ice-ufrag:S1"));
        assert!(fragment.contains("a=candidate:1 1 udp 1 5.6.7.8 40000 typ host"));
        assert!(fragment.contains("a=end-of-candidates"));
        assert!(fragment.contains("m=video"));
        // Third section and non-ICE attributes are dropped.
        assert!(!fragment.contains("m=application"));
        assert!(!fragment.contains("a=mid:2"));
        assert!(!fragment.contains("a=rtpmap"));
        assert!(fragment.ends_with("\r\n"));
    }

    #[test]
    fn test_restart_fragment_empty_answer() {
        assert_eq!(restart_fragment(""), "");
    }
}

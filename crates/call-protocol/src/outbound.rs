//! Outbound `/call` response envelope.
//!
//! The outbound envelope is a genuine sum type over `state`, not an
//! optional-field struct: each variant serializes only the keys that apply
//! to it, so `result`, `error`, `location`, and `stream` never appear
//! alongside one another on the wire. It's tagged internally on `state`,
//! the same way `abp_protocol::Envelope` tags itself on `t`.

use call_error::CallError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A `uri` pointer, used both for the media-redirect `location` on a
/// synchronous completion and the polling `location` on an accepted async
/// operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// The resource URI, e.g. `/ops/<requestId>`.
    pub uri: String,
}

/// Handshake details for a `streaming` upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    /// Transport name, e.g. `"sse"` or `"websocket"`.
    pub transport: String,
    /// URI the client connects to for the stream itself.
    pub location: String,
    /// Session identifier correlating the stream to this request.
    pub session_id: Uuid,
    /// Payload encoding used on the stream, e.g. `"json-lines"`.
    pub encoding: String,
}

/// The payload of a `state: "complete"` response: either an operation
/// result, or a media redirect (HTTP 303 with a `Location` header).
/// Untagged so it flattens into whichever single key applies — `result` or
/// `location` — onto the enclosing envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CompleteOutcome {
    /// A plain JSON result.
    Result {
        /// The operation's result value.
        result: serde_json::Value,
    },
    /// A redirect to an external object whose URI is already known.
    Location {
        /// The redirect target.
        location: Location,
    },
}

/// The `/call` response: a tagged union over `state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OutboundEnvelope {
    /// The operation ran to completion (handler success or domain error is
    /// `Error`; this variant is specifically the success/result path).
    Complete {
        /// Echoed or freshly minted request id.
        #[serde(rename = "requestId")]
        request_id: Uuid,
        /// Echoed session id, if the client supplied one.
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// The success outcome.
        #[serde(flatten)]
        outcome: CompleteOutcome,
    },
    /// The operation ran to completion but produced a domain error. This is
    /// a protocol success (HTTP 200) — the handler, not the transport, failed.
    Error {
        /// Echoed or freshly minted request id.
        #[serde(rename = "requestId")]
        request_id: Uuid,
        /// Echoed session id, if the client supplied one.
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// The structured error.
        error: CallError,
    },
    /// An async operation was accepted for later retrieval.
    Accepted {
        /// Echoed or freshly minted request id.
        #[serde(rename = "requestId")]
        request_id: Uuid,
        /// Echoed session id, if the client supplied one.
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Where to poll for status.
        location: Location,
        /// Suggested minimum delay before the first poll.
        #[serde(rename = "retryAfterMs")]
        retry_after_ms: u64,
    },
    /// A streaming session was opened.
    Streaming {
        /// Echoed or freshly minted request id.
        #[serde(rename = "requestId")]
        request_id: Uuid,
        /// Echoed session id, if the client supplied one.
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Stream handshake details.
        stream: StreamInfo,
    },
}

impl OutboundEnvelope {
    /// Build a `state: "complete"` envelope carrying a result.
    pub fn complete(request_id: Uuid, session_id: Option<String>, result: serde_json::Value) -> Self {
        Self::Complete {
            request_id,
            session_id,
            outcome: CompleteOutcome::Result { result },
        }
    }

    /// Build a `state: "complete"` envelope carrying a media redirect.
    pub fn complete_location(request_id: Uuid, session_id: Option<String>, uri: impl Into<String>) -> Self {
        Self::Complete {
            request_id,
            session_id,
            outcome: CompleteOutcome::Location {
                location: Location { uri: uri.into() },
            },
        }
    }

    /// Build a `state: "error"` envelope.
    pub fn error(request_id: Uuid, session_id: Option<String>, error: CallError) -> Self {
        Self::Error {
            request_id,
            session_id,
            error,
        }
    }

    /// Build a `state: "accepted"` envelope.
    pub fn accepted(request_id: Uuid, session_id: Option<String>, uri: impl Into<String>, retry_after_ms: u64) -> Self {
        Self::Accepted {
            request_id,
            session_id,
            location: Location { uri: uri.into() },
            retry_after_ms,
        }
    }

    /// Build a `state: "streaming"` envelope.
    pub fn streaming(request_id: Uuid, session_id: Option<String>, stream: StreamInfo) -> Self {
        Self::Streaming {
            request_id,
            session_id,
            stream,
        }
    }

    /// The `state` tag as it appears on the wire.
    pub fn state(&self) -> &'static str {
        match self {
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::Accepted { .. } => "accepted",
            Self::Streaming { .. } => "streaming",
        }
    }

    /// The envelope's `requestId`.
    pub fn request_id(&self) -> Uuid {
        match self {
            Self::Complete { request_id, .. }
            | Self::Error { request_id, .. }
            | Self::Accepted { request_id, .. }
            | Self::Streaming { request_id, .. } => *request_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use call_error::ErrorCode;

    #[test]
    fn complete_envelope_has_exactly_result_and_state() {
        let env = OutboundEnvelope::complete(Uuid::nil(), None, serde_json::json!({"n": 1}));
        let v = serde_json::to_value(&env).unwrap();
        let obj = v.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        assert_eq!(obj["state"], "complete");
        assert!(obj.contains_key("result"));
        assert!(!obj.contains_key("error"));
        assert!(!obj.contains_key("location"));
    }

    #[test]
    fn complete_location_envelope_omits_result() {
        let env = OutboundEnvelope::complete_location(Uuid::nil(), None, "/media/42");
        let v = serde_json::to_value(&env).unwrap();
        let obj = v.as_object().unwrap();
        assert!(obj.contains_key("location"));
        assert!(!obj.contains_key("result"));
    }

    #[test]
    fn session_id_omitted_when_absent() {
        let env = OutboundEnvelope::complete(Uuid::nil(), None, serde_json::json!({}));
        let v = serde_json::to_value(&env).unwrap();
        assert!(!v.as_object().unwrap().contains_key("sessionId"));
    }

    #[test]
    fn session_id_echoed_when_present() {
        let env = OutboundEnvelope::complete(Uuid::nil(), Some("s-1".into()), serde_json::json!({}));
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["sessionId"], "s-1");
    }

    #[test]
    fn error_envelope_round_trips() {
        let err = CallError::new(ErrorCode::AuthRequired, "nope");
        let env = OutboundEnvelope::error(Uuid::nil(), None, err.clone());
        let json = serde_json::to_string(&env).unwrap();
        let back: OutboundEnvelope = serde_json::from_str(&json).unwrap();
        match back {
            OutboundEnvelope::Error { error, .. } => assert_eq!(error, err),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn accepted_envelope_round_trips() {
        let env = OutboundEnvelope::accepted(Uuid::nil(), None, "/ops/abc", 750);
        let json = serde_json::to_string(&env).unwrap();
        let back: OutboundEnvelope = serde_json::from_str(&json).unwrap();
        match back {
            OutboundEnvelope::Accepted { location, retry_after_ms, .. } => {
                assert_eq!(location.uri, "/ops/abc");
                assert_eq!(retry_after_ms, 750);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn streaming_envelope_round_trips() {
        let stream = StreamInfo {
            transport: "sse".into(),
            location: "/streams/abc".into(),
            session_id: Uuid::nil(),
            encoding: "json-lines".into(),
        };
        let env = OutboundEnvelope::streaming(Uuid::nil(), None, stream.clone());
        let json = serde_json::to_string(&env).unwrap();
        let back: OutboundEnvelope = serde_json::from_str(&json).unwrap();
        match back {
            OutboundEnvelope::Streaming { stream: s, .. } => assert_eq!(s, stream),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_state_tag_is_rejected() {
        let err = serde_json::from_str::<OutboundEnvelope>(
            r#"{"requestId":"00000000-0000-0000-0000-000000000000","state":"bogus"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }
}

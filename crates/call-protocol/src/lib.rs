#![doc = include_str!("../README.md")]
//! call-protocol
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Request and response envelopes for `/call`.
//!
//! ```
//! use call_protocol::{InboundEnvelope, OutboundEnvelope, resolve_request_id};
//! use serde_json::json;
//!
//! let body = r#"{"op":"v1:catalog.list","args":{},"ctx":{"sessionId":"s-1"}}"#;
//! let envelope: InboundEnvelope = serde_json::from_str(body).unwrap();
//! assert_eq!(envelope.op, "v1:catalog.list");
//!
//! let request_id = resolve_request_id(envelope.ctx.as_ref().and_then(|c| c.request_id.as_deref()));
//! let response = OutboundEnvelope::complete(request_id, envelope.session_id(), json!({"items": []}));
//! let line = serde_json::to_string(&response).unwrap();
//! assert!(line.contains("\"state\":\"complete\""));
//! ```

mod inbound;
mod outbound;

pub use inbound::{Ctx, InboundEnvelope};
pub use outbound::{CompleteOutcome, Location, OutboundEnvelope, StreamInfo};

use uuid::Uuid;

/// Resolve the outbound `requestId`: echo `ctx.requestId` when it parses as
/// a UUID, otherwise mint a fresh v4 UUID. A supplied `requestId` that is
/// not a valid UUID is treated as absent per the protocol's tie-break rule.
pub fn resolve_request_id(ctx_request_id: Option<&str>) -> Uuid {
    ctx_request_id
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_request_id_echoes_valid_uuid() {
        let id = Uuid::new_v4();
        let resolved = resolve_request_id(Some(&id.to_string()));
        assert_eq!(resolved, id);
    }

    #[test]
    fn resolve_request_id_mints_fresh_uuid_for_garbage() {
        let resolved = resolve_request_id(Some("not-a-uuid"));
        assert_ne!(resolved, Uuid::nil());
    }

    #[test]
    fn resolve_request_id_mints_fresh_uuid_when_absent() {
        let a = resolve_request_id(None);
        let b = resolve_request_id(None);
        assert_ne!(a, b, "two mints should not collide");
    }
}

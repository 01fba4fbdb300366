//! Inbound `/call` request envelope.

use serde::{Deserialize, Serialize};

/// Optional request context echoed (in part) on the response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ctx {
    /// Client-supplied correlation id. Must be a UUID to be honored; any
    /// other shape is treated as absent and a fresh UUID is minted.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Opaque session identifier, echoed verbatim without validation.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Client-supplied key making a side-effecting call safely retryable.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// The `/call` request body: `{op, args?, ctx?}`.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    /// Operation identifier, e.g. `"v1:catalog.list"`. Not yet validated
    /// against the registry at this layer.
    pub op: String,
    /// Operation arguments. Defaults to an empty object when omitted.
    #[serde(default = "default_args")]
    pub args: serde_json::Value,
    /// Optional request context.
    #[serde(default)]
    pub ctx: Option<Ctx>,
}

fn default_args() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl InboundEnvelope {
    /// The caller-supplied `requestId`, if any.
    pub fn request_id(&self) -> Option<&str> {
        self.ctx.as_ref().and_then(|c| c.request_id.as_deref())
    }

    /// The caller-supplied `sessionId`, echoed verbatim.
    pub fn session_id(&self) -> Option<String> {
        self.ctx.as_ref().and_then(|c| c.session_id.clone())
    }

    /// The caller-supplied idempotency key, if any.
    pub fn idempotency_key(&self) -> Option<&str> {
        self.ctx.as_ref().and_then(|c| c.idempotency_key.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_default_to_empty_object_when_omitted() {
        let env: InboundEnvelope = serde_json::from_str(r#"{"op":"v1:catalog.list"}"#).unwrap();
        assert_eq!(env.args, serde_json::json!({}));
        assert!(env.ctx.is_none());
    }

    #[test]
    fn ctx_fields_are_all_optional() {
        let env: InboundEnvelope =
            serde_json::from_str(r#"{"op":"v1:catalog.list","args":{},"ctx":{}}"#).unwrap();
        assert_eq!(env.request_id(), None);
        assert_eq!(env.session_id(), None);
        assert_eq!(env.idempotency_key(), None);
    }

    #[test]
    fn ctx_round_trips_all_fields() {
        let body = r#"{"op":"v1:patron.checkout","args":{"itemId":"x"},
            "ctx":{"requestId":"r-1","sessionId":"s-1","idempotencyKey":"k-1"}}"#;
        let env: InboundEnvelope = serde_json::from_str(body).unwrap();
        assert_eq!(env.request_id(), Some("r-1"));
        assert_eq!(env.session_id(), Some("s-1".to_string()));
        assert_eq!(env.idempotency_key(), Some("k-1"));
    }

    #[test]
    fn rejects_non_object_body() {
        let err = serde_json::from_str::<InboundEnvelope>("[]").unwrap_err();
        assert!(err.is_data() || err.is_syntax());
    }
}

//! Operation handler contract.
//!
//! Every handler is a pure async function over `(args, principal)` that
//! returns one of four outcomes: a synchronous result, a structured domain
//! error, a media redirect, or a stream handshake seed. Which outcome is
//! valid for a given operation is governed by its descriptor's
//! `executionModel` — the dispatcher, not this crate, enforces that.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use call_core::Principal;
use call_error::CallError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub mod demo;

/// What a [`Handler`] produced.
pub enum HandlerOutcome {
    /// A synchronous or async-completion result payload.
    Result(Value),
    /// A structured domain failure — not a transport error.
    Error(CallError),
    /// A media redirect to an externally addressable resource.
    Redirect {
        /// The target URI.
        uri: String,
    },
    /// A streaming transport handshake seed.
    Stream(StreamSeed),
}

/// The handshake half of a streaming operation's response.
#[derive(Debug, Clone)]
pub struct StreamSeed {
    /// Transport identifier, e.g. `"sse"` or `"websocket"`.
    pub transport: String,
    /// Payload encoding, e.g. `"application/json"`.
    pub encoding: String,
}

/// A single operation's executable behavior.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Run the operation against validated arguments and an optional
    /// resolved principal (absent when the descriptor requires no scopes).
    async fn call(&self, args: Value, principal: Option<Principal>) -> HandlerOutcome;
}

/// Reference-counted handle to a registered handler.
pub type HandlerRef = Arc<dyn Handler>;

/// Process-wide map from operation id to its executable handler.
#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: HashMap<call_core::OperationId, HandlerRef>,
}

impl HandlerTable {
    /// Construct an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `op` (builder-style).
    #[must_use]
    pub fn with(mut self, op: call_core::OperationId, handler: HandlerRef) -> Self {
        self.handlers.insert(op, handler);
        self
    }

    /// Look up a handler by operation id.
    pub fn get(&self, op: &call_core::OperationId) -> Option<HandlerRef> {
        self.handlers.get(op).cloned()
    }
}

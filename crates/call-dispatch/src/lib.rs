//! The `/call` envelope dispatcher.
//!
//! [`Dispatcher::dispatch`] runs the full pipeline described by the
//! protocol: parse → lookup → deprecation gate → auth → idempotency replay
//! → validate → execute → shape response → record idempotency. It returns
//! a transport-agnostic [`DispatchResult`]; `call-daemon` is the only place
//! that knows about HTTP.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use call_auth::AuthStore;
use call_core::{ExecutionModel, OperationDescriptor};
use call_error::CallError;
use call_handlers::{HandlerOutcome, HandlerTable};
use call_protocol::{resolve_request_id, InboundEnvelope, OutboundEnvelope, StreamInfo};
use call_registry::Registry;
use call_store::InstanceStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The result of running one envelope through the dispatcher: an HTTP
/// status code paired with the envelope to serialize.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    /// The status code the HTTP surface should respond with.
    pub status: u16,
    /// The response envelope.
    pub envelope: OutboundEnvelope,
}

impl DispatchResult {
    fn new(status: u16, envelope: OutboundEnvelope) -> Self {
        Self { status, envelope }
    }
}

/// Per-`(op, idempotencyKey, subject)` replay cache, with per-key
/// serialization so concurrent side-effecting requests under the same key
/// never execute the handler twice.
#[derive(Default)]
struct IdempotencyTable {
    outcomes: RwLock<HashMap<String, DispatchResult>>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IdempotencyTable {
    fn compose_key(op: &str, idempotency_key: &str, subject: &str) -> String {
        format!("{op}\u{0}{idempotency_key}\u{0}{subject}")
    }

    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn get(&self, key: &str) -> Option<DispatchResult> {
        self.outcomes.read().await.get(key).cloned()
    }

    async fn put(&self, key: String, result: DispatchResult) {
        self.outcomes.write().await.insert(key, result);
    }
}

/// The assembled dispatcher: registry, auth store, async instance store,
/// and handler table, plus the idempotency replay cache.
pub struct Dispatcher {
    registry: Arc<Registry>,
    auth: Arc<AuthStore>,
    store: Arc<InstanceStore>,
    handlers: HandlerTable,
    idempotency: IdempotencyTable,
}

impl Dispatcher {
    /// Assemble a dispatcher from its composition-root dependencies.
    pub fn new(
        registry: Arc<Registry>,
        auth: Arc<AuthStore>,
        store: Arc<InstanceStore>,
        handlers: HandlerTable,
    ) -> Self {
        Self {
            registry,
            auth,
            store,
            handlers,
            idempotency: IdempotencyTable::default(),
        }
    }

    /// Run `envelope` through the full dispatch pipeline.
    ///
    /// `auth_header` is the raw `Authorization` header value, if any.
    /// `now` is unix seconds, used for deprecation and auth-expiry checks.
    pub async fn dispatch(&self, envelope: InboundEnvelope, auth_header: Option<&str>, now: i64) -> DispatchResult {
        let request_id = resolve_request_id(envelope.request_id());
        let session_id = envelope.session_id();

        // 1 + 2. Operation lookup. A malformed op string can never match a
        // registered descriptor, so it folds into the same outcome.
        let Some(descriptor) = envelope
            .op
            .parse::<call_core::OperationId>()
            .ok()
            .and_then(|id| self.registry.lookup(&id).cloned())
        else {
            return DispatchResult::new(
                400,
                OutboundEnvelope::error(request_id, session_id, CallError::unknown_operation(&envelope.op)),
            );
        };

        // 3. Deprecation gate.
        let today = chrono::DateTime::from_timestamp(now, 0)
            .map(|dt| dt.date_naive())
            .unwrap_or(chrono::NaiveDate::MIN);
        if descriptor.is_removed(today) {
            warn!(op = %descriptor.op, "refused call to a removed operation");
            let replacement = descriptor.replacement.as_ref().map(|r| r.to_string());
            return DispatchResult::new(
                410,
                OutboundEnvelope::error(
                    request_id,
                    session_id,
                    CallError::op_removed(&descriptor.op.to_string(), replacement.as_deref()),
                ),
            );
        }

        // 4. Authentication.
        let principal = if descriptor.auth_scopes.is_empty() {
            None
        } else {
            let Some(principal) = self.auth.resolve(auth_header, now).await else {
                return DispatchResult::new(
                    401,
                    OutboundEnvelope::error(request_id, session_id, CallError::auth_required()),
                );
            };
            if let Err(missing) = principal.check_scopes(descriptor.auth_scopes.iter().map(String::as_str)) {
                return DispatchResult::new(
                    403,
                    OutboundEnvelope::error(request_id, session_id, CallError::insufficient_scopes(missing)),
                );
            }
            Some(principal)
        };

        // 5. Idempotency replay eligibility.
        let idempotency_key = if descriptor.side_effecting {
            envelope.idempotency_key().map(|key| {
                let subject = principal.as_ref().map(|p| p.subject.as_str()).unwrap_or("");
                IdempotencyTable::compose_key(&descriptor.op.to_string(), key, subject)
            })
        } else {
            None
        };

        let key_lock = match &idempotency_key {
            Some(key) => {
                if let Some(cached) = self.idempotency.get(key).await {
                    debug!(op = %descriptor.op, "idempotent replay hit");
                    return cached;
                }
                Some(self.idempotency.lock_for(key).await)
            }
            None => None,
        };
        let _guard = match &key_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        // Re-check after acquiring the lock: a concurrent request may have
        // just recorded the terminal outcome while we waited for it.
        if let Some(key) = &idempotency_key {
            if let Some(cached) = self.idempotency.get(key).await {
                return cached;
            }
        }

        // 6. Validate args.
        let args = match call_validate::validate_args(&descriptor.args_schema, &envelope.args) {
            Ok(args) => args,
            Err(err) => return DispatchResult::new(400, OutboundEnvelope::error(request_id, session_id, err)),
        };

        // 7. Execute.
        let result = self
            .execute(&descriptor, args, principal, request_id, session_id.clone())
            .await;

        // 8. Record idempotency (terminal outcomes only).
        if let Some(key) = idempotency_key {
            if matches!(result.envelope, OutboundEnvelope::Complete { .. } | OutboundEnvelope::Error { .. }) {
                self.idempotency.put(key, result.clone()).await;
            }
        }

        result
    }

    async fn execute(
        &self,
        descriptor: &OperationDescriptor,
        args: serde_json::Value,
        principal: Option<call_core::Principal>,
        request_id: Uuid,
        session_id: Option<String>,
    ) -> DispatchResult {
        let Some(handler) = self.handlers.get(&descriptor.op) else {
            return DispatchResult::new(
                500,
                OutboundEnvelope::error(request_id, session_id, CallError::internal(format!("no handler registered for {}", descriptor.op))),
            );
        };

        match descriptor.execution_model {
            ExecutionModel::Sync => match handler.call(args, principal).await {
                HandlerOutcome::Result(value) => {
                    DispatchResult::new(200, OutboundEnvelope::complete(request_id, session_id, value))
                }
                HandlerOutcome::Error(err) => {
                    DispatchResult::new(200, OutboundEnvelope::error(request_id, session_id, err))
                }
                HandlerOutcome::Redirect { uri } => {
                    DispatchResult::new(303, OutboundEnvelope::complete_location(request_id, session_id, uri))
                }
                HandlerOutcome::Stream(_) => DispatchResult::new(
                    500,
                    OutboundEnvelope::error(
                        request_id,
                        session_id,
                        CallError::internal(format!("{} is declared sync but returned a stream seed", descriptor.op)),
                    ),
                ),
            },
            ExecutionModel::Async => {
                let now = chrono::Utc::now().timestamp();
                let instance = self
                    .store
                    .create(request_id, descriptor.op.clone(), now, descriptor.ttl_seconds, 500)
                    .await;
                let store = Arc::clone(&self.store);
                tokio::spawn(async move {
                    if store.transition_to_pending(request_id).await.is_err() {
                        return;
                    }
                    match handler.call(args, principal).await {
                        HandlerOutcome::Result(value) => {
                            let _ = store.complete(request_id, value).await;
                        }
                        HandlerOutcome::Error(err) => {
                            let _ = store.fail(request_id, err).await;
                        }
                        HandlerOutcome::Redirect { uri } => {
                            let _ = store.complete(request_id, serde_json::json!({"location": {"uri": uri}})).await;
                        }
                        HandlerOutcome::Stream(_) => {
                            let _ = store
                                .fail(request_id, CallError::internal("async operation unexpectedly produced a stream seed"))
                                .await;
                        }
                    }
                    info!(%request_id, "async operation finished");
                });
                DispatchResult::new(
                    202,
                    OutboundEnvelope::accepted(request_id, session_id, format!("/ops/{request_id}"), instance.retry_after_ms),
                )
            }
            ExecutionModel::Stream => match handler.call(args, principal).await {
                HandlerOutcome::Stream(seed) => {
                    let session = Uuid::new_v4();
                    let stream = StreamInfo {
                        transport: seed.transport,
                        location: format!("/streams/{session}"),
                        session_id: session,
                        encoding: seed.encoding,
                    };
                    DispatchResult::new(202, OutboundEnvelope::streaming(request_id, session_id, stream))
                }
                HandlerOutcome::Error(err) => {
                    DispatchResult::new(200, OutboundEnvelope::error(request_id, session_id, err))
                }
                _ => DispatchResult::new(
                    500,
                    OutboundEnvelope::error(
                        request_id,
                        session_id,
                        CallError::internal(format!("{} is declared stream but did not return a stream seed", descriptor.op)),
                    ),
                ),
            },
        }
    }
}

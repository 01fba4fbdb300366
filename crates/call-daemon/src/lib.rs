//! The CALL protocol's HTTP surface and process composition root.
//!
//! [`build_state`] assembles the registry, auth store, instance store, rate
//! limiter, and dispatcher from a loaded [`call_config::CallConfig`].
//! [`build_app`] wires the six endpoint groups onto an [`axum::Router`]. The
//! [`Dispatcher`]'s fields are private by design, so this crate holds its
//! own `Arc` clones of the registry, auth store, and instance store rather
//! than reaching into the dispatcher for them.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod middleware;

use axum::body::{Body, Bytes};
use axum::extract::{Path as AxPath, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use call_auth::AuthStore;
use call_core::{CachingPolicy, ExecutionModel, OperationDescriptor};
use call_config::CallConfig;
use call_dispatch::Dispatcher;
use call_error::{CallError, ErrorCode};
use call_handlers::{demo, HandlerTable};
use call_protocol::{InboundEnvelope, OutboundEnvelope};
use call_ratelimit::RateLimiter;
use call_registry::Registry;
use call_store::{InstanceState, InstanceStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::warn;
use uuid::Uuid;

/// Bearer tokens issued by `/auth` and `/auth/agent` live for one hour.
const TOKEN_TTL_SECS: i64 = 3600;

/// The composition root's shared handles, passed to every route.
///
/// `dispatcher` already owns clones of `auth`, `store`, and `registry`
/// internally, but exposes none of them — `/auth`, the polling endpoints,
/// and `/.well-known/ops` need their own handles to serve without going
/// through `/call`.
pub struct AppState {
    /// The `/call` dispatch pipeline.
    pub dispatcher: Arc<Dispatcher>,
    /// Bearer token issuance and resolution, shared with the dispatcher.
    pub auth: Arc<AuthStore>,
    /// Async operation instances, shared with the dispatcher.
    pub store: Arc<InstanceStore>,
    /// The operation descriptor table, shared with the dispatcher.
    pub registry: Arc<Registry>,
    /// Per-requestId poll throttle, shared by the status and chunk endpoints.
    pub rate_limiter: Arc<RateLimiter>,
}

/// Assemble the composition root from a loaded configuration: the registry
/// seeded with the illustrative demo operations, a fresh auth store, an
/// instance store sized per `config.chunk_size_bytes`, a rate limiter paced
/// by `config.rate_limit_interval_ms`, and the dispatcher built over them.
pub fn build_state(config: &CallConfig) -> Arc<AppState> {
    let registry = Arc::new(Registry::new(seed_descriptors(config)));
    let auth = Arc::new(AuthStore::new());
    let store = Arc::new(InstanceStore::new(config.chunk_size_bytes));
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_interval_ms));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&auth),
        Arc::clone(&store),
        seed_handlers(),
    ));
    Arc::new(AppState {
        dispatcher,
        auth,
        store,
        registry,
        rate_limiter,
    })
}

fn seed_descriptors(config: &CallConfig) -> Vec<OperationDescriptor> {
    vec![
        OperationDescriptor {
            op: "v1:catalog.list".parse().unwrap(),
            summary: "List catalogue entries, optionally filtered by title".into(),
            args_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "default": 20}
                },
                "additionalProperties": false
            }),
            result_schema: json!({"type": "object"}),
            side_effecting: false,
            idempotency_required: false,
            execution_model: ExecutionModel::Sync,
            max_sync_ms: 500,
            ttl_seconds: config.default_ttl_seconds,
            auth_scopes: vec!["items:browse".into()],
            caching_policy: CachingPolicy::Public { max_age_secs: 30 },
            deprecated: false,
            sunset: None,
            replacement: None,
        },
        OperationDescriptor {
            op: "v1:patron.fines".parse().unwrap(),
            summary: "Return the calling patron's outstanding fines".into(),
            args_schema: json!({"type": "object", "additionalProperties": false}),
            result_schema: json!({"type": "object"}),
            side_effecting: false,
            idempotency_required: false,
            execution_model: ExecutionModel::Sync,
            max_sync_ms: 500,
            ttl_seconds: config.default_ttl_seconds,
            auth_scopes: vec!["patron:billing".into()],
            caching_policy: CachingPolicy::NoStore,
            deprecated: false,
            sunset: None,
            replacement: None,
        },
        OperationDescriptor {
            op: "v1:lending.checkin".parse().unwrap(),
            summary: "Check in a previously checked-out catalogue item".into(),
            args_schema: json!({
                "type": "object",
                "properties": {"itemId": {"type": "string"}},
                "required": ["itemId"],
                "additionalProperties": false
            }),
            result_schema: json!({"type": "object"}),
            side_effecting: true,
            idempotency_required: false,
            execution_model: ExecutionModel::Sync,
            max_sync_ms: 500,
            ttl_seconds: config.default_ttl_seconds,
            auth_scopes: vec!["items:checkin".into()],
            caching_policy: CachingPolicy::NoStore,
            deprecated: false,
            sunset: None,
            replacement: None,
        },
        OperationDescriptor {
            op: "v1:report.generate".parse().unwrap(),
            summary: "Generate a tabular report over the catalogue".into(),
            args_schema: json!({
                "type": "object",
                "properties": {"kind": {"type": "string", "default": "overdue"}},
                "additionalProperties": false
            }),
            result_schema: json!({"type": "object"}),
            side_effecting: false,
            idempotency_required: false,
            execution_model: ExecutionModel::Async,
            max_sync_ms: 500,
            ttl_seconds: config.default_ttl_seconds,
            auth_scopes: vec![],
            caching_policy: CachingPolicy::NoStore,
            deprecated: false,
            sunset: None,
            replacement: None,
        },
        OperationDescriptor {
            op: "v1:events.subscribe".parse().unwrap(),
            summary: "Open a streaming subscription to catalogue events".into(),
            args_schema: json!({"type": "object", "additionalProperties": false}),
            result_schema: json!({"type": "object"}),
            side_effecting: false,
            idempotency_required: false,
            execution_model: ExecutionModel::Stream,
            max_sync_ms: 500,
            ttl_seconds: config.default_ttl_seconds,
            auth_scopes: vec![],
            caching_policy: CachingPolicy::NoStore,
            deprecated: false,
            sunset: None,
            replacement: None,
        },
    ]
}

fn seed_handlers() -> HandlerTable {
    HandlerTable::new()
        .with("v1:catalog.list".parse().unwrap(), Arc::new(demo::CatalogListHandler))
        .with("v1:patron.fines".parse().unwrap(), Arc::new(demo::PatronFinesHandler))
        .with("v1:lending.checkin".parse().unwrap(), Arc::new(demo::LendingCheckinHandler))
        .with("v1:report.generate".parse().unwrap(), Arc::new(demo::ReportGenerateHandler))
        .with("v1:events.subscribe".parse().unwrap(), Arc::new(demo::EventsSubscribeHandler))
}

/// Build the Axum router with every CALL HTTP endpoint.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/auth", post(issue_human_token))
        .route("/auth/agent", post(issue_agent_token))
        .route("/call", any(call_handler))
        .route("/ops/{requestId}", get(poll_status))
        .route("/ops/{requestId}/chunks", get(poll_chunks))
        .route("/.well-known/ops", get(well_known_ops))
        .layer(axum::middleware::from_fn(middleware::RequestLogger::layer))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// /auth, /auth/agent
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthHumanRequest {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    scopes: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HumanAuthResponse {
    token: String,
    username: String,
    card_number: String,
    scopes: std::collections::BTreeSet<String>,
    expires_at: i64,
}

async fn issue_human_token(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Response {
    let req: AuthHumanRequest = if body.is_empty() {
        AuthHumanRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(err) => return error_body(StatusCode::BAD_REQUEST, CallError::invalid_envelope(err.to_string())),
        }
    };
    let now = chrono::Utc::now().timestamp();
    let issued = state.auth.issue_human(req.username, req.scopes, TOKEN_TTL_SECS, now).await;
    Json(HumanAuthResponse {
        token: issued.token,
        username: issued.username,
        card_number: issued.card_number,
        scopes: issued.scopes,
        expires_at: issued.expires_at,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthAgentRequest {
    card_number: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentAuthResponse {
    token: String,
    username: String,
    patron_id: String,
    card_number: String,
    scopes: std::collections::BTreeSet<String>,
    expires_at: i64,
}

async fn issue_agent_token(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Response {
    let req: AuthAgentRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => return error_body(StatusCode::BAD_REQUEST, CallError::invalid_envelope(err.to_string())),
    };
    let now = chrono::Utc::now().timestamp();
    match state.auth.issue_agent(&req.card_number, TOKEN_TTL_SECS, now).await {
        Ok(issued) => Json(AgentAuthResponse {
            token: issued.token,
            username: issued.username,
            patron_id: issued.patron_id,
            card_number: issued.card_number,
            scopes: issued.scopes,
            expires_at: issued.expires_at,
        })
        .into_response(),
        Err(err) => {
            let status = match err.code {
                ErrorCode::InvalidCard => StatusCode::BAD_REQUEST,
                ErrorCode::PatronNotFound => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_body(status, err)
        }
    }
}

fn error_body(status: StatusCode, error: CallError) -> Response {
    (status, Json(error)).into_response()
}

// ---------------------------------------------------------------------------
// /call
// ---------------------------------------------------------------------------

async fn call_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        let request_id = Uuid::new_v4();
        let envelope = OutboundEnvelope::error(
            request_id,
            None,
            CallError::new(ErrorCode::MethodNotAllowed, "only POST is allowed on /call"),
        );
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, "POST")],
            Json(envelope),
        )
            .into_response();
    }

    let envelope: InboundEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(err) => {
            let request_id = Uuid::new_v4();
            let response = OutboundEnvelope::error(request_id, None, CallError::invalid_envelope(err.to_string()));
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    let auth_header = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let now = chrono::Utc::now().timestamp();
    let result = state.dispatcher.dispatch(envelope, auth_header, now).await;

    let mut response = (StatusCode::from_u16(result.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), Json(result.envelope.clone())).into_response();
    if result.status == 303 {
        if let OutboundEnvelope::Complete { outcome: call_protocol::CompleteOutcome::Location { location }, .. } = &result.envelope {
            if let Ok(value) = header::HeaderValue::from_str(&location.uri) {
                response.headers_mut().insert(header::LOCATION, value);
            }
        }
    }
    response
}

// ---------------------------------------------------------------------------
// /ops/{requestId}, /ops/{requestId}/chunks
// ---------------------------------------------------------------------------

async fn poll_status(State(state): State<Arc<AppState>>, AxPath(request_id): AxPath<Uuid>) -> Response {
    let now_secs = chrono::Utc::now().timestamp();
    let Some(instance) = state.store.lookup(request_id, now_secs).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(OutboundEnvelope::error(request_id, None, CallError::operation_not_found(request_id))),
        )
            .into_response();
    };

    let now_ms = chrono::Utc::now().timestamp_millis();
    if let Err(throttled) = state.rate_limiter.poll(request_id, now_ms).await {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(OutboundEnvelope::error(request_id, None, CallError::rate_limited(throttled.0))),
        )
            .into_response();
    }

    let envelope = instance_envelope(request_id, &instance);
    (StatusCode::OK, Json(envelope)).into_response()
}

/// Project an [`call_store::OperationInstance`] onto the wire envelope.
/// `accepted` and `pending` share the `accepted` wire state — the outbound
/// envelope's closed sum type has no separate `pending` variant, so the two
/// pre-terminal states are indistinguishable to a polling client beyond
/// `retryAfterMs`.
fn instance_envelope(request_id: Uuid, instance: &call_store::OperationInstance) -> OutboundEnvelope {
    match instance.state {
        InstanceState::Accepted | InstanceState::Pending => {
            OutboundEnvelope::accepted(request_id, None, format!("/ops/{request_id}"), instance.retry_after_ms)
        }
        InstanceState::Complete => {
            OutboundEnvelope::complete(request_id, None, instance.result.clone().unwrap_or(Value::Null))
        }
        InstanceState::Error => OutboundEnvelope::error(
            request_id,
            None,
            instance
                .error
                .clone()
                .unwrap_or_else(|| CallError::internal("instance marked failed without a stored error")),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct ChunksQuery {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChunkResponse {
    request_id: Uuid,
    offset: u64,
    data: String,
    checksum: String,
    checksum_previous: Option<String>,
    state: call_core::ChunkState,
    cursor: Option<String>,
}

async fn poll_chunks(
    State(state): State<Arc<AppState>>,
    AxPath(request_id): AxPath<Uuid>,
    Query(query): Query<ChunksQuery>,
) -> Response {
    let now_ms = chrono::Utc::now().timestamp_millis();
    if let Err(throttled) = state.rate_limiter.poll(request_id, now_ms).await {
        return error_body(StatusCode::TOO_MANY_REQUESTS, CallError::rate_limited(throttled.0));
    }

    let now_secs = chrono::Utc::now().timestamp();
    match state.store.chunk_at(request_id, query.cursor.as_deref(), now_secs).await {
        Ok(chunk) => Json(ChunkResponse {
            request_id,
            offset: chunk.offset,
            data: chunk.data,
            checksum: chunk.checksum,
            checksum_previous: chunk.checksum_previous,
            state: chunk.state,
            cursor: chunk.cursor,
        })
        .into_response(),
        Err(StoreError::NotFound(id)) => error_body(StatusCode::NOT_FOUND, CallError::operation_not_found(id)),
        Err(StoreError::NotComplete(id)) => error_body(
            StatusCode::BAD_REQUEST,
            CallError::new(ErrorCode::OperationNotFound, format!("operation {id} has not completed yet")),
        ),
        Err(StoreError::InvalidCursor) => error_body(
            StatusCode::BAD_REQUEST,
            CallError::new(ErrorCode::OperationNotFound, "cursor does not match any known chunk boundary"),
        ),
        Err(StoreError::InvalidTransition { .. }) => {
            warn!(%request_id, "unexpected transition error surfaced from chunk_at");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, CallError::internal("unexpected store state"))
        }
    }
}

// ---------------------------------------------------------------------------
// /.well-known/ops
// ---------------------------------------------------------------------------

async fn well_known_ops(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let etag = state.registry.etag().to_string();

    if let Some(if_none_match) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        if state.registry.matches_etag(if_none_match) {
            return Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(header::ETAG, etag)
                .body(Body::empty())
                .unwrap();
        }
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ETAG, etag)
        .header(header::CACHE_CONTROL, "public, max-age=3600")
        .body(Body::from(state.registry.document_bytes().to_vec()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        build_state(&CallConfig::default())
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_auth_yields_401_auth_required() {
        let app = build_app(test_state());
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/call")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"op":"v1:catalog.list","args":{}}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(resp).await;
        assert_eq!(body["state"], "error");
        assert_eq!(body["error"]["code"], "AUTH_REQUIRED");
    }

    #[tokio::test]
    async fn unknown_op_yields_400() {
        let app = build_app(test_state());
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/call")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"op":"v1:fake.op","args":{}}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["code"], "UNKNOWN_OPERATION");
    }

    #[tokio::test]
    async fn get_on_call_is_method_not_allowed() {
        let app = build_app(test_state());
        let req = axum::http::Request::builder().method("GET").uri("/call").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers().get(header::ALLOW).unwrap(), "POST");
    }

    #[tokio::test]
    async fn human_auth_filters_scopes_then_satisfies_scoped_call() {
        let app = build_app(test_state());
        let auth_req = axum::http::Request::builder()
            .method("POST")
            .uri("/auth")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"scopes":["items:browse","items:manage","patron:billing","patron:read"]}"#))
            .unwrap();
        let auth_resp = app.clone().oneshot(auth_req).await.unwrap();
        assert_eq!(auth_resp.status(), StatusCode::OK);
        let auth_body = body_json(auth_resp).await;
        let scopes: Vec<String> = auth_body["scopes"].as_array().unwrap().iter().map(|v| v.as_str().unwrap().to_string()).collect();
        assert!(scopes.contains(&"items:browse".to_string()));
        assert!(scopes.contains(&"patron:read".to_string()));
        assert!(!scopes.contains(&"items:manage".to_string()));
        assert!(!scopes.contains(&"patron:billing".to_string()));

        let token = auth_body["token"].as_str().unwrap();
        let call_req = axum::http::Request::builder()
            .method("POST")
            .uri("/call")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(r#"{"op":"v1:catalog.list","args":{}}"#))
            .unwrap();
        let call_resp = app.oneshot(call_req).await.unwrap();
        assert_eq!(call_resp.status(), StatusCode::OK);
        let body = body_json(call_resp).await;
        assert_eq!(body["state"], "complete");
    }

    #[tokio::test]
    async fn insufficient_scope_yields_403() {
        let app = build_app(test_state());
        let auth_req = axum::http::Request::builder()
            .method("POST")
            .uri("/auth")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"scopes":["items:browse"]}"#))
            .unwrap();
        let auth_resp = app.clone().oneshot(auth_req).await.unwrap();
        let token = body_json(auth_resp).await["token"].as_str().unwrap().to_string();

        let call_req = axum::http::Request::builder()
            .method("POST")
            .uri("/call")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(r#"{"op":"v1:patron.fines","args":{}}"#))
            .unwrap();
        let resp = app.oneshot(call_req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["code"], "INSUFFICIENT_SCOPES");
        assert!(body["error"]["cause"]["missing"].as_array().unwrap().iter().any(|v| v == "patron:billing"));
    }

    #[tokio::test]
    async fn agent_auth_rejects_malformed_card() {
        let app = build_app(test_state());
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/auth/agent")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"cardNumber":"not-a-card"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "INVALID_CARD");
    }

    #[tokio::test]
    async fn agent_auth_rejects_unknown_card() {
        let app = build_app(test_state());
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/auth/agent")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"cardNumber":"ABCD-1234-XY"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "PATRON_NOT_FOUND");
    }

    #[tokio::test]
    async fn async_lifecycle_accepts_then_polls_to_completion_then_rate_limits() {
        let app = build_app(test_state());
        let call_req = axum::http::Request::builder()
            .method("POST")
            .uri("/call")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"op":"v1:report.generate","args":{}}"#))
            .unwrap();
        let resp = app.clone().oneshot(call_req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = body_json(resp).await;
        assert_eq!(body["state"], "accepted");
        let location = body["location"]["uri"].as_str().unwrap().to_string();
        assert!(location.starts_with("/ops/"));

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let poll_req = axum::http::Request::builder().method("GET").uri(&location).body(Body::empty()).unwrap();
        let poll_resp = app.clone().oneshot(poll_req).await.unwrap();
        assert_eq!(poll_resp.status(), StatusCode::OK);
        let poll_body = body_json(poll_resp).await;
        assert!(matches!(poll_body["state"].as_str().unwrap(), "accepted" | "pending" | "complete" | "error"));

        let second_poll = axum::http::Request::builder().method("GET").uri(&location).body(Body::empty()).unwrap();
        let second_resp = app.oneshot(second_poll).await.unwrap();
        assert_eq!(second_resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let second_body = body_json(second_resp).await;
        assert_eq!(second_body["error"]["code"], "RATE_LIMITED");
        assert!(second_body["error"]["cause"]["retryAfterMs"].as_u64().unwrap() <= 1000);
    }

    #[tokio::test]
    async fn chunk_chain_walks_head_to_tail_after_completion() {
        let config = CallConfig {
            chunk_size_bytes: 8,
            rate_limit_interval_ms: 0,
            ..CallConfig::default()
        };
        let state = build_state(&config);
        let app = build_app(Arc::clone(&state));

        let call_req = axum::http::Request::builder()
            .method("POST")
            .uri("/call")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"op":"v1:report.generate","args":{}}"#))
            .unwrap();
        let resp = app.clone().oneshot(call_req).await.unwrap();
        let body = body_json(resp).await;
        let request_id = body["requestId"].as_str().unwrap().to_string();

        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if state
                .store
                .lookup(request_id.parse().unwrap(), chrono::Utc::now().timestamp())
                .await
                .map(|i| i.state == InstanceState::Complete)
                .unwrap_or(false)
            {
                break;
            }
        }

        let mut cursor: Option<String> = None;
        let mut last_checksum: Option<String> = None;
        loop {
            let uri = match &cursor {
                Some(c) => format!("/ops/{request_id}/chunks?cursor={c}"),
                None => format!("/ops/{request_id}/chunks"),
            };
            let req = axum::http::Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let chunk = body_json(resp).await;
            assert_eq!(chunk["checksumPrevious"], json!(last_checksum));
            last_checksum = Some(chunk["checksum"].as_str().unwrap().to_string());
            if chunk["state"] == "complete" {
                assert!(chunk["cursor"].is_null());
                break;
            }
            cursor = Some(chunk["cursor"].as_str().unwrap().to_string());
        }
    }

    #[tokio::test]
    async fn chunks_on_incomplete_instance_is_400() {
        let app_state = test_state();
        let app = build_app(Arc::clone(&app_state));
        let call_req = axum::http::Request::builder()
            .method("POST")
            .uri("/call")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"op":"v1:report.generate","args":{}}"#))
            .unwrap();
        let resp = app.clone().oneshot(call_req).await.unwrap();
        let body = body_json(resp).await;
        let request_id = body["requestId"].as_str().unwrap().to_string();

        let req = axum::http::Request::builder()
            .method("GET")
            .uri(format!("/ops/{request_id}/chunks"))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_request_id_is_404_on_both_polling_endpoints() {
        let app = build_app(test_state());
        let id = Uuid::new_v4();
        let status_req = axum::http::Request::builder().method("GET").uri(format!("/ops/{id}")).body(Body::empty()).unwrap();
        let status_resp = app.clone().oneshot(status_req).await.unwrap();
        assert_eq!(status_resp.status(), StatusCode::NOT_FOUND);

        let chunk_req = axum::http::Request::builder().method("GET").uri(format!("/ops/{id}/chunks")).body(Body::empty()).unwrap();
        let chunk_resp = app.oneshot(chunk_req).await.unwrap();
        assert_eq!(chunk_resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn well_known_ops_round_trips_etag() {
        let app = build_app(test_state());
        let req = axum::http::Request::builder().method("GET").uri("/.well-known/ops").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let etag = resp.headers().get(header::ETAG).unwrap().to_str().unwrap().to_string();
        assert_eq!(resp.headers().get(header::CACHE_CONTROL).unwrap(), "public, max-age=3600");

        let req2 = axum::http::Request::builder()
            .method("GET")
            .uri("/.well-known/ops")
            .header("if-none-match", &etag)
            .body(Body::empty())
            .unwrap();
        let resp2 = app.oneshot(req2).await.unwrap();
        assert_eq!(resp2.status(), StatusCode::NOT_MODIFIED);
        let bytes = resp2.into_body().collect().await.unwrap().to_bytes();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn idempotent_replay_yields_byte_identical_response() {
        let app = build_app(test_state());
        let auth_req = axum::http::Request::builder()
            .method("POST")
            .uri("/auth")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"scopes":["items:checkin"]}"#))
            .unwrap();
        let auth_resp = app.clone().oneshot(auth_req).await.unwrap();
        let token = body_json(auth_resp).await["token"].as_str().unwrap().to_string();

        let make_req = || {
            axum::http::Request::builder()
                .method("POST")
                .uri("/call")
                .header("content-type", "application/json")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::from(r#"{"op":"v1:lending.checkin","args":{"itemId":"book-2"},"ctx":{"idempotencyKey":"k-1"}}"#))
                .unwrap()
        };
        let first = body_json(app.clone().oneshot(make_req()).await.unwrap()).await;
        let second = body_json(app.oneshot(make_req()).await.unwrap()).await;
        assert_eq!(first, second);
    }
}

//! Illustrative library-domain handlers.
//!
//! These exist to exercise the four [`super::HandlerOutcome`] variants end
//! to end; the seeded catalogue is an in-memory vector, not a real store.

use crate::{Handler, HandlerOutcome, StreamSeed};
use async_trait::async_trait;
use call_core::Principal;
use call_error::{CallError, ErrorCode};
use serde_json::{json, Value};
use tracing::debug;

struct CatalogueEntry {
    id: &'static str,
    title: &'static str,
    checked_out: bool,
}

const CATALOGUE: &[CatalogueEntry] = &[
    CatalogueEntry { id: "book-1", title: "The Pragmatic Programmer", checked_out: false },
    CatalogueEntry { id: "book-2", title: "Designing Data-Intensive Applications", checked_out: true },
    CatalogueEntry { id: "book-3", title: "The Rust Programming Language", checked_out: false },
];

/// `v1:catalog.list` — lists catalogue entries, optionally filtered by a
/// case-insensitive substring match on `query`, bounded by `limit`.
pub struct CatalogListHandler;

#[async_trait]
impl Handler for CatalogListHandler {
    async fn call(&self, args: Value, _principal: Option<Principal>) -> HandlerOutcome {
        let query = args.get("query").and_then(Value::as_str).unwrap_or("").to_lowercase();
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(20) as usize;
        let items: Vec<Value> = CATALOGUE
            .iter()
            .filter(|entry| query.is_empty() || entry.title.to_lowercase().contains(&query))
            .take(limit)
            .map(|entry| json!({"id": entry.id, "title": entry.title, "checkedOut": entry.checked_out}))
            .collect();
        debug!(matched = items.len(), "catalogue listed");
        HandlerOutcome::Result(json!({"items": items}))
    }
}

/// `v1:patron.fines` — returns the calling patron's outstanding fines.
/// Gated by the `patron:billing` scope at the dispatcher level; this
/// handler trusts that gate and does not re-check scopes itself.
pub struct PatronFinesHandler;

#[async_trait]
impl Handler for PatronFinesHandler {
    async fn call(&self, _args: Value, principal: Option<Principal>) -> HandlerOutcome {
        let subject = principal.map(|p| p.subject).unwrap_or_default();
        HandlerOutcome::Result(json!({"patronId": subject, "totalCents": 0}))
    }
}

/// `v1:lending.checkin` — returns a domain error when the named item is
/// not currently checked out, illustrating [`HandlerOutcome::Error`].
pub struct LendingCheckinHandler;

#[async_trait]
impl Handler for LendingCheckinHandler {
    async fn call(&self, args: Value, _principal: Option<Principal>) -> HandlerOutcome {
        let Some(item_id) = args.get("itemId").and_then(Value::as_str) else {
            return HandlerOutcome::Error(CallError::new(
                ErrorCode::SchemaValidationFailed,
                "itemId is required",
            ));
        };
        match CATALOGUE.iter().find(|entry| entry.id == item_id) {
            None => HandlerOutcome::Error(CallError::new(
                ErrorCode::domain("ITEM_NOT_FOUND").expect("static tag is valid"),
                format!("no catalogue entry {item_id}"),
            )),
            Some(entry) if !entry.checked_out => HandlerOutcome::Error(CallError::new(
                ErrorCode::domain("ITEM_NOT_CHECKED_OUT").expect("static tag is valid"),
                format!("{item_id} is not currently checked out"),
            )),
            Some(entry) => HandlerOutcome::Result(json!({"itemId": entry.id, "checkedOut": false})),
        }
    }
}

/// `v1:report.generate` — a deliberately slow operation, appropriate for
/// the `async` execution model. Produces a small tabular result.
pub struct ReportGenerateHandler;

#[async_trait]
impl Handler for ReportGenerateHandler {
    async fn call(&self, args: Value, _principal: Option<Principal>) -> HandlerOutcome {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let kind = args.get("kind").and_then(Value::as_str).unwrap_or("overdue");
        HandlerOutcome::Result(json!({
            "kind": kind,
            "rows": CATALOGUE.iter().map(|e| json!({"id": e.id, "title": e.title})).collect::<Vec<_>>(),
        }))
    }
}

/// `v1:events.subscribe` — hands back a streaming handshake seed; actual
/// event delivery over the chosen transport is out of the core's scope.
pub struct EventsSubscribeHandler;

#[async_trait]
impl Handler for EventsSubscribeHandler {
    async fn call(&self, _args: Value, _principal: Option<Principal>) -> HandlerOutcome {
        HandlerOutcome::Stream(StreamSeed {
            transport: "sse".to_string(),
            encoding: "application/json".to_string(),
        })
    }
}

//! Bearer-token issuance and resolution for the CALL protocol.
//!
//! [`AuthStore`] issues two kinds of opaque, prefixed bearer tokens —
//! `demo_` for human principals, `agent_` for agent principals bound to a
//! patron — and resolves an `Authorization` header back down to a
//! [`Principal`]. The store is process-wide and read-mostly: lookups take a
//! reader lock, issuance takes a brief writer lock.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use call_core::{Principal, PrincipalKind};
use call_error::CallError;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Scopes stripped from any human-issued token regardless of what was requested.
const HUMAN_SCOPE_DENYLIST: &[&str] = &["items:manage", "patron:billing"];

/// The fixed scope set granted to every agent token.
const AGENT_SCOPES: &[&str] = &["items:browse", "items:read", "items:write", "patron:read"];

const ADJECTIVES: &[&str] = &["quiet", "amber", "brisk", "solar", "vivid", "gentle", "lunar"];
const ANIMALS: &[&str] = &["otter", "falcon", "lynx", "heron", "marten", "wren", "badger"];

/// A materialized patron: the binding between a human-facing username, a
/// canonical card number, and the stable `subject` used for idempotency
/// keying and agent token issuance.
#[derive(Debug, Clone)]
struct PatronRecord {
    subject: String,
    username: String,
    card_number: String,
}

/// Response to a successful `POST /auth`.
#[derive(Debug, Clone)]
pub struct HumanIssued {
    /// The issued bearer token, prefixed `demo_`.
    pub token: String,
    /// The resolved or freshly generated username.
    pub username: String,
    /// The patron's canonical card number.
    pub card_number: String,
    /// Scopes actually granted, after denylist filtering.
    pub scopes: BTreeSet<String>,
    /// Unix timestamp (seconds) after which the token resolves as absent.
    pub expires_at: i64,
}

/// Response to a successful `POST /auth/agent`.
#[derive(Debug, Clone)]
pub struct AgentIssued {
    /// The issued bearer token, prefixed `agent_`.
    pub token: String,
    /// The bound patron's username.
    pub username: String,
    /// The bound patron's subject id.
    pub patron_id: String,
    /// The card number the agent authenticated with.
    pub card_number: String,
    /// Scopes granted (always [`AGENT_SCOPES`]).
    pub scopes: BTreeSet<String>,
    /// Unix timestamp (seconds) after which the token resolves as absent.
    pub expires_at: i64,
}

/// Process-wide store of issued principals and materialized patrons.
#[derive(Default)]
pub struct AuthStore {
    principals: RwLock<HashMap<String, Principal>>,
    by_username: RwLock<HashMap<String, PatronRecord>>,
    by_card: RwLock<HashMap<String, PatronRecord>>,
}

impl AuthStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap in an `Arc` for sharing across the composition root.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Issue a human token. `username` falls back to a generated
    /// adjective-animal handle when absent. `requested_scopes` is filtered
    /// against [`HUMAN_SCOPE_DENYLIST`] before being granted.
    pub async fn issue_human(
        &self,
        username: Option<String>,
        requested_scopes: Option<Vec<String>>,
        ttl_secs: i64,
        now: i64,
    ) -> HumanIssued {
        let mut by_username = self.by_username.write().await;
        let mut by_card = self.by_card.write().await;

        let username = username.unwrap_or_else(|| self.generate_handle(&by_username));
        let record = if let Some(existing) = by_username.get(&username) {
            existing.clone()
        } else {
            let record = PatronRecord {
                subject: format!("patron-{}", Uuid::new_v4()),
                username: username.clone(),
                card_number: generate_card_number(),
            };
            by_username.insert(username.clone(), record.clone());
            by_card.insert(record.card_number.clone(), record.clone());
            record
        };
        drop(by_card);
        drop(by_username);

        let scopes: BTreeSet<String> = requested_scopes
            .unwrap_or_default()
            .into_iter()
            .filter(|s| !HUMAN_SCOPE_DENYLIST.contains(&s.as_str()))
            .collect();

        let token = format!("demo_{}", Uuid::new_v4());
        let expires_at = now + ttl_secs;
        let principal = Principal {
            token: token.clone(),
            kind: PrincipalKind::Human,
            subject: record.subject.clone(),
            scopes: scopes.clone(),
            expires_at,
        };
        self.principals.write().await.insert(token.clone(), principal);
        debug!(username = %record.username, "issued human token");

        HumanIssued {
            token,
            username: record.username,
            card_number: record.card_number,
            scopes,
            expires_at,
        }
    }

    /// Issue an agent token bound to the patron owning `card_number`.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_CARD` if `card_number` does not match the canonical
    /// shape, or `PATRON_NOT_FOUND` if no patron exists for it.
    pub async fn issue_agent(
        &self,
        card_number: &str,
        ttl_secs: i64,
        now: i64,
    ) -> Result<AgentIssued, CallError> {
        if !is_valid_card_number(card_number) {
            return Err(CallError::new(
                call_error::ErrorCode::InvalidCard,
                format!("card number {card_number:?} does not match the canonical format"),
            ));
        }

        let record = self
            .by_card
            .read()
            .await
            .get(card_number)
            .cloned()
            .ok_or_else(|| {
                CallError::new(
                    call_error::ErrorCode::PatronNotFound,
                    format!("no patron exists for card number {card_number:?}"),
                )
            })?;

        let scopes: BTreeSet<String> = AGENT_SCOPES.iter().map(|s| s.to_string()).collect();
        let token = format!("agent_{}", Uuid::new_v4());
        let expires_at = now + ttl_secs;
        let principal = Principal {
            token: token.clone(),
            kind: PrincipalKind::Agent,
            subject: record.subject.clone(),
            scopes: scopes.clone(),
            expires_at,
        };
        self.principals.write().await.insert(token.clone(), principal);
        debug!(patron = %record.subject, "issued agent token");

        Ok(AgentIssued {
            token,
            username: record.username,
            patron_id: record.subject,
            card_number: record.card_number,
            scopes,
            expires_at,
        })
    }

    /// Resolve an `Authorization` header value (`"Bearer <token>"`) to a
    /// [`Principal`]. Returns `None` for a malformed header, an unknown
    /// token, or an expired one.
    pub async fn resolve(&self, auth_header: Option<&str>, now: i64) -> Option<Principal> {
        let token = auth_header?.strip_prefix("Bearer ")?;
        let principal = self.principals.read().await.get(token).cloned()?;
        if principal.is_expired(now) {
            return None;
        }
        Some(principal)
    }

    fn generate_handle(&self, existing: &HashMap<String, PatronRecord>) -> String {
        use rand::seq::SliceRandom;
        let mut rng = rand::thread_rng();
        loop {
            let adjective = ADJECTIVES.choose(&mut rng).unwrap();
            let animal = ANIMALS.choose(&mut rng).unwrap();
            let suffix: u16 = rand::Rng::gen_range(&mut rng, 0..10_000);
            let handle = format!("{adjective}-{animal}-{suffix}");
            if !existing.contains_key(&handle) {
                return handle;
            }
        }
    }
}

fn generate_card_number() -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let mut group = |len: usize| -> String {
        (0..len)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect()
    };
    format!("{}-{}-{}", group(4), group(4), group(2))
}

/// `true` if `card_number` matches `^[A-Za-z0-9]{4}-[A-Za-z0-9]{4}-[A-Za-z0-9]{2}$`.
pub fn is_valid_card_number(card_number: &str) -> bool {
    let parts: Vec<&str> = card_number.split('-').collect();
    let [a, b, c] = parts.as_slice() else {
        return false;
    };
    a.len() == 4
        && b.len() == 4
        && c.len() == 2
        && [*a, *b, *c]
            .iter()
            .all(|part| part.chars().all(|ch| ch.is_ascii_alphanumeric()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn human_auth_filters_denied_scopes() {
        let store = AuthStore::new();
        let issued = store
            .issue_human(
                None,
                Some(vec![
                    "items:browse".into(),
                    "items:manage".into(),
                    "patron:billing".into(),
                    "patron:read".into(),
                ]),
                3600,
                1_000,
            )
            .await;
        assert!(issued.scopes.contains("items:browse"));
        assert!(issued.scopes.contains("patron:read"));
        assert!(!issued.scopes.contains("items:manage"));
        assert!(!issued.scopes.contains("patron:billing"));
        assert!(issued.token.starts_with("demo_"));
    }

    #[tokio::test]
    async fn human_auth_generates_handle_when_username_absent() {
        let store = AuthStore::new();
        let issued = store.issue_human(None, None, 3600, 0).await;
        assert!(issued.username.contains('-'));
    }

    #[tokio::test]
    async fn reusing_username_reuses_patron_record() {
        let store = AuthStore::new();
        let first = store.issue_human(Some("cori".into()), None, 3600, 0).await;
        let second = store.issue_human(Some("cori".into()), None, 3600, 0).await;
        assert_eq!(first.card_number, second.card_number);
        assert_ne!(first.token, second.token, "each issuance mints a fresh token");
    }

    #[tokio::test]
    async fn agent_auth_rejects_malformed_card() {
        let store = AuthStore::new();
        let err = store.issue_agent("not-a-card", 3600, 0).await.unwrap_err();
        assert_eq!(err.code, call_error::ErrorCode::InvalidCard);
    }

    #[tokio::test]
    async fn agent_auth_rejects_unknown_card() {
        let store = AuthStore::new();
        let err = store.issue_agent("ABCD-1234-XY", 3600, 0).await.unwrap_err();
        assert_eq!(err.code, call_error::ErrorCode::PatronNotFound);
    }

    #[tokio::test]
    async fn agent_auth_succeeds_for_known_card_with_fixed_scopes() {
        let store = AuthStore::new();
        let human = store.issue_human(Some("pat".into()), None, 3600, 0).await;
        let agent = store.issue_agent(&human.card_number, 3600, 0).await.unwrap();
        assert!(agent.token.starts_with("agent_"));
        assert_eq!(agent.patron_id, human_subject(&store, &agent.token).await);
        assert!(agent.scopes.contains("items:write"));
        assert!(!agent.scopes.contains("items:checkin"));
        assert!(!agent.scopes.contains("patron:billing"));
    }

    async fn human_subject(store: &AuthStore, agent_token: &str) -> String {
        store.resolve(Some(&format!("Bearer {agent_token}")), 0).await.unwrap().subject
    }

    #[tokio::test]
    async fn resolve_rejects_missing_header() {
        let store = AuthStore::new();
        assert!(store.resolve(None, 0).await.is_none());
    }

    #[tokio::test]
    async fn resolve_rejects_malformed_header() {
        let store = AuthStore::new();
        assert!(store.resolve(Some("token-without-bearer"), 0).await.is_none());
    }

    #[tokio::test]
    async fn resolve_rejects_unknown_token() {
        let store = AuthStore::new();
        assert!(store.resolve(Some("Bearer demo_nope"), 0).await.is_none());
    }

    #[tokio::test]
    async fn resolve_rejects_expired_token_regardless_of_scopes() {
        let store = AuthStore::new();
        let issued = store
            .issue_human(None, Some(vec!["items:browse".into()]), 10, 0)
            .await;
        let header = format!("Bearer {}", issued.token);
        assert!(store.resolve(Some(&header), 9).await.is_some());
        assert!(store.resolve(Some(&header), 10).await.is_none());
    }

    #[test]
    fn card_number_validation() {
        assert!(is_valid_card_number("ABCD-1234-XY"));
        assert!(!is_valid_card_number("ABCD-1234-X"));
        assert!(!is_valid_card_number("ABCD1234XY"));
        assert!(!is_valid_card_number("ABC!-1234-XY"));
        assert!(!is_valid_card_number(""));
    }
}

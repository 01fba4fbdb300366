#![doc = include_str!("../README.md")]
//! call-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for the CALL protocol: operation identifiers,
//! principals, operation descriptors, and chunked-result types. Dispatcher,
//! registry, store, and HTTP surface all build on these without
//! reimplementing them.

use std::collections::BTreeSet;
use std::fmt;

use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use call_error::{CallError, ErrorCode};

/// Date-form protocol version embedded in the registry discovery document.
pub const CALL_VERSION: &str = "2026-01-15";

// ---------------------------------------------------------------------------
// OperationId
// ---------------------------------------------------------------------------

/// A named, versioned operation identifier of the form
/// `v<major>:<namespace>.<verb>`, e.g. `v1:catalog.list`.
///
/// ```
/// use call_core::OperationId;
///
/// let op: OperationId = "v1:catalog.list".parse().unwrap();
/// assert_eq!(op.major(), 1);
/// assert_eq!(op.namespace(), "catalog");
/// assert_eq!(op.verb(), "list");
/// assert_eq!(op.to_string(), "v1:catalog.list");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OperationId {
    major: u32,
    namespace: String,
    verb: String,
}

impl OperationId {
    /// The major version component.
    pub fn major(&self) -> u32 {
        self.major
    }

    /// The namespace component, e.g. `"catalog"`.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The verb component, e.g. `"list"`.
    pub fn verb(&self) -> &str {
        &self.verb
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}:{}.{}", self.major, self.namespace, self.verb)
    }
}

/// Error returned when a string does not match `v<major>:<namespace>.<verb>`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid operation id {0:?}, expected v<major>:<namespace>.<verb>")]
pub struct InvalidOperationId(pub String);

impl std::str::FromStr for OperationId {
    type Err = InvalidOperationId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || InvalidOperationId(s.to_string());
        let rest = s.strip_prefix('v').ok_or_else(bad)?;
        let (major_str, path) = rest.split_once(':').ok_or_else(bad)?;
        let major: u32 = major_str.parse().map_err(|_| bad())?;
        let (namespace, verb) = path.split_once('.').ok_or_else(bad)?;
        if namespace.is_empty() || verb.is_empty() {
            return Err(bad());
        }
        Ok(Self {
            major,
            namespace: namespace.to_string(),
            verb: verb.to_string(),
        })
    }
}

impl TryFrom<String> for OperationId {
    type Error = InvalidOperationId;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<OperationId> for String {
    fn from(op: OperationId) -> Self {
        op.to_string()
    }
}

// ---------------------------------------------------------------------------
// Execution model & caching policy
// ---------------------------------------------------------------------------

/// How an operation is executed by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionModel {
    /// Runs to completion within the request/response cycle.
    Sync,
    /// Accepted immediately; result retrieved later via polling.
    Async,
    /// Upgrades to a streaming transport after the initial handshake.
    Stream,
}

/// Cache-control guidance for a descriptor or discovery document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CachingPolicy {
    /// Never cache.
    NoStore,
    /// Publicly cacheable for `max_age_secs` seconds.
    Public {
        /// Freshness lifetime in seconds.
        max_age_secs: u32,
    },
}

// ---------------------------------------------------------------------------
// Operation descriptor
// ---------------------------------------------------------------------------

/// Immutable description of a single registered operation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OperationDescriptor {
    /// The operation identifier.
    pub op: OperationId,
    /// One-line human summary, shown in the discovery document.
    pub summary: String,
    /// JSON-Schema-compatible shape describing valid arguments.
    pub args_schema: serde_json::Value,
    /// JSON-Schema-compatible shape describing the success result.
    pub result_schema: serde_json::Value,
    /// Whether invoking this operation has side effects (enables idempotency
    /// replay when a client supplies `ctx.idempotencyKey`).
    pub side_effecting: bool,
    /// Whether side-effecting calls require an idempotency key to be eligible
    /// for replay (informational; the dispatcher always honors a supplied key).
    pub idempotency_required: bool,
    /// How the dispatcher executes this operation.
    pub execution_model: ExecutionModel,
    /// Soft budget for `sync` handlers, in milliseconds.
    pub max_sync_ms: u64,
    /// Time-to-live for async instances created by this operation, in seconds.
    pub ttl_seconds: u64,
    /// Scopes a principal must hold to invoke this operation. Empty means
    /// no authentication is required.
    pub auth_scopes: Vec<String>,
    /// Cache-control guidance (mainly relevant to the registry document
    /// itself, carried per-descriptor for forward compatibility).
    pub caching_policy: CachingPolicy,
    /// Marks this operation as deprecated.
    #[serde(default)]
    pub deprecated: bool,
    /// Date after which a deprecated operation refuses calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sunset: Option<NaiveDate>,
    /// Suggested replacement operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<OperationId>,
}

impl OperationDescriptor {
    /// Returns `true` if this descriptor is deprecated and its sunset date
    /// has passed as of `today`.
    pub fn is_removed(&self, today: NaiveDate) -> bool {
        self.deprecated && self.sunset.is_some_and(|sunset| today > sunset)
    }
}

// ---------------------------------------------------------------------------
// Principal
// ---------------------------------------------------------------------------

/// Kind of authenticated party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    /// A human operator, issued a token via `/auth`.
    Human,
    /// An automated agent, issued a token via `/auth/agent`.
    Agent,
}

/// The authenticated party bound to a bearer token.
///
/// Principals are immutable after issuance: scopes never grow, and an
/// expired principal resolves as absent rather than being mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// The opaque bearer token, prefixed `demo_` or `agent_`.
    pub token: String,
    /// Whether this is a human or agent principal.
    pub kind: PrincipalKind,
    /// Stable subject identifier (e.g. a patron id) used for idempotency keying.
    pub subject: String,
    /// The scopes granted to this principal.
    pub scopes: BTreeSet<String>,
    /// Unix timestamp (seconds) after which this principal resolves as absent.
    pub expires_at: i64,
}

impl Principal {
    /// Returns `true` if `now` (unix seconds) is at or past `expires_at`.
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Check that every scope in `required` is present. Returns the sorted
    /// set of missing scopes when the check fails.
    pub fn check_scopes<'a, I>(&self, required: I) -> Result<(), Vec<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let missing: Vec<String> = required
            .into_iter()
            .filter(|s| !self.scopes.contains(*s))
            .map(str::to_string)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            let mut missing = missing;
            missing.sort();
            missing.dedup();
            Err(missing)
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// Completion state of a single [`Chunk`] in a chunked result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    /// More chunks follow; `cursor` selects the next one.
    Partial,
    /// This is the final chunk; `cursor` is `null`.
    Complete,
}

/// One slice of a completed async result, linked to its predecessor by a
/// SHA-256 checksum chain.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Chunk {
    /// Byte offset of `data` within the serialized complete result.
    pub offset: u64,
    /// The chunk's payload.
    pub data: String,
    /// `sha256:<hex>` of `data`.
    pub checksum: String,
    /// The previous chunk's checksum, or `None` for the first chunk.
    pub checksum_previous: Option<String>,
    /// Whether more chunks follow.
    pub state: ChunkState,
    /// Opaque cursor selecting the next chunk, `None` on the final chunk.
    pub cursor: Option<String>,
}

/// Compute the `sha256:<hex>` checksum of `data`, in the form stored on
/// [`Chunk::checksum`].
pub fn sha256_checksum(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

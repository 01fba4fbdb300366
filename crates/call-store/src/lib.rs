//! The async operation instance store.
//!
//! One [`InstanceStore`] lives in the composition root and backs every
//! `async`-execution-model operation: `create` allocates a requestId in
//! state `accepted`; `transition_to_pending`/`complete`/`fail` progress it;
//! `lookup` and `chunk_at` serve the polling endpoints without touching the
//! dispatcher pipeline again.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use call_core::{sha256_checksum, Chunk, ChunkState, OperationId};
use call_error::CallError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lifecycle state of an [`OperationInstance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Created, work not yet started.
    Accepted,
    /// Background work is in progress.
    Pending,
    /// Finished successfully; `result`/`chunks` are populated.
    Complete,
    /// Finished with a domain or infrastructure failure.
    Error,
}

impl InstanceState {
    /// `true` for [`InstanceState::Complete`] and [`InstanceState::Error`].
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// The states `self` may legally transition to.
    pub fn valid_transitions(&self) -> &'static [InstanceState] {
        match self {
            Self::Accepted => &[Self::Pending, Self::Complete, Self::Error],
            Self::Pending => &[Self::Complete, Self::Error],
            Self::Complete | Self::Error => &[],
        }
    }

    /// `true` if transitioning from `self` to `next` is permitted.
    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// A server-side record of one async operation invocation.
#[derive(Debug, Clone)]
pub struct OperationInstance {
    /// The requestId this instance is keyed by.
    pub request_id: Uuid,
    /// The operation that produced this instance.
    pub op: OperationId,
    /// Current lifecycle state.
    pub state: InstanceState,
    /// The serialized result, once `state == Complete`.
    pub result: Option<Value>,
    /// The terminal error, once `state == Error`.
    pub error: Option<CallError>,
    /// The chunked result, once `state == Complete`.
    pub chunks: Option<Vec<Chunk>>,
    /// Unix-seconds creation time.
    pub created_at: i64,
    /// Unix-seconds expiry; the instance is reaped at or after this time.
    pub expires_at: i64,
    /// Hint for how soon the client should poll again.
    pub retry_after_ms: u64,
}

/// Failure modes surfaced by [`InstanceStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No live instance exists for the given requestId.
    #[error("no instance exists for requestId {0}")]
    NotFound(Uuid),
    /// The requested state transition is not permitted from the current state.
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current state.
        from: InstanceState,
        /// Attempted next state.
        to: InstanceState,
    },
    /// Chunks were requested for an instance that has not completed.
    #[error("instance {0} has not completed; no chunks are available yet")]
    NotComplete(Uuid),
    /// The supplied cursor does not match any chunk boundary.
    #[error("cursor does not match any chunk boundary")]
    InvalidCursor,
}

/// A per-instance handle: the top-level map only ever hands out clones of
/// this `Arc`, so a writer transitioning instance A never blocks a reader
/// polling instance B.
type InstanceHandle = Arc<RwLock<OperationInstance>>;

/// Process-wide map from requestId to [`OperationInstance`].
///
/// Locking is two-level: the outer [`RwLock`] guards only the map's shape
/// (insertion in `create`, removal in `lookup`/`sweep`) and is held just
/// long enough to clone out an `Arc`; the inner per-instance `RwLock` guards
/// that one instance's fields. A `complete`/`fail` write on one requestId
/// never contends with a `lookup`/`chunk_at` read on another.
pub struct InstanceStore {
    instances: RwLock<HashMap<Uuid, InstanceHandle>>,
    chunk_size_bytes: usize,
}

impl InstanceStore {
    /// Construct an empty store, chunking completed results into pieces of
    /// at most `chunk_size_bytes`.
    pub fn new(chunk_size_bytes: usize) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            chunk_size_bytes: chunk_size_bytes.max(1),
        }
    }

    /// Create an instance keyed by `request_id` in state `accepted`.
    ///
    /// `request_id` is supplied by the caller rather than minted here: the
    /// dispatcher resolves it once (echoed from `ctx.requestId` or freshly
    /// minted) and that same id must key both the top-level envelope and
    /// the `/ops/{requestId}` location.
    pub async fn create(
        &self,
        request_id: Uuid,
        op: OperationId,
        now: i64,
        ttl_seconds: u64,
        retry_after_ms: u64,
    ) -> OperationInstance {
        let instance = OperationInstance {
            request_id,
            op,
            state: InstanceState::Accepted,
            result: None,
            error: None,
            chunks: None,
            created_at: now,
            expires_at: now + ttl_seconds as i64,
            retry_after_ms,
        };
        self.instances
            .write()
            .await
            .insert(request_id, Arc::new(RwLock::new(instance.clone())));
        debug!(request_id = %instance.request_id, op = %instance.op, "accepted async instance");
        instance
    }

    /// Move an instance from `accepted` to `pending`.
    pub async fn transition_to_pending(&self, request_id: Uuid) -> Result<(), StoreError> {
        let handle = self.handle(request_id).await?;
        let mut instance = handle.write().await;
        transition(&instance, InstanceState::Pending)?;
        instance.state = InstanceState::Pending;
        Ok(())
    }

    /// Mark an instance complete, chunking `result` for later retrieval.
    pub async fn complete(&self, request_id: Uuid, result: Value) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(&result).unwrap_or_else(|_| "null".to_string());
        let chunks = build_chunks(&serialized, self.chunk_size_bytes);
        let handle = self.handle(request_id).await?;
        let mut instance = handle.write().await;
        transition(&instance, InstanceState::Complete)?;
        instance.state = InstanceState::Complete;
        instance.result = Some(result);
        instance.chunks = Some(chunks);
        Ok(())
    }

    /// Mark an instance failed.
    pub async fn fail(&self, request_id: Uuid, error: CallError) -> Result<(), StoreError> {
        let handle = self.handle(request_id).await?;
        let mut instance = handle.write().await;
        transition(&instance, InstanceState::Error)?;
        instance.state = InstanceState::Error;
        instance.error = Some(error);
        Ok(())
    }

    /// Look up an instance by requestId. Returns `None` if unknown or past
    /// `expires_at`; an expired instance found this way is evicted.
    pub async fn lookup(&self, request_id: Uuid, now: i64) -> Option<OperationInstance> {
        let handle = self.instances.read().await.get(&request_id)?.clone();
        {
            let instance = handle.read().await;
            if instance.expires_at > now {
                return Some(instance.clone());
            }
        }
        self.instances.write().await.remove(&request_id);
        warn!(%request_id, "instance expired on lookup");
        None
    }

    /// Fetch exactly one chunk, selecting the head when `cursor` is absent.
    pub async fn chunk_at(
        &self,
        request_id: Uuid,
        cursor: Option<&str>,
        now: i64,
    ) -> Result<Chunk, StoreError> {
        let instance = self
            .lookup(request_id, now)
            .await
            .ok_or(StoreError::NotFound(request_id))?;
        let chunks = instance
            .chunks
            .as_ref()
            .ok_or(StoreError::NotComplete(request_id))?;
        match cursor {
            None => chunks.first().cloned().ok_or(StoreError::InvalidCursor),
            Some(cursor) => {
                let offset: u64 = cursor.parse().map_err(|_| StoreError::InvalidCursor)?;
                chunks
                    .iter()
                    .find(|c| c.offset == offset)
                    .cloned()
                    .ok_or(StoreError::InvalidCursor)
            }
        }
    }

    /// Remove every instance whose `expires_at` has passed. Returns the
    /// number of instances removed.
    pub async fn sweep(&self, now: i64) -> usize {
        let expired: Vec<Uuid> = {
            let mut ids = Vec::new();
            for (id, handle) in self.instances.read().await.iter() {
                if handle.read().await.expires_at <= now {
                    ids.push(*id);
                }
            }
            ids
        };
        if expired.is_empty() {
            return 0;
        }
        let mut guard = self.instances.write().await;
        for id in &expired {
            guard.remove(id);
        }
        expired.len()
    }

    async fn handle(&self, request_id: Uuid) -> Result<InstanceHandle, StoreError> {
        self.instances
            .read()
            .await
            .get(&request_id)
            .cloned()
            .ok_or(StoreError::NotFound(request_id))
    }
}

fn transition(instance: &OperationInstance, next: InstanceState) -> Result<(), StoreError> {
    if instance.state.can_transition_to(next) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            from: instance.state,
            to: next,
        })
    }
}

/// Split `serialized` into chunks of at most `chunk_size_bytes`, linking
/// each to its predecessor by SHA-256 checksum. Always produces at least
/// one chunk, even for empty input.
fn build_chunks(serialized: &str, chunk_size_bytes: usize) -> Vec<Chunk> {
    let bounds = chunk_bounds(serialized, chunk_size_bytes);
    let last = bounds.len() - 1;
    let mut prev_checksum: Option<String> = None;
    bounds
        .iter()
        .enumerate()
        .map(|(i, &(start, end))| {
            let data = serialized[start..end].to_string();
            let checksum = sha256_checksum(&data);
            let checksum_previous = prev_checksum.replace(checksum.clone());
            let is_last = i == last;
            Chunk {
                offset: start as u64,
                data,
                checksum,
                checksum_previous,
                state: if is_last {
                    ChunkState::Complete
                } else {
                    ChunkState::Partial
                },
                cursor: if is_last { None } else { Some(end.to_string()) },
            }
        })
        .collect()
}

fn chunk_bounds(serialized: &str, chunk_size_bytes: usize) -> Vec<(usize, usize)> {
    let total = serialized.len();
    if total == 0 {
        return vec![(0, 0)];
    }
    let mut bounds = Vec::new();
    let mut start = 0;
    while start < total {
        let mut end = (start + chunk_size_bytes).min(total);
        while end < total && !serialized.is_char_boundary(end) {
            end += 1;
        }
        bounds.push((start, end));
        start = end;
    }
    bounds
}

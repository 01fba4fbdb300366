//! Immutable operation descriptor registry.
//!
//! A [`Registry`] is built once at process start from a fixed set of
//! [`OperationDescriptor`]s and never mutates afterward: lookups are plain
//! map reads with no locking. The registry also serializes its own
//! discovery document once and caches an entity tag over the bytes, so the
//! HTTP surface can answer conditional `GET /.well-known/ops` requests
//! without recomputing anything.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use call_core::{OperationDescriptor, OperationId, CALL_VERSION};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// The `/.well-known/ops` discovery document.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DiscoveryDocument {
    /// Stable protocol version string, e.g. `"2026-01-15"`.
    pub call_version: String,
    /// Every registered operation's descriptor, in registration order.
    pub operations: Vec<OperationDescriptor>,
}

/// Immutable table of operation descriptors, keyed by [`OperationId`].
pub struct Registry {
    descriptors: HashMap<OperationId, OperationDescriptor>,
    order: Vec<OperationId>,
    document_bytes: Vec<u8>,
    etag: String,
}

impl Registry {
    /// Build a registry from a fixed set of descriptors.
    ///
    /// The discovery document is serialized once here; later calls to
    /// [`Registry::document_bytes`] and [`Registry::etag`] are free.
    pub fn new(descriptors: Vec<OperationDescriptor>) -> Self {
        let order: Vec<OperationId> = descriptors.iter().map(|d| d.op.clone()).collect();
        let map: HashMap<OperationId, OperationDescriptor> = descriptors
            .into_iter()
            .map(|d| (d.op.clone(), d))
            .collect();
        let ordered: Vec<OperationDescriptor> =
            order.iter().map(|id| map[id].clone()).collect();

        let document = DiscoveryDocument {
            call_version: CALL_VERSION.to_string(),
            operations: ordered,
        };
        let document_bytes =
            serde_json::to_vec(&document).expect("discovery document always serializes");
        let etag = format!("\"{}\"", hex::encode_sha256(&document_bytes));

        Self {
            descriptors: map,
            order,
            document_bytes,
            etag,
        }
    }

    /// Look up a descriptor by operation id.
    pub fn lookup(&self, op: &OperationId) -> Option<&OperationDescriptor> {
        self.descriptors.get(op)
    }

    /// The number of registered operations.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// `true` if no operations are registered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The serialized discovery document bytes.
    pub fn document_bytes(&self) -> &[u8] {
        &self.document_bytes
    }

    /// The entity tag over the discovery document, quoted per RFC 9110.
    pub fn etag(&self) -> &str {
        &self.etag
    }

    /// `true` if the supplied `If-None-Match` value matches this registry's etag.
    pub fn matches_etag(&self, if_none_match: &str) -> bool {
        if_none_match
            .split(',')
            .map(str::trim)
            .any(|candidate| candidate == self.etag || candidate == "*")
    }
}

mod hex {
    use super::*;

    pub fn encode_sha256(bytes: &[u8]) -> String {
        let digest = Sha256::digest(bytes);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use call_core::{CachingPolicy, ExecutionModel};
    use serde_json::json;

    fn sample(op: &str) -> OperationDescriptor {
        OperationDescriptor {
            op: op.parse().unwrap(),
            summary: "demo operation".into(),
            args_schema: json!({"type": "object"}),
            result_schema: json!({"type": "object"}),
            side_effecting: false,
            idempotency_required: false,
            execution_model: ExecutionModel::Sync,
            max_sync_ms: 500,
            ttl_seconds: 60,
            auth_scopes: vec![],
            caching_policy: CachingPolicy::NoStore,
            deprecated: false,
            sunset: None,
            replacement: None,
        }
    }

    #[test]
    fn lookup_finds_registered_operation() {
        let reg = Registry::new(vec![sample("v1:catalog.list")]);
        let id: OperationId = "v1:catalog.list".parse().unwrap();
        assert!(reg.lookup(&id).is_some());
    }

    #[test]
    fn lookup_misses_unregistered_operation() {
        let reg = Registry::new(vec![sample("v1:catalog.list")]);
        let id: OperationId = "v1:catalog.get".parse().unwrap();
        assert!(reg.lookup(&id).is_none());
    }

    #[test]
    fn document_contains_call_version_and_operations() {
        let reg = Registry::new(vec![sample("v1:catalog.list")]);
        let doc: DiscoveryDocument = serde_json::from_slice(reg.document_bytes()).unwrap();
        assert_eq!(doc.call_version, CALL_VERSION);
        assert_eq!(doc.operations.len(), 1);
    }

    #[test]
    fn etag_is_stable_across_builds_of_same_content() {
        let a = Registry::new(vec![sample("v1:catalog.list")]);
        let b = Registry::new(vec![sample("v1:catalog.list")]);
        assert_eq!(a.etag(), b.etag());
    }

    #[test]
    fn etag_differs_for_different_content() {
        let a = Registry::new(vec![sample("v1:catalog.list")]);
        let b = Registry::new(vec![sample("v1:catalog.get")]);
        assert_ne!(a.etag(), b.etag());
    }

    #[test]
    fn matches_etag_honors_exact_match() {
        let reg = Registry::new(vec![sample("v1:catalog.list")]);
        assert!(reg.matches_etag(reg.etag()));
        assert!(!reg.matches_etag("\"not-the-etag\""));
    }

    #[test]
    fn matches_etag_honors_wildcard() {
        let reg = Registry::new(vec![sample("v1:catalog.list")]);
        assert!(reg.matches_etag("*"));
    }

    #[test]
    fn matches_etag_handles_comma_separated_list() {
        let reg = Registry::new(vec![sample("v1:catalog.list")]);
        let header = format!("\"stale-tag\", {}", reg.etag());
        assert!(reg.matches_etag(&header));
    }

    #[test]
    fn empty_registry_reports_empty() {
        let reg = Registry::new(vec![]);
        assert!(reg.is_empty());
        assert_eq!(reg.len(), 0);
    }
}

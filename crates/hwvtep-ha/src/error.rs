//! Error types for the HA engine.
//!
//! No error here is fatal to the process: each one is logged by the worker
//! that hit it and recovery waits for the next change notification.

use hwvtep_store::StoreError;
use hwvtep_types::NodeId;
use thiserror::Error;

/// Result type alias for HA engine operations.
pub type HaResult<T> = Result<T, HaError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HaError {
    /// A read or commit against the store failed.
    #[error("Store operation failed during {operation}: {source}")]
    TransientStoreFailure {
        /// What the engine was doing.
        operation: String,
        #[source]
        source: StoreError,
    },

    /// Device metadata names a device that is not known (yet).
    #[error("Node {node} references unknown HA device {reference}")]
    UnresolvableRelationship { node: NodeId, reference: NodeId },

    /// Bridge inclusion and exclusion lists are both set.
    #[error("Bridge reconciliation has both inclusion {inclusion:?} and exclusion {exclusion:?}")]
    ContradictoryReconciliationConfig {
        inclusion: Vec<String>,
        exclusion: Vec<String>,
    },

    /// An expected object is not present in the store.
    #[error("{kind} {id} not found")]
    LookupMiss { kind: &'static str, id: NodeId },

    /// The deferred termination point reconciler is no longer running.
    #[error("Termination point reconciler stopped")]
    ReconcilerStopped,
}

impl HaError {
    /// Wraps a store error with the operation that hit it.
    pub fn store(operation: impl Into<String>, source: StoreError) -> Self {
        Self::TransientStoreFailure {
            operation: operation.into(),
            source,
        }
    }

    pub fn lookup_miss(kind: &'static str, id: &NodeId) -> Self {
        Self::LookupMiss {
            kind,
            id: id.clone(),
        }
    }

    /// Returns true if the condition may clear on a later notification.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HaError::TransientStoreFailure { .. }
                | HaError::UnresolvableRelationship { .. }
                | HaError::LookupMiss { .. }
        )
    }
}

impl From<StoreError> for HaError {
    fn from(source: StoreError) -> Self {
        HaError::store("store access", source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HaError::lookup_miss("bridge", &NodeId::new("ovsdb://s1/bridge/br0"));
        assert_eq!(err.to_string(), "bridge ovsdb://s1/bridge/br0 not found");

        let err = HaError::store("commit", StoreError::commit_failed("conflict"));
        assert_eq!(
            err.to_string(),
            "Store operation failed during commit: Commit failed: conflict"
        );
    }

    #[test]
    fn test_is_retryable() {
        assert!(HaError::from(StoreError::commit_failed("x")).is_retryable());
        assert!(HaError::UnresolvableRelationship {
            node: NodeId::new("hwvtep://s1"),
            reference: NodeId::new("hwvtep://ha1"),
        }
        .is_retryable());
        assert!(!HaError::ContradictoryReconciliationConfig {
            inclusion: vec!["br1".to_string()],
            exclusion: vec!["br2".to_string()],
        }
        .is_retryable());
        assert!(!HaError::ReconcilerStopped.is_retryable());
    }
}

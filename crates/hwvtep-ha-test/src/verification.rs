//! Verification helpers for HA engine tests
//!
//! The engine reacts to commits on its own tasks, so most checks poll until
//! the expected state shows up or a deadline passes.

use hwvtep_store::Datastore;
use hwvtep_types::{Node, NodeId};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::TestStore;

/// Default time to wait for an asynchronous outcome
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Verification error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Expected node '{id}' not found in {datastore}")]
    NodeNotFound { datastore: Datastore, id: NodeId },

    #[error("Node '{id}' unexpectedly present in {datastore}")]
    UnexpectedNode { datastore: Datastore, id: NodeId },

    #[error("Expected {expected} {what} on '{id}', found {actual}")]
    CountMismatch {
        id: NodeId,
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Polls `check` until it returns true or `timeout` passes.
pub async fn eventually<F>(what: &str, timeout: Duration, mut check: F) -> VerifyResult<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            debug!(what, "verification timed out");
            return Err(VerificationError::Timeout {
                what: what.to_string(),
                waited: timeout,
            });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Store state verifier
pub struct StoreVerifier<'a> {
    store: &'a TestStore,
}

impl<'a> StoreVerifier<'a> {
    pub fn new(store: &'a TestStore) -> Self {
        Self { store }
    }

    /// Verify that a node exists and return it
    pub fn assert_node_exists(&self, datastore: Datastore, id: &NodeId) -> VerifyResult<Node> {
        self.store
            .get(datastore, id)
            .ok_or_else(|| VerificationError::NodeNotFound {
                datastore,
                id: id.clone(),
            })
    }

    pub fn assert_node_absent(&self, datastore: Datastore, id: &NodeId) -> VerifyResult<()> {
        match self.store.get(datastore, id) {
            Some(_) => Err(VerificationError::UnexpectedNode {
                datastore,
                id: id.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Verify the number of logical switches on a device
    pub fn assert_logical_switch_count(
        &self,
        datastore: Datastore,
        id: &NodeId,
        expected: usize,
    ) -> VerifyResult<()> {
        let node = self.assert_node_exists(datastore, id)?;
        let actual = node.global.map(|g| g.logical_switches.len()).unwrap_or(0);
        if actual != expected {
            return Err(VerificationError::CountMismatch {
                id: id.clone(),
                what: "logical switches",
                expected,
                actual,
            });
        }
        Ok(())
    }

    pub fn assert_tp_count(&self, datastore: Datastore, id: &NodeId, expected: usize) -> VerifyResult<()> {
        let node = self.assert_node_exists(datastore, id)?;
        let actual = node.termination_points.len();
        if actual != expected {
            return Err(VerificationError::CountMismatch {
                id: id.clone(),
                what: "termination points",
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Wait until a node exists and return it
    pub async fn eventually_exists(&self, datastore: Datastore, id: &NodeId) -> VerifyResult<Node> {
        eventually(&format!("{} in {}", id, datastore), DEFAULT_WAIT, || {
            self.store.get(datastore, id).is_some()
        })
        .await?;
        self.assert_node_exists(datastore, id)
    }

    pub async fn eventually_absent(&self, datastore: Datastore, id: &NodeId) -> VerifyResult<()> {
        eventually(&format!("{} gone from {}", id, datastore), DEFAULT_WAIT, || {
            self.store.get(datastore, id).is_none()
        })
        .await
    }

    /// Wait until a node satisfies `check`
    pub async fn eventually_matches<F>(
        &self,
        datastore: Datastore,
        id: &NodeId,
        what: &str,
        check: F,
    ) -> VerifyResult<Node>
    where
        F: Fn(&Node) -> bool,
    {
        eventually(what, DEFAULT_WAIT, || {
            self.store.get(datastore, id).as_ref().is_some_and(&check)
        })
        .await?;
        self.assert_node_exists(datastore, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeBuilder;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_store_verifier() {
        let store = TestStore::new();
        let id = NodeId::new("hwvtep://s1");
        store
            .apply(
                NodeBuilder::device("hwvtep://s1")
                    .with_logical_switch("ls0", 1)
                    .with_locator("10.0.0.1")
                    .operational(),
            )
            .await
            .unwrap();

        let verifier = StoreVerifier::new(&store);
        assert!(verifier.assert_node_exists(Datastore::Operational, &id).is_ok());
        assert!(verifier.assert_node_absent(Datastore::Config, &id).is_ok());
        assert!(verifier
            .assert_logical_switch_count(Datastore::Operational, &id, 1)
            .is_ok());
        assert_eq!(
            verifier.assert_tp_count(Datastore::Operational, &id, 2),
            Err(VerificationError::CountMismatch {
                id: id.clone(),
                what: "termination points",
                expected: 2,
                actual: 1,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventually_times_out() {
        let result = eventually("never", Duration::from_millis(50), || false).await;
        assert!(matches!(result, Err(VerificationError::Timeout { .. })));
    }
}

//! In-memory store environment for integration tests

use hwvtep_store::{DataBroker, Datastore, MemoryBroker, StoreResult};
use hwvtep_types::{Node, NodeId};
use std::sync::Arc;

use crate::StoreChange;

/// A fresh [`MemoryBroker`] plus helpers for driving it from a test.
#[derive(Debug, Clone)]
pub struct TestStore {
    broker: Arc<MemoryBroker>,
}

impl TestStore {
    /// Creates an empty store. Needs a running tokio runtime.
    pub fn new() -> Self {
        Self {
            broker: MemoryBroker::new(),
        }
    }

    pub fn broker(&self) -> Arc<MemoryBroker> {
        Arc::clone(&self.broker)
    }

    /// The store as the engine sees it.
    pub fn data_broker(&self) -> Arc<dyn DataBroker> {
        self.broker.clone()
    }

    /// Commits one change on its own.
    pub async fn apply(&self, change: StoreChange) -> StoreResult<()> {
        self.broker.commit(vec![change.into_write_op()]).await
    }

    /// Commits several changes as one transaction.
    pub async fn apply_all(&self, changes: Vec<StoreChange>) -> StoreResult<()> {
        let ops = changes.into_iter().map(StoreChange::into_write_op).collect();
        self.broker.commit(ops).await
    }

    pub fn get(&self, datastore: Datastore, id: &NodeId) -> Option<Node> {
        self.broker.get(datastore, id)
    }

    pub fn snapshot(&self, datastore: Datastore) -> Vec<Node> {
        self.broker.snapshot(datastore)
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

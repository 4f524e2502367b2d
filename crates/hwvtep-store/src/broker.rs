//! The store seam: reads, commits and change subscriptions.

use async_trait::async_trait;
use hwvtep_types::{Node, NodeId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{ChangeBatch, Datastore, StoreResult, WriteOp};

/// Access to the transactional, tree-structured store.
///
/// Implementations must apply each `commit` atomically and deliver the
/// resulting change batches to subscribers in commit order.
#[async_trait]
pub trait DataBroker: Send + Sync + 'static {
    /// Reads one node.
    async fn read(&self, datastore: Datastore, id: &NodeId) -> StoreResult<Option<Arc<Node>>>;

    /// Reads every node of a datastore.
    async fn read_all(&self, datastore: Datastore) -> StoreResult<Vec<Arc<Node>>>;

    /// Applies all writes atomically.
    async fn commit(&self, ops: Vec<WriteOp>) -> StoreResult<()>;

    /// Subscribes to change batches committed after this call.
    ///
    /// `capacity` bounds the number of undelivered batches; a full queue
    /// stalls delivery to this subscriber, never the committer.
    fn subscribe(&self, datastore: Datastore, capacity: usize) -> Subscription;
}

/// A bounded stream of change batches with explicit cancellation.
///
/// Dropping the subscription cancels it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    datastore: Datastore,
    rx: mpsc::Receiver<ChangeBatch>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(
        id: u64,
        datastore: Datastore,
        rx: mpsc::Receiver<ChangeBatch>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            datastore,
            rx,
            cancel,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn datastore(&self) -> Datastore {
        self.datastore
    }

    /// Waits for the next batch; `None` once cancelled or closed.
    pub async fn next(&mut self) -> Option<ChangeBatch> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            batch = self.rx.recv() => batch,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

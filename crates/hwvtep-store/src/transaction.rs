//! Read-write transactions and per-worker transaction chains.

use hwvtep_types::{Node, NodeId};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{DataBroker, Datastore, StoreResult, WriteOp};

/// A buffered read-write transaction.
///
/// Writes are kept locally until [`commit`](Transaction::commit); reads see
/// the transaction's own pending writes layered over the store.
pub struct Transaction {
    broker: Arc<dyn DataBroker>,
    ops: Vec<WriteOp>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("pending_ops", &self.ops.len())
            .finish()
    }
}

impl Transaction {
    pub fn new(broker: Arc<dyn DataBroker>) -> Self {
        Self {
            broker,
            ops: Vec::new(),
        }
    }

    /// Opens an independent, empty transaction against the same store.
    pub fn fork(&self) -> Transaction {
        Transaction::new(Arc::clone(&self.broker))
    }

    pub fn broker(&self) -> &Arc<dyn DataBroker> {
        &self.broker
    }

    pub fn put(&mut self, datastore: Datastore, node: Node) {
        self.ops.push(WriteOp::Put { datastore, node });
    }

    pub fn merge(&mut self, datastore: Datastore, node: Node) {
        self.ops.push(WriteOp::Merge { datastore, node });
    }

    pub fn delete(&mut self, datastore: Datastore, id: NodeId) {
        self.ops.push(WriteOp::Delete { datastore, id });
    }

    /// Reads a node, including this transaction's pending writes.
    pub async fn read(&self, datastore: Datastore, id: &NodeId) -> StoreResult<Option<Node>> {
        let mut current = self
            .broker
            .read(datastore, id)
            .await?
            .map(|node| (*node).clone());
        for op in self
            .ops
            .iter()
            .filter(|op| op.datastore() == datastore && op.id() == id)
        {
            current = op.apply(current);
        }
        Ok(current)
    }

    pub fn pending(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Submits all pending writes; an empty transaction is a no-op.
    pub async fn commit(self) -> StoreResult<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        self.broker.commit(self.ops).await
    }
}

#[derive(Debug)]
struct TxChain {
    id: u64,
    submitted: u64,
}

/// A worker-owned transaction chain.
///
/// Transactions handed out by one session are submitted in order. When a
/// submission fails the chain is discarded; the next
/// [`new_transaction`](TxSession::new_transaction) lazily opens a fresh one.
pub struct TxSession {
    name: String,
    broker: Arc<dyn DataBroker>,
    chain: Option<TxChain>,
    chains_created: u64,
}

impl fmt::Debug for TxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxSession")
            .field("name", &self.name)
            .field("chain", &self.chain)
            .field("chains_created", &self.chains_created)
            .finish()
    }
}

impl TxSession {
    pub fn new(name: impl Into<String>, broker: Arc<dyn DataBroker>) -> Self {
        Self {
            name: name.into(),
            broker,
            chain: None,
            chains_created: 0,
        }
    }

    pub fn broker(&self) -> &Arc<dyn DataBroker> {
        &self.broker
    }

    pub fn new_transaction(&mut self) -> Transaction {
        if self.chain.is_none() {
            self.chains_created += 1;
            debug!(session = %self.name, chain = self.chains_created, "opening transaction chain");
            self.chain = Some(TxChain {
                id: self.chains_created,
                submitted: 0,
            });
        }
        Transaction::new(Arc::clone(&self.broker))
    }

    /// Submits a transaction on this chain, discarding the chain on failure.
    pub async fn submit(&mut self, tx: Transaction) -> StoreResult<()> {
        match tx.commit().await {
            Ok(()) => {
                if let Some(chain) = self.chain.as_mut() {
                    chain.submitted += 1;
                }
                Ok(())
            }
            Err(e) => {
                warn!(session = %self.name, error = %e, "transaction chain failed, discarding");
                self.chain = None;
                Err(e)
            }
        }
    }

    /// Drops the current chain without submitting anything.
    pub fn reset(&mut self) {
        if let Some(chain) = self.chain.take() {
            debug!(session = %self.name, chain = chain.id, "transaction chain reset");
        }
    }

    /// Returns the id of the live chain, if one is open.
    pub fn chain_id(&self) -> Option<u64> {
        self.chain.as_ref().map(|c| c.id)
    }

    pub fn chains_created(&self) -> u64 {
        self.chains_created
    }

    /// Transactions committed on the live chain; 0 when none is open.
    pub fn submitted(&self) -> u64 {
        self.chain.as_ref().map_or(0, |c| c.submitted)
    }
}

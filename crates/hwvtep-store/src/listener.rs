//! Change listeners and the per-listener worker loop.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    ChangeBatch, ChangeKind, DataBroker, Datastore, NodeChange, StoreError, Subscription,
    Transaction, TxSession,
};

/// A consumer of change batches on one datastore.
///
/// The worker hands every batch to [`handle_batch`](ChangeListener::handle_batch)
/// together with a fresh transaction from its chain, then commits that
/// transaction before accepting the next batch.
///
/// The default `handle_batch` makes three passes over the batch: created
/// nodes, updated nodes, then deleted nodes.
#[async_trait]
pub trait ChangeListener: Send + 'static {
    type Error: fmt::Display + Send;

    /// Returns the name of this listener (for logging and debugging).
    fn name(&self) -> &str;

    /// Returns the datastore this listener subscribes to.
    fn datastore(&self) -> Datastore;

    async fn handle_connected(
        &mut self,
        _change: &NodeChange,
        _tx: &mut Transaction,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn handle_updated(
        &mut self,
        _change: &NodeChange,
        _tx: &mut Transaction,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn handle_deleted(
        &mut self,
        _change: &NodeChange,
        _tx: &mut Transaction,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn handle_batch(
        &mut self,
        batch: &ChangeBatch,
        tx: &mut Transaction,
    ) -> Result<(), Self::Error> {
        for change in batch.of_kind(ChangeKind::Create) {
            self.handle_connected(change, tx).await?;
        }
        for change in batch.of_kind(ChangeKind::Update) {
            self.handle_updated(change, tx).await?;
        }
        for change in batch.of_kind(ChangeKind::Delete) {
            self.handle_deleted(change, tx).await?;
        }
        Ok(())
    }

    /// Called after the batch's transaction committed.
    async fn on_committed(&mut self) {}

    /// Called when the batch was abandoned (handler error or failed commit).
    async fn on_abandoned(&mut self) {}
}

/// Worker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Bound of the listener's subscription queue.
    pub queue_capacity: usize,
    /// Bound on each commit; `None` waits for the store indefinitely.
    pub commit_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            commit_timeout: None,
        }
    }
}

/// Worker statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Batches taken off the queue.
    pub batches_received: u64,
    /// Batches whose transaction committed.
    pub batches_committed: u64,
    /// Batches dropped after a handler error or failed commit.
    pub batches_abandoned: u64,
    /// Node changes seen across all batches.
    pub changes_seen: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Committed,
    Abandoned,
}

/// Drives one [`ChangeListener`] with strictly serialized batches.
pub struct ListenerWorker<L: ChangeListener> {
    name: String,
    listener: L,
    session: TxSession,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<L: ChangeListener> fmt::Debug for ListenerWorker<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerWorker")
            .field("name", &self.name)
            .field("session", &self.session)
            .field("config", &self.config)
            .field("stats", &*self.stats.lock())
            .finish()
    }
}

impl<L: ChangeListener> ListenerWorker<L> {
    pub fn new(listener: L, broker: Arc<dyn DataBroker>, config: WorkerConfig) -> Self {
        let name = listener.name().to_string();
        Self {
            session: TxSession::new(name.clone(), broker),
            name,
            listener,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn session(&self) -> &TxSession {
        &self.session
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().clone()
    }

    /// Subscribes and starts the worker on its own task.
    ///
    /// The subscription is registered before this returns, so no batch
    /// committed afterwards is missed.
    pub fn spawn(self, cancel: CancellationToken) -> WorkerHandle<L> {
        let subscription = self
            .session
            .broker()
            .subscribe(self.listener.datastore(), self.config.queue_capacity);
        let name = self.name.clone();
        let stats = Arc::clone(&self.stats);
        let join = tokio::spawn(self.run(subscription, cancel));
        WorkerHandle { name, stats, join }
    }

    #[instrument(skip_all, fields(listener = %self.name))]
    async fn run(mut self, mut subscription: Subscription, cancel: CancellationToken) -> L {
        info!(datastore = %subscription.datastore(), "listener worker started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                batch = subscription.next() => match batch {
                    Some(batch) => {
                        self.process_batch(&batch).await;
                    }
                    None => break,
                },
            }
        }
        subscription.cancel();
        info!("listener worker stopped");
        self.listener
    }

    /// Handles and commits one batch.
    pub async fn process_batch(&mut self, batch: &ChangeBatch) -> BatchOutcome {
        {
            let mut stats = self.stats.lock();
            stats.batches_received += 1;
            stats.changes_seen += batch.changes.len() as u64;
        }
        debug!(seq = batch.seq, changes = batch.changes.len(), "processing batch");

        let mut tx = self.session.new_transaction();
        if let Err(e) = self.listener.handle_batch(batch, &mut tx).await {
            warn!(seq = batch.seq, error = %e, "batch handling failed, abandoning batch");
            self.session.reset();
            return self.abandon().await;
        }

        let result = match self.config.commit_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.session.submit(tx)).await {
                Ok(result) => result,
                Err(_) => {
                    self.session.reset();
                    Err(StoreError::CommitTimeout { timeout })
                }
            },
            None => self.session.submit(tx).await,
        };

        match result {
            Ok(()) => {
                debug!(
                    seq = batch.seq,
                    chain = ?self.session.chain_id(),
                    submitted = self.session.submitted(),
                    "batch committed"
                );
                self.listener.on_committed().await;
                self.stats.lock().batches_committed += 1;
                BatchOutcome::Committed
            }
            Err(e) => {
                warn!(seq = batch.seq, error = %e, "batch commit failed, abandoning batch");
                self.abandon().await
            }
        }
    }

    async fn abandon(&mut self) -> BatchOutcome {
        self.listener.on_abandoned().await;
        self.stats.lock().batches_abandoned += 1;
        BatchOutcome::Abandoned
    }
}

/// Handle to a spawned [`ListenerWorker`].
#[derive(Debug)]
pub struct WorkerHandle<L> {
    name: String,
    stats: Arc<Mutex<WorkerStats>>,
    join: JoinHandle<L>,
}

impl<L> WorkerHandle<L> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().clone()
    }

    /// Waits for the worker to stop and returns its listener.
    pub async fn join(self) -> Option<L> {
        match self.join.await {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!(listener = %self.name, error = %e, "listener worker panicked");
                None
            }
        }
    }
}

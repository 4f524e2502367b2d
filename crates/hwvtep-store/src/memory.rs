//! In-memory [`DataBroker`].

use async_trait::async_trait;
use hwvtep_types::{Node, NodeId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    ChangeBatch, DataBroker, Datastore, NodeChange, StoreError, StoreResult, Subscription, WriteOp,
};

#[derive(Debug, Default)]
struct StoreState {
    config: BTreeMap<NodeId, Arc<Node>>,
    operational: BTreeMap<NodeId, Arc<Node>>,
    seq: u64,
}

impl StoreState {
    fn tree(&self, datastore: Datastore) -> &BTreeMap<NodeId, Arc<Node>> {
        match datastore {
            Datastore::Config => &self.config,
            Datastore::Operational => &self.operational,
        }
    }

    fn tree_mut(&mut self, datastore: Datastore) -> &mut BTreeMap<NodeId, Arc<Node>> {
        match datastore {
            Datastore::Config => &mut self.config,
            Datastore::Operational => &mut self.operational,
        }
    }
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    datastore: Datastore,
    /// Only batches with a greater sequence number are delivered.
    after_seq: u64,
    tx: mpsc::Sender<ChangeBatch>,
    cancel: CancellationToken,
}

impl Subscriber {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }
}

type Subscribers = Arc<Mutex<Vec<Subscriber>>>;

/// A two-tree in-memory store.
///
/// Commits are applied under a single write lock and produce one
/// [`ChangeBatch`] per touched datastore. Writes that leave a node unchanged
/// produce no notification. Batches are fanned out by a background notifier
/// task, so a committer never waits on its own subscription queue.
#[derive(Debug)]
pub struct MemoryBroker {
    state: RwLock<StoreState>,
    subscribers: Subscribers,
    notify_tx: mpsc::UnboundedSender<ChangeBatch>,
    next_subscriber_id: AtomicU64,
    fail_next: AtomicUsize,
    commits: AtomicU64,
}

impl MemoryBroker {
    /// Creates a broker and spawns its notifier on the current runtime.
    pub fn new() -> Arc<Self> {
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_notifier(notify_rx, Arc::clone(&subscribers)));

        Arc::new(Self {
            state: RwLock::new(StoreState::default()),
            subscribers,
            notify_tx,
            next_subscriber_id: AtomicU64::new(1),
            fail_next: AtomicUsize::new(0),
            commits: AtomicU64::new(0),
        })
    }

    /// Makes the next `n` non-empty commits fail without applying anything.
    pub fn fail_next_commits(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Returns a copy of one node.
    pub fn get(&self, datastore: Datastore, id: &NodeId) -> Option<Node> {
        self.state
            .read()
            .tree(datastore)
            .get(id)
            .map(|node| (**node).clone())
    }

    /// Returns a copy of every node of a datastore, ordered by id.
    pub fn snapshot(&self, datastore: Datastore) -> Vec<Node> {
        self.state
            .read()
            .tree(datastore)
            .values()
            .map(|node| (**node).clone())
            .collect()
    }

    /// Returns the number of live subscriptions on a datastore.
    pub fn subscriber_count(&self, datastore: Datastore) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|s| s.datastore == datastore && s.is_live())
            .count()
    }

    /// Returns the number of successfully applied commits.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DataBroker for MemoryBroker {
    async fn read(&self, datastore: Datastore, id: &NodeId) -> StoreResult<Option<Arc<Node>>> {
        Ok(self.state.read().tree(datastore).get(id).cloned())
    }

    async fn read_all(&self, datastore: Datastore) -> StoreResult<Vec<Arc<Node>>> {
        Ok(self.state.read().tree(datastore).values().cloned().collect())
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        if self.take_injected_failure() {
            debug!(ops = ops.len(), "rejecting commit (injected failure)");
            return Err(StoreError::commit_failed("injected failure"));
        }

        let mut state = self.state.write();

        // (datastore, id) -> (before, working copy)
        let mut touched: BTreeMap<(Datastore, NodeId), (Option<Arc<Node>>, Option<Node>)> =
            BTreeMap::new();
        for op in &ops {
            let datastore = op.datastore();
            let entry = touched
                .entry((datastore, op.id().clone()))
                .or_insert_with(|| {
                    let before = state.tree(datastore).get(op.id()).cloned();
                    let working = before.as_ref().map(|node| (**node).clone());
                    (before, working)
                });
            entry.1 = op.apply(entry.1.take());
        }

        let mut batches: BTreeMap<Datastore, Vec<NodeChange>> = BTreeMap::new();
        for ((datastore, id), (before, after)) in touched {
            let after = after.map(Arc::new);
            let Some(change) = NodeChange::from_transition(id.clone(), before, after.clone())
            else {
                continue;
            };
            let tree = state.tree_mut(datastore);
            match after {
                Some(node) => {
                    tree.insert(id, node);
                }
                None => {
                    tree.remove(&id);
                }
            }
            batches.entry(datastore).or_default().push(change);
        }

        for (datastore, changes) in batches {
            state.seq += 1;
            trace!(%datastore, seq = state.seq, changes = changes.len(), "committed batch");
            // Sent under the write lock so batches leave in commit order
            let _ = self.notify_tx.send(ChangeBatch {
                datastore,
                seq: state.seq,
                changes,
            });
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe(&self, datastore: Datastore, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let after_seq = self.state.read().seq;

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(Subscriber::is_live);
        subscribers.push(Subscriber {
            id,
            datastore,
            after_seq,
            tx,
            cancel: cancel.clone(),
        });
        debug!(%datastore, subscription = id, "subscribed");

        Subscription::new(id, datastore, rx, cancel)
    }
}

async fn run_notifier(mut rx: mpsc::UnboundedReceiver<ChangeBatch>, subscribers: Subscribers) {
    while let Some(batch) = rx.recv().await {
        let targets: Vec<(u64, mpsc::Sender<ChangeBatch>, CancellationToken)> = {
            let mut subscribers = subscribers.lock();
            subscribers.retain(Subscriber::is_live);
            subscribers
                .iter()
                .filter(|s| s.datastore == batch.datastore && batch.seq > s.after_seq)
                .map(|s| (s.id, s.tx.clone(), s.cancel.clone()))
                .collect()
        };

        for (id, tx, cancel) in targets {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    trace!(subscription = id, "skipping cancelled subscriber");
                }
                sent = tx.send(batch.clone()) => {
                    if sent.is_err() {
                        debug!(subscription = id, "subscriber went away");
                    }
                }
            }
        }
    }
}

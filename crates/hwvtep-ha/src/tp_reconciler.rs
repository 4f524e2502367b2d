//! Deferred termination point reconciliation.
//!
//! Termination points of a bridge that is not in the operational datastore
//! yet are parked here until the bridge shows up, then replayed exactly
//! once. Entries that wait longer than the cache timeout are dropped.
//!
//! ```text
//!  defer(bridge) ──> PendingTpCache ──(bridge created)──> replay, entry gone
//!                          │
//!                          └──(timeout)──> dropped with a warning
//! ```
//!
//! The operational subscription only exists while something is pending.

use hwvtep_store::{ChangeBatch, ChangeKind, DataBroker, Datastore, Subscription, TxSession};
use hwvtep_types::{NodeId, TerminationPoint};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::reconciliation::DeferredTps;
use crate::{DeviceTransactor, HaError, HaResult};

/// Default time a deferred entry waits for its bridge.
pub const DEFAULT_TP_CACHE_TIMEOUT: Duration = Duration::from_secs(60);

const COMMAND_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub device: NodeId,
    pub termination_points: Vec<TerminationPoint>,
    pub expires_at: Instant,
}

/// Pending termination points keyed by bridge, with expiry.
#[derive(Debug)]
pub struct PendingTpCache {
    ttl: Duration,
    entries: HashMap<NodeId, PendingEntry>,
    deadlines: BinaryHeap<Reverse<(Instant, NodeId)>>,
}

impl PendingTpCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            deadlines: BinaryHeap::new(),
        }
    }

    /// Parks `tps` for `bridge`, replacing any earlier entry.
    pub fn insert(&mut self, bridge: NodeId, device: NodeId, tps: Vec<TerminationPoint>, now: Instant) {
        let expires_at = now + self.ttl;
        self.deadlines.push(Reverse((expires_at, bridge.clone())));
        self.entries.insert(
            bridge,
            PendingEntry {
                device,
                termination_points: tps,
                expires_at,
            },
        );
    }

    pub fn take(&mut self, bridge: &NodeId) -> Option<PendingEntry> {
        self.entries.remove(bridge)
    }

    pub fn contains(&self, bridge: &NodeId) -> bool {
        self.entries.contains_key(bridge)
    }

    /// Removes every entry due at `now`, returning their bridges.
    pub fn expire(&mut self, now: Instant) -> Vec<NodeId> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, _))) = self.deadlines.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((deadline, bridge))) = self.deadlines.pop() else {
                break;
            };
            // Only the newest deadline of a re-inserted entry counts.
            if self.entries.get(&bridge).is_some_and(|e| e.expires_at == deadline) {
                self.entries.remove(&bridge);
                expired.push(bridge);
            }
        }
        expired
    }

    /// Earliest deadline of a live entry.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, bridge))) = self.deadlines.peek() {
            if self.entries.get(bridge).is_some_and(|e| e.expires_at == *deadline) {
                return Some(*deadline);
            }
            self.deadlines.pop();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bridges(&self) -> Vec<NodeId> {
        let mut bridges: Vec<NodeId> = self.entries.keys().cloned().collect();
        bridges.sort();
        bridges
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.deadlines.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpReconcilerStatus {
    pub pending: Vec<NodeId>,
    pub subscribed: bool,
    pub replayed: u64,
    pub expired: u64,
}

enum Command {
    Defer(DeferredTps),
    CancelAll,
    Status(oneshot::Sender<TpReconcilerStatus>),
}

/// Handle to the running reconciler task.
#[derive(Debug, Clone)]
pub struct TpReconcilerHandle {
    commands: mpsc::Sender<Command>,
}

impl TpReconcilerHandle {
    pub async fn defer(&self, deferred: DeferredTps) -> HaResult<()> {
        self.commands
            .send(Command::Defer(deferred))
            .await
            .map_err(|_| HaError::ReconcilerStopped)
    }

    /// Drops every pending entry and the subscription.
    pub async fn cancel_all(&self) -> HaResult<()> {
        self.commands
            .send(Command::CancelAll)
            .await
            .map_err(|_| HaError::ReconcilerStopped)
    }

    pub async fn status(&self) -> HaResult<TpReconcilerStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Status(tx))
            .await
            .map_err(|_| HaError::ReconcilerStopped)?;
        rx.await.map_err(|_| HaError::ReconcilerStopped)
    }
}

pub struct TerminationPointReconciler {
    broker: Arc<dyn DataBroker>,
    transactor: Arc<dyn DeviceTransactor>,
    session: TxSession,
    cache: PendingTpCache,
    subscription: Option<Subscription>,
    queue_capacity: usize,
    replayed: u64,
    expired: u64,
}

impl fmt::Debug for TerminationPointReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminationPointReconciler")
            .field("pending", &self.cache.len())
            .field("subscribed", &self.subscription.is_some())
            .field("replayed", &self.replayed)
            .field("expired", &self.expired)
            .finish()
    }
}

async fn next_batch(subscription: &mut Option<Subscription>) -> Option<ChangeBatch> {
    match subscription {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl TerminationPointReconciler {
    pub fn new(
        broker: Arc<dyn DataBroker>,
        transactor: Arc<dyn DeviceTransactor>,
        ttl: Duration,
        queue_capacity: usize,
    ) -> Self {
        Self {
            session: TxSession::new("tp-reconciler", Arc::clone(&broker)),
            broker,
            transactor,
            cache: PendingTpCache::new(ttl),
            subscription: None,
            queue_capacity,
            replayed: 0,
            expired: 0,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> (TpReconcilerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let join = tokio::spawn(self.run(rx, cancel));
        (TpReconcilerHandle { commands: tx }, join)
    }

    #[instrument(skip_all, name = "tp_reconciler")]
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        debug!("termination point reconciler started");
        loop {
            let deadline = self.cache.next_deadline();
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                batch = next_batch(&mut self.subscription) => match batch {
                    Some(batch) => self.on_batch(&batch).await,
                    None => self.subscription = None,
                },
                () = sleep_until(deadline) => self.expire(),
            }
            if self.cache.is_empty() && self.subscription.take().is_some() {
                debug!("nothing pending, operational subscription dropped");
            }
        }
        self.cache.clear();
        self.subscription = None;
        debug!("termination point reconciler stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Defer(deferred) => self.defer(deferred).await,
            Command::CancelAll => {
                if !self.cache.is_empty() {
                    info!(pending = self.cache.len(), "cancelling deferred termination points");
                }
                self.cache.clear();
                self.subscription = None;
            }
            Command::Status(reply) => {
                let _ = reply.send(TpReconcilerStatus {
                    pending: self.cache.bridges(),
                    subscribed: self.subscription.is_some(),
                    replayed: self.replayed,
                    expired: self.expired,
                });
            }
        }
    }

    async fn defer(&mut self, deferred: DeferredTps) {
        let bridge = deferred.bridge.clone();
        debug!(bridge = %bridge, count = deferred.termination_points.len(), "deferring termination points");
        self.cache.insert(
            deferred.bridge,
            deferred.device,
            deferred.termination_points,
            Instant::now(),
        );
        if self.subscription.is_none() {
            self.subscription = Some(
                self.broker
                    .subscribe(Datastore::Operational, self.queue_capacity),
            );
        }

        // The bridge may have appeared before the subscription existed.
        match self.broker.read(Datastore::Operational, &bridge).await {
            Ok(Some(_)) => self.replay(&bridge).await,
            Ok(None) => {}
            Err(e) => warn!(bridge = %bridge, error = %e, "bridge presence check failed"),
        }
    }

    async fn on_batch(&mut self, batch: &ChangeBatch) {
        let created: Vec<NodeId> = batch
            .of_kind(ChangeKind::Create)
            .filter(|c| self.cache.contains(&c.id))
            .map(|c| c.id.clone())
            .collect();
        for bridge in created {
            self.replay(&bridge).await;
        }
    }

    async fn replay(&mut self, bridge: &NodeId) {
        let Some(entry) = self.cache.take(bridge) else {
            return;
        };
        let mut tx = self.session.new_transaction();
        if let Err(e) = self
            .transactor
            .apply_termination_points(bridge, &entry.termination_points, &mut tx)
            .await
        {
            warn!(bridge = %bridge, error = %e, "termination point replay failed");
            self.session.reset();
            return;
        }
        match self.session.submit(tx).await {
            Ok(()) => {
                self.replayed += 1;
                info!(
                    bridge = %bridge,
                    device = %entry.device,
                    count = entry.termination_points.len(),
                    "deferred termination points replayed"
                );
            }
            Err(e) => warn!(bridge = %bridge, error = %e, "termination point replay commit failed"),
        }
    }

    fn expire(&mut self) {
        for bridge in self.cache.expire(Instant::now()) {
            self.expired += 1;
            warn!(bridge = %bridge, "bridge did not appear in time, deferred termination points dropped");
        }
    }
}

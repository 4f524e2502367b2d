//! Engine lifecycle: starts the listeners and the deferred TP reconciler,
//! and stops them together.

use hwvtep_store::{DataBroker, ListenerWorker, WorkerConfig, WorkerHandle, WorkerStats};
use hwvtep_types::NodeId;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::tp_reconciler::DEFAULT_TP_CACHE_TIMEOUT;
use crate::{
    BridgeReconciler, BridgeSelection, DeviceTransactor, GroupRegistry, GroupState, HaCache,
    HaConfigListener, HaStateMachine, ReconciliationListener, TerminationPointReconciler,
    TpReconcilerHandle,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaEngineConfig {
    pub selection: BridgeSelection,
    pub tp_cache_timeout: Duration,
    pub worker: WorkerConfig,
}

impl Default for HaEngineConfig {
    fn default() -> Self {
        Self {
            selection: BridgeSelection::default(),
            tp_cache_timeout: DEFAULT_TP_CACHE_TIMEOUT,
            worker: WorkerConfig::default(),
        }
    }
}

/// A running engine.
#[derive(Debug)]
pub struct HaEngine {
    cache: Arc<HaCache>,
    groups: Arc<RwLock<GroupRegistry>>,
    tp_reconciler: TpReconcilerHandle,
    cancel: CancellationToken,
    config_worker: WorkerHandle<HaConfigListener>,
    state_worker: WorkerHandle<HaStateMachine>,
    reconcile_worker: WorkerHandle<ReconciliationListener>,
    tp_join: JoinHandle<()>,
}

impl HaEngine {
    /// Subscribes every listener and starts its worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        broker: Arc<dyn DataBroker>,
        transactor: Arc<dyn DeviceTransactor>,
        config: HaEngineConfig,
    ) -> Self {
        let cache = Arc::new(HaCache::new());
        let cancel = CancellationToken::new();

        let (tp_reconciler, tp_join) = TerminationPointReconciler::new(
            Arc::clone(&broker),
            Arc::clone(&transactor),
            config.tp_cache_timeout,
            config.worker.queue_capacity,
        )
        .spawn(cancel.child_token());

        let config_worker = ListenerWorker::new(
            HaConfigListener::new(Arc::clone(&cache)),
            Arc::clone(&broker),
            config.worker.clone(),
        )
        .spawn(cancel.child_token());

        let machine = HaStateMachine::new(Arc::clone(&cache));
        let groups = machine.registry_view();
        let state_worker = ListenerWorker::new(machine, Arc::clone(&broker), config.worker.clone())
            .spawn(cancel.child_token());

        let reconciler = BridgeReconciler::new(config.selection, transactor);
        let reconcile_worker = ListenerWorker::new(
            ReconciliationListener::new(Arc::clone(&cache), reconciler, tp_reconciler.clone()),
            broker,
            config.worker,
        )
        .spawn(cancel.child_token());

        info!("HA engine started");
        Self {
            cache,
            groups,
            tp_reconciler,
            cancel,
            config_worker,
            state_worker,
            reconcile_worker,
            tp_join,
        }
    }

    pub fn cache(&self) -> &Arc<HaCache> {
        &self.cache
    }

    pub fn tp_reconciler(&self) -> &TpReconcilerHandle {
        &self.tp_reconciler
    }

    /// Committed state of `group`.
    pub fn group_state(&self, group: &NodeId) -> GroupState {
        self.groups.read().state(group)
    }

    pub fn live_members(&self, group: &NodeId) -> BTreeSet<NodeId> {
        self.groups.read().live_members(group)
    }

    pub fn worker_stats(&self) -> Vec<(String, WorkerStats)> {
        vec![
            (self.config_worker.name().to_string(), self.config_worker.stats()),
            (self.state_worker.name().to_string(), self.state_worker.stats()),
            (self.reconcile_worker.name().to_string(), self.reconcile_worker.stats()),
        ]
    }

    /// Stops every worker, cancels deferred TP work and clears the cache.
    pub async fn shutdown(self) {
        if let Err(e) = self.tp_reconciler.cancel_all().await {
            warn!(error = %e, "deferred TP reconciler already stopped");
        }
        self.cancel.cancel();

        self.config_worker.join().await;
        self.state_worker.join().await;
        self.reconcile_worker.join().await;
        if let Err(e) = self.tp_join.await {
            warn!(error = %e, "deferred TP reconciler panicked");
        }

        self.cache.clear();
        info!("HA engine stopped");
    }
}

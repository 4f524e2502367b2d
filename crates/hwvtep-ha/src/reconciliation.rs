//! Bridge reconciliation for reconnecting devices.
//!
//! When a non-HA device connects, the bridges its config says it manages
//! are replayed to it through a [`DeviceTransactor`]. Termination points of
//! a bridge that the device does not report yet are handed to the deferred
//! termination point reconciler instead.

use async_trait::async_trait;
use hwvtep_store::{ChangeListener, Datastore, NodeChange, Transaction};
use hwvtep_types::{BridgeAugmentation, Node, NodeId, TerminationPoint};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{HaCache, HaError, HaResult, TpReconcilerHandle};

/// OpenFlow versions accepted in a bridge's protocol list.
pub const SUPPORTED_PROTOCOLS: [&str; 6] = [
    "OpenFlow10",
    "OpenFlow11",
    "OpenFlow12",
    "OpenFlow13",
    "OpenFlow14",
    "OpenFlow15",
];

/// Keeps the supported protocol entries, dropping the rest with a warning.
pub fn supported_protocols(bridge: &NodeId, entries: &[String]) -> Vec<String> {
    entries
        .iter()
        .filter(|p| {
            let ok = SUPPORTED_PROTOCOLS.contains(&p.as_str());
            if !ok {
                warn!(bridge = %bridge, protocol = %p, "skipping unsupported bridge protocol");
            }
            ok
        })
        .cloned()
        .collect()
}

/// Which bridges get reconciled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeSelection {
    pub inclusion: Vec<String>,
    pub exclusion: Vec<String>,
}

/// Result of applying a [`BridgeSelection`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectedBridges {
    pub names: Vec<String>,
    /// Both lists were set; the exclusion list was applied.
    pub conflict: bool,
}

impl BridgeSelection {
    pub fn new(inclusion: Vec<String>, exclusion: Vec<String>) -> Self {
        Self {
            inclusion,
            exclusion,
        }
    }

    pub fn validate(&self) -> HaResult<()> {
        if !self.inclusion.is_empty() && !self.exclusion.is_empty() {
            return Err(HaError::ContradictoryReconciliationConfig {
                inclusion: self.inclusion.clone(),
                exclusion: self.exclusion.clone(),
            });
        }
        Ok(())
    }

    /// Picks bridge names out of `managed`.
    ///
    /// An inclusion list wins over everything managed; otherwise all
    /// managed bridges minus the exclusion list. When both lists are set
    /// the exclusion rule applies.
    pub fn select(&self, managed: &[String]) -> SelectedBridges {
        let conflict = self.validate().is_err();
        let mut seen = BTreeSet::new();
        let names = if !self.inclusion.is_empty() && !conflict {
            self.inclusion
                .iter()
                .filter(|n| seen.insert(n.as_str()))
                .cloned()
                .collect()
        } else {
            managed
                .iter()
                .filter(|n| !self.exclusion.contains(n) && seen.insert(n.as_str()))
                .cloned()
                .collect()
        };
        SelectedBridges { names, conflict }
    }
}

/// Write path to a device.
#[async_trait]
pub trait DeviceTransactor: Send + Sync {
    /// Pushes a bridge, without its termination points, to `device`.
    async fn apply_bridge(&self, device: &NodeId, bridge: &Node, tx: &mut Transaction) -> HaResult<()>;

    /// Pushes termination points of an existing bridge.
    async fn apply_termination_points(
        &self,
        bridge: &NodeId,
        tps: &[TerminationPoint],
        tx: &mut Transaction,
    ) -> HaResult<()>;
}

/// Transactor that lands replays in the operational datastore.
///
/// Writes are merges, so replaying the same content twice is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreTransactor;

#[async_trait]
impl DeviceTransactor for StoreTransactor {
    async fn apply_bridge(&self, device: &NodeId, bridge: &Node, tx: &mut Transaction) -> HaResult<()> {
        let aug = bridge
            .bridge
            .as_ref()
            .ok_or_else(|| HaError::lookup_miss("bridge", &bridge.id))?;
        let mut node = Node::new(bridge.id.clone());
        node.bridge = Some(BridgeAugmentation {
            managed_by: device.clone(),
            ..aug.clone()
        });
        tx.merge(Datastore::Operational, node);
        Ok(())
    }

    async fn apply_termination_points(
        &self,
        bridge: &NodeId,
        tps: &[TerminationPoint],
        tx: &mut Transaction,
    ) -> HaResult<()> {
        let mut node = Node::new(bridge.clone());
        node.termination_points = tps.to_vec();
        tx.merge(Datastore::Operational, node);
        Ok(())
    }
}

/// One replay seen by a [`RecordingTransactor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replay {
    Bridge { device: NodeId, bridge: NodeId },
    TerminationPoints { bridge: NodeId, tp_ids: Vec<String> },
}

/// Transactor that records every replay, optionally forwarding it.
///
/// Without a forward target nothing is written (dry run).
#[derive(Default)]
pub struct RecordingTransactor {
    forward: Option<Arc<dyn DeviceTransactor>>,
    replays: Mutex<Vec<Replay>>,
}

impl fmt::Debug for RecordingTransactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingTransactor")
            .field("forwarding", &self.forward.is_some())
            .field("replays", &self.replays.lock().len())
            .finish()
    }
}

impl RecordingTransactor {
    pub fn dry_run() -> Self {
        Self::default()
    }

    pub fn forwarding(inner: Arc<dyn DeviceTransactor>) -> Self {
        Self {
            forward: Some(inner),
            replays: Mutex::new(Vec::new()),
        }
    }

    pub fn replays(&self) -> Vec<Replay> {
        self.replays.lock().clone()
    }

    /// Number of termination point replays for `bridge`.
    pub fn tp_replays(&self, bridge: &NodeId) -> usize {
        self.replays
            .lock()
            .iter()
            .filter(|r| matches!(r, Replay::TerminationPoints { bridge: b, .. } if b == bridge))
            .count()
    }
}

#[async_trait]
impl DeviceTransactor for RecordingTransactor {
    async fn apply_bridge(&self, device: &NodeId, bridge: &Node, tx: &mut Transaction) -> HaResult<()> {
        info!(device = %device, bridge = %bridge.id, "bridge replay");
        self.replays.lock().push(Replay::Bridge {
            device: device.clone(),
            bridge: bridge.id.clone(),
        });
        match &self.forward {
            Some(inner) => inner.apply_bridge(device, bridge, tx).await,
            None => Ok(()),
        }
    }

    async fn apply_termination_points(
        &self,
        bridge: &NodeId,
        tps: &[TerminationPoint],
        tx: &mut Transaction,
    ) -> HaResult<()> {
        info!(bridge = %bridge, count = tps.len(), "termination point replay");
        self.replays.lock().push(Replay::TerminationPoints {
            bridge: bridge.clone(),
            tp_ids: tps.iter().map(|tp| tp.tp_id.clone()).collect(),
        });
        match &self.forward {
            Some(inner) => inner.apply_termination_points(bridge, tps, tx).await,
            None => Ok(()),
        }
    }
}

/// Termination points waiting for their bridge to appear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredTps {
    pub device: NodeId,
    pub bridge: NodeId,
    pub termination_points: Vec<TerminationPoint>,
}

/// What one device reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub bridges: Vec<NodeId>,
    pub tps_applied: Vec<NodeId>,
    pub deferred: Vec<DeferredTps>,
    pub skipped: Vec<String>,
}

pub struct BridgeReconciler {
    selection: BridgeSelection,
    transactor: Arc<dyn DeviceTransactor>,
}

impl fmt::Debug for BridgeReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeReconciler")
            .field("selection", &self.selection)
            .finish()
    }
}

impl BridgeReconciler {
    pub fn new(selection: BridgeSelection, transactor: Arc<dyn DeviceTransactor>) -> Self {
        if let Err(e) = selection.validate() {
            warn!(error = %e, "bridge selection falls back to the exclusion list");
        }
        Self {
            selection,
            transactor,
        }
    }

    pub fn selection(&self) -> &BridgeSelection {
        &self.selection
    }

    /// Replays the configured bridges of `device`.
    pub async fn reconcile_device(
        &self,
        device: &NodeId,
        tx: &mut Transaction,
    ) -> HaResult<ReconcileReport> {
        let broker = Arc::clone(tx.broker());
        let managed: Vec<Arc<Node>> = broker
            .read_all(Datastore::Config)
            .await
            .map_err(|e| HaError::store("bridge config scan", e))?
            .into_iter()
            .filter(|n| n.bridge.as_ref().is_some_and(|b| &b.managed_by == device))
            .collect();
        let names: Vec<String> = managed
            .iter()
            .filter_map(|n| n.bridge.as_ref().map(|b| b.name.clone()))
            .collect();

        let selected = self.selection.select(&names);
        if selected.conflict {
            warn!(device = %device, "both bridge inclusion and exclusion set, using exclusion");
        }

        let mut report = ReconcileReport::default();
        for name in selected.names {
            let Some(config) = managed
                .iter()
                .find(|n| n.bridge.as_ref().is_some_and(|b| b.name == name))
            else {
                let miss = HaError::lookup_miss("bridge", &device.bridge(&name));
                debug!(error = %miss, "selected bridge not managed by device, skipping");
                report.skipped.push(name);
                continue;
            };

            let present = broker
                .read(Datastore::Operational, &config.id)
                .await
                .map_err(|e| HaError::store("bridge presence check", e))?
                .is_some();

            let mut replay = Node::new(config.id.clone());
            replay.bridge = config.bridge.as_ref().map(|b| BridgeAugmentation {
                protocol_entries: supported_protocols(&config.id, &b.protocol_entries),
                ..b.clone()
            });
            self.transactor.apply_bridge(device, &replay, tx).await?;
            report.bridges.push(config.id.clone());

            if config.termination_points.is_empty() {
                continue;
            }
            if present {
                self.transactor
                    .apply_termination_points(&config.id, &config.termination_points, tx)
                    .await?;
                report.tps_applied.push(config.id.clone());
            } else {
                report.deferred.push(DeferredTps {
                    device: device.clone(),
                    bridge: config.id.clone(),
                    termination_points: config.termination_points.clone(),
                });
            }
        }

        if !report.bridges.is_empty() {
            info!(
                device = %device,
                bridges = report.bridges.len(),
                deferred = report.deferred.len(),
                "device bridges reconciled"
            );
        }
        Ok(report)
    }
}

/// Operational listener that reconciles devices as they connect.
pub struct ReconciliationListener {
    cache: Arc<HaCache>,
    reconciler: BridgeReconciler,
    tp_reconciler: TpReconcilerHandle,
    pending: Vec<DeferredTps>,
    devices_reconciled: u64,
}

impl fmt::Debug for ReconciliationListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationListener")
            .field("reconciler", &self.reconciler)
            .field("pending", &self.pending.len())
            .field("devices_reconciled", &self.devices_reconciled)
            .finish()
    }
}

impl ReconciliationListener {
    pub fn new(
        cache: Arc<HaCache>,
        reconciler: BridgeReconciler,
        tp_reconciler: TpReconcilerHandle,
    ) -> Self {
        Self {
            cache,
            reconciler,
            tp_reconciler,
            pending: Vec::new(),
            devices_reconciled: 0,
        }
    }

    pub fn devices_reconciled(&self) -> u64 {
        self.devices_reconciled
    }
}

#[async_trait]
impl ChangeListener for ReconciliationListener {
    type Error = HaError;

    fn name(&self) -> &str {
        "bridge-reconciliation"
    }

    fn datastore(&self) -> Datastore {
        Datastore::Operational
    }

    async fn handle_connected(&mut self, change: &NodeChange, tx: &mut Transaction) -> HaResult<()> {
        let is_device = change.id.is_device()
            && change.after.as_ref().is_some_and(|n| n.global.is_some());
        if !is_device || self.cache.is_parent(&change.id) {
            return Ok(());
        }
        let report = self.reconciler.reconcile_device(&change.id, tx).await?;
        self.pending.extend(report.deferred);
        self.devices_reconciled += 1;
        Ok(())
    }

    async fn on_committed(&mut self) {
        for deferred in self.pending.drain(..) {
            let bridge = deferred.bridge.clone();
            if let Err(e) = self.tp_reconciler.defer(deferred).await {
                warn!(bridge = %bridge, error = %e, "could not defer termination points");
            }
        }
    }

    async fn on_abandoned(&mut self) {
        self.pending.clear();
    }
}

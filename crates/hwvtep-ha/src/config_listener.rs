//! Config datastore listener: relationship discovery and group to member
//! propagation.

use async_trait::async_trait;
use hwvtep_store::{ChangeListener, Datastore, NodeChange, Transaction};
use hwvtep_types::{Node, NodeId};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::propagation::replicated_global;
use crate::{ConfigPropagation, HaCache, HaError, HaResult, RelationshipDiscovery};

/// Returns true if the part of the group config that members receive changed.
fn replicated_config_changed(before: Option<&Node>, after: &Node) -> bool {
    let Some(before) = before else {
        return true;
    };
    let project = |n: &Node| n.global.as_ref().map(replicated_global).unwrap_or_default();
    project(before) != project(after) || before.termination_points != after.termination_points
}

#[derive(Debug)]
pub struct HaConfigListener {
    discovery: RelationshipDiscovery,
    propagation: ConfigPropagation,
}

impl HaConfigListener {
    pub fn new(cache: Arc<HaCache>) -> Self {
        Self {
            discovery: RelationshipDiscovery::new(cache),
            propagation: ConfigPropagation::new(),
        }
    }

    pub fn propagation(&self) -> &ConfigPropagation {
        &self.propagation
    }

    fn cache(&self) -> &Arc<HaCache> {
        self.discovery.cache()
    }

    async fn on_change(&mut self, change: &NodeChange, tx: &mut Transaction) -> HaResult<()> {
        let before = change.before.as_deref();
        let after = change.after.as_deref();

        if let Some((device, _)) = change.id.split_physical_switch() {
            if self.cache().is_parent(&device) {
                let children = self.cache().children_of(&device);
                self.propagation
                    .propagate_physical_switch(&device, before, after, &children, tx)
                    .await;
            }
            return Ok(());
        }
        if !change.id.is_device() {
            return Ok(());
        }

        let outcome = self.discovery.apply(&change.id, before, after);
        if let Some((parent, children)) = &outcome.removed_parent {
            info!(group = %parent, members = children.len(), "HA group config removed");
        }

        // Members that just joined get the full group config.
        let joined: BTreeSet<(NodeId, NodeId)> = outcome.attached.iter().cloned().collect();
        for (parent, child) in &joined {
            let report = self.propagation.sync_child(parent, child, tx).await?;
            debug!(group = %parent, member = %child, written = report.written.len(), "member synced to group config");
        }

        if let Some(after) = after {
            if self.cache().is_parent(&change.id) && replicated_config_changed(before, after) {
                let children: BTreeSet<NodeId> = self
                    .cache()
                    .children_of(&change.id)
                    .into_iter()
                    .filter(|c| !joined.contains(&(change.id.clone(), c.clone())))
                    .collect();
                if !children.is_empty() {
                    let report = self
                        .propagation
                        .propagate_group(&change.id, before, after, &children, tx)
                        .await;
                    debug!(
                        group = %change.id,
                        written = report.written.len(),
                        failed = report.failed.len(),
                        "HA config propagated"
                    );
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeListener for HaConfigListener {
    type Error = HaError;

    fn name(&self) -> &str {
        "ha-config"
    }

    fn datastore(&self) -> Datastore {
        Datastore::Config
    }

    async fn handle_connected(&mut self, change: &NodeChange, tx: &mut Transaction) -> HaResult<()> {
        self.on_change(change, tx).await
    }

    async fn handle_updated(&mut self, change: &NodeChange, tx: &mut Transaction) -> HaResult<()> {
        self.on_change(change, tx).await
    }

    async fn handle_deleted(&mut self, change: &NodeChange, tx: &mut Transaction) -> HaResult<()> {
        self.on_change(change, tx).await
    }
}

//! Group to member config propagation.
//!
//! ```text
//!  config: HA device ──(clone, rewrite refs HA -> member)──> member device
//!          HA/physicalswitch/n ─────────────────────────────> member/physicalswitch/n
//! ```
//!
//! Each member is written in its own transaction. A member whose write fails
//! is logged and skipped; the rest still receive the update.

use hwvtep_store::{Datastore, Transaction};
use hwvtep_types::{
    merge_keyed, remove_keyed, GlobalAugmentation, Keyed, McastMac, Node, NodeId,
    PhysicalSwitchAugmentation, TerminationPoint,
};
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::{HaError, HaResult};

/// Propagation statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationStats {
    /// Member writes committed.
    pub children_written: u64,
    /// Member writes that failed.
    pub children_failed: u64,
}

/// Outcome of propagating one change to a set of members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationReport {
    pub written: Vec<NodeId>,
    pub failed: Vec<NodeId>,
}

/// Returns the part of a group's global config that members receive.
pub fn replicated_global(global: &GlobalAugmentation) -> GlobalAugmentation {
    GlobalAugmentation {
        logical_switches: global.logical_switches.clone(),
        local_ucast_macs: global.local_ucast_macs.clone(),
        remote_ucast_macs: global.remote_ucast_macs.clone(),
        local_mcast_macs: global.local_mcast_macs.clone(),
        remote_mcast_macs: global.remote_mcast_macs.clone(),
        ..Default::default()
    }
}

fn keys_of<T: Keyed>(list: &[T]) -> BTreeSet<T::Key> {
    list.iter().map(Keyed::key).collect()
}

fn removed_keys<T: Keyed>(before: &[T], after: &[T]) -> BTreeSet<T::Key> {
    let kept = keys_of(after);
    keys_of(before)
        .into_iter()
        .filter(|k| !kept.contains(k))
        .collect()
}

/// Drops the locators the group removed from a multicast entry it kept.
fn prune_mcast_locators(target: &mut [McastMac], before: &[McastMac], after: &[McastMac]) {
    for mac in target.iter_mut() {
        let key = mac.key();
        let old = before.iter().find(|m| m.key() == key);
        let new = after.iter().find(|m| m.key() == key);
        if let (Some(old), Some(new)) = (old, new) {
            remove_keyed(&mut mac.locators, &removed_keys(&old.locators, &new.locators));
        }
    }
}

/// Drops the VLAN bindings the group removed from a port it kept.
fn prune_vlan_bindings(
    target: &mut [TerminationPoint],
    before: &[TerminationPoint],
    after: &[TerminationPoint],
) {
    for tp in target.iter_mut() {
        let old = before.iter().find(|t| t.tp_id == tp.tp_id);
        let new = after.iter().find(|t| t.tp_id == tp.tp_id);
        if let (Some(old), Some(new)) = (old, new) {
            remove_keyed(
                &mut tp.vlan_bindings,
                &removed_keys(&old.vlan_bindings, &new.vlan_bindings),
            );
        }
    }
}

/// Applies the group's removals, then merges the group's current entries.
///
/// Entries present on both sides are merged field by field, so member-owned
/// fields the group leaves unset survive.
fn apply_global(target: &mut GlobalAugmentation, before: &GlobalAugmentation, after: &GlobalAugmentation) {
    remove_keyed(
        &mut target.logical_switches,
        &removed_keys(&before.logical_switches, &after.logical_switches),
    );
    remove_keyed(
        &mut target.local_ucast_macs,
        &removed_keys(&before.local_ucast_macs, &after.local_ucast_macs),
    );
    remove_keyed(
        &mut target.remote_ucast_macs,
        &removed_keys(&before.remote_ucast_macs, &after.remote_ucast_macs),
    );
    remove_keyed(
        &mut target.local_mcast_macs,
        &removed_keys(&before.local_mcast_macs, &after.local_mcast_macs),
    );
    remove_keyed(
        &mut target.remote_mcast_macs,
        &removed_keys(&before.remote_mcast_macs, &after.remote_mcast_macs),
    );
    prune_mcast_locators(
        &mut target.local_mcast_macs,
        &before.local_mcast_macs,
        &after.local_mcast_macs,
    );
    prune_mcast_locators(
        &mut target.remote_mcast_macs,
        &before.remote_mcast_macs,
        &after.remote_mcast_macs,
    );
    target.merge_from(after);
}

fn apply_tps(target: &mut Vec<TerminationPoint>, before: &[TerminationPoint], after: &[TerminationPoint]) {
    remove_keyed(target, &removed_keys(before, after));
    prune_vlan_bindings(target, before, after);
    merge_keyed(target, after);
}

fn rewritten_tps(tps: &[TerminationPoint], from: &NodeId, to: &NodeId) -> Vec<TerminationPoint> {
    tps.iter()
        .cloned()
        .map(|mut tp| {
            tp.rewrite_refs(from, to);
            tp
        })
        .collect()
}

/// Writes group config into member config.
#[derive(Debug, Default)]
pub struct ConfigPropagation {
    stats: PropagationStats,
}

impl ConfigPropagation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &PropagationStats {
        &self.stats
    }

    /// Propagates a change of the group device's config to `children`.
    pub async fn propagate_group(
        &mut self,
        parent: &NodeId,
        before: Option<&Node>,
        after: &Node,
        children: &BTreeSet<NodeId>,
        tx: &Transaction,
    ) -> PropagationReport {
        let mut report = PropagationReport::default();
        for child in children {
            let mut child_tx = tx.fork();
            let result = match write_group_config(parent, before, after, child, &mut child_tx).await {
                Ok(()) => child_tx
                    .commit()
                    .await
                    .map_err(|e| HaError::store("member config commit", e)),
                Err(e) => Err(e),
            };
            self.record(child, result, &mut report);
        }
        report
    }

    /// Propagates a change of one of the group's physical switches.
    ///
    /// `after == None` removes the member copies.
    pub async fn propagate_physical_switch(
        &mut self,
        parent: &NodeId,
        before: Option<&Node>,
        after: Option<&Node>,
        children: &BTreeSet<NodeId>,
        tx: &Transaction,
    ) -> PropagationReport {
        let mut report = PropagationReport::default();
        let Some(ps_id) = after.or(before).map(|n| n.id.clone()) else {
            return report;
        };
        for child in children {
            let Some(child_ps) = ps_id.rebase(parent, child) else {
                continue;
            };
            let mut child_tx = tx.fork();
            let result = match after {
                Some(after) => {
                    write_physical_switch(parent, before, after, child, &child_ps, &mut child_tx).await
                }
                None => {
                    child_tx.delete(Datastore::Config, child_ps.clone());
                    Ok(())
                }
            };
            let result = match result {
                Ok(()) => child_tx
                    .commit()
                    .await
                    .map_err(|e| HaError::store("member physical switch commit", e)),
                Err(e) => Err(e),
            };
            self.record(child, result, &mut report);
        }
        report
    }

    /// Brings one member up to the group's current config.
    ///
    /// Used when a member joins a group or reconnects to it. Only reading
    /// the group's config can fail; member write failures land in the report.
    pub async fn sync_child(
        &mut self,
        parent: &NodeId,
        child: &NodeId,
        tx: &Transaction,
    ) -> HaResult<PropagationReport> {
        let broker = tx.broker();
        let children: BTreeSet<NodeId> = [child.clone()].into_iter().collect();
        let mut report = PropagationReport::default();

        if let Some(group) = broker.read(Datastore::Config, parent).await? {
            report = self
                .propagate_group(parent, None, &group, &children, tx)
                .await;
        }

        let switches: Vec<_> = broker
            .read_all(Datastore::Config)
            .await?
            .into_iter()
            .filter(|n| {
                n.id.split_physical_switch()
                    .is_some_and(|(device, _)| &device == parent)
            })
            .collect();
        for ps in &switches {
            let r = self
                .propagate_physical_switch(parent, None, Some(ps.as_ref()), &children, tx)
                .await;
            report.written.extend(r.written);
            report.failed.extend(r.failed);
        }
        Ok(report)
    }

    fn record(&mut self, child: &NodeId, result: HaResult<()>, report: &mut PropagationReport) {
        match result {
            Ok(()) => {
                self.stats.children_written += 1;
                report.written.push(child.clone());
            }
            Err(e) => {
                warn!(child = %child, error = %e, "failed to propagate HA config to member");
                self.stats.children_failed += 1;
                report.failed.push(child.clone());
            }
        }
    }
}

async fn write_group_config(
    parent: &NodeId,
    before: Option<&Node>,
    after: &Node,
    child: &NodeId,
    tx: &mut Transaction,
) -> HaResult<()> {
    let project = |node: Option<&Node>| {
        let mut global = node
            .and_then(|n| n.global.as_ref())
            .map(replicated_global)
            .unwrap_or_default();
        global.rewrite_refs(parent, child);
        let tps = node
            .map(|n| rewritten_tps(&n.termination_points, parent, child))
            .unwrap_or_default();
        (global, tps)
    };
    let (old_global, old_tps) = project(before);
    let (new_global, new_tps) = project(Some(after));

    let current = tx.read(Datastore::Config, child).await?;
    let mut node = current.clone().unwrap_or_else(|| Node::new(child.clone()));
    apply_global(
        node.global.get_or_insert_with(GlobalAugmentation::default),
        &old_global,
        &new_global,
    );
    apply_tps(&mut node.termination_points, &old_tps, &new_tps);

    if current.as_ref() != Some(&node) {
        debug!(parent = %parent, child = %child, "writing HA config to member");
        tx.put(Datastore::Config, node);
    }
    Ok(())
}

async fn write_physical_switch(
    parent: &NodeId,
    before: Option<&Node>,
    after: &Node,
    child: &NodeId,
    child_ps: &NodeId,
    tx: &mut Transaction,
) -> HaResult<()> {
    let old_tps = before
        .map(|n| rewritten_tps(&n.termination_points, parent, child))
        .unwrap_or_default();
    let new_tps = rewritten_tps(&after.termination_points, parent, child);

    let current = tx.read(Datastore::Config, child_ps).await?;
    let mut node = current.clone().unwrap_or_else(|| Node::new(child_ps.clone()));
    if let Some(ps) = after.physical_switch.as_ref() {
        node.merge_from(&Node {
            physical_switch: Some(PhysicalSwitchAugmentation {
                name: ps.name.clone(),
                managed_by: child.clone(),
                tunnel_ips: ps.tunnel_ips.clone(),
            }),
            ..Node::new(child_ps.clone())
        });
    }
    apply_tps(&mut node.termination_points, &old_tps, &new_tps);

    if current.as_ref() != Some(&node) {
        debug!(parent = %parent, switch = %child_ps, "writing HA physical switch config to member");
        tx.put(Datastore::Config, node);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwvtep_store::{DataBroker, MemoryBroker, WriteOp};
    use hwvtep_types::{
        LocatorRef, LogicalSwitch, LogicalSwitchRef, UcastMac, VlanBinding, VlanId,
    };
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn ls(name: &str) -> LogicalSwitch {
        LogicalSwitch {
            name: name.to_string(),
            tunnel_key: Some(5000),
            description: None,
        }
    }

    fn ucast(i: u8, ls_name: &str, node: &NodeId) -> UcastMac {
        UcastMac {
            mac: hwvtep_types::MacAddress::new([0, 0, 0, 0, 1, i]),
            logical_switch: LogicalSwitchRef::new(node.clone(), ls_name),
            locator: Some(LocatorRef::new(node.clone(), "vxlan_over_ipv4:10.0.0.9")),
            ip: None,
        }
    }

    fn group(id: &NodeId, switches: usize, macs: u8) -> Node {
        let mut node = Node::new(id.clone());
        node.global = Some(GlobalAugmentation {
            logical_switches: (0..switches).map(|i| ls(&format!("ls{}", i))).collect(),
            remote_ucast_macs: (0..macs).map(|i| ucast(i, "ls0", id)).collect(),
            ..Default::default()
        });
        node.termination_points.push(TerminationPoint::locator("10.0.0.9"));
        node
    }

    fn children(list: &[&str]) -> BTreeSet<NodeId> {
        list.iter().map(|s| NodeId::new(*s)).collect()
    }

    #[tokio::test]
    async fn test_each_member_receives_translated_copy() {
        let broker = MemoryBroker::new();
        let tx = Transaction::new(broker.clone());
        let ha = NodeId::new("hwvtep://ha1");
        let members = children(&["hwvtep://s1", "hwvtep://s2", "hwvtep://s3"]);

        let mut propagation = ConfigPropagation::new();
        let report = propagation
            .propagate_group(&ha, None, &group(&ha, 4, 6), &members, &tx)
            .await;
        assert_eq!(report.written.len(), 3);

        for member in &members {
            let node = broker.get(Datastore::Config, member).unwrap();
            let global = node.global.unwrap();
            assert_eq!(global.logical_switches.len(), 4);
            assert_eq!(global.remote_ucast_macs.len(), 6);
            for mac in &global.remote_ucast_macs {
                assert_eq!(&mac.logical_switch.node, member);
                assert_eq!(&mac.locator.as_ref().unwrap().node, member);
            }
            assert_eq!(node.termination_points.len(), 1);
        }
        assert_eq!(propagation.stats().children_written, 3);
    }

    #[tokio::test]
    async fn test_member_local_config_survives() {
        let broker = MemoryBroker::new();
        let member = NodeId::new("hwvtep://s1");
        let mut local = Node::new(member.clone());
        local.global = Some(GlobalAugmentation {
            logical_switches: vec![ls("local-only")],
            ..Default::default()
        });
        broker
            .commit(vec![WriteOp::Put {
                datastore: Datastore::Config,
                node: local,
            }])
            .await
            .unwrap();

        let ha = NodeId::new("hwvtep://ha1");
        let before = group(&ha, 2, 0);
        let after = group(&ha, 1, 0);
        let tx = Transaction::new(broker.clone());
        let mut propagation = ConfigPropagation::new();
        propagation
            .propagate_group(&ha, None, &before, &children(&["hwvtep://s1"]), &tx)
            .await;
        propagation
            .propagate_group(&ha, Some(&before), &after, &children(&["hwvtep://s1"]), &tx)
            .await;

        let names: Vec<String> = broker
            .get(Datastore::Config, &member)
            .unwrap()
            .global
            .unwrap()
            .logical_switches
            .into_iter()
            .map(|ls| ls.name)
            .collect();
        assert_eq!(names, vec!["local-only".to_string(), "ls0".to_string()]);
    }

    #[tokio::test]
    async fn test_member_owned_fields_survive_group_merge() {
        let broker = MemoryBroker::new();
        let member = NodeId::new("hwvtep://s1");
        let mut local = Node::new(member.clone());
        local.global = Some(GlobalAugmentation {
            logical_switches: vec![LogicalSwitch {
                name: "ls0".to_string(),
                tunnel_key: None,
                description: Some("local-desc".to_string()),
            }],
            ..Default::default()
        });
        broker
            .commit(vec![WriteOp::Put {
                datastore: Datastore::Config,
                node: local,
            }])
            .await
            .unwrap();

        let ha = NodeId::new("hwvtep://ha1");
        let tx = Transaction::new(broker.clone());
        ConfigPropagation::new()
            .propagate_group(&ha, None, &group(&ha, 1, 0), &children(&["hwvtep://s1"]), &tx)
            .await;

        let global = broker.get(Datastore::Config, &member).unwrap().global.unwrap();
        assert_eq!(
            global.logical_switches,
            vec![LogicalSwitch {
                name: "ls0".to_string(),
                tunnel_key: Some(5000),
                description: Some("local-desc".to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn test_dropped_vlan_binding_removed_from_member() {
        let broker = MemoryBroker::new();
        let tx = Transaction::new(broker.clone());
        let ha = NodeId::new("hwvtep://ha1");
        let member = NodeId::new("hwvtep://s1");

        let binding = |vlan: u16| VlanBinding {
            vlan: VlanId::new(vlan).unwrap(),
            logical_switch: LogicalSwitchRef::new(ha.clone(), "ls0"),
        };
        let switch = |vlans: &[u16]| {
            let mut ps = Node::new(ha.physical_switch("tor1"));
            ps.physical_switch = Some(PhysicalSwitchAugmentation {
                name: "tor1".to_string(),
                managed_by: ha.clone(),
                tunnel_ips: vec![],
            });
            let mut port = TerminationPoint::port("eth1");
            port.vlan_bindings = vlans.iter().map(|v| binding(*v)).collect();
            ps.termination_points.push(port);
            ps
        };
        let before = switch(&[100, 200]);
        let after = switch(&[100]);

        let members = children(&["hwvtep://s1"]);
        let mut propagation = ConfigPropagation::new();
        propagation
            .propagate_physical_switch(&ha, None, Some(&before), &members, &tx)
            .await;
        propagation
            .propagate_physical_switch(&ha, Some(&before), Some(&after), &members, &tx)
            .await;

        let copy = broker
            .get(Datastore::Config, &member.physical_switch("tor1"))
            .unwrap();
        let vlans: Vec<u16> = copy.termination_points[0]
            .vlan_bindings
            .iter()
            .map(|b| b.vlan.as_u16())
            .collect();
        assert_eq!(vlans, vec![100]);
    }

    #[tokio::test]
    async fn test_one_failed_member_does_not_stop_others() {
        let broker = MemoryBroker::new();
        let tx = Transaction::new(broker.clone());
        let ha = NodeId::new("hwvtep://ha1");
        let members = children(&["hwvtep://s1", "hwvtep://s2", "hwvtep://s3"]);

        broker.fail_next_commits(1);
        let mut propagation = ConfigPropagation::new();
        let report = propagation
            .propagate_group(&ha, None, &group(&ha, 1, 1), &members, &tx)
            .await;

        assert_eq!(report.failed, vec![NodeId::new("hwvtep://s1")]);
        assert_eq!(report.written.len(), 2);
        assert!(broker.get(Datastore::Config, &NodeId::new("hwvtep://s1")).is_none());
        assert!(broker.get(Datastore::Config, &NodeId::new("hwvtep://s3")).is_some());
    }

    #[tokio::test]
    async fn test_unchanged_member_is_not_rewritten() {
        let broker = MemoryBroker::new();
        let tx = Transaction::new(broker.clone());
        let ha = NodeId::new("hwvtep://ha1");
        let members = children(&["hwvtep://s1"]);
        let mut propagation = ConfigPropagation::new();

        propagation
            .propagate_group(&ha, None, &group(&ha, 1, 1), &members, &tx)
            .await;
        let commits = broker.commit_count();
        propagation
            .propagate_group(&ha, None, &group(&ha, 1, 1), &members, &tx)
            .await;
        assert_eq!(broker.commit_count(), commits);
    }

    #[tokio::test]
    async fn test_physical_switch_vlan_bindings_rewritten() {
        let broker = MemoryBroker::new();
        let tx = Transaction::new(broker.clone());
        let ha = NodeId::new("hwvtep://ha1");
        let member = NodeId::new("hwvtep://s1");

        let mut ps = Node::new(ha.physical_switch("tor1"));
        ps.physical_switch = Some(PhysicalSwitchAugmentation {
            name: "tor1".to_string(),
            managed_by: ha.clone(),
            tunnel_ips: vec!["10.0.0.9".to_string()],
        });
        let mut port = TerminationPoint::port("eth1");
        port.vlan_bindings.push(VlanBinding {
            vlan: VlanId::new(100).unwrap(),
            logical_switch: LogicalSwitchRef::new(ha.clone(), "ls0"),
        });
        ps.termination_points.push(port);

        let mut propagation = ConfigPropagation::new();
        propagation
            .propagate_physical_switch(&ha, None, Some(&ps), &children(&["hwvtep://s1"]), &tx)
            .await;

        let copy = broker
            .get(Datastore::Config, &member.physical_switch("tor1"))
            .unwrap();
        assert_eq!(copy.physical_switch.as_ref().unwrap().managed_by, member);
        assert_eq!(
            copy.termination_points[0].vlan_bindings[0].logical_switch.node,
            member
        );

        propagation
            .propagate_physical_switch(&ha, Some(&ps), None, &children(&["hwvtep://s1"]), &tx)
            .await;
        assert!(broker
            .get(Datastore::Config, &member.physical_switch("tor1"))
            .is_none());
    }

    #[tokio::test]
    async fn test_sync_child_copies_everything() {
        let broker = MemoryBroker::new();
        let ha = NodeId::new("hwvtep://ha1");
        let mut ps = Node::new(ha.physical_switch("tor1"));
        ps.physical_switch = Some(PhysicalSwitchAugmentation {
            name: "tor1".to_string(),
            managed_by: ha.clone(),
            tunnel_ips: vec![],
        });
        broker
            .commit(vec![
                WriteOp::Put {
                    datastore: Datastore::Config,
                    node: group(&ha, 2, 2),
                },
                WriteOp::Put {
                    datastore: Datastore::Config,
                    node: ps,
                },
            ])
            .await
            .unwrap();

        let member = NodeId::new("hwvtep://s2");
        let broker_dyn: Arc<dyn DataBroker> = broker.clone();
        let tx = Transaction::new(broker_dyn);
        let report = ConfigPropagation::new()
            .sync_child(&ha, &member, &tx)
            .await
            .unwrap();
        assert_eq!(report.written.len(), 2);
        assert!(report.failed.is_empty());

        assert!(broker.get(Datastore::Config, &member).is_some());
        assert!(broker
            .get(Datastore::Config, &member.physical_switch("tor1"))
            .is_some());
    }
}

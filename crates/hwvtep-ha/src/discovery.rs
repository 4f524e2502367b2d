//! Relationship discovery from device metadata.
//!
//! Both directions of a relationship are accepted: a group listing its
//! members in `ha_children`, and a member naming its group in `ha_id`. A
//! member's claim on a group that is not known yet is parked in the cache
//! and completed when the group shows up, so the final state is the same
//! whichever side reports first.

use hwvtep_types::{Node, NodeId};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{HaCache, HaError};

/// Relationship changes made by one metadata update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryOutcome {
    /// `(parent, child)` pairs attached by this update.
    pub attached: Vec<(NodeId, NodeId)>,
    /// `(parent, child)` pairs detached by this update.
    pub detached: Vec<(NodeId, NodeId)>,
    /// Set when the updated node stopped being a group.
    pub removed_parent: Option<(NodeId, BTreeSet<NodeId>)>,
}

impl DiscoveryOutcome {
    pub fn is_empty(&self) -> bool {
        self.attached.is_empty() && self.detached.is_empty() && self.removed_parent.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct RelationshipDiscovery {
    cache: Arc<HaCache>,
}

impl RelationshipDiscovery {
    pub fn new(cache: Arc<HaCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<HaCache> {
        &self.cache
    }

    /// Folds one node's metadata transition into the cache.
    pub fn apply(&self, id: &NodeId, before: Option<&Node>, after: Option<&Node>) -> DiscoveryOutcome {
        let mut outcome = DiscoveryOutcome::default();

        let Some(after) = after else {
            if before.and_then(Node::ha_children).is_some() || self.cache.is_parent(id) {
                outcome.removed_parent = Some((id.clone(), self.cache.remove_parent(id)));
            }
            if before.and_then(Node::ha_id).is_some() {
                self.cache.withdraw_claim(id);
            }
            return outcome;
        };

        self.apply_children(id, before, after, &mut outcome);
        self.apply_claim(id, before, after, &mut outcome);

        if !outcome.is_empty() {
            debug!(
                node = %id,
                attached = outcome.attached.len(),
                detached = outcome.detached.len(),
                "HA relationships updated"
            );
        }
        outcome
    }

    fn apply_children(
        &self,
        id: &NodeId,
        before: Option<&Node>,
        after: &Node,
        outcome: &mut DiscoveryOutcome,
    ) {
        let previous = before.and_then(Node::ha_children);
        let Some(children) = after.ha_children() else {
            if previous.is_some() {
                outcome.removed_parent = Some((id.clone(), self.cache.remove_parent(id)));
            }
            return;
        };

        for child in self.cache.declare_parent(id) {
            outcome.attached.push((id.clone(), child));
        }
        for child in &children {
            if self.cache.add_child(id, child) {
                outcome.attached.push((id.clone(), child.clone()));
            }
        }

        for dropped in previous
            .unwrap_or_default()
            .into_iter()
            .filter(|c| !children.contains(c))
        {
            if self.cache.parent_of(&dropped).as_ref() == Some(id) {
                self.cache.remove_child(&dropped);
                outcome.detached.push((id.clone(), dropped));
            }
        }
    }

    fn apply_claim(
        &self,
        id: &NodeId,
        before: Option<&Node>,
        after: &Node,
        outcome: &mut DiscoveryOutcome,
    ) {
        match after.ha_id() {
            Some(parent) if &parent != id => {
                let current = self.cache.parent_of(id);
                if self.cache.claim(id, &parent) {
                    if current.as_ref() != Some(&parent) {
                        outcome.attached.push((parent, id.clone()));
                    }
                } else {
                    if let Some(previous) = current {
                        outcome.detached.push((previous, id.clone()));
                    }
                    let err = HaError::UnresolvableRelationship {
                        node: id.clone(),
                        reference: parent,
                    };
                    info!(error = %err, "HA membership deferred until the group is known");
                }
            }
            Some(_) => {}
            None => {
                let Some(previous) = before.and_then(Node::ha_id) else {
                    return;
                };
                self.cache.withdraw_claim(id);
                if self.cache.parent_of(id).as_ref() == Some(&previous) {
                    self.cache.remove_child(id);
                    outcome.detached.push((previous, id.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwvtep_types::{GlobalAugmentation, Manager, OtherConfig, HA_CHILDREN_KEY, HA_ID_KEY};
    use pretty_assertions::assert_eq;

    fn device(id: &str, key: &str, value: &str) -> Node {
        let mut node = Node::new(NodeId::new(id));
        node.global = Some(GlobalAugmentation {
            managers: vec![Manager {
                target: "ptcp:6640".to_string(),
                other_configs: vec![OtherConfig::new(key, value)],
            }],
            ..Default::default()
        });
        node
    }

    fn ids(list: &[&str]) -> BTreeSet<NodeId> {
        list.iter().map(|s| NodeId::new(*s)).collect()
    }

    fn discovery() -> RelationshipDiscovery {
        RelationshipDiscovery::new(Arc::new(HaCache::new()))
    }

    #[test]
    fn test_group_declares_members() {
        let d = discovery();
        let ha = device("hwvtep://ha1", HA_CHILDREN_KEY, "hwvtep://s1,hwvtep://s2");

        let outcome = d.apply(&ha.id, None, Some(&ha));
        assert_eq!(outcome.attached.len(), 2);
        assert_eq!(
            d.cache().children_of(&ha.id),
            ids(&["hwvtep://s1", "hwvtep://s2"])
        );
    }

    #[test]
    fn test_member_first_then_group_converges() {
        let d = discovery();
        let member = device("hwvtep://s1", HA_ID_KEY, "hwvtep://ha1");
        let ha = device("hwvtep://ha1", HA_CHILDREN_KEY, "hwvtep://s2");

        assert!(d.apply(&member.id, None, Some(&member)).attached.is_empty());
        let outcome = d.apply(&ha.id, None, Some(&ha));

        assert_eq!(outcome.attached.len(), 2);
        assert_eq!(
            d.cache().children_of(&ha.id),
            ids(&["hwvtep://s1", "hwvtep://s2"])
        );
    }

    #[test]
    fn test_group_first_then_member_converges() {
        let d = discovery();
        let member = device("hwvtep://s1", HA_ID_KEY, "hwvtep://ha1");
        let ha = device("hwvtep://ha1", HA_CHILDREN_KEY, "hwvtep://s2");

        d.apply(&ha.id, None, Some(&ha));
        let outcome = d.apply(&member.id, None, Some(&member));

        assert_eq!(
            outcome.attached,
            vec![(NodeId::new("hwvtep://ha1"), NodeId::new("hwvtep://s1"))]
        );
        assert_eq!(
            d.cache().children_of(&ha.id),
            ids(&["hwvtep://s1", "hwvtep://s2"])
        );
    }

    #[test]
    fn test_repeated_claim_reports_nothing_new() {
        let d = discovery();
        let ha = device("hwvtep://ha1", HA_CHILDREN_KEY, "hwvtep://s1");
        let member = device("hwvtep://s1", HA_ID_KEY, "hwvtep://ha1");

        d.apply(&ha.id, None, Some(&ha));
        assert!(d.apply(&member.id, None, Some(&member)).is_empty());
    }

    #[test]
    fn test_member_dropped_from_list() {
        let d = discovery();
        let before = device("hwvtep://ha1", HA_CHILDREN_KEY, "hwvtep://s1,hwvtep://s2");
        let after = device("hwvtep://ha1", HA_CHILDREN_KEY, "hwvtep://s1");

        d.apply(&before.id, None, Some(&before));
        let outcome = d.apply(&after.id, Some(&before), Some(&after));

        assert_eq!(
            outcome.detached,
            vec![(NodeId::new("hwvtep://ha1"), NodeId::new("hwvtep://s2"))]
        );
        assert_eq!(d.cache().parent_of(&NodeId::new("hwvtep://s2")), None);
    }

    #[test]
    fn test_group_deleted_cascades() {
        let d = discovery();
        let ha = device("hwvtep://ha1", HA_CHILDREN_KEY, "hwvtep://s1,hwvtep://s2");
        d.apply(&ha.id, None, Some(&ha));

        let outcome = d.apply(&ha.id, Some(&ha), None);
        let (parent, children) = outcome.removed_parent.unwrap();
        assert_eq!(parent, ha.id);
        assert_eq!(children.len(), 2);
        assert!(!d.cache().is_parent(&ha.id));
        assert!(!d.cache().is_child(&NodeId::new("hwvtep://s1")));
    }

    #[test]
    fn test_member_clears_ha_id() {
        let d = discovery();
        let ha = device("hwvtep://ha1", HA_CHILDREN_KEY, "");
        let member = device("hwvtep://s1", HA_ID_KEY, "hwvtep://ha1");
        let plain = Node::new(NodeId::new("hwvtep://s1"));

        d.apply(&ha.id, None, Some(&ha));
        d.apply(&member.id, None, Some(&member));
        assert!(d.cache().is_child(&member.id));

        let outcome = d.apply(&member.id, Some(&member), Some(&plain));
        assert_eq!(outcome.detached.len(), 1);
        assert!(!d.cache().is_child(&member.id));
    }

    #[test]
    fn test_member_moving_to_unknown_group_is_detached() {
        let d = discovery();
        let ha = device("hwvtep://ha1", HA_CHILDREN_KEY, "");
        let member = device("hwvtep://s1", HA_ID_KEY, "hwvtep://ha1");
        let moved = device("hwvtep://s1", HA_ID_KEY, "hwvtep://ha2");

        d.apply(&ha.id, None, Some(&ha));
        d.apply(&member.id, None, Some(&member));
        let outcome = d.apply(&member.id, Some(&member), Some(&moved));

        assert_eq!(outcome.detached, vec![(ha.id.clone(), member.id.clone())]);
        assert!(outcome.attached.is_empty());
        assert!(d.cache().children_of(&ha.id).is_empty());
        assert_eq!(
            d.cache().pending_claim(&member.id),
            Some(NodeId::new("hwvtep://ha2"))
        );
    }

    #[test]
    fn test_named_group_identity_resolves_to_uuid_device() {
        let d = discovery();
        let ha_id = NodeId::for_ha_group("rack-7");
        let member = device("hwvtep://s1", HA_ID_KEY, "rack-7");
        let ha = device(ha_id.as_str(), HA_CHILDREN_KEY, "");

        d.apply(&member.id, None, Some(&member));
        d.apply(&ha.id, None, Some(&ha));
        assert_eq!(d.cache().parent_of(&member.id), Some(ha_id));
    }
}

//! Parent/child relationship index.

use hwvtep_types::NodeId;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Relationships {
    parents: HashMap<NodeId, BTreeSet<NodeId>>,
    child_to_parent: HashMap<NodeId, NodeId>,
    /// Members that named a group before the group was known.
    pending_claims: HashMap<NodeId, NodeId>,
}

impl Relationships {
    fn attach(&mut self, parent: &NodeId, child: &NodeId) -> bool {
        if let Some(previous) = self.child_to_parent.get(child).cloned() {
            if &previous == parent {
                return false;
            }
            if let Some(siblings) = self.parents.get_mut(&previous) {
                siblings.remove(child);
            }
            info!(child = %child, from = %previous, to = %parent, "reparenting HA member");
        }
        self.pending_claims.remove(child);
        self.parents
            .entry(parent.clone())
            .or_default()
            .insert(child.clone());
        self.child_to_parent.insert(child.clone(), parent.clone());
        true
    }

    fn drain_claims_for(&mut self, parent: &NodeId) -> Vec<NodeId> {
        let claimants: Vec<NodeId> = self
            .pending_claims
            .iter()
            .filter(|(_, claimed)| *claimed == parent)
            .map(|(child, _)| child.clone())
            .collect();
        claimants
            .into_iter()
            .filter(|child| self.attach(parent, child))
            .collect()
    }
}

/// Derived index of HA parents and their children.
///
/// Both directions are kept under one lock, so every mutation is a single
/// critical section and no reader can see a child mapped to a parent whose
/// child set lacks it. Readers share the lock.
///
/// A child belongs to at most one parent: attaching it to a new parent
/// removes it from the old one.
///
/// Nothing here is persisted; the index is rebuilt from device metadata.
#[derive(Debug, Default)]
pub struct HaCache {
    inner: RwLock<Relationships>,
}

impl HaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_parent(&self, id: &NodeId) -> bool {
        self.inner.read().parents.contains_key(id)
    }

    pub fn is_child(&self, id: &NodeId) -> bool {
        self.inner.read().child_to_parent.contains_key(id)
    }

    /// Returns the children of `parent`, empty if it is not a parent.
    pub fn children_of(&self, parent: &NodeId) -> BTreeSet<NodeId> {
        self.inner
            .read()
            .parents
            .get(parent)
            .cloned()
            .unwrap_or_default()
    }

    pub fn parent_of(&self, child: &NodeId) -> Option<NodeId> {
        self.inner.read().child_to_parent.get(child).cloned()
    }

    pub fn parents(&self) -> Vec<NodeId> {
        let mut parents: Vec<NodeId> = self.inner.read().parents.keys().cloned().collect();
        parents.sort();
        parents
    }

    /// Registers `child` under `parent`.
    ///
    /// Returns true if the child was not already attached to this parent.
    pub fn add_child(&self, parent: &NodeId, child: &NodeId) -> bool {
        if parent == child {
            debug!(node = %parent, "ignoring self-referencing HA relationship");
            return false;
        }
        let attached = self.inner.write().attach(parent, child);
        if attached {
            debug!(parent = %parent, child = %child, "HA child added");
        }
        attached
    }

    /// Marks `parent` as a known parent and attaches any members that
    /// claimed it earlier.
    ///
    /// Returns the members attached by this call.
    pub fn declare_parent(&self, parent: &NodeId) -> Vec<NodeId> {
        let mut inner = self.inner.write();
        inner.parents.entry(parent.clone()).or_default();
        let attached = inner.drain_claims_for(parent);
        if !attached.is_empty() {
            debug!(parent = %parent, count = attached.len(), "resolved pending HA claims");
        }
        attached
    }

    /// Records that `child` names `parent` as its group.
    ///
    /// Attaches immediately if the parent is known and returns true;
    /// otherwise detaches the child from any current parent and keeps the
    /// claim until the parent is declared.
    pub fn claim(&self, child: &NodeId, parent: &NodeId) -> bool {
        if child == parent {
            return false;
        }
        let mut inner = self.inner.write();
        if inner.parents.contains_key(parent) {
            inner.attach(parent, child);
            return true;
        }
        if let Some(previous) = inner.child_to_parent.remove(child) {
            if let Some(siblings) = inner.parents.get_mut(&previous) {
                siblings.remove(child);
            }
            info!(child = %child, from = %previous, to = %parent, "HA member left for a group not yet known");
        }
        inner.pending_claims.insert(child.clone(), parent.clone());
        false
    }

    /// Drops an unresolved claim of `child`.
    pub fn withdraw_claim(&self, child: &NodeId) {
        self.inner.write().pending_claims.remove(child);
    }

    pub fn pending_claim(&self, child: &NodeId) -> Option<NodeId> {
        self.inner.read().pending_claims.get(child).cloned()
    }

    /// Detaches `child` from its parent, returning the former parent.
    ///
    /// The parent stays known even if this was its last child.
    pub fn remove_child(&self, child: &NodeId) -> Option<NodeId> {
        let mut inner = self.inner.write();
        let parent = inner.child_to_parent.remove(child)?;
        if let Some(children) = inner.parents.get_mut(&parent) {
            children.remove(child);
        }
        debug!(parent = %parent, child = %child, "HA child removed");
        Some(parent)
    }

    /// Removes `parent` and detaches every one of its children.
    ///
    /// Returns the former children.
    pub fn remove_parent(&self, parent: &NodeId) -> BTreeSet<NodeId> {
        let mut inner = self.inner.write();
        let children = inner.parents.remove(parent).unwrap_or_default();
        for child in &children {
            inner.child_to_parent.remove(child);
        }
        if !children.is_empty() {
            info!(parent = %parent, children = children.len(), "HA group removed");
        }
        children
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.parents.clear();
        inner.child_to_parent.clear();
        inner.pending_claims.clear();
    }

    /// Verifies that both directions of the index agree.
    pub fn check_consistency(&self) -> Result<(), String> {
        let inner = self.inner.read();
        let mut seen: HashMap<&NodeId, &NodeId> = HashMap::new();
        for (parent, children) in &inner.parents {
            for child in children {
                if let Some(other) = seen.insert(child, parent) {
                    return Err(format!("{} is a child of both {} and {}", child, other, parent));
                }
                if inner.child_to_parent.get(child) != Some(parent) {
                    return Err(format!("{} listed under {} but not mapped back", child, parent));
                }
            }
        }
        for (child, parent) in &inner.child_to_parent {
            let listed = inner
                .parents
                .get(parent)
                .is_some_and(|children| children.contains(child));
            if !listed {
                return Err(format!("{} maps to {} which does not list it", child, parent));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    #[test]
    fn test_add_and_remove_parent() {
        let cache = HaCache::new();
        let p = id("hwvtep://ha1");
        let children = [id("hwvtep://s1"), id("hwvtep://s2")];

        for c in &children {
            assert!(cache.add_child(&p, c));
            assert!(cache.children_of(&p).contains(c));
            assert_eq!(cache.parent_of(c), Some(p.clone()));
            assert!(cache.is_child(c));
        }
        assert!(cache.is_parent(&p));

        let removed = cache.remove_parent(&p);
        assert_eq!(removed.len(), 2);
        for c in &children {
            assert_eq!(cache.parent_of(c), None);
            assert!(!cache.is_child(c));
        }
        assert!(!cache.is_parent(&p));
        assert!(cache.children_of(&p).is_empty());
        cache.check_consistency().unwrap();
    }

    #[test]
    fn test_add_child_is_idempotent() {
        let cache = HaCache::new();
        let p = id("hwvtep://ha1");
        let c = id("hwvtep://s1");

        assert!(cache.add_child(&p, &c));
        assert!(!cache.add_child(&p, &c));
        assert_eq!(cache.children_of(&p).len(), 1);
    }

    #[test]
    fn test_reparent_enforces_exclusivity() {
        let cache = HaCache::new();
        let p1 = id("hwvtep://ha1");
        let p2 = id("hwvtep://ha2");
        let c = id("hwvtep://s1");

        cache.add_child(&p1, &c);
        cache.add_child(&p2, &c);

        assert_eq!(cache.parent_of(&c), Some(p2.clone()));
        assert!(!cache.children_of(&p1).contains(&c));
        assert!(cache.children_of(&p2).contains(&c));
        // The old group stays known, just without this member
        assert!(cache.is_parent(&p1));
        cache.check_consistency().unwrap();
    }

    #[test]
    fn test_remove_child_keeps_parent() {
        let cache = HaCache::new();
        let p = id("hwvtep://ha1");
        let c = id("hwvtep://s1");
        cache.add_child(&p, &c);

        assert_eq!(cache.remove_child(&c), Some(p.clone()));
        assert_eq!(cache.remove_child(&c), None);
        assert!(cache.is_parent(&p));
        assert!(cache.children_of(&p).is_empty());
    }

    #[test]
    fn test_claim_before_parent_is_declared() {
        let cache = HaCache::new();
        let p = id("hwvtep://ha1");
        let c = id("hwvtep://s1");

        assert!(!cache.claim(&c, &p));
        assert_eq!(cache.pending_claim(&c), Some(p.clone()));
        assert!(!cache.is_child(&c));

        assert_eq!(cache.declare_parent(&p), vec![c.clone()]);
        assert_eq!(cache.parent_of(&c), Some(p.clone()));
        assert_eq!(cache.pending_claim(&c), None);

        // Claims against a known parent attach right away
        let c2 = id("hwvtep://s2");
        assert!(cache.claim(&c2, &p));
        assert_eq!(cache.children_of(&p).len(), 2);
    }

    #[test]
    fn test_claim_on_unknown_parent_detaches_current() {
        let cache = HaCache::new();
        cache.add_child(&id("hwvtep://ha1"), &id("hwvtep://s1"));

        assert!(!cache.claim(&id("hwvtep://s1"), &id("hwvtep://ha2")));
        assert_eq!(cache.parent_of(&id("hwvtep://s1")), None);
        assert!(cache.children_of(&id("hwvtep://ha1")).is_empty());
        assert_eq!(cache.pending_claim(&id("hwvtep://s1")), Some(id("hwvtep://ha2")));
        assert!(cache.check_consistency().is_ok());

        cache.declare_parent(&id("hwvtep://ha2"));
        assert_eq!(cache.parent_of(&id("hwvtep://s1")), Some(id("hwvtep://ha2")));
        assert!(cache.check_consistency().is_ok());
    }

    #[test]
    fn test_withdrawn_claim_is_not_resolved() {
        let cache = HaCache::new();
        let p = id("hwvtep://ha1");
        let c = id("hwvtep://s1");

        cache.claim(&c, &p);
        cache.withdraw_claim(&c);
        assert!(cache.declare_parent(&p).is_empty());
        assert!(!cache.is_child(&c));
    }

    #[test]
    fn test_self_reference_ignored() {
        let cache = HaCache::new();
        let p = id("hwvtep://ha1");
        assert!(!cache.add_child(&p, &p));
        assert!(!cache.claim(&p, &p));
        assert!(!cache.is_parent(&p));
    }

    #[test]
    fn test_concurrent_mutations_stay_consistent() {
        let cache = Arc::new(HaCache::new());
        let members: Vec<NodeId> = (0..8).map(|i| id(&format!("hwvtep://s{}", i))).collect();

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let cache = Arc::clone(&cache);
                let members = members.clone();
                scope.spawn(move || {
                    let parent = id(&format!("hwvtep://ha{}", worker));
                    for round in 0..500 {
                        for member in &members {
                            cache.add_child(&parent, member);
                        }
                        if round % 3 == 0 {
                            cache.remove_parent(&parent);
                        } else if let Some(member) = members.get(round % members.len()) {
                            cache.remove_child(member);
                        }
                    }
                });
            }

            let cache = Arc::clone(&cache);
            scope.spawn(move || {
                for _ in 0..2000 {
                    cache.check_consistency().unwrap();
                }
            });
        });

        cache.check_consistency().unwrap();
    }
}

//! Change notifications and write operations.

use hwvtep_types::{Node, NodeId};
use std::fmt;
use std::sync::Arc;

/// The two trees kept by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Datastore {
    /// Desired configuration.
    Config,
    /// Live state reported by devices.
    Operational,
}

impl fmt::Display for Datastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datastore::Config => f.write_str("config"),
            Datastore::Operational => f.write_str("operational"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// One node's transition inside a [`ChangeBatch`].
#[derive(Debug, Clone)]
pub struct NodeChange {
    pub id: NodeId,
    pub kind: ChangeKind,
    pub before: Option<Arc<Node>>,
    pub after: Option<Arc<Node>>,
}

impl NodeChange {
    /// Builds the change for a transition, or `None` if nothing changed.
    pub fn from_transition(
        id: NodeId,
        before: Option<Arc<Node>>,
        after: Option<Arc<Node>>,
    ) -> Option<Self> {
        let kind = match (&before, &after) {
            (None, None) => return None,
            (None, Some(_)) => ChangeKind::Create,
            (Some(_), None) => ChangeKind::Delete,
            (Some(b), Some(a)) if b == a => return None,
            (Some(_), Some(_)) => ChangeKind::Update,
        };
        Some(Self {
            id,
            kind,
            before,
            after,
        })
    }

    /// Returns the most recent view of the node.
    pub fn node(&self) -> Option<&Node> {
        self.after.as_deref().or(self.before.as_deref())
    }
}

/// Changes committed by one transaction against one datastore.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub datastore: Datastore,
    /// Store-wide commit sequence number.
    pub seq: u64,
    pub changes: Vec<NodeChange>,
}

impl ChangeBatch {
    pub fn of_kind(&self, kind: ChangeKind) -> impl Iterator<Item = &NodeChange> {
        self.changes.iter().filter(move |c| c.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// A buffered write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Replace the node.
    Put { datastore: Datastore, node: Node },
    /// Keyed merge into the node, creating it if absent.
    Merge { datastore: Datastore, node: Node },
    /// Remove the node.
    Delete { datastore: Datastore, id: NodeId },
}

impl WriteOp {
    pub fn datastore(&self) -> Datastore {
        match self {
            WriteOp::Put { datastore, .. }
            | WriteOp::Merge { datastore, .. }
            | WriteOp::Delete { datastore, .. } => *datastore,
        }
    }

    pub fn id(&self) -> &NodeId {
        match self {
            WriteOp::Put { node, .. } | WriteOp::Merge { node, .. } => &node.id,
            WriteOp::Delete { id, .. } => id,
        }
    }

    /// Applies this write to the current value of its node.
    pub fn apply(&self, current: Option<Node>) -> Option<Node> {
        match self {
            WriteOp::Put { node, .. } => Some(node.clone()),
            WriteOp::Merge { node, .. } => {
                let mut merged = current.unwrap_or_else(|| Node::new(node.id.clone()));
                merged.merge_from(node);
                Some(merged)
            }
            WriteOp::Delete { .. } => None,
        }
    }
}

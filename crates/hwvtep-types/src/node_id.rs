//! Hierarchical node identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::ParseError;

/// URI scheme shared by every device id.
const HWVTEP_URI_PREFIX: &str = "hwvtep://";

const HA_GROUP_PREFIX: &str = "hwvtep://uuid/";
const PHYSICAL_SWITCH_SEGMENT: &str = "/physicalswitch/";
const BRIDGE_SEGMENT: &str = "/bridge/";

/// Opaque hierarchical key of a device or sub-object.
///
/// Ids are stable across reconnects. Sub-objects embed the id of the
/// device that owns them:
///
/// ```text
/// hwvtep://uuid/<uuid>                    HA (logical) device
/// hwvtep://s1                             global (physical) device
/// hwvtep://s1/physicalswitch/tor1         physical switch of s1
/// hwvtep://s1/bridge/br-int               bridge of s1
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id from its path form.
    pub fn new(path: impl Into<String>) -> Self {
        NodeId(path.into())
    }

    /// Returns the id of the HA device for a group identity.
    ///
    /// Identities that are already device ids are used as-is; anything else
    /// is mapped to a name-based (v3) UUID so every member reporting the
    /// same identity resolves to the same device.
    pub fn for_ha_group(ha_id: &str) -> Self {
        let ha_id = ha_id.trim();
        if ha_id.starts_with(HWVTEP_URI_PREFIX) {
            return NodeId(ha_id.to_string());
        }
        let uuid = Uuid::new_v3(&Uuid::NAMESPACE_URL, ha_id.as_bytes());
        NodeId(format!("{}{}", HA_GROUP_PREFIX, uuid))
    }

    /// Returns the path form of this id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the id of the named physical switch under this device.
    pub fn physical_switch(&self, name: &str) -> NodeId {
        NodeId(format!("{}{}{}", self.0, PHYSICAL_SWITCH_SEGMENT, name))
    }

    /// Returns the id of the named bridge under this device.
    pub fn bridge(&self, name: &str) -> NodeId {
        NodeId(format!("{}{}{}", self.0, BRIDGE_SEGMENT, name))
    }

    /// Splits a physical switch id into its device id and switch name.
    pub fn split_physical_switch(&self) -> Option<(NodeId, &str)> {
        self.split_at_segment(PHYSICAL_SWITCH_SEGMENT)
    }

    /// Splits a bridge id into its device id and bridge name.
    pub fn split_bridge(&self) -> Option<(NodeId, &str)> {
        self.split_at_segment(BRIDGE_SEGMENT)
    }

    /// Returns true if this id names a device rather than a sub-object.
    pub fn is_device(&self) -> bool {
        self.split_physical_switch().is_none() && self.split_bridge().is_none()
    }

    /// Returns the owning device id (the id itself for devices).
    pub fn device(&self) -> NodeId {
        match self
            .split_physical_switch()
            .or_else(|| self.split_bridge())
        {
            Some((device, _)) => device,
            None => self.clone(),
        }
    }

    /// Rebases a sub-object id from one device onto another.
    ///
    /// Returns `None` if this id does not belong to `from`.
    pub fn rebase(&self, from: &NodeId, to: &NodeId) -> Option<NodeId> {
        if self == from {
            return Some(to.clone());
        }
        let rest = self.0.strip_prefix(from.as_str())?;
        rest.starts_with('/')
            .then(|| NodeId(format!("{}{}", to.as_str(), rest)))
    }

    fn split_at_segment(&self, segment: &str) -> Option<(NodeId, &str)> {
        let pos = self.0.rfind(segment)?;
        let name = &self.0[pos + segment.len()..];
        if name.is_empty() || pos == 0 {
            return None;
        }
        Some((NodeId(self.0[..pos].to_string()), name))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(ParseError::InvalidNodeId(s.to_string()));
        }
        Ok(NodeId(s.to_string()))
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId::new(s)
    }
}

//! Common types for the HWVTEP southbound HA engine.
//!
//! This crate provides the value types and the node data model shared by
//! the store, the HA engine and the daemon:
//!
//! - [`NodeId`]: hierarchical topology key (devices, physical switches, bridges)
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`VlanId`]: IEEE 802.1Q VLAN identifiers
//! - [`Node`]: a device record with its global, physical-switch and bridge
//!   augmentations plus termination points
//!
//! Every list in the model is keyed (see [`Keyed`]), so records can be
//! merged entry by entry without losing entries owned by the target.

mod mac;
mod model;
mod node_id;
mod vlan;

pub use mac::MacAddress;
pub use model::{
    merge_keyed, remove_keyed, BridgeAugmentation, ControllerEntry, GlobalAugmentation, Keyed,
    LocatorRef, LogicalSwitch, LogicalSwitchRef, Manager, McastMac, Node, OtherConfig,
    PhysicalSwitchAugmentation, TerminationPoint, TpKind, UcastMac, VlanBinding,
    HA_CHILDREN_KEY, HA_ENABLED_KEY, HA_ID_KEY,
};
pub use node_id::NodeId;
pub use vlan::VlanId;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid VLAN ID: {0} (must be 1-4094)")]
    InvalidVlanId(u16),

    #[error("invalid node id: {0}")]
    InvalidNodeId(String),
}

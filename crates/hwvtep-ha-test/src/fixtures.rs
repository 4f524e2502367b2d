//! Test fixtures for HA scenarios
//!
//! Provides node builders and reusable store changes

use hwvtep_store::{Datastore, WriteOp};
use hwvtep_types::{
    BridgeAugmentation, GlobalAugmentation, LocatorRef, LogicalSwitch, LogicalSwitchRef,
    MacAddress, Manager, Node, NodeId, OtherConfig, PhysicalSwitchAugmentation, TerminationPoint,
    UcastMac, VlanBinding, VlanId, HA_CHILDREN_KEY, HA_ID_KEY,
};

/// Manager target used for fixture devices
pub const FIXTURE_MANAGER: &str = "tcp:127.0.0.1:6640";

/// Store operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    /// Replace the node
    Put,
    /// Keyed merge into the node
    Merge,
    /// Remove the node
    Delete,
}

/// One write against the store
#[derive(Debug, Clone)]
pub struct StoreChange {
    pub datastore: Datastore,
    pub op: StoreOp,
    pub node: Node,
}

impl StoreChange {
    pub fn put(datastore: Datastore, node: Node) -> Self {
        Self {
            datastore,
            op: StoreOp::Put,
            node,
        }
    }

    pub fn merge(datastore: Datastore, node: Node) -> Self {
        Self {
            datastore,
            op: StoreOp::Merge,
            node,
        }
    }

    pub fn delete(datastore: Datastore, id: impl Into<NodeId>) -> Self {
        Self {
            datastore,
            op: StoreOp::Delete,
            node: Node::new(id.into()),
        }
    }

    pub fn into_write_op(self) -> WriteOp {
        let datastore = self.datastore;
        match self.op {
            StoreOp::Put => WriteOp::Put {
                datastore,
                node: self.node,
            },
            StoreOp::Merge => WriteOp::Merge {
                datastore,
                node: self.node,
            },
            StoreOp::Delete => WriteOp::Delete {
                datastore,
                id: self.node.id,
            },
        }
    }
}

/// Builder for fixture nodes
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    node: Node,
}

impl NodeBuilder {
    /// A device (global) node
    pub fn device(id: impl Into<NodeId>) -> Self {
        let mut node = Node::new(id.into());
        node.global = Some(GlobalAugmentation::default());
        Self { node }
    }

    /// A physical switch of `device`
    pub fn physical_switch(device: impl Into<NodeId>, name: &str) -> Self {
        let device = device.into();
        let mut node = Node::new(device.physical_switch(name));
        node.physical_switch = Some(PhysicalSwitchAugmentation {
            name: name.to_string(),
            managed_by: device,
            tunnel_ips: Vec::new(),
        });
        Self { node }
    }

    /// A bridge managed by `device`
    pub fn bridge(device: impl Into<NodeId>, name: &str) -> Self {
        let device = device.into();
        let mut node = Node::new(device.bridge(name));
        node.bridge = Some(BridgeAugmentation {
            name: name.to_string(),
            managed_by: device,
            protocol_entries: Vec::new(),
            controller_entries: Vec::new(),
            other_configs: Vec::new(),
        });
        Self { node }
    }

    pub fn id(&self) -> &NodeId {
        &self.node.id
    }

    fn global(&mut self) -> &mut GlobalAugmentation {
        self.node.global.get_or_insert_with(GlobalAugmentation::default)
    }

    /// Add a manager other-config entry
    pub fn with_other_config(mut self, key: &str, value: &str) -> Self {
        let global = self.global();
        if global.managers.is_empty() {
            global.managers.push(Manager {
                target: FIXTURE_MANAGER.to_string(),
                other_configs: Vec::new(),
            });
        }
        if let Some(manager) = global.managers.first_mut() {
            manager.other_configs.retain(|oc| oc.key != key);
            manager.other_configs.push(OtherConfig::new(key, value));
        }
        self
    }

    /// Declare the HA group this device belongs to
    pub fn with_ha_id(self, group: &str) -> Self {
        self.with_other_config(HA_ID_KEY, group)
    }

    /// Declare the members of this HA device
    pub fn with_ha_children(self, members: &[&str]) -> Self {
        self.with_other_config(HA_CHILDREN_KEY, &members.join(","))
    }

    pub fn with_logical_switch(mut self, name: &str, tunnel_key: u32) -> Self {
        self.global().logical_switches.push(LogicalSwitch {
            name: name.to_string(),
            tunnel_key: Some(tunnel_key),
            description: None,
        });
        self
    }

    /// Add a remote unicast MAC on one of this device's logical switches
    pub fn with_remote_ucast(mut self, mac: [u8; 6], logical_switch: &str, locator_ip: &str) -> Self {
        let id = self.node.id.clone();
        self.global().remote_ucast_macs.push(UcastMac {
            mac: MacAddress::new(mac),
            logical_switch: LogicalSwitchRef::new(id.clone(), logical_switch),
            locator: Some(LocatorRef::new(
                id,
                TerminationPoint::locator(locator_ip).tp_id,
            )),
            ip: None,
        });
        self
    }

    /// Add a VXLAN locator termination point
    pub fn with_locator(mut self, ip: &str) -> Self {
        self.node.termination_points.push(TerminationPoint::locator(ip));
        self
    }

    pub fn with_port(mut self, name: &str) -> Self {
        self.node.termination_points.push(TerminationPoint::port(name));
        self
    }

    /// Bind `vlan` on `port` to a logical switch of `device`
    pub fn with_vlan_binding(mut self, port: &str, vlan: u16, device: &str, logical_switch: &str) -> Self {
        let Ok(vlan) = VlanId::new(vlan) else {
            return self;
        };
        if let Some(tp) = self.node.termination_points.iter_mut().find(|tp| tp.name == port) {
            tp.vlan_bindings.push(VlanBinding {
                vlan,
                logical_switch: LogicalSwitchRef::new(NodeId::new(device), logical_switch),
            });
        }
        self
    }

    pub fn with_tunnel_ip(mut self, ip: &str) -> Self {
        if let Some(ps) = self.node.physical_switch.as_mut() {
            ps.tunnel_ips.push(ip.to_string());
        }
        self
    }

    pub fn with_protocols(mut self, protocols: &[&str]) -> Self {
        if let Some(bridge) = self.node.bridge.as_mut() {
            bridge.protocol_entries = protocols.iter().map(|p| p.to_string()).collect();
        }
        self
    }

    pub fn build(self) -> Node {
        self.node
    }

    /// Put into the config datastore
    pub fn config(self) -> StoreChange {
        StoreChange::put(Datastore::Config, self.node)
    }

    /// Put into the operational datastore
    pub fn operational(self) -> StoreChange {
        StoreChange::put(Datastore::Operational, self.node)
    }
}

/// HA group and member fixtures
pub mod ha_fixtures {
    use super::*;

    /// HA device config listing its members, with one logical switch
    pub fn ha_group(id: &str, members: &[&str]) -> NodeBuilder {
        NodeBuilder::device(id)
            .with_ha_children(members)
            .with_logical_switch("ls0", 5000)
    }

    /// A member as it reports itself operationally
    pub fn member_connected(id: &str, group: &str, switches: &[&str]) -> NodeBuilder {
        let mut builder = NodeBuilder::device(id).with_ha_id(group);
        for (i, ls) in switches.iter().enumerate() {
            builder = builder.with_logical_switch(ls, 5000 + i as u32);
        }
        builder
    }

    /// A member that disconnected
    pub fn member_disconnected(id: &str) -> StoreChange {
        StoreChange::delete(Datastore::Operational, id)
    }
}

/// Bridge reconciliation fixtures
pub mod bridge_fixtures {
    use super::*;

    /// Configured bridge with ports
    pub fn managed_bridge(device: &str, name: &str, ports: &[&str]) -> NodeBuilder {
        let mut builder = NodeBuilder::bridge(device, name).with_protocols(&["OpenFlow13"]);
        for port in ports {
            builder = builder.with_port(port);
        }
        builder
    }

    /// The bridge as the device reports it, without ports
    pub fn reported_bridge(device: &str, name: &str) -> StoreChange {
        NodeBuilder::bridge(device, name).operational()
    }
}

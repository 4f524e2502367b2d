//! Node data model.
//!
//! A [`Node`] is what the store keeps under a [`NodeId`]. A device carries a
//! [`GlobalAugmentation`]; a physical switch a [`PhysicalSwitchAugmentation`];
//! a bridge a [`BridgeAugmentation`]. Termination points hang off any of
//! them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{MacAddress, NodeId, VlanId};

/// Other-config key carrying the group identity on a member.
pub const HA_ID_KEY: &str = "ha_id";
/// Other-config key carrying the comma-separated member ids on a group.
pub const HA_CHILDREN_KEY: &str = "ha_children";
/// Other-config key carrying the HA enable flag.
pub const HA_ENABLED_KEY: &str = "ha_enabled";

/// Prefix of locator termination point ids.
const LOCATOR_TP_PREFIX: &str = "vxlan_over_ipv4:";

/// A list entry with a stable identity inside its list.
pub trait Keyed {
    type Key: Ord + Clone;

    fn key(&self) -> Self::Key;

    /// Folds `source`, an entry with the same key, into `self`.
    ///
    /// Entries without locally owned fields are simply replaced.
    fn merge_entry(&mut self, source: &Self)
    where
        Self: Clone,
    {
        *self = source.clone();
    }
}

/// Upserts every `source` entry into `target` by key.
///
/// Entries present only in `target` are kept; entries present in both are
/// merged field by field with [`Keyed::merge_entry`].
pub fn merge_keyed<T: Keyed + Clone>(target: &mut Vec<T>, source: &[T]) {
    for item in source {
        let key = item.key();
        match target.iter_mut().find(|t| t.key() == key) {
            Some(slot) => slot.merge_entry(item),
            None => target.push(item.clone()),
        }
    }
}

/// Removes every entry whose key is in `keys`.
pub fn remove_keyed<T: Keyed>(target: &mut Vec<T>, keys: &BTreeSet<T::Key>) {
    if keys.is_empty() {
        return;
    }
    target.retain(|t| !keys.contains(&t.key()));
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtherConfig {
    pub key: String,
    pub value: String,
}

impl OtherConfig {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Keyed for OtherConfig {
    type Key = String;

    fn key(&self) -> String {
        self.key.clone()
    }
}

/// Manager entry of a device; device metadata lives in its other-configs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Manager {
    pub target: String,
    #[serde(default)]
    pub other_configs: Vec<OtherConfig>,
}

impl Keyed for Manager {
    type Key = String;

    fn key(&self) -> String {
        self.target.clone()
    }

    fn merge_entry(&mut self, source: &Self) {
        merge_keyed(&mut self.other_configs, &source.other_configs);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalSwitch {
    pub name: String,
    #[serde(default)]
    pub tunnel_key: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Keyed for LogicalSwitch {
    type Key = String;

    fn key(&self) -> String {
        self.name.clone()
    }

    fn merge_entry(&mut self, source: &Self) {
        if source.tunnel_key.is_some() {
            self.tunnel_key = source.tunnel_key;
        }
        if source.description.is_some() {
            self.description = source.description.clone();
        }
    }
}

/// Reference to a logical switch of a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalSwitchRef {
    pub node: NodeId,
    pub name: String,
}

impl LogicalSwitchRef {
    pub fn new(node: NodeId, name: impl Into<String>) -> Self {
        Self {
            node,
            name: name.into(),
        }
    }

    fn rewrite(&mut self, from: &NodeId, to: &NodeId) {
        if let Some(node) = self.node.rebase(from, to) {
            self.node = node;
        }
    }
}

/// Reference to a locator termination point of a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocatorRef {
    pub node: NodeId,
    pub tp_id: String,
}

impl LocatorRef {
    pub fn new(node: NodeId, tp_id: impl Into<String>) -> Self {
        Self {
            node,
            tp_id: tp_id.into(),
        }
    }

    fn rewrite(&mut self, from: &NodeId, to: &NodeId) {
        if let Some(node) = self.node.rebase(from, to) {
            self.node = node;
        }
    }
}

impl Keyed for LocatorRef {
    type Key = LocatorRef;

    fn key(&self) -> LocatorRef {
        self.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UcastMac {
    pub mac: MacAddress,
    pub logical_switch: LogicalSwitchRef,
    #[serde(default)]
    pub locator: Option<LocatorRef>,
    #[serde(default)]
    pub ip: Option<String>,
}

impl UcastMac {
    pub fn rewrite_refs(&mut self, from: &NodeId, to: &NodeId) {
        self.logical_switch.rewrite(from, to);
        if let Some(locator) = self.locator.as_mut() {
            locator.rewrite(from, to);
        }
    }
}

impl Keyed for UcastMac {
    type Key = (MacAddress, String);

    fn key(&self) -> Self::Key {
        (self.mac, self.logical_switch.name.clone())
    }

    fn merge_entry(&mut self, source: &Self) {
        self.logical_switch = source.logical_switch.clone();
        if source.locator.is_some() {
            self.locator = source.locator.clone();
        }
        if source.ip.is_some() {
            self.ip = source.ip.clone();
        }
    }
}

/// Multicast MAC entry; `mac` may be the literal `unknown-dst`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McastMac {
    pub mac: String,
    pub logical_switch: LogicalSwitchRef,
    #[serde(default)]
    pub locators: Vec<LocatorRef>,
}

impl McastMac {
    pub fn rewrite_refs(&mut self, from: &NodeId, to: &NodeId) {
        self.logical_switch.rewrite(from, to);
        for locator in &mut self.locators {
            locator.rewrite(from, to);
        }
    }
}

impl Keyed for McastMac {
    type Key = (String, String);

    fn key(&self) -> Self::Key {
        (self.mac.clone(), self.logical_switch.name.clone())
    }

    fn merge_entry(&mut self, source: &Self) {
        self.logical_switch = source.logical_switch.clone();
        merge_keyed(&mut self.locators, &source.locators);
    }
}

/// Device-level state of a global node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalAugmentation {
    pub managers: Vec<Manager>,
    pub logical_switches: Vec<LogicalSwitch>,
    pub local_ucast_macs: Vec<UcastMac>,
    pub remote_ucast_macs: Vec<UcastMac>,
    pub local_mcast_macs: Vec<McastMac>,
    pub remote_mcast_macs: Vec<McastMac>,
    /// Physical switches reported by this device.
    pub switches: Vec<NodeId>,
}

impl GlobalAugmentation {
    /// Rewrites every logical-switch and locator reference to `from` so it
    /// points at `to`.
    pub fn rewrite_refs(&mut self, from: &NodeId, to: &NodeId) {
        for mac in self
            .local_ucast_macs
            .iter_mut()
            .chain(self.remote_ucast_macs.iter_mut())
        {
            mac.rewrite_refs(from, to);
        }
        for mac in self
            .local_mcast_macs
            .iter_mut()
            .chain(self.remote_mcast_macs.iter_mut())
        {
            mac.rewrite_refs(from, to);
        }
    }

    pub fn merge_from(&mut self, other: &GlobalAugmentation) {
        merge_keyed(&mut self.managers, &other.managers);
        merge_keyed(&mut self.logical_switches, &other.logical_switches);
        merge_keyed(&mut self.local_ucast_macs, &other.local_ucast_macs);
        merge_keyed(&mut self.remote_ucast_macs, &other.remote_ucast_macs);
        merge_keyed(&mut self.local_mcast_macs, &other.local_mcast_macs);
        merge_keyed(&mut self.remote_mcast_macs, &other.remote_mcast_macs);
        for switch in &other.switches {
            if !self.switches.contains(switch) {
                self.switches.push(switch.clone());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalSwitchAugmentation {
    pub name: String,
    /// Back-reference to the owning device.
    pub managed_by: NodeId,
    #[serde(default)]
    pub tunnel_ips: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerEntry {
    pub target: String,
}

impl Keyed for ControllerEntry {
    type Key = String;

    fn key(&self) -> String {
        self.target.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeAugmentation {
    pub name: String,
    /// Back-reference to the device the bridge belongs to.
    pub managed_by: NodeId,
    #[serde(default)]
    pub protocol_entries: Vec<String>,
    #[serde(default)]
    pub controller_entries: Vec<ControllerEntry>,
    #[serde(default)]
    pub other_configs: Vec<OtherConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpKind {
    #[default]
    Port,
    Vxlan,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanBinding {
    pub vlan: VlanId,
    pub logical_switch: LogicalSwitchRef,
}

impl Keyed for VlanBinding {
    type Key = VlanId;

    fn key(&self) -> VlanId {
        self.vlan
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationPoint {
    pub tp_id: String,
    pub name: String,
    #[serde(default)]
    pub kind: TpKind,
    #[serde(default)]
    pub vlan_bindings: Vec<VlanBinding>,
    #[serde(default)]
    pub locator_ip: Option<String>,
}

impl TerminationPoint {
    pub fn port(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            tp_id: name.clone(),
            name,
            kind: TpKind::Port,
            vlan_bindings: Vec::new(),
            locator_ip: None,
        }
    }

    /// Creates a VXLAN locator termination point for a tunnel endpoint.
    pub fn locator(ip: &str) -> Self {
        let tp_id = format!("{}{}", LOCATOR_TP_PREFIX, ip);
        Self {
            tp_id: tp_id.clone(),
            name: tp_id,
            kind: TpKind::Vxlan,
            vlan_bindings: Vec::new(),
            locator_ip: Some(ip.to_string()),
        }
    }

    pub fn is_locator(&self) -> bool {
        self.kind == TpKind::Vxlan
    }

    pub fn rewrite_refs(&mut self, from: &NodeId, to: &NodeId) {
        for binding in &mut self.vlan_bindings {
            binding.logical_switch.rewrite(from, to);
        }
    }
}

impl Keyed for TerminationPoint {
    type Key = String;

    fn key(&self) -> String {
        self.tp_id.clone()
    }

    fn merge_entry(&mut self, source: &Self) {
        self.name = source.name.clone();
        self.kind = source.kind;
        merge_keyed(&mut self.vlan_bindings, &source.vlan_bindings);
        if source.locator_ip.is_some() {
            self.locator_ip = source.locator_ip.clone();
        }
    }
}

/// A record in the config or operational datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(default)]
    pub global: Option<GlobalAugmentation>,
    #[serde(default)]
    pub physical_switch: Option<PhysicalSwitchAugmentation>,
    #[serde(default)]
    pub bridge: Option<BridgeAugmentation>,
    #[serde(default)]
    pub termination_points: Vec<TerminationPoint>,
}

impl Node {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            global: None,
            physical_switch: None,
            bridge: None,
            termination_points: Vec::new(),
        }
    }

    /// Looks up a manager other-config value; the first manager carrying the
    /// key wins.
    pub fn other_config(&self, key: &str) -> Option<&str> {
        self.global
            .as_ref()?
            .managers
            .iter()
            .flat_map(|m| m.other_configs.iter())
            .find(|oc| oc.key == key)
            .map(|oc| oc.value.as_str())
    }

    /// Returns the HA device this node claims membership of.
    pub fn ha_id(&self) -> Option<NodeId> {
        self.other_config(HA_ID_KEY)
            .filter(|v| !v.trim().is_empty())
            .map(NodeId::for_ha_group)
    }

    /// Returns the member ids this node declares, or `None` if the node
    /// carries no `ha_children` key at all.
    ///
    /// Malformed entries are skipped; duplicates are collapsed.
    pub fn ha_children(&self) -> Option<Vec<NodeId>> {
        let raw = self.other_config(HA_CHILDREN_KEY)?;
        let mut children: Vec<NodeId> = Vec::new();
        for id in raw.split(',').filter_map(|s| s.parse::<NodeId>().ok()) {
            if !children.contains(&id) {
                children.push(id);
            }
        }
        Some(children)
    }

    pub fn ha_enabled(&self) -> bool {
        self.other_config(HA_ENABLED_KEY)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Keyed merge of `other` into `self`.
    pub fn merge_from(&mut self, other: &Node) {
        match (self.global.as_mut(), other.global.as_ref()) {
            (Some(mine), Some(theirs)) => mine.merge_from(theirs),
            (None, Some(theirs)) => self.global = Some(theirs.clone()),
            _ => {}
        }

        if let Some(theirs) = other.physical_switch.as_ref() {
            match self.physical_switch.as_mut() {
                Some(mine) => {
                    mine.name = theirs.name.clone();
                    mine.managed_by = theirs.managed_by.clone();
                    for ip in &theirs.tunnel_ips {
                        if !mine.tunnel_ips.contains(ip) {
                            mine.tunnel_ips.push(ip.clone());
                        }
                    }
                }
                None => self.physical_switch = Some(theirs.clone()),
            }
        }

        if let Some(theirs) = other.bridge.as_ref() {
            match self.bridge.as_mut() {
                Some(mine) => {
                    mine.name = theirs.name.clone();
                    mine.managed_by = theirs.managed_by.clone();
                    for proto in &theirs.protocol_entries {
                        if !mine.protocol_entries.contains(proto) {
                            mine.protocol_entries.push(proto.clone());
                        }
                    }
                    merge_keyed(&mut mine.controller_entries, &theirs.controller_entries);
                    merge_keyed(&mut mine.other_configs, &theirs.other_configs);
                }
                None => self.bridge = Some(theirs.clone()),
            }
        }

        merge_keyed(&mut self.termination_points, &other.termination_points);
    }
}

//! HA group state machine over the operational datastore.
//!
//! ```text
//!                 first member up            aggregate written
//!  Disconnected ──────────────────> MemberConnected ──────────> GroupFormed
//!       ▲                                                         │    ▲
//!       │ logical device deleted        last member down          │    │ member up
//!       └──────────────────────── GroupDissolved <────────────────┘    │
//!                                        └─────────────────────────────┘
//! ```
//!
//! The aggregate of a group is the operational node of its HA device. It is
//! recomputed from the live members' operational state, at most once per
//! group per batch. Registry changes made while handling a batch are staged
//! and only become visible once the batch's transaction commits. Cache
//! removals caused by deletes are staged the same way.

use async_trait::async_trait;
use hwvtep_store::{ChangeBatch, ChangeKind, ChangeListener, Datastore, NodeChange, Transaction};
use hwvtep_types::{
    merge_keyed, GlobalAugmentation, Node, NodeId, PhysicalSwitchAugmentation,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::propagation::replicated_global;
use crate::{ConfigPropagation, HaCache, HaError, HaResult, RelationshipDiscovery};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum GroupState {
    #[default]
    Disconnected,
    MemberConnected,
    GroupFormed,
    GroupDissolved,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GroupState::Disconnected => "disconnected",
            GroupState::MemberConnected => "member-connected",
            GroupState::GroupFormed => "formed",
            GroupState::GroupDissolved => "dissolved",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupRecord {
    pub state: GroupState,
    pub live_members: BTreeSet<NodeId>,
}

/// Per-group state and live membership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupRegistry {
    groups: BTreeMap<NodeId, GroupRecord>,
}

impl GroupRegistry {
    pub fn state(&self, group: &NodeId) -> GroupState {
        self.groups
            .get(group)
            .map(|r| r.state)
            .unwrap_or_default()
    }

    pub fn live_members(&self, group: &NodeId) -> BTreeSet<NodeId> {
        self.groups
            .get(group)
            .map(|r| r.live_members.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, group: &NodeId) -> bool {
        self.groups.contains_key(group)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &GroupRecord)> {
        self.groups.iter()
    }

    /// Marks `member` live. Returns true if it was not live before.
    fn member_up(&mut self, group: &NodeId, member: &NodeId) -> bool {
        let record = self.groups.entry(group.clone()).or_default();
        let first = record.live_members.is_empty();
        let added = record.live_members.insert(member.clone());
        if first && added && record.state != GroupState::GroupFormed {
            record.state = GroupState::MemberConnected;
        }
        added
    }

    fn member_down(&mut self, group: &NodeId, member: &NodeId) -> bool {
        self.groups
            .get_mut(group)
            .is_some_and(|r| r.live_members.remove(member))
    }

    fn set_state(&mut self, group: &NodeId, state: GroupState) {
        self.groups.entry(group.clone()).or_default().state = state;
    }

    fn remove(&mut self, group: &NodeId) -> Option<GroupRecord> {
        self.groups.remove(group)
    }

    fn group_of(&self, member: &NodeId) -> Option<NodeId> {
        self.groups
            .iter()
            .find(|(_, r)| r.live_members.contains(member))
            .map(|(g, _)| g.clone())
    }
}

/// State machine statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateMachineStats {
    pub groups_formed: u64,
    pub groups_dissolved: u64,
    pub members_connected: u64,
    pub members_disconnected: u64,
}

/// Everything the machine changes while handling a batch.
#[derive(Debug, Clone, Default)]
struct MachineState {
    registry: GroupRegistry,
    /// Live devices whose group was unknown when they connected.
    unaffiliated: BTreeSet<NodeId>,
    /// Members that disconnected, by the group they left.
    departed: HashMap<NodeId, NodeId>,
}

/// Cache removals held back until the batch commits.
#[derive(Debug, Default)]
struct CacheOps {
    removed_groups: BTreeSet<NodeId>,
    departed_members: BTreeSet<NodeId>,
}

impl CacheOps {
    fn apply(self, cache: &HaCache) {
        for member in &self.departed_members {
            cache.withdraw_claim(member);
            cache.remove_child(member);
        }
        for group in &self.removed_groups {
            cache.remove_parent(group);
        }
    }
}

/// Work collected while walking one batch.
#[derive(Debug, Default)]
struct BatchWork {
    refresh: BTreeSet<NodeId>,
    sync: BTreeSet<(NodeId, NodeId)>,
    cache_ops: CacheOps,
}

pub struct HaStateMachine {
    cache: Arc<HaCache>,
    discovery: RelationshipDiscovery,
    propagation: ConfigPropagation,
    state: MachineState,
    staged: Option<(MachineState, CacheOps)>,
    view: Arc<RwLock<GroupRegistry>>,
    stats: StateMachineStats,
}

impl fmt::Debug for HaStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HaStateMachine")
            .field("groups", &self.state.registry.groups.len())
            .field("staged", &self.staged.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

impl HaStateMachine {
    pub fn new(cache: Arc<HaCache>) -> Self {
        Self {
            discovery: RelationshipDiscovery::new(Arc::clone(&cache)),
            cache,
            propagation: ConfigPropagation::new(),
            state: MachineState::default(),
            staged: None,
            view: Arc::new(RwLock::new(GroupRegistry::default())),
            stats: StateMachineStats::default(),
        }
    }

    /// Shared read-only view of the committed registry.
    pub fn registry_view(&self) -> Arc<RwLock<GroupRegistry>> {
        Arc::clone(&self.view)
    }

    pub fn registry(&self) -> &GroupRegistry {
        &self.state.registry
    }

    pub fn stats(&self) -> &StateMachineStats {
        &self.stats
    }

    fn member_up(&self, state: &mut MachineState, work: &mut BatchWork, group: &NodeId, member: &NodeId) {
        state.unaffiliated.remove(member);
        state.departed.remove(member);
        if let Some(previous) = state.registry.group_of(member).filter(|g| g != group) {
            state.registry.member_down(&previous, member);
            work.sync.retain(|(g, m)| !(g == &previous && m == member));
            work.refresh.insert(previous.clone());
            info!(member = %member, from = %previous, to = %group, "HA member moved between groups");
        }
        if state.registry.member_up(group, member) {
            debug!(group = %group, member = %member, "HA member up");
            work.sync.insert((group.clone(), member.clone()));
        }
        work.refresh.insert(group.clone());
    }

    /// Resolves the group of a device that just came up, re-attaching
    /// members that left while disconnected.
    fn resolve_group(&self, state: &MachineState, id: &NodeId) -> Option<NodeId> {
        if let Some(group) = self.cache.parent_of(id) {
            return Some(group);
        }
        let group = state.departed.get(id)?.clone();
        if self.cache.is_parent(&group) && self.cache.add_child(&group, id) {
            debug!(group = %group, member = %id, "reconnected member re-attached");
            return Some(group);
        }
        None
    }

    fn on_connected(&self, change: &NodeChange, state: &mut MachineState, work: &mut BatchWork) {
        let id = &change.id;
        if let Some((device, _)) = id.split_physical_switch() {
            if let Some(group) = state.registry.group_of(&device) {
                work.refresh.insert(group);
            }
            return;
        }
        if !id.is_device() {
            return;
        }

        self.discovery
            .apply(id, change.before.as_deref(), change.after.as_deref());

        if self.cache.is_parent(id) {
            match state.registry.state(id) {
                GroupState::GroupFormed => {
                    debug!(group = %id, "own aggregate created");
                }
                _ if !state.registry.live_members(id).is_empty() => {
                    work.refresh.insert(id.clone());
                }
                _ => {
                    info!(group = %id, "HA device connected without live members");
                    state.registry.set_state(id, GroupState::Disconnected);
                }
            }
            for child in self.cache.children_of(id) {
                if state.registry.live_members(id).contains(&child) {
                    work.sync.insert((id.clone(), child));
                }
            }
            return;
        }

        match self.resolve_group(state, id) {
            Some(group) => self.member_up(state, work, &group, id),
            None => {
                debug!(node = %id, "device connected outside any HA group");
                state.unaffiliated.insert(id.clone());
            }
        }
    }

    fn on_updated(&self, change: &NodeChange, state: &mut MachineState, work: &mut BatchWork) {
        let id = &change.id;
        if let Some((device, _)) = id.split_physical_switch() {
            if let Some(group) = state.registry.group_of(&device) {
                work.refresh.insert(group);
            }
            return;
        }
        if !id.is_device() {
            return;
        }

        let outcome = self
            .discovery
            .apply(id, change.before.as_deref(), change.after.as_deref());
        if self.cache.is_parent(id) {
            return;
        }

        for (group, member) in &outcome.detached {
            if member == id && state.registry.member_down(group, member) {
                state.unaffiliated.insert(member.clone());
                work.refresh.insert(group.clone());
            }
        }
        if let Some(group) = self.cache.parent_of(id) {
            self.member_up(state, work, &group, id);
        }
    }

    async fn on_deleted(
        &self,
        change: &NodeChange,
        state: &mut MachineState,
        work: &mut BatchWork,
        tx: &mut Transaction,
    ) -> HaResult<()> {
        let id = &change.id;
        if let Some((device, _)) = id.split_physical_switch() {
            if let Some(group) = state.registry.group_of(&device) {
                work.refresh.insert(group);
            }
            return Ok(());
        }
        if !id.is_device() {
            return Ok(());
        }

        if state.registry.contains(id) || self.cache.is_parent(id) {
            if state.registry.state(id) == GroupState::GroupDissolved {
                debug!(group = %id, "own aggregate deleted");
                return Ok(());
            }
            if tx.read(Datastore::Operational, id).await?.is_some() {
                debug!(group = %id, "stale delete of a live HA device ignored");
                return Ok(());
            }
            let former = self.cache.children_of(id);
            work.cache_ops.removed_groups.insert(id.clone());
            state.registry.remove(id);
            work.refresh.remove(id);
            work.sync.retain(|(group, _)| group != id);
            if let Some(global) = change.before.as_ref().and_then(|n| n.global.as_ref()) {
                for switch in &global.switches {
                    tx.delete(Datastore::Operational, switch.clone());
                }
            }
            info!(group = %id, members = former.len(), "HA device removed, group destroyed");
            return Ok(());
        }

        state.unaffiliated.remove(id);
        work.cache_ops.departed_members.insert(id.clone());
        let group = self
            .cache
            .parent_of(id)
            .filter(|g| !work.cache_ops.removed_groups.contains(g))
            .or_else(|| state.registry.group_of(id));
        if let Some(group) = group {
            state.registry.member_down(&group, id);
            state.departed.insert(id.clone(), group.clone());
            work.sync.retain(|(_, member)| member != id);
            work.refresh.insert(group.clone());
            debug!(group = %group, member = %id, "HA member down");
        }
        Ok(())
    }

    /// Picks up devices whose group became known after they connected.
    fn adopt_unaffiliated(&self, state: &mut MachineState, work: &mut BatchWork) {
        let pending: Vec<NodeId> = state.unaffiliated.iter().cloned().collect();
        for id in pending {
            let group = self
                .cache
                .parent_of(&id)
                .filter(|g| !work.cache_ops.removed_groups.contains(g));
            if let Some(group) = group {
                self.member_up(state, work, &group, &id);
            }
        }
    }

    /// Recomputes the aggregate of `group` from its live members.
    async fn refresh_aggregate(
        &self,
        group: &NodeId,
        state: &mut MachineState,
        tx: &mut Transaction,
    ) -> HaResult<()> {
        let members = state.registry.live_members(group);
        let previous = tx.read(Datastore::Operational, group).await?;
        let old_switches: Vec<NodeId> = previous
            .as_ref()
            .and_then(|n| n.global.as_ref())
            .map(|g| g.switches.clone())
            .unwrap_or_default();

        if members.is_empty() {
            if state.registry.state(group) == GroupState::GroupFormed {
                if previous.is_some() {
                    tx.delete(Datastore::Operational, group.clone());
                }
                for switch in old_switches {
                    tx.delete(Datastore::Operational, switch);
                }
                state.registry.set_state(group, GroupState::GroupDissolved);
            }
            return Ok(());
        }

        let all = tx
            .broker()
            .read_all(Datastore::Operational)
            .await
            .map_err(|e| HaError::store("aggregate member scan", e))?;

        let mut aggregate = previous.clone().unwrap_or_else(|| Node::new(group.clone()));
        let mut global = GlobalAugmentation {
            managers: aggregate
                .global
                .as_ref()
                .map(|g| g.managers.clone())
                .unwrap_or_default(),
            ..Default::default()
        };
        let mut locators = Vec::new();
        let mut switches: BTreeMap<NodeId, Node> = BTreeMap::new();

        for member in &members {
            let Some(node) = all.iter().find(|n| &n.id == member) else {
                debug!(error = %HaError::lookup_miss("member", member), "skipping member");
                continue;
            };
            if let Some(member_global) = node.global.as_ref() {
                let mut projected = replicated_global(member_global);
                projected.rewrite_refs(member, group);
                global.merge_from(&projected);
            }
            let tps: Vec<_> = node
                .termination_points
                .iter()
                .filter(|tp| tp.is_locator())
                .cloned()
                .collect();
            merge_keyed(&mut locators, &tps);

            for ps in all.iter().filter(|n| {
                n.id.split_physical_switch()
                    .is_some_and(|(device, _)| &device == member)
            }) {
                let Some((_, name)) = ps.id.split_physical_switch() else {
                    continue;
                };
                let ha_ps = group.physical_switch(name);
                let entry = switches.entry(ha_ps.clone()).or_insert_with(|| {
                    let mut node = Node::new(ha_ps.clone());
                    node.physical_switch = Some(PhysicalSwitchAugmentation {
                        name: name.to_string(),
                        managed_by: group.clone(),
                        tunnel_ips: Vec::new(),
                    });
                    node
                });
                let mut contribution = Node::new(ha_ps.clone());
                contribution.physical_switch = Some(PhysicalSwitchAugmentation {
                    name: name.to_string(),
                    managed_by: group.clone(),
                    tunnel_ips: ps
                        .physical_switch
                        .as_ref()
                        .map(|p| p.tunnel_ips.clone())
                        .unwrap_or_default(),
                });
                contribution.termination_points = ps
                    .termination_points
                    .iter()
                    .cloned()
                    .map(|mut tp| {
                        tp.rewrite_refs(member, group);
                        tp
                    })
                    .collect();
                entry.merge_from(&contribution);
            }
        }

        global.switches = switches.keys().cloned().collect();
        aggregate.global = Some(global);
        aggregate.termination_points = locators;
        if previous.as_ref() != Some(&aggregate) {
            debug!(group = %group, members = members.len(), "writing HA aggregate");
            tx.put(Datastore::Operational, aggregate);
        }

        for stale in old_switches.iter().filter(|s| !switches.contains_key(*s)) {
            tx.delete(Datastore::Operational, stale.clone());
        }
        for (id, node) in switches {
            if tx.read(Datastore::Operational, &id).await?.as_ref() != Some(&node) {
                tx.put(Datastore::Operational, node);
            }
        }

        state.registry.set_state(group, GroupState::GroupFormed);
        Ok(())
    }

    fn publish(&mut self, previous: &GroupRegistry) {
        for (group, record) in self.state.registry.iter() {
            let before = previous.state(group);
            if before != record.state {
                info!(group = %group, from = %before, to = %record.state, "HA group state changed");
                match record.state {
                    GroupState::GroupFormed => self.stats.groups_formed += 1,
                    GroupState::GroupDissolved => self.stats.groups_dissolved += 1,
                    _ => {}
                }
            }
            let was = previous.live_members(group);
            self.stats.members_connected +=
                record.live_members.difference(&was).count() as u64;
            self.stats.members_disconnected +=
                was.difference(&record.live_members).count() as u64;
        }
        *self.view.write() = self.state.registry.clone();
    }
}

#[async_trait]
impl ChangeListener for HaStateMachine {
    type Error = HaError;

    fn name(&self) -> &str {
        "ha-state-machine"
    }

    fn datastore(&self) -> Datastore {
        Datastore::Operational
    }

    async fn handle_batch(&mut self, batch: &ChangeBatch, tx: &mut Transaction) -> HaResult<()> {
        let mut state = self.state.clone();
        let mut work = BatchWork::default();

        for change in batch.of_kind(ChangeKind::Create) {
            self.on_connected(change, &mut state, &mut work);
        }
        for change in batch.of_kind(ChangeKind::Update) {
            self.on_updated(change, &mut state, &mut work);
        }
        for change in batch.of_kind(ChangeKind::Delete) {
            self.on_deleted(change, &mut state, &mut work, tx).await?;
        }
        self.adopt_unaffiliated(&mut state, &mut work);

        for group in &work.refresh {
            self.refresh_aggregate(group, &mut state, tx).await?;
        }
        for (group, member) in &work.sync {
            let report = self.propagation.sync_child(group, member, tx).await?;
            debug!(group = %group, member = %member, written = report.written.len(), "member brought up to group config");
        }

        self.staged = Some((state, work.cache_ops));
        Ok(())
    }

    async fn on_committed(&mut self) {
        if let Some((state, cache_ops)) = self.staged.take() {
            cache_ops.apply(&self.cache);
            let previous = std::mem::replace(&mut self.state, state);
            self.publish(&previous.registry);
        }
    }

    async fn on_abandoned(&mut self) {
        if self.staged.take().is_some() {
            debug!("discarding staged HA group transitions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwvtep_store::{DataBroker, MemoryBroker, WriteOp};
    use hwvtep_types::{LogicalSwitch, Manager, OtherConfig, TerminationPoint, HA_ID_KEY};
    use pretty_assertions::assert_eq;

    fn ha() -> NodeId {
        NodeId::new("hwvtep://ha1")
    }

    fn member(id: &str, switches: &[&str]) -> Node {
        member_of(id, &ha(), switches)
    }

    fn member_of(id: &str, group: &NodeId, switches: &[&str]) -> Node {
        let mut node = Node::new(NodeId::new(id));
        node.global = Some(GlobalAugmentation {
            managers: vec![Manager {
                target: "tcp:10.0.0.1:6640".to_string(),
                other_configs: vec![OtherConfig::new(HA_ID_KEY, group.as_str())],
            }],
            logical_switches: switches
                .iter()
                .map(|s| LogicalSwitch {
                    name: s.to_string(),
                    tunnel_key: None,
                    description: None,
                })
                .collect(),
            ..Default::default()
        });
        node.termination_points
            .push(TerminationPoint::locator(&format!("10.0.0.{}", id.len())));
        node
    }

    fn create(node: Node) -> NodeChange {
        NodeChange::from_transition(node.id.clone(), None, Some(Arc::new(node))).unwrap()
    }

    fn update(before: Node, after: Node) -> NodeChange {
        NodeChange::from_transition(before.id.clone(), Some(Arc::new(before)), Some(Arc::new(after)))
            .unwrap()
    }

    fn delete(node: Node) -> NodeChange {
        NodeChange::from_transition(node.id.clone(), Some(Arc::new(node)), None).unwrap()
    }

    fn batch(changes: Vec<NodeChange>) -> ChangeBatch {
        ChangeBatch {
            datastore: Datastore::Operational,
            seq: 1,
            changes,
        }
    }

    async fn run(
        machine: &mut HaStateMachine,
        broker: &Arc<MemoryBroker>,
        changes: Vec<NodeChange>,
    ) {
        let mut tx = Transaction::new(broker.clone());
        machine.handle_batch(&batch(changes), &mut tx).await.unwrap();
        tx.commit().await.unwrap();
        machine.on_committed().await;
    }

    async fn seed(broker: &Arc<MemoryBroker>, node: &Node) {
        broker
            .commit(vec![WriteOp::Put {
                datastore: Datastore::Operational,
                node: node.clone(),
            }])
            .await
            .unwrap();
    }

    fn machine() -> (HaStateMachine, Arc<HaCache>) {
        let cache = Arc::new(HaCache::new());
        cache.declare_parent(&ha());
        (HaStateMachine::new(cache.clone()), cache)
    }

    #[tokio::test]
    async fn test_first_member_forms_group() {
        let broker = MemoryBroker::new();
        let (mut machine, cache) = machine();
        let s1 = member("hwvtep://s1", &["ls0"]);
        seed(&broker, &s1).await;

        run(&mut machine, &broker, vec![create(s1)]).await;

        assert_eq!(machine.registry().state(&ha()), GroupState::GroupFormed);
        assert!(cache.is_child(&NodeId::new("hwvtep://s1")));
        let aggregate = broker.get(Datastore::Operational, &ha()).unwrap();
        assert_eq!(aggregate.global.unwrap().logical_switches.len(), 1);
        assert_eq!(machine.stats().groups_formed, 1);
    }

    #[tokio::test]
    async fn test_aggregate_unions_members() {
        let broker = MemoryBroker::new();
        let (mut machine, _cache) = machine();
        let s1 = member("hwvtep://s1", &["ls0", "ls1"]);
        let s2 = member("hwvtep://s22", &["ls1", "ls2"]);
        seed(&broker, &s1).await;
        seed(&broker, &s2).await;

        run(&mut machine, &broker, vec![create(s1), create(s2)]).await;

        let aggregate = broker.get(Datastore::Operational, &ha()).unwrap();
        let names: Vec<String> = aggregate
            .global
            .unwrap()
            .logical_switches
            .into_iter()
            .map(|ls| ls.name)
            .collect();
        assert_eq!(names, vec!["ls0", "ls1", "ls2"]);
        assert_eq!(aggregate.termination_points.len(), 2);
    }

    #[tokio::test]
    async fn test_group_refreshed_once_per_batch() {
        let broker = MemoryBroker::new();
        let (mut machine, _cache) = machine();
        let s1 = member("hwvtep://s1", &["ls0"]);
        seed(&broker, &s1).await;
        run(&mut machine, &broker, vec![create(s1.clone())]).await;

        let s1_updated = member("hwvtep://s1", &["ls0", "ls1"]);
        let s2 = member("hwvtep://s22", &["ls2"]);
        seed(&broker, &s1_updated).await;
        seed(&broker, &s2).await;

        let mut tx = Transaction::new(broker.clone());
        machine
            .handle_batch(
                &batch(vec![update(s1, s1_updated), create(s2)]),
                &mut tx,
            )
            .await
            .unwrap();

        let aggregate_puts = tx
            .pending()
            .iter()
            .filter(|op| {
                matches!(op, WriteOp::Put { datastore: Datastore::Operational, node } if node.id == ha())
            })
            .count();
        assert_eq!(aggregate_puts, 1);
    }

    #[tokio::test]
    async fn test_member_moving_groups_leaves_old_aggregate() {
        let broker = MemoryBroker::new();
        let (mut machine, cache) = machine();
        let ha2 = NodeId::new("hwvtep://ha2");
        cache.declare_parent(&ha2);

        let s1 = member("hwvtep://s1", &["only-s1"]);
        let s2 = member("hwvtep://s22", &["s2ls"]);
        seed(&broker, &s1).await;
        seed(&broker, &s2).await;
        run(&mut machine, &broker, vec![create(s1.clone()), create(s2.clone())]).await;

        let moved = member_of("hwvtep://s1", &ha2, &["only-s1"]);
        seed(&broker, &moved).await;
        run(&mut machine, &broker, vec![update(s1.clone(), moved)]).await;

        assert_eq!(cache.parent_of(&s1.id), Some(ha2.clone()));
        assert!(cache.check_consistency().is_ok());
        assert_eq!(
            machine.registry().live_members(&ha()),
            BTreeSet::from([s2.id.clone()])
        );
        assert_eq!(
            machine.registry().live_members(&ha2),
            BTreeSet::from([s1.id.clone()])
        );

        let names: Vec<String> = broker
            .get(Datastore::Operational, &ha())
            .unwrap()
            .global
            .unwrap()
            .logical_switches
            .into_iter()
            .map(|ls| ls.name)
            .collect();
        assert_eq!(names, vec!["s2ls"]);
        assert!(broker.get(Datastore::Operational, &ha2).is_some());
    }

    #[tokio::test]
    async fn test_abandoned_member_delete_keeps_membership() {
        let broker = MemoryBroker::new();
        let (mut machine, cache) = machine();
        let s1 = member("hwvtep://s1", &["ls0"]);
        seed(&broker, &s1).await;
        run(&mut machine, &broker, vec![create(s1.clone())]).await;

        let mut tx = Transaction::new(broker.clone());
        machine
            .handle_batch(&batch(vec![delete(s1.clone())]), &mut tx)
            .await
            .unwrap();
        machine.on_abandoned().await;

        assert_eq!(cache.parent_of(&s1.id), Some(ha()));
        assert!(machine.registry().live_members(&ha()).contains(&s1.id));

        run(&mut machine, &broker, vec![create(s1.clone())]).await;
        assert_eq!(cache.parent_of(&s1.id), Some(ha()));
        assert_eq!(machine.registry().state(&ha()), GroupState::GroupFormed);

        run(&mut machine, &broker, vec![delete(s1.clone())]).await;
        assert!(!cache.is_child(&s1.id));
    }

    #[tokio::test]
    async fn test_last_member_down_dissolves() {
        let broker = MemoryBroker::new();
        let (mut machine, _cache) = machine();
        let s1 = member("hwvtep://s1", &["ls0"]);
        seed(&broker, &s1).await;
        run(&mut machine, &broker, vec![create(s1.clone())]).await;

        run(&mut machine, &broker, vec![delete(s1)]).await;

        assert_eq!(machine.registry().state(&ha()), GroupState::GroupDissolved);
        assert!(broker.get(Datastore::Operational, &ha()).is_none());

        // The delete notification of our own aggregate leaves the cache alone
        let own = Node::new(ha());
        run(&mut machine, &broker, vec![delete(own)]).await;
        assert_eq!(machine.registry().state(&ha()), GroupState::GroupDissolved);
    }

    #[tokio::test]
    async fn test_reconnect_reforms_group() {
        let broker = MemoryBroker::new();
        let (mut machine, cache) = machine();
        let s1 = member("hwvtep://s1", &["ls0"]);
        seed(&broker, &s1).await;
        run(&mut machine, &broker, vec![create(s1.clone())]).await;
        run(&mut machine, &broker, vec![delete(s1.clone())]).await;
        assert!(!cache.is_child(&s1.id));

        run(&mut machine, &broker, vec![create(s1.clone())]).await;
        assert_eq!(machine.registry().state(&ha()), GroupState::GroupFormed);
        assert!(cache.is_child(&s1.id));
    }

    #[tokio::test]
    async fn test_abandoned_batch_discards_transitions() {
        let broker = MemoryBroker::new();
        let (mut machine, _cache) = machine();
        let s1 = member("hwvtep://s1", &["ls0"]);
        seed(&broker, &s1).await;

        let mut tx = Transaction::new(broker.clone());
        machine
            .handle_batch(&batch(vec![create(s1)]), &mut tx)
            .await
            .unwrap();
        machine.on_abandoned().await;

        assert_eq!(machine.registry().state(&ha()), GroupState::Disconnected);
        assert_eq!(machine.registry_view().read().state(&ha()), GroupState::Disconnected);
    }

    #[tokio::test]
    async fn test_logical_device_delete_destroys_group() {
        let broker = MemoryBroker::new();
        let (mut machine, cache) = machine();
        let s1 = member("hwvtep://s1", &["ls0"]);
        seed(&broker, &s1).await;
        run(&mut machine, &broker, vec![create(s1)]).await;

        let aggregate = broker.get(Datastore::Operational, &ha()).unwrap();
        broker
            .commit(vec![WriteOp::Delete {
                datastore: Datastore::Operational,
                id: ha(),
            }])
            .await
            .unwrap();
        run(&mut machine, &broker, vec![delete(aggregate)]).await;

        assert!(!cache.is_parent(&ha()));
        assert!(!machine.registry().contains(&ha()));
    }
}

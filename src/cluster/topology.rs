// # Cluster Topology
//
// The 16384-slot ownership map, the gossip-fed peer table, and per-slot
// migration state. Epoch arithmetic resolves conflicting claims: higher
// config epoch wins.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::common::{random_hex_id, NodeId, SLOT_COUNT};
use crate::error::{FerriteError, Result};
use crate::replication::EndpointResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Primary,
    Replica,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub address: String,
    pub port: u16,
    pub role: NodeRole,
    /// For replicas: the primary this node replicates.
    pub primary_of: Option<NodeId>,
    pub config_epoch: u64,
}

impl NodeInfo {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Derived view of one slot's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    Unassigned,
    Stable { owner: NodeId },
    Migrating { from: NodeId, to: NodeId },
    Importing { from: NodeId, to: NodeId },
}

#[derive(Debug, Clone, Default)]
struct SlotEntry {
    owner: Option<NodeId>,
    /// Owner-side marker while this node streams the slot away.
    migrating_to: Option<NodeId>,
    /// Target-side marker while this node receives the slot.
    importing_from: Option<NodeId>,
    epoch: u64,
}

/// SETSLOT sub-command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetSlotCommand {
    Importing(NodeId),
    Migrating(NodeId),
    Stable,
    Node(NodeId),
}

pub struct ClusterTopology {
    local: RwLock<NodeInfo>,
    peers: DashMap<NodeId, NodeInfo>,
    slots: RwLock<Vec<SlotEntry>>,
    epoch: AtomicU64,
}

impl ClusterTopology {
    pub fn new(local: NodeInfo) -> Self {
        let epoch = local.config_epoch;
        Self {
            local: RwLock::new(local),
            peers: DashMap::new(),
            slots: RwLock::new(vec![SlotEntry::default(); SLOT_COUNT as usize]),
            epoch: AtomicU64::new(epoch),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local.read().node_id.clone()
    }

    pub fn local_node(&self) -> NodeInfo {
        let mut info = self.local.read().clone();
        info.config_epoch = self.current_epoch();
        info
    }

    pub fn set_local_role(&self, role: NodeRole, primary_of: Option<NodeId>) {
        let mut local = self.local.write();
        local.role = role;
        local.primary_of = primary_of;
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn bump_epoch(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.local.write().config_epoch = epoch;
        epoch
    }

    /// Resolve a node id (self or peer) to its info.
    pub fn node(&self, node_id: &str) -> Option<NodeInfo> {
        if self.local.read().node_id == node_id {
            return Some(self.local_node());
        }
        self.peers.get(node_id).map(|n| n.value().clone())
    }

    pub fn known_nodes(&self) -> Vec<NodeInfo> {
        let mut nodes = vec![self.local_node()];
        for peer in self.peers.iter() {
            nodes.push(peer.value().clone());
        }
        nodes
    }

    // -- membership ---------------------------------------------------------

    /// CLUSTER MEET: add or refresh a peer.
    pub fn meet(&self, info: NodeInfo) {
        info!(node_id = %info.node_id, endpoint = %info.endpoint(), "cluster meet");
        self.merge_node(info);
    }

    /// Gossip-fed upsert: a stale epoch never downgrades a fresher entry.
    pub fn merge_node(&self, info: NodeInfo) {
        if info.node_id == self.local.read().node_id {
            return;
        }
        match self.peers.get(&info.node_id) {
            Some(existing) if existing.config_epoch > info.config_epoch => {
                debug!(node_id = %info.node_id, "ignoring stale gossip entry");
            }
            _ => {
                self.peers.insert(info.node_id.clone(), info);
            }
        }
    }

    /// Higher-epoch slot ownership claim from gossip or migration.
    pub fn merge_slot_claim(&self, slot: u16, owner: &str, epoch: u64) {
        let mut slots = self.slots.write();
        let entry = &mut slots[slot as usize];
        if epoch >= entry.epoch {
            if entry.owner.as_deref() != Some(owner) && entry.owner.is_some() {
                warn!(slot, owner, epoch, "slot ownership superseded by higher epoch");
            }
            entry.owner = Some(owner.to_string());
            entry.epoch = epoch;
            entry.migrating_to = None;
            entry.importing_from = None;
        }
    }

    /// CLUSTER FORGET.
    pub fn forget(&self, node_id: &str) -> Result<()> {
        if node_id == self.local.read().node_id {
            return Err(FerriteError::UnknownNode(
                "can't forget myself".to_string(),
            ));
        }
        self.peers
            .remove(node_id)
            .map(|_| ())
            .ok_or_else(|| FerriteError::UnknownNode(node_id.to_string()))
    }

    /// CLUSTER RESET. Hard reset also adopts a fresh node id and zeroes
    /// the epoch.
    pub fn reset(&self, hard: bool) {
        self.peers.clear();
        *self.slots.write() = vec![SlotEntry::default(); SLOT_COUNT as usize];
        if hard {
            let mut local = self.local.write();
            local.node_id = random_hex_id();
            local.config_epoch = 0;
            self.epoch.store(0, Ordering::Release);
        }
        info!(hard, "cluster state reset");
    }

    // -- slot assignment ----------------------------------------------------

    fn check_duplicates(slots: &[u16]) -> Result<()> {
        let mut seen = vec![false; SLOT_COUNT as usize];
        for &slot in slots {
            if slot >= SLOT_COUNT {
                return Err(FerriteError::SlotOutOfRange);
            }
            if seen[slot as usize] {
                return Err(FerriteError::SlotSpecifiedMultipleTimes(slot));
            }
            seen[slot as usize] = true;
        }
        Ok(())
    }

    /// CLUSTER ADDSLOTS. All-or-nothing: validation failures mutate
    /// nothing.
    pub fn add_slots(&self, slots: &[u16]) -> Result<()> {
        Self::check_duplicates(slots)?;
        let local_id = self.local_id();
        let mut table = self.slots.write();
        for &slot in slots {
            if table[slot as usize].owner.is_some() {
                return Err(FerriteError::SlotAlreadyBusy(slot));
            }
        }
        let epoch = self.current_epoch();
        for &slot in slots {
            let entry = &mut table[slot as usize];
            entry.owner = Some(local_id.clone());
            entry.epoch = epoch;
        }
        debug!(count = slots.len(), "slots added");
        Ok(())
    }

    /// CLUSTER DELSLOTS.
    pub fn del_slots(&self, slots: &[u16]) -> Result<()> {
        Self::check_duplicates(slots)?;
        let mut table = self.slots.write();
        for &slot in slots {
            if table[slot as usize].owner.is_none() {
                return Err(FerriteError::NotSlotOwner(slot));
            }
        }
        for &slot in slots {
            table[slot as usize] = SlotEntry::default();
        }
        debug!(count = slots.len(), "slots deleted");
        Ok(())
    }

    pub fn slot_state(&self, slot: u16) -> SlotState {
        let local_id = self.local.read().node_id.clone();
        let slots = self.slots.read();
        let entry = &slots[slot as usize];
        if let Some(to) = &entry.importing_from {
            return SlotState::Importing {
                from: to.clone(),
                to: local_id,
            };
        }
        match (&entry.owner, &entry.migrating_to) {
            (Some(owner), Some(to)) if *owner == local_id => SlotState::Migrating {
                from: owner.clone(),
                to: to.clone(),
            },
            (Some(owner), _) => SlotState::Stable {
                owner: owner.clone(),
            },
            (None, _) => SlotState::Unassigned,
        }
    }

    pub fn owner_of(&self, slot: u16) -> Option<NodeId> {
        self.slots.read()[slot as usize].owner.clone()
    }

    /// Gossip payload: every assigned slot with its owner and epoch.
    pub fn slot_claims(&self) -> Vec<(u16, NodeId, u64)> {
        self.slots
            .read()
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| {
                entry
                    .owner
                    .clone()
                    .map(|owner| (slot as u16, owner, entry.epoch))
            })
            .collect()
    }

    pub fn slots_owned_by(&self, node_id: &str) -> Vec<u16> {
        self.slots
            .read()
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.owner.as_deref() == Some(node_id))
            .map(|(slot, _)| slot as u16)
            .collect()
    }

    /// CLUSTER SETSLOT state machine.
    pub fn set_slot(&self, slot: u16, command: SetSlotCommand) -> Result<()> {
        if slot >= SLOT_COUNT {
            return Err(FerriteError::SlotOutOfRange);
        }
        let local_id = self.local_id();
        match command {
            SetSlotCommand::Importing(source) => {
                if self.node(&source).is_none() {
                    return Err(FerriteError::UnknownNode(source));
                }
                let mut slots = self.slots.write();
                let entry = &mut slots[slot as usize];
                if entry.owner.as_deref() == Some(local_id.as_str()) {
                    return Err(FerriteError::LocalSlotAlreadyImported(slot));
                }
                if let Some(existing) = &entry.importing_from {
                    return Err(FerriteError::AlreadyScheduledImport(existing.clone()));
                }
                entry.importing_from = Some(source);
            }
            SetSlotCommand::Migrating(target) => {
                if target == local_id {
                    return Err(FerriteError::CantMigrateToSelf);
                }
                if self.node(&target).is_none() {
                    return Err(FerriteError::UnknownNode(target));
                }
                let mut slots = self.slots.write();
                let entry = &mut slots[slot as usize];
                if entry.owner.as_deref() != Some(local_id.as_str()) {
                    return Err(FerriteError::NotSlotOwner(slot));
                }
                entry.migrating_to = Some(target);
            }
            SetSlotCommand::Stable => {
                let mut slots = self.slots.write();
                let entry = &mut slots[slot as usize];
                entry.migrating_to = None;
                entry.importing_from = None;
            }
            SetSlotCommand::Node(owner) => {
                if self.node(&owner).is_none() {
                    return Err(FerriteError::UnknownNode(owner));
                }
                let epoch = self.bump_epoch();
                let mut slots = self.slots.write();
                let entry = &mut slots[slot as usize];
                entry.owner = Some(owner);
                entry.migrating_to = None;
                entry.importing_from = None;
                entry.epoch = epoch;
            }
        }
        Ok(())
    }

    /// Failover: take over every slot the failed primary owned, at a
    /// higher epoch.
    pub fn claim_slots_from(&self, failed_primary: &str, epoch: u64) -> Vec<u16> {
        let local_id = self.local_id();
        let mut claimed = Vec::new();
        let mut slots = self.slots.write();
        for (slot, entry) in slots.iter_mut().enumerate() {
            if entry.owner.as_deref() == Some(failed_primary) {
                entry.owner = Some(local_id.clone());
                entry.epoch = epoch;
                entry.migrating_to = None;
                entry.importing_from = None;
                claimed.push(slot as u16);
            }
        }
        claimed
    }

    // -- rendered views ------------------------------------------------------

    /// CLUSTER NODES line per known node.
    pub fn nodes_lines(&self) -> String {
        let mut out = String::new();
        for node in self.known_nodes() {
            let flags = match node.role {
                NodeRole::Primary => {
                    if node.node_id == self.local_id() {
                        "myself,master"
                    } else {
                        "master"
                    }
                }
                NodeRole::Replica => {
                    if node.node_id == self.local_id() {
                        "myself,slave"
                    } else {
                        "slave"
                    }
                }
            };
            let primary = node.primary_of.clone().unwrap_or_else(|| "-".to_string());
            let ranges = render_ranges(&self.slots_owned_by(&node.node_id));
            out.push_str(&format!(
                "{} {}@{} {} {} 0 0 {} connected{}{}\n",
                node.node_id,
                node.endpoint(),
                node.port as u32 + 10000,
                flags,
                primary,
                node.config_epoch,
                if ranges.is_empty() { "" } else { " " },
                ranges,
            ));
        }
        out
    }

    /// Contiguous (start, end, owner) ranges for CLUSTER SLOTS / SHARDS.
    pub fn slot_ranges(&self) -> Vec<(u16, u16, NodeInfo)> {
        let slots = self.slots.read();
        let mut out: Vec<(u16, u16, NodeInfo)> = Vec::new();
        for (slot, entry) in slots.iter().enumerate() {
            let Some(owner) = &entry.owner else { continue };
            let Some(info) = self.node(owner) else { continue };
            match out.last_mut() {
                Some((_, end, last)) if *end + 1 == slot as u16 && last.node_id == *owner => {
                    *end = slot as u16;
                }
                _ => out.push((slot as u16, slot as u16, info)),
            }
        }
        out
    }
}

impl EndpointResolver for ClusterTopology {
    fn resolve(&self, node_id: &str) -> Option<String> {
        self.node(node_id).map(|info| info.endpoint())
    }
}

/// Render owned slots as Redis-style ranges (`0-5460 7000`).
fn render_ranges(slots: &[u16]) -> String {
    let mut out = String::new();
    let mut iter = slots.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end = iter.next().unwrap();
        }
        if !out.is_empty() {
            out.push(' ');
        }
        if start == end {
            out.push_str(&start.to_string());
        } else {
            out.push_str(&format!("{start}-{end}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id_seed: u8, port: u16, role: NodeRole) -> NodeInfo {
        NodeInfo {
            node_id: format!("{:040x}", id_seed as u128),
            address: "127.0.0.1".to_string(),
            port,
            role,
            primary_of: None,
            config_epoch: 1,
        }
    }

    fn topology() -> ClusterTopology {
        ClusterTopology::new(node(1, 7000, NodeRole::Primary))
    }

    #[test]
    fn add_then_del_slots_round_trips() {
        let topo = topology();
        topo.add_slots(&[1, 2, 3]).unwrap();
        assert_eq!(topo.owner_of(2), Some(topo.local_id()));
        topo.del_slots(&[1, 2, 3]).unwrap();
        assert_eq!(topo.slot_state(2), SlotState::Unassigned);
    }

    #[test]
    fn duplicate_slots_are_rejected() {
        let topo = topology();
        assert!(matches!(
            topo.add_slots(&[5, 5]),
            Err(FerriteError::SlotSpecifiedMultipleTimes(5))
        ));
        topo.add_slots(&[5]).unwrap();
        assert!(matches!(
            topo.add_slots(&[5]),
            Err(FerriteError::SlotAlreadyBusy(5))
        ));
    }

    #[test]
    fn setslot_migrating_requires_ownership_and_known_target() {
        let topo = topology();
        let peer = node(2, 7001, NodeRole::Primary);
        topo.meet(peer.clone());
        topo.add_slots(&[100]).unwrap();

        assert!(matches!(
            topo.set_slot(100, SetSlotCommand::Migrating("unknown".into())),
            Err(FerriteError::UnknownNode(_))
        ));
        assert!(matches!(
            topo.set_slot(100, SetSlotCommand::Migrating(topo.local_id())),
            Err(FerriteError::CantMigrateToSelf)
        ));
        assert!(matches!(
            topo.set_slot(200, SetSlotCommand::Migrating(peer.node_id.clone())),
            Err(FerriteError::NotSlotOwner(200))
        ));

        topo.set_slot(100, SetSlotCommand::Migrating(peer.node_id.clone()))
            .unwrap();
        assert_eq!(
            topo.slot_state(100),
            SlotState::Migrating {
                from: topo.local_id(),
                to: peer.node_id
            }
        );
    }

    #[test]
    fn setslot_importing_transitions() {
        let topo = topology();
        let peer = node(2, 7001, NodeRole::Primary);
        topo.meet(peer.clone());
        // Peer owns slot 300 as far as this node knows.
        topo.merge_slot_claim(300, &peer.node_id, 5);

        topo.set_slot(300, SetSlotCommand::Importing(peer.node_id.clone()))
            .unwrap();
        assert!(matches!(
            topo.set_slot(300, SetSlotCommand::Importing(peer.node_id.clone())),
            Err(FerriteError::AlreadyScheduledImport(_))
        ));

        // Importing a slot this node already owns is rejected.
        topo.add_slots(&[301]).unwrap();
        assert!(matches!(
            topo.set_slot(301, SetSlotCommand::Importing(peer.node_id.clone())),
            Err(FerriteError::LocalSlotAlreadyImported(301))
        ));
    }

    #[test]
    fn setslot_node_bumps_epoch() {
        let topo = topology();
        let peer = node(2, 7001, NodeRole::Primary);
        topo.meet(peer.clone());
        topo.add_slots(&[42]).unwrap();
        let before = topo.current_epoch();
        topo.set_slot(42, SetSlotCommand::Node(peer.node_id.clone()))
            .unwrap();
        assert!(topo.current_epoch() > before);
        assert_eq!(topo.owner_of(42), Some(peer.node_id));
    }

    #[test]
    fn stable_clears_migration_markers_without_changing_owner() {
        let topo = topology();
        let peer = node(2, 7001, NodeRole::Primary);
        topo.meet(peer.clone());
        topo.add_slots(&[7]).unwrap();
        topo.set_slot(7, SetSlotCommand::Migrating(peer.node_id)).unwrap();
        topo.set_slot(7, SetSlotCommand::Stable).unwrap();
        assert_eq!(
            topo.slot_state(7),
            SlotState::Stable {
                owner: topo.local_id()
            }
        );
    }

    #[test]
    fn higher_epoch_wins_on_gossip_conflict() {
        let topo = topology();
        let a = node(2, 7001, NodeRole::Primary);
        let b = node(3, 7002, NodeRole::Primary);
        topo.meet(a.clone());
        topo.meet(b.clone());
        topo.merge_slot_claim(9, &a.node_id, 5);
        topo.merge_slot_claim(9, &b.node_id, 3);
        assert_eq!(topo.owner_of(9), Some(a.node_id.clone()));
        topo.merge_slot_claim(9, &b.node_id, 8);
        assert_eq!(topo.owner_of(9), Some(b.node_id));
    }

    #[test]
    fn claim_slots_from_takes_over_a_failed_primary() {
        let topo = topology();
        let dead = node(2, 7001, NodeRole::Primary);
        topo.meet(dead.clone());
        topo.merge_slot_claim(10, &dead.node_id, 2);
        topo.merge_slot_claim(11, &dead.node_id, 2);
        let claimed = topo.claim_slots_from(&dead.node_id, 9);
        assert_eq!(claimed, vec![10, 11]);
        assert_eq!(topo.owner_of(10), Some(topo.local_id()));
    }

    #[test]
    fn render_ranges_compresses_runs() {
        assert_eq!(render_ranges(&[0, 1, 2, 5, 7, 8]), "0-2 5 7-8");
        assert_eq!(render_ranges(&[]), "");
    }

    #[test]
    fn hard_reset_rotates_node_id() {
        let topo = topology();
        let before = topo.local_id();
        topo.add_slots(&[1]).unwrap();
        topo.reset(true);
        assert_ne!(topo.local_id(), before);
        assert_eq!(topo.slot_state(1), SlotState::Unassigned);
        assert_eq!(topo.current_epoch(), 0);
    }
}

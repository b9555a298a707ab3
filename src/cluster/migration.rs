// # Migration Engine
//
// Moves slot ranges or individual keys between nodes. The source marks
// the slot MIGRATING and the target IMPORTING while values stream across;
// the final NODE transition hands ownership over at a bumped epoch.
// Partial failure leaves the migration markers in place for the operator;
// a slot is never owned by two nodes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::common::{key_hash_slot, NodeId, StoreKind, SLOT_COUNT};
use crate::error::{FerriteError, Result};
use crate::storage::{KvStore, MutationObserver, ObjectStore};

use super::topology::{ClusterTopology, SetSlotCommand};

/// Per-slot secondary index of live keys, fed by store mutations; backs
/// `CLUSTER COUNTKEYSINSLOT` / `GETKEYSINSLOT` and slot-mode migration.
#[derive(Default)]
pub struct KeyTracker {
    slots: DashMap<u16, HashSet<(StoreKind, Vec<u8>)>>,
}

impl KeyTracker {
    pub fn count_keys_in_slot(&self, slot: u16) -> usize {
        self.slots.get(&slot).map(|set| set.len()).unwrap_or(0)
    }

    pub fn get_keys_in_slot(&self, slot: u16, count: usize) -> Vec<Vec<u8>> {
        self.slots
            .get(&slot)
            .map(|set| set.iter().take(count).map(|(_, key)| key.clone()).collect())
            .unwrap_or_default()
    }

    pub fn entries_in_slot(&self, slot: u16) -> Vec<(StoreKind, Vec<u8>)> {
        self.slots
            .get(&slot)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl MutationObserver for KeyTracker {
    fn on_mutation(&self, kind: StoreKind, key: &[u8], _hash: u64, tombstone: bool) {
        let slot = key_hash_slot(key);
        let mut entry = self.slots.entry(slot).or_default();
        if tombstone {
            entry.remove(&(kind, key.to_vec()));
        } else {
            entry.insert((kind, key.to_vec()));
        }
    }
}

/// Receiving side of a migration. The in-process implementation wraps a
/// peer node directly; a networked deployment speaks the MIGRATE wire
/// exchange behind the same trait.
pub trait MigrationTarget: Send + Sync {
    fn node_id(&self) -> NodeId;
    fn import_key(&self, kind: StoreKind, key: &[u8], value: &[u8], replace: bool) -> Result<()>;
    fn set_slot_importing(&self, slot: u16, from: &str) -> Result<()>;
    fn set_slot_owner(&self, slot: u16, owner: &str, epoch: u64) -> Result<()>;
}

/// Sending-side view over one node's state.
pub struct MigrationSource<'a> {
    pub topology: &'a ClusterTopology,
    pub tracker: &'a KeyTracker,
    pub main: &'a KvStore,
    pub objects: &'a ObjectStore,
}

#[derive(Debug, Clone)]
pub struct MigrateOptions {
    /// Keep the source copy instead of deleting after transfer.
    pub copy: bool,
    /// Overwrite existing keys on the target.
    pub replace: bool,
    pub timeout: Duration,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            copy: false,
            replace: false,
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct MigrationEngine {
    /// One mutex per slot serializes duplicate in-flight migrations.
    slot_locks: Vec<Mutex<()>>,
    /// Keys currently mid-transfer; writes to them answer TRYAGAIN.
    in_flight_keys: RwLock<HashSet<Vec<u8>>>,
}

impl Default for MigrationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationEngine {
    pub fn new() -> Self {
        Self {
            slot_locks: (0..SLOT_COUNT as usize).map(|_| Mutex::new(())).collect(),
            in_flight_keys: RwLock::new(HashSet::new()),
        }
    }

    pub fn key_in_flight(&self, key: &[u8]) -> bool {
        self.in_flight_keys.read().contains(key)
    }

    /// Slot mode: stream every key of each slot to the target, then hand
    /// ownership over. Re-issuing a completed migration is a no-op.
    pub fn migrate_slots(
        &self,
        source: &MigrationSource<'_>,
        target: &dyn MigrationTarget,
        slots: &[u16],
        options: &MigrateOptions,
    ) -> Result<()> {
        let target_id = target.node_id();
        let local_id = source.topology.local_id();
        if target_id == local_id {
            return Err(FerriteError::CantMigrateToSelf);
        }
        if source.topology.node(&target_id).is_none() {
            return Err(FerriteError::UnknownNode(target_id));
        }

        let deadline = Instant::now() + options.timeout;
        for &slot in slots {
            if slot >= SLOT_COUNT {
                return Err(FerriteError::SlotOutOfRange);
            }
            let _slot_guard = self.slot_locks[slot as usize].lock();

            match source.topology.owner_of(slot) {
                Some(owner) if owner == local_id => {}
                Some(owner) if owner == target_id => {
                    // Already completed; idempotent no-op.
                    debug!(slot, "migration already completed");
                    continue;
                }
                _ => return Err(FerriteError::NotSlotOwner(slot)),
            }

            source
                .topology
                .set_slot(slot, SetSlotCommand::Migrating(target_id.clone()))?;
            match target.set_slot_importing(slot, &local_id) {
                // Operator already staged IMPORTING; the retry is benign.
                Ok(()) | Err(FerriteError::AlreadyScheduledImport(_)) => {}
                Err(err) => return Err(err),
            }

            self.transfer_slot_keys(source, target, slot, options, deadline)?;

            // Post-migration handoff: bump the epoch and publish the new
            // owner on both endpoints.
            let epoch = source.topology.bump_epoch();
            target.set_slot_owner(slot, &target_id, epoch)?;
            source.topology.merge_slot_claim(slot, &target_id, epoch);
            info!(slot, target = %target_id, epoch, "slot migrated");
        }
        Ok(())
    }

    fn transfer_slot_keys(
        &self,
        source: &MigrationSource<'_>,
        target: &dyn MigrationTarget,
        slot: u16,
        options: &MigrateOptions,
        deadline: Instant,
    ) -> Result<()> {
        for (kind, key) in source.tracker.entries_in_slot(slot) {
            if Instant::now() > deadline {
                warn!(slot, "migration timed out; slot left MIGRATING/IMPORTING");
                return Err(FerriteError::TryAgain);
            }
            self.transfer_one(source, target, kind, &key, options)?;
        }
        Ok(())
    }

    /// Key mode: transfer the caller's key list, bumping the epoch after
    /// completion.
    pub fn migrate_keys(
        &self,
        source: &MigrationSource<'_>,
        target: &dyn MigrationTarget,
        keys: &[Vec<u8>],
        options: &MigrateOptions,
    ) -> Result<()> {
        let target_id = target.node_id();
        if target_id == source.topology.local_id() {
            return Err(FerriteError::CantMigrateToSelf);
        }
        for key in keys {
            // Resolve which store holds the key.
            let kind = if source.main.read_blocking(key)?.is_some() {
                StoreKind::Main
            } else if source.objects.read_object(key)?.is_some() {
                StoreKind::Object
            } else {
                continue;
            };
            self.transfer_one(source, target, kind, key, options)?;
        }
        source.topology.bump_epoch();
        Ok(())
    }

    fn transfer_one(
        &self,
        source: &MigrationSource<'_>,
        target: &dyn MigrationTarget,
        kind: StoreKind,
        key: &[u8],
        options: &MigrateOptions,
    ) -> Result<()> {
        self.in_flight_keys.write().insert(key.to_vec());
        let outcome = (|| {
            let value = match kind {
                StoreKind::Main => source.main.read_blocking(key)?,
                StoreKind::Object => source
                    .objects
                    .store()
                    .read_blocking(key)?,
            };
            let Some(value) = value else {
                return Ok(());
            };
            target.import_key(kind, key, &value, options.replace)?;
            if !options.copy {
                match kind {
                    StoreKind::Main => source.main.delete_blocking(key)?,
                    StoreKind::Object => source.objects.store().delete_blocking(key)?,
                };
            }
            Ok(())
        })();
        self.in_flight_keys.write().remove(key);
        outcome
    }
}

/// In-process migration target wrapping a peer's stores and topology.
pub struct LocalMigrationTarget {
    pub topology: Arc<ClusterTopology>,
    pub main: Arc<KvStore>,
    pub objects: Arc<ObjectStore>,
}

impl MigrationTarget for LocalMigrationTarget {
    fn node_id(&self) -> NodeId {
        self.topology.local_id()
    }

    fn import_key(&self, kind: StoreKind, key: &[u8], value: &[u8], replace: bool) -> Result<()> {
        let store: &KvStore = match kind {
            StoreKind::Main => self.main.as_ref(),
            StoreKind::Object => self.objects.store(),
        };
        if !replace && store.read_blocking(key)?.is_some() {
            return Err(FerriteError::Replication(format!(
                "target already holds key for slot {}",
                key_hash_slot(key)
            )));
        }
        store.upsert(key, value)
    }

    fn set_slot_importing(&self, slot: u16, from: &str) -> Result<()> {
        self.topology
            .set_slot(slot, SetSlotCommand::Importing(from.to_string()))
    }

    fn set_slot_owner(&self, slot: u16, owner: &str, epoch: u64) -> Result<()> {
        self.topology.merge_slot_claim(slot, owner, epoch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_follows_mutations() {
        let tracker = KeyTracker::default();
        tracker.on_mutation(StoreKind::Main, b"{abc}0", 0, false);
        tracker.on_mutation(StoreKind::Main, b"{abc}1", 0, false);
        let slot = key_hash_slot(b"{abc}0");
        assert_eq!(tracker.count_keys_in_slot(slot), 2);

        tracker.on_mutation(StoreKind::Main, b"{abc}0", 0, true);
        assert_eq!(tracker.count_keys_in_slot(slot), 1);
        assert_eq!(tracker.get_keys_in_slot(slot, 10), vec![b"{abc}1".to_vec()]);
    }
}

// # Watch Registry
//
// Optimistic concurrency for WATCH/MULTI/EXEC. A process-wide
// open-addressed version map increments on every store mutation; each
// session records the versions of its watched keys and revalidates them
// at EXEC. Hash collisions can cause spurious aborts, never false
// successes.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::{key_hash, StoreKind};
use crate::storage::MutationObserver;

/// Open-addressed array of per-bucket mutation counters, indexed by
/// `hash(key) mod size`.
pub struct VersionMap {
    slots: Vec<AtomicU64>,
    mask: u64,
}

impl VersionMap {
    pub fn new(size: usize) -> Self {
        let size = size.max(16).next_power_of_two();
        Self {
            slots: (0..size).map(|_| AtomicU64::new(0)).collect(),
            mask: size as u64 - 1,
        }
    }

    pub fn version(&self, hash: u64) -> u64 {
        self.slots[(hash & self.mask) as usize].load(Ordering::Acquire)
    }

    pub fn bump(&self, hash: u64) {
        self.slots[(hash & self.mask) as usize].fetch_add(1, Ordering::AcqRel);
    }
}

impl MutationObserver for VersionMap {
    fn on_mutation(&self, _kind: StoreKind, _key: &[u8], hash: u64, _tombstone: bool) {
        self.bump(hash);
    }
}

#[derive(Debug, Clone)]
pub struct WatchedKey {
    pub key: Vec<u8>,
    pub hash: u64,
    pub version_at_watch: u64,
    pub store_kind: StoreKind,
}

/// Per-session watch set.
#[derive(Default)]
pub struct WatchRegistry {
    watched: Vec<WatchedKey>,
}

impl WatchRegistry {
    pub fn watch(&mut self, key: &[u8], store_kind: StoreKind, versions: &VersionMap) {
        let hash = key_hash(key);
        self.watched.push(WatchedKey {
            key: key.to_vec(),
            hash,
            version_at_watch: versions.version(hash),
            store_kind,
        });
    }

    /// True when no watched key's version moved since WATCH.
    pub fn validate(&self, versions: &VersionMap) -> bool {
        self.watched
            .iter()
            .all(|watched| versions.version(watched.hash) == watched.version_at_watch)
    }

    pub fn unwatch(&mut self) {
        self.watched.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }

    pub fn len(&self) -> usize {
        self.watched.len()
    }
}

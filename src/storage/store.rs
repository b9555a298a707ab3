// # Hybrid KV Store
//
// Concurrent map semantics (`read`, `rmw`, `delete`) over the hash index
// and log allocator. Values live in the log; the index holds only the
// logical address of each bucket's newest record. Lookups that fall below
// the in-memory head park on the session's pending queue and finalize
// through device reads in issue order.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::buffer::BufferPool;
use crate::common::{key_hash, StoreKind};
use crate::error::Result;

use super::address::{Address, FIRST_VALID_ADDRESS, INVALID_ADDRESS};
use super::allocator::LogAllocator;
use super::device::StorageDevice;
use super::index::HashIndex;
use super::pending::{
    PendingKind, PendingOp, PendingOutcome, RmwModifier, RmwResult, SessionPending,
};
use super::record::{record_extent, write_record, OwnedRecord, RecordInfo};

/// Hook invoked after every visible mutation; feeds the watch version map
/// and the cluster's per-slot key tracker.
pub trait MutationObserver: Send + Sync {
    fn on_mutation(&self, kind: StoreKind, key: &[u8], hash: u64, tombstone: bool);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Found(Vec<u8>),
    NotFound,
    Pending(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmwOutcome {
    Done(RmwResult),
    Pending(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    Pending(u64),
}

/// A finalized pending operation, paired with its issue-order id.
pub struct PendingCompletion {
    pub id: u64,
    pub result: Result<PendingOutcome>,
}

pub struct StoreConfig {
    pub kind: StoreKind,
    pub index_size: usize,
    pub page_bits: u32,
    pub memory_pages: usize,
}

pub struct KvStore {
    kind: StoreKind,
    allocator: LogAllocator,
    index: HashIndex,
    version: AtomicU32,
    observers: RwLock<Vec<Arc<dyn MutationObserver>>>,
}

enum WalkStop {
    Match { la: Address, record: OwnedRecord },
    Miss,
    BelowHead { la: Address },
}

impl KvStore {
    pub fn new(
        config: StoreConfig,
        device: Arc<dyn StorageDevice>,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            kind: config.kind,
            allocator: LogAllocator::new(config.page_bits, config.memory_pages, device, pool),
            index: HashIndex::new(config.index_size),
            version: AtomicU32::new(1),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn allocator(&self) -> &LogAllocator {
        &self.allocator
    }

    pub fn index(&self) -> &HashIndex {
        &self.index
    }

    pub fn current_version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Version shift at a checkpoint boundary: records written afterwards
    /// carry the new version, forcing copy-updates of older records so the
    /// captured range stays immutable.
    pub fn bump_version(&self) -> u32 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Reinstall a recovered store version.
    pub fn set_version(&self, version: u32) {
        self.version.store(version, Ordering::Release);
    }

    pub fn register_observer(&self, observer: Arc<dyn MutationObserver>) {
        self.observers.write().push(observer);
    }

    fn notify(&self, key: &[u8], hash: u64, tombstone: bool) {
        for observer in self.observers.read().iter() {
            observer.on_mutation(self.kind, key, hash, tombstone);
        }
    }

    // -- chain walks --------------------------------------------------------

    fn walk_resident(&self, key: &[u8], from: Address) -> WalkStop {
        let mut la = from;
        loop {
            if la < FIRST_VALID_ADDRESS || la < self.allocator.begin_address() {
                return WalkStop::Miss;
            }
            if la < self.allocator.head_address() {
                return WalkStop::BelowHead { la };
            }
            match self.allocator.read_record_resident(la) {
                // Raced with an eviction between the head check and the
                // frame lock.
                None => return WalkStop::BelowHead { la },
                Some(record) => {
                    if !record.info.sealed() && record.key == key {
                        return WalkStop::Match { la, record };
                    }
                    la = record.previous;
                }
            }
        }
    }

    /// Chain walk with device fallback, used by pending completion.
    fn walk_any(&self, key: &[u8], from: Address) -> Result<Option<(Address, OwnedRecord)>> {
        let mut la = from;
        loop {
            if la < FIRST_VALID_ADDRESS || la < self.allocator.begin_address() {
                return Ok(None);
            }
            match self.allocator.read_record_at(la)? {
                None => return Ok(None),
                Some(record) => {
                    if !record.info.sealed() && record.key == key {
                        return Ok(Some((la, record)));
                    }
                    la = record.previous;
                }
            }
        }
    }

    // -- appends ------------------------------------------------------------

    /// Append one record whose previous pointer is `expected_head`, then
    /// try to publish it. A lost CAS seals the orphan so walks and rebuild
    /// skip it.
    fn try_append_once(
        &self,
        key: &[u8],
        value: &[u8],
        value_capacity: usize,
        tombstone: bool,
        hash: u64,
        expected_head: Address,
    ) -> Result<bool> {
        let extent = record_extent(key.len(), value_capacity);
        let la = self.allocator.allocate(extent)?;
        let mut buf = vec![0u8; extent];
        let mut info = RecordInfo::new(self.current_version());
        if tombstone {
            info.set_tombstone();
        }
        write_record(&mut buf, info, expected_head, key, value, value_capacity);
        self.allocator.write_bytes(la, &buf);

        if self.index.try_update(hash, expected_head, la) {
            trace!(address = la, tombstone, "record published");
            return Ok(true);
        }
        self.allocator.with_resident_mut(la, |bytes| {
            let mut info = RecordInfo::from_raw(u64::from_le_bytes(bytes[0..8].try_into().unwrap()));
            info.set_sealed();
            bytes[0..8].copy_from_slice(&info.raw().to_le_bytes());
        });
        Ok(false)
    }

    // -- keyed operations ---------------------------------------------------

    /// Blind upsert: always appends, never goes pending.
    pub fn upsert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let _guard = self.allocator.epoch().protect();
        let hash = key_hash(key);
        loop {
            let head = self.index.head(hash);
            if self.try_append_once(key, value, value.len(), false, hash, head)? {
                self.notify(key, hash, false);
                return Ok(());
            }
        }
    }

    pub fn read(&self, key: &[u8], pending: &mut SessionPending) -> Result<ReadOutcome> {
        let _guard = self.allocator.epoch().protect();
        let hash = key_hash(key);
        match self.walk_resident(key, self.index.head(hash)) {
            WalkStop::Match { record, .. } => {
                if record.info.tombstone() {
                    Ok(ReadOutcome::NotFound)
                } else {
                    Ok(ReadOutcome::Found(record.value))
                }
            }
            WalkStop::Miss => Ok(ReadOutcome::NotFound),
            WalkStop::BelowHead { la } => {
                let id = pending.park(key.to_vec(), hash, la, PendingKind::Read);
                Ok(ReadOutcome::Pending(id))
            }
        }
    }

    /// Read-modify-write. The modifier sees the prior value (or `None`)
    /// and produces the new one. In-place update happens only when the
    /// head record is still in the mutable region, carries the current
    /// store version, and the new value fits its capacity.
    pub fn rmw(
        &self,
        key: &[u8],
        modifier: RmwModifier,
        pending: &mut SessionPending,
    ) -> Result<RmwOutcome> {
        let _guard = self.allocator.epoch().protect();
        let hash = key_hash(key);
        loop {
            let head = self.index.head(hash);
            match self.walk_resident(key, head) {
                WalkStop::Match { la, record } => {
                    if record.info.tombstone() {
                        let value = modifier(None);
                        if self.try_append_once(key, &value, value.len(), false, hash, head)? {
                            self.notify(key, hash, false);
                            return Ok(RmwOutcome::Done(RmwResult::Created));
                        }
                        continue;
                    }
                    let new_value = modifier(Some(&record.value));
                    if la >= self.allocator.flushed_until()
                        && record.info.version() == self.current_version()
                        && new_value.len() <= record.value_capacity
                        && self.try_update_in_place(la, &record, &new_value)
                    {
                        self.notify(key, hash, false);
                        return Ok(RmwOutcome::Done(RmwResult::InPlaceUpdated));
                    }
                    if self.try_append_once(key, &new_value, new_value.len(), false, hash, head)? {
                        self.notify(key, hash, false);
                        return Ok(RmwOutcome::Done(RmwResult::CopyUpdated));
                    }
                }
                WalkStop::Miss => {
                    let value = modifier(None);
                    if self.try_append_once(key, &value, value.len(), false, hash, head)? {
                        self.notify(key, hash, false);
                        return Ok(RmwOutcome::Done(RmwResult::Created));
                    }
                }
                WalkStop::BelowHead { la } => {
                    let id = pending.park(key.to_vec(), hash, la, PendingKind::Rmw(modifier));
                    return Ok(RmwOutcome::Pending(id));
                }
            }
        }
    }

    fn try_update_in_place(&self, la: Address, record: &OwnedRecord, new_value: &[u8]) -> bool {
        let key_len = record.key.len();
        let capacity = record.value_capacity;
        self.allocator
            .with_resident_mut(la, |bytes| {
                let mut info =
                    RecordInfo::from_raw(u64::from_le_bytes(bytes[0..8].try_into().unwrap()));
                if info.sealed() || info.tombstone() {
                    return false;
                }
                info.set_modified();
                if new_value.len() < capacity {
                    info.set_filler();
                }
                bytes[20..24].copy_from_slice(&(new_value.len() as u32).to_le_bytes());
                let value_start = 32 + key_len;
                bytes[value_start..value_start + new_value.len()].copy_from_slice(new_value);
                bytes[0..8].copy_from_slice(&info.raw().to_le_bytes());
                true
            })
            .unwrap_or(false)
    }

    /// Append a tombstone for the key if it currently resolves to a live
    /// record.
    pub fn delete(&self, key: &[u8], pending: &mut SessionPending) -> Result<DeleteOutcome> {
        let _guard = self.allocator.epoch().protect();
        let hash = key_hash(key);
        loop {
            let head = self.index.head(hash);
            match self.walk_resident(key, head) {
                WalkStop::Match { record, .. } => {
                    if record.info.tombstone() {
                        return Ok(DeleteOutcome::NotFound);
                    }
                    if self.try_append_once(key, &[], 0, true, hash, head)? {
                        self.notify(key, hash, true);
                        return Ok(DeleteOutcome::Deleted);
                    }
                }
                WalkStop::Miss => return Ok(DeleteOutcome::NotFound),
                WalkStop::BelowHead { la } => {
                    let id = pending.park(key.to_vec(), hash, la, PendingKind::Delete);
                    return Ok(DeleteOutcome::Pending(id));
                }
            }
        }
    }

    // -- pending completion --------------------------------------------------

    /// Finalize the session's parked operations in issue order. Device
    /// failures fail the individual operation; the store stays usable.
    /// The file-backed device resolves synchronously, so `wait` is
    /// satisfied by the time this returns either way.
    pub fn complete_pending(
        &self,
        pending: &mut SessionPending,
        _wait: bool,
    ) -> Vec<PendingCompletion> {
        let mut completions = Vec::with_capacity(pending.len());
        while let Some(op) = pending.pop() {
            let id = op.id;
            let result = self.resolve_pending(op);
            completions.push(PendingCompletion { id, result });
        }
        completions
    }

    fn resolve_pending(&self, op: PendingOp) -> Result<PendingOutcome> {
        match op.kind {
            PendingKind::Read => {
                let hit = self.walk_any(&op.key, op.address)?;
                Ok(PendingOutcome::Read(
                    hit.filter(|(_, r)| !r.info.tombstone()).map(|(_, r)| r.value),
                ))
            }
            PendingKind::Rmw(modifier) => self
                .rmw_via_device(&op.key, op.hash, &modifier)
                .map(PendingOutcome::Rmw),
            PendingKind::Delete => self
                .delete_via_device(&op.key, op.hash)
                .map(PendingOutcome::Delete),
        }
    }

    fn rmw_via_device(&self, key: &[u8], hash: u64, modifier: &RmwModifier) -> Result<RmwResult> {
        loop {
            let head = self.index.head(hash);
            let hit = self.walk_any(key, head)?;
            match hit {
                Some((_, record)) if !record.info.tombstone() => {
                    let new_value = modifier(Some(&record.value));
                    if self.try_append_once(key, &new_value, new_value.len(), false, hash, head)? {
                        self.notify(key, hash, false);
                        return Ok(RmwResult::CopyUpdated);
                    }
                }
                _ => {
                    let value = modifier(None);
                    if self.try_append_once(key, &value, value.len(), false, hash, head)? {
                        self.notify(key, hash, false);
                        return Ok(RmwResult::Created);
                    }
                }
            }
        }
    }

    fn delete_via_device(&self, key: &[u8], hash: u64) -> Result<bool> {
        loop {
            let head = self.index.head(hash);
            match self.walk_any(key, head)? {
                Some((_, record)) if !record.info.tombstone() => {
                    if self.try_append_once(key, &[], 0, true, hash, head)? {
                        self.notify(key, hash, true);
                        return Ok(true);
                    }
                }
                _ => return Ok(false),
            }
        }
    }

    // -- recovery -----------------------------------------------------------

    /// Rebuild bucket heads by scanning the log ascending; the newest
    /// record per bucket wins, sealed orphans are skipped.
    pub fn rebuild_index_from_log(&self) -> Result<()> {
        self.index.clear();
        let begin = self.allocator.begin_address();
        let tail = self.allocator.tail();
        for entry in self.allocator.scan(begin, tail) {
            let (la, record) = entry?;
            if record.info.sealed() {
                continue;
            }
            self.index.set(key_hash(&record.key), la);
        }
        Ok(())
    }

    /// Delete that resolves a pending lookup through the device
    /// immediately; used by AOF replay and migration.
    pub fn delete_blocking(&self, key: &[u8]) -> Result<bool> {
        let mut pending = SessionPending::default();
        match self.delete(key, &mut pending)? {
            DeleteOutcome::Deleted => Ok(true),
            DeleteOutcome::NotFound => Ok(false),
            DeleteOutcome::Pending(_) => {
                let mut completions = self.complete_pending(&mut pending, true);
                match completions.pop().map(|c| c.result).transpose()? {
                    Some(PendingOutcome::Delete(existed)) => Ok(existed),
                    _ => Ok(false),
                }
            }
        }
    }

    /// Convenience read that resolves pending lookups through the device
    /// immediately; used by recovery checks and migration.
    pub fn read_blocking(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut pending = SessionPending::default();
        match self.read(key, &mut pending)? {
            ReadOutcome::Found(value) => Ok(Some(value)),
            ReadOutcome::NotFound => Ok(None),
            ReadOutcome::Pending(_) => {
                let mut completions = self.complete_pending(&mut pending, true);
                match completions.pop().map(|c| c.result).transpose()? {
                    Some(PendingOutcome::Read(value)) => Ok(value),
                    _ => Ok(None),
                }
            }
        }
    }
}

/// `INVALID_ADDRESS` re-export for callers inspecting raw heads.
pub const EMPTY_BUCKET: Address = INVALID_ADDRESS;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, SECTOR_SIZE};
    use crate::storage::device::SegmentedFileDevice;

    fn store(page_bits: u32, memory_pages: usize) -> (tempfile::TempDir, KvStore) {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(SegmentedFileDevice::open(dir.path(), "hlog", 1 << 20).unwrap());
        let pool = BufferPool::new(SECTOR_SIZE, 64);
        let config = StoreConfig {
            kind: StoreKind::Main,
            index_size: 1 << 10,
            page_bits,
            memory_pages,
        };
        (dir, KvStore::new(config, device, pool))
    }

    #[test]
    fn upsert_then_read() {
        let (_dir, store) = store(12, 4);
        store.upsert(b"foo", b"bar").unwrap();
        let mut pending = SessionPending::default();
        assert_eq!(
            store.read(b"foo", &mut pending).unwrap(),
            ReadOutcome::Found(b"bar".to_vec())
        );
        assert_eq!(store.read(b"nope", &mut pending).unwrap(), ReadOutcome::NotFound);
    }

    #[test]
    fn rmw_creates_then_updates() {
        let (_dir, store) = store(12, 4);
        let mut pending = SessionPending::default();

        let outcome = store
            .rmw(b"ctr", Box::new(|_| b"1".to_vec()), &mut pending)
            .unwrap();
        assert_eq!(outcome, RmwOutcome::Done(RmwResult::Created));

        let outcome = store
            .rmw(
                b"ctr",
                Box::new(|old| {
                    assert_eq!(old, Some(&b"1"[..]));
                    b"2".to_vec()
                }),
                &mut pending,
            )
            .unwrap();
        assert!(matches!(
            outcome,
            RmwOutcome::Done(RmwResult::InPlaceUpdated) | RmwOutcome::Done(RmwResult::CopyUpdated)
        ));
        assert_eq!(store.read_blocking(b"ctr").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn delete_appends_tombstone() {
        let (_dir, store) = store(12, 4);
        let mut pending = SessionPending::default();
        store.upsert(b"gone", b"soon").unwrap();
        assert_eq!(store.delete(b"gone", &mut pending).unwrap(), DeleteOutcome::Deleted);
        assert_eq!(store.read(b"gone", &mut pending).unwrap(), ReadOutcome::NotFound);
        assert_eq!(store.delete(b"gone", &mut pending).unwrap(), DeleteOutcome::NotFound);
    }

    #[test]
    fn evicted_reads_go_pending_and_complete() {
        let (_dir, store) = store(9, 2);
        store.upsert(b"old", b"value").unwrap();
        for i in 0..50 {
            store
                .upsert(format!("fill-{i}").as_bytes(), &[0u8; 100])
                .unwrap();
        }
        let mut pending = SessionPending::default();
        match store.read(b"old", &mut pending).unwrap() {
            ReadOutcome::Pending(id) => {
                let completions = store.complete_pending(&mut pending, true);
                assert_eq!(completions.len(), 1);
                assert_eq!(completions[0].id, id);
                assert_eq!(
                    completions[0].result.as_ref().unwrap(),
                    &PendingOutcome::Read(Some(b"value".to_vec()))
                );
            }
            ReadOutcome::Found(value) => assert_eq!(value, b"value"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn rebuild_restores_heads_from_log() {
        let (_dir, store) = store(12, 4);
        store.upsert(b"a", b"1").unwrap();
        store.upsert(b"b", b"2").unwrap();
        store.upsert(b"a", b"3").unwrap();
        store.index().clear();
        store.rebuild_index_from_log().unwrap();
        assert_eq!(store.read_blocking(b"a").unwrap(), Some(b"3".to_vec()));
        assert_eq!(store.read_blocking(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn observers_see_mutations() {
        use std::sync::atomic::AtomicUsize;

        struct Counter(AtomicUsize);
        impl MutationObserver for Counter {
            fn on_mutation(&self, _: StoreKind, _: &[u8], _: u64, _: bool) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (_dir, store) = store(12, 4);
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        store.register_observer(counter.clone());
        store.upsert(b"x", b"1").unwrap();
        let mut pending = SessionPending::default();
        store.delete(b"x", &mut pending).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }
}

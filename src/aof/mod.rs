// # Append-Only File
//
// Single-writer durable log of mutation records. The address space is
// paged; each page reserves an 8-byte trailer (`used | crc32`) forming
// the checksum frame a record never straddles. Normal commits rewrite the
// tail page's trailer; fast-commit mode appends a small metadata record
// instead and leaves partial pages trailerless.

pub mod record;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::{FerriteError, Result};
use crate::storage::address::{AddressLayout, FIRST_VALID_ADDRESS};
use crate::storage::device::StorageDevice;

pub use record::{
    entry_extent, parse_entry, parse_key_value, payload_key, payload_key_value, write_entry,
    AofHeader, AofOp, AOF_HEADER_LEN,
};

const TRAILER_LEN: usize = 8;
const SEALED_FLAG: u32 = 0x8000_0000;
const USED_MASK: u32 = 0x7fff_ffff;

/// A record read back out of the log.
#[derive(Debug, Clone)]
pub struct AofEntry {
    pub address: u64,
    pub header: AofHeader,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct AofConfig {
    pub page_bits: u32,
    /// In-memory page window kept behind the tail.
    pub memory_pages: usize,
    pub fast_commit: bool,
}

impl Default for AofConfig {
    fn default() -> Self {
        Self {
            page_bits: 16,
            memory_pages: 16,
            fast_commit: false,
        }
    }
}

struct AofInner {
    pages: BTreeMap<u64, Box<[u8]>>,
    tail: u64,
    /// Written through to the OS (not necessarily fsynced).
    flushed_until: u64,
}

/// The append-only log. `enqueue` is thread-safe; the tail advances under
/// a single writer lock, mirrored into an atomic for lock-free reads.
pub struct AofLog {
    layout: AddressLayout,
    page_size: usize,
    capacity: usize,
    config: AofConfig,
    inner: Mutex<AofInner>,
    tail_mirror: AtomicU64,
    committed: AtomicU64,
    begin: AtomicU64,
    commit_tx: watch::Sender<u64>,
    device: Arc<dyn StorageDevice>,
}

impl AofLog {
    /// Open the log, scanning the device to recover the committed tail.
    pub fn open(config: AofConfig, device: Arc<dyn StorageDevice>) -> Result<Self> {
        let layout = AddressLayout::new(config.page_bits);
        let page_size = layout.page_size();
        let (commit_tx, _) = watch::channel(0u64);
        let log = Self {
            layout,
            page_size,
            capacity: page_size - TRAILER_LEN,
            config,
            inner: Mutex::new(AofInner {
                pages: BTreeMap::new(),
                tail: FIRST_VALID_ADDRESS,
                flushed_until: FIRST_VALID_ADDRESS,
            }),
            tail_mirror: AtomicU64::new(FIRST_VALID_ADDRESS),
            committed: AtomicU64::new(FIRST_VALID_ADDRESS),
            begin: AtomicU64::new(FIRST_VALID_ADDRESS),
            commit_tx,
            device,
        };
        log.recover_tail()?;
        Ok(log)
    }

    pub fn tail(&self) -> u64 {
        self.tail_mirror.load(Ordering::Acquire)
    }

    pub fn committed_until(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    pub fn begin_address(&self) -> u64 {
        self.begin.load(Ordering::Acquire)
    }

    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    fn trailer(&self, page_bytes: &[u8]) -> (u32, u32) {
        let used = u32::from_le_bytes(
            page_bytes[self.capacity..self.capacity + 4].try_into().unwrap(),
        );
        let crc = u32::from_le_bytes(
            page_bytes[self.capacity + 4..self.page_size].try_into().unwrap(),
        );
        (used, crc)
    }

    fn write_trailer(&self, page_bytes: &mut [u8], used: u32, sealed: bool) {
        let flagged = if sealed { used | SEALED_FLAG } else { used };
        let crc = crc32fast::hash(&page_bytes[..used as usize]);
        page_bytes[self.capacity..self.capacity + 4].copy_from_slice(&flagged.to_le_bytes());
        page_bytes[self.capacity + 4..self.page_size].copy_from_slice(&crc.to_le_bytes());
    }

    /// Rebuild the tail from the device: sealed pages chain forward via
    /// their trailers; the first unsealed page ends the log at its commit
    /// trailer (normal mode) or at the last parsable record (fast-commit
    /// or torn tail).
    fn recover_tail(&self) -> Result<()> {
        let start = self.device.begin_offset().max(FIRST_VALID_ADDRESS);
        let mut page = self.layout.page(start);
        let mut tail = start;
        let mut any = false;

        loop {
            let mut bytes = vec![0u8; self.page_size].into_boxed_slice();
            if self
                .device
                .read_at(self.layout.page_start(page), &mut bytes)
                .is_err()
            {
                break;
            }
            any = true;
            let (raw_used, crc) = self.trailer(&bytes);
            let used = (raw_used & USED_MASK) as usize;
            let sealed = raw_used & SEALED_FLAG != 0;
            let trailer_ok = raw_used != 0
                && used <= self.capacity
                && crc32fast::hash(&bytes[..used]) == crc;

            if trailer_ok && sealed {
                tail = self.layout.page_start(page + 1);
                page += 1;
                continue;
            }

            let limit = if trailer_ok { used } else { self.capacity };
            let mut offset = if self.layout.page(tail) == page {
                self.layout.offset(tail)
            } else {
                0
            };
            while offset + AOF_HEADER_LEN <= limit {
                match parse_entry(&bytes[offset..limit]) {
                    Ok(Some((_, payload))) => offset += entry_extent(payload.len()),
                    Ok(None) | Err(_) => break,
                }
            }
            tail = self.layout.page_start(page) + offset as u64;

            // Keep the partial page resident so appends continue in place.
            let mut inner = self.inner.lock();
            inner.pages.insert(page, bytes);
            break;
        }

        if !any {
            tail = FIRST_VALID_ADDRESS;
        }
        let tail = tail.max(FIRST_VALID_ADDRESS).max(start);
        {
            let mut inner = self.inner.lock();
            inner.tail = tail;
            inner.flushed_until = tail;
        }
        self.tail_mirror.store(tail, Ordering::Release);
        self.committed.store(tail, Ordering::Release);
        self.begin.store(start, Ordering::Release);
        let _ = self.commit_tx.send(tail);
        debug!(tail, begin = start, "AOF recovered");
        Ok(())
    }

    /// Append one record; returns its logical address. Thread-safe.
    pub fn enqueue(&self, header: AofHeader, payload: &[u8]) -> Result<u64> {
        let extent = entry_extent(payload.len());
        if extent > self.capacity {
            return Err(FerriteError::Serialization(format!(
                "AOF record of {extent} bytes exceeds the page frame"
            )));
        }

        let mut inner = self.inner.lock();
        let mut offset = self.layout.offset(inner.tail);
        if offset + extent > self.capacity {
            self.seal_tail_page(&mut inner);
            inner.tail = self.layout.next_page_start(inner.tail);
            offset = 0;
        }
        let page = self.layout.page(inner.tail);
        let address = inner.tail;
        let page_size = self.page_size;
        let bytes = inner
            .pages
            .entry(page)
            .or_insert_with(|| vec![0u8; page_size].into_boxed_slice());
        write_entry(&mut bytes[offset..offset + extent], &header, payload);
        inner.tail += extent as u64;
        self.tail_mirror.store(inner.tail, Ordering::Release);
        trace!(address, op = ?header.op, "AOF enqueue");
        Ok(address)
    }

    fn seal_tail_page(&self, inner: &mut AofInner) {
        let page = self.layout.page(inner.tail);
        let used = self.layout.offset(inner.tail) as u32;
        let page_size = self.page_size;
        let bytes = inner
            .pages
            .entry(page)
            .or_insert_with(|| vec![0u8; page_size].into_boxed_slice());
        self.write_trailer(bytes, used, true);
    }

    /// Flush enqueued records to durable storage. With `spin_wait` the
    /// call returns only after the fsync; without it, bytes reach the OS
    /// but the committed mark does not advance until a waited commit.
    pub fn commit(&self, spin_wait: bool) -> Result<()> {
        let mut inner = self.inner.lock();

        if self.config.fast_commit {
            if inner.tail > self.committed_until() {
                // Small metadata record carrying the pre-commit tail.
                let header = AofHeader::new(AofOp::FastCommit, 0);
                let payload = inner.tail.to_le_bytes();
                let extent = entry_extent(payload.len());
                let mut offset = self.layout.offset(inner.tail);
                if offset + extent > self.capacity {
                    self.seal_tail_page(&mut inner);
                    inner.tail = self.layout.next_page_start(inner.tail);
                    offset = 0;
                }
                let page = self.layout.page(inner.tail);
                let page_size = self.page_size;
                let bytes = inner
                    .pages
                    .entry(page)
                    .or_insert_with(|| vec![0u8; page_size].into_boxed_slice());
                write_entry(&mut bytes[offset..offset + extent], &header, &payload);
                inner.tail += extent as u64;
                self.tail_mirror.store(inner.tail, Ordering::Release);
            }
        } else {
            // Re-stamp the tail page's commit trailer.
            let page = self.layout.page(inner.tail);
            let used = self.layout.offset(inner.tail) as u32;
            if used > 0 {
                if let Some(bytes) = inner.pages.get_mut(&page) {
                    self.write_trailer(bytes, used, false);
                }
            }
        }

        let tail = inner.tail;
        let first_dirty = self.layout.page(inner.flushed_until);
        let last_dirty = self.layout.page(tail);
        for page in first_dirty..=last_dirty {
            if let Some(bytes) = inner.pages.get(&page) {
                self.device.write_at(self.layout.page_start(page), bytes)?;
            }
        }
        inner.flushed_until = tail;

        // Drop sealed pages that fell out of the memory window.
        let keep_from = self.layout.page(tail).saturating_sub(self.config.memory_pages as u64);
        let dead: Vec<u64> = inner.pages.range(..keep_from).map(|(p, _)| *p).collect();
        for page in dead {
            inner.pages.remove(&page);
        }
        drop(inner);

        if spin_wait {
            self.device.flush()?;
            self.committed.store(tail, Ordering::Release);
            let _ = self.commit_tx.send(tail);
            trace!(tail, "AOF commit durable");
        }
        Ok(())
    }

    /// Block until everything at or below `la` is durably committed.
    pub async fn wait_for_commit(&self, la: u64) -> Result<()> {
        let mut rx = self.subscribe_commits();
        // Late subscribers observe the current value immediately.
        while *rx.borrow_and_update() < la {
            rx.changed()
                .await
                .map_err(|_| FerriteError::CancellationRequested)?;
        }
        Ok(())
    }

    fn page_bytes(&self, page: u64) -> Result<Box<[u8]>> {
        {
            let inner = self.inner.lock();
            if let Some(bytes) = inner.pages.get(&page) {
                return Ok(bytes.clone());
            }
        }
        let mut bytes = vec![0u8; self.page_size].into_boxed_slice();
        self.device.read_at(self.layout.page_start(page), &mut bytes)?;
        let (raw_used, crc) = self.trailer(&bytes);
        let used = (raw_used & USED_MASK) as usize;
        if raw_used != 0 && (used > self.capacity || crc32fast::hash(&bytes[..used]) != crc) {
            return Err(FerriteError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("AOF page {page} checksum mismatch"),
            )));
        }
        Ok(bytes)
    }

    /// Read up to `max_entries` records starting at `from`; returns the
    /// entries plus the address to resume from.
    pub fn read_entries(&self, from: u64, max_entries: usize) -> Result<(Vec<AofEntry>, u64)> {
        let tail = self.tail();
        let mut cursor = from.max(self.begin_address());
        let mut entries = Vec::new();

        while cursor < tail && entries.len() < max_entries {
            let offset = self.layout.offset(cursor);
            if offset + AOF_HEADER_LEN > self.capacity {
                cursor = self.layout.next_page_start(cursor);
                continue;
            }
            let page = self.layout.page(cursor);
            let bytes = self.page_bytes(page)?;
            match parse_entry(&bytes[offset..self.capacity])? {
                None => cursor = self.layout.next_page_start(cursor),
                Some((header, payload)) => {
                    let extent = entry_extent(payload.len()) as u64;
                    entries.push(AofEntry {
                        address: cursor,
                        header,
                        payload,
                    });
                    cursor += extent;
                }
            }
        }
        Ok((entries, cursor))
    }

    /// Cursor over `[from, to)` in address order.
    pub fn iterate(&self, from: u64, to: u64) -> AofIterator<'_> {
        AofIterator {
            log: self,
            cursor: from.max(self.begin_address()),
            end: to.min(self.tail()),
        }
    }

    /// Drop log contents below `la`. Callers are responsible for clamping
    /// to replica acknowledgements (see the replication manager's
    /// `safe_truncate`).
    pub fn truncate_until(&self, la: u64) -> Result<()> {
        let la = la.min(self.committed_until());
        {
            let mut inner = self.inner.lock();
            let dead_page = self.layout.page(la);
            let dead: Vec<u64> = inner.pages.range(..dead_page).map(|(p, _)| *p).collect();
            for page in dead {
                inner.pages.remove(&page);
            }
        }
        self.begin.fetch_max(la, Ordering::AcqRel);
        self.device.truncate_until(la)?;
        debug!(begin = la, "AOF truncated");
        Ok(())
    }
}

pub struct AofIterator<'a> {
    log: &'a AofLog,
    cursor: u64,
    end: u64,
}

impl Iterator for AofIterator<'_> {
    type Item = Result<AofEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.end {
            return None;
        }
        match self.log.read_entries(self.cursor, 1) {
            Err(err) => Some(Err(err)),
            Ok((entries, next)) => {
                self.cursor = next;
                match entries.into_iter().next() {
                    Some(entry) if entry.address < self.end => Some(Ok(entry)),
                    _ => None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::device::SegmentedFileDevice;

    fn open_log(dir: &std::path::Path, fast_commit: bool) -> AofLog {
        let device = Arc::new(SegmentedFileDevice::open(dir, "aof", 1 << 20).unwrap());
        AofLog::open(
            AofConfig {
                page_bits: 10,
                memory_pages: 4,
                fast_commit,
            },
            device,
        )
        .unwrap()
    }

    fn upsert(log: &AofLog, key: &[u8], value: &[u8]) -> u64 {
        log.enqueue(
            AofHeader::new(AofOp::StoreUpsert, 1),
            &payload_key_value(key, value),
        )
        .unwrap()
    }

    #[test]
    fn enqueue_addresses_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), false);
        let a = upsert(&log, b"a", b"1");
        let b = upsert(&log, b"b", b"2");
        assert!(b > a);
        assert!(a >= FIRST_VALID_ADDRESS);
    }

    #[test]
    fn records_never_straddle_a_page_frame() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), false);
        let layout = AddressLayout::new(10);
        let mut last_page = 0;
        for i in 0..100 {
            let la = upsert(&log, format!("key-{i}").as_bytes(), &[7u8; 60]);
            let page = layout.page(la);
            assert!(layout.offset(la) + entry_extent(4 + 6 + 60) <= 1024 - TRAILER_LEN);
            assert!(page >= last_page);
            last_page = page;
        }
    }

    #[test]
    fn iterate_returns_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), false);
        let mut addresses = Vec::new();
        for i in 0..50 {
            addresses.push(upsert(&log, format!("k{i}").as_bytes(), b"v"));
        }
        log.commit(true).unwrap();
        let got: Vec<u64> = log
            .iterate(FIRST_VALID_ADDRESS, log.tail())
            .map(|e| e.unwrap().address)
            .collect();
        assert_eq!(got, addresses);
    }

    #[test]
    fn commit_then_reopen_recovers_tail() {
        let dir = tempfile::tempdir().unwrap();
        let tail = {
            let log = open_log(dir.path(), false);
            for i in 0..40 {
                upsert(&log, format!("k{i}").as_bytes(), &[3u8; 50]);
            }
            log.commit(true).unwrap();
            log.tail()
        };
        let log = open_log(dir.path(), false);
        assert_eq!(log.tail(), tail);
        let count = log.iterate(FIRST_VALID_ADDRESS, log.tail()).count();
        assert_eq!(count, 40);
    }

    #[test]
    fn uncommitted_records_do_not_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = open_log(dir.path(), false);
            upsert(&log, b"committed", b"1");
            log.commit(true).unwrap();
            upsert(&log, b"lost", b"2");
            // no commit
        }
        let log = open_log(dir.path(), false);
        let keys: Vec<Vec<u8>> = log
            .iterate(FIRST_VALID_ADDRESS, log.tail())
            .map(|e| parse_key_value(&e.unwrap().payload).unwrap().0.to_vec())
            .collect();
        assert_eq!(keys, vec![b"committed".to_vec()]);
    }

    #[test]
    fn fast_commit_writes_metadata_records_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let tail = {
            let log = open_log(dir.path(), true);
            upsert(&log, b"x", b"1");
            log.commit(true).unwrap();
            log.tail()
        };
        let log = open_log(dir.path(), true);
        assert_eq!(log.tail(), tail);
        let ops: Vec<AofOp> = log
            .iterate(FIRST_VALID_ADDRESS, log.tail())
            .map(|e| e.unwrap().header.op)
            .collect();
        assert_eq!(ops, vec![AofOp::StoreUpsert, AofOp::FastCommit]);
    }

    #[test]
    fn truncate_advances_begin() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path(), false);
        let mut addresses = Vec::new();
        for i in 0..100 {
            addresses.push(upsert(&log, format!("k{i}").as_bytes(), &[1u8; 100]));
        }
        log.commit(true).unwrap();
        let cut = addresses[50];
        log.truncate_until(cut).unwrap();
        assert_eq!(log.begin_address(), cut);
        let first = log.iterate(0, log.tail()).next().unwrap().unwrap();
        assert_eq!(first.address, cut);
    }

    #[tokio::test]
    async fn wait_for_commit_resolves_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(open_log(dir.path(), false));
        let la = upsert(&log, b"k", b"v");
        let waiter = {
            let log = Arc::clone(&log);
            tokio::spawn(async move { log.wait_for_commit(la + 1).await })
        };
        log.commit(true).unwrap();
        waiter.await.unwrap().unwrap();
    }
}

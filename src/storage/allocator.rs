// # Log-Structured Allocator
//
// Owns a circular ring of in-memory pages backing a linear logical-address
// space. The tail advances monotonically via compare-and-swap; dirty pages
// flush to the storage device in order before their frame is recycled for
// a newer page. Readers below the in-memory head go through the device.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::buffer::BufferPool;
use crate::error::{FerriteError, Result};

use super::address::{align_up, Address, AddressLayout, FIRST_VALID_ADDRESS, RECORD_ALIGNMENT};
use super::device::StorageDevice;
use super::epoch::EpochManager;
use super::record::{parse_record, OwnedRecord, RECORD_HEADER_LEN};

struct Frame {
    page: u64,
    data: Option<Box<[u8]>>,
}

/// The in-memory page ring plus its backing device.
///
/// Hands out logical addresses, never pointers; record bytes are copied
/// out under the owning frame's lock so no reference outlives residency.
pub struct LogAllocator {
    layout: AddressLayout,
    page_size: usize,
    num_frames: usize,
    frames: Vec<Mutex<Frame>>,
    tail: AtomicU64,
    begin: AtomicU64,
    head: AtomicU64,
    flushed_until: AtomicU64,
    device: Arc<dyn StorageDevice>,
    epoch: Arc<EpochManager>,
    pool: Arc<BufferPool>,
    flush_lock: Mutex<()>,
    turnover_lock: Mutex<()>,
}

impl LogAllocator {
    pub fn new(
        page_bits: u32,
        num_frames: usize,
        device: Arc<dyn StorageDevice>,
        pool: Arc<BufferPool>,
    ) -> Self {
        debug_assert!(num_frames >= 2);
        let layout = AddressLayout::new(page_bits);
        Self {
            layout,
            page_size: layout.page_size(),
            num_frames,
            frames: (0..num_frames)
                .map(|_| {
                    Mutex::new(Frame {
                        page: u64::MAX,
                        data: None,
                    })
                })
                .collect(),
            tail: AtomicU64::new(FIRST_VALID_ADDRESS),
            begin: AtomicU64::new(FIRST_VALID_ADDRESS),
            head: AtomicU64::new(FIRST_VALID_ADDRESS),
            flushed_until: AtomicU64::new(FIRST_VALID_ADDRESS),
            device,
            epoch: Arc::new(EpochManager::default()),
            pool,
            flush_lock: Mutex::new(()),
            turnover_lock: Mutex::new(()),
        }
    }

    pub fn layout(&self) -> AddressLayout {
        self.layout
    }

    pub fn epoch(&self) -> &Arc<EpochManager> {
        &self.epoch
    }

    pub fn tail(&self) -> Address {
        self.tail.load(Ordering::Acquire)
    }

    pub fn begin_address(&self) -> Address {
        self.begin.load(Ordering::Acquire)
    }

    pub fn head_address(&self) -> Address {
        self.head.load(Ordering::Acquire)
    }

    pub fn flushed_until(&self) -> Address {
        self.flushed_until.load(Ordering::Acquire)
    }

    /// Reserve `size` contiguous bytes in the tail page, opening a new page
    /// when the remainder of the current one cannot hold them. Returns the
    /// logical address of the reservation.
    pub fn allocate(&self, size: usize) -> Result<Address> {
        let size = align_up(size, RECORD_ALIGNMENT);
        if size > self.page_size {
            return Err(FerriteError::Configuration(format!(
                "allocation of {size} bytes exceeds the page size {}",
                self.page_size
            )));
        }
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let offset = self.layout.offset(tail);
            let target = if offset + size <= self.page_size {
                tail
            } else {
                self.layout.next_page_start(tail)
            };
            if self
                .tail
                .compare_exchange_weak(
                    tail,
                    target + size as u64,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.ensure_frame(self.layout.page(target))?;
                trace!(address = target, size, "allocated log region");
                return Ok(target);
            }
        }
    }

    /// Make the frame for `page` resident, flushing and evicting the prior
    /// occupant of its ring slot first.
    fn ensure_frame(&self, page: u64) -> Result<()> {
        let index = (page % self.num_frames as u64) as usize;
        {
            let frame = self.frames[index].lock();
            if frame.page == page && frame.data.is_some() {
                return Ok(());
            }
        }

        let _turnover = self.turnover_lock.lock();
        {
            let frame = self.frames[index].lock();
            if frame.page == page && frame.data.is_some() {
                return Ok(());
            }
        }

        if page >= self.num_frames as u64 {
            let evicted = page - self.num_frames as u64;
            let evicted_end = self.layout.page_start(evicted + 1);
            if self.flushed_until() < evicted_end {
                self.flush_until(evicted_end)?;
            }
            self.head.fetch_max(evicted_end, Ordering::AcqRel);
            // Late readers that captured the old head re-check page
            // identity under the frame lock; the bump lets retired state
            // drain once they exit.
            self.epoch.bump();
            debug!(page = evicted, head = evicted_end, "evicted log page");
        }

        let mut frame = self.frames[index].lock();
        if frame.page != page || frame.data.is_none() {
            frame.page = page;
            frame.data = Some(vec![0u8; self.page_size].into_boxed_slice());
        }
        Ok(())
    }

    /// Copy `data` into the page at `la`. The reservation must have come
    /// from [`LogAllocator::allocate`].
    pub fn write_bytes(&self, la: Address, data: &[u8]) {
        let page = self.layout.page(la);
        let offset = self.layout.offset(la);
        let index = (page % self.num_frames as u64) as usize;
        let mut frame = self.frames[index].lock();
        if frame.page != page {
            // A reservation is written before its page can be evicted.
            panic!("write to evicted page {page} at address {la}");
        }
        let buf = frame.data.as_mut().expect("resident frame has data");
        buf[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Run `mutate` against the raw record bytes at `la` if its page is
    /// still resident. Used for in-place updates in the mutable region.
    pub fn with_resident_mut<R>(
        &self,
        la: Address,
        mutate: impl FnOnce(&mut [u8]) -> R,
    ) -> Option<R> {
        if la < self.head_address() {
            return None;
        }
        let page = self.layout.page(la);
        let offset = self.layout.offset(la);
        let index = (page % self.num_frames as u64) as usize;
        let mut frame = self.frames[index].lock();
        if frame.page != page {
            return None;
        }
        let buf = frame.data.as_mut()?;
        Some(mutate(&mut buf[offset..]))
    }

    /// Copy the record at `la` out of its resident page. `None` when the
    /// page has been evicted (the caller goes pending).
    pub fn read_record_resident(&self, la: Address) -> Option<OwnedRecord> {
        if la < self.head_address() {
            return None;
        }
        let page = self.layout.page(la);
        let offset = self.layout.offset(la);
        let index = (page % self.num_frames as u64) as usize;
        let frame = self.frames[index].lock();
        if frame.page != page {
            return None;
        }
        let buf = frame.data.as_ref()?;
        parse_record(&buf[offset..])
    }

    /// Read the record at `la` from the device, tolerating page padding.
    /// `Ok(None)` means the bytes there are not a record.
    fn read_device_record_opt(&self, la: Address) -> Result<Option<OwnedRecord>> {
        let mut header = self.pool.acquire(1)?;
        let header_buf = &mut header.aligned_mut()[..RECORD_HEADER_LEN];
        self.device.read_at(la, header_buf)?;
        let info = u64::from_le_bytes(header_buf[0..8].try_into().unwrap());
        if !super::record::RecordInfo::from_raw(info).is_valid() {
            return Ok(None);
        }
        let key_len = u32::from_le_bytes(header_buf[16..20].try_into().unwrap()) as usize;
        let capacity = u32::from_le_bytes(header_buf[24..28].try_into().unwrap()) as usize;
        let extent = super::record::record_extent(key_len, capacity);

        let mut buf = self.pool.acquire(extent)?;
        let slice = &mut buf.aligned_mut()[..extent];
        self.device.read_at(la, slice)?;
        Ok(parse_record(slice))
    }

    /// Read the record at `la` from the device. The index pointed here, so
    /// anything other than a well-formed record is corruption.
    pub fn read_record_from_device(&self, la: Address) -> Result<OwnedRecord> {
        self.read_device_record_opt(la)?.ok_or_else(|| {
            FerriteError::UnexpectedCheckpointEntry(format!("corrupt record at address {la}"))
        })
    }

    /// Resident-or-device record read; errors only on device failure.
    pub fn read_record_at(&self, la: Address) -> Result<Option<OwnedRecord>> {
        if la < self.begin_address() {
            return Ok(None);
        }
        if la >= self.head_address() {
            if let Some(record) = self.read_record_resident(la) {
                return Ok(Some(record));
            }
        }
        self.read_device_record_opt(la)
    }

    /// Flush all bytes strictly below `target`, in page order, and make
    /// them durable. Pages flush only after all prior pages are queued.
    fn flush_until(&self, target: Address) -> Result<()> {
        let target = target.min(self.tail());
        let _flush = self.flush_lock.lock();
        let start = self.flushed_until();
        if target <= start {
            return Ok(());
        }

        let mut cursor = start;
        while cursor < target {
            let page = self.layout.page(cursor);
            let chunk_end = target.min(self.layout.next_page_start(cursor));
            let chunk_len = (chunk_end - cursor) as usize;
            let offset = self.layout.offset(cursor);

            let mut io_buf = self.pool.acquire(chunk_len)?;
            {
                let index = (page % self.num_frames as u64) as usize;
                let frame = self.frames[index].lock();
                if frame.page != page {
                    panic!("flushing page {page} after eviction");
                }
                let data = frame.data.as_ref().expect("resident frame has data");
                io_buf.aligned_mut()[..chunk_len].copy_from_slice(&data[offset..offset + chunk_len]);
            }
            self.device.write_at(cursor, &io_buf.aligned()[..chunk_len])?;
            cursor = chunk_end;
        }

        self.device.flush()?;
        self.flushed_until.store(target, Ordering::Release);
        trace!(flushed_until = target, "log flush complete");
        Ok(())
    }

    /// Guarantee all records below `la` are durable before returning.
    pub fn flush_to(&self, la: Address) -> Result<()> {
        self.flush_until(la)
    }

    /// Advance the read horizon. With `truncate_log`, dead segments are
    /// dropped from the device.
    pub fn shift_begin_address(&self, new_begin: Address, truncate_log: bool) -> Result<()> {
        let tail = self.tail();
        if new_begin > tail {
            return Err(FerriteError::InvalidBeginAddress {
                requested: new_begin,
                tail,
            });
        }
        self.flush_until(new_begin)?;
        self.begin.fetch_max(new_begin, Ordering::AcqRel);
        self.head.fetch_max(new_begin, Ordering::AcqRel);
        if truncate_log {
            self.device.truncate_until(new_begin)?;
        }
        debug!(begin = new_begin, truncate_log, "begin address shifted");
        Ok(())
    }

    /// Copy the raw log bytes in `[from, to)`, resolving resident pages
    /// from memory and older pages from the device.
    pub fn read_range(&self, from: Address, to: Address) -> Result<Vec<u8>> {
        debug_assert!(from <= to);
        let mut out = vec![0u8; (to - from) as usize];
        let mut cursor = from;
        while cursor < to {
            let page = self.layout.page(cursor);
            let chunk_end = to.min(self.layout.next_page_start(cursor));
            let chunk_len = (chunk_end - cursor) as usize;
            let out_offset = (cursor - from) as usize;
            let in_page = self.layout.offset(cursor);

            let resident = {
                let index = (page % self.num_frames as u64) as usize;
                let frame = self.frames[index].lock();
                if frame.page == page {
                    frame.data.as_ref().map(|data| {
                        out[out_offset..out_offset + chunk_len]
                            .copy_from_slice(&data[in_page..in_page + chunk_len]);
                    })
                } else {
                    None
                }
            };
            if resident.is_none() {
                self.device
                    .read_at(cursor, &mut out[out_offset..out_offset + chunk_len])?;
            }
            cursor = chunk_end;
        }
        Ok(out)
    }

    /// Reinstall a recovered log image: the device holds `[begin, tail)`
    /// and the most recent pages become resident again.
    pub fn restore(&self, begin: Address, tail: Address, image: &[u8]) -> Result<()> {
        debug_assert_eq!(image.len() as u64, tail - begin);
        self.device.write_at(begin, image)?;
        self.device.flush()?;

        let first_page = self.layout.page(begin);
        let last_page = self.layout.page(tail.saturating_sub(1)).max(first_page);
        let resident_from = last_page.saturating_sub(self.num_frames as u64 - 1).max(first_page);

        for page in resident_from..=last_page {
            let index = (page % self.num_frames as u64) as usize;
            let mut frame = self.frames[index].lock();
            let mut data = vec![0u8; self.page_size].into_boxed_slice();

            let page_start = self.layout.page_start(page);
            let copy_from = page_start.max(begin);
            let copy_to = self.layout.next_page_start(page_start).min(tail);
            if copy_from < copy_to {
                let src = (copy_from - begin) as usize..(copy_to - begin) as usize;
                let dst = self.layout.offset(copy_from);
                data[dst..dst + src.len()].copy_from_slice(&image[src]);
            }
            frame.page = page;
            frame.data = Some(data);
        }

        self.begin.store(begin, Ordering::Release);
        self.head
            .store(self.layout.page_start(resident_from).max(begin), Ordering::Release);
        self.flushed_until.store(tail, Ordering::Release);
        self.tail.store(tail, Ordering::Release);
        debug!(begin, tail, "log image restored");
        Ok(())
    }

    /// Iterate records in `[from, to)` in address order, skipping page
    /// padding and torn tail bytes.
    pub fn scan(&self, from: Address, to: Address) -> RecordScan<'_> {
        RecordScan {
            allocator: self,
            cursor: from.max(self.begin_address()),
            end: to,
        }
    }
}

/// Ascending iterator over the records of a log range.
pub struct RecordScan<'a> {
    allocator: &'a LogAllocator,
    cursor: Address,
    end: Address,
}

impl Iterator for RecordScan<'_> {
    type Item = Result<(Address, OwnedRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cursor >= self.end {
                return None;
            }
            let layout = self.allocator.layout;
            if layout.offset(self.cursor) + RECORD_HEADER_LEN > layout.page_size() {
                self.cursor = layout.next_page_start(self.cursor);
                continue;
            }
            match self.allocator.read_record_at(self.cursor) {
                Err(err) => return Some(Err(err)),
                Ok(None) => {
                    // Zeroed padding to the end of the page.
                    self.cursor = layout.next_page_start(self.cursor);
                }
                Ok(Some(record)) => {
                    let address = self.cursor;
                    let extent = record.extent() as u64;
                    if layout.offset(address) + record.extent() > layout.page_size() {
                        // Declared extent cannot straddle a page; treat as
                        // padding corruption and skip the page remainder.
                        self.cursor = layout.next_page_start(self.cursor);
                        continue;
                    }
                    self.cursor = address + extent;
                    return Some(Ok((address, record)));
                }
            }
        }
    }
}

// # Sector-Aligned Buffer Pool
//
// Pre-zeroed, sector-aligned byte buffers for direct I/O, recycled through
// 32 size classes. Class `k` holds buffers of `sector_size << k` bytes on a
// lock-free stack; `acquire` rounds the request up to the next class.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::error::{FerriteError, Result};

/// Default device sector size.
pub const SECTOR_SIZE: usize = 512;

const SIZE_CLASSES: usize = 32;

/// Pool of sector-aligned buffers, size-classed by power-of-two sector
/// counts.
///
/// Buffers are allocated with an explicit [`Layout`] so the aligned pointer
/// is stable for the lifetime of an async I/O. `release` zeroes the buffer
/// before restacking it.
pub struct BufferPool {
    sector_size: usize,
    record_size: usize,
    classes: Vec<SegQueue<RawBuffer>>,
    outstanding: AtomicUsize,
}

/// Raw allocation parked in a free stack. Carries everything needed to
/// deallocate.
struct RawBuffer {
    ptr: *mut u8,
    len: usize,
    layout: Layout,
}

// The pointer is uniquely owned by whichever container currently holds the
// RawBuffer; no aliasing across threads.
unsafe impl Send for RawBuffer {}

/// A checked-out buffer. Dropping it returns it to its size class.
pub struct SectorBuffer {
    raw: Option<RawBuffer>,
    level: usize,
    valid_len: usize,
    pool: Arc<BufferPool>,
}

unsafe impl Send for SectorBuffer {}

impl BufferPool {
    /// `record_size` is the unit used by [`BufferPool::acquire`]'s
    /// record-count argument.
    pub fn new(sector_size: usize, record_size: usize) -> Arc<Self> {
        debug_assert!(sector_size.is_power_of_two());
        let classes = (0..SIZE_CLASSES).map(|_| SegQueue::new()).collect();
        Arc::new(Self {
            sector_size,
            record_size,
            classes,
            outstanding: AtomicUsize::new(0),
        })
    }

    /// Size class for a request spanning `sectors` sectors:
    /// `ceil(log2(sectors))`.
    fn level_for(&self, sectors: usize) -> usize {
        sectors.next_power_of_two().trailing_zeros() as usize
    }

    /// Acquire a buffer large enough for `num_records` records, aligned to
    /// the sector size.
    pub fn acquire(self: &Arc<Self>, num_records: usize) -> Result<SectorBuffer> {
        let bytes = num_records.max(1) * self.record_size;
        let sectors = bytes.div_ceil(self.sector_size);
        let level = self.level_for(sectors);
        if level >= SIZE_CLASSES {
            return Err(FerriteError::Configuration(format!(
                "buffer request of {bytes} bytes exceeds the largest size class"
            )));
        }

        let raw = match self.classes[level].pop() {
            Some(raw) => raw,
            None => {
                let len = self.sector_size << level;
                let layout = Layout::from_size_align(len, self.sector_size)
                    .map_err(|_| FerriteError::Configuration("invalid buffer layout".into()))?;
                let ptr = unsafe { alloc_zeroed(layout) };
                if ptr.is_null() {
                    return Err(FerriteError::Configuration(
                        "buffer allocation failed".into(),
                    ));
                }
                RawBuffer { ptr, len, layout }
            }
        };
        self.outstanding.fetch_add(1, Ordering::Relaxed);

        Ok(SectorBuffer {
            valid_len: raw.len,
            raw: Some(raw),
            level,
            pool: Arc::clone(self),
        })
    }

    /// Number of buffers currently checked out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    fn restack(&self, raw: RawBuffer, level: usize) {
        // Zero before reuse so stale record bytes never leak into a fresh
        // I/O.
        unsafe { ptr::write_bytes(raw.ptr, 0, raw.len) };
        let prev = self.outstanding.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "buffer released twice");
        self.classes[level].push(raw);
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        for class in &self.classes {
            while let Some(raw) = class.pop() {
                unsafe { dealloc(raw.ptr, raw.layout) };
            }
        }
    }
}

impl SectorBuffer {
    /// Stable sector-aligned view of the buffer.
    pub fn aligned(&self) -> &[u8] {
        let raw = self.raw.as_ref().unwrap();
        unsafe { std::slice::from_raw_parts(raw.ptr, raw.len) }
    }

    pub fn aligned_mut(&mut self) -> &mut [u8] {
        let raw = self.raw.as_ref().unwrap();
        unsafe { std::slice::from_raw_parts_mut(raw.ptr, raw.len) }
    }

    pub fn capacity(&self) -> usize {
        self.raw.as_ref().map(|r| r.len).unwrap_or(0)
    }

    /// Number of bytes considered meaningful by the current I/O.
    pub fn valid_len(&self) -> usize {
        self.valid_len
    }

    pub fn set_valid_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity());
        self.valid_len = len;
    }
}

impl Drop for SectorBuffer {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            self.pool.restack(raw, self.level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_aligned_zeroed_buffer() {
        let pool = BufferPool::new(SECTOR_SIZE, 64);
        let buf = pool.acquire(4).unwrap();
        assert_eq!(buf.aligned().as_ptr() as usize % SECTOR_SIZE, 0);
        assert!(buf.aligned().iter().all(|&b| b == 0));
        assert!(buf.capacity() >= 4 * 64);
    }

    #[test]
    fn release_zeroes_and_recycles() {
        let pool = BufferPool::new(SECTOR_SIZE, 64);
        let ptr = {
            let mut buf = pool.acquire(1).unwrap();
            buf.aligned_mut()[0] = 0xAB;
            buf.aligned().as_ptr() as usize
        };
        assert_eq!(pool.outstanding(), 0);

        // Same class, so the recycled allocation comes back zeroed.
        let buf = pool.acquire(1).unwrap();
        assert_eq!(buf.aligned().as_ptr() as usize, ptr);
        assert_eq!(buf.aligned()[0], 0);
    }

    #[test]
    fn size_classes_round_up_to_powers_of_two() {
        let pool = BufferPool::new(SECTOR_SIZE, 1);
        let buf = pool.acquire(SECTOR_SIZE * 3).unwrap();
        assert_eq!(buf.capacity(), SECTOR_SIZE * 4);
    }
}

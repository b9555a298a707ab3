// Hash index over logical addresses. Each bucket holds the address of the
// most recent record whose key hashes there; older records (and colliding
// keys) are reached through the records' previous-address chain.

use std::sync::atomic::{AtomicU64, Ordering};

use super::address::{Address, INVALID_ADDRESS};

pub struct HashIndex {
    buckets: Box<[AtomicU64]>,
    mask: u64,
}

impl HashIndex {
    /// `size` is rounded up to a power of two.
    pub fn new(size: usize) -> Self {
        let size = size.max(16).next_power_of_two();
        Self {
            buckets: (0..size).map(|_| AtomicU64::new(INVALID_ADDRESS)).collect(),
            mask: size as u64 - 1,
        }
    }

    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    fn bucket(&self, hash: u64) -> &AtomicU64 {
        &self.buckets[(hash & self.mask) as usize]
    }

    /// Address of the newest record in the bucket, or `INVALID_ADDRESS`.
    pub fn head(&self, hash: u64) -> Address {
        self.bucket(hash).load(Ordering::Acquire)
    }

    /// Publish `new` as the bucket head iff the head is still `expected`.
    pub fn try_update(&self, hash: u64, expected: Address, new: Address) -> bool {
        self.bucket(hash)
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditional store, used by recovery's single-threaded rebuild.
    pub fn set(&self, hash: u64, address: Address) {
        self.bucket(hash).store(address, Ordering::Release);
    }

    pub fn clear(&self) {
        for bucket in self.buckets.iter() {
            bucket.store(INVALID_ADDRESS, Ordering::Release);
        }
    }

    /// Flat copy of every bucket, for the checkpoint index file.
    pub fn snapshot(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|bucket| bucket.load(Ordering::Acquire))
            .collect()
    }

    /// Reinstall a snapshot produced by [`HashIndex::snapshot`] on an index
    /// of the same size.
    pub fn restore(&self, snapshot: &[u64]) -> bool {
        if snapshot.len() != self.buckets.len() {
            return false;
        }
        for (bucket, &value) in self.buckets.iter().zip(snapshot) {
            bucket.store(value, Ordering::Release);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_update_succeeds_only_from_expected() {
        let index = HashIndex::new(64);
        assert!(index.try_update(7, INVALID_ADDRESS, 100));
        assert!(!index.try_update(7, INVALID_ADDRESS, 200));
        assert!(index.try_update(7, 100, 200));
        assert_eq!(index.head(7), 200);
    }

    #[test]
    fn snapshot_restore_round_trips() {
        let index = HashIndex::new(32);
        index.set(1, 64);
        index.set(2, 128);
        let snap = index.snapshot();

        let fresh = HashIndex::new(32);
        assert!(fresh.restore(&snap));
        assert_eq!(fresh.head(1), 64);
        assert_eq!(fresh.head(2), 128);
        assert!(!fresh.restore(&snap[..4]));
    }

    #[test]
    fn size_rounds_to_power_of_two() {
        assert_eq!(HashIndex::new(100).size(), 128);
    }
}

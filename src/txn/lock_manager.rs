// # Lock Manager
//
// Striped key locks for transactional execution across both stores.
// Acquisition is sorted-by-hash to prevent deadlock; fail-fast mode uses
// bounded waits and releases everything on the first timeout.

use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{FerriteError, Result};

pub struct LockManager {
    stripes: Vec<Mutex<()>>,
    mask: u64,
}

impl LockManager {
    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.max(16).next_power_of_two();
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
            mask: stripes as u64 - 1,
        }
    }

    fn stripe_indices(&self, hashes: &[u64]) -> Vec<usize> {
        let mut indices: Vec<usize> = hashes
            .iter()
            .map(|hash| (hash & self.mask) as usize)
            .collect();
        // Sorted and deduplicated: every competing transaction acquires in
        // the same global order.
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Run `body` with every stripe covering `hashes` held. With a
    /// timeout, each acquisition is bounded and the whole call fails
    /// with `LockTimeout` on the first expiry.
    pub fn with_locks<R>(
        &self,
        hashes: &[u64],
        timeout: Option<Duration>,
        body: impl FnOnce() -> R,
    ) -> Result<R> {
        let indices = self.stripe_indices(hashes);
        let mut guards: Vec<MutexGuard<'_, ()>> = Vec::with_capacity(indices.len());
        for index in indices {
            match timeout {
                Some(timeout) => match self.stripes[index].try_lock_for(timeout) {
                    Some(guard) => guards.push(guard),
                    None => return Err(FerriteError::LockTimeout),
                },
                None => guards.push(self.stripes[index].lock()),
            }
        }
        let result = body();
        drop(guards);
        Ok(result)
    }
}

// # Object Store Values
//
// The object store keeps boxed collection values behind the same log
// engine as the main store; records hold the bincode encoding of a tagged
// union over the collection kinds. Each value reports an approximate
// in-memory size so the engine can bound heap usage.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffer::BufferPool;
use crate::common::StoreKind;
use crate::error::{FerriteError, Result};

use super::device::StorageDevice;
use super::pending::{RmwResult, SessionPending};
use super::store::{DeleteOutcome, KvStore, ReadOutcome, RmwOutcome, StoreConfig};

/// Tagged union over the collection kinds a key can hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectValue {
    SortedSet(BTreeMap<Vec<u8>, f64>),
    List(VecDeque<Vec<u8>>),
    Set(BTreeSet<Vec<u8>>),
    Hash(BTreeMap<Vec<u8>, Vec<u8>>),
    HyperLogLog { registers: Vec<u8> },
    Geo(BTreeMap<Vec<u8>, u64>),
    Null,
}

impl ObjectValue {
    /// Approximate heap footprint, counted the same way before and after a
    /// round trip so deltas stay consistent.
    pub fn memory_size(&self) -> usize {
        const ENTRY_OVERHEAD: usize = 48;
        match self {
            ObjectValue::SortedSet(members) => members
                .keys()
                .map(|m| m.len() + 8 + ENTRY_OVERHEAD)
                .sum(),
            ObjectValue::List(items) => items.iter().map(|i| i.len() + ENTRY_OVERHEAD).sum(),
            ObjectValue::Set(members) => members.iter().map(|m| m.len() + ENTRY_OVERHEAD).sum(),
            ObjectValue::Hash(fields) => fields
                .iter()
                .map(|(k, v)| k.len() + v.len() + ENTRY_OVERHEAD)
                .sum(),
            ObjectValue::HyperLogLog { registers } => registers.len(),
            ObjectValue::Geo(points) => points
                .keys()
                .map(|m| m.len() + 8 + ENTRY_OVERHEAD)
                .sum(),
            ObjectValue::Null => 0,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| FerriteError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(|e| FerriteError::Serialization(e.to_string()))
    }
}

/// Object store: the KV engine plus the value codec and heap accounting.
pub struct ObjectStore {
    inner: KvStore,
    heap_bytes: AtomicI64,
}

impl ObjectStore {
    pub fn new(
        config: StoreConfig,
        device: Arc<dyn StorageDevice>,
        pool: Arc<BufferPool>,
    ) -> Self {
        debug_assert_eq!(config.kind, StoreKind::Object);
        Self {
            inner: KvStore::new(config, device, pool),
            heap_bytes: AtomicI64::new(0),
        }
    }

    pub fn store(&self) -> &KvStore {
        &self.inner
    }

    /// Approximate total heap held by live object values.
    pub fn heap_bytes(&self) -> i64 {
        self.heap_bytes.load(Ordering::Relaxed)
    }

    pub fn read_object(&self, key: &[u8]) -> Result<Option<ObjectValue>> {
        match self.inner.read_blocking(key)? {
            Some(bytes) => ObjectValue::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Decode-modify-encode RMW over the inner byte store.
    pub fn rmw_object<F>(&self, key: &[u8], modify: F) -> Result<RmwResult>
    where
        F: Fn(Option<ObjectValue>) -> ObjectValue + Send + Sync + 'static,
    {
        let old_size = self
            .read_object(key)?
            .map(|value| value.memory_size())
            .unwrap_or(0);

        let modifier = Box::new(move |old: Option<&[u8]>| {
            let old_value = old.and_then(|bytes| ObjectValue::decode(bytes).ok());
            modify(old_value).encode().unwrap_or_default()
        });

        let mut pending = SessionPending::default();
        let outcome = self.inner.rmw(key, modifier, &mut pending)?;
        let result = match outcome {
            RmwOutcome::Done(result) => result,
            RmwOutcome::Pending(_) => {
                let mut completions = self.inner.complete_pending(&mut pending, true);
                match completions.pop().map(|c| c.result).transpose()? {
                    Some(super::pending::PendingOutcome::Rmw(result)) => result,
                    _ => RmwResult::CopyUpdated,
                }
            }
        };

        let new_size = self
            .read_object(key)?
            .map(|value| value.memory_size())
            .unwrap_or(0);
        self.heap_bytes
            .fetch_add(new_size as i64 - old_size as i64, Ordering::Relaxed);
        Ok(result)
    }

    pub fn delete_object(&self, key: &[u8]) -> Result<bool> {
        if let Some(value) = self.read_object(key)? {
            self.heap_bytes
                .fetch_sub(value.memory_size() as i64, Ordering::Relaxed);
        }
        let mut pending = SessionPending::default();
        match self.inner.delete(key, &mut pending)? {
            DeleteOutcome::Deleted => Ok(true),
            DeleteOutcome::NotFound => Ok(false),
            DeleteOutcome::Pending(_) => {
                let mut completions = self.inner.complete_pending(&mut pending, true);
                match completions.pop().map(|c| c.result).transpose()? {
                    Some(super::pending::PendingOutcome::Delete(existed)) => Ok(existed),
                    _ => Ok(false),
                }
            }
        }
    }

    pub fn read_raw(&self, key: &[u8]) -> Result<ReadOutcome> {
        let mut pending = SessionPending::default();
        self.inner.read(key, &mut pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, SECTOR_SIZE};
    use crate::storage::device::SegmentedFileDevice;

    fn object_store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(SegmentedFileDevice::open(dir.path(), "olog", 1 << 20).unwrap());
        let pool = BufferPool::new(SECTOR_SIZE, 64);
        let config = StoreConfig {
            kind: StoreKind::Object,
            index_size: 1 << 8,
            page_bits: 14,
            memory_pages: 4,
        };
        (dir, ObjectStore::new(config, device, pool))
    }

    #[test]
    fn object_value_codec_round_trips() {
        let mut members = BTreeMap::new();
        members.insert(b"alice".to_vec(), 1.5);
        members.insert(b"bob".to_vec(), -2.0);
        let value = ObjectValue::SortedSet(members);
        let decoded = ObjectValue::decode(&value.encode().unwrap()).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn rmw_object_builds_a_list() {
        let (_dir, store) = object_store();
        for item in [b"a".to_vec(), b"b".to_vec()] {
            store
                .rmw_object(b"mylist", move |old| {
                    let mut list = match old {
                        Some(ObjectValue::List(list)) => list,
                        _ => VecDeque::new(),
                    };
                    list.push_back(item.clone());
                    ObjectValue::List(list)
                })
                .unwrap();
        }
        match store.read_object(b"mylist").unwrap().unwrap() {
            ObjectValue::List(list) => {
                assert_eq!(list, VecDeque::from([b"a".to_vec(), b"b".to_vec()]))
            }
            other => panic!("unexpected value {other:?}"),
        }
        assert!(store.heap_bytes() > 0);
    }

    #[test]
    fn delete_object_removes_the_key() {
        let (_dir, store) = object_store();
        store
            .rmw_object(b"s", |_| ObjectValue::Set(BTreeSet::from([b"m".to_vec()])))
            .unwrap();
        assert!(store.delete_object(b"s").unwrap());
        assert!(store.read_object(b"s").unwrap().is_none());
        assert!(!store.delete_object(b"s").unwrap());
    }

    #[test]
    fn memory_size_is_zero_for_null() {
        assert_eq!(ObjectValue::Null.memory_size(), 0);
        assert!(
            ObjectValue::Hash(BTreeMap::from([(b"f".to_vec(), b"v".to_vec())])).memory_size() > 0
        );
    }
}

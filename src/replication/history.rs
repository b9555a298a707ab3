// Replication history: the lineage pair `(replid, replid2)` and their
// offsets. Persisted as one sector-aligned blob, replaced copy-on-write
// then swapped atomically so lock-free readers never see a torn value.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::common::{random_hex_id, NodeId, HEX_ID_LEN};
use crate::error::{FerriteError, Result};

const BLOB_LEN: usize = 512;
const PAYLOAD_LEN: usize = HEX_ID_LEN * 2 + 8 + 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationHistory {
    /// Current lineage id of this node's primary (or itself, as primary).
    pub primary_replid: NodeId,
    /// Previous lineage id after a failover rotation; empty before one.
    pub primary_replid2: String,
    pub replication_offset: i64,
    pub replication_offset2: i64,
}

impl ReplicationHistory {
    pub fn fresh() -> Self {
        Self {
            primary_replid: random_hex_id(),
            primary_replid2: String::new(),
            replication_offset: 0,
            replication_offset2: 0,
        }
    }

    fn to_blob(&self) -> [u8; BLOB_LEN] {
        let mut blob = [0u8; BLOB_LEN];
        blob[0..HEX_ID_LEN].copy_from_slice(self.primary_replid.as_bytes());
        if !self.primary_replid2.is_empty() {
            blob[HEX_ID_LEN..HEX_ID_LEN * 2].copy_from_slice(self.primary_replid2.as_bytes());
        }
        blob[80..88].copy_from_slice(&self.replication_offset.to_le_bytes());
        blob[88..96].copy_from_slice(&self.replication_offset2.to_le_bytes());
        let crc = crc32fast::hash(&blob[..PAYLOAD_LEN]);
        blob[PAYLOAD_LEN..PAYLOAD_LEN + 4].copy_from_slice(&crc.to_le_bytes());
        blob
    }

    fn from_blob(blob: &[u8]) -> Result<Self> {
        if blob.len() != BLOB_LEN {
            return Err(FerriteError::Replication(format!(
                "replication history blob is {} bytes, expected {BLOB_LEN}",
                blob.len()
            )));
        }
        let crc = u32::from_le_bytes(blob[PAYLOAD_LEN..PAYLOAD_LEN + 4].try_into().unwrap());
        if crc32fast::hash(&blob[..PAYLOAD_LEN]) != crc {
            return Err(FerriteError::Replication(
                "replication history checksum mismatch".into(),
            ));
        }
        let replid = std::str::from_utf8(&blob[0..HEX_ID_LEN])
            .map_err(|_| FerriteError::Replication("replication id is not ASCII".into()))?
            .to_string();
        let replid2_raw = &blob[HEX_ID_LEN..HEX_ID_LEN * 2];
        let replid2 = if replid2_raw.iter().all(|&b| b == 0) {
            String::new()
        } else {
            std::str::from_utf8(replid2_raw)
                .map_err(|_| FerriteError::Replication("replication id is not ASCII".into()))?
                .to_string()
        };
        Ok(Self {
            primary_replid: replid,
            primary_replid2: replid2,
            replication_offset: i64::from_le_bytes(blob[80..88].try_into().unwrap()),
            replication_offset2: i64::from_le_bytes(blob[88..96].try_into().unwrap()),
        })
    }
}

/// Shared, read-heavy holder of the current history. Writers clone,
/// modify, persist, then swap the pointer.
pub struct HistoryCell {
    path: PathBuf,
    current: RwLock<Arc<ReplicationHistory>>,
}

impl HistoryCell {
    /// Load `replication.conf` or start a fresh lineage. A present but
    /// corrupt blob is a fatal init error.
    pub fn open(cluster_dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = cluster_dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join("replication.conf");
        let history = if path.exists() {
            let blob = fs::read(&path)?;
            let history = ReplicationHistory::from_blob(&blob)?;
            debug!(replid = %history.primary_replid, "replication history loaded");
            history
        } else {
            let history = ReplicationHistory::fresh();
            info!(replid = %history.primary_replid, "replication history initialized");
            Self::persist_blob(&path, &history)?;
            history
        };
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(history)),
        })
    }

    fn persist_blob(path: &PathBuf, history: &ReplicationHistory) -> Result<()> {
        let tmp = path.with_extension("conf.tmp");
        fs::write(&tmp, history.to_blob())?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(&self) -> Arc<ReplicationHistory> {
        Arc::clone(&self.current.read())
    }

    /// Copy-on-write update: mutate a clone, persist, swap.
    pub fn update(&self, mutate: impl FnOnce(&mut ReplicationHistory)) -> Result<Arc<ReplicationHistory>> {
        let mut next = (*self.load()).clone();
        mutate(&mut next);
        Self::persist_blob(&self.path, &next)?;
        let next = Arc::new(next);
        *self.current.write() = Arc::clone(&next);
        Ok(next)
    }

    /// Failover rotation: the old lineage moves to `replid2`, its final
    /// offset to `offset2`, and a fresh id takes over.
    pub fn rotate(&self, committed_tail: i64) -> Result<Arc<ReplicationHistory>> {
        let rotated = self.update(|history| {
            history.primary_replid2 = std::mem::take(&mut history.primary_replid);
            history.primary_replid = random_hex_id();
            history.replication_offset2 = committed_tail;
            history.replication_offset = committed_tail;
        })?;
        info!(
            replid = %rotated.primary_replid,
            replid2 = %rotated.primary_replid2,
            offset2 = rotated.replication_offset2,
            "replication id rotated"
        );
        Ok(rotated)
    }
}

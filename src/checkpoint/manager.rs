// # Checkpoint Manager
//
// Produces consistent point-in-time snapshots of one store: a hash-index
// snapshot plus either a full log image or a delta since the parent
// checkpoint, and a cookie-wrapped metadata blob tying the checkpoint to
// an AOF address and replication lineage. Checkpoints are tagged by GUID
// and version-barriered: version N completes before N+1 begins.

use std::fs;
use std::path::PathBuf;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{FerriteError, Result};
use crate::storage::KvStore;

use super::metadata::{append_cookie, extract_cookie, CheckpointCookie};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointKind {
    Full,
    Incremental,
    FoldOver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointToken(pub Uuid);

impl std::fmt::Display for CheckpointToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload inside the cookie wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointMetadata {
    token: Uuid,
    kind: CheckpointKind,
    store_version: u32,
    begin: u64,
    tail: u64,
    /// For incrementals: log image starts here instead of `begin`.
    delta_from: Option<u64>,
    parent: Option<Uuid>,
    index_buckets: usize,
}

/// Registry entry for a completed checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointEntry {
    pub token: CheckpointToken,
    pub kind: CheckpointKind,
    pub covered_aof_address: i64,
    pub tail: u64,
    pub parent: Option<Uuid>,
}

struct InProgress {
    token: Uuid,
    kind: CheckpointKind,
    store_version: u32,
    begin: u64,
    capture_tail: u64,
    delta_from: Option<u64>,
    parent: Option<Uuid>,
}

/// Reclamation policy. Keep-all is used in cluster mode, where replicas
/// may seed from any retained checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub keep_latest: usize,
    pub keep_all: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_latest: 2,
            keep_all: false,
        }
    }
}

pub struct CheckpointManager {
    dir: PathBuf,
    /// Extension of the full-image part: `snap` for the main store, `obj`
    /// for the object store (its record payloads are serialized objects).
    data_ext: &'static str,
    policy: RetentionPolicy,
    completed: RwLock<Vec<CheckpointEntry>>,
    in_progress: Mutex<Option<InProgress>>,
}

#[derive(Debug, Clone)]
pub struct RecoveredCheckpoint {
    pub token: CheckpointToken,
    pub covered_aof_address: i64,
    pub replication_id: String,
}

impl CheckpointManager {
    pub fn open(dir: impl Into<PathBuf>, data_ext: &'static str, policy: RetentionPolicy) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let manager = Self {
            dir,
            data_ext,
            policy,
            completed: RwLock::new(Vec::new()),
            in_progress: Mutex::new(None),
        };
        manager.scan_existing()?;
        Ok(manager)
    }

    fn part_path(&self, token: Uuid, ext: &str) -> PathBuf {
        self.dir.join(format!("{token}.{ext}"))
    }

    /// Register checkpoints left by a previous run, ordered by tail so the
    /// registry's last entry is the latest.
    fn scan_existing(&self) -> Result<()> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            match self.load_metadata_file(&path) {
                Ok((cookie, metadata)) => found.push(CheckpointEntry {
                    token: CheckpointToken(metadata.token),
                    kind: metadata.kind,
                    covered_aof_address: cookie.covered_aof_address,
                    tail: metadata.tail,
                    parent: metadata.parent,
                }),
                Err(err) => warn!(path = %path.display(), %err, "skipping unreadable checkpoint"),
            }
        }
        found.sort_by_key(|entry| entry.tail);
        *self.completed.write() = found;
        Ok(())
    }

    fn load_metadata_file(&self, path: &PathBuf) -> Result<(CheckpointCookie, CheckpointMetadata)> {
        let bytes = fs::read(path)?;
        let (cookie, payload) = extract_cookie(&bytes)?;
        let (metadata, _): (CheckpointMetadata, _) =
            bincode::serde::decode_from_slice(payload, bincode::config::standard())
                .map_err(|e| FerriteError::Serialization(e.to_string()))?;
        Ok((cookie, metadata))
    }

    pub fn checkpoints(&self) -> Vec<CheckpointEntry> {
        self.completed.read().clone()
    }

    pub fn latest(&self) -> Option<CheckpointEntry> {
        self.completed.read().last().cloned()
    }

    /// Start a checkpoint. Bumps the store version so concurrent mutations
    /// of captured records copy-update instead of touching the captured
    /// range. Fails while a prior checkpoint is incomplete (the version
    /// barrier).
    pub fn begin_checkpoint(&self, store: &KvStore, kind: CheckpointKind) -> Result<CheckpointToken> {
        let mut in_progress = self.in_progress.lock();
        if in_progress.is_some() {
            return Err(FerriteError::UnexpectedCheckpointEntry(
                "previous checkpoint version has not completed".into(),
            ));
        }

        let token = Uuid::new_v4();
        let store_version = store.bump_version();
        let begin = store.allocator().begin_address();
        let capture_tail = store.allocator().tail();

        let (delta_from, parent) = match kind {
            CheckpointKind::Incremental => match self.latest() {
                Some(prev) if prev.tail >= begin => (Some(prev.tail), Some(prev.token.0)),
                // No usable parent: fall back to a full image.
                _ => (None, None),
            },
            _ => (None, None),
        };

        *in_progress = Some(InProgress {
            token,
            kind: if delta_from.is_none() && kind == CheckpointKind::Incremental {
                CheckpointKind::Full
            } else {
                kind
            },
            store_version,
            begin,
            capture_tail,
            delta_from,
            parent,
        });
        info!(%token, ?kind, version = store_version, "checkpoint begun");
        Ok(CheckpointToken(token))
    }

    /// Await durability of the captured range, write the parts, publish
    /// the token, and apply retention.
    pub fn complete_checkpoint(
        &self,
        store: &KvStore,
        token: CheckpointToken,
        covered_aof_address: i64,
        replication_id: &str,
    ) -> Result<CheckpointEntry> {
        let in_progress = {
            let mut slot = self.in_progress.lock();
            match slot.take() {
                Some(ip) if ip.token == token.0 => ip,
                Some(ip) => {
                    let held = ip.token;
                    *slot = Some(ip);
                    return Err(FerriteError::UnexpectedCheckpointEntry(format!(
                        "token {token} does not match in-progress checkpoint {held}"
                    )));
                }
                None => {
                    return Err(FerriteError::UnexpectedCheckpointEntry(
                        "no checkpoint in progress".into(),
                    ))
                }
            }
        };

        store.allocator().flush_to(in_progress.capture_tail)?;

        // Index part.
        let snapshot = store.index().snapshot();
        let mut index_bytes = Vec::with_capacity(snapshot.len() * 8);
        for bucket in &snapshot {
            index_bytes.extend_from_slice(&bucket.to_le_bytes());
        }
        fs::write(self.part_path(token.0, "idx"), index_bytes)?;

        // Data part: full image or delta log.
        let (data_from, ext) = match in_progress.delta_from {
            Some(from) => (from, "dlog"),
            None => (in_progress.begin, self.data_ext),
        };
        let image = store
            .allocator()
            .read_range(data_from, in_progress.capture_tail)?;
        fs::write(self.part_path(token.0, ext), image)?;

        // Cookie-wrapped metadata part.
        let metadata = CheckpointMetadata {
            token: token.0,
            kind: in_progress.kind,
            store_version: in_progress.store_version,
            begin: in_progress.begin,
            tail: in_progress.capture_tail,
            delta_from: in_progress.delta_from,
            parent: in_progress.parent,
            index_buckets: snapshot.len(),
        };
        let payload = bincode::serde::encode_to_vec(&metadata, bincode::config::standard())
            .map_err(|e| FerriteError::Serialization(e.to_string()))?;
        let cookie = CheckpointCookie {
            covered_aof_address,
            replication_id: replication_id.to_string(),
        };
        fs::write(self.part_path(token.0, "md"), append_cookie(&cookie, &payload))?;

        let entry = CheckpointEntry {
            token,
            kind: in_progress.kind,
            covered_aof_address,
            tail: in_progress.capture_tail,
            parent: in_progress.parent,
        };
        self.completed.write().push(entry.clone());
        info!(%token, covered_aof_address, "checkpoint published");

        self.apply_retention()?;
        Ok(entry)
    }

    /// Drop checkpoints beyond the retention window, never removing one
    /// that a retained incremental still chains through.
    fn apply_retention(&self) -> Result<()> {
        if self.policy.keep_all {
            return Ok(());
        }
        let victims: Vec<CheckpointEntry> = {
            let mut completed = self.completed.write();
            if completed.len() <= self.policy.keep_latest {
                return Ok(());
            }
            let keep_from = completed.len() - self.policy.keep_latest;
            let kept: Vec<CheckpointEntry> = completed[keep_from..].to_vec();
            let needed: Vec<Uuid> = kept.iter().filter_map(|e| e.parent).collect();
            let (dead, live): (Vec<_>, Vec<_>) = completed
                .drain(..keep_from)
                .partition(|e| !needed.contains(&e.token.0));
            let mut rebuilt = live;
            rebuilt.extend(kept);
            *completed = rebuilt;
            dead
        };
        for victim in victims {
            for ext in ["md", "idx", self.data_ext, "dlog"] {
                let path = self.part_path(victim.token.0, ext);
                if path.exists() {
                    fs::remove_file(path)?;
                }
            }
            debug!(token = %victim.token, "checkpoint reclaimed");
        }
        Ok(())
    }

    /// Restore the store from a checkpoint (`None` means latest): rebuild
    /// the log image from the parent chain, reinstall the index, and hand
    /// back the cookie so the caller can replay the AOF from
    /// `covered_aof_address`.
    pub fn recover(&self, store: &KvStore, token: Option<CheckpointToken>) -> Result<RecoveredCheckpoint> {
        let target = match token {
            Some(token) => token,
            None => self
                .latest()
                .map(|entry| entry.token)
                .ok_or_else(|| FerriteError::CheckpointNotFound("no completed checkpoint".into()))?,
        };

        // Load the chain root-first.
        let mut chain = Vec::new();
        let mut cursor = Some(target.0);
        while let Some(id) = cursor {
            let path = self.part_path(id, "md");
            if !path.exists() {
                return Err(FerriteError::CheckpointNotFound(id.to_string()));
            }
            let (cookie, metadata) = self.load_metadata_file(&path)?;
            cursor = metadata.parent;
            chain.push((cookie, metadata));
        }
        chain.reverse();

        let (final_cookie, final_metadata) = {
            let last = chain.last().unwrap();
            (last.0.clone(), last.1.clone())
        };
        let root = &chain[0].1;
        let begin = root.begin;

        // Stitch the full image: root snapshot plus each delta in order.
        let mut image = Vec::with_capacity((final_metadata.tail - begin) as usize);
        for (position, (_, metadata)) in chain.iter().enumerate() {
            let (ext, from) = if position == 0 {
                (self.data_ext, metadata.begin)
            } else {
                ("dlog", metadata.delta_from.ok_or_else(|| {
                    FerriteError::UnexpectedCheckpointEntry(
                        "incremental checkpoint missing delta origin".into(),
                    )
                })?)
            };
            let expected_offset = (from - begin) as usize;
            if image.len() != expected_offset {
                return Err(FerriteError::UnexpectedCheckpointEntry(format!(
                    "checkpoint chain gap at {from}"
                )));
            }
            image.extend_from_slice(&fs::read(self.part_path(metadata.token, ext))?);
        }

        store.allocator().restore(begin, final_metadata.tail, &image)?;
        store.set_version(final_metadata.store_version);

        // Reinstall the index snapshot; a size mismatch (reconfigured
        // index) falls back to a log scan.
        let index_bytes = fs::read(self.part_path(final_metadata.token, "idx"))?;
        let buckets: Vec<u64> = index_bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        if !store.index().restore(&buckets) {
            warn!("index geometry changed since checkpoint; rebuilding from log");
            store.rebuild_index_from_log()?;
        }

        info!(token = %target, covered = final_cookie.covered_aof_address, "checkpoint recovered");
        Ok(RecoveredCheckpoint {
            token: target,
            covered_aof_address: final_cookie.covered_aof_address,
            replication_id: final_cookie.replication_id,
        })
    }
}

// # Replication
//
// Primary side: a task store streaming the AOF tail to each attached
// replica from a per-replica cursor. Replica side: an applier that
// replays the stream into the local stores. The shared lineage state
// lives in the persisted replication history.

pub mod history;
pub mod replica;
pub mod task_store;

pub use history::{HistoryCell, ReplicationHistory};
pub use replica::{
    apply_entry, backoff_delays, spawn_applier, ChannelTransport, ReplicaApplier,
};
pub use task_store::{
    AnyEndpoint, AofTaskStore, EndpointResolver, ReplicaInfo, ReplicaSyncTask, ReplicaTransport,
    TaskStoreConfig,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::aof::AofLog;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationRole {
    Primary,
    Replica,
}

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Allow AOF truncation (and sync connects) to run best-effort past a
    /// lagging replica, marking it for full resync.
    pub main_memory_replication: bool,
    pub task_store: TaskStoreConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            main_memory_replication: false,
            task_store: TaskStoreConfig::default(),
        }
    }
}

/// Node-level replication state: role, lineage history, primary-side task
/// store, and the replica apply offset.
pub struct ReplicationManager {
    config: ReplicationConfig,
    role: RwLock<ReplicationRole>,
    history: Arc<HistoryCell>,
    tasks: AofTaskStore,
    /// Replica path: address up to which the stream has been applied.
    replica_offset: Arc<AtomicU64>,
}

impl ReplicationManager {
    pub fn new(history: Arc<HistoryCell>, config: ReplicationConfig) -> Self {
        Self {
            tasks: AofTaskStore::new(config.task_store.clone()),
            config,
            role: RwLock::new(ReplicationRole::Primary),
            history,
            replica_offset: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn role(&self) -> ReplicationRole {
        *self.role.read()
    }

    pub fn set_role(&self, role: ReplicationRole) {
        *self.role.write() = role;
    }

    pub fn history(&self) -> &Arc<HistoryCell> {
        &self.history
    }

    pub fn task_store(&self) -> &AofTaskStore {
        &self.tasks
    }

    pub fn replica_offset_cell(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.replica_offset)
    }

    pub fn replica_offset(&self) -> u64 {
        self.replica_offset.load(Ordering::Acquire)
    }

    /// Register and start streaming to a replica in one step.
    pub fn attach_replica(
        &self,
        aof: Arc<AofLog>,
        resolver: &dyn EndpointResolver,
        node_id: &str,
        start_la: u64,
        transport: Arc<dyn ReplicaTransport>,
    ) -> Result<()> {
        self.tasks.try_add(node_id, start_la)?;
        self.tasks.try_connect(
            aof,
            resolver,
            node_id,
            start_la,
            transport,
            self.config.main_memory_replication,
        )
    }

    pub fn count_connected_replicas(&self) -> usize {
        self.tasks.count_connected_replicas()
    }

    pub fn get_replica_info(&self, current_offset: u64) -> Vec<ReplicaInfo> {
        self.tasks.get_replica_info(current_offset)
    }

    /// AOF truncation clamped to the slowest replica's acknowledgement.
    /// Under main-memory replication, truncation deliberately proceeds
    /// past a lagging replica, which is marked for full resync.
    pub fn safe_truncate(&self, aof: &AofLog, covered_la: u64) -> Result<u64> {
        let replica_floor = self.tasks.truncated_until().unwrap_or(covered_la);
        let limit = if replica_floor < covered_la {
            if self.config.main_memory_replication {
                for task in self.tasks.tasks() {
                    if task.acked() < covered_la {
                        warn!(
                            node_id = %task.node_id,
                            acked = task.acked(),
                            covered_la,
                            "truncating past lagging replica; marking for full resync"
                        );
                        task.mark_for_full_resync();
                    }
                }
                covered_la
            } else {
                replica_floor
            }
        } else {
            covered_la
        };
        aof.truncate_until(limit)?;
        Ok(limit)
    }

    pub async fn dispose(&self) {
        self.tasks.dispose().await;
    }
}

// # AOF Task Store (primary path)
//
// One sync task per attached replica. A task loops reading the AOF from
// its cursor, sending a framed batch, waiting for the acknowledgement,
// and advancing. Backpressure comes from the transport's bounded send
// queue; disposal cancels every task, which drains its current frame and
// exits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aof::{AofEntry, AofLog};
use crate::common::NodeId;
use crate::error::{FerriteError, Result};

/// Resolves a node id to an endpoint address. The cluster topology is the
/// real implementation; standalone replication accepts any peer.
pub trait EndpointResolver: Send + Sync {
    fn resolve(&self, node_id: &str) -> Option<String>;
}

/// Resolver for non-clustered deployments.
pub struct AnyEndpoint;

impl EndpointResolver for AnyEndpoint {
    fn resolve(&self, _node_id: &str) -> Option<String> {
        Some(String::new())
    }
}

/// Framed-batch channel to one replica. `send_batch` applies the
/// transport's own backpressure (a bounded queue sized by
/// `network_send_throttle_max`) and resolves with the replica's
/// acknowledged resume address.
#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    async fn send_batch(&self, entries: Vec<AofEntry>) -> Result<u64>;
}

pub struct ReplicaSyncTask {
    pub node_id: NodeId,
    cursor: AtomicU64,
    acked: AtomicU64,
    connected: AtomicBool,
    needs_full_resync: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicaSyncTask {
    fn new(node_id: NodeId, start_la: u64) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            node_id,
            cursor: AtomicU64::new(start_la),
            acked: AtomicU64::new(start_la),
            connected: AtomicBool::new(false),
            needs_full_resync: AtomicBool::new(false),
            cancel_tx,
            handle: Mutex::new(None),
        })
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn needs_full_resync(&self) -> bool {
        self.needs_full_resync.load(Ordering::Acquire)
    }

    pub fn mark_for_full_resync(&self) {
        self.needs_full_resync.store(true, Ordering::Release);
    }

    fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

/// Snapshot row for INFO replication.
#[derive(Debug, Clone)]
pub struct ReplicaInfo {
    pub node_id: NodeId,
    pub acked_address: u64,
    pub cursor_address: u64,
    pub lag: u64,
    pub connected: bool,
}

#[derive(Debug, Clone)]
pub struct TaskStoreConfig {
    /// Max outstanding frames before a task suspends on its send queue.
    pub network_send_throttle_max: usize,
    /// Records per framed batch.
    pub batch_entries: usize,
}

impl Default for TaskStoreConfig {
    fn default() -> Self {
        Self {
            network_send_throttle_max: 8,
            batch_entries: 256,
        }
    }
}

pub struct AofTaskStore {
    config: TaskStoreConfig,
    tasks: RwLock<HashMap<NodeId, Arc<ReplicaSyncTask>>>,
    disposed: AtomicBool,
}

impl AofTaskStore {
    pub fn new(config: TaskStoreConfig) -> Self {
        Self {
            config,
            tasks: RwLock::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &TaskStoreConfig {
        &self.config
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(FerriteError::ReplicationManagerDisposed)
        } else {
            Ok(())
        }
    }

    /// Register a sync task for `node_id`, idempotent per node: a second
    /// add while a task exists is rejected.
    pub fn try_add(&self, node_id: &str, start_la: u64) -> Result<Arc<ReplicaSyncTask>> {
        self.check_disposed()?;
        let mut tasks = self.tasks.write();
        if tasks.contains_key(node_id) {
            return Err(FerriteError::Replication(format!(
                "sync task for {node_id} already exists"
            )));
        }
        let task = ReplicaSyncTask::new(node_id.to_string(), start_la);
        tasks.insert(node_id.to_string(), Arc::clone(&task));
        debug!(node_id, start_la, "replica sync task added");
        Ok(task)
    }

    pub fn remove(&self, node_id: &str) -> Option<Arc<ReplicaSyncTask>> {
        let task = self.tasks.write().remove(node_id);
        if let Some(task) = &task {
            task.cancel();
            debug!(node_id, "replica sync task removed");
        }
        task
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<ReplicaSyncTask>> {
        self.tasks.read().get(node_id).cloned()
    }

    /// Validate and start streaming to a replica. On any failure the task
    /// is removed and an ASCII error message is returned.
    pub fn try_connect(
        &self,
        aof: Arc<AofLog>,
        resolver: &dyn EndpointResolver,
        node_id: &str,
        start_la: u64,
        transport: Arc<dyn ReplicaTransport>,
        main_memory_replication: bool,
    ) -> Result<()> {
        let outcome = (|| {
            self.check_disposed()?;
            let task = self
                .get(node_id)
                .ok_or_else(|| FerriteError::UnknownNode(node_id.to_string()))?;
            if resolver.resolve(node_id).is_none() {
                return Err(FerriteError::UnknownNode(node_id.to_string()));
            }
            let tail = aof.tail();
            if start_la > tail {
                if main_memory_replication {
                    // Deterministic best-effort: the replica is told to
                    // full-resync from a checkpoint, then tail from here.
                    warn!(node_id, start_la, tail, "replica ahead of tail; forcing full resync");
                    task.mark_for_full_resync();
                    task.cursor.store(tail, Ordering::Release);
                    task.acked.store(tail, Ordering::Release);
                } else {
                    return Err(FerriteError::AofAddressUnavailable {
                        requested: start_la,
                        tail,
                    });
                }
            }
            if start_la < aof.begin_address() {
                return Err(FerriteError::AofAddressUnavailable {
                    requested: start_la,
                    tail,
                });
            }
            Ok(task)
        })();

        let task = match outcome {
            Ok(task) => task,
            Err(err) => {
                self.tasks.write().remove(node_id);
                return Err(err);
            }
        };

        task.connected.store(true, Ordering::Release);
        let batch = self.config.batch_entries;
        let mut cancel_rx = task.cancel_tx.subscribe();
        let loop_task = Arc::clone(&task);
        let handle = tokio::spawn(async move {
            let mut commits = aof.subscribe_commits();
            loop {
                if *cancel_rx.borrow() {
                    break;
                }
                let cursor = loop_task.cursor();
                let read = aof.read_entries(cursor, batch);
                match read {
                    Err(err) => {
                        warn!(node_id = %loop_task.node_id, %err, "AOF read failed; stopping sync task");
                        break;
                    }
                    Ok((entries, next)) if entries.is_empty() => {
                        // Nothing new: wake on the next commit, a cancel,
                        // or a short poll for uncommitted tail growth.
                        tokio::select! {
                            _ = commits.changed() => {}
                            _ = cancel_rx.changed() => {}
                            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
                        }
                        let _ = next;
                    }
                    Ok((entries, next)) => {
                        match transport.send_batch(entries).await {
                            Ok(acked) => {
                                loop_task.acked.store(acked, Ordering::Release);
                                loop_task.cursor.store(next, Ordering::Release);
                            }
                            Err(err) => {
                                warn!(node_id = %loop_task.node_id, %err, "replica send failed; stopping sync task");
                                break;
                            }
                        }
                    }
                }
            }
            loop_task.connected.store(false, Ordering::Release);
            debug!(node_id = %loop_task.node_id, "replica sync task exited");
        });
        *task.handle.lock() = Some(handle);
        info!(node_id, start_la, "replica attached");
        Ok(())
    }

    /// Minimum acknowledged address over all live tasks; the AOF consults
    /// this before truncating.
    pub fn truncated_until(&self) -> Option<u64> {
        self.tasks
            .read()
            .values()
            .map(|task| task.acked())
            .min()
    }

    pub fn count_connected_replicas(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|task| task.is_connected())
            .count()
    }

    pub fn get_replica_info(&self, current_offset: u64) -> Vec<ReplicaInfo> {
        self.tasks
            .read()
            .values()
            .map(|task| ReplicaInfo {
                node_id: task.node_id.clone(),
                acked_address: task.acked(),
                cursor_address: task.cursor(),
                lag: current_offset.saturating_sub(task.acked()),
                connected: task.is_connected(),
            })
            .collect()
    }

    pub fn tasks(&self) -> Vec<Arc<ReplicaSyncTask>> {
        self.tasks.read().values().cloned().collect()
    }

    /// Signal every task, wait for them to drain, and refuse further work.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        let tasks: Vec<Arc<ReplicaSyncTask>> = self.tasks.write().drain().map(|(_, t)| t).collect();
        for task in &tasks {
            task.cancel();
        }
        for task in tasks {
            let handle = task.handle.lock().take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }
        info!("AOF task store disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aof::{payload_key_value, AofConfig, AofHeader, AofOp};
    use crate::storage::device::SegmentedFileDevice;
    use parking_lot::Mutex as PlMutex;

    struct CollectingTransport {
        seen: PlMutex<Vec<AofEntry>>,
    }

    #[async_trait]
    impl ReplicaTransport for CollectingTransport {
        async fn send_batch(&self, entries: Vec<AofEntry>) -> Result<u64> {
            let last = entries.last().map(|e| e.address + 1).unwrap_or(0);
            self.seen.lock().extend(entries);
            Ok(last)
        }
    }

    fn open_aof(dir: &std::path::Path) -> Arc<AofLog> {
        let device = Arc::new(SegmentedFileDevice::open(dir, "aof", 1 << 20).unwrap());
        Arc::new(AofLog::open(AofConfig::default(), device).unwrap())
    }

    #[test]
    fn try_add_is_idempotent_per_node() {
        let store = AofTaskStore::new(TaskStoreConfig::default());
        store.try_add("node-a", 64).unwrap();
        assert!(store.try_add("node-a", 64).is_err());
        store.remove("node-a");
        store.try_add("node-a", 64).unwrap();
    }

    #[test]
    fn disposed_store_rejects_adds() {
        let store = AofTaskStore::new(TaskStoreConfig::default());
        store.disposed.store(true, Ordering::Release);
        assert!(matches!(
            store.try_add("node-a", 64),
            Err(FerriteError::ReplicationManagerDisposed)
        ));
    }

    #[tokio::test]
    async fn connect_streams_enqueued_records() {
        let dir = tempfile::tempdir().unwrap();
        let aof = open_aof(dir.path());
        let start = aof.tail();
        for i in 0..10 {
            aof.enqueue(
                AofHeader::new(AofOp::StoreUpsert, 1),
                &payload_key_value(format!("k{i}").as_bytes(), b"v"),
            )
            .unwrap();
        }
        aof.commit(true).unwrap();

        let store = AofTaskStore::new(TaskStoreConfig::default());
        let transport = Arc::new(CollectingTransport {
            seen: PlMutex::new(Vec::new()),
        });
        store.try_add("replica-1", start).unwrap();
        store
            .try_connect(
                Arc::clone(&aof),
                &AnyEndpoint,
                "replica-1",
                start,
                transport.clone(),
                false,
            )
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(transport.seen.lock().len(), 10);
        assert!(store.truncated_until().unwrap() > start);
        assert_eq!(store.count_connected_replicas(), 1);
        store.dispose().await;
    }

    #[tokio::test]
    async fn connect_past_tail_fails_without_main_memory_replication() {
        let dir = tempfile::tempdir().unwrap();
        let aof = open_aof(dir.path());
        let store = AofTaskStore::new(TaskStoreConfig::default());
        store.try_add("replica-1", aof.tail() + 4096).unwrap();
        let transport = Arc::new(CollectingTransport {
            seen: PlMutex::new(Vec::new()),
        });
        let err = store
            .try_connect(
                Arc::clone(&aof),
                &AnyEndpoint,
                "replica-1",
                aof.tail() + 4096,
                transport,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, FerriteError::AofAddressUnavailable { .. }));
        // The failed task was removed, so a fresh add succeeds.
        store.try_add("replica-1", 64).unwrap();
    }
}

// # Replica Path
//
// Applies streamed AOF records to the local stores, optionally re-logging
// them into the replica's own AOF, and advances the replication offset.
// The channel transport gives the primary's sync task a bounded send
// queue; reconnects use capped exponential backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::aof::{entry_extent, parse_key_value, AofEntry, AofLog, AofOp};
use crate::error::{FerriteError, Result};
use crate::storage::{KvStore, ObjectStore};

use super::task_store::ReplicaTransport;

/// Apply one streamed record to the stores. Transaction and checkpoint
/// markers are ordering metadata; the mutations they bracket are applied
/// individually.
pub fn apply_entry(main: &KvStore, objects: &ObjectStore, entry: &AofEntry) -> Result<()> {
    match entry.header.op {
        AofOp::StoreUpsert => {
            let (key, value) = parse_key_value(&entry.payload)?;
            main.upsert(key, value)
        }
        AofOp::StoreDelete => {
            let (key, _) = parse_key_value(&entry.payload)?;
            main.delete_blocking(key).map(|_| ())
        }
        AofOp::ObjectRmw => {
            let (key, value) = parse_key_value(&entry.payload)?;
            if value.is_empty() {
                objects.store().delete_blocking(key).map(|_| ())
            } else {
                objects.store().upsert(key, value)
            }
        }
        AofOp::TxnStart
        | AofOp::TxnCommit
        | AofOp::StoredProcedure
        | AofOp::CheckpointMarker
        | AofOp::FastCommit => Ok(()),
    }
}

/// Replica-side consumer of the primary's stream.
pub struct ReplicaApplier {
    main: Arc<KvStore>,
    objects: Arc<ObjectStore>,
    /// The replica's own AOF; streamed records re-log here before they
    /// apply, preserving the primary's total order on disk.
    aof: Option<Arc<AofLog>>,
    offset: Arc<AtomicU64>,
}

impl ReplicaApplier {
    pub fn new(
        main: Arc<KvStore>,
        objects: Arc<ObjectStore>,
        aof: Option<Arc<AofLog>>,
        offset: Arc<AtomicU64>,
    ) -> Self {
        Self {
            main,
            objects,
            aof,
            offset,
        }
    }

    /// Apply one record and return the advanced offset.
    pub fn apply(&self, entry: &AofEntry) -> Result<u64> {
        if let Some(aof) = &self.aof {
            aof.enqueue(entry.header, &entry.payload)?;
        }
        apply_entry(&self.main, &self.objects, entry)?;
        let next = entry.address + entry_extent(entry.payload.len()) as u64;
        self.offset.fetch_max(next, Ordering::AcqRel);
        Ok(next)
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }
}

type Batch = (Vec<AofEntry>, oneshot::Sender<Result<u64>>);

/// Bounded-queue transport between a primary sync task and a replica
/// applier. The queue capacity is the primary's
/// `network_send_throttle_max`: once full, the sender suspends.
pub struct ChannelTransport {
    tx: mpsc::Sender<Batch>,
}

#[async_trait]
impl ReplicaTransport for ChannelTransport {
    async fn send_batch(&self, entries: Vec<AofEntry>) -> Result<u64> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send((entries, ack_tx))
            .await
            .map_err(|_| FerriteError::ReplicationManagerDisposed)?;
        ack_rx
            .await
            .map_err(|_| FerriteError::CancellationRequested)?
    }
}

/// Start the applier loop and hand back its transport endpoint.
pub fn spawn_applier(
    applier: ReplicaApplier,
    queue_capacity: usize,
) -> (ChannelTransport, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Batch>(queue_capacity.max(1));
    let handle = tokio::spawn(async move {
        while let Some((entries, ack)) = rx.recv().await {
            let mut outcome: Result<u64> = Ok(applier.offset());
            for entry in &entries {
                match applier.apply(entry) {
                    Ok(next) => outcome = Ok(next),
                    Err(err) => {
                        warn!(%err, "replica apply failed");
                        outcome = Err(err);
                        break;
                    }
                }
            }
            if ack.send(outcome).is_err() {
                break;
            }
        }
        debug!("replica applier exited");
    });
    (ChannelTransport { tx }, handle)
}

/// Capped exponential backoff schedule for replica reconnect attempts.
pub fn backoff_delays(base: Duration, cap: Duration) -> impl Iterator<Item = Duration> {
    let mut current = base;
    std::iter::from_fn(move || {
        let delay = current;
        current = (current * 2).min(cap);
        Some(delay)
    })
}

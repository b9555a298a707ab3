// # Ferrite Node
//
// Top-level ownership of both stores, the AOF, checkpointing, the
// cluster control plane, and the transaction manager. All shared state
// hangs off this struct; there are no process-wide statics beyond the
// tracing subscriber. `execute` is the keyed-command entry the RESP
// session layer drives.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::aof::{
    payload_key, payload_key_value, AofConfig, AofHeader, AofLog, AofOp,
};
use crate::buffer::{BufferPool, SECTOR_SIZE};
use crate::checkpoint::{CheckpointKind, CheckpointManager, RetentionPolicy};
use crate::cluster::{
    self, ClusterTopology, FailoverConfig, FailoverOption, FailoverSession, KeyTracker,
    LocalMigrationTarget, MigrateOptions, MigrationEngine, MigrationSource, NodeInfo, NodeRole,
    SetSlotCommand, SilentNotifier, SlotVerdict,
};
use crate::common::{key_hash_slot, random_hex_id, NodeId, StoreKind};
use crate::config::ServerOptions;
use crate::error::{FerriteError, Result};
use crate::protocol::Reply;
use crate::replication::{
    self, ReplicationConfig, ReplicationManager, ReplicationRole, TaskStoreConfig,
};
use crate::storage::{
    KvStore, MutationObserver, ObjectStore, PendingOutcome, ReadOutcome, SegmentedFileDevice,
    StoreConfig, FIRST_VALID_ADDRESS,
};
use crate::txn::{
    self, command_info, extract_keys, run_procedure, Session, StoredProcedure, TxnConfig,
    TxnManager, VersionMap,
};

pub struct FerriteNode {
    options: ServerOptions,
    node_id: NodeId,
    pool: Arc<BufferPool>,
    main: Arc<KvStore>,
    objects: Arc<ObjectStore>,
    aof: Option<Arc<AofLog>>,
    main_checkpoints: CheckpointManager,
    object_checkpoints: CheckpointManager,
    replication: Arc<ReplicationManager>,
    topology: Option<Arc<ClusterTopology>>,
    tracker: Arc<KeyTracker>,
    migration: MigrationEngine,
    txn: TxnManager,
    procedures: DashMap<String, Arc<dyn StoredProcedure>>,
    /// In-process stand-in for outbound cluster client connections,
    /// keyed by `host:port`.
    peer_links: DashMap<String, Arc<FerriteNode>>,
    next_session: AtomicU64,
}

impl FerriteNode {
    /// Build the node and, when `recover` is set, restore the latest
    /// checkpoint and replay the AOF tail past its covered address.
    pub fn open(options: ServerOptions, recover: bool) -> Result<Arc<Self>> {
        options.validate()?;
        fs::create_dir_all(&options.log_dir)?;
        fs::create_dir_all(&options.checkpoint_dir)?;

        let pool = BufferPool::new(SECTOR_SIZE, 64);
        let main_device = Arc::new(SegmentedFileDevice::open(
            &options.log_dir,
            "hlog",
            options.segment_size,
        )?);
        let object_device = Arc::new(SegmentedFileDevice::open(
            &options.log_dir,
            "olog",
            options.segment_size,
        )?);

        let main = Arc::new(KvStore::new(
            StoreConfig {
                kind: StoreKind::Main,
                index_size: options.index_size,
                page_bits: options.page_bits(),
                memory_pages: options.memory_pages(),
            },
            main_device,
            Arc::clone(&pool),
        ));
        let objects = Arc::new(ObjectStore::new(
            StoreConfig {
                kind: StoreKind::Object,
                index_size: options.index_size,
                page_bits: options.page_bits(),
                memory_pages: options.memory_pages(),
            },
            object_device,
            Arc::clone(&pool),
        ));

        let aof = if options.enable_aof {
            let device = Arc::new(SegmentedFileDevice::open(
                &options.log_dir,
                "aof",
                options.segment_size,
            )?);
            Some(Arc::new(AofLog::open(
                AofConfig {
                    page_bits: options.aof_page_bits(),
                    memory_pages: options.aof_memory_pages(),
                    fast_commit: options.fast_commit,
                },
                device,
            )?))
        } else {
            None
        };

        let retention = RetentionPolicy {
            keep_latest: 2,
            keep_all: options.cluster,
        };
        let main_checkpoints = CheckpointManager::open(options.store_dir(), "snap", retention)?;
        let object_checkpoints =
            CheckpointManager::open(options.object_store_dir(), "obj", retention)?;

        // Corrupt replication history is a fatal init error.
        let history = Arc::new(replication::HistoryCell::open(options.cluster_dir())?);
        let replication_manager = Arc::new(ReplicationManager::new(
            Arc::clone(&history),
            ReplicationConfig {
                main_memory_replication: options.main_memory_replication,
                task_store: TaskStoreConfig::default(),
            },
        ));

        let node_id = random_hex_id();
        let topology = if options.cluster {
            Some(Arc::new(ClusterTopology::new(NodeInfo {
                node_id: node_id.clone(),
                address: options.bind.clone(),
                port: options.port,
                role: NodeRole::Primary,
                primary_of: None,
                config_epoch: 0,
            })))
        } else {
            None
        };

        let txn = TxnManager::new(TxnConfig {
            lock_timeout: options.cluster_timeout.min(std::time::Duration::from_secs(5)),
            ..TxnConfig::default()
        });

        let tracker = Arc::new(KeyTracker::default());
        let versions_observer: Arc<dyn MutationObserver> = Arc::<VersionMap>::clone(txn.versions());
        main.register_observer(Arc::clone(&versions_observer));
        objects.store().register_observer(versions_observer);
        if options.cluster {
            let tracker_observer: Arc<dyn MutationObserver> = Arc::<KeyTracker>::clone(&tracker);
            main.register_observer(Arc::clone(&tracker_observer));
            objects.store().register_observer(tracker_observer);
        }

        let node = Arc::new(Self {
            options,
            node_id,
            pool,
            main,
            objects,
            aof,
            main_checkpoints,
            object_checkpoints,
            replication: replication_manager,
            topology,
            tracker,
            migration: MigrationEngine::new(),
            txn,
            procedures: DashMap::new(),
            peer_links: DashMap::new(),
            next_session: AtomicU64::new(1),
        });

        if recover {
            node.recover_state()?;
        }
        info!(node_id = %node.node_id, "node opened");
        Ok(node)
    }

    /// Checkpoint restore plus AOF replay from the covered address. With
    /// the object store's checkpoint absent, its AOF bound contributes
    /// infinity (replay is governed by the main store alone).
    fn recover_state(&self) -> Result<()> {
        let main_covered = match self.main_checkpoints.recover(&self.main, None) {
            Ok(recovered) => recovered.covered_aof_address,
            Err(FerriteError::CheckpointNotFound(_)) => i64::MIN,
            Err(err) => return Err(err),
        };
        let object_covered = match self
            .object_checkpoints
            .recover(self.objects.store(), None)
        {
            Ok(recovered) => recovered.covered_aof_address,
            Err(FerriteError::CheckpointNotFound(_)) => i64::MAX,
            Err(err) => return Err(err),
        };

        let Some(aof) = &self.aof else {
            return Ok(());
        };
        let covered = main_covered.min(object_covered).max(FIRST_VALID_ADDRESS as i64) as u64;
        let replay_from = covered.max(aof.begin_address());
        let mut applied = 0usize;
        for entry in aof.iterate(replay_from, aof.tail()) {
            let entry = entry?;
            replication::apply_entry(&self.main, &self.objects, &entry)?;
            applied += 1;
        }
        info!(replay_from, applied, "AOF replay complete");
        Ok(())
    }

    // -- accessors -----------------------------------------------------------

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn main_store(&self) -> &Arc<KvStore> {
        &self.main
    }

    pub fn object_store(&self) -> &Arc<ObjectStore> {
        &self.objects
    }

    pub fn aof(&self) -> Option<&Arc<AofLog>> {
        self.aof.as_ref()
    }

    pub fn replication(&self) -> &Arc<ReplicationManager> {
        &self.replication
    }

    pub fn topology(&self) -> Option<&Arc<ClusterTopology>> {
        self.topology.as_ref()
    }

    pub fn tracker(&self) -> &Arc<KeyTracker> {
        &self.tracker
    }

    pub fn migration(&self) -> &MigrationEngine {
        &self.migration
    }

    pub fn txn_manager(&self) -> &TxnManager {
        &self.txn
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn new_session(&self) -> Session {
        Session::new(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register_procedure(&self, procedure: Arc<dyn StoredProcedure>) {
        self.procedures
            .insert(procedure.name().to_string(), procedure);
    }

    /// Wire an in-process peer for MIGRATE and cluster commands.
    pub fn link_peer(&self, peer: &Arc<FerriteNode>) {
        if let (Some(topology), Some(peer_topology)) = (&self.topology, &peer.topology) {
            topology.meet(peer_topology.local_node());
        }
        self.peer_links
            .insert(format!("{}:{}", peer.options.bind, peer.options.port), Arc::clone(peer));
    }

    // -- command dispatch ----------------------------------------------------

    pub fn execute(&self, session: &mut Session, argv: &[Vec<u8>]) -> Reply {
        if argv.is_empty() {
            return Reply::Error("ERR empty command".to_string());
        }
        let name = String::from_utf8_lossy(&argv[0]).to_uppercase();
        let asking = session.asking;
        session.asking = false;

        match name.as_str() {
            "PING" => Reply::Simple("PONG".to_string()),
            "ASKING" => {
                session.asking = true;
                Reply::ok()
            }
            "MULTI" => self.reply_of(self.txn.begin(session)),
            "DISCARD" => self.reply_of(self.txn.discard(session)),
            "UNWATCH" => {
                session.watches.unwatch();
                Reply::ok()
            }
            "WATCH" => {
                if session.in_transaction() {
                    return Reply::from_error(&FerriteError::WatchInMulti);
                }
                if argv.len() < 2 {
                    return Reply::from_error(&FerriteError::WrongArity("watch".into()));
                }
                for key in &argv[1..] {
                    session
                        .watches
                        .watch(key, StoreKind::Main, self.txn.versions());
                }
                Reply::ok()
            }
            "EXEC" => self.exec_transaction(session),
            "CLUSTER" => self.cluster_command(argv),
            "MIGRATE" => self.migrate_command(argv),
            "SAVE" => match self.save_checkpoint() {
                Ok(()) => Reply::ok(),
                Err(err) => Reply::from_error(&err),
            },
            "INFO" => Reply::Bulk(self.render_info().into_bytes()),
            _ => {
                if session.in_transaction() {
                    return match self.txn.queue(session, argv.to_vec()) {
                        Ok(()) => Reply::queued(),
                        Err(err) => Reply::from_error(&err),
                    };
                }
                let Some(command) = command_info(&name) else {
                    return Reply::from_error(&FerriteError::UnknownCommand(name.to_lowercase()));
                };
                if !txn::check_arity(command, argv.len()) {
                    return Reply::from_error(&FerriteError::WrongArity(name.to_lowercase()));
                }
                let keys = extract_keys(command, argv);
                if let Some(verdict_reply) = self.route_keys(&keys, asking, command.is_write) {
                    return verdict_reply;
                }
                self.execute_keyed(session, command.name, argv)
            }
        }
    }

    fn reply_of(&self, result: Result<()>) -> Reply {
        match result {
            Ok(()) => Reply::ok(),
            Err(err) => Reply::from_error(&err),
        }
    }

    /// Cluster routing check; `None` means execute locally.
    fn route_keys(&self, keys: &[Vec<u8>], asking: bool, is_write: bool) -> Option<Reply> {
        let topology = self.topology.as_ref()?;
        if keys.is_empty() {
            return None;
        }
        let key_refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let key_exists = |key: &[u8]| {
            self.main.read_blocking(key).ok().flatten().is_some()
                || self
                    .objects
                    .store()
                    .read_blocking(key)
                    .ok()
                    .flatten()
                    .is_some()
        };
        let key_in_flight = |key: &[u8]| self.migration.key_in_flight(key);
        let verdict = cluster::route(
            &key_refs,
            &cluster::RouteContext {
                topology,
                key_exists: &key_exists,
                key_in_flight: &key_in_flight,
                asking,
                is_write,
            },
        );
        verdict.to_error_message().map(Reply::Error)
    }

    /// Keyed execution after routing. Mutations enqueue their AOF record
    /// before touching the index and commit before the reply when the AOF
    /// runs in always-commit mode.
    fn execute_keyed(&self, session: &mut Session, name: &str, argv: &[Vec<u8>]) -> Reply {
        let result = (|| -> Result<Reply> {
            match name {
                "GET" => match self.main.read(&argv[1], &mut session.pending)? {
                    ReadOutcome::Found(value) => Ok(Reply::Bulk(value)),
                    ReadOutcome::NotFound => Ok(Reply::Nil),
                    ReadOutcome::Pending(_) => {
                        let mut completions =
                            self.main.complete_pending(&mut session.pending, true);
                        match completions.pop().map(|c| c.result).transpose()? {
                            Some(PendingOutcome::Read(Some(value))) => Ok(Reply::Bulk(value)),
                            _ => Ok(Reply::Nil),
                        }
                    }
                },
                "SET" => {
                    if argv.len() != 3 {
                        return Err(FerriteError::SyntaxError);
                    }
                    self.log_mutation(session.id, AofOp::StoreUpsert, &argv[1], &argv[2])?;
                    self.main.upsert(&argv[1], &argv[2])?;
                    self.commit_if_eager()?;
                    Ok(Reply::ok())
                }
                "DEL" => {
                    let mut deleted = 0i64;
                    for key in &argv[1..] {
                        self.log_mutation(session.id, AofOp::StoreDelete, key, &[])?;
                        if self.main.delete_blocking(key)? {
                            deleted += 1;
                        }
                        if self.objects.store().delete_blocking(key)? {
                            deleted += 1;
                        }
                    }
                    self.commit_if_eager()?;
                    Ok(Reply::Integer(deleted))
                }
                "EXISTS" => {
                    let mut found = 0i64;
                    for key in &argv[1..] {
                        if self.main.read_blocking(key)?.is_some() {
                            found += 1;
                        }
                    }
                    Ok(Reply::Integer(found))
                }
                "MSET" => {
                    if (argv.len() - 1) % 2 != 0 {
                        return Err(FerriteError::WrongArity("mset".into()));
                    }
                    for pair in argv[1..].chunks(2) {
                        self.log_mutation(session.id, AofOp::StoreUpsert, &pair[0], &pair[1])?;
                        self.main.upsert(&pair[0], &pair[1])?;
                    }
                    self.commit_if_eager()?;
                    Ok(Reply::ok())
                }
                other => Err(FerriteError::UnknownCommand(other.to_lowercase())),
            }
        })();
        match result {
            Ok(reply) => reply,
            Err(err) => Reply::from_error(&err),
        }
    }

    fn log_mutation(&self, session_id: u64, op: AofOp, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some(aof) = &self.aof {
            let payload = if value.is_empty() {
                payload_key(key)
            } else {
                payload_key_value(key, value)
            };
            aof.enqueue(AofHeader::new(op, session_id), &payload)?;
        }
        Ok(())
    }

    fn commit_if_eager(&self) -> Result<()> {
        if let Some(aof) = &self.aof {
            if self.options.commit_frequency_ms == 0 {
                aof.commit(true)?;
            }
        }
        Ok(())
    }

    // -- transactions --------------------------------------------------------

    fn exec_transaction(&self, session: &mut Session) -> Reply {
        let queued = match self.txn.take_queue(session) {
            Ok(queued) => queued,
            Err(err) => return Reply::from_error(&err),
        };

        // Collect keys across the queue.
        let mut all_keys: Vec<Vec<u8>> = Vec::new();
        for argv in &queued {
            let name = String::from_utf8_lossy(&argv[0]).to_uppercase();
            if let Some(command) = command_info(&name) {
                all_keys.extend(extract_keys(command, argv));
            }
        }

        // Cluster mode: every key revalidated against the slot map before
        // anything runs.
        if self.topology.is_some() && !all_keys.is_empty() {
            let slot = key_hash_slot(&all_keys[0]);
            if all_keys.iter().any(|key| key_hash_slot(key) != slot) {
                self.txn.finish(session);
                return Reply::Error(SlotVerdict::CrossSlot.to_error_message().unwrap());
            }
            if let Some(reply) = self.route_keys(&all_keys, false, true) {
                self.txn.finish(session);
                return reply;
            }
        }

        let session_id = session.id;
        let locked = self.txn.with_locked_keys(&all_keys, || -> Result<Option<Vec<Reply>>> {
            if !self.txn.validate_watches(session) {
                return Ok(None);
            }
            if let Some(aof) = &self.aof {
                aof.enqueue(AofHeader::new(AofOp::TxnStart, session_id), &[])?;
            }
            let mut replies = Vec::with_capacity(queued.len());
            for argv in &queued {
                let name = String::from_utf8_lossy(&argv[0]).to_uppercase();
                replies.push(self.execute_keyed(session, &name, argv));
            }
            if let Some(aof) = &self.aof {
                aof.enqueue(AofHeader::new(AofOp::TxnCommit, session_id), &[])?;
            }
            Ok(replies.into())
        });

        self.txn.finish(session);
        match locked {
            Err(err) => Reply::from_error(&err),
            Ok(Err(err)) => Reply::from_error(&err),
            Ok(Ok(None)) => Reply::NilArray,
            Ok(Ok(Some(replies))) => {
                if let Err(err) = self.commit_if_eager() {
                    return Reply::from_error(&err);
                }
                Reply::Array(replies)
            }
        }
    }

    /// Run a registered stored procedure by name.
    pub fn call_procedure(&self, name: &str, _args: &[Vec<u8>]) -> Result<Reply> {
        let procedure = self
            .procedures
            .get(name)
            .map(|p| Arc::clone(&p))
            .ok_or_else(|| FerriteError::UnknownCommand(name.to_lowercase()))?;

        let aof = self.aof.clone();
        let mut log = |op: AofOp, key: &[u8], value: &[u8]| -> Result<()> {
            if let Some(aof) = &aof {
                let payload = if value.is_empty() {
                    payload_key(key)
                } else {
                    payload_key_value(key, value)
                };
                aof.enqueue(AofHeader::new(op, 0), &payload)?;
            }
            Ok(())
        };
        let commit_aof = self.aof.clone();
        let mut commit = |proc_name: &str| -> Result<()> {
            if let Some(aof) = &commit_aof {
                aof.enqueue(
                    AofHeader::new(AofOp::StoredProcedure, 0),
                    proc_name.as_bytes(),
                )?;
                aof.commit(true)?;
            }
            Ok(())
        };
        run_procedure(
            procedure.as_ref(),
            &self.txn,
            &self.main,
            &self.objects,
            &mut log,
            &mut commit,
        )
    }

    // -- checkpointing -------------------------------------------------------

    /// SAVE: checkpoint both stores, stamp the AOF with a marker, and
    /// truncate the log up to the covered address (clamped by replicas).
    pub fn save_checkpoint(&self) -> Result<()> {
        let covered = self
            .aof
            .as_ref()
            .map(|aof| {
                aof.commit(true)?;
                Ok::<i64, FerriteError>(aof.committed_until() as i64)
            })
            .transpose()?
            .unwrap_or(FIRST_VALID_ADDRESS as i64);
        let replid = self.replication.history().load().primary_replid.clone();
        let kind = if self.options.enable_incremental_snapshots {
            CheckpointKind::Incremental
        } else {
            CheckpointKind::Full
        };

        let token = self.main_checkpoints.begin_checkpoint(&self.main, kind)?;
        // Version-shift marker so replicas checkpoint at the same AOF
        // boundary.
        if let Some(aof) = &self.aof {
            aof.enqueue(AofHeader::new(AofOp::CheckpointMarker, 0), &[])?;
            aof.commit(true)?;
        }
        self.main_checkpoints
            .complete_checkpoint(&self.main, token, covered, &replid)?;

        let token = self
            .object_checkpoints
            .begin_checkpoint(self.objects.store(), kind)?;
        self.object_checkpoints
            .complete_checkpoint(self.objects.store(), token, covered, &replid)?;

        if let Some(aof) = &self.aof {
            self.replication.safe_truncate(aof, covered as u64)?;
        }
        Ok(())
    }

    // -- cluster surface -----------------------------------------------------

    fn cluster_command(&self, argv: &[Vec<u8>]) -> Reply {
        let Some(topology) = &self.topology else {
            return Reply::Error("ERR This instance has cluster support disabled".to_string());
        };
        if argv.len() < 2 {
            return Reply::from_error(&FerriteError::WrongArity("cluster".into()));
        }
        let sub = String::from_utf8_lossy(&argv[1]).to_uppercase();
        let result = (|| -> Result<Reply> {
            match sub.as_str() {
                "NODES" => Ok(Reply::Bulk(topology.nodes_lines().into_bytes())),
                "MYID" => Ok(Reply::Bulk(topology.local_id().into_bytes())),
                "KEYSLOT" => {
                    let key = argv.get(2).ok_or(FerriteError::SyntaxError)?;
                    Ok(Reply::Integer(key_hash_slot(key) as i64))
                }
                "SLOTS" => {
                    let ranges = topology
                        .slot_ranges()
                        .into_iter()
                        .map(|(start, end, owner)| {
                            Reply::Array(vec![
                                Reply::Integer(start as i64),
                                Reply::Integer(end as i64),
                                Reply::Array(vec![
                                    Reply::Bulk(owner.address.clone().into_bytes()),
                                    Reply::Integer(owner.port as i64),
                                    Reply::Bulk(owner.node_id.clone().into_bytes()),
                                ]),
                            ])
                        })
                        .collect();
                    Ok(Reply::Array(ranges))
                }
                "SHARDS" => {
                    let shards = topology
                        .slot_ranges()
                        .into_iter()
                        .map(|(start, end, owner)| {
                            Reply::Map(vec![
                                (
                                    Reply::Bulk(b"slots".to_vec()),
                                    Reply::Array(vec![
                                        Reply::Integer(start as i64),
                                        Reply::Integer(end as i64),
                                    ]),
                                ),
                                (
                                    Reply::Bulk(b"nodes".to_vec()),
                                    Reply::Array(vec![Reply::Bulk(
                                        owner.node_id.clone().into_bytes(),
                                    )]),
                                ),
                            ])
                        })
                        .collect();
                    Ok(Reply::Array(shards))
                }
                "COUNTKEYSINSLOT" => {
                    let slot = cluster::parse_slot(&String::from_utf8_lossy(
                        argv.get(2).ok_or(FerriteError::SyntaxError)?,
                    ))?;
                    Ok(Reply::Integer(self.tracker.count_keys_in_slot(slot) as i64))
                }
                "GETKEYSINSLOT" => {
                    let slot = cluster::parse_slot(&String::from_utf8_lossy(
                        argv.get(2).ok_or(FerriteError::SyntaxError)?,
                    ))?;
                    let count: usize = String::from_utf8_lossy(
                        argv.get(3).ok_or(FerriteError::SyntaxError)?,
                    )
                    .parse()
                    .map_err(|_| FerriteError::ValueNotInteger)?;
                    Ok(Reply::Array(
                        self.tracker
                            .get_keys_in_slot(slot, count)
                            .into_iter()
                            .map(Reply::Bulk)
                            .collect(),
                    ))
                }
                "ADDSLOTS" | "DELSLOTS" => {
                    let mut slots = Vec::new();
                    for raw in &argv[2..] {
                        slots.push(cluster::parse_slot(&String::from_utf8_lossy(raw))?);
                    }
                    if sub == "ADDSLOTS" {
                        topology.add_slots(&slots)?;
                    } else {
                        topology.del_slots(&slots)?;
                    }
                    Ok(Reply::ok())
                }
                "SETSLOT" => {
                    let slot = cluster::parse_slot(&String::from_utf8_lossy(
                        argv.get(2).ok_or(FerriteError::SyntaxError)?,
                    ))?;
                    let state = String::from_utf8_lossy(
                        argv.get(3).ok_or(FerriteError::SyntaxError)?,
                    )
                    .to_uppercase();
                    let node_arg = argv
                        .get(4)
                        .map(|raw| String::from_utf8_lossy(raw).to_string());
                    let command = match state.as_str() {
                        "IMPORTING" => {
                            SetSlotCommand::Importing(node_arg.ok_or(FerriteError::SyntaxError)?)
                        }
                        "MIGRATING" => {
                            SetSlotCommand::Migrating(node_arg.ok_or(FerriteError::SyntaxError)?)
                        }
                        "STABLE" => SetSlotCommand::Stable,
                        "NODE" => SetSlotCommand::Node(node_arg.ok_or(FerriteError::SyntaxError)?),
                        _ => return Err(FerriteError::SyntaxError),
                    };
                    topology.set_slot(slot, command)?;
                    Ok(Reply::ok())
                }
                "FORGET" => {
                    let node_id =
                        String::from_utf8_lossy(argv.get(2).ok_or(FerriteError::SyntaxError)?);
                    topology.forget(&node_id)?;
                    Ok(Reply::ok())
                }
                "RESET" => {
                    let hard = argv
                        .get(2)
                        .map(|raw| String::from_utf8_lossy(raw).to_uppercase() == "HARD")
                        .unwrap_or(false);
                    topology.reset(hard);
                    Ok(Reply::ok())
                }
                "MEET" => {
                    // In-process bus: MEET carries the peer's node id as a
                    // third argument instead of a handshake.
                    let ip = String::from_utf8_lossy(argv.get(2).ok_or(FerriteError::SyntaxError)?)
                        .to_string();
                    let port: u16 = String::from_utf8_lossy(
                        argv.get(3).ok_or(FerriteError::SyntaxError)?,
                    )
                    .parse()
                    .map_err(|_| FerriteError::ValueNotInteger)?;
                    let node_id = argv
                        .get(4)
                        .map(|raw| String::from_utf8_lossy(raw).to_string())
                        .ok_or(FerriteError::SyntaxError)?;
                    topology.meet(NodeInfo {
                        node_id,
                        address: ip,
                        port,
                        role: NodeRole::Primary,
                        primary_of: None,
                        config_epoch: 0,
                    });
                    Ok(Reply::ok())
                }
                "FAILOVER" => {
                    let option = match argv
                        .get(2)
                        .map(|raw| String::from_utf8_lossy(raw).to_uppercase())
                        .as_deref()
                    {
                        None => FailoverOption::Default,
                        Some("FORCE") => FailoverOption::Force,
                        Some("TAKEOVER") => FailoverOption::Takeover,
                        Some("ABORT") => FailoverOption::Abort,
                        Some(_) => return Err(FerriteError::SyntaxError),
                    };
                    self.failover(option)?;
                    Ok(Reply::ok())
                }
                _ => Err(FerriteError::UnknownCommand(format!(
                    "cluster|{}",
                    sub.to_lowercase()
                ))),
            }
        })();
        match result {
            Ok(reply) => reply,
            Err(err) => Reply::from_error(&err),
        }
    }

    /// Replica-initiated failover against this node's configured primary.
    pub fn failover(&self, option: FailoverOption) -> Result<Vec<u16>> {
        let topology = self
            .topology
            .as_ref()
            .ok_or_else(|| FerriteError::ClusterDown("cluster support disabled".into()))?;
        let old_primary = topology
            .local_node()
            .primary_of
            .ok_or_else(|| FerriteError::Replication("this node has no primary".into()))?;
        let committed = self
            .aof
            .as_ref()
            .map(|aof| aof.committed_until())
            .unwrap_or(FIRST_VALID_ADDRESS)
            .max(self.replication.replica_offset());
        let session = FailoverSession::new(option, &FailoverConfig::default());
        session.execute(
            topology,
            self.replication.history(),
            &self.replication,
            &old_primary,
            None,
            committed,
            &SilentNotifier,
        )
    }

    // -- migration -----------------------------------------------------------

    fn migration_source(&self) -> Result<MigrationSource<'_>> {
        let topology = self
            .topology
            .as_ref()
            .ok_or_else(|| FerriteError::ClusterDown("cluster support disabled".into()))?;
        Ok(MigrationSource {
            topology,
            tracker: &self.tracker,
            main: &self.main,
            objects: &self.objects,
        })
    }

    /// Slot-mode migration to a linked peer.
    pub fn migrate_slots_to(
        &self,
        peer: &Arc<FerriteNode>,
        slots: &[u16],
        options: &MigrateOptions,
    ) -> Result<()> {
        let target = LocalMigrationTarget {
            topology: Arc::clone(
                peer.topology
                    .as_ref()
                    .ok_or_else(|| FerriteError::ClusterDown("peer not clustered".into()))?,
            ),
            main: Arc::clone(&peer.main),
            objects: Arc::clone(&peer.objects),
        };
        self.migration
            .migrate_slots(&self.migration_source()?, &target, slots, options)
    }

    fn migrate_command(&self, argv: &[Vec<u8>]) -> Reply {
        let result = (|| -> Result<Reply> {
            if argv.len() < 6 {
                return Err(FerriteError::WrongArity("migrate".into()));
            }
            let host = String::from_utf8_lossy(&argv[1]).to_string();
            let port = String::from_utf8_lossy(&argv[2]).to_string();
            let single_key = argv[3].clone();
            let timeout_ms: u64 = String::from_utf8_lossy(&argv[5])
                .parse()
                .map_err(|_| FerriteError::ValueNotInteger)?;

            let mut options = MigrateOptions {
                timeout: std::time::Duration::from_millis(timeout_ms.max(1)),
                ..MigrateOptions::default()
            };
            let mut keys: Vec<Vec<u8>> = Vec::new();
            let mut index = 6;
            while index < argv.len() {
                let opt = String::from_utf8_lossy(&argv[index]).to_uppercase();
                match opt.as_str() {
                    "COPY" => options.copy = true,
                    "REPLACE" => options.replace = true,
                    "AUTH" => index += 1,
                    "KEYS" => {
                        keys.extend(argv[index + 1..].iter().cloned());
                        break;
                    }
                    _ => return Err(FerriteError::SyntaxError),
                }
                index += 1;
            }
            if !single_key.is_empty() {
                keys.push(single_key);
            }

            let endpoint = format!("{host}:{port}");
            let peer = self
                .peer_links
                .get(&endpoint)
                .map(|p| Arc::clone(&p))
                .ok_or_else(|| {
                    FerriteError::Replication(format!("can't connect to target node {endpoint}"))
                })?;
            let target = LocalMigrationTarget {
                topology: Arc::clone(peer.topology.as_ref().ok_or_else(|| {
                    FerriteError::ClusterDown("target not clustered".into())
                })?),
                main: Arc::clone(&peer.main),
                objects: Arc::clone(&peer.objects),
            };
            self.migration
                .migrate_keys(&self.migration_source()?, &target, &keys, &options)?;
            Ok(Reply::ok())
        })();
        match result {
            Ok(reply) => reply,
            Err(err) => Reply::from_error(&err),
        }
    }

    // -- info ---------------------------------------------------------------

    fn render_info(&self) -> String {
        let history = self.replication.history().load();
        let role = match self.replication.role() {
            ReplicationRole::Primary => "master",
            ReplicationRole::Replica => "slave",
        };
        let mut out = String::new();
        out.push_str("# Replication\r\n");
        out.push_str(&format!("role:{role}\r\n"));
        out.push_str(&format!(
            "connected_slaves:{}\r\n",
            self.replication.count_connected_replicas()
        ));
        out.push_str(&format!("master_replid:{}\r\n", history.primary_replid));
        out.push_str(&format!("master_replid2:{}\r\n", history.primary_replid2));
        out.push_str(&format!(
            "master_repl_offset:{}\r\n",
            self.aof
                .as_ref()
                .map(|aof| aof.committed_until())
                .unwrap_or(0)
        ));
        out.push_str(&format!(
            "second_repl_offset:{}\r\n",
            history.replication_offset2
        ));
        out
    }

    /// Periodic AOF committer for `commit_frequency_ms > 0`. With 0 every
    /// write commits inline; with -1 commits happen only on demand.
    pub fn start_commit_scheduler(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let frequency = self.options.commit_frequency_ms;
        let aof = self.aof.clone()?;
        if frequency <= 0 {
            return None;
        }
        let period = std::time::Duration::from_millis(frequency as u64);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(err) = aof.commit(true) {
                    warn!(%err, "scheduled AOF commit failed");
                }
            }
        }))
    }

    /// Graceful shutdown: cancel replication tasks, final commit.
    pub async fn shutdown(&self) -> Result<()> {
        self.replication.dispose().await;
        if let Some(aof) = &self.aof {
            aof.commit(true)?;
        }
        self.main.allocator().flush_to(self.main.allocator().tail())?;
        self.objects
            .store()
            .allocator()
            .flush_to(self.objects.store().allocator().tail())?;
        info!(node_id = %self.node_id, "node shut down");
        Ok(())
    }
}

/// Wire a replica to a primary in-process: resolve lineage, pick the
/// resume address, spawn the applier, and register the sync task.
///
/// A replication-id mismatch discards the replica's lineage and re-seeds
/// it from the primary's, tailing the full retained AOF.
pub fn attach_replica(primary: &Arc<FerriteNode>, replica: &Arc<FerriteNode>) -> Result<()> {
    let aof = primary
        .aof
        .clone()
        .ok_or_else(|| FerriteError::Replication("primary has no AOF".into()))?;

    let primary_history = primary.replication.history().load();
    let replica_history = replica.replication.history().load();

    let start_la = if replica_history.primary_replid == primary_history.primary_replid {
        replica
            .replication
            .replica_offset()
            .max(FIRST_VALID_ADDRESS)
    } else {
        warn!(
            ours = %replica_history.primary_replid,
            theirs = %primary_history.primary_replid,
            "replication id mismatch; discarding local lineage and re-seeding"
        );
        let adopted = primary_history.primary_replid.clone();
        replica.replication.history().update(|history| {
            history.primary_replid = adopted;
            history.primary_replid2 = String::new();
            history.replication_offset = 0;
            history.replication_offset2 = 0;
        })?;
        aof.begin_address().max(FIRST_VALID_ADDRESS)
    };

    replica.replication.set_role(ReplicationRole::Replica);
    if let Some(topology) = &replica.topology {
        topology.set_local_role(
            NodeRole::Replica,
            primary.topology.as_ref().map(|t| t.local_id()),
        );
    }

    let applier = replication::ReplicaApplier::new(
        Arc::clone(&replica.main),
        Arc::clone(&replica.objects),
        replica.aof.clone(),
        replica.replication.replica_offset_cell(),
    );
    let throttle = primary
        .replication
        .config()
        .task_store
        .network_send_throttle_max;
    let (transport, _handle) = replication::spawn_applier(applier, throttle);

    match primary.topology.as_ref() {
        Some(topology) => primary.replication.attach_replica(
            aof,
            topology.as_ref(),
            replica.node_id(),
            start_la,
            Arc::new(transport),
        ),
        None => primary.replication.attach_replica(
            aof,
            &replication::AnyEndpoint,
            replica.node_id(),
            start_la,
            Arc::new(transport),
        ),
    }
}

// # Stored Procedures
//
// A registered procedure declares its key set in `prepare` (optionally
// reading through a watch-recording API), runs `main` under sorted key
// locks with its effects logged to the AOF, and always gets `finalize`,
// even when `main` fails.

use crate::aof::AofOp;
use crate::error::{FerriteError, Result};
use crate::protocol::Reply;
use crate::storage::{KvStore, ObjectStore};

use super::manager::TxnManager;
use super::watch::{VersionMap, WatchRegistry};
use crate::common::StoreKind;

/// Effect logger supplied by the node: `(op, key, value)` becomes an AOF
/// record before the store mutation lands.
pub type EffectLog<'a> = &'a mut dyn FnMut(AofOp, &[u8], &[u8]) -> Result<()>;

pub trait StoredProcedure: Send + Sync {
    fn name(&self) -> &'static str;

    /// Declare the keys `main` will touch; reads here may record watches.
    fn prepare(&self, ctx: &mut PrepareContext<'_>) -> Result<()>;

    /// Execute under locks. Mutations must go through the context so they
    /// reach the AOF.
    fn main(&self, ctx: &mut ProcedureContext<'_>) -> Result<Reply>;

    /// Cleanup hook; runs regardless of `main`'s outcome.
    fn finalize(&self, ctx: &mut ProcedureContext<'_>);
}

pub struct PrepareContext<'a> {
    main: &'a KvStore,
    versions: &'a VersionMap,
    watches: &'a mut WatchRegistry,
    keys: Vec<Vec<u8>>,
}

impl PrepareContext<'_> {
    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    /// Read a key and record its version, aborting the procedure at lock
    /// time if it moves before `main` runs.
    pub fn read_watched(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.watches.watch(key, StoreKind::Main, self.versions);
        self.add_key(key);
        self.main.read_blocking(key)
    }
}

pub struct ProcedureContext<'a> {
    main: &'a KvStore,
    objects: &'a ObjectStore,
    log: EffectLog<'a>,
}

impl ProcedureContext<'_> {
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.main.read_blocking(key)
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        (self.log)(AofOp::StoreUpsert, key, value)?;
        self.main.upsert(key, value)
    }

    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        (self.log)(AofOp::StoreDelete, key, &[])?;
        self.main.delete_blocking(key)
    }

    pub fn objects(&self) -> &ObjectStore {
        self.objects
    }
}

/// Run a procedure to completion: prepare, lock, revalidate watches,
/// main, log the `StoredProcedure` record, commit, finalize.
pub fn run_procedure(
    procedure: &dyn StoredProcedure,
    manager: &TxnManager,
    main: &KvStore,
    objects: &ObjectStore,
    log: EffectLog<'_>,
    commit: &mut dyn FnMut(&str) -> Result<()>,
) -> Result<Reply> {
    let versions = manager.versions().clone();
    let mut watches = WatchRegistry::default();
    let keys = {
        let mut prepare = PrepareContext {
            main,
            versions: &versions,
            watches: &mut watches,
            keys: Vec::new(),
        };
        procedure.prepare(&mut prepare)?;
        prepare.keys
    };

    manager.with_locked_keys(&keys, move || -> Result<Reply> {
        if !watches.validate(&versions) {
            return Err(FerriteError::ExecAbort);
        }
        let outcome = {
            let mut ctx = ProcedureContext {
                main,
                objects,
                log: &mut *log,
            };
            let result = procedure.main(&mut ctx);
            match result {
                Ok(reply) => commit(procedure.name()).map(|_| reply),
                Err(err) => Err(err),
            }
        };
        let mut ctx = ProcedureContext {
            main,
            objects,
            log: &mut *log,
        };
        procedure.finalize(&mut ctx);
        outcome
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, SECTOR_SIZE};
    use crate::storage::device::SegmentedFileDevice;
    use crate::storage::StoreConfig;
    use crate::txn::manager::TxnConfig;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn fixtures(dir: &std::path::Path) -> (KvStore, ObjectStore, TxnManager) {
        let pool = BufferPool::new(SECTOR_SIZE, 64);
        let main = KvStore::new(
            StoreConfig {
                kind: StoreKind::Main,
                index_size: 1 << 8,
                page_bits: 12,
                memory_pages: 4,
            },
            Arc::new(SegmentedFileDevice::open(dir, "hlog", 1 << 20).unwrap()),
            Arc::clone(&pool),
        );
        let objects = ObjectStore::new(
            StoreConfig {
                kind: StoreKind::Object,
                index_size: 1 << 8,
                page_bits: 12,
                memory_pages: 4,
            },
            Arc::new(SegmentedFileDevice::open(dir, "olog", 1 << 20).unwrap()),
            pool,
        );
        (main, objects, TxnManager::new(TxnConfig::default()))
    }

    struct Transfer {
        finalized: Arc<AtomicBool>,
        fail_main: bool,
    }

    impl StoredProcedure for Transfer {
        fn name(&self) -> &'static str {
            "TRANSFER"
        }

        fn prepare(&self, ctx: &mut PrepareContext<'_>) -> Result<()> {
            ctx.read_watched(b"src")?;
            ctx.add_key(b"dst");
            Ok(())
        }

        fn main(&self, ctx: &mut ProcedureContext<'_>) -> Result<Reply> {
            if self.fail_main {
                return Err(FerriteError::SyntaxError);
            }
            let value = ctx.get(b"src")?.unwrap_or_default();
            ctx.set(b"dst", &value)?;
            ctx.del(b"src")?;
            Ok(Reply::ok())
        }

        fn finalize(&self, _ctx: &mut ProcedureContext<'_>) {
            self.finalized.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn procedure_moves_value_and_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let (main, objects, manager) = fixtures(dir.path());
        main.upsert(b"src", b"cargo").unwrap();

        let finalized = Arc::new(AtomicBool::new(false));
        let procedure = Transfer {
            finalized: Arc::clone(&finalized),
            fail_main: false,
        };
        let mut logged = Vec::new();
        let mut log = |op: AofOp, key: &[u8], _value: &[u8]| -> Result<()> {
            logged.push((op, key.to_vec()));
            Ok(())
        };
        let mut committed = false;
        let mut commit = |_: &str| -> Result<()> {
            committed = true;
            Ok(())
        };
        let reply =
            run_procedure(&procedure, &manager, &main, &objects, &mut log, &mut commit).unwrap();
        assert_eq!(reply, Reply::ok());
        assert!(committed);
        assert!(finalized.load(Ordering::SeqCst));
        assert_eq!(main.read_blocking(b"dst").unwrap(), Some(b"cargo".to_vec()));
        assert_eq!(main.read_blocking(b"src").unwrap(), None);
        assert_eq!(logged.len(), 2);
    }

    #[test]
    fn finalize_runs_even_when_main_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (main, objects, manager) = fixtures(dir.path());
        let finalized = Arc::new(AtomicBool::new(false));
        let procedure = Transfer {
            finalized: Arc::clone(&finalized),
            fail_main: true,
        };
        let mut log = |_: AofOp, _: &[u8], _: &[u8]| -> Result<()> { Ok(()) };
        let mut committed = false;
        let mut commit = |_: &str| -> Result<()> {
            committed = true;
            Ok(())
        };
        assert!(
            run_procedure(&procedure, &manager, &main, &objects, &mut log, &mut commit).is_err()
        );
        assert!(finalized.load(Ordering::SeqCst));
        assert!(!committed);
    }
}

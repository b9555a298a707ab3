// # Transactions
//
// Multi-key locked execution: MULTI/EXEC queuing with optimistic WATCH
// concurrency, sorted-by-hash lock acquisition, and stored procedures
// with prepare/main/finalize lifecycles. Commits frame their AOF records
// between TxnStart and TxnCommit.

pub mod lock_manager;
pub mod manager;
pub mod procedures;
pub mod watch;

pub use lock_manager::LockManager;
pub use manager::{
    check_arity, command_info, extract_keys, CommandInfo, Session, TxnConfig, TxnManager, TxnPhase,
};
pub use procedures::{run_procedure, PrepareContext, ProcedureContext, StoredProcedure};
pub use watch::{VersionMap, WatchRegistry, WatchedKey};

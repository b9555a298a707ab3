// # Transaction Manager
//
// MULTI/EXEC queuing with command-metadata validation, sorted-by-hash
// lock acquisition across both stores, and watch revalidation at EXEC.
// The session state machine is `None -> Started -> Running ->
// {Commit|Abort} -> None`; a validation failure while queuing poisons the
// transaction so EXEC answers EXECABORT.

use std::sync::Arc;
use std::time::Duration;

use crate::common::key_hash;
use crate::error::{FerriteError, Result};
use crate::storage::SessionPending;

use super::lock_manager::LockManager;
use super::watch::{VersionMap, WatchRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnPhase {
    None,
    Started,
    /// Queue poisoned by an invalid command; EXEC must abort.
    Aborted,
    Running,
}

/// Per-connection state threaded through every `execute` call.
pub struct Session {
    pub id: u64,
    pub phase: TxnPhase,
    pub queue: Vec<Vec<Vec<u8>>>,
    pub watches: WatchRegistry,
    /// Set by ASKING for exactly the next command.
    pub asking: bool,
    pub pending: SessionPending,
}

impl Session {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            phase: TxnPhase::None,
            queue: Vec::new(),
            watches: WatchRegistry::default(),
            asking: false,
            pending: SessionPending::default(),
        }
    }

    pub fn in_transaction(&self) -> bool {
        matches!(self.phase, TxnPhase::Started | TxnPhase::Aborted)
    }
}

/// Static metadata used to validate queued commands and collect keys.
pub struct CommandInfo {
    pub name: &'static str,
    /// Redis convention: positive is exact argc, negative is a minimum.
    pub arity: i8,
    pub first_key: usize,
    /// Distance between keys in argv; 0 means no keys.
    pub key_step: usize,
    pub is_write: bool,
}

const COMMAND_TABLE: &[CommandInfo] = &[
    CommandInfo { name: "GET", arity: 2, first_key: 1, key_step: 1, is_write: false },
    CommandInfo { name: "SET", arity: -3, first_key: 1, key_step: 2, is_write: true },
    CommandInfo { name: "DEL", arity: -2, first_key: 1, key_step: 1, is_write: true },
    CommandInfo { name: "EXISTS", arity: -2, first_key: 1, key_step: 1, is_write: false },
    CommandInfo { name: "MSET", arity: -3, first_key: 1, key_step: 2, is_write: true },
];

pub fn command_info(name: &str) -> Option<&'static CommandInfo> {
    COMMAND_TABLE.iter().find(|info| info.name == name)
}

pub fn check_arity(info: &CommandInfo, argc: usize) -> bool {
    if info.arity >= 0 {
        argc == info.arity as usize
    } else {
        argc >= (-info.arity) as usize
    }
}

/// Keys of one command, per its metadata.
pub fn extract_keys(info: &CommandInfo, argv: &[Vec<u8>]) -> Vec<Vec<u8>> {
    if info.key_step == 0 {
        return Vec::new();
    }
    let mut keys = Vec::new();
    let mut index = info.first_key;
    // SET-style commands carry exactly one key despite step 2.
    let last = if info.arity == -3 && info.name == "SET" {
        info.first_key
    } else {
        argv.len().saturating_sub(1)
    };
    while index <= last && index < argv.len() {
        keys.push(argv[index].clone());
        index += info.key_step;
    }
    keys
}

#[derive(Debug, Clone)]
pub struct TxnConfig {
    pub lock_timeout: Duration,
    pub fail_fast_on_lock: bool,
    pub lock_stripes: usize,
    pub version_map_size: usize,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            fail_fast_on_lock: true,
            lock_stripes: 1 << 10,
            version_map_size: 1 << 16,
        }
    }
}

pub struct TxnManager {
    config: TxnConfig,
    locks: LockManager,
    versions: Arc<VersionMap>,
}

impl TxnManager {
    pub fn new(config: TxnConfig) -> Self {
        Self {
            locks: LockManager::new(config.lock_stripes),
            versions: Arc::new(VersionMap::new(config.version_map_size)),
            config,
        }
    }

    pub fn versions(&self) -> &Arc<VersionMap> {
        &self.versions
    }

    pub fn begin(&self, session: &mut Session) -> Result<()> {
        if session.in_transaction() {
            return Err(FerriteError::NestedMulti);
        }
        session.phase = TxnPhase::Started;
        session.queue.clear();
        Ok(())
    }

    pub fn discard(&self, session: &mut Session) -> Result<()> {
        if !session.in_transaction() {
            return Err(FerriteError::DiscardWithoutMulti);
        }
        session.phase = TxnPhase::None;
        session.queue.clear();
        session.watches.unwatch();
        Ok(())
    }

    /// Validate and queue one command. Validation failures poison the
    /// queue and bubble the original error to the client.
    pub fn queue(&self, session: &mut Session, argv: Vec<Vec<u8>>) -> Result<()> {
        let name = String::from_utf8_lossy(&argv[0]).to_uppercase();
        if name == "WATCH" {
            session.phase = TxnPhase::Aborted;
            return Err(FerriteError::WatchInMulti);
        }
        let Some(info) = command_info(&name) else {
            session.phase = TxnPhase::Aborted;
            return Err(FerriteError::UnknownCommand(name.to_lowercase()));
        };
        if !check_arity(info, argv.len()) {
            session.phase = TxnPhase::Aborted;
            return Err(FerriteError::WrongArity(name.to_lowercase()));
        }
        session.queue.push(argv);
        Ok(())
    }

    /// EXEC entry: hand over the queue, or fail per the state machine.
    pub fn take_queue(&self, session: &mut Session) -> Result<Vec<Vec<Vec<u8>>>> {
        match session.phase {
            TxnPhase::None | TxnPhase::Running => Err(FerriteError::ExecWithoutMulti),
            TxnPhase::Aborted => {
                session.phase = TxnPhase::None;
                session.queue.clear();
                session.watches.unwatch();
                Err(FerriteError::ExecAbort)
            }
            TxnPhase::Started => {
                session.phase = TxnPhase::Running;
                Ok(std::mem::take(&mut session.queue))
            }
        }
    }

    /// Commit or abort epilogue: back to `None`, watches cleared.
    pub fn finish(&self, session: &mut Session) {
        session.phase = TxnPhase::None;
        session.queue.clear();
        session.watches.unwatch();
    }

    pub fn validate_watches(&self, session: &Session) -> bool {
        session.watches.validate(&self.versions)
    }

    /// Run `body` with all `keys` locked, sorted-by-hash. Fail-fast mode
    /// bounds each acquisition by the configured lock timeout.
    pub fn with_locked_keys<R>(&self, keys: &[Vec<u8>], body: impl FnOnce() -> R) -> Result<R> {
        let hashes: Vec<u64> = keys.iter().map(|key| key_hash(key)).collect();
        let timeout = self
            .config
            .fail_fast_on_lock
            .then_some(self.config.lock_timeout);
        self.locks.with_locks(&hashes, timeout, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    #[test]
    fn multi_exec_state_machine() {
        let manager = TxnManager::new(TxnConfig::default());
        let mut session = Session::new(1);

        assert!(matches!(
            manager.take_queue(&mut session),
            Err(FerriteError::ExecWithoutMulti)
        ));

        manager.begin(&mut session).unwrap();
        assert!(matches!(
            manager.begin(&mut session),
            Err(FerriteError::NestedMulti)
        ));

        manager.queue(&mut session, argv(&["SET", "x", "1"])).unwrap();
        manager.queue(&mut session, argv(&["GET", "x"])).unwrap();
        let queued = manager.take_queue(&mut session).unwrap();
        assert_eq!(queued.len(), 2);
        manager.finish(&mut session);
        assert_eq!(session.phase, TxnPhase::None);
    }

    #[test]
    fn invalid_queued_command_poisons_the_transaction() {
        let manager = TxnManager::new(TxnConfig::default());
        let mut session = Session::new(1);
        manager.begin(&mut session).unwrap();
        assert!(manager.queue(&mut session, argv(&["NOSUCH", "x"])).is_err());
        assert!(matches!(
            manager.take_queue(&mut session),
            Err(FerriteError::ExecAbort)
        ));
        // EXECABORT resets the session.
        assert_eq!(session.phase, TxnPhase::None);
    }

    #[test]
    fn watch_is_forbidden_inside_multi() {
        let manager = TxnManager::new(TxnConfig::default());
        let mut session = Session::new(1);
        manager.begin(&mut session).unwrap();
        assert!(matches!(
            manager.queue(&mut session, argv(&["WATCH", "x"])),
            Err(FerriteError::WatchInMulti)
        ));
    }

    #[test]
    fn discard_returns_to_none() {
        let manager = TxnManager::new(TxnConfig::default());
        let mut session = Session::new(1);
        assert!(matches!(
            manager.discard(&mut session),
            Err(FerriteError::DiscardWithoutMulti)
        ));
        manager.begin(&mut session).unwrap();
        manager.queue(&mut session, argv(&["SET", "x", "1"])).unwrap();
        manager.discard(&mut session).unwrap();
        assert_eq!(session.phase, TxnPhase::None);
        assert!(session.queue.is_empty());
    }

    #[test]
    fn arity_validation() {
        let get = command_info("GET").unwrap();
        assert!(check_arity(get, 2));
        assert!(!check_arity(get, 3));
        let set = command_info("SET").unwrap();
        assert!(check_arity(set, 3));
        assert!(check_arity(set, 5));
        assert!(!check_arity(set, 2));
    }

    #[test]
    fn key_extraction_per_metadata() {
        let del = command_info("DEL").unwrap();
        assert_eq!(
            extract_keys(del, &argv(&["DEL", "a", "b"])),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
        let mset = command_info("MSET").unwrap();
        assert_eq!(
            extract_keys(mset, &argv(&["MSET", "k1", "v1", "k2", "v2"])),
            vec![b"k1".to_vec(), b"k2".to_vec()]
        );
        let set = command_info("SET").unwrap();
        assert_eq!(
            extract_keys(set, &argv(&["SET", "k", "v"])),
            vec![b"k".to_vec()]
        );
    }
}

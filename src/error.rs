use thiserror::Error;

pub type Result<T> = std::result::Result<T, FerriteError>;

/// Error taxonomy surfaced by the storage and replication core.
///
/// Cluster state errors never mutate state; device errors fail only the
/// pending operation that hit them. Message text for client-visible
/// variants matches the wire protocol exactly.
#[derive(Error, Debug)]
pub enum FerriteError {
    // -- storage / recovery ------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid begin address {requested}, tail is {tail}")]
    InvalidBeginAddress { requested: u64, tail: u64 },

    #[error("invalid metadata length {0}, need at least 52 bytes")]
    InvalidMetadataLength(usize),

    #[error("unexpected checkpoint entry: {0}")]
    UnexpectedCheckpointEntry(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    // -- cluster state -----------------------------------------------------
    #[error("ERR Slot out of range")]
    SlotOutOfRange,

    #[error("ERR Slot {0} specified multiple times")]
    SlotSpecifiedMultipleTimes(u16),

    #[error("ERR Slot {0} is already busy")]
    SlotAlreadyBusy(u16),

    #[error("ERR I'm not the owner of hash slot {0}")]
    NotSlotOwner(u16),

    #[error("ERR I don't know about node {0}")]
    UnknownNode(String),

    #[error("ERR Can't MIGRATE to myself")]
    CantMigrateToSelf,

    #[error("ERR Slot {0} is already owned by this node")]
    LocalSlotAlreadyImported(u16),

    #[error("ERR Slot already scheduled for import from {0}")]
    AlreadyScheduledImport(String),

    // -- replication lifecycle ---------------------------------------------
    #[error("AOF address {requested} unavailable, tail is {tail}")]
    AofAddressUnavailable { requested: u64, tail: u64 },

    #[error("replication manager disposed")]
    ReplicationManagerDisposed,

    #[error("cancellation requested")]
    CancellationRequested,

    // -- command validation (bubbled through the RESP layer) ----------------
    #[error("ERR syntax error")]
    SyntaxError,

    #[error("ERR value is not an integer or out of range")]
    ValueNotInteger,

    #[error("ERR min or max is not a float")]
    MinMaxNotValidFloat,

    #[error("ERR no such member")]
    MemberNotExists,

    // -- transaction / cluster runtime --------------------------------------
    #[error("lock acquisition timed out")]
    LockTimeout,

    #[error("ERR MULTI calls can not be nested")]
    NestedMulti,

    #[error("ERR EXEC without MULTI")]
    ExecWithoutMulti,

    #[error("ERR DISCARD without MULTI")]
    DiscardWithoutMulti,

    #[error("ERR WATCH inside MULTI is not allowed")]
    WatchInMulti,

    #[error("EXECABORT Transaction discarded because of previous errors.")]
    ExecAbort,

    #[error("CROSSSLOT Keys in request don't hash to the same slot")]
    CrossSlot,

    #[error("CLUSTERDOWN {0}")]
    ClusterDown(String),

    #[error("TRYAGAIN Multiple keys request during rehashing of slot")]
    TryAgain,

    // -- configuration / misc -----------------------------------------------
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("replication error: {0}")]
    Replication(String),

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),
}

impl FerriteError {
    /// Render as a RESP error line. Variants whose display text already
    /// carries an error-code prefix pass through untouched.
    pub fn to_resp_message(&self) -> String {
        let text = self.to_string();
        let prefixed = text
            .split(' ')
            .next()
            .map(|w| !w.is_empty() && w.chars().all(|c| c.is_ascii_uppercase()))
            .unwrap_or(false);
        if prefixed {
            text
        } else {
            format!("ERR {text}")
        }
    }
}

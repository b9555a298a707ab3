// # Checkpointing
//
// Point-in-time snapshots of the stores, tagged by GUID and wrapped with
// the replication cookie. See `manager` for the lifecycle and `metadata`
// for the 52-byte cookie layout.

pub mod manager;
pub mod metadata;

pub use manager::{
    CheckpointEntry, CheckpointKind, CheckpointManager, CheckpointToken, RecoveredCheckpoint,
    RetentionPolicy,
};
pub use metadata::{append_cookie, extract_cookie, CheckpointCookie, COOKIE_HEADER_LEN};

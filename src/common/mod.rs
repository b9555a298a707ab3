// # Common Types
//
// Shared identifiers, hashing, and constants used across the storage,
// replication, cluster, and transaction modules.

mod hashing;

pub use hashing::{key_hash, key_hash_slot, SLOT_COUNT};

use serde::{Deserialize, Serialize};

/// Which companion store a key lives in. The main store holds inline byte
/// values; the object store holds boxed collection objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreKind {
    Main,
    Object,
}

/// 40-hex-character node identifier, also used as a replication lineage id.
pub type NodeId = String;

/// Generate a fresh 40-hex-character identifier.
pub fn random_hex_id() -> NodeId {
    use rand::RngCore;
    let mut bytes = [0u8; 20];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Length in bytes of a rendered node / replication id.
pub const HEX_ID_LEN: usize = 40;

// AOF record framing: a fixed 16-byte header followed by the payload,
// padded to 8-byte alignment. Records are appended atomically and never
// straddle a page's checksum frame.

use crate::error::{FerriteError, Result};
use crate::storage::address::align_up;

/// Mutation kinds recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AofOp {
    StoreUpsert = 1,
    StoreDelete = 2,
    ObjectRmw = 3,
    TxnStart = 4,
    TxnCommit = 5,
    StoredProcedure = 6,
    CheckpointMarker = 7,
    /// Fast-commit metadata record; carries the committed tail.
    FastCommit = 8,
}

impl TryFrom<u8> for AofOp {
    type Error = FerriteError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => AofOp::StoreUpsert,
            2 => AofOp::StoreDelete,
            3 => AofOp::ObjectRmw,
            4 => AofOp::TxnStart,
            5 => AofOp::TxnCommit,
            6 => AofOp::StoredProcedure,
            7 => AofOp::CheckpointMarker,
            8 => AofOp::FastCommit,
            other => {
                return Err(FerriteError::Serialization(format!(
                    "unknown AOF op {other}"
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AofHeader {
    pub op: AofOp,
    pub sub: u8,
    pub version: u8,
    pub session_id: u64,
}

impl AofHeader {
    pub fn new(op: AofOp, session_id: u64) -> Self {
        Self {
            op,
            sub: 0,
            version: 1,
            session_id,
        }
    }
}

/// Bytes of the on-log header: `total_len | op | sub | version | flags |
/// session_id`.
pub const AOF_HEADER_LEN: usize = 16;

/// Physical extent of a record with the given payload length.
pub fn entry_extent(payload_len: usize) -> usize {
    align_up(AOF_HEADER_LEN + payload_len, 8)
}

pub fn write_entry(buf: &mut [u8], header: &AofHeader, payload: &[u8]) {
    let total = (AOF_HEADER_LEN + payload.len()) as u32;
    buf[0..4].copy_from_slice(&total.to_le_bytes());
    buf[4] = header.op as u8;
    buf[5] = header.sub;
    buf[6] = header.version;
    buf[7] = 0;
    buf[8..16].copy_from_slice(&header.session_id.to_le_bytes());
    buf[16..16 + payload.len()].copy_from_slice(payload);
}

/// Parse the record starting at `buf[0]`. `Ok(None)` means zeroed page
/// padding; errors mean a malformed header.
pub fn parse_entry(buf: &[u8]) -> Result<Option<(AofHeader, Vec<u8>)>> {
    if buf.len() < AOF_HEADER_LEN {
        return Ok(None);
    }
    let total = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    if total == 0 {
        return Ok(None);
    }
    if total < AOF_HEADER_LEN || total > buf.len() {
        return Err(FerriteError::Serialization(format!(
            "AOF record length {total} out of bounds"
        )));
    }
    let op = AofOp::try_from(buf[4])?;
    let header = AofHeader {
        op,
        sub: buf[5],
        version: buf[6],
        session_id: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
    };
    Ok(Some((header, buf[AOF_HEADER_LEN..total].to_vec())))
}

// -- payload helpers ----------------------------------------------------------

/// `u32 key_len | key | value`
pub fn payload_key_value(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len() + value.len());
    out.extend_from_slice(&(key.len() as u32).to_le_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out
}

pub fn parse_key_value(payload: &[u8]) -> Result<(&[u8], &[u8])> {
    if payload.len() < 4 {
        return Err(FerriteError::Serialization("short AOF payload".into()));
    }
    let key_len = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
    if payload.len() < 4 + key_len {
        return Err(FerriteError::Serialization("truncated AOF key".into()));
    }
    Ok((&payload[4..4 + key_len], &payload[4 + key_len..]))
}

pub fn payload_key(key: &[u8]) -> Vec<u8> {
    payload_key_value(key, &[])
}

// Checkpoint metadata cookie.
//
// Every checkpoint metadata blob is wrapped with a fixed 52-byte header
// carrying replication coordinates:
//
// ```text
// offset 0  : i32  cookie_size (= 8 + 40 = 48)
// offset 4  : i64  checkpoint_covered_aof_address
// offset 12 : 40B  primary_replication_id (ASCII hex)
// offset 52 : ...  original metadata payload
// ```

use crate::common::HEX_ID_LEN;
use crate::error::{FerriteError, Result};

/// Size of the two cookie fields behind the length prefix.
const COOKIE_SIZE: i32 = 8 + HEX_ID_LEN as i32;

/// Total fixed header length.
pub const COOKIE_HEADER_LEN: usize = 4 + COOKIE_SIZE as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointCookie {
    /// AOF address up to which this checkpoint reflects state.
    pub covered_aof_address: i64,
    /// 40-hex-character lineage id of the primary that produced it.
    pub replication_id: String,
}

/// Prepend the cookie to a metadata payload.
pub fn append_cookie(cookie: &CheckpointCookie, payload: &[u8]) -> Vec<u8> {
    debug_assert_eq!(cookie.replication_id.len(), HEX_ID_LEN);
    let mut out = Vec::with_capacity(COOKIE_HEADER_LEN + payload.len());
    out.extend_from_slice(&COOKIE_SIZE.to_le_bytes());
    out.extend_from_slice(&cookie.covered_aof_address.to_le_bytes());
    out.extend_from_slice(cookie.replication_id.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Split a cookie-wrapped blob back into the cookie and the original
/// payload.
pub fn extract_cookie(bytes: &[u8]) -> Result<(CheckpointCookie, &[u8])> {
    if bytes.len() < COOKIE_HEADER_LEN {
        return Err(FerriteError::InvalidMetadataLength(bytes.len()));
    }
    let cookie_size = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if cookie_size != COOKIE_SIZE {
        return Err(FerriteError::UnexpectedCheckpointEntry(format!(
            "cookie size {cookie_size}, expected {COOKIE_SIZE}"
        )));
    }
    let covered_aof_address = i64::from_le_bytes(bytes[4..12].try_into().unwrap());
    let replication_id = std::str::from_utf8(&bytes[12..COOKIE_HEADER_LEN])
        .map_err(|_| {
            FerriteError::UnexpectedCheckpointEntry("replication id is not ASCII".into())
        })?
        .to_string();
    Ok((
        CheckpointCookie {
            covered_aof_address,
            replication_id,
        },
        &bytes[COOKIE_HEADER_LEN..],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::random_hex_id;

    #[test]
    fn cookie_pack_extract_is_a_bijection() {
        let cookie = CheckpointCookie {
            covered_aof_address: 123_456,
            replication_id: random_hex_id(),
        };
        let payload = b"opaque recovery info".to_vec();
        let wrapped = append_cookie(&cookie, &payload);
        assert_eq!(wrapped.len(), COOKIE_HEADER_LEN + payload.len());

        let (extracted, rest) = extract_cookie(&wrapped).unwrap();
        assert_eq!(extracted, cookie);
        assert_eq!(rest, payload.as_slice());
    }

    #[test]
    fn short_metadata_is_rejected() {
        let err = extract_cookie(&[0u8; 51]).unwrap_err();
        assert!(matches!(err, FerriteError::InvalidMetadataLength(51)));
    }

    #[test]
    fn wrong_cookie_size_is_rejected() {
        let mut wrapped = append_cookie(
            &CheckpointCookie {
                covered_aof_address: 0,
                replication_id: random_hex_id(),
            },
            &[],
        );
        wrapped[0] = 47;
        assert!(matches!(
            extract_cookie(&wrapped),
            Err(FerriteError::UnexpectedCheckpointEntry(_))
        ));
    }

    #[test]
    fn header_is_52_bytes() {
        assert_eq!(COOKIE_HEADER_LEN, 52);
    }
}

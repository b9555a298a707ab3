// Key hashing: the 64-bit hash feeding the index and version map, and the
// CRC16-based hash-slot mapping used by the cluster layer.

use std::hash::Hasher;

use once_cell::sync::Lazy;

/// Number of hash slots in a cluster.
pub const SLOT_COUNT: u16 = 16384;

/// 64-bit hash of a key's bytes.
///
/// Uses the SipHash-1-3 variant behind `DefaultHasher::new()`, which is
/// keyed with fixed constants and therefore stable across processes; index
/// rebuild after recovery recomputes identical bucket positions.
pub fn key_hash(key: &[u8]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    hasher.write(key);
    hasher.finish()
}

// CRC16/XMODEM table, polynomial 0x1021, as used for cluster key slots.
static CRC16_TABLE: Lazy<[u16; 256]> = Lazy::new(|| {
    let mut table = [0u16; 256];
    for (i, entry) in table.iter_mut().enumerate() {
        let mut crc = (i as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
        *entry = crc;
    }
    table
});

fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc = (crc << 8) ^ CRC16_TABLE[(((crc >> 8) ^ byte as u16) & 0xff) as usize];
    }
    crc
}

/// Map a key to its hash slot, honoring `{...}` hash tags: when the key
/// contains a non-empty brace-delimited section, only that section is
/// hashed, so related keys can be pinned to one slot.
pub fn key_hash_slot(key: &[u8]) -> u16 {
    let hashed = match key.iter().position(|&b| b == b'{') {
        Some(open) => match key[open + 1..].iter().position(|&b| b == b'}') {
            Some(close) if close > 0 => &key[open + 1..open + 1 + close],
            _ => key,
        },
        None => key,
    };
    crc16(hashed) % SLOT_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_hash_is_deterministic() {
        assert_eq!(key_hash(b"foo"), key_hash(b"foo"));
        assert_ne!(key_hash(b"foo"), key_hash(b"bar"));
    }

    #[test]
    fn slot_is_in_range() {
        for key in [&b"foo"[..], b"bar", b"{user}:1000", b""] {
            assert!(key_hash_slot(key) < SLOT_COUNT);
        }
    }

    #[test]
    fn hash_tags_pin_related_keys_to_one_slot() {
        assert_eq!(key_hash_slot(b"{user}:name"), key_hash_slot(b"{user}:age"));
        assert_eq!(key_hash_slot(b"{abc}0"), key_hash_slot(b"{abc}1"));
    }

    #[test]
    fn empty_hash_tag_hashes_whole_key() {
        // "{}" has no content between braces, so the full key is hashed.
        assert_ne!(key_hash_slot(b"{}:a"), key_hash_slot(b"{}:b"));
    }

    #[test]
    fn unclosed_brace_hashes_whole_key() {
        assert_ne!(key_hash_slot(b"{abc"), key_hash_slot(b"{abcd"));
    }
}

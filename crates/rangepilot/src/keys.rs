//! Key-type handling for range boundaries.
//!
//! The cluster can run with raw keys, table-encoded keys, or transactional
//! (memcomparable-encoded) keys. The merge checker needs to know whether two
//! adjacent ranges belong to the same table so it can refuse cross-table
//! merges when those are disabled.

use serde::{Deserialize, Serialize};

/// How user keys are encoded inside region boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Raw,
    Table,
    Txn,
}

impl Default for KeyType {
    fn default() -> Self {
        KeyType::Raw
    }
}

const TABLE_PREFIX: u8 = b't';
const TABLE_PREFIX_LEN: usize = 9; // 't' + 8-byte table id
const ENC_GROUP_SIZE: usize = 8;
const ENC_MARKER: u8 = 0xff;

/// Extract the table prefix of a boundary key, if it has one.
///
/// For `Txn` keys the memcomparable encoding is stripped first; for `Table`
/// keys the raw prefix is used; `Raw` keys never carry a table.
pub fn table_prefix(key_type: KeyType, key: &[u8]) -> Option<Vec<u8>> {
    let decoded;
    let key = match key_type {
        KeyType::Raw => return None,
        KeyType::Table => key,
        KeyType::Txn => {
            decoded = decode_memcomparable(key)?;
            &decoded[..]
        }
    };
    if key.len() >= TABLE_PREFIX_LEN && key[0] == TABLE_PREFIX {
        Some(key[..TABLE_PREFIX_LEN].to_vec())
    } else {
        None
    }
}

/// Whether two range boundaries sit inside the same table.
///
/// Keys without a table prefix (empty boundaries, meta keys) are treated as
/// belonging to no table, which never matches a real table prefix.
pub fn same_table(key_type: KeyType, a: &[u8], b: &[u8]) -> bool {
    match (table_prefix(key_type, a), table_prefix(key_type, b)) {
        (Some(pa), Some(pb)) => pa == pb,
        _ => false,
    }
}

// Memcomparable decoding: groups of 8 data bytes followed by a marker byte.
// A marker of 0xff means the group is full and decoding continues; any other
// marker encodes how many pad bytes were appended to the final group.
fn decode_memcomparable(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / (ENC_GROUP_SIZE + 1) * ENC_GROUP_SIZE);
    let mut rest = data;
    loop {
        if rest.len() < ENC_GROUP_SIZE + 1 {
            return None;
        }
        let (group, tail) = rest.split_at(ENC_GROUP_SIZE + 1);
        let marker = group[ENC_GROUP_SIZE];
        if marker == ENC_MARKER {
            out.extend_from_slice(&group[..ENC_GROUP_SIZE]);
            rest = tail;
            continue;
        }
        let pad = (ENC_MARKER - marker) as usize;
        if pad > ENC_GROUP_SIZE {
            return None;
        }
        out.extend_from_slice(&group[..ENC_GROUP_SIZE - pad]);
        return Some(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_memcomparable(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in data.chunks(ENC_GROUP_SIZE) {
            out.extend_from_slice(chunk);
            let pad = ENC_GROUP_SIZE - chunk.len();
            out.extend(std::iter::repeat(0u8).take(pad));
            out.push(ENC_MARKER - pad as u8);
        }
        if data.len() % ENC_GROUP_SIZE == 0 {
            out.extend_from_slice(&[0u8; ENC_GROUP_SIZE]);
            out.push(ENC_MARKER - ENC_GROUP_SIZE as u8);
        }
        out
    }

    fn table_key(table_id: u64) -> Vec<u8> {
        let mut key = vec![TABLE_PREFIX];
        key.extend_from_slice(&table_id.to_be_bytes());
        key
    }

    #[test]
    fn raw_keys_have_no_table() {
        assert_eq!(table_prefix(KeyType::Raw, b"t12345678"), None);
        assert!(!same_table(KeyType::Raw, b"a", b"a"));
    }

    #[test]
    fn table_keys_compare_by_prefix() {
        let mut a = table_key(5);
        a.extend_from_slice(b"_r\x01");
        let mut b = table_key(5);
        b.extend_from_slice(b"_r\x99");
        let c = table_key(6);
        assert!(same_table(KeyType::Table, &a, &b));
        assert!(!same_table(KeyType::Table, &a, &c));
        assert!(!same_table(KeyType::Table, &a, b""));
    }

    #[test]
    fn txn_keys_are_decoded_before_comparison() {
        let a = encode_memcomparable(&table_key(7));
        let b = encode_memcomparable(&table_key(7));
        let c = encode_memcomparable(&table_key(8));
        assert!(same_table(KeyType::Txn, &a, &b));
        assert!(!same_table(KeyType::Txn, &a, &c));
    }

    #[test]
    fn truncated_txn_key_is_ignored() {
        assert_eq!(table_prefix(KeyType::Txn, b"t\x00\x00"), None);
    }
}

//! Composite key encoding
//!
//! Every physical entry in an index column family is keyed by
//!
//! ```text
//! escaped(pk) || [ts_idx] || !ts (u64 big-endian)
//! ```
//!
//! - `escaped(pk)` rewrites each `0x00` byte as `0x00 0xFF` and terminates
//!   the pk with `0x00 0x01`. No escaped pk is a prefix of another and
//!   byte order of escaped pks equals byte order of the raw pks.
//! - `ts_idx` is present only for indexes with more than one time column.
//!   It sits before the timestamp, so one (pk, ts_idx) series is a single
//!   contiguous range.
//! - The timestamp is stored complemented, so larger timestamps sort first.
//!
//! For a fixed pk (and ts_idx) key order is strictly descending ts, and
//! entries of different pks never interleave.

const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xFF;
const TERMINATOR: u8 = 0x01;

const TS_LEN: usize = 8;

/// A decoded index key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    pub pk: Vec<u8>,
    pub ts: u64,
    pub ts_idx: Option<u8>,
}

/// Encode a key for an index with at most one time column
pub fn encode(pk: &[u8], ts: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(pk.len() + 2 + TS_LEN);
    push_escaped(&mut key, pk);
    key.extend_from_slice(&(!ts).to_be_bytes());
    key
}

/// Encode a key for an index with several time columns
pub fn encode_with_ts_idx(pk: &[u8], ts: u64, ts_idx: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(pk.len() + 3 + TS_LEN);
    push_escaped(&mut key, pk);
    key.push(ts_idx);
    key.extend_from_slice(&(!ts).to_be_bytes());
    key
}

/// Encode with an optional time column id
pub fn encode_opt(pk: &[u8], ts: u64, ts_idx: Option<u8>) -> Vec<u8> {
    match ts_idx {
        Some(ts_idx) => encode_with_ts_idx(pk, ts, ts_idx),
        None => encode(pk, ts),
    }
}

/// Decode a key produced by [`encode`] or [`encode_with_ts_idx`].
///
/// # Panics
///
/// Panics on malformed input. All keys in an index column family are
/// produced by this module, so a malformed key is a broken invariant.
pub fn decode(key: &[u8], has_ts_idx: bool) -> DecodedKey {
    let (pk, consumed) = unescape(key);
    let rest = &key[consumed..];

    let (ts_idx, ts_bytes) = if has_ts_idx {
        assert!(
            rest.len() == 1 + TS_LEN,
            "malformed index key: expected ts_idx and timestamp, found {} trailing bytes",
            rest.len()
        );
        (Some(rest[0]), &rest[1..])
    } else {
        assert!(
            rest.len() == TS_LEN,
            "malformed index key: expected timestamp, found {} trailing bytes",
            rest.len()
        );
        (None, rest)
    };

    let mut buf = [0u8; TS_LEN];
    buf.copy_from_slice(ts_bytes);
    DecodedKey {
        pk,
        ts: !u64::from_be_bytes(buf),
        ts_idx,
    }
}

/// Timestamp of an encoded key (its last eight bytes)
pub fn decode_ts(key: &[u8]) -> u64 {
    assert!(key.len() >= TS_LEN, "malformed index key: too short");
    let mut buf = [0u8; TS_LEN];
    buf.copy_from_slice(&key[key.len() - TS_LEN..]);
    !u64::from_be_bytes(buf)
}

/// Prefix shared by every key of `pk`, across all time columns
pub fn pk_prefix(pk: &[u8]) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(pk.len() + 2);
    push_escaped(&mut prefix, pk);
    prefix
}

/// Prefix shared by every key of one (pk, ts_idx) series
pub fn pk_ts_idx_prefix(pk: &[u8], ts_idx: u8) -> Vec<u8> {
    let mut prefix = pk_prefix(pk);
    prefix.push(ts_idx);
    prefix
}

/// Smallest key greater than every key starting with `prefix`.
///
/// Returns `None` when no such key exists (prefix of all `0xFF`).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut succ = prefix.to_vec();
    while let Some(last) = succ.pop() {
        if last < 0xFF {
            succ.push(last + 1);
            return Some(succ);
        }
    }
    None
}

fn push_escaped(out: &mut Vec<u8>, pk: &[u8]) {
    for &b in pk {
        if b == ESCAPE {
            out.push(ESCAPE);
            out.push(ESCAPED_ZERO);
        } else {
            out.push(b);
        }
    }
    out.push(ESCAPE);
    out.push(TERMINATOR);
}

fn unescape(key: &[u8]) -> (Vec<u8>, usize) {
    let mut pk = Vec::with_capacity(key.len());
    let mut i = 0;
    while i < key.len() {
        let b = key[i];
        if b != ESCAPE {
            pk.push(b);
            i += 1;
            continue;
        }
        match key.get(i + 1) {
            Some(&ESCAPED_ZERO) => {
                pk.push(0);
                i += 2;
            }
            Some(&TERMINATOR) => return (pk, i + 2),
            other => panic!("malformed index key: bad escape {:?} at byte {}", other, i),
        }
    }
    panic!("malformed index key: missing pk terminator");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_round_trip() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        for _ in 0..500 {
            let len = rng.gen_range(0..24);
            let pk: Vec<u8> = (0..len).map(|_| rng.gen_range(0..4u8)).collect();
            let ts: u64 = rng.gen();
            let ts_idx: u8 = rng.gen();

            let plain = decode(&encode(&pk, ts), false);
            assert_eq!(plain, DecodedKey { pk: pk.clone(), ts, ts_idx: None });

            let multi = decode(&encode_with_ts_idx(&pk, ts, ts_idx), true);
            assert_eq!(multi, DecodedKey { pk, ts, ts_idx: Some(ts_idx) });
        }
    }

    #[test]
    fn test_descending_ts_within_pk() {
        let pk = b"card\x00001";
        let mut keys: Vec<Vec<u8>> = [0u64, 1, 9, 1_000, u64::MAX - 1, u64::MAX]
            .iter()
            .map(|&ts| encode(pk, ts))
            .collect();
        let expected = keys.iter().rev().cloned().collect::<Vec<_>>();
        keys.sort();
        assert_eq!(keys, expected);
        assert_eq!(decode_ts(&keys[0]), u64::MAX);
        assert_eq!(decode_ts(&keys[5]), 0);
    }

    #[test]
    fn test_pks_never_interleave() {
        // "a" is a byte prefix of "a\x00" and "ab"; their ranges must stay disjoint
        let pks: [&[u8]; 4] = [b"a", b"a\x00", b"a\x00\x00", b"ab"];
        let mut keys = Vec::new();
        for (n, pk) in pks.iter().enumerate() {
            for ts in [0u64, 5, u64::MAX] {
                keys.push((encode(pk, ts), n));
            }
        }
        keys.sort();
        let order: Vec<usize> = keys.iter().map(|(_, n)| *n).collect();
        assert_eq!(order, vec![0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 3]);
    }

    #[test]
    fn test_ts_idx_series_contiguous() {
        let mut keys = vec![
            encode_with_ts_idx(b"k", 10, 1),
            encode_with_ts_idx(b"k", 20, 0),
            encode_with_ts_idx(b"k", 30, 1),
            encode_with_ts_idx(b"k", 5, 0),
        ];
        keys.sort();
        let decoded: Vec<(Option<u8>, u64)> =
            keys.iter().map(|k| (decode(k, true).ts_idx, decode(k, true).ts)).collect();
        assert_eq!(
            decoded,
            vec![(Some(0), 20), (Some(0), 5), (Some(1), 30), (Some(1), 10)]
        );

        let prefix = pk_ts_idx_prefix(b"k", 1);
        assert!(keys[2].starts_with(&prefix));
        assert!(!keys[1].starts_with(&prefix));
    }

    #[test]
    fn test_prefix_successor() {
        let prefix = pk_prefix(b"key");
        let succ = prefix_successor(&prefix).unwrap();
        assert!(encode(b"key", 0) < succ);
        assert!(encode(b"key", u64::MAX) < succ);
        assert!(encode(b"key2", u64::MAX) > succ);
        assert_eq!(prefix_successor(&[0x10, 0xFF]), Some(vec![0x11]));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
    }

    #[test]
    #[should_panic(expected = "malformed index key")]
    fn test_decode_malformed_panics() {
        decode(b"no-terminator", false);
    }
}

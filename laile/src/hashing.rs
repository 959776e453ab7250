//! 64-bit FNV-1a hashing and consistent-hash-ring range arithmetic.
//!
//! Every hashable identity in the system (delivery targets, virtual ring
//! nodes) is keyed by `FNV-1a(key)` reinterpreted as a signed 64-bit integer,
//! because the database stores keys as `BIGINT`. All ring ordering happens in
//! that signed domain — registration, the sorted ring query, and the claim
//! comparisons all agree, which is the only property a ring needs. A ring is
//! rotation-invariant, so signed ordering is just the unsigned circle entered
//! at a different point.

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a hash of the given bytes.
pub fn hash64(key: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in key {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Hash a string key into the signed domain used by the store.
pub fn hash_key(key: &str) -> i64 {
    hash64(key.as_bytes()) as i64
}

/// The ring key for one (webhook, forwarder) pairing.
pub fn target_hash(webhook_id: i64, forwarder_id: &str) -> i64 {
    hash_key(&format!("{webhook_id}{forwarder_id}"))
}

/// The ring key for one virtual node.
pub fn virtual_node_hash(node_name: &str, virtual_id: u32) -> i64 {
    hash_key(&format!("{node_name}:{virtual_id}"))
}

/// A half-open arc of the ring claimed by one virtual node.
///
/// A non-wrapping range covers `start <= k < end`. A wrapping range covers
/// `k >= start OR k < end` — the single arc that crosses the seam where the
/// sorted key space folds back onto itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashRange {
    pub start: i64,
    pub end: i64,
    pub wraps: bool,
}

impl HashRange {
    pub fn contains(&self, key: i64) -> bool {
        if self.wraps {
            key >= self.start || key < self.end
        } else {
            key >= self.start && key < self.end
        }
    }
}

/// First ring key strictly greater than `key`, or the ring's first key with
/// `wrapped = true` when `key` is at or past the end of the sorted ring.
///
/// `ring` must be sorted ascending.
pub fn range_end(key: i64, ring: &[i64]) -> (i64, bool) {
    let idx = ring.partition_point(|k| *k <= key);
    if idx < ring.len() {
        (ring[idx], false)
    } else {
        (ring[0], true)
    }
}

/// Derive the ranges owned by a node from the full sorted ring and the node's
/// own keys. Each owned key `h` yields the arc `[h, successor(h))`; the arc
/// whose successor wraps past the end of the sorted ring is flagged so the
/// claim query can split it into its two halves.
///
/// The union of every node's ranges covers the whole key space exactly once.
pub fn node_ranges(own_keys: &[i64], ring: &[i64]) -> Vec<HashRange> {
    if ring.is_empty() {
        return Vec::new();
    }

    own_keys
        .iter()
        .map(|&start| {
            let (end, wraps) = range_end(start, ring);
            HashRange { start, end, wraps }
        })
        .collect()
}

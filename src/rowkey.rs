//! Stable row fingerprints for duplicate detection.
//!
//! Duplicate detection is full-row equality: every column participates, keys
//! sorted, values rendered through the same distinct-key normalization used
//! elsewhere. Rows that differ only in a volatile column (an ingestion
//! timestamp, say) are therefore *not* duplicates. That is the documented
//! contract, not an oversight.

use xxhash_rust::xxh3::xxh3_64;

use crate::dataset::Row;
use crate::value::distinct_key;

/// Canonical `k=v` pairs joined by `|`, keys in sorted order.
pub fn stable_row_key(row: &Row) -> String {
    let mut parts = Vec::with_capacity(row.len());
    // Row is a BTreeMap, so iteration is already key-sorted.
    for (k, v) in row {
        parts.push(format!("{}={}", k, distinct_key(v)));
    }
    parts.join("|")
}

/// 64-bit digest of [`stable_row_key`]; what the duplicate scan actually
/// stores.
pub fn row_digest(row: &Row) -> u64 {
    xxh3_64(stable_row_key(row).as_bytes())
}

use crate::storage::ItemKey;

/// Computes a stable shard for an item key using FNV-1a.
///
/// Partition and sort key are hashed with a separator byte so that
/// `("ab", "c")` and `("a", "bc")` do not collide by construction.
pub fn stable_shard_for(key: &ItemKey, shard_count: u32) -> u32 {
    if shard_count == 0 {
        return 0;
    }
    let mut hash = 14695981039346656037u64;
    for byte in key.partition.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    hash ^= 0xff;
    hash = hash.wrapping_mul(1099511628211);
    for byte in key.sort.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    (hash % shard_count as u64) as u32
}

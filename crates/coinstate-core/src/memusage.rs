//! Approximate heap accounting for cache containers.

use std::collections::HashMap;
use std::mem::size_of;

/// Bytes held by a `HashMap`'s table: one slot per unit of capacity plus a
/// control byte per slot. Heap data owned by keys or values is not included.
pub fn hash_map_usage<K, V>(map: &HashMap<K, V>) -> usize {
    map.capacity() * (size_of::<K>() + size_of::<V>() + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_map_uses_nothing() {
        let map: HashMap<u64, u64> = HashMap::new();
        assert_eq!(hash_map_usage(&map), 0);
    }

    #[test]
    fn usage_tracks_capacity() {
        let map: HashMap<u64, u64> = HashMap::with_capacity(16);
        assert_eq!(hash_map_usage(&map), map.capacity() * 17);
    }
}

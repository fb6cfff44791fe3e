//! Thin aliases over the collection types used across the crate, kept in
//! one place so the concrete implementation can change without touching
//! call sites — the same role this module plays in the teacher crate.

use std::collections::HashMap as StdHashMap;
use std::collections::HashSet as StdHashSet;
use std::hash::Hash;

use linked_hash_map::LinkedHashMap;

/// A plain hash map. Aliased so a faster hasher can be swapped in later
/// without touching call sites.
pub type HashMap<K, V> = StdHashMap<K, V>;

/// A plain hash set.
pub type HashSet<K> = StdHashSet<K>;

/// A dense map keyed by a raw `u64`, for the hot, integer-keyed tables
/// (per-client last-reply bookkeeping) where the teacher crate reaches
/// for `intmap` over `std::collections::HashMap`.
pub type IntMap<V> = intmap::IntMap<V>;

/// A hash map that iterates in insertion order, used for the client
/// request queue: requests must be proposed in the order they were
/// admitted.
pub type OrderedMap<K, V> = LinkedHashMap<K, V>;

pub fn hash_map<K: Eq + Hash, V>() -> HashMap<K, V> {
    HashMap::new()
}

pub fn hash_map_capacity<K: Eq + Hash, V>(capacity: usize) -> HashMap<K, V> {
    HashMap::with_capacity(capacity)
}

pub fn ordered_map<K: Eq + Hash, V>() -> OrderedMap<K, V> {
    LinkedHashMap::new()
}

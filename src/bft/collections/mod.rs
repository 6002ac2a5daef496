//! Type aliases and constructors for the collection types used throughout
//! the crate.
//!
//! The hashing algorithm backing [`HashMap`] and [`HashSet`] is selectable
//! at build time, mirroring the `collections_randomstate_*` feature flags:
//! the (faster, non-DoS-resistant) `twox-hash` by default, or the standard
//! library's `RandomState` when `collections_randomstate_std` is enabled
//! instead. `OrderedMap` preserves insertion order, which the log and the
//! batching layer rely on to replay client requests in arrival order.

use std::collections::HashMap as StdHashMap;
use std::collections::HashSet as StdHashSet;
use std::hash::Hash;

use linked_hash_map::LinkedHashMap;

#[cfg(feature = "collections_randomstate_twox_hash")]
type RandomState = twox_hash::RandomXxHashBuilder64;

#[cfg(not(feature = "collections_randomstate_twox_hash"))]
type RandomState = std::collections::hash_map::RandomState;

/// A `HashMap` using this crate's selected hashing algorithm.
pub type HashMap<K, V> = StdHashMap<K, V, RandomState>;

/// A `HashSet` using this crate's selected hashing algorithm.
pub type HashSet<K> = StdHashSet<K, RandomState>;

/// A map preserving insertion order, used where client requests or
/// view-change evidence must be replayed in the order they arrived.
pub type OrderedMap<K, V> = LinkedHashMap<K, V, RandomState>;

/// Returns a new, empty [`HashMap`].
pub fn hash_map<K: Eq + Hash, V>() -> HashMap<K, V> {
    HashMap::with_hasher(RandomState::default())
}

/// Returns a new, empty [`HashMap`] with the given initial capacity.
pub fn hash_map_capacity<K: Eq + Hash, V>(capacity: usize) -> HashMap<K, V> {
    HashMap::with_capacity_and_hasher(capacity, RandomState::default())
}

/// Returns a new, empty [`HashSet`].
pub fn hash_set<K: Eq + Hash>() -> HashSet<K> {
    HashSet::with_hasher(RandomState::default())
}

/// Returns a new, empty [`HashSet`] with the given initial capacity.
pub fn hash_set_capacity<K: Eq + Hash>(capacity: usize) -> HashSet<K> {
    HashSet::with_capacity_and_hasher(capacity, RandomState::default())
}

/// Returns a new, empty [`OrderedMap`].
pub fn ordered_map<K: Eq + Hash, V>() -> OrderedMap<K, V> {
    OrderedMap::with_hasher(RandomState::default())
}

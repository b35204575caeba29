//! Consistent-hash placement ring.
//!
//! Each live storage contributes exactly one point to the ring, derived from
//! a fixed 128-bit digest of `"{prefix}{id}"`. Keys route to the first point
//! with a hash at or above the key's own, wrapping to the lowest point. One
//! point per storage keeps recovery simple: a dead storage's key space maps
//! contiguously to a single successor.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::StorageId;
use md5::{Digest, Md5};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[allow(missing_copy_implementations)]
pub enum Error {
    #[snafu(display("no live storage nodes in the ring"))]
    NoLiveStorage,
}

/// The placement ring: a sorted sequence of `(hash, storage_id)` points.
#[derive(Debug, Clone)]
pub struct Ring {
    prefix: String,
    points: Vec<(u128, StorageId)>,
}

impl Ring {
    /// An empty ring whose storage points are keyed by `"{prefix}{id}"`.
    ///
    /// The prefix is a fixed configuration constant, so placements are
    /// reproducible across restarts.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            points: Vec::new(),
        }
    }

    /// A ring pre-populated with the given storages.
    pub fn with_storages(
        prefix: impl Into<String>,
        ids: impl IntoIterator<Item = StorageId>,
    ) -> Self {
        let mut ring = Self::new(prefix);
        for id in ids {
            ring.add(id);
        }
        ring
    }

    /// The ring key a storage hashes under.
    pub fn ring_key(&self, id: StorageId) -> String {
        format!("{}{}", self.prefix, id)
    }

    /// Add a storage point. Adding an id already on the ring is a no-op, so
    /// every storage holds exactly one point.
    pub fn add(&mut self, id: StorageId) {
        if self.contains(id) {
            return;
        }
        let hash = hash_key(&self.ring_key(id));
        let at = self.points.partition_point(|&(h, _)| h < hash);
        self.points.insert(at, (hash, id));
    }

    /// Remove a storage point. Removing an unknown id is a no-op.
    pub fn remove(&mut self, id: StorageId) {
        self.points.retain(|&(_, sid)| sid != id);
    }

    pub fn contains(&self, id: StorageId) -> bool {
        self.points.iter().any(|&(_, sid)| sid == id)
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Route a key to its owning storage: the first point with
    /// `hash >= hash(key)`, wrapping to the lowest point.
    pub fn route(&self, key: &str) -> Result<StorageId, Error> {
        if self.points.is_empty() {
            return Err(Error::NoLiveStorage);
        }
        let hash = hash_key(key);
        let at = self.points.partition_point(|&(h, _)| h < hash);
        let (_, id) = self.points[at % self.points.len()];
        Ok(id)
    }

    /// Route the partition of storage `id` as if looking up its own ring
    /// key. With `id` removed this yields the natural ring successor.
    pub fn route_storage_key(&self, id: StorageId) -> Result<StorageId, Error> {
        self.route(&self.ring_key(id))
    }
}

fn hash_key(key: &str) -> u128 {
    u128::from_be_bytes(Md5::digest(key.as_bytes()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(ids: impl IntoIterator<Item = u32>) -> Vec<StorageId> {
        ids.into_iter().map(StorageId::new).collect()
    }

    #[test]
    fn routes_only_to_members() {
        let ring = Ring::with_storages("storage-", ids(0..5));
        for day in 1..=28 {
            let key = format!("{day:02}-06-2015");
            let target = ring.route(&key).unwrap();
            assert!(ring.contains(target), "{key} routed off-ring to {target}");
        }
    }

    #[test]
    fn placement_is_deterministic_regardless_of_insertion_order() {
        let keys = ["01-01-2000", "15-06-2015", "31-12-1999"];

        let forward = Ring::with_storages("storage-", ids(0..3));
        let routed: Vec<_> = keys.iter().map(|k| forward.route(k).unwrap()).collect();

        let reverse = Ring::with_storages("storage-", ids((0..3).rev()));
        let rerouted: Vec<_> = keys.iter().map(|k| reverse.route(k).unwrap()).collect();

        assert_eq!(routed, rerouted);
    }

    #[test]
    fn add_remove_history_does_not_matter() {
        let mut churned = Ring::with_storages("storage-", ids(0..4));
        churned.remove(StorageId::new(2));
        churned.add(StorageId::new(4));
        churned.add(StorageId::new(2));
        churned.remove(StorageId::new(4));

        let fresh = Ring::with_storages("storage-", ids(0..4));
        for day in 1..=28 {
            let key = format!("{day:02}-03-2011");
            assert_eq!(churned.route(&key).unwrap(), fresh.route(&key).unwrap());
        }
    }

    #[test]
    fn single_storage_owns_everything() {
        let ring = Ring::with_storages("storage-", ids([7]));
        assert_eq!(ring.route("01-01-2000").unwrap(), StorageId::new(7));
        assert_eq!(ring.route("31-12-2030").unwrap(), StorageId::new(7));
    }

    #[test]
    fn empty_ring_has_no_owner() {
        let ring = Ring::new("storage-");
        assert!(matches!(ring.route("01-01-2000"), Err(Error::NoLiveStorage)));
    }

    #[test]
    fn double_add_keeps_one_point_per_storage() {
        let mut ring = Ring::with_storages("storage-", ids(0..3));
        ring.add(StorageId::new(1));
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn remove_unknown_is_a_noop() {
        let mut ring = Ring::with_storages("storage-", ids(0..3));
        ring.remove(StorageId::new(9));
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn successor_is_stable_after_removal() {
        let mut ring = Ring::with_storages("storage-", ids(0..3));
        let dead = StorageId::new(1);
        ring.remove(dead);

        let successor = ring.route_storage_key(dead).unwrap();
        assert_ne!(successor, dead);
        assert!(ring.contains(successor));
        // routing again is stable
        assert_eq!(ring.route_storage_key(dead).unwrap(), successor);
    }
}

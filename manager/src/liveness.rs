//! Liveness bookkeeping: the three node sets, the failure counters, and the
//! ring, transitioned together so the invariants hold in one place.
//!
//! The pinger marks a round's targets pending and later reconciles whoever
//! never ponged; the pong listener clears pending entries as replies arrive.
//! A node that misses `max_retries` consecutive rounds is declared dead:
//! removed from the ring, never re-admitted.

use data_types::StorageId;
use observability_deps::tracing::info;
use sharder::Ring;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

/// What happened to an observed pong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PongOutcome {
    /// The node was awaiting a pong; counters reset.
    Accepted,
    /// The node is declared dead; dead nodes are never resurrected.
    IgnoredDead,
    /// No ping round was outstanding for this node.
    IgnoredUnexpected,
}

/// A death declared during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Death {
    pub id: StorageId,
    /// The ring successor adopting the dead node's partition, if any
    /// storage is left.
    pub successor: Option<StorageId>,
}

/// The manager's view of the cluster: ring plus liveness state, guarded by
/// one mutex at the call site.
#[derive(Debug)]
pub struct ClusterView {
    ring: Ring,
    live: BTreeSet<StorageId>,
    dead: BTreeSet<StorageId>,
    pending: BTreeMap<StorageId, Instant>,
    failed: BTreeMap<StorageId, u32>,
    max_retries: u32,
}

impl ClusterView {
    /// A view over freshly started storages: all live, all on the ring.
    pub fn new(
        hash_prefix: impl Into<String>,
        storages: impl IntoIterator<Item = StorageId>,
        max_retries: u32,
    ) -> Self {
        let live: BTreeSet<_> = storages.into_iter().collect();
        let ring = Ring::with_storages(hash_prefix, live.iter().copied());
        Self {
            ring,
            live,
            dead: BTreeSet::new(),
            pending: BTreeMap::new(),
            failed: BTreeMap::new(),
            max_retries,
        }
    }

    /// Route a data key to its owning storage.
    pub fn route(&self, key: &str) -> Result<StorageId, sharder::Error> {
        self.ring.route(key)
    }

    /// Start a ping round: mark every known node pending and return the live
    /// ones, which are the ones actually pinged. Dead nodes are marked only
    /// so stale pending state gets cleared during reconciliation.
    pub fn begin_ping_round(&mut self, now: Instant) -> Vec<StorageId> {
        for id in self.live.iter().chain(self.dead.iter()) {
            self.pending.insert(*id, now);
        }
        self.live.iter().copied().collect()
    }

    /// Record a pong from `id`.
    pub fn observe_pong(&mut self, id: StorageId) -> PongOutcome {
        if self.dead.contains(&id) {
            return PongOutcome::IgnoredDead;
        }
        if self.pending.remove(&id).is_none() {
            return PongOutcome::IgnoredUnexpected;
        }
        self.live.insert(id);
        self.failed.insert(id, 0);
        PongOutcome::Accepted
    }

    /// Finish a ping round: every live node still pending has missed one
    /// round; at `max_retries` consecutive misses it is declared dead.
    pub fn end_ping_round(&mut self) -> Vec<Death> {
        let mut deaths = Vec::new();
        for id in self.pending.keys().copied().collect::<Vec<_>>() {
            if self.dead.contains(&id) {
                self.pending.remove(&id);
                continue;
            }
            let misses = self.failed.entry(id).or_insert(0);
            *misses += 1;
            if *misses >= self.max_retries {
                deaths.push(self.declare_dead(id));
            }
        }
        deaths
    }

    fn declare_dead(&mut self, id: StorageId) -> Death {
        self.live.remove(&id);
        self.pending.remove(&id);
        self.dead.insert(id);
        self.ring.remove(id);

        // with the dead point gone, its own ring key lands on the natural
        // successor
        let successor = self.ring.route_storage_key(id).ok();
        info!(node_id = %id, ?successor, "storage declared dead");
        Death { id, successor }
    }

    pub fn is_live(&self, id: StorageId) -> bool {
        self.live.contains(&id)
    }

    pub fn is_dead(&self, id: StorageId) -> bool {
        self.dead.contains(&id)
    }

    pub fn live(&self) -> impl Iterator<Item = StorageId> + '_ {
        self.live.iter().copied()
    }

    pub fn dead(&self) -> impl Iterator<Item = StorageId> + '_ {
        self.dead.iter().copied()
    }

    pub fn ring_contains(&self, id: StorageId) -> bool {
        self.ring.contains(id)
    }

    /// Consecutive missed rounds for `id`, for logs and tests.
    pub fn failed_count(&self, id: StorageId) -> u32 {
        self.failed.get(&id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(n: u32, max_retries: u32) -> ClusterView {
        ClusterView::new("storage-", (0..n).map(StorageId::new), max_retries)
    }

    fn run_silent_round(view: &mut ClusterView) -> Vec<Death> {
        view.begin_ping_round(Instant::now());
        view.end_ping_round()
    }

    #[test]
    fn death_takes_max_retries_consecutive_misses() {
        let mut v = view(3, 3);
        let id = StorageId::new(1);

        for round in 1..3 {
            assert!(run_silent_round(&mut v).is_empty());
            assert_eq!(v.failed_count(id), round);
            assert!(v.is_live(id));
        }

        let deaths = run_silent_round(&mut v);
        // every node was silent, so all three die this round
        assert_eq!(deaths.len(), 3);
        assert!(v.is_dead(id));
        assert!(!v.ring_contains(id));
    }

    #[test]
    fn a_pong_resets_the_failure_counter() {
        let mut v = view(2, 3);
        let flaky = StorageId::new(0);
        let healthy = StorageId::new(1);

        for _ in 0..2 {
            v.begin_ping_round(Instant::now());
            assert_eq!(v.observe_pong(healthy), PongOutcome::Accepted);
            v.end_ping_round();
        }
        assert_eq!(v.failed_count(flaky), 2);
        assert_eq!(v.failed_count(healthy), 0);

        // one pong wipes the accumulated misses
        v.begin_ping_round(Instant::now());
        assert_eq!(v.observe_pong(flaky), PongOutcome::Accepted);
        assert_eq!(v.observe_pong(healthy), PongOutcome::Accepted);
        v.end_ping_round();
        assert_eq!(v.failed_count(flaky), 0);

        // so death needs max_retries consecutive misses again
        for _ in 0..2 {
            v.begin_ping_round(Instant::now());
            assert_eq!(v.observe_pong(healthy), PongOutcome::Accepted);
            assert!(v.end_ping_round().is_empty());
        }
        assert!(v.is_live(flaky));
    }

    #[test]
    fn a_dead_node_is_never_resurrected() {
        let mut v = view(3, 1);
        let dying = StorageId::new(2);

        v.begin_ping_round(Instant::now());
        for survivor in [0, 1] {
            v.observe_pong(StorageId::new(survivor));
        }
        let deaths = v.end_ping_round();
        assert_eq!(deaths.len(), 1);
        assert_eq!(deaths[0].id, dying);
        assert!(!v.ring_contains(dying));

        // the late pong is ignored
        assert_eq!(v.observe_pong(dying), PongOutcome::IgnoredDead);
        assert!(v.is_dead(dying));
        assert!(!v.is_live(dying));
        assert!(!v.ring_contains(dying));

        // even after it is marked pending again in the next round
        v.begin_ping_round(Instant::now());
        assert_eq!(v.observe_pong(dying), PongOutcome::IgnoredDead);
        let deaths = v.end_ping_round();
        assert!(deaths.iter().all(|d| d.id != dying), "no double declaration");
    }

    #[test]
    fn unexpected_pongs_are_ignored() {
        let mut v = view(1, 3);
        assert_eq!(
            v.observe_pong(StorageId::new(0)),
            PongOutcome::IgnoredUnexpected
        );
        assert_eq!(
            v.observe_pong(StorageId::new(9)),
            PongOutcome::IgnoredUnexpected
        );
    }

    #[test]
    fn successor_owns_the_dead_nodes_partition() {
        let mut v = view(3, 1);
        let dying = StorageId::new(1);

        v.begin_ping_round(Instant::now());
        v.observe_pong(StorageId::new(0));
        v.observe_pong(StorageId::new(2));
        let deaths = v.end_ping_round();
        assert_eq!(deaths.len(), 1);

        let successor = deaths[0].successor.expect("two storages remain");
        assert_ne!(successor, dying);
        assert!(v.is_live(successor));
        // the dead node's ring key now routes to its successor
        assert_eq!(v.route(&format!("storage-{dying}")).unwrap(), successor);
    }

    #[test]
    fn last_death_leaves_no_successor() {
        let mut v = view(1, 1);
        let deaths = run_silent_round(&mut v);
        assert_eq!(deaths.len(), 1);
        assert_eq!(deaths[0].successor, None);
        assert!(matches!(
            v.route("01-01-2000"),
            Err(sharder::Error::NoLiveStorage)
        ));
    }
}

//! In-memory authoritative cluster model.
//!
//! Holds the store map, the region map, the interval tree of regions by start
//! key, and the per-store subtrees (leader-of / follower-of / learner-of /
//! pending-of). Every mutation happens on the heartbeat path under one write
//! lock so readers always observe a region transition either fully applied or
//! not at all.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::ops::Bound;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use rand::seq::SliceRandom;

use crate::config::{ScheduleConfig, StoreLimitKind};
use crate::error::SchedError;
use crate::heartbeat::StoreHeartbeat;
use crate::placement::{RegionFit, RuleManager};
use crate::region::RegionInfo;
use crate::statistics::{FlowKind, HotPeerCache, StoresStats};
use crate::storage::MetaStore;
use crate::store::{StoreInfo, StoreState};

/// Whether replacing `old` with `new` requires rebuilding the per-store
/// subtrees, judged by leader, voter placement, learner placement and the
/// pending set.
pub fn should_remove_from_subtree(new: &RegionInfo, old: &RegionInfo) -> bool {
    new.leader.map(|l| l.id) != old.leader.map(|l| l.id)
        || new.voter_store_ids() != old.voter_store_ids()
        || new.learner_store_ids() != old.learner_store_ids()
        || new.pending_store_ids() != old.pending_store_ids()
}

/// Region id sets and size aggregates for one store.
#[derive(Debug, Default, Clone)]
struct StoreSubTree {
    leaders: HashSet<u64>,
    followers: HashSet<u64>,
    learners: HashSet<u64>,
    pending: HashSet<u64>,
    leader_size: u64,
    region_size: u64,
}

impl StoreSubTree {
    fn region_count(&self) -> usize {
        self.leaders.len() + self.followers.len() + self.learners.len()
    }

    fn is_empty(&self) -> bool {
        self.region_count() == 0
    }
}

#[derive(Default)]
struct ClusterCore {
    stores: HashMap<u64, StoreInfo>,
    regions: HashMap<u64, RegionInfo>,
    /// start key -> region id; ranges are non-overlapping.
    tree: BTreeMap<Vec<u8>, u64>,
    subtrees: HashMap<u64, StoreSubTree>,
    /// When a region's version last advanced (split/merge), for merge pacing.
    version_changed_at: HashMap<u64, Instant>,
}

impl ClusterCore {
    fn add_to_subtrees(&mut self, region: &RegionInfo) {
        let size = region.approximate_size;
        let leader_id = region.leader.map(|l| l.id);
        for peer in &region.peers {
            let sub = self.subtrees.entry(peer.store_id).or_default();
            if Some(peer.id) == leader_id {
                sub.leaders.insert(region.id);
                sub.leader_size += size;
            } else if peer.is_learner {
                sub.learners.insert(region.id);
            } else {
                sub.followers.insert(region.id);
            }
            sub.region_size += size;
        }
        for peer in &region.pending_peers {
            self.subtrees.entry(peer.store_id).or_default().pending.insert(region.id);
        }
    }

    fn remove_from_subtrees(&mut self, region: &RegionInfo) {
        let size = region.approximate_size;
        let leader_id = region.leader.map(|l| l.id);
        for peer in &region.peers {
            if let Some(sub) = self.subtrees.get_mut(&peer.store_id) {
                if Some(peer.id) == leader_id && sub.leaders.remove(&region.id) {
                    sub.leader_size = sub.leader_size.saturating_sub(size);
                }
                sub.followers.remove(&region.id);
                sub.learners.remove(&region.id);
                sub.region_size = sub.region_size.saturating_sub(size);
            }
        }
        for peer in &region.pending_peers {
            if let Some(sub) = self.subtrees.get_mut(&peer.store_id) {
                sub.pending.remove(&region.id);
            }
        }
    }

    /// Region ids whose range intersects `[start, end)`, in key order.
    fn overlapping_ids(&self, start: &[u8], end: &[u8]) -> Vec<u64> {
        let mut out = Vec::new();
        // The region whose range begins before `start` may still reach into
        // the queried range.
        if let Some((_, &id)) = self
            .tree
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(start)))
            .next_back()
        {
            if let Some(region) = self.regions.get(&id) {
                if region.end_key.is_empty() || region.end_key.as_slice() > start {
                    out.push(id);
                }
            }
        }
        for (key, &id) in self
            .tree
            .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
        {
            if !end.is_empty() && key.as_slice() >= end {
                break;
            }
            out.push(id);
        }
        out
    }

    /// Insert or replace a region, keeping tree and subtrees consistent.
    /// Returns the ids of other regions removed because the new range
    /// swallowed them.
    fn set_region(&mut self, region: RegionInfo) -> Vec<u64> {
        let mut removed = Vec::new();
        if let Some(old) = self.regions.get(&region.id).cloned() {
            self.tree.remove(&old.start_key);
            if should_remove_from_subtree(&region, &old)
                || old.approximate_size != region.approximate_size
            {
                self.remove_from_subtrees(&old);
                self.add_to_subtrees(&region);
            }
            if old.epoch.version != region.epoch.version {
                self.version_changed_at.insert(region.id, Instant::now());
            }
        } else {
            self.add_to_subtrees(&region);
        }

        for id in self.overlapping_ids(&region.start_key, &region.end_key) {
            if id == region.id {
                continue;
            }
            if let Some(old) = self.regions.remove(&id) {
                self.tree.remove(&old.start_key);
                self.remove_from_subtrees(&old);
                self.version_changed_at.remove(&id);
                removed.push(id);
            }
        }

        self.tree.insert(region.start_key.clone(), region.id);
        self.regions.insert(region.id, region);
        removed
    }

    fn remove_region(&mut self, region_id: u64) -> Option<RegionInfo> {
        let region = self.regions.remove(&region_id)?;
        if self.tree.get(&region.start_key) == Some(&region_id) {
            self.tree.remove(&region.start_key);
        }
        self.remove_from_subtrees(&region);
        self.version_changed_at.remove(&region_id);
        Some(region)
    }

    fn filled_store(&self, store: &StoreInfo) -> StoreInfo {
        let mut store = store.clone();
        if let Some(sub) = self.subtrees.get(&store.id) {
            store.leader_count = sub.leaders.len();
            store.region_count = sub.region_count();
            store.pending_peer_count = sub.pending.len();
            store.leader_size = sub.leader_size;
            store.region_size = sub.region_size;
        }
        store
    }
}

/// The shared cluster model. Mutations take the single write lock; reads
/// clone out so schedulers never hold the lock across a decision.
pub struct Cluster {
    core: RwLock<ClusterCore>,
    config: RwLock<ScheduleConfig>,
    rules: RuleManager,
    meta: Arc<dyn MetaStore>,
    stats: StoresStats,
    write_hot: HotPeerCache,
    read_hot: HotPeerCache,
    id_alloc: AtomicU64,
}

impl Cluster {
    pub fn new(config: ScheduleConfig, meta: Arc<dyn MetaStore>) -> Arc<Self> {
        Arc::new(Self {
            core: RwLock::new(ClusterCore::default()),
            config: RwLock::new(config),
            rules: RuleManager::new(Arc::clone(&meta)),
            meta,
            stats: StoresStats::new(),
            write_hot: HotPeerCache::new(FlowKind::Write),
            read_hot: HotPeerCache::new(FlowKind::Read),
            // Ids handed out to new peers; seeded high so they never collide
            // with ids assigned by the external allocator in tests.
            id_alloc: AtomicU64::new(1 << 32),
        })
    }

    pub fn config(&self) -> ScheduleConfig {
        self.config.read().unwrap().clone()
    }

    pub fn update_config(&self, f: impl FnOnce(&mut ScheduleConfig)) {
        f(&mut self.config.write().unwrap())
    }

    pub fn rules(&self) -> &RuleManager {
        &self.rules
    }

    pub fn stats(&self) -> &StoresStats {
        &self.stats
    }

    pub fn hot_cache(&self, kind: FlowKind) -> &HotPeerCache {
        match kind {
            FlowKind::Write => &self.write_hot,
            FlowKind::Read => &self.read_hot,
        }
    }

    pub fn alloc_id(&self) -> u64 {
        self.id_alloc.fetch_add(1, Ordering::Relaxed)
    }

    // ---- store operations ----

    pub fn put_store(&self, store: StoreInfo) {
        {
            let cfg = self.config.read().unwrap();
            for kind in [StoreLimitKind::AddPeer, StoreLimitKind::RemovePeer] {
                store.limit().reset_rate(kind, cfg.store_limit(store.id, kind));
            }
            if cfg.strictly_match_label {
                for label in &store.labels {
                    if !cfg.location_labels.contains(&label.key) {
                        tracing::warn!(store = store.id, label = %label.key,
                            "store label is not a configured location label");
                    }
                }
            }
        }
        self.persist_store_meta(&store);
        self.core.write().unwrap().stores.insert(store.id, store);
    }

    // Last-known store metadata survives coordinator restarts; persistence
    // failures only cost the next leader a heartbeat round.
    fn persist_store_meta(&self, store: &StoreInfo) {
        let meta = crate::storage::StoreMeta::from(store);
        let result = serde_json::to_string(&meta)
            .map_err(anyhow::Error::from)
            .and_then(|raw| self.meta.put(&crate::storage::store_key(store.id), raw));
        if let Err(err) = result {
            tracing::warn!(store = store.id, error = ?err, "failed to persist store metadata");
        }
    }

    pub fn cluster_version(&self) -> anyhow::Result<Option<String>> {
        self.meta.get(crate::storage::CLUSTER_VERSION_KEY)
    }

    pub fn set_cluster_version(&self, version: &str) -> anyhow::Result<()> {
        self.meta.put(crate::storage::CLUSTER_VERSION_KEY, version.to_string())
    }

    /// Retune one store's operation rate limit at runtime.
    pub fn set_store_limit(&self, store_id: u64, kind: StoreLimitKind, rate_per_min: f64) {
        self.update_config(|cfg| {
            let entry = cfg.store_limits.entry(store_id).or_default();
            match kind {
                StoreLimitKind::AddPeer => entry.add_peer = rate_per_min,
                StoreLimitKind::RemovePeer => entry.remove_peer = rate_per_min,
            }
        });
        if let Some(store) = self.get_store(store_id) {
            store.limit().reset_rate(kind, rate_per_min);
        }
    }

    pub fn get_store(&self, store_id: u64) -> Option<StoreInfo> {
        let core = self.core.read().unwrap();
        core.stores.get(&store_id).map(|s| core.filled_store(s))
    }

    pub fn get_stores(&self) -> Vec<StoreInfo> {
        let core = self.core.read().unwrap();
        core.stores.values().map(|s| core.filled_store(s)).collect()
    }

    pub fn set_store_state(&self, store_id: u64, state: StoreState) -> crate::error::Result<()> {
        let updated = {
            let mut core = self.core.write().unwrap();
            let store =
                core.stores.get_mut(&store_id).ok_or(SchedError::StoreNotFound(store_id))?;
            store.state = state;
            store.clone()
        };
        self.persist_store_meta(&updated);
        Ok(())
    }

    /// Move an offline store to tombstone, refusing while regions still
    /// reference it.
    pub fn try_bury_store(&self, store_id: u64) -> bool {
        let mut core = self.core.write().unwrap();
        let empty = core.subtrees.get(&store_id).map_or(true, |s| s.is_empty());
        if !empty {
            return false;
        }
        if let Some(store) = core.stores.get_mut(&store_id) {
            if store.state == StoreState::Offline {
                store.state = StoreState::Tombstone;
                return true;
            }
        }
        false
    }

    pub fn handle_store_heartbeat(&self, hb: &StoreHeartbeat) -> crate::error::Result<()> {
        let mut core = self.core.write().unwrap();
        let store = core.stores.get_mut(&hb.store_id).ok_or(SchedError::StoreNotFound(hb.store_id))?;
        store.last_heartbeat = Some(Instant::now());
        store.busy = hb.busy;
        store.capacity = hb.capacity;
        store.available = hb.available;
        store.used_size = hb.used_size;
        store.sending_snap_count = hb.sending_snap_count;
        store.receiving_snap_count = hb.receiving_snap_count;
        store.applying_snap_count = hb.applying_snap_count;
        drop(core);
        self.stats.observe(
            hb.store_id,
            hb.bytes_written,
            hb.keys_written,
            hb.bytes_read,
            hb.keys_read,
            hb.interval_secs,
        );
        Ok(())
    }

    // ---- region operations ----

    pub fn get_region(&self, region_id: u64) -> Option<RegionInfo> {
        self.core.read().unwrap().regions.get(&region_id).cloned()
    }

    pub fn get_region_by_key(&self, key: &[u8]) -> Option<RegionInfo> {
        let core = self.core.read().unwrap();
        let (_, &id) = core
            .tree
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()?;
        core.regions.get(&id).filter(|r| r.contains_key(key)).cloned()
    }

    /// Upsert a region without epoch validation (bootstrap, tests, internal
    /// replays). Heartbeats go through `process_region_heartbeat`.
    pub fn set_region(&self, region: RegionInfo) -> Vec<u64> {
        self.core.write().unwrap().set_region(region)
    }

    pub fn remove_region(&self, region_id: u64) -> Option<RegionInfo> {
        let removed = self.core.write().unwrap().remove_region(region_id);
        if removed.is_some() {
            self.write_hot.remove_region(region_id);
            self.read_hot.remove_region(region_id);
        }
        removed
    }

    /// Fold one region heartbeat into the model. A stale epoch is dropped
    /// with `EpochStale`; the caller counts and absorbs it. Returns the ids
    /// of regions removed because the reported range swallowed them.
    pub fn process_region_heartbeat(&self, region: RegionInfo) -> crate::error::Result<Vec<u64>> {
        {
            let core = self.core.read().unwrap();
            if let Some(known) = core.regions.get(&region.id) {
                if region.epoch.is_stale(&known.epoch) {
                    return Err(SchedError::EpochStale);
                }
            }
        }
        self.write_hot.observe(&region);
        self.read_hot.observe(&region);
        Ok(self.core.write().unwrap().set_region(region))
    }

    pub fn region_count(&self) -> usize {
        self.core.read().unwrap().regions.len()
    }

    pub fn average_region_size(&self) -> u64 {
        let core = self.core.read().unwrap();
        if core.regions.is_empty() {
            return 0;
        }
        let total: u64 = core.regions.values().map(|r| r.approximate_size).sum();
        total / core.regions.len() as u64
    }

    pub fn get_region_stores(&self, region: &RegionInfo) -> Vec<StoreInfo> {
        let core = self.core.read().unwrap();
        region
            .peers
            .iter()
            .filter_map(|p| core.stores.get(&p.store_id).map(|s| core.filled_store(s)))
            .collect()
    }

    pub fn get_follower_stores(&self, region: &RegionInfo) -> Vec<StoreInfo> {
        let core = self.core.read().unwrap();
        region
            .followers()
            .filter_map(|p| core.stores.get(&p.store_id).map(|s| core.filled_store(s)))
            .collect()
    }

    pub fn get_store_region_count(&self, store_id: u64) -> usize {
        self.core.read().unwrap().subtrees.get(&store_id).map_or(0, |s| s.region_count())
    }

    pub fn get_store_leader_count(&self, store_id: u64) -> usize {
        self.core.read().unwrap().subtrees.get(&store_id).map_or(0, |s| s.leaders.len())
    }

    fn random_from(&self, ids: &HashSet<u64>) -> Option<RegionInfo> {
        let core = self.core.read().unwrap();
        let ids: Vec<u64> = ids.iter().copied().collect();
        ids.choose(&mut rand::thread_rng()).and_then(|id| core.regions.get(id).cloned())
    }

    pub fn random_leader_region(&self, store_id: u64) -> Option<RegionInfo> {
        let ids = self.core.read().unwrap().subtrees.get(&store_id)?.leaders.clone();
        self.random_from(&ids)
    }

    pub fn random_follower_region(&self, store_id: u64) -> Option<RegionInfo> {
        let ids = self.core.read().unwrap().subtrees.get(&store_id)?.followers.clone();
        self.random_from(&ids)
    }

    pub fn regions_overlapping_range(&self, start: &[u8], end: &[u8]) -> Vec<RegionInfo> {
        let core = self.core.read().unwrap();
        core.overlapping_ids(start, end)
            .into_iter()
            .filter_map(|id| core.regions.get(&id).cloned())
            .collect()
    }

    /// The regions immediately before and after `region` in key order,
    /// provided they are actually adjacent.
    pub fn adjacent_regions(&self, region: &RegionInfo) -> (Option<RegionInfo>, Option<RegionInfo>) {
        let core = self.core.read().unwrap();
        let prev = core
            .tree
            .range::<[u8], _>((
                Bound::Unbounded,
                Bound::Excluded(region.start_key.as_slice()),
            ))
            .next_back()
            .and_then(|(_, id)| core.regions.get(id))
            .filter(|r| r.end_key == region.start_key)
            .cloned();
        let next = if region.end_key.is_empty() {
            None
        } else {
            core.tree
                .get(&region.end_key)
                .and_then(|id| core.regions.get(id))
                .cloned()
        };
        (prev, next)
    }

    /// How long ago the region's version last advanced; `None` if it never
    /// did since this coordinator started tracking it.
    pub fn time_since_version_change(&self, region_id: u64) -> Option<std::time::Duration> {
        self.core.read().unwrap().version_changed_at.get(&region_id).map(|t| t.elapsed())
    }

    // ---- placement helpers ----

    pub fn fit_region(&self, region: &RegionInfo) -> RegionFit {
        let stores = self.get_region_stores(region);
        self.rules.fit_region(&self.config(), region, &stores)
    }

    pub fn is_region_replicated(&self, region: &RegionInfo) -> bool {
        let config = self.config();
        if config.placement_rules_enabled {
            self.fit_region(region).is_satisfied()
        } else {
            region.voters().count() == config.max_replicas && region.learners().count() == 0
        }
    }
}

/// A region with a leader, no down peers and no pending peers.
pub fn is_region_healthy(region: &RegionInfo) -> bool {
    region.leader.is_some() && region.down_peers.is_empty() && region.pending_peers.is_empty()
}

/// Like [`is_region_healthy`] but tolerating pending peers, for schedulers
/// that only move data.
pub fn is_region_healthy_allow_pending(region: &RegionInfo) -> bool {
    region.leader.is_some() && region.down_peers.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Peer;
    use crate::storage::MemoryStore;

    fn cluster() -> Arc<Cluster> {
        Cluster::new(ScheduleConfig::default(), Arc::new(MemoryStore::new()))
    }

    fn region(id: u64, range: (&[u8], &[u8]), leader_store: u64, followers: &[u64]) -> RegionInfo {
        let mut peers = vec![Peer::voter(id * 100, leader_store)];
        for (i, s) in followers.iter().enumerate() {
            peers.push(Peer::voter(id * 100 + 1 + i as u64, *s));
        }
        let leader = peers[0];
        let mut r = RegionInfo::new(id, peers, Some(leader))
            .with_range(range.0.to_vec(), range.1.to_vec());
        r.approximate_size = 10;
        r
    }

    #[test]
    fn subtree_counts_follow_region_updates() {
        let c = cluster();
        for id in 1..=3 {
            c.put_store(StoreInfo::new(id, ""));
        }
        c.set_region(region(1, (b"", b"b"), 1, &[2, 3]));
        c.set_region(region(2, (b"b", b"c"), 2, &[1, 3]));

        let s1 = c.get_store(1).unwrap();
        assert_eq!(s1.leader_count, 1);
        assert_eq!(s1.region_count, 2);
        assert_eq!(s1.region_size, 20);
        assert_eq!(s1.leader_size, 10);

        // Move region 1's leadership to store 2.
        let mut r1 = c.get_region(1).unwrap();
        let new_leader = r1.get_store_peer(2);
        r1 = r1.with_leader(new_leader);
        c.set_region(r1);
        assert_eq!(c.get_store(1).unwrap().leader_count, 0);
        assert_eq!(c.get_store(2).unwrap().leader_count, 2);
    }

    #[test]
    fn should_remove_from_subtree_compares_placement() {
        let old = region(1, (b"", b""), 1, &[2, 3]);
        let same = old.clone();
        assert!(!should_remove_from_subtree(&same, &old));
        let new_leader = old.clone().with_leader(old.get_store_peer(2));
        assert!(should_remove_from_subtree(&new_leader, &old));
        let pending = old.clone().with_pending_peers(vec![old.peers[1]]);
        assert!(should_remove_from_subtree(&pending, &old));
        let moved = old.clone().with_replaced_peer_store(3, 4);
        assert!(should_remove_from_subtree(&moved, &old));
    }

    #[test]
    fn stale_heartbeat_is_dropped() {
        let c = cluster();
        c.put_store(StoreInfo::new(1, ""));
        let mut r = region(1, (b"", b""), 1, &[]);
        r.epoch.conf_ver = 5;
        c.set_region(r.clone());

        r.epoch.conf_ver = 4;
        assert!(matches!(c.process_region_heartbeat(r.clone()), Err(SchedError::EpochStale)));
        r.epoch.conf_ver = 5;
        assert!(c.process_region_heartbeat(r).is_ok());
    }

    #[test]
    fn grown_range_swallows_overlapped_regions() {
        let c = cluster();
        c.put_store(StoreInfo::new(1, ""));
        c.set_region(region(1, (b"a", b"b"), 1, &[]));
        c.set_region(region(2, (b"b", b"c"), 1, &[]));

        let mut merged = region(1, (b"a", b"c"), 1, &[]);
        merged.epoch.version = 2;
        let removed = c.process_region_heartbeat(merged).unwrap();
        assert_eq!(removed, vec![2]);
        assert!(c.get_region(2).is_none());
        assert_eq!(c.get_store_region_count(1), 1);
    }

    #[test]
    fn range_lookup_and_adjacency() {
        let c = cluster();
        c.put_store(StoreInfo::new(1, ""));
        c.set_region(region(1, (b"", b"b"), 1, &[]));
        c.set_region(region(2, (b"b", b"d"), 1, &[]));
        c.set_region(region(3, (b"d", b""), 1, &[]));

        assert_eq!(c.get_region_by_key(b"c").unwrap().id, 2);
        let overlaps = c.regions_overlapping_range(b"a", b"c");
        assert_eq!(overlaps.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);

        let r2 = c.get_region(2).unwrap();
        let (prev, next) = c.adjacent_regions(&r2);
        assert_eq!(prev.unwrap().id, 1);
        assert_eq!(next.unwrap().id, 3);
        let r3 = c.get_region(3).unwrap();
        assert!(c.adjacent_regions(&r3).1.is_none());
    }

    #[test]
    fn store_metadata_and_version_round_trip() {
        let kv = Arc::new(MemoryStore::new());
        let c = Cluster::new(ScheduleConfig::default(), kv.clone());
        c.put_store(StoreInfo::new(7, "127.0.0.1:20167").with_labels(vec![("zone", "z1")]));
        c.set_store_state(7, StoreState::Offline).unwrap();

        let raw = kv.get(&crate::storage::store_key(7)).unwrap().unwrap();
        let meta: crate::storage::StoreMeta = serde_json::from_str(&raw).unwrap();
        assert_eq!(meta.address, "127.0.0.1:20167");
        assert_eq!(meta.state, StoreState::Offline);
        assert_eq!(meta.labels[0].key, "zone");

        assert!(c.cluster_version().unwrap().is_none());
        c.set_cluster_version("5.0.1").unwrap();
        assert_eq!(c.cluster_version().unwrap().as_deref(), Some("5.0.1"));
    }

    #[test]
    fn bury_requires_drained_store() {
        let c = cluster();
        let mut s = StoreInfo::new(1, "");
        s.state = StoreState::Offline;
        c.put_store(s);
        c.put_store(StoreInfo::new(2, ""));
        c.set_region(region(1, (b"", b""), 1, &[2]));
        assert!(!c.try_bury_store(1));
        c.remove_region(1);
        assert!(c.try_bury_store(1));
        assert!(c.get_store(1).unwrap().is_tombstone());
    }
}

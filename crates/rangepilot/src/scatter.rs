//! Region scatterer: pre-distributes replicas of freshly-split regions so a
//! bulk import does not land on a handful of stores.
//!
//! Placement is tracked per import group and per engine class; each decision
//! picks the store with the smallest group count. Groups are evicted after
//! sitting idle so long-lived coordinators do not accumulate dead batches.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

use crate::cluster::Cluster;
use crate::error::SchedError;
use crate::filter::{
    self, DistinctScoreFilter, EngineFilter, ExcludedFilter, Filter, OrdinaryEngineFilter,
    RuleFitFilter, StoreStateFilter, ENGINE_KEY,
};
use crate::operator::{OpKind, OpPriority, Operator, Step};
use crate::region::{Peer, RegionInfo};

const SCATTER_NAME: &str = "region-scatter";

/// Groups untouched for this long are dropped from the trackers.
const GROUP_IDLE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Default)]
struct SelectedInner {
    // group -> stores already used (only when check_exist)
    stores: HashMap<String, HashSet<u64>>,
    // group -> store -> placement count
    distribution: HashMap<String, HashMap<u64, u64>>,
    last_used: HashMap<String, Instant>,
}

/// Per-group placement counters.
///
/// With `check_exist` a store can only be chosen once per group until a
/// reset, which forces a strict round-robin over the stores.
struct SelectedStores {
    check_exist: bool,
    inner: Mutex<SelectedInner>,
}

impl SelectedStores {
    fn new(check_exist: bool) -> Self {
        Self { check_exist, inner: Mutex::new(SelectedInner::default()) }
    }

    fn put(&self, store_id: u64, group: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.last_used.insert(group.to_string(), Instant::now());
        if self.check_exist {
            let placed = inner.stores.entry(group.to_string()).or_default();
            if !placed.insert(store_id) {
                return false;
            }
        }
        *inner
            .distribution
            .entry(group.to_string())
            .or_default()
            .entry(store_id)
            .or_insert(0) += 1;
        true
    }

    fn reset(&self) {
        if !self.check_exist {
            return;
        }
        self.inner.lock().unwrap().stores.clear();
    }

    fn get(&self, store_id: u64, group: &str) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.distribution.get(group).and_then(|d| d.get(&store_id)).copied().unwrap_or(0)
    }

    /// Stores already used by the group, for the exclusion filter.
    fn used_stores(&self, group: &str) -> HashSet<u64> {
        if !self.check_exist {
            return HashSet::new();
        }
        let inner = self.inner.lock().unwrap();
        inner.stores.get(group).cloned().unwrap_or_default()
    }

    /// Drop groups idle past the TTL.
    fn gc(&self) {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<String> = inner
            .last_used
            .iter()
            .filter(|(_, t)| t.elapsed() > GROUP_IDLE_TTL)
            .map(|(g, _)| g.clone())
            .collect();
        for group in expired {
            tracing::debug!(group, "evicting idle scatter group");
            inner.stores.remove(&group);
            inner.distribution.remove(&group);
            inner.last_used.remove(&group);
        }
    }
}

/// Placement state for one engine class.
struct EngineContext {
    /// `None` selects ordinary engines, `Some` one specific special engine.
    engine: Option<String>,
    selected_peer: SelectedStores,
    selected_leader: SelectedStores,
}

impl EngineContext {
    fn new(engine: Option<String>) -> Self {
        Self {
            engine,
            selected_peer: SelectedStores::new(true),
            selected_leader: SelectedStores::new(false),
        }
    }
}

pub struct RegionScatterer {
    cluster: Arc<Cluster>,
    ordinary: EngineContext,
    special: Mutex<HashMap<String, Arc<EngineContext>>>,
}

impl RegionScatterer {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self {
            cluster,
            ordinary: EngineContext::new(None),
            special: Mutex::new(HashMap::new()),
        }
    }

    /// Relocate the region's replicas for even spread inside `group`.
    pub fn scatter(
        &self,
        region: &RegionInfo,
        group: &str,
    ) -> crate::error::Result<Operator> {
        if !self.cluster.is_region_replicated(region) {
            return Err(SchedError::UnreplicatedRegion(region.id));
        }
        let Some(leader) = region.leader else {
            return Err(SchedError::InternalInvariant(format!(
                "region {} has no leader to scatter around",
                region.id
            )));
        };

        self.ordinary.selected_peer.gc();
        self.ordinary.selected_leader.gc();

        let cfg = self.cluster.config();
        let ordinary_filter = OrdinaryEngineFilter::new(SCATTER_NAME);
        let mut ordinary_peers = Vec::new();
        let mut special_peers: HashMap<String, Vec<Peer>> = HashMap::new();
        for peer in &region.peers {
            let Some(store) = self.cluster.get_store(peer.store_id) else {
                return Err(SchedError::StoreNotFound(peer.store_id));
            };
            if ordinary_filter.target(&cfg, &store) {
                ordinary_peers.push(*peer);
            } else {
                let engine = store.label_value(ENGINE_KEY).unwrap_or_default().to_string();
                special_peers.entry(engine).or_default().push(*peer);
            }
        }

        // target store -> the existing peer kept there, or None for a new one
        let mut target_peers: HashMap<u64, Option<Peer>> = HashMap::new();
        self.scatter_with_same_engine(region, group, &ordinary_peers, &self.ordinary, &mut target_peers);

        // Leadership goes to the least-led store in the group; only ordinary
        // engines may lead.
        let ordinary_targets: Vec<u64> = target_peers.keys().copied().collect();
        let target_leader = self.select_leader_store(group, &ordinary_targets, &self.ordinary);

        for (engine, peers) in special_peers {
            let context = {
                let mut special = self.special.lock().unwrap();
                Arc::clone(
                    special
                        .entry(engine.clone())
                        .or_insert_with(|| Arc::new(EngineContext::new(Some(engine.clone())))),
                )
            };
            context.selected_peer.gc();
            context.selected_leader.gc();
            self.scatter_with_same_engine(region, group, &peers, &context, &mut target_peers);
        }

        let leader_store = target_leader.unwrap_or(leader.store_id);
        Ok(self.build_operator(region, &target_peers, leader_store))
    }

    fn scatter_with_same_engine(
        &self,
        region: &RegionInfo,
        group: &str,
        peers: &[Peer],
        context: &EngineContext,
        target_peers: &mut HashMap<u64, Option<Peer>>,
    ) {
        let mut stores = self.collect_available_stores(region, group, context);
        for peer in peers {
            if stores.is_empty() {
                // Every store was used once this round; start the next one.
                context.selected_peer.reset();
                stores = self.collect_available_stores(region, group, context);
            }
            if context.selected_peer.put(peer.store_id, group) {
                stores.remove(&peer.store_id);
                target_peers.insert(peer.store_id, Some(*peer));
                continue;
            }
            match self.select_store_to_replace(region, group, &stores, *peer, context) {
                Some(new_store) => {
                    stores.remove(&new_store);
                    context.selected_peer.put(new_store, group);
                    target_peers.insert(new_store, None);
                }
                None => {
                    target_peers.insert(peer.store_id, Some(*peer));
                }
            }
        }
    }

    /// Stores this engine class may still place into for the group.
    fn collect_available_stores(
        &self,
        region: &RegionInfo,
        group: &str,
        context: &EngineContext,
    ) -> HashMap<u64, crate::store::StoreInfo> {
        let cfg = self.cluster.config();
        let excluded =
            ExcludedFilter::new(SCATTER_NAME, Default::default(), region.store_ids());
        let state = StoreStateFilter {
            action_scope: SCATTER_NAME.into(),
            transfer_leader: false,
            move_region: true,
        };
        let used = ExcludedFilter::new(
            SCATTER_NAME,
            Default::default(),
            context.selected_peer.used_stores(group),
        );
        let engine_filter;
        let ordinary_filter;
        let mut filters: Vec<&dyn Filter> = vec![&excluded, &state, &used];
        match &context.engine {
            Some(engine) => {
                engine_filter = EngineFilter::new(SCATTER_NAME, vec![engine.clone()]);
                filters.push(&engine_filter);
            }
            None => {
                ordinary_filter = OrdinaryEngineFilter::new(SCATTER_NAME);
                filters.push(&ordinary_filter);
            }
        }

        self.cluster
            .get_stores()
            .into_iter()
            .filter(|s| !s.busy && filter::target(&cfg, s, &filters))
            .map(|s| (s.id, s))
            .collect()
    }

    /// The candidate with the smallest group count whose placement does not
    /// lower isolation; ties break randomly.
    fn select_store_to_replace(
        &self,
        region: &RegionInfo,
        group: &str,
        stores: &HashMap<u64, crate::store::StoreInfo>,
        old_peer: Peer,
        context: &EngineContext,
    ) -> Option<u64> {
        let cfg = self.cluster.config();
        let region_stores = self.cluster.get_region_stores(region);
        let source = region_stores.iter().find(|s| s.id == old_peer.store_id)?.clone();

        let rule_guard;
        let score_guard;
        let guard: &dyn Filter = if cfg.placement_rules_enabled {
            rule_guard = RuleFitFilter::new(SCATTER_NAME, &self.cluster, region, old_peer.store_id);
            &rule_guard
        } else {
            score_guard = DistinctScoreFilter::new(
                SCATTER_NAME,
                cfg.location_labels.clone(),
                &region_stores,
                &source,
            );
            &score_guard
        };

        let candidates: Vec<u64> = stores
            .values()
            .filter(|s| guard.target(&cfg, s))
            .map(|s| s.id)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let min_count = candidates
            .iter()
            .map(|id| context.selected_peer.get(*id, group))
            .min()
            .unwrap_or(0);
        let least: Vec<u64> = candidates
            .into_iter()
            .filter(|id| context.selected_peer.get(*id, group) == min_count)
            .collect();
        least.choose(&mut rand::thread_rng()).copied()
    }

    fn select_leader_store(
        &self,
        group: &str,
        candidate_stores: &[u64],
        context: &EngineContext,
    ) -> Option<u64> {
        let chosen = candidate_stores
            .iter()
            .min_by_key(|id| context.selected_leader.get(**id, group))
            .copied()?;
        context.selected_leader.put(chosen, group);
        Some(chosen)
    }

    /// Diff the current placement against the chosen one into a single
    /// high-priority operator.
    fn build_operator(
        &self,
        region: &RegionInfo,
        target_peers: &HashMap<u64, Option<Peer>>,
        leader_store: u64,
    ) -> Operator {
        let current = region.store_ids();
        let mut steps = Vec::new();
        for (&store_id, kept) in target_peers {
            if kept.is_none() && !current.contains(&store_id) {
                let peer_id = self.cluster.alloc_id();
                steps.push(Step::AddLearner { store_id, peer_id });
                steps.push(Step::PromoteLearner { store_id, peer_id });
            }
        }
        if region.leader_store_id() != Some(leader_store) {
            steps.push(Step::TransferLeader {
                from_store: region.leader_store_id().unwrap_or(0),
                to_store: leader_store,
            });
        }
        for peer in &region.peers {
            if !target_peers.contains_key(&peer.store_id) {
                steps.push(Step::RemovePeer { store_id: peer.store_id });
            }
        }
        let mut op = Operator::new(
            "scatter-region",
            region,
            OpKind::REGION | OpKind::ADMIN,
            steps,
            OpPriority::High,
        );
        if region.leader_store_id() != Some(leader_store) {
            op.kind |= OpKind::LEADER;
        }
        op
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleConfig;
    use crate::storage::MemoryStore;
    use crate::store::StoreInfo;
    use std::time::Instant;

    fn cluster_with_stores(n: u64) -> Arc<Cluster> {
        let cluster = Cluster::new(ScheduleConfig::default(), Arc::new(MemoryStore::new()));
        for id in 1..=n {
            let mut s = StoreInfo::new(id, format!("127.0.0.1:{}", 20160 + id));
            s.last_heartbeat = Some(Instant::now());
            s.capacity = 1000;
            s.available = 1000;
            cluster.put_store(s);
        }
        cluster
    }

    fn region(id: u64, stores: &[u64]) -> RegionInfo {
        let peers: Vec<Peer> =
            stores.iter().enumerate().map(|(i, s)| Peer::voter(id * 10 + i as u64, *s)).collect();
        let leader = peers[0];
        RegionInfo::new(id, peers, Some(leader)).with_range(vec![id as u8], vec![id as u8 + 1])
    }

    #[test]
    fn unreplicated_region_is_refused() {
        let cluster = cluster_with_stores(3);
        let scatterer = RegionScatterer::new(Arc::clone(&cluster));
        let r = region(1, &[1, 2]);
        cluster.set_region(r.clone());
        assert!(matches!(scatterer.scatter(&r, "g"), Err(SchedError::UnreplicatedRegion(1))));
    }

    #[test]
    fn selected_stores_round_robin_with_check_exist() {
        let sel = SelectedStores::new(true);
        assert!(sel.put(1, "g"));
        assert!(!sel.put(1, "g"));
        assert!(sel.put(2, "g"));
        assert_eq!(sel.get(1, "g"), 1);
        sel.reset();
        assert!(sel.put(1, "g"));
        assert_eq!(sel.get(1, "g"), 2);
        // Groups are independent.
        assert!(sel.put(1, "h"));
        assert_eq!(sel.get(1, "h"), 1);
    }

    #[test]
    fn scatter_spreads_replicas_across_the_group() {
        let cluster = cluster_with_stores(6);
        let scatterer = RegionScatterer::new(Arc::clone(&cluster));

        // Many co-located regions scatter to distinct stores per round.
        let mut placements: HashMap<u64, u64> = HashMap::new();
        let region_count = 8u64;
        for id in 1..=region_count {
            let r = region(id, &[1, 2, 3]);
            cluster.set_region(r.clone());
            let op = scatterer.scatter(&r, "batch-1").expect("scatter");
            assert_eq!(op.priority, OpPriority::High);
            // Count the final placement this operator aims at.
            let mut stores: HashSet<u64> = r.store_ids();
            for step in &op.steps {
                match step {
                    Step::AddLearner { store_id, .. } => {
                        stores.insert(*store_id);
                    }
                    Step::RemovePeer { store_id } => {
                        stores.remove(store_id);
                    }
                    _ => {}
                }
            }
            assert_eq!(stores.len(), 3, "replica count preserved");
            for store in stores {
                *placements.entry(store).or_insert(0) += 1;
            }
        }

        // K regions with R replicas over N stores: every store ends within
        // one of the even share.
        let expected = region_count * 3 / 6;
        for store_id in 1..=6 {
            let count = placements.get(&store_id).copied().unwrap_or(0);
            assert!(
                count.abs_diff(expected) <= 1,
                "store {store_id} got {count}, expected about {expected}"
            );
        }
    }

    #[test]
    fn special_engine_peers_stay_on_their_engine() {
        let cluster = cluster_with_stores(4);
        // Stores 5 and 6 run the columnar engine.
        for id in 5..=6 {
            let mut s = StoreInfo::new(id, format!("127.0.0.1:{}", 20160 + id))
                .with_labels(vec![(ENGINE_KEY, crate::filter::ENGINE_COLUMNAR)]);
            s.last_heartbeat = Some(Instant::now());
            s.capacity = 1000;
            s.available = 1000;
            cluster.put_store(s);
        }
        cluster.update_config(|cfg| cfg.max_replicas = 4);

        let scatterer = RegionScatterer::new(Arc::clone(&cluster));
        let r = region(1, &[1, 2, 3, 5]);
        cluster.set_region(r.clone());

        // Repeated scatters may move the columnar peer, but only within the
        // columnar stores; ordinary peers never land on 5 or 6.
        for _ in 0..4 {
            let op = scatterer.scatter(&r, "g").expect("scatter");
            for step in &op.steps {
                if let Step::AddLearner { store_id, .. } = step {
                    assert!(
                        [4, 6].contains(store_id),
                        "unexpected scatter destination {store_id}"
                    );
                }
            }
        }
    }
}

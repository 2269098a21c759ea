//! Checkers: corrective operators derived from placement invariants.
//!
//! Every region passes through the checker pipeline on its heartbeat; the
//! first checker to produce operators wins. The replica checker drives the
//! replica-count world, the rule checker the placement-rules world, and the
//! merge checker shrinks adjacent small ranges back together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::cluster::{is_region_healthy, Cluster};
use crate::config::{ScheduleConfig, REJECT_LEADER};
use crate::filter::{
    self, DistinctScoreFilter, ExcludedFilter, Filter, HealthFilter, PendingPeerCountFilter,
    RuleFitFilter, SnapshotCountFilter, StateFilter, StorageThresholdFilter, StoreLimitFilter,
};
use crate::keys;
use crate::operator::{
    create_merge_operators, create_move_peer_operator, create_promote_learner_operator,
    create_remove_peer_operator, create_replace_peer_operator, OpKind, Operator, Step,
};
use crate::placement::{distinct_score, match_label_constraints, RuleRole};
use crate::region::{Peer, RegionInfo};
use crate::store::StoreInfo;

/// Runs every checker in order and returns the first non-empty plan.
pub struct CheckerController {
    cluster: Arc<Cluster>,
    learner: LearnerChecker,
    replica: ReplicaChecker,
    rule: RuleChecker,
    merge: MergeChecker,
}

impl CheckerController {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self {
            learner: LearnerChecker { cluster: Arc::clone(&cluster) },
            replica: ReplicaChecker::new(Arc::clone(&cluster)),
            rule: RuleChecker { cluster: Arc::clone(&cluster) },
            merge: MergeChecker::new(Arc::clone(&cluster)),
            cluster,
        }
    }

    pub fn check(&self, region: &RegionInfo) -> Vec<Operator> {
        if let Some(op) = self.learner.check(region) {
            return vec![op];
        }
        let repaired = if self.cluster.config().placement_rules_enabled {
            self.rule.check(region)
        } else {
            self.replica.check(region)
        };
        if let Some(op) = repaired {
            return vec![op];
        }
        self.merge.check(region)
    }
}

/// Promotes learners that have caught up (reported no longer pending).
pub struct LearnerChecker {
    cluster: Arc<Cluster>,
}

impl LearnerChecker {
    pub fn check(&self, region: &RegionInfo) -> Option<Operator> {
        // Under placement rules a learner may be exactly what a rule asked
        // for; leave it to the rule checker.
        if self.cluster.config().placement_rules_enabled {
            return None;
        }
        let learner = region.learners().find(|p| !region.is_pending(p.id)).copied()?;
        Some(create_promote_learner_operator("promote-learner", region, learner))
    }
}

/// Enforces replica count and placement quality when placement rules are
/// disabled.
pub struct ReplicaChecker {
    cluster: Arc<Cluster>,
    /// When each (region, peer) was first seen pending, for the stuck-pending
    /// replacement threshold.
    pending_since: Mutex<HashMap<(u64, u64), Instant>>,
}

impl ReplicaChecker {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster, pending_since: Mutex::new(HashMap::new()) }
    }

    pub fn check(&self, region: &RegionInfo) -> Option<Operator> {
        let cfg = self.cluster.config();
        if let Some(op) = self.check_down_peer(&cfg, region) {
            return Some(op);
        }
        if let Some(op) = self.check_offline_peer(&cfg, region) {
            return Some(op);
        }
        if let Some(op) = self.check_pending_peer(&cfg, region) {
            return Some(op);
        }
        if let Some(op) = self.check_make_up_replica(&cfg, region) {
            return Some(op);
        }
        if let Some(op) = self.check_remove_extra_replica(&cfg, region) {
            return Some(op);
        }
        self.check_location_replacement(&cfg, region)
    }

    fn check_down_peer(&self, cfg: &ScheduleConfig, region: &RegionInfo) -> Option<Operator> {
        if !cfg.remove_down_replica {
            return None;
        }
        for down in &region.down_peers {
            let Some(store) = self.cluster.get_store(down.peer.store_id) else {
                tracing::debug!(store = down.peer.store_id, "down peer on unknown store");
                continue;
            };
            if store.down_time() < cfg.max_store_down_time
                || down.down_seconds < cfg.max_store_down_time.as_secs()
            {
                continue;
            }
            return self.replace_peer(cfg, region, down.peer, "replace-down-replica");
        }
        None
    }

    fn check_offline_peer(&self, cfg: &ScheduleConfig, region: &RegionInfo) -> Option<Operator> {
        if !cfg.replace_offline_replica {
            return None;
        }
        for peer in &region.peers {
            let Some(store) = self.cluster.get_store(peer.store_id) else {
                tracing::debug!(store = peer.store_id, "peer on unknown store");
                continue;
            };
            if store.is_up() {
                continue;
            }
            return self.replace_peer(cfg, region, *peer, "replace-offline-replica");
        }
        None
    }

    fn check_pending_peer(&self, cfg: &ScheduleConfig, region: &RegionInfo) -> Option<Operator> {
        let mut pending_since = self.pending_since.lock().unwrap();
        pending_since
            .retain(|(rid, pid), _| *rid != region.id || region.is_pending(*pid));
        for peer in &region.pending_peers {
            let first_seen =
                *pending_since.entry((region.id, peer.id)).or_insert_with(Instant::now);
            if first_seen.elapsed() < cfg.max_store_down_time {
                continue;
            }
            drop(pending_since);
            return self.replace_peer(cfg, region, *peer, "replace-pending-replica");
        }
        None
    }

    fn check_make_up_replica(&self, cfg: &ScheduleConfig, region: &RegionInfo) -> Option<Operator> {
        if !cfg.make_up_replica || region.peers.len() >= cfg.max_replicas {
            return None;
        }
        let (store_id, _) = self.select_store_to_add(cfg, region, None)?;
        let peer_id = self.cluster.alloc_id();
        Some(crate::operator::create_add_peer_operator(
            "make-up-replica",
            region,
            OpKind::REPLICA,
            store_id,
            peer_id,
        ))
    }

    fn check_remove_extra_replica(
        &self,
        cfg: &ScheduleConfig,
        region: &RegionInfo,
    ) -> Option<Operator> {
        if !cfg.remove_extra_replica || region.voters().count() <= cfg.max_replicas {
            return None;
        }
        let worst = self.select_worst_peer(cfg, region)?;
        Some(create_remove_peer_operator(
            "remove-extra-replica",
            region,
            OpKind::REPLICA,
            worst.store_id,
        ))
    }

    fn check_location_replacement(
        &self,
        cfg: &ScheduleConfig,
        region: &RegionInfo,
    ) -> Option<Operator> {
        if !cfg.location_replacement || !is_region_healthy(region) {
            return None;
        }
        if region.voters().count() != cfg.max_replicas {
            return None;
        }
        let stores = self.cluster.get_region_stores(region);
        // The least isolated peer is the move candidate.
        let worst = region
            .peers
            .iter()
            .filter_map(|p| {
                let store = stores.iter().find(|s| s.id == p.store_id)?;
                Some((p, distinct_score(&cfg.location_labels, &stores, store)))
            })
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(p, _)| *p)?;
        let (store_id, improved) = self.select_store_to_add(cfg, region, Some(worst))?;
        if !improved {
            return None;
        }
        let peer_id = self.cluster.alloc_id();
        Some(create_move_peer_operator(
            "move-to-better-location",
            region,
            OpKind::REPLICA,
            worst.store_id,
            store_id,
            peer_id,
        ))
    }

    /// Replace `old` with a fresh replica on the best passing store. When the
    /// outgoing peer holds the leadership, leadership moves first to a voter
    /// whose store does not carry the `reject-leader` property.
    fn replace_peer(
        &self,
        cfg: &ScheduleConfig,
        region: &RegionInfo,
        old: Peer,
        desc: &str,
    ) -> Option<Operator> {
        let (store_id, _) = self.select_store_to_add(cfg, region, Some(old))?;
        let leader_to = if region.leader_store_id() == Some(old.store_id) {
            self.select_interim_leader(cfg, region, old.store_id)
        } else {
            None
        };
        let peer_id = self.cluster.alloc_id();
        Some(create_replace_peer_operator(
            desc,
            region,
            OpKind::REPLICA,
            old.store_id,
            store_id,
            peer_id,
            leader_to,
        ))
    }

    /// A voter store other than `exclude` that may accept leadership.
    fn select_interim_leader(
        &self,
        cfg: &ScheduleConfig,
        region: &RegionInfo,
        exclude: u64,
    ) -> Option<u64> {
        region
            .voters()
            .filter(|p| p.store_id != exclude)
            .filter_map(|p| self.cluster.get_store(p.store_id))
            .find(|s| s.is_up() && !cfg.check_label_property(REJECT_LEADER, &s.labels))
            .map(|s| s.id)
    }

    /// Best store to host a new replica, excluding stores the region already
    /// uses. Returns the store and whether it strictly improves isolation
    /// over `replacing`.
    fn select_store_to_add(
        &self,
        cfg: &ScheduleConfig,
        region: &RegionInfo,
        replacing: Option<Peer>,
    ) -> Option<(u64, bool)> {
        let scope = "replica-checker";
        let region_stores = self.cluster.get_region_stores(region);
        let state = StateFilter::new(scope);
        let health = HealthFilter::new(scope);
        let snapshot = SnapshotCountFilter::new(scope);
        let storage = StorageThresholdFilter::new(scope);
        let pending = PendingPeerCountFilter::new(scope);
        let limit = StoreLimitFilter::new(scope);
        let excluded = ExcludedFilter::new(scope, Default::default(), region.store_ids());
        let mut filters: Vec<&dyn Filter> =
            vec![&state, &health, &snapshot, &storage, &pending, &limit, &excluded];

        let rule_guard;
        let score_guard;
        let old_score;
        match replacing {
            Some(old) if cfg.placement_rules_enabled => {
                rule_guard = RuleFitFilter::new(scope, &self.cluster, region, old.store_id);
                filters.push(&rule_guard);
                old_score = 0.0;
            }
            Some(old) => {
                let source = region_stores.iter().find(|s| s.id == old.store_id).cloned();
                let others: Vec<StoreInfo> =
                    region_stores.iter().filter(|s| s.id != old.store_id).cloned().collect();
                old_score = source
                    .as_ref()
                    .map(|s| distinct_score(&cfg.location_labels, &others, s))
                    .unwrap_or(0.0);
                if let Some(source) = source {
                    score_guard = DistinctScoreFilter::new(
                        scope,
                        cfg.location_labels.clone(),
                        &region_stores,
                        &source,
                    );
                    filters.push(&score_guard);
                }
            }
            None => old_score = 0.0,
        }

        let candidates = self.cluster.get_stores();
        let others: Vec<StoreInfo> = match replacing {
            Some(old) => region_stores.iter().filter(|s| s.id != old.store_id).cloned().collect(),
            None => region_stores.clone(),
        };
        let best = candidates
            .iter()
            .filter(|s| filter::target(cfg, s, &filters))
            .map(|s| (s, distinct_score(&cfg.location_labels, &others, s)))
            .max_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.0.region_count.cmp(&a.0.region_count))
            })?;
        Some((best.0.id, best.1 > old_score))
    }

    /// The most expendable peer: offline or down stores first, then lowest
    /// isolation, then the most loaded store.
    fn select_worst_peer(&self, cfg: &ScheduleConfig, region: &RegionInfo) -> Option<Peer> {
        let stores = self.cluster.get_region_stores(region);
        region
            .peers
            .iter()
            .filter_map(|p| {
                let store = stores.iter().find(|s| s.id == p.store_id)?;
                let unhealthy = !store.is_up() || store.down_time() > cfg.max_store_down_time;
                let score = distinct_score(&cfg.location_labels, &stores, store);
                Some((p, unhealthy, score, store.region_count))
            })
            .max_by(|a, b| {
                a.1.cmp(&b.1)
                    .then(b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
                    .then(a.3.cmp(&b.3))
            })
            .map(|(p, ..)| *p)
    }
}

/// Placement-rules counterpart of the replica checker.
pub struct RuleChecker {
    cluster: Arc<Cluster>,
}

impl RuleChecker {
    pub fn check(&self, region: &RegionInfo) -> Option<Operator> {
        let cfg = self.cluster.config();
        let fit = self.cluster.fit_region(region);

        // Replace rule peers sitting on dead or leaving stores.
        for rule_fit in &fit.rule_fits {
            for peer in &rule_fit.peers {
                let Some(store) = self.cluster.get_store(peer.store_id) else { continue };
                let gone = (!store.is_up() && cfg.replace_offline_replica)
                    || (store.down_time() > cfg.max_store_down_time && cfg.remove_down_replica);
                if !gone {
                    continue;
                }
                let store_id =
                    self.select_rule_store(&cfg, region, &rule_fit.rule, Some(*peer))?;
                let peer_id = self.cluster.alloc_id();
                return Some(create_replace_peer_operator(
                    "replace-rule-peer",
                    region,
                    OpKind::REPLICA,
                    peer.store_id,
                    store_id,
                    peer_id,
                    self.select_interim_leader(&cfg, region, peer.store_id),
                ));
            }
        }

        // Fill unsatisfied rules.
        for rule_fit in &fit.rule_fits {
            if rule_fit.is_satisfied() {
                continue;
            }
            let store_id = self.select_rule_store(&cfg, region, &rule_fit.rule, None)?;
            let peer_id = self.cluster.alloc_id();
            let op = if rule_fit.rule.role == RuleRole::Learner {
                Operator::new(
                    "add-rule-peer",
                    region,
                    OpKind::REPLICA | OpKind::REGION,
                    vec![Step::AddLearner { store_id, peer_id }],
                    crate::operator::OpPriority::Normal,
                )
            } else {
                crate::operator::create_add_peer_operator(
                    "add-rule-peer",
                    region,
                    OpKind::REPLICA,
                    store_id,
                    peer_id,
                )
            };
            return Some(op);
        }

        // Promote learners that a voter rule claimed.
        for rule_fit in &fit.rule_fits {
            if rule_fit.rule.role == RuleRole::Learner {
                continue;
            }
            if let Some(learner) = rule_fit.peers.iter().find(|p| p.is_learner) {
                return Some(create_promote_learner_operator("fix-peer-role", region, *learner));
            }
        }

        // Leader role rules: leadership must sit on one of the rule's peers.
        for rule_fit in &fit.rule_fits {
            if rule_fit.rule.role != RuleRole::Leader || rule_fit.peers.is_empty() {
                continue;
            }
            let leader_id = region.leader.map(|l| l.id);
            if rule_fit.peers.iter().any(|p| Some(p.id) == leader_id) {
                continue;
            }
            let from = region.leader_store_id()?;
            let to = rule_fit.peers[0].store_id;
            return Some(crate::operator::create_transfer_leader_operator(
                "fix-leader-role",
                region,
                from,
                to,
                OpKind::REPLICA,
            ));
        }

        // Drop peers no rule wants.
        if let Some(orphan) = fit.orphan_peers.first() {
            return Some(create_remove_peer_operator(
                "remove-orphan-peer",
                region,
                OpKind::REPLICA,
                orphan.store_id,
            ));
        }
        None
    }

    fn select_interim_leader(
        &self,
        cfg: &ScheduleConfig,
        region: &RegionInfo,
        exclude: u64,
    ) -> Option<u64> {
        region
            .voters()
            .filter(|p| p.store_id != exclude)
            .filter_map(|p| self.cluster.get_store(p.store_id))
            .find(|s| s.is_up() && !cfg.check_label_property(REJECT_LEADER, &s.labels))
            .map(|s| s.id)
    }

    /// A store able to host a peer for `rule`, excluding the region's current
    /// stores, with the best isolation against the rule's existing peers.
    fn select_rule_store(
        &self,
        cfg: &ScheduleConfig,
        region: &RegionInfo,
        rule: &crate::placement::Rule,
        replacing: Option<Peer>,
    ) -> Option<u64> {
        let scope = "rule-checker";
        let state = StateFilter::new(scope);
        let health = HealthFilter::new(scope);
        let snapshot = SnapshotCountFilter::new(scope);
        let storage = StorageThresholdFilter::new(scope);
        let limit = StoreLimitFilter::new(scope);
        let mut excluded_ids = region.store_ids();
        if let Some(old) = replacing {
            excluded_ids.insert(old.store_id);
        }
        let excluded = ExcludedFilter::new(scope, Default::default(), excluded_ids);
        let filters: Vec<&dyn Filter> =
            vec![&state, &health, &snapshot, &storage, &limit, &excluded];

        let rule_stores: Vec<StoreInfo> = self
            .cluster
            .get_stores()
            .into_iter()
            .filter(|s| match_label_constraints(s, &rule.label_constraints))
            .collect();
        let existing: Vec<StoreInfo> = region
            .peers
            .iter()
            .filter(|p| Some(p.id) != replacing.map(|r| r.id))
            .filter_map(|p| self.cluster.get_store(p.store_id))
            .collect();
        rule_stores
            .iter()
            .filter(|s| filter::target(cfg, s, &filters))
            .map(|s| (s.id, distinct_score(&rule.location_labels, &existing, s)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(id, _)| id)
    }
}

/// Merges adjacent small regions back together.
pub struct MergeChecker {
    cluster: Arc<Cluster>,
    /// Merging is suppressed until the coordinator has been up long enough
    /// for split history to be trustworthy.
    start_time: Instant,
}

impl MergeChecker {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster, start_time: Instant::now() }
    }

    /// Constructor with an explicit epoch for the suppression window, for
    /// coordinators that already know how long they have been leading.
    pub fn with_start_time(cluster: Arc<Cluster>, start_time: Instant) -> Self {
        Self { cluster, start_time }
    }

    pub fn check(&self, region: &RegionInfo) -> Vec<Operator> {
        let cfg = self.cluster.config();
        if self.start_time.elapsed() < cfg.split_merge_interval {
            return Vec::new();
        }
        if !self.mergeable(&cfg, region) {
            return Vec::new();
        }
        if region.approximate_size > cfg.max_merge_region_size
            || region.approximate_keys > cfg.max_merge_region_keys
        {
            return Vec::new();
        }

        let (prev, next) = self.cluster.adjacent_regions(region);
        // One-way merge only considers the right-hand sibling, which keeps
        // concurrent merges from chasing each other leftward.
        let candidates: Vec<RegionInfo> = if cfg.one_way_merge {
            next.into_iter().collect()
        } else {
            prev.into_iter().chain(next).collect()
        };
        let target = candidates
            .into_iter()
            .filter(|t| self.mergeable(&cfg, t))
            .filter(|t| {
                t.approximate_size + region.approximate_size <= cfg.max_merge_region_size
                    && t.approximate_keys + region.approximate_keys <= cfg.max_merge_region_keys
            })
            .filter(|t| self.allow_cross_boundary(&cfg, region, t))
            .min_by_key(|t| t.approximate_size);
        let Some(target) = target else { return Vec::new() };

        if region.store_ids() != target.store_ids() {
            return self.colocate_step(region, &target).into_iter().collect();
        }

        let (active, passive) = create_merge_operators("merge-adjacent-regions", region, &target);
        vec![active, passive]
    }

    fn mergeable(&self, cfg: &ScheduleConfig, region: &RegionInfo) -> bool {
        if region.approximate_size == 0 {
            // Never heartbeated a size; leave it alone.
            return false;
        }
        if !is_region_healthy(region) || !self.cluster.is_region_replicated(region) {
            return false;
        }
        match self.cluster.time_since_version_change(region.id) {
            Some(age) if age < cfg.split_merge_interval => false,
            _ => true,
        }
    }

    fn allow_cross_boundary(
        &self,
        cfg: &ScheduleConfig,
        region: &RegionInfo,
        target: &RegionInfo,
    ) -> bool {
        if cfg.cross_table_merge {
            return true;
        }
        match cfg.key_type {
            crate::keys::KeyType::Raw => true,
            kt => keys::same_table(kt, &region.start_key, &target.start_key),
        }
    }

    /// Move one of the region's peers onto a store the target uses, working
    /// toward identical placement so the merge proper can follow.
    fn colocate_step(&self, region: &RegionInfo, target: &RegionInfo) -> Option<Operator> {
        let region_stores = region.store_ids();
        let target_stores = target.store_ids();
        let from = region.peers.iter().find(|p| !target_stores.contains(&p.store_id))?;
        let to = target_stores.iter().find(|id| !region_stores.contains(id))?;
        let peer_id = self.cluster.alloc_id();
        Some(create_move_peer_operator(
            "merge-colocate-peer",
            region,
            OpKind::MERGE,
            from.store_id,
            *to,
            peer_id,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LabelPropertyRule;
    use crate::storage::MemoryStore;
    use crate::store::StoreState;
    use std::time::Duration;

    fn cluster() -> Arc<Cluster> {
        Cluster::new(ScheduleConfig::default(), Arc::new(MemoryStore::new()))
    }

    fn live_store(id: u64) -> StoreInfo {
        let mut s = StoreInfo::new(id, format!("127.0.0.1:{}", 20160 + id));
        s.last_heartbeat = Some(Instant::now());
        s.capacity = 1000;
        s.available = 1000;
        s
    }

    // Ranges are derived from the id so sibling ids are adjacent and regions
    // never overlap each other in the tree.
    fn put_region(cluster: &Cluster, id: u64, leader_store: u64, followers: &[u64]) -> RegionInfo {
        let mut peers = vec![Peer::voter(id * 10, leader_store)];
        for (i, s) in followers.iter().enumerate() {
            peers.push(Peer::voter(id * 10 + 1 + i as u64, *s));
        }
        let leader = peers[0];
        let mut region = RegionInfo::new(id, peers, Some(leader))
            .with_range(vec![id as u8], vec![id as u8 + 1]);
        region.approximate_size = 10;
        region.approximate_keys = 1000;
        cluster.set_region(region.clone());
        region
    }

    #[test]
    fn learner_checker_promotes_caught_up_learner() {
        let c = cluster();
        for id in 1..=3 {
            c.put_store(live_store(id));
        }
        let peers = vec![Peer::voter(1, 1), Peer::voter(2, 2), Peer::learner(3, 3)];
        let region = RegionInfo::new(1, peers.clone(), Some(peers[0]));
        c.set_region(region.clone());

        let checker = CheckerController::new(Arc::clone(&c));
        let ops = checker.check(&region);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].desc, "promote-learner");
        assert_eq!(
            ops[0].steps[0],
            Step::PromoteLearner { store_id: 3, peer_id: 3 }
        );

        // A still-pending learner is left alone.
        let pending = region.clone().with_pending_peers(vec![peers[2]]);
        c.set_region(pending.clone());
        assert!(checker.check(&pending).is_empty());
    }

    #[test]
    fn offline_peer_is_replaced() {
        let c = cluster();
        let mut s1 = live_store(1);
        s1.state = StoreState::Offline;
        c.put_store(s1);
        for id in 2..=4 {
            c.put_store(live_store(id));
        }
        let region = put_region(&c, 1, 2, &[1, 3]);
        let checker = ReplicaChecker::new(Arc::clone(&c));
        let op = checker.check(&region).expect("replace expected");
        assert_eq!(op.desc, "replace-offline-replica");
        assert!(matches!(op.steps[0], Step::AddLearner { store_id: 4, .. }));
        assert!(matches!(op.steps[2], Step::RemovePeer { store_id: 1 }));
    }

    #[test]
    fn offline_leader_transfers_around_reject_leader() {
        let c = cluster();
        c.update_config(|cfg| {
            cfg.label_properties.insert(
                REJECT_LEADER.to_string(),
                vec![LabelPropertyRule { key: "noleader".into(), value: "true".into() }],
            );
        });
        let mut s1 = live_store(1);
        s1.state = StoreState::Offline;
        c.put_store(s1);
        c.put_store(live_store(2).with_labels(vec![("noleader", "true")]));
        c.put_store(live_store(3));
        c.put_store(live_store(4));
        let region = put_region(&c, 2, 1, &[2, 3]);

        let checker = ReplicaChecker::new(Arc::clone(&c));
        let op = checker.check(&region).expect("replace expected");
        assert_eq!(op.steps[0], Step::TransferLeader { from_store: 1, to_store: 3 });
        assert!(matches!(op.steps[1], Step::AddLearner { store_id: 4, .. }));
        assert!(matches!(op.steps[3], Step::RemovePeer { store_id: 1 }));
    }

    #[test]
    fn make_up_and_remove_extra() {
        let c = cluster();
        for id in 1..=4 {
            c.put_store(live_store(id));
        }
        let checker = ReplicaChecker::new(Arc::clone(&c));

        let short = put_region(&c, 1, 1, &[2]);
        let op = checker.check(&short).expect("make up expected");
        assert_eq!(op.desc, "make-up-replica");
        assert!(matches!(op.steps[0], Step::AddLearner { .. }));

        let extra = put_region(&c, 2, 1, &[2, 3, 4]);
        let op = checker.check(&extra).expect("remove extra expected");
        assert_eq!(op.desc, "remove-extra-replica");
    }

    #[test]
    fn option_gates_suppress_repairs() {
        let c = cluster();
        c.update_config(|cfg| {
            cfg.replace_offline_replica = false;
            cfg.make_up_replica = false;
        });
        let mut s1 = live_store(1);
        s1.state = StoreState::Offline;
        c.put_store(s1);
        for id in 2..=4 {
            c.put_store(live_store(id));
        }
        let checker = ReplicaChecker::new(Arc::clone(&c));
        let region = put_region(&c, 1, 2, &[1]);
        assert!(checker.check(&region).is_none());
    }

    #[test]
    fn merge_checker_pairs_small_colocated_neighbors() {
        let c = cluster();
        c.update_config(|cfg| cfg.split_merge_interval = Duration::from_secs(0));
        for id in 1..=3 {
            c.put_store(live_store(id));
        }
        let mut left = put_region(&c, 1, 1, &[2, 3]);
        left.approximate_size = 5;
        c.set_region(left.clone());
        let mut right = put_region(&c, 2, 1, &[2, 3]);
        right.approximate_size = 5;
        c.set_region(right.clone());

        let checker =
            MergeChecker::with_start_time(Arc::clone(&c), Instant::now() - Duration::from_secs(1));
        let ops = checker.check(&left);
        assert_eq!(ops.len(), 2);
        assert!(ops[0].kind.contains(OpKind::MERGE));
        assert_eq!(ops[0].region_id, 1);
        assert_eq!(ops[1].region_id, 2);
    }

    #[test]
    fn merge_respects_size_and_one_way() {
        let c = cluster();
        c.update_config(|cfg| {
            cfg.split_merge_interval = Duration::from_secs(0);
            cfg.max_merge_region_size = 8;
        });
        for id in 1..=3 {
            c.put_store(live_store(id));
        }
        let mut left = put_region(&c, 1, 1, &[2, 3]);
        left.approximate_size = 5;
        c.set_region(left.clone());
        let mut mid = put_region(&c, 2, 1, &[2, 3]);
        mid.approximate_size = 5;
        c.set_region(mid.clone());
        let mut right = put_region(&c, 3, 1, &[2, 3]);
        right.approximate_size = 2;
        c.set_region(right.clone());

        let checker =
            MergeChecker::with_start_time(Arc::clone(&c), Instant::now() - Duration::from_secs(1));
        // 5 + 5 exceeds the limit, so mid merges rightward with the small one.
        let ops = checker.check(&mid);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1].region_id, 3);

        // One-way merge refuses the left sibling.
        c.update_config(|cfg| cfg.one_way_merge = true);
        let ops = checker.check(&right);
        assert!(ops.is_empty());
    }

    #[test]
    fn merge_emits_colocation_move_first() {
        let c = cluster();
        c.update_config(|cfg| cfg.split_merge_interval = Duration::from_secs(0));
        for id in 1..=4 {
            c.put_store(live_store(id));
        }
        let mut left = put_region(&c, 1, 1, &[2, 3]);
        left.approximate_size = 5;
        c.set_region(left.clone());
        let mut right = put_region(&c, 2, 1, &[2, 4]);
        right.approximate_size = 5;
        c.set_region(right.clone());

        let checker =
            MergeChecker::with_start_time(Arc::clone(&c), Instant::now() - Duration::from_secs(1));
        let ops = checker.check(&left);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].desc, "merge-colocate-peer");
        assert!(matches!(ops[0].steps[0], Step::AddLearner { store_id: 4, .. }));
    }

    #[test]
    fn rule_checker_fills_and_trims_to_rules() {
        let c = cluster();
        c.update_config(|cfg| cfg.placement_rules_enabled = true);
        for id in 1..=4 {
            c.put_store(live_store(id));
        }
        c.rules()
            .set_rule(crate::placement::Rule {
                group_id: "default".into(),
                id: "default".into(),
                index: 1,
                override_group: false,
                start_key: vec![],
                end_key: vec![],
                role: RuleRole::Voter,
                count: 3,
                label_constraints: vec![],
                location_labels: vec![],
            })
            .unwrap();
        let checker = CheckerController::new(Arc::clone(&c));

        let short = put_region(&c, 1, 1, &[2]);
        let ops = checker.check(&short);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].desc, "add-rule-peer");

        let extra = put_region(&c, 2, 1, &[2, 3, 4]);
        let ops = checker.check(&extra);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].desc, "remove-orphan-peer");
    }
}

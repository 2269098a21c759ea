//! The small select-filter-emit schedulers: shuffles, evictions, label
//! enforcement, random merges, adjacent-region dispersal and range
//! scattering.

use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::cluster::{is_region_healthy, Cluster};
use crate::config::REJECT_LEADER;
use crate::controller::OperatorController;
use crate::filter::{self, ExcludedFilter, Filter, StoreStateFilter};
use crate::operator::{
    create_merge_operators, create_move_peer_operator, create_transfer_leader_operator, OpKind,
    Operator,
};
use crate::scatter::RegionScatterer;
use crate::scheduler::{Scheduler, SchedulerContext};
use crate::storage::scheduler_key;
use crate::store::StoreInfo;

pub const SHUFFLE_LEADER_TYPE: &str = "shuffle-leader";
pub const SHUFFLE_REGION_TYPE: &str = "shuffle-region";
pub const EVICT_LEADER_TYPE: &str = "evict-leader";
pub const LABEL_TYPE: &str = "label";
pub const RANDOM_MERGE_TYPE: &str = "random-merge";
pub const ADJACENT_REGION_TYPE: &str = "adjacent-region";
pub const SCATTER_RANGE_TYPE: &str = "scatter-range";

pub fn new_shuffle_leader(
    ctx: &SchedulerContext,
    _args: &[String],
) -> anyhow::Result<Box<dyn Scheduler>> {
    Ok(Box::new(ShuffleLeaderScheduler { controller: Arc::clone(&ctx.controller) }))
}

pub fn new_shuffle_region(
    ctx: &SchedulerContext,
    _args: &[String],
) -> anyhow::Result<Box<dyn Scheduler>> {
    Ok(Box::new(ShuffleRegionScheduler { controller: Arc::clone(&ctx.controller) }))
}

pub fn new_evict_leader(
    ctx: &SchedulerContext,
    args: &[String],
) -> anyhow::Result<Box<dyn Scheduler>> {
    let config = if args.is_empty() {
        match ctx.storage.get(&scheduler_key(EVICT_LEADER_TYPE))? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => EvictLeaderConfig::default(),
        }
    } else {
        let store_ids = args.iter().map(|a| a.parse::<u64>()).collect::<Result<_, _>>()?;
        let config = EvictLeaderConfig { store_ids };
        ctx.storage.put(&scheduler_key(EVICT_LEADER_TYPE), serde_json::to_string(&config)?)?;
        config
    };
    Ok(Box::new(EvictLeaderScheduler { controller: Arc::clone(&ctx.controller), config }))
}

pub fn new_label(ctx: &SchedulerContext, _args: &[String]) -> anyhow::Result<Box<dyn Scheduler>> {
    Ok(Box::new(LabelScheduler { controller: Arc::clone(&ctx.controller) }))
}

pub fn new_random_merge(
    ctx: &SchedulerContext,
    _args: &[String],
) -> anyhow::Result<Box<dyn Scheduler>> {
    Ok(Box::new(RandomMergeScheduler { controller: Arc::clone(&ctx.controller) }))
}

pub fn new_adjacent_region(
    ctx: &SchedulerContext,
    args: &[String],
) -> anyhow::Result<Box<dyn Scheduler>> {
    let leader_limit =
        args.first().and_then(|a| a.parse().ok()).unwrap_or(DEFAULT_ADJACENT_LEADER_LIMIT);
    let peer_limit =
        args.get(1).and_then(|a| a.parse().ok()).unwrap_or(DEFAULT_ADJACENT_PEER_LIMIT);
    Ok(Box::new(AdjacentRegionScheduler {
        controller: Arc::clone(&ctx.controller),
        leader_limit,
        peer_limit,
    }))
}

pub fn new_scatter_range(
    ctx: &SchedulerContext,
    args: &[String],
) -> anyhow::Result<Box<dyn Scheduler>> {
    let config = if args.len() >= 3 {
        let config = ScatterRangeConfig {
            start_key: args[0].as_bytes().to_vec(),
            end_key: args[1].as_bytes().to_vec(),
            range_name: args[2].clone(),
        };
        ctx.storage.put(
            &scheduler_key(&format!("{SCATTER_RANGE_TYPE}-{}", config.range_name)),
            serde_json::to_string(&config)?,
        )?;
        config
    } else {
        anyhow::bail!("scatter-range needs <start-key> <end-key> <range-name>");
    };
    let name = format!("scatter-range-{}", config.range_name);
    Ok(Box::new(ScatterRangeScheduler {
        name,
        config,
        scatterer: RegionScatterer::new(Arc::clone(ctx.controller.cluster())),
        controller: Arc::clone(&ctx.controller),
    }))
}

/// Moves a random leadership onto a random follower store; chaos tooling for
/// tests and drills.
pub struct ShuffleLeaderScheduler {
    controller: Arc<OperatorController>,
}

impl Scheduler for ShuffleLeaderScheduler {
    fn name(&self) -> &str {
        "shuffle-leader-scheduler"
    }

    fn scheduler_type(&self) -> &'static str {
        SHUFFLE_LEADER_TYPE
    }

    fn is_schedule_allowed(&self, cluster: &Cluster) -> bool {
        self.controller.operator_count(OpKind::LEADER) < cluster.config().leader_schedule_limit
    }

    fn schedule(&self, cluster: &Cluster) -> Vec<Operator> {
        let cfg = cluster.config();
        let state = StoreStateFilter {
            action_scope: self.name().into(),
            transfer_leader: true,
            move_region: false,
        };
        let filters: Vec<&dyn Filter> = vec![&state];
        let candidates = filter::select_target_stores(&cluster.get_stores(), &filters, &cfg);
        let Some(target) = candidates.choose(&mut rand::thread_rng()) else {
            return Vec::new();
        };
        let Some(region) = cluster.random_follower_region(target.id) else {
            return Vec::new();
        };
        let Some(from) = region.leader_store_id() else { return Vec::new() };
        vec![create_transfer_leader_operator(
            "shuffle-leader",
            &region,
            from,
            target.id,
            OpKind::ADMIN,
        )]
    }
}

/// Moves a random region replica onto a random store.
pub struct ShuffleRegionScheduler {
    controller: Arc<OperatorController>,
}

impl Scheduler for ShuffleRegionScheduler {
    fn name(&self) -> &str {
        "shuffle-region-scheduler"
    }

    fn scheduler_type(&self) -> &'static str {
        SHUFFLE_REGION_TYPE
    }

    fn is_schedule_allowed(&self, cluster: &Cluster) -> bool {
        self.controller.operator_count(OpKind::REGION) < cluster.config().region_schedule_limit
    }

    fn schedule(&self, cluster: &Cluster) -> Vec<Operator> {
        let cfg = cluster.config();
        let source_state = StoreStateFilter {
            action_scope: self.name().into(),
            transfer_leader: false,
            move_region: true,
        };
        let source_filters: Vec<&dyn Filter> = vec![&source_state];
        let mut sources = filter::select_source_stores(&cluster.get_stores(), &source_filters, &cfg);
        sources.shuffle(&mut rand::thread_rng());

        for source in sources {
            let region = cluster
                .random_follower_region(source.id)
                .or_else(|| cluster.random_leader_region(source.id));
            let Some(region) = region else { continue };
            if !is_region_healthy(&region) {
                continue;
            }
            let target_state = StoreStateFilter {
                action_scope: self.name().into(),
                transfer_leader: false,
                move_region: true,
            };
            let excluded =
                ExcludedFilter::new(self.name(), Default::default(), region.store_ids());
            let filters: Vec<&dyn Filter> = vec![&target_state, &excluded];
            let candidates = filter::select_target_stores(&cluster.get_stores(), &filters, &cfg);
            let Some(target) = candidates.choose(&mut rand::thread_rng()) else { continue };
            let peer_id = cluster.alloc_id();
            return vec![create_move_peer_operator(
                "shuffle-region",
                &region,
                OpKind::ADMIN,
                source.id,
                target.id,
                peer_id,
            )];
        }
        Vec::new()
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct EvictLeaderConfig {
    pub store_ids: Vec<u64>,
}

/// Drains leaders off the configured stores.
pub struct EvictLeaderScheduler {
    controller: Arc<OperatorController>,
    config: EvictLeaderConfig,
}

impl Scheduler for EvictLeaderScheduler {
    fn name(&self) -> &str {
        "evict-leader-scheduler"
    }

    fn scheduler_type(&self) -> &'static str {
        EVICT_LEADER_TYPE
    }

    fn is_schedule_allowed(&self, cluster: &Cluster) -> bool {
        self.controller.operator_count(OpKind::LEADER) < cluster.config().leader_schedule_limit
    }

    fn schedule(&self, cluster: &Cluster) -> Vec<Operator> {
        let cfg = cluster.config();
        for &store_id in &self.config.store_ids {
            let Some(region) = cluster.random_leader_region(store_id) else { continue };
            let state = StoreStateFilter {
                action_scope: self.name().into(),
                transfer_leader: true,
                move_region: false,
            };
            let filters: Vec<&dyn Filter> = vec![&state];
            let candidates: Vec<StoreInfo> = cluster
                .get_follower_stores(&region)
                .into_iter()
                .filter(|s| {
                    region.get_store_peer(s.id).map_or(false, |p| !region.is_pending(p.id))
                })
                .filter(|s| filter::target(&cfg, s, &filters))
                .collect();
            let Some(target) = candidates.into_iter().min_by_key(|s| s.leader_count) else {
                continue;
            };
            return vec![create_transfer_leader_operator(
                "evict-leader",
                &region,
                store_id,
                target.id,
                OpKind::ADMIN,
            )];
        }
        Vec::new()
    }
}

/// Transfers leaders off stores carrying the `reject-leader` label property.
pub struct LabelScheduler {
    controller: Arc<OperatorController>,
}

impl Scheduler for LabelScheduler {
    fn name(&self) -> &str {
        "label-scheduler"
    }

    fn scheduler_type(&self) -> &'static str {
        LABEL_TYPE
    }

    fn is_schedule_allowed(&self, cluster: &Cluster) -> bool {
        self.controller.operator_count(OpKind::LEADER) < cluster.config().leader_schedule_limit
    }

    fn schedule(&self, cluster: &Cluster) -> Vec<Operator> {
        let cfg = cluster.config();
        let rejecting: Vec<StoreInfo> = cluster
            .get_stores()
            .into_iter()
            .filter(|s| cfg.check_label_property(REJECT_LEADER, &s.labels))
            .filter(|s| s.leader_count > 0)
            .collect();
        for store in rejecting {
            let Some(region) = cluster.random_leader_region(store.id) else { continue };
            let state = StoreStateFilter {
                action_scope: self.name().into(),
                transfer_leader: true,
                move_region: false,
            };
            let filters: Vec<&dyn Filter> = vec![&state];
            let candidates: Vec<StoreInfo> = cluster
                .get_follower_stores(&region)
                .into_iter()
                .filter(|s| {
                    region.get_store_peer(s.id).map_or(false, |p| !region.is_pending(p.id))
                })
                .filter(|s| filter::target(&cfg, s, &filters))
                .collect();
            let Some(target) = candidates.into_iter().min_by_key(|s| s.leader_count) else {
                continue;
            };
            return vec![create_transfer_leader_operator(
                "label-reject-leader",
                &region,
                store.id,
                target.id,
                OpKind::ADMIN,
            )];
        }
        Vec::new()
    }
}

/// Merges a random region with one of its neighbors; chaos tooling.
pub struct RandomMergeScheduler {
    controller: Arc<OperatorController>,
}

impl Scheduler for RandomMergeScheduler {
    fn name(&self) -> &str {
        "random-merge-scheduler"
    }

    fn scheduler_type(&self) -> &'static str {
        RANDOM_MERGE_TYPE
    }

    fn is_schedule_allowed(&self, cluster: &Cluster) -> bool {
        self.controller.operator_count(OpKind::MERGE) < cluster.config().merge_schedule_limit
    }

    fn schedule(&self, cluster: &Cluster) -> Vec<Operator> {
        let mut stores = cluster.get_stores();
        stores.shuffle(&mut rand::thread_rng());
        for store in stores {
            let Some(region) = cluster.random_leader_region(store.id) else { continue };
            if !is_region_healthy(&region) || !cluster.is_region_replicated(&region) {
                continue;
            }
            let (prev, next) = cluster.adjacent_regions(&region);
            let mut neighbors: Vec<_> = prev.into_iter().chain(next).collect();
            neighbors.shuffle(&mut rand::thread_rng());
            let target = neighbors.into_iter().find(|t| {
                is_region_healthy(t)
                    && cluster.is_region_replicated(t)
                    && t.store_ids() == region.store_ids()
            });
            let Some(target) = target else { continue };
            let (active, passive) = create_merge_operators("random-merge", &region, &target);
            return vec![active, passive];
        }
        Vec::new()
    }
}

const DEFAULT_ADJACENT_LEADER_LIMIT: u64 = 64;
const DEFAULT_ADJACENT_PEER_LIMIT: u64 = 8;

/// Disperses runs of adjacent regions whose leaders pile up on one store:
/// same placement gets a peer moved away, different placement a cheaper
/// leader transfer.
pub struct AdjacentRegionScheduler {
    controller: Arc<OperatorController>,
    leader_limit: u64,
    peer_limit: u64,
}

impl Scheduler for AdjacentRegionScheduler {
    fn name(&self) -> &str {
        "balance-adjacent-region-scheduler"
    }

    fn scheduler_type(&self) -> &'static str {
        ADJACENT_REGION_TYPE
    }

    fn is_schedule_allowed(&self, _cluster: &Cluster) -> bool {
        (self.leader_limit > 0 && self.controller.operator_count(OpKind::LEADER) < self.leader_limit)
            || (self.peer_limit > 0
                && self.controller.operator_count(OpKind::REGION) < self.peer_limit)
    }

    fn schedule(&self, cluster: &Cluster) -> Vec<Operator> {
        let cfg = cluster.config();
        let regions = cluster.regions_overlapping_range(b"", b"");
        for pair in regions.windows(2) {
            let (front, back) = (&pair[0], &pair[1]);
            if front.end_key != back.start_key || front.end_key.is_empty() {
                continue;
            }
            let (Some(leader_store), Some(back_leader)) =
                (front.leader_store_id(), back.leader_store_id())
            else {
                continue;
            };
            if leader_store != back_leader {
                continue;
            }
            if !is_region_healthy(front) {
                continue;
            }

            if front.store_ids() == back.store_ids() {
                // Same distribution: disperse by moving the front leader's
                // peer somewhere else entirely.
                if self.peer_limit == 0 {
                    continue;
                }
                let state = StoreStateFilter {
                    action_scope: self.name().into(),
                    transfer_leader: false,
                    move_region: true,
                };
                let excluded =
                    ExcludedFilter::new(self.name(), Default::default(), front.store_ids());
                let filters: Vec<&dyn Filter> = vec![&state, &excluded];
                let candidates =
                    filter::select_target_stores(&cluster.get_stores(), &filters, &cfg);
                let Some(target) = candidates.iter().min_by_key(|s| s.leader_count) else {
                    continue;
                };
                let peer_id = cluster.alloc_id();
                return vec![create_move_peer_operator(
                    "balance-adjacent-region",
                    front,
                    OpKind::ADMIN,
                    leader_store,
                    target.id,
                    peer_id,
                )];
            }

            // Different distribution: a leader transfer is enough to split
            // the run.
            if self.leader_limit == 0 {
                continue;
            }
            let state = StoreStateFilter {
                action_scope: self.name().into(),
                transfer_leader: true,
                move_region: false,
            };
            let filters: Vec<&dyn Filter> = vec![&state];
            let candidates: Vec<StoreInfo> = cluster
                .get_follower_stores(front)
                .into_iter()
                .filter(|s| filter::target(&cfg, s, &filters))
                .collect();
            let Some(target) = candidates.into_iter().min_by_key(|s| s.leader_count) else {
                continue;
            };
            return vec![create_transfer_leader_operator(
                "balance-adjacent-region",
                front,
                leader_store,
                target.id,
                OpKind::ADMIN,
            )];
        }
        Vec::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScatterRangeConfig {
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub range_name: String,
}

/// Continuously scatters the regions inside a configured key range.
pub struct ScatterRangeScheduler {
    name: String,
    config: ScatterRangeConfig,
    scatterer: RegionScatterer,
    controller: Arc<OperatorController>,
}

impl Scheduler for ScatterRangeScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheduler_type(&self) -> &'static str {
        SCATTER_RANGE_TYPE
    }

    fn is_schedule_allowed(&self, cluster: &Cluster) -> bool {
        self.controller.operator_count(OpKind::REGION) < cluster.config().region_schedule_limit
    }

    fn schedule(&self, cluster: &Cluster) -> Vec<Operator> {
        let mut regions =
            cluster.regions_overlapping_range(&self.config.start_key, &self.config.end_key);
        regions.shuffle(&mut rand::thread_rng());
        for region in regions {
            if self.controller.get_operator(region.id).is_some() {
                continue;
            }
            match self.scatterer.scatter(&region, &self.config.range_name) {
                Ok(op) if !op.is_empty() => return vec![op],
                Ok(_) => continue,
                Err(err) => {
                    tracing::debug!(region = region.id, error = %err, "scatter-range skip");
                    continue;
                }
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LabelPropertyRule, ScheduleConfig};
    use crate::heartbeat::HeartbeatStreams;
    use crate::region::{Peer, RegionInfo};
    use crate::storage::{MemoryStore, MetaStore};
    use std::time::Instant;

    fn setup() -> (Arc<Cluster>, SchedulerContext) {
        let storage: Arc<dyn MetaStore> = Arc::new(MemoryStore::new());
        let cluster = Cluster::new(ScheduleConfig::default(), Arc::clone(&storage));
        let controller =
            OperatorController::new(Arc::clone(&cluster), Arc::new(HeartbeatStreams::new()));
        (cluster, SchedulerContext { controller, storage })
    }

    fn live_store(cluster: &Cluster, id: u64, labels: Vec<(&str, &str)>) {
        let mut s =
            StoreInfo::new(id, format!("127.0.0.1:{}", 20160 + id)).with_labels(labels);
        s.last_heartbeat = Some(Instant::now());
        s.capacity = 1000;
        s.available = 1000;
        cluster.put_store(s);
    }

    fn add_region(cluster: &Cluster, id: u64, leader_store: u64, followers: &[u64]) {
        let mut peers = vec![Peer::voter(id * 10, leader_store)];
        for (i, s) in followers.iter().enumerate() {
            peers.push(Peer::voter(id * 10 + 1 + i as u64, *s));
        }
        let leader = peers[0];
        let mut region = RegionInfo::new(id, peers, Some(leader))
            .with_range(vec![id as u8], vec![id as u8 + 1]);
        region.approximate_size = 10;
        cluster.set_region(region);
    }

    #[test]
    fn evict_leader_drains_the_configured_store() {
        let (cluster, ctx) = setup();
        for id in 1..=3 {
            live_store(&cluster, id, vec![]);
        }
        add_region(&cluster, 1, 1, &[2]);
        add_region(&cluster, 2, 2, &[1]);
        add_region(&cluster, 3, 3, &[1]);

        let scheduler = new_evict_leader(&ctx, &["1".to_string()]).unwrap();
        assert!(scheduler.is_schedule_allowed(&cluster));
        let ops = scheduler.schedule(&cluster);
        assert_eq!(ops.len(), 1);
        assert!(matches!(
            ops[0].steps[0],
            crate::operator::Step::TransferLeader { from_store: 1, to_store: 2 }
        ));

        // The config round-trips through the metadata store.
        let raw = ctx.storage.get(&scheduler_key(EVICT_LEADER_TYPE)).unwrap().unwrap();
        let loaded: EvictLeaderConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(loaded.store_ids, vec![1]);
    }

    #[test]
    fn label_scheduler_moves_leaders_off_rejecting_stores() {
        let (cluster, ctx) = setup();
        cluster.update_config(|cfg| {
            cfg.label_properties.insert(
                REJECT_LEADER.to_string(),
                vec![LabelPropertyRule { key: "noleader".into(), value: "true".into() }],
            );
        });
        live_store(&cluster, 1, vec![("noleader", "true")]);
        live_store(&cluster, 2, vec![]);
        live_store(&cluster, 3, vec![]);
        add_region(&cluster, 1, 1, &[2, 3]);
        // Store 2 is busier than store 3.
        add_region(&cluster, 2, 2, &[1, 3]);

        let scheduler = new_label(&ctx, &[]).unwrap();
        let ops = scheduler.schedule(&cluster);
        assert_eq!(ops.len(), 1);
        assert!(matches!(
            ops[0].steps[0],
            crate::operator::Step::TransferLeader { from_store: 1, to_store: 3 }
        ));
    }

    #[test]
    fn label_scheduler_idles_without_label_properties() {
        let (cluster, ctx) = setup();
        live_store(&cluster, 1, vec![("noleader", "true")]);
        live_store(&cluster, 2, vec![]);
        add_region(&cluster, 1, 1, &[2]);
        let scheduler = new_label(&ctx, &[]).unwrap();
        assert!(scheduler.schedule(&cluster).is_empty());
    }

    #[test]
    fn shuffle_leader_emits_admin_transfer() {
        let (cluster, ctx) = setup();
        for id in 1..=4 {
            live_store(&cluster, id, vec![]);
        }
        for id in 1..=4 {
            let followers: Vec<u64> = (1..=4).filter(|s| *s != id).collect();
            add_region(&cluster, id, id, &followers);
        }
        let scheduler = new_shuffle_leader(&ctx, &[]).unwrap();
        let ops = scheduler.schedule(&cluster);
        assert_eq!(ops.len(), 1);
        assert!(ops[0].kind.contains(OpKind::ADMIN));
        assert!(ops[0].kind.contains(OpKind::LEADER));
    }

    #[test]
    fn adjacent_region_disperses_same_distribution_by_peer_move() {
        let (cluster, ctx) = setup();
        for id in 1..=4 {
            live_store(&cluster, id, vec![]);
        }
        // Regions 1 and 2 are adjacent, same stores, same leader store.
        add_region(&cluster, 1, 1, &[2, 3]);
        add_region(&cluster, 2, 1, &[2, 3]);

        let scheduler = new_adjacent_region(&ctx, &[]).unwrap();
        assert!(scheduler.is_schedule_allowed(&cluster));
        let ops = scheduler.schedule(&cluster);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].desc, "balance-adjacent-region");
        assert!(ops[0].kind.contains(OpKind::REGION));

        // Zeroed limits shut the scheduler off.
        let off = new_adjacent_region(&ctx, &["0".to_string(), "0".to_string()]).unwrap();
        assert!(!off.is_schedule_allowed(&cluster));
    }

    #[test]
    fn adjacent_region_prefers_leader_transfer_on_different_distribution() {
        let (cluster, ctx) = setup();
        for id in 1..=4 {
            live_store(&cluster, id, vec![]);
        }
        add_region(&cluster, 1, 1, &[2, 3]);
        add_region(&cluster, 2, 1, &[3, 4]);

        let scheduler = new_adjacent_region(&ctx, &[]).unwrap();
        let ops = scheduler.schedule(&cluster);
        assert_eq!(ops.len(), 1);
        assert!(matches!(
            ops[0].steps[0],
            crate::operator::Step::TransferLeader { from_store: 1, .. }
        ));
    }

    #[test]
    fn random_merge_pairs_colocated_neighbors() {
        let (cluster, ctx) = setup();
        for id in 1..=3 {
            live_store(&cluster, id, vec![]);
        }
        add_region(&cluster, 1, 1, &[2, 3]);
        add_region(&cluster, 2, 1, &[2, 3]);

        let scheduler = new_random_merge(&ctx, &[]).unwrap();
        let mut found = false;
        for _ in 0..20 {
            let ops = scheduler.schedule(&cluster);
            if !ops.is_empty() {
                assert_eq!(ops.len(), 2);
                assert!(ops[0].kind.contains(OpKind::MERGE));
                found = true;
                break;
            }
        }
        assert!(found, "random merge never produced a pair");
    }

    #[test]
    fn scatter_range_requires_args_and_scatters_inside_range() {
        let (cluster, ctx) = setup();
        assert!(new_scatter_range(&ctx, &[]).is_err());
        for id in 1..=6 {
            live_store(&cluster, id, vec![]);
        }
        for id in 1..=4 {
            add_region(&cluster, id, 1, &[2, 3]);
        }

        let scheduler = new_scatter_range(
            &ctx,
            &["\u{1}".to_string(), "\u{4}".to_string(), "import".to_string()],
        )
        .unwrap();
        assert_eq!(scheduler.name(), "scatter-range-import");
        // Scattering repeatedly keeps producing work until spread evens out.
        let ops = scheduler.schedule(&cluster);
        assert!(ops.len() <= 1);
    }
}

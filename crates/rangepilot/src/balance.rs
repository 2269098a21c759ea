//! Steady-state load spreading: balance-leader and balance-region.
//!
//! Both follow the same skeleton: take the highest-scoring store as source,
//! pick candidate regions from it, choose the filter-passing target with the
//! lowest score, and only move when the gap clears the tolerance band so the
//! pair cannot oscillate.

use std::sync::Arc;

use crate::cluster::{is_region_healthy_allow_pending, Cluster};
use crate::config::{LeaderSchedulePolicy, ScheduleConfig};
use crate::controller::OperatorController;
use crate::filter::{
    self, ExcludedFilter, Filter, RuleLeaderFitFilter, SpecialUseFilter, StorageThresholdFilter,
    StoreStateFilter,
};
use crate::operator::{
    create_move_peer_operator, create_transfer_leader_operator, OpKind, Operator,
};
use crate::scheduler::{Scheduler, SchedulerContext};
use crate::statistics::FlowKind;
use crate::store::StoreInfo;

pub const BALANCE_LEADER_TYPE: &str = "balance-leader";
pub const BALANCE_REGION_TYPE: &str = "balance-region";

const BALANCE_LEADER_NAME: &str = "balance-leader-scheduler";
const BALANCE_REGION_NAME: &str = "balance-region-scheduler";

/// Source attempts per tick before the scheduler gives up until next time.
const RETRY_LIMIT: usize = 5;

pub fn new_balance_leader(
    ctx: &SchedulerContext,
    _args: &[String],
) -> anyhow::Result<Box<dyn Scheduler>> {
    Ok(Box::new(BalanceLeaderScheduler { controller: Arc::clone(&ctx.controller) }))
}

pub fn new_balance_region(
    ctx: &SchedulerContext,
    _args: &[String],
) -> anyhow::Result<Box<dyn Scheduler>> {
    Ok(Box::new(BalanceRegionScheduler { controller: Arc::clone(&ctx.controller) }))
}

/// Hysteresis band: how much better the source must score than the target
/// before a move is worth it.
fn tolerant_resource(cluster: &Cluster, cfg: &ScheduleConfig, leader_by_count: bool) -> f64 {
    if leader_by_count {
        cfg.tolerant_size_ratio.max(1.0)
    } else {
        cfg.tolerant_size_ratio * cluster.average_region_size().max(1) as f64
    }
}

pub struct BalanceLeaderScheduler {
    controller: Arc<OperatorController>,
}

impl Scheduler for BalanceLeaderScheduler {
    fn name(&self) -> &str {
        BALANCE_LEADER_NAME
    }

    fn scheduler_type(&self) -> &'static str {
        BALANCE_LEADER_TYPE
    }

    fn is_schedule_allowed(&self, cluster: &Cluster) -> bool {
        self.controller.operator_count(OpKind::LEADER) < cluster.config().leader_schedule_limit
    }

    fn schedule(&self, cluster: &Cluster) -> Vec<Operator> {
        let cfg = cluster.config();
        let by_size = cfg.leader_schedule_policy == LeaderSchedulePolicy::Size;

        let source_state =
            StoreStateFilter { action_scope: BALANCE_LEADER_NAME.into(), transfer_leader: true, move_region: false };
        let source_filters: Vec<&dyn Filter> = vec![&source_state];
        let mut sources = filter::select_source_stores(&cluster.get_stores(), &source_filters, &cfg);
        sources.sort_by(|a, b| {
            b.leader_score(by_size)
                .partial_cmp(&a.leader_score(by_size))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for source in sources.iter().take(RETRY_LIMIT) {
            let Some(region) = cluster.random_leader_region(source.id) else { continue };
            if !is_region_healthy_allow_pending(&region) {
                continue;
            }
            let followers = cluster.get_follower_stores(&region);
            // A follower with a pending peer is catching up; handing it the
            // leadership would stall reads.
            let candidates: Vec<StoreInfo> = followers
                .into_iter()
                .filter(|s| {
                    region.get_store_peer(s.id).map_or(false, |p| !region.is_pending(p.id))
                })
                .collect();

            let target_state = StoreStateFilter {
                action_scope: BALANCE_LEADER_NAME.into(),
                transfer_leader: true,
                move_region: false,
            };
            let mut filters: Vec<&dyn Filter> = vec![&target_state];
            let leader_guard;
            if cfg.placement_rules_enabled {
                leader_guard = RuleLeaderFitFilter::new(BALANCE_LEADER_NAME, cluster, &region);
                filters.push(&leader_guard);
            }
            let passing = filter::select_target_stores(&candidates, &filters, &cfg);
            let Some(target) = passing.into_iter().min_by(|a, b| {
                a.leader_score(by_size)
                    .partial_cmp(&b.leader_score(by_size))
                    .unwrap_or(std::cmp::Ordering::Equal)
            }) else {
                continue;
            };

            let tolerant = tolerant_resource(cluster, &cfg, !by_size);
            if source.leader_score(by_size) - tolerant <= target.leader_score(by_size) {
                tracing::debug!(
                    source = source.id,
                    target = target.id,
                    "leader gap inside the tolerance band, skipping"
                );
                continue;
            }
            return vec![create_transfer_leader_operator(
                "balance-leader",
                &region,
                source.id,
                target.id,
                OpKind::BALANCE,
            )];
        }
        Vec::new()
    }
}

pub struct BalanceRegionScheduler {
    controller: Arc<OperatorController>,
}

impl Scheduler for BalanceRegionScheduler {
    fn name(&self) -> &str {
        BALANCE_REGION_NAME
    }

    fn scheduler_type(&self) -> &'static str {
        BALANCE_REGION_TYPE
    }

    fn is_schedule_allowed(&self, cluster: &Cluster) -> bool {
        self.controller.operator_count(OpKind::REGION) < cluster.config().region_schedule_limit
    }

    fn schedule(&self, cluster: &Cluster) -> Vec<Operator> {
        let cfg = cluster.config();

        let source_state = StoreStateFilter {
            action_scope: BALANCE_REGION_NAME.into(),
            transfer_leader: false,
            move_region: true,
        };
        let source_filters: Vec<&dyn Filter> = vec![&source_state];
        let mut sources = filter::select_source_stores(&cluster.get_stores(), &source_filters, &cfg);
        sources.sort_by(|a, b| {
            b.region_score_with(cfg.high_space_ratio, cfg.low_space_ratio)
                .partial_cmp(&a.region_score_with(cfg.high_space_ratio, cfg.low_space_ratio))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for source in sources.iter().take(RETRY_LIMIT) {
            // Followers move cheaper than leaders, try them first.
            let region = cluster
                .random_follower_region(source.id)
                .or_else(|| cluster.random_leader_region(source.id));
            let Some(region) = region else { continue };

            if !is_region_healthy_allow_pending(&region) {
                continue;
            }
            if !cluster.is_region_replicated(&region) {
                // Leave replica repair to the checkers.
                continue;
            }
            if cluster
                .hot_cache(FlowKind::Write)
                .is_region_hot(region.id, cfg.hot_region_cache_hits_threshold)
            {
                continue;
            }

            let move_state = StoreStateFilter {
                action_scope: BALANCE_REGION_NAME.into(),
                transfer_leader: false,
                move_region: true,
            };
            let excluded =
                ExcludedFilter::new(BALANCE_REGION_NAME, Default::default(), region.store_ids());
            let storage = StorageThresholdFilter::new(BALANCE_REGION_NAME);
            let special = SpecialUseFilter::new(BALANCE_REGION_NAME, &[]);
            let mut filters: Vec<&dyn Filter> = vec![&move_state, &excluded, &storage, &special];

            let rule_guard;
            let score_guard;
            if cfg.placement_rules_enabled {
                rule_guard =
                    crate::filter::RuleFitFilter::new(BALANCE_REGION_NAME, cluster, &region, source.id);
                filters.push(&rule_guard);
            } else {
                score_guard = crate::filter::DistinctScoreFilter::new(
                    BALANCE_REGION_NAME,
                    cfg.location_labels.clone(),
                    &cluster.get_region_stores(&region),
                    source,
                );
                filters.push(&score_guard);
            }

            let passing = filter::select_target_stores(&cluster.get_stores(), &filters, &cfg);
            let Some(target) = passing.into_iter().min_by(|a, b| {
                a.region_score_with(cfg.high_space_ratio, cfg.low_space_ratio)
                    .partial_cmp(&b.region_score_with(cfg.high_space_ratio, cfg.low_space_ratio))
                    .unwrap_or(std::cmp::Ordering::Equal)
            }) else {
                continue;
            };

            let tolerant = tolerant_resource(cluster, &cfg, false);
            let source_score = source.region_score_with(cfg.high_space_ratio, cfg.low_space_ratio);
            let target_score = target.region_score_with(cfg.high_space_ratio, cfg.low_space_ratio);
            if source_score - tolerant <= target_score {
                tracing::debug!(
                    source = source.id,
                    target = target.id,
                    "region gap inside the tolerance band, skipping"
                );
                continue;
            }

            let peer_id = cluster.alloc_id();
            return vec![create_move_peer_operator(
                "balance-region",
                &region,
                OpKind::BALANCE,
                source.id,
                target.id,
                peer_id,
            )];
        }
        Vec::new()
    }
}

//! Hot-region scheduler: moves read/write hotspots off overloaded stores.
//!
//! Each tick looks at one perspective (read or write), builds per-store load
//! details (current load plus the decaying influence of in-flight hot
//! operators), and runs a progressive-rank search over (source peer,
//! destination) pairs. Only moves that clearly shrink the hotspot survive.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::Rng;

use crate::cluster::{is_region_healthy_allow_pending, Cluster};
use crate::controller::OperatorController;
use crate::filter::{
    self, ExcludedFilter, Filter, HealthFilter, SpecialUseFilter, StoreStateFilter,
    SPECIAL_USE_HOT_REGION,
};
use crate::operator::{
    create_move_peer_operator, create_transfer_leader_operator, OpKind, OpPriority, Operator,
};
use crate::region::RegionInfo;
use crate::scheduler::{Scheduler, SchedulerContext};
use crate::statistics::{FlowKind, HotPeerStat};

pub const HOT_REGION_TYPE: &str = "hot-region";
const HOT_REGION_NAME: &str = "balance-hot-region-scheduler";

/// Probability that a write tick tries peer movement before a leader
/// transfer.
const SCHEDULE_PEER_PR: f64 = 0.66;

pub fn new_hot_region(
    ctx: &SchedulerContext,
    _args: &[String],
) -> anyhow::Result<Box<dyn Scheduler>> {
    Ok(Box::new(HotRegionScheduler::new(Arc::clone(&ctx.controller), HotRegionConfig::default())))
}

/// Tuning knobs of the hot scheduler.
#[derive(Debug, Clone)]
pub struct HotRegionConfig {
    /// Cap on hot peers considered per source store and tick.
    pub max_peer_number: usize,
    /// A source must exceed the expected load by this ratio on both axes.
    pub src_tolerance_ratio: f64,
    /// A destination must stay below the expected load by this ratio.
    pub dst_tolerance_ratio: f64,
    pub great_dec_ratio: f64,
    pub minor_great_dec_ratio: f64,
    pub min_hot_byte_rate: f64,
    pub min_hot_key_rate: f64,
    /// How long a finished operator's influence keeps decaying before it is
    /// dropped.
    pub max_zombie_duration: Duration,
    pub byte_rank_step_ratio: f64,
    pub key_rank_step_ratio: f64,
    pub count_rank_step_ratio: f64,
}

impl Default for HotRegionConfig {
    fn default() -> Self {
        Self {
            max_peer_number: 1000,
            src_tolerance_ratio: 1.05,
            dst_tolerance_ratio: 1.05,
            great_dec_ratio: 0.95,
            minor_great_dec_ratio: 0.99,
            min_hot_byte_rate: 100.0,
            min_hot_key_rate: 10.0,
            max_zombie_duration: Duration::from_secs(30),
            byte_rank_step_ratio: 0.05,
            key_rank_step_ratio: 0.05,
            count_rank_step_ratio: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StoreLoad {
    pub byte_rate: f64,
    pub key_rate: f64,
    pub count: f64,
}

impl StoreLoad {
    fn min(a: &StoreLoad, b: &StoreLoad) -> StoreLoad {
        StoreLoad {
            byte_rate: a.byte_rate.min(b.byte_rate),
            key_rate: a.key_rate.min(b.key_rate),
            count: a.count.min(b.count),
        }
    }

    fn max(a: &StoreLoad, b: &StoreLoad) -> StoreLoad {
        StoreLoad {
            byte_rate: a.byte_rate.max(b.byte_rate),
            key_rate: a.key_rate.max(b.key_rate),
            count: a.count.max(b.count),
        }
    }
}

/// Estimated contribution of an in-flight operator to future store load.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Influence {
    pub byte_rate: f64,
    pub key_rate: f64,
    pub count: f64,
}

impl Influence {
    fn scaled(&self, w: f64) -> Influence {
        Influence { byte_rate: self.byte_rate * w, key_rate: self.key_rate * w, count: self.count * w }
    }
}

/// Current plus predicted load of one store.
#[derive(Debug, Clone, Default)]
pub struct LoadPred {
    pub current: StoreLoad,
    pub future: StoreLoad,
    pub expect: StoreLoad,
}

impl LoadPred {
    fn min(&self) -> StoreLoad {
        StoreLoad::min(&self.current, &self.future)
    }

    fn max(&self) -> StoreLoad {
        StoreLoad::max(&self.current, &self.future)
    }

    /// Pending influence still expected to land.
    fn diff(&self) -> StoreLoad {
        StoreLoad {
            byte_rate: self.future.byte_rate - self.current.byte_rate,
            key_rate: self.future.key_rate - self.current.key_rate,
            count: self.future.count - self.current.count,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreLoadDetail {
    pub load_pred: LoadPred,
    pub hot_peers: Vec<HotPeerStat>,
}

struct PendingInfluence {
    op: Arc<Operator>,
    from: u64,
    to: u64,
    infl: Influence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpTy {
    MovePeer,
    TransferLeader,
}

impl OpTy {
    fn index(self) -> usize {
        match self {
            OpTy::MovePeer => 0,
            OpTy::TransferLeader => 1,
        }
    }
}

// Resource types: the (flow, operation) combinations the scheduler balances.
const WRITE_PEER: usize = 0;
const WRITE_LEADER: usize = 1;
const READ_LEADER: usize = 2;
const RESOURCE_TYPE_LEN: usize = 3;

fn resource_type(rw: FlowKind, op_ty: OpTy) -> usize {
    match (rw, op_ty) {
        (FlowKind::Write, OpTy::MovePeer) => WRITE_PEER,
        (FlowKind::Write, OpTy::TransferLeader) => WRITE_LEADER,
        (FlowKind::Read, _) => READ_LEADER,
    }
}

#[derive(Default)]
struct HotState {
    pendings: [Vec<PendingInfluence>; RESOURCE_TYPE_LEN],
    pending_sums: [HashMap<u64, Influence>; RESOURCE_TYPE_LEN],
    /// region id -> [move-peer slot, transfer-leader slot]
    region_pendings: HashMap<u64, [Option<Arc<Operator>>; 2]>,
    load_infos: [HashMap<u64, StoreLoadDetail>; RESOURCE_TYPE_LEN],
}

pub struct HotRegionScheduler {
    controller: Arc<OperatorController>,
    conf: HotRegionConfig,
    state: RwLock<HotState>,
}

impl HotRegionScheduler {
    pub fn new(controller: Arc<OperatorController>, conf: HotRegionConfig) -> Self {
        Self { controller, conf, state: RwLock::new(HotState::default()) }
    }

    fn allow_balance_leader(&self, cluster: &Cluster) -> bool {
        let cfg = cluster.config();
        self.controller.operator_count(OpKind::HOT_REGION) < cfg.hot_region_schedule_limit
            && self.controller.operator_count(OpKind::LEADER) < cfg.leader_schedule_limit
    }

    fn allow_balance_region(&self, cluster: &Cluster) -> bool {
        self.controller.operator_count(OpKind::HOT_REGION)
            < cluster.config().hot_region_schedule_limit
    }

    /// Weight of one pending operator's influence: full while in flight,
    /// decaying linearly after success, gone otherwise.
    fn pending_weight(&self, op: &Operator) -> f64 {
        if op.check_timeout() || op.check_expired() {
            return 0.0;
        }
        let status = op.status();
        if !status.is_end() {
            return 1.0;
        }
        if status != crate::operator::OpStatus::Success {
            return 0.0;
        }
        match op.time_since_end() {
            Some(zombie) if zombie < self.conf.max_zombie_duration => {
                (self.conf.max_zombie_duration - zombie).as_secs_f64()
                    / self.conf.max_zombie_duration.as_secs_f64()
            }
            _ => 0.0,
        }
    }

    fn summarize_pending_influence(&self, state: &mut HotState) {
        for ty in 0..RESOURCE_TYPE_LEN {
            let mut sums: HashMap<u64, Influence> = HashMap::new();
            state.pendings[ty].retain(|p| {
                let w = self.pending_weight(&p.op);
                if w == 0.0 && p.op.is_end() {
                    return false;
                }
                let from = sums.entry(p.from).or_default();
                *from = Influence {
                    byte_rate: from.byte_rate - p.infl.scaled(w).byte_rate,
                    key_rate: from.key_rate - p.infl.scaled(w).key_rate,
                    count: from.count - p.infl.scaled(w).count,
                };
                let to = sums.entry(p.to).or_default();
                *to = Influence {
                    byte_rate: to.byte_rate + p.infl.scaled(w).byte_rate,
                    key_rate: to.key_rate + p.infl.scaled(w).key_rate,
                    count: to.count + p.infl.scaled(w).count,
                };
                true
            });
            state.pending_sums[ty] = sums;
        }
        self.gc_region_pendings(state);
    }

    fn gc_region_pendings(&self, state: &mut HotState) {
        let zombie = self.conf.max_zombie_duration;
        state.region_pendings.retain(|region_id, slots| {
            for slot in slots.iter_mut() {
                let expired = slot.as_ref().map_or(false, |op| {
                    op.is_end() && op.time_since_end().map_or(false, |d| d >= zombie)
                });
                if expired {
                    tracing::debug!(region = region_id, "dropping zombie hot pending");
                    *slot = None;
                }
            }
            slots.iter().any(|s| s.is_some())
        });
    }

    fn prepare_for_balance(&self, state: &mut HotState, cluster: &Cluster) {
        self.summarize_pending_influence(state);
        let min_hot_degree = cluster.config().hot_region_cache_hits_threshold;

        {
            let rates = cluster.stats().store_flow_rates(FlowKind::Read);
            let threshold = cluster.stats().hot_region_threshold(FlowKind::Read);
            let hot_peers = cluster.hot_cache(FlowKind::Read).store_hot_peers();
            state.load_infos[READ_LEADER] = summarize_stores_load(
                &rates,
                &state.pending_sums[READ_LEADER],
                &hot_peers,
                min_hot_degree,
                threshold,
                FlowKind::Read,
                true,
            );
        }
        {
            let rates = cluster.stats().store_flow_rates(FlowKind::Write);
            let threshold = cluster.stats().hot_region_threshold(FlowKind::Write);
            let hot_peers = cluster.hot_cache(FlowKind::Write).store_hot_peers();
            state.load_infos[WRITE_LEADER] = summarize_stores_load(
                &rates,
                &state.pending_sums[WRITE_LEADER],
                &hot_peers,
                min_hot_degree,
                threshold,
                FlowKind::Write,
                true,
            );
            state.load_infos[WRITE_PEER] = summarize_stores_load(
                &rates,
                &state.pending_sums[WRITE_PEER],
                &hot_peers,
                min_hot_degree,
                threshold,
                FlowKind::Write,
                false,
            );
        }
    }

    fn add_pending_influence(
        &self,
        state: &mut HotState,
        op: Arc<Operator>,
        src: u64,
        dst: u64,
        infl: Influence,
        rw: FlowKind,
        op_ty: OpTy,
    ) -> bool {
        let region_id = op.region_id;
        if state.region_pendings.contains_key(&region_id) {
            return false;
        }
        state.pendings[resource_type(rw, op_ty)].push(PendingInfluence {
            op: Arc::clone(&op),
            from: src,
            to: dst,
            infl,
        });
        let mut slots: [Option<Arc<Operator>>; 2] = [None, None];
        slots[op_ty.index()] = Some(op);
        state.region_pendings.insert(region_id, slots);
        true
    }

    /// Run one tick from a fixed perspective. `schedule` flips a coin and
    /// calls this; admin surfaces may force a perspective directly.
    pub fn dispatch(&self, rw: FlowKind, cluster: &Cluster) {
        let mut state = self.state.write().unwrap();
        self.prepare_for_balance(&mut state, cluster);
        match rw {
            FlowKind::Read => self.balance_hot_read(&mut state, cluster),
            FlowKind::Write => self.balance_hot_write(&mut state, cluster),
        }
    }

    fn balance_hot_read(&self, state: &mut HotState, cluster: &Cluster) {
        // Reads prefer the cheap fix: hand the leadership over first.
        if self.run_solver(state, cluster, FlowKind::Read, OpTy::TransferLeader) {
            return;
        }
        self.run_solver(state, cluster, FlowKind::Read, OpTy::MovePeer);
    }

    fn balance_hot_write(&self, state: &mut HotState, cluster: &Cluster) {
        let roll: f64 = rand::thread_rng().gen();
        if roll < SCHEDULE_PEER_PR
            && self.run_solver(state, cluster, FlowKind::Write, OpTy::MovePeer)
        {
            return;
        }
        self.run_solver(state, cluster, FlowKind::Write, OpTy::TransferLeader);
    }

    /// Run one (flow, operation) solver; admit and register what it finds.
    /// Returns whether an operator was produced and admitted.
    fn run_solver(
        &self,
        state: &mut HotState,
        cluster: &Cluster,
        rw: FlowKind,
        op_ty: OpTy,
    ) -> bool {
        let allowed = match op_ty {
            OpTy::MovePeer => self.allow_balance_region(cluster),
            OpTy::TransferLeader => self.allow_balance_leader(cluster),
        };
        if !allowed {
            return false;
        }
        let solver = BalanceSolver {
            conf: &self.conf,
            cluster,
            details: &state.load_infos[resource_type(rw, op_ty)],
            region_pendings: &state.region_pendings,
            rw,
            op_ty,
        };
        let Some((solution, op)) = solver.solve() else { return false };
        // The operator is admitted here (not returned to the tick loop) so
        // the registered pending influence shares the admitted handle.
        let op = match self.controller.add_operator(op) {
            Ok(op) => op,
            Err(err) => {
                tracing::debug!(error = %err, "hot operator not admitted");
                return false;
            }
        };
        let infl = Influence {
            byte_rate: solution.peer.byte_rate,
            key_rate: solution.peer.key_rate,
            count: 1.0,
        };
        self.add_pending_influence(state, op, solution.src_store, solution.dst_store, infl, rw, op_ty)
    }

    /// Deep copy of the load details for one resource, for status surfaces.
    pub fn load_details(&self, rw: FlowKind, leader: bool) -> HashMap<u64, StoreLoadDetail> {
        let state = self.state.read().unwrap();
        let idx = match (rw, leader) {
            (FlowKind::Read, _) => READ_LEADER,
            (FlowKind::Write, true) => WRITE_LEADER,
            (FlowKind::Write, false) => WRITE_PEER,
        };
        state.load_infos[idx].clone()
    }

    /// Deep copy of the summed pending influence per store.
    pub fn pending_influence(&self, rw: FlowKind) -> HashMap<u64, Influence> {
        let state = self.state.read().unwrap();
        let idx = match rw {
            FlowKind::Write => WRITE_PEER,
            FlowKind::Read => READ_LEADER,
        };
        state.pending_sums[idx].clone()
    }
}

impl Scheduler for HotRegionScheduler {
    fn name(&self) -> &str {
        HOT_REGION_NAME
    }

    fn scheduler_type(&self) -> &'static str {
        HOT_REGION_TYPE
    }

    fn min_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn max_interval(&self) -> Duration {
        Duration::from_secs(20)
    }

    fn is_schedule_allowed(&self, cluster: &Cluster) -> bool {
        self.allow_balance_leader(cluster) || self.allow_balance_region(cluster)
    }

    fn schedule(&self, cluster: &Cluster) -> Vec<Operator> {
        let rw = if rand::thread_rng().gen_bool(0.5) { FlowKind::Write } else { FlowKind::Read };
        self.dispatch(rw, cluster);
        // Operators were admitted inside the solver so their pending
        // influence can track them; nothing to hand back.
        Vec::new()
    }
}

/// Build per-store load details for one (flow, role) combination.
fn summarize_stores_load(
    store_rates: &HashMap<u64, (f64, f64)>,
    pending_sums: &HashMap<u64, Influence>,
    store_hot_peers: &HashMap<u64, Vec<HotPeerStat>>,
    min_hot_degree: i32,
    threshold: (f64, f64),
    rw: FlowKind,
    leader_only: bool,
) -> HashMap<u64, StoreLoadDetail> {
    let mut details = HashMap::with_capacity(store_rates.len());
    let mut all_byte_sum = 0.0;
    let mut all_key_sum = 0.0;
    let mut all_count = 0.0;

    // Stores that never reported flow statistics are not schedulable.
    for (&id, &(mut byte_rate, mut key_rate)) in store_rates {
        let hot_peers: Vec<HotPeerStat> = store_hot_peers
            .get(&id)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|p| !leader_only || p.is_leader)
                    .filter(|p| p.hot_degree >= min_hot_degree)
                    .filter(|p| p.byte_rate >= threshold.0 || p.key_rate >= threshold.1)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        // A store's leader-side write flow is best estimated from its hot
        // leaders; the store totals mix in follower apply traffic.
        if leader_only && rw == FlowKind::Write {
            byte_rate = hot_peers.iter().map(|p| p.byte_rate).sum();
            key_rate = hot_peers.iter().map(|p| p.key_rate).sum();
        }

        all_byte_sum += byte_rate;
        all_key_sum += key_rate;
        all_count += hot_peers.len() as f64;

        let current = StoreLoad { byte_rate, key_rate, count: hot_peers.len() as f64 };
        let infl = pending_sums.get(&id).copied().unwrap_or_default();
        let future = StoreLoad {
            byte_rate: (current.byte_rate + infl.byte_rate).max(0.0),
            key_rate: (current.key_rate + infl.key_rate).max(0.0),
            count: (current.count + infl.count).max(0.0),
        };
        details.insert(
            id,
            StoreLoadDetail {
                load_pred: LoadPred { current, future, expect: StoreLoad::default() },
                hot_peers,
            },
        );
    }

    let store_len = store_rates.len().max(1) as f64;
    let expect = StoreLoad {
        byte_rate: all_byte_sum / store_len,
        key_rate: all_key_sum / store_len,
        count: all_count / store_len,
    };
    for detail in details.values_mut() {
        detail.load_pred.expect = expect;
    }
    details
}

/// One candidate (source store, hot peer, destination store) triple.
#[derive(Debug, Clone)]
struct Solution {
    src_store: u64,
    peer: HotPeerStat,
    region: RegionInfo,
    dst_store: u64,
    /// Smaller is better; negative means the move improves things.
    progressive_rank: i64,
}

struct BalanceSolver<'a> {
    conf: &'a HotRegionConfig,
    cluster: &'a Cluster,
    details: &'a HashMap<u64, StoreLoadDetail>,
    region_pendings: &'a HashMap<u64, [Option<Arc<Operator>>; 2]>,
    rw: FlowKind,
    op_ty: OpTy,
}

impl BalanceSolver<'_> {
    fn solve(&self) -> Option<(Solution, Operator)> {
        let (max_src, min_dst, rank_step) = self.load_bounds();
        let mut best: Option<Solution> = None;

        for (&src_store, detail) in self.details {
            if !self.is_source_eligible(detail) {
                continue;
            }
            for peer in self.filter_hot_peers(detail) {
                let Some(region) = self.get_region(&peer, src_store) else { continue };
                for &dst_store in self.filter_dst_stores(&region, src_store).iter() {
                    let rank = self.progressive_rank(src_store, dst_store, &peer);
                    if rank >= 0 {
                        continue;
                    }
                    let cur = Solution {
                        src_store,
                        peer: peer.clone(),
                        region: region.clone(),
                        dst_store,
                        progressive_rank: rank,
                    };
                    if self.better_than(&cur, best.as_ref(), &max_src, &min_dst, &rank_step) {
                        best = Some(cur);
                    }
                }
            }
        }

        let best = best?;
        let op = self.build_operator(&best)?;
        Some((best, op))
    }

    fn load_bounds(&self) -> (StoreLoad, StoreLoad, StoreLoad) {
        let mut max_src = StoreLoad::default();
        let mut min_dst =
            StoreLoad { byte_rate: f64::MAX, key_rate: f64::MAX, count: f64::MAX };
        let mut max_cur = StoreLoad::default();
        for detail in self.details.values() {
            max_src = StoreLoad::max(&max_src, &detail.load_pred.min());
            min_dst = StoreLoad::min(&min_dst, &detail.load_pred.max());
            max_cur = StoreLoad::max(&max_cur, &detail.load_pred.current);
        }
        let rank_step = StoreLoad {
            byte_rate: max_cur.byte_rate * self.conf.byte_rank_step_ratio,
            key_rate: max_cur.key_rate * self.conf.key_rank_step_ratio,
            count: max_cur.count * self.conf.count_rank_step_ratio,
        };
        (max_src, min_dst, rank_step)
    }

    /// A source must out-run the expectation on both axes even under its most
    /// optimistic prediction.
    fn is_source_eligible(&self, detail: &StoreLoadDetail) -> bool {
        if detail.hot_peers.is_empty() {
            return false;
        }
        let min_load = detail.load_pred.min();
        let expect = &detail.load_pred.expect;
        min_load.byte_rate > self.conf.src_tolerance_ratio * expect.byte_rate
            && min_load.key_rate > self.conf.src_tolerance_ratio * expect.key_rate
    }

    /// Hot peers of the source worth trying, bounded by `max_peer_number`
    /// (union of the byte-rate top-N and key-rate top-N), with regions
    /// already under a pending hot operator skipped. A finished leader
    /// transfer does not block a later peer move.
    fn filter_hot_peers(&self, detail: &StoreLoadDetail) -> Vec<HotPeerStat> {
        let available = |peer: &HotPeerStat| match self.region_pendings.get(&peer.region_id) {
            None => true,
            Some(slots) => match self.op_ty {
                OpTy::TransferLeader => false,
                OpTy::MovePeer => {
                    slots[OpTy::MovePeer.index()].is_none()
                        && slots[OpTy::TransferLeader.index()]
                            .as_ref()
                            .map_or(true, |op| op.is_end())
                }
            },
        };

        if detail.hot_peers.len() <= self.conf.max_peer_number {
            return detail.hot_peers.iter().filter(|p| available(p)).cloned().collect();
        }

        let mut by_byte: Vec<&HotPeerStat> = detail.hot_peers.iter().collect();
        by_byte.sort_by(|a, b| b.byte_rate.partial_cmp(&a.byte_rate).unwrap_or(std::cmp::Ordering::Equal));
        let mut by_key: Vec<&HotPeerStat> = detail.hot_peers.iter().collect();
        by_key.sort_by(|a, b| b.key_rate.partial_cmp(&a.key_rate).unwrap_or(std::cmp::Ordering::Equal));

        let mut union: HashSet<u64> = HashSet::with_capacity(self.conf.max_peer_number);
        let mut picked = Vec::with_capacity(self.conf.max_peer_number);
        let mut i = 0;
        while union.len() < self.conf.max_peer_number && i < detail.hot_peers.len() {
            for list in [&by_byte, &by_key] {
                if let Some(peer) = list.get(i) {
                    if union.insert(peer.region_id) && union.len() <= self.conf.max_peer_number {
                        picked.push((*peer).clone());
                    }
                }
            }
            i += 1;
        }
        picked.into_iter().filter(|p| available(p)).collect()
    }

    /// Resolve the peer's region and double-check the statistics still match
    /// the model.
    fn get_region(&self, peer: &HotPeerStat, src_store: u64) -> Option<RegionInfo> {
        let region = self.cluster.get_region(peer.region_id)?;
        if !is_region_healthy_allow_pending(&region) {
            return None;
        }
        if !self.cluster.is_region_replicated(&region) {
            tracing::debug!(region = region.id, "hot region has abnormal replica count");
            return None;
        }
        match self.op_ty {
            OpTy::MovePeer => {
                if region.get_store_peer(src_store).is_none() {
                    tracing::debug!(region = region.id, "stat is stale: no peer on source store");
                    return None;
                }
            }
            OpTy::TransferLeader => {
                if region.leader_store_id() != Some(src_store) {
                    tracing::debug!(region = region.id, "stat is stale: leader moved away");
                    return None;
                }
            }
        }
        Some(region)
    }

    fn filter_dst_stores(&self, region: &RegionInfo, src_store: u64) -> Vec<u64> {
        let cfg = self.cluster.config();
        let candidates = match self.op_ty {
            OpTy::MovePeer => self.cluster.get_stores(),
            OpTy::TransferLeader => self.cluster.get_follower_stores(region),
        };

        let state = StoreStateFilter {
            action_scope: HOT_REGION_NAME.into(),
            transfer_leader: self.op_ty == OpTy::TransferLeader,
            move_region: self.op_ty == OpTy::MovePeer,
        };
        let health = HealthFilter::new(HOT_REGION_NAME);
        let special = SpecialUseFilter::new(HOT_REGION_NAME, &[SPECIAL_USE_HOT_REGION]);
        let excluded = ExcludedFilter::new(HOT_REGION_NAME, Default::default(), region.store_ids());
        let mut filters: Vec<&dyn Filter> = vec![&state, &health, &special];
        let rule_guard;
        let score_guard;
        if self.op_ty == OpTy::MovePeer {
            filters.push(&excluded);
            if cfg.placement_rules_enabled {
                rule_guard = filter::RuleFitFilter::new(HOT_REGION_NAME, self.cluster, region, src_store);
                filters.push(&rule_guard);
            } else if let Some(src) = self.cluster.get_store(src_store) {
                score_guard = filter::DistinctScoreFilter::new(
                    HOT_REGION_NAME,
                    cfg.location_labels.clone(),
                    &self.cluster.get_region_stores(region),
                    &src,
                );
                filters.push(&score_guard);
            }
        }

        candidates
            .into_iter()
            .filter(|store| filter::target(&cfg, store, &filters))
            .filter_map(|store| {
                let detail = self.details.get(&store.id)?;
                let max_load = detail.load_pred.max();
                let expect = &detail.load_pred.expect;
                let fits = max_load.byte_rate * self.conf.dst_tolerance_ratio < expect.byte_rate
                    && max_load.key_rate * self.conf.dst_tolerance_ratio < expect.key_rate;
                fits.then_some(store.id)
            })
            .collect()
    }

    /// Classify how much the move helps.
    ///
    /// `-3`: both byte and key rates drop decisively; `-2`: key rate drops
    /// decisively while the byte rate is not worsened; `-1`: the byte rate
    /// drops decisively; `0`: no improvement.
    fn progressive_rank(&self, src_store: u64, dst_store: u64, peer: &HotPeerStat) -> i64 {
        let src = self.details[&src_store].load_pred.min();
        let dst = self.details[&dst_store].load_pred.max();

        if self.rw == FlowKind::Write && self.op_ty == OpTy::TransferLeader {
            // Leader transfers on the write path relieve CPU, which tracks
            // the key rate; bytes move with the data, not the leader.
            if src.key_rate >= dst.key_rate + peer.key_rate {
                return -1;
            }
            return 0;
        }

        let src_dec = |cur: f64, dec: f64| {
            let left = cur - dec;
            if left <= 0.0 {
                1.0
            } else {
                left
            }
        };
        let key_dec_ratio = (dst.key_rate + peer.key_rate) / src_dec(src.key_rate, peer.key_rate);
        let key_hot = peer.key_rate >= self.conf.min_hot_key_rate;
        let byte_dec_ratio =
            (dst.byte_rate + peer.byte_rate) / src_dec(src.byte_rate, peer.byte_rate);
        let byte_hot = peer.byte_rate > self.conf.min_hot_byte_rate;

        let great = self.conf.great_dec_ratio;
        let minor = self.conf.minor_great_dec_ratio;
        if byte_hot && byte_dec_ratio <= great && key_hot && key_dec_ratio <= great {
            -3
        } else if byte_dec_ratio <= minor && key_hot && key_dec_ratio <= great {
            -2
        } else if byte_hot && byte_dec_ratio <= great {
            -1
        } else {
            0
        }
    }

    /// Whether `cur` beats `best`: smaller progressive rank first, then more
    /// extremal source, then more extremal destination, then the peer whose
    /// movement clears more hot work.
    fn better_than(
        &self,
        cur: &Solution,
        best: Option<&Solution>,
        max_src: &StoreLoad,
        min_dst: &StoreLoad,
        rank_step: &StoreLoad,
    ) -> bool {
        let Some(best) = best else { return true };

        if cur.progressive_rank != best.progressive_rank {
            return cur.progressive_rank < best.progressive_rank;
        }
        match self.compare_src_store(cur.src_store, best.src_store, max_src, rank_step) {
            std::cmp::Ordering::Less => return true,
            std::cmp::Ordering::Greater => return false,
            std::cmp::Ordering::Equal => {}
        }
        match self.compare_dst_store(cur.dst_store, best.dst_store, min_dst, rank_step) {
            std::cmp::Ordering::Less => return true,
            std::cmp::Ordering::Greater => return false,
            std::cmp::Ordering::Equal => {}
        }

        if cur.peer.region_id != best.peer.region_id {
            if self.rw == FlowKind::Write && self.op_ty == OpTy::TransferLeader {
                return cur.peer.key_rate > best.peer.key_rate;
            }
            let byte_cmp = rank_cmp(cur.peer.byte_rate, best.peer.byte_rate, 100.0);
            let key_cmp = rank_cmp(cur.peer.key_rate, best.peer.key_rate, 10.0);
            match cur.progressive_rank {
                -2 => {
                    // Key rate balanced, byte rate merely not worsened:
                    // prefer the larger key drop, then the smaller byte
                    // footprint to limit collateral.
                    if key_cmp != std::cmp::Ordering::Equal {
                        return key_cmp == std::cmp::Ordering::Greater;
                    }
                    if byte_cmp != std::cmp::Ordering::Equal {
                        return byte_cmp == std::cmp::Ordering::Less;
                    }
                }
                -3 => {
                    if key_cmp != std::cmp::Ordering::Equal {
                        return key_cmp == std::cmp::Ordering::Greater;
                    }
                    if byte_cmp != std::cmp::Ordering::Equal {
                        return byte_cmp == std::cmp::Ordering::Greater;
                    }
                }
                -1 => {
                    if byte_cmp != std::cmp::Ordering::Equal {
                        return byte_cmp == std::cmp::Ordering::Greater;
                    }
                }
                _ => {}
            }
        }
        false
    }

    /// Less means the first store is the better source: farther above the
    /// cluster max on the stricter axis, with small differences quantized
    /// away, then less pending influence.
    fn compare_src_store(
        &self,
        a: u64,
        b: u64,
        max_src: &StoreLoad,
        rank_step: &StoreLoad,
    ) -> std::cmp::Ordering {
        if a == b {
            return std::cmp::Ordering::Equal;
        }
        let la = &self.details[&a].load_pred;
        let lb = &self.details[&b].load_pred;
        let (amin, bmin) = (la.min(), lb.min());

        let dims: [(f64, f64, f64, f64); 2] =
            if self.rw == FlowKind::Write && self.op_ty == OpTy::TransferLeader {
                [
                    (amin.key_rate, bmin.key_rate, max_src.key_rate, rank_step.key_rate),
                    (amin.byte_rate, bmin.byte_rate, max_src.byte_rate, rank_step.byte_rate),
                ]
            } else {
                [
                    (amin.byte_rate, bmin.byte_rate, max_src.byte_rate, rank_step.byte_rate),
                    (amin.key_rate, bmin.key_rate, max_src.key_rate, rank_step.key_rate),
                ]
            };
        for (va, vb, anchor, step) in dims {
            let (ra, rb) = (step_rank(va, anchor, step), step_rank(vb, anchor, step));
            if ra != rb {
                // Higher above the max is the better source.
                return rb.cmp(&ra);
            }
        }
        self.compare_pending(la, lb, rank_step)
    }

    /// Less means the first store is the better destination: farther below
    /// the cluster min, then less pending influence.
    fn compare_dst_store(
        &self,
        a: u64,
        b: u64,
        min_dst: &StoreLoad,
        rank_step: &StoreLoad,
    ) -> std::cmp::Ordering {
        if a == b {
            return std::cmp::Ordering::Equal;
        }
        let la = &self.details[&a].load_pred;
        let lb = &self.details[&b].load_pred;
        let (amax, bmax) = (la.max(), lb.max());

        let dims: [(f64, f64, f64, f64); 2] =
            if self.rw == FlowKind::Write && self.op_ty == OpTy::TransferLeader {
                [
                    (amax.key_rate, bmax.key_rate, min_dst.key_rate, rank_step.key_rate),
                    (amax.byte_rate, bmax.byte_rate, min_dst.byte_rate, rank_step.byte_rate),
                ]
            } else {
                [
                    (amax.byte_rate, bmax.byte_rate, min_dst.byte_rate, rank_step.byte_rate),
                    (amax.key_rate, bmax.key_rate, min_dst.key_rate, rank_step.key_rate),
                ]
            };
        for (va, vb, anchor, step) in dims {
            let (ra, rb) = (step_rank(va, anchor, step), step_rank(vb, anchor, step));
            if ra != rb {
                // Lower below the min is the better destination.
                return ra.cmp(&rb);
            }
        }
        self.compare_pending(la, lb, rank_step)
    }

    /// Tie-break on how much pending influence is already headed at a store.
    fn compare_pending(
        &self,
        la: &LoadPred,
        lb: &LoadPred,
        rank_step: &StoreLoad,
    ) -> std::cmp::Ordering {
        let (da, db) = (la.diff(), lb.diff());
        for (va, vb, step) in [
            (da.count, db.count, rank_step.count),
            (da.key_rate, db.key_rate, rank_step.key_rate),
            (da.byte_rate, db.byte_rate, rank_step.byte_rate),
        ] {
            let (ra, rb) = (step_rank(va, 0.0, step), step_rank(vb, 0.0, step));
            if ra != rb {
                return ra.cmp(&rb);
            }
        }
        std::cmp::Ordering::Equal
    }

    fn build_operator(&self, solution: &Solution) -> Option<Operator> {
        let mut op = match self.op_ty {
            OpTy::MovePeer => {
                let peer_id = self.cluster.alloc_id();
                create_move_peer_operator(
                    format!("move-hot-{}-region", self.rw.as_str()),
                    &solution.region,
                    OpKind::HOT_REGION,
                    solution.src_store,
                    solution.dst_store,
                    peer_id,
                )
            }
            OpTy::TransferLeader => {
                solution.region.get_store_voter(solution.dst_store)?;
                create_transfer_leader_operator(
                    format!("transfer-hot-{}-leader", self.rw.as_str()),
                    &solution.region,
                    solution.src_store,
                    solution.dst_store,
                    OpKind::HOT_REGION,
                )
            }
        };
        op.priority = OpPriority::High;
        Some(op)
    }
}

/// Quantize a load value into coarse steps so near-ties compare equal.
fn step_rank(value: f64, anchor: f64, step: f64) -> i64 {
    if step <= 0.0 {
        return 0;
    }
    ((value - anchor) / step).floor() as i64
}

fn rank_cmp(a: f64, b: f64, step: f64) -> std::cmp::Ordering {
    step_rank(a, 0.0, step).cmp(&step_rank(b, 0.0, step))
}

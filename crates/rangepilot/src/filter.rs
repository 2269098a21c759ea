//! Composable store predicates used to pick schedule sources and targets.
//!
//! Filters compose with all-of semantics and short-circuit on the first
//! rejection; rejections are counted per (scope, filter, action) so operators
//! of the cluster can see why stores are being passed over.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, OnceLock};

use crate::cluster::Cluster;
use crate::config::{ScheduleConfig, StoreLimitKind, REJECT_LEADER};
use crate::placement::{
    compare_region_fit, match_label_constraints, distinct_score, LabelConstraint,
    LabelConstraintOp, RegionFit,
};
use crate::region::RegionInfo;
use crate::store::StoreInfo;

pub const ENGINE_KEY: &str = "engine";
/// Analytic-engine stores never take part in ordinary scheduling.
pub const ENGINE_COLUMNAR: &str = "columnar";
pub const SPECIAL_USE_KEY: &str = "specialUse";
pub const SPECIAL_USE_HOT_REGION: &str = "hotRegion";
pub const SPECIAL_USE_RESERVED: &str = "reserved";

const ALL_SPECIAL_USES: [&str; 2] = [SPECIAL_USE_HOT_REGION, SPECIAL_USE_RESERVED];
const ALL_SPECIAL_ENGINES: [&str; 1] = [ENGINE_COLUMNAR];

/// A predicate over stores, with distinct source- and target-side answers.
pub trait Filter {
    /// The scheduler or checker the filter acts for.
    fn scope(&self) -> &str;
    fn kind(&self) -> &'static str;
    fn source(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        let _ = (cfg, store);
        true
    }
    fn target(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        let _ = (cfg, store);
        true
    }
}

fn reject_counters() -> &'static Mutex<HashMap<(String, &'static str, &'static str), u64>> {
    static COUNTERS: OnceLock<Mutex<HashMap<(String, &'static str, &'static str), u64>>> =
        OnceLock::new();
    COUNTERS.get_or_init(Default::default)
}

fn count_reject(filter: &dyn Filter, action: &'static str) {
    let mut counters = reject_counters().lock().unwrap();
    *counters.entry((filter.scope().to_string(), filter.kind(), action)).or_insert(0) += 1;
}

/// Snapshot of rejection counters keyed by (scope, filter kind, action).
pub fn rejection_counts() -> HashMap<(String, &'static str, &'static str), u64> {
    reject_counters().lock().unwrap().clone()
}

/// Whether the store passes every filter as a schedule source.
pub fn source(cfg: &ScheduleConfig, store: &StoreInfo, filters: &[&dyn Filter]) -> bool {
    for filter in filters {
        if !filter.source(cfg, store) {
            count_reject(*filter, "filter-source");
            tracing::trace!(store = store.id, filter = filter.kind(), "rejected as source");
            return false;
        }
    }
    true
}

/// Whether the store passes every filter as a schedule target.
pub fn target(cfg: &ScheduleConfig, store: &StoreInfo, filters: &[&dyn Filter]) -> bool {
    for filter in filters {
        if !filter.target(cfg, store) {
            count_reject(*filter, "filter-target");
            tracing::trace!(store = store.id, filter = filter.kind(), "rejected as target");
            return false;
        }
    }
    true
}

pub fn select_source_stores(
    stores: &[StoreInfo],
    filters: &[&dyn Filter],
    cfg: &ScheduleConfig,
) -> Vec<StoreInfo> {
    stores.iter().filter(|s| source(cfg, s, filters)).cloned().collect()
}

pub fn select_target_stores(
    stores: &[StoreInfo],
    filters: &[&dyn Filter],
    cfg: &ScheduleConfig,
) -> Vec<StoreInfo> {
    stores.iter().filter(|s| target(cfg, s, filters)).cloned().collect()
}

/// Rejects explicitly listed stores.
pub struct ExcludedFilter {
    scope: String,
    sources: HashSet<u64>,
    targets: HashSet<u64>,
}

impl ExcludedFilter {
    pub fn new(scope: &str, sources: HashSet<u64>, targets: HashSet<u64>) -> Self {
        Self { scope: scope.to_string(), sources, targets }
    }
}

impl Filter for ExcludedFilter {
    fn scope(&self) -> &str {
        &self.scope
    }
    fn kind(&self) -> &'static str {
        "exclude-filter"
    }
    fn source(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        !self.sources.contains(&store.id)
    }
    fn target(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        !self.targets.contains(&store.id)
    }
}

/// Sources must hold remove-peer tokens, targets add-peer tokens.
pub struct StoreLimitFilter {
    scope: String,
}

impl StoreLimitFilter {
    pub fn new(scope: &str) -> Self {
        Self { scope: scope.to_string() }
    }
}

impl Filter for StoreLimitFilter {
    fn scope(&self) -> &str {
        &self.scope
    }
    fn kind(&self) -> &'static str {
        "store-limit-filter"
    }
    fn source(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        store.is_available(StoreLimitKind::RemovePeer)
    }
    fn target(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        store.is_available(StoreLimitKind::AddPeer)
    }
}

/// Lifecycle state: sources must not be tombstones, targets must be up.
pub struct StateFilter {
    scope: String,
}

impl StateFilter {
    pub fn new(scope: &str) -> Self {
        Self { scope: scope.to_string() }
    }
}

impl Filter for StateFilter {
    fn scope(&self) -> &str {
        &self.scope
    }
    fn kind(&self) -> &'static str {
        "state-filter"
    }
    fn source(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        !store.is_tombstone()
    }
    fn target(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        store.is_up()
    }
}

/// Rejects busy stores and stores whose heartbeat went stale.
pub struct HealthFilter {
    scope: String,
}

impl HealthFilter {
    pub fn new(scope: &str) -> Self {
        Self { scope: scope.to_string() }
    }

    fn check(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        !store.busy && store.down_time() <= cfg.max_store_down_time
    }
}

impl Filter for HealthFilter {
    fn scope(&self) -> &str {
        &self.scope
    }
    fn kind(&self) -> &'static str {
        "health-filter"
    }
    fn source(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        self.check(cfg, store)
    }
    fn target(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        self.check(cfg, store)
    }
}

/// Rejects stores with too many pending peers; a zero limit disables it.
pub struct PendingPeerCountFilter {
    scope: String,
}

impl PendingPeerCountFilter {
    pub fn new(scope: &str) -> Self {
        Self { scope: scope.to_string() }
    }

    fn check(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        cfg.max_pending_peer_count == 0
            || store.pending_peer_count as u64 <= cfg.max_pending_peer_count
    }
}

impl Filter for PendingPeerCountFilter {
    fn scope(&self) -> &str {
        &self.scope
    }
    fn kind(&self) -> &'static str {
        "pending-peer-filter"
    }
    fn source(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        self.check(cfg, store)
    }
    fn target(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        self.check(cfg, store)
    }
}

/// Rejects stores currently handling too many snapshots.
pub struct SnapshotCountFilter {
    scope: String,
}

impl SnapshotCountFilter {
    pub fn new(scope: &str) -> Self {
        Self { scope: scope.to_string() }
    }

    fn check(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        store.sending_snap_count <= cfg.max_snapshot_count
            && store.receiving_snap_count <= cfg.max_snapshot_count
            && store.applying_snap_count <= cfg.max_snapshot_count
    }
}

impl Filter for SnapshotCountFilter {
    fn scope(&self) -> &str {
        &self.scope
    }
    fn kind(&self) -> &'static str {
        "snapshot-filter"
    }
    fn source(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        self.check(cfg, store)
    }
    fn target(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        self.check(cfg, store)
    }
}

/// Targets must not be close to full.
pub struct StorageThresholdFilter {
    scope: String,
}

impl StorageThresholdFilter {
    pub fn new(scope: &str) -> Self {
        Self { scope: scope.to_string() }
    }
}

impl Filter for StorageThresholdFilter {
    fn scope(&self) -> &str {
        &self.scope
    }
    fn kind(&self) -> &'static str {
        "storage-threshold-filter"
    }
    fn target(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        !store.is_low_space(cfg.low_space_ratio)
    }
}

/// Ensures a replica move never lowers the region's isolation: the target's
/// distinct score against the other replica stores must reach the source's.
pub struct DistinctScoreFilter {
    scope: String,
    labels: Vec<String>,
    others: Vec<StoreInfo>,
    safe_score: f64,
}

impl DistinctScoreFilter {
    pub fn new(scope: &str, labels: Vec<String>, stores: &[StoreInfo], source: &StoreInfo) -> Self {
        let others: Vec<StoreInfo> =
            stores.iter().filter(|s| s.id != source.id).cloned().collect();
        let safe_score = distinct_score(&labels, &others, source);
        Self { scope: scope.to_string(), labels, others, safe_score }
    }
}

impl Filter for DistinctScoreFilter {
    fn scope(&self) -> &str {
        &self.scope
    }
    fn kind(&self) -> &'static str {
        "distinct-filter"
    }
    fn target(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        distinct_score(&self.labels, &self.others, store) >= self.safe_score
    }
}

/// Placement-rules counterpart of [`DistinctScoreFilter`]: replacing the old
/// peer with one on the candidate store must not worsen the region fit.
pub struct RuleFitFilter<'a> {
    scope: String,
    cluster: &'a Cluster,
    region: RegionInfo,
    old_fit: RegionFit,
    old_store: u64,
}

impl<'a> RuleFitFilter<'a> {
    pub fn new(scope: &str, cluster: &'a Cluster, region: &RegionInfo, old_store: u64) -> Self {
        let old_fit = cluster.fit_region(region);
        Self { scope: scope.to_string(), cluster, region: region.clone(), old_fit, old_store }
    }
}

impl Filter for RuleFitFilter<'_> {
    fn scope(&self) -> &str {
        &self.scope
    }
    fn kind(&self) -> &'static str {
        "rule-fit-filter"
    }
    fn target(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        let moved = self.region.clone().with_replaced_peer_store(self.old_store, store.id);
        let new_fit = self.cluster.fit_region(&moved);
        compare_region_fit(&self.old_fit, &new_fit) != std::cmp::Ordering::Greater
    }
}

/// Guards leader transfers under placement rules: moving the leadership onto
/// the candidate's peer must not worsen the fit.
pub struct RuleLeaderFitFilter<'a> {
    scope: String,
    cluster: &'a Cluster,
    region: RegionInfo,
    old_fit: RegionFit,
}

impl<'a> RuleLeaderFitFilter<'a> {
    pub fn new(scope: &str, cluster: &'a Cluster, region: &RegionInfo) -> Self {
        let old_fit = cluster.fit_region(region);
        Self { scope: scope.to_string(), cluster, region: region.clone(), old_fit }
    }
}

impl Filter for RuleLeaderFitFilter<'_> {
    fn scope(&self) -> &str {
        &self.scope
    }
    fn kind(&self) -> &'static str {
        "rule-fit-leader-filter"
    }
    fn target(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        let Some(peer) = self.region.get_store_voter(store.id) else {
            tracing::warn!(store = store.id, region = self.region.id,
                "leader fit filter found no voter on target store");
            return false;
        };
        let moved = self.region.clone().with_leader(Some(peer));
        let new_fit = self.cluster.fit_region(&moved);
        compare_region_fit(&self.old_fit, &new_fit) != std::cmp::Ordering::Greater
    }
}

/// Keeps only stores whose label constraints all hold.
pub struct LabelConstraintFilter {
    scope: String,
    constraints: Vec<LabelConstraint>,
}

impl LabelConstraintFilter {
    pub fn new(scope: &str, constraints: Vec<LabelConstraint>) -> Self {
        Self { scope: scope.to_string(), constraints }
    }
}

impl Filter for LabelConstraintFilter {
    fn scope(&self) -> &str {
        &self.scope
    }
    fn kind(&self) -> &'static str {
        "label-constraint-filter"
    }
    fn source(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        match_label_constraints(store, &self.constraints)
    }
    fn target(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        match_label_constraints(store, &self.constraints)
    }
}

/// Keeps only stores running one of the listed engines.
pub struct EngineFilter {
    scope: String,
    constraint: LabelConstraint,
}

impl EngineFilter {
    pub fn new(scope: &str, allowed_engines: Vec<String>) -> Self {
        Self {
            scope: scope.to_string(),
            constraint: LabelConstraint {
                key: ENGINE_KEY.to_string(),
                op: LabelConstraintOp::In,
                values: allowed_engines,
            },
        }
    }
}

impl Filter for EngineFilter {
    fn scope(&self) -> &str {
        &self.scope
    }
    fn kind(&self) -> &'static str {
        "engine-filter"
    }
    fn source(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        self.constraint.match_store(store)
    }
    fn target(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        self.constraint.match_store(store)
    }
}

/// Keeps only ordinary-engine stores, rejecting special engines such as the
/// columnar one.
pub struct OrdinaryEngineFilter {
    scope: String,
    constraint: LabelConstraint,
}

impl OrdinaryEngineFilter {
    pub fn new(scope: &str) -> Self {
        Self {
            scope: scope.to_string(),
            constraint: LabelConstraint {
                key: ENGINE_KEY.to_string(),
                op: LabelConstraintOp::NotIn,
                values: ALL_SPECIAL_ENGINES.iter().map(|s| s.to_string()).collect(),
            },
        }
    }
}

impl Filter for OrdinaryEngineFilter {
    fn scope(&self) -> &str {
        &self.scope
    }
    fn kind(&self) -> &'static str {
        "ordinary-engine-filter"
    }
    fn source(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        self.constraint.match_store(store)
    }
    fn target(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        self.constraint.match_store(store)
    }
}

/// Rejects stores reserved for a special use, except the uses explicitly
/// whitelisted. A low-space special store may still act as a source so data
/// can drain off it.
pub struct SpecialUseFilter {
    scope: String,
    constraint: LabelConstraint,
}

impl SpecialUseFilter {
    pub fn new(scope: &str, allow_uses: &[&str]) -> Self {
        let values = ALL_SPECIAL_USES
            .iter()
            .filter(|u| !allow_uses.contains(u))
            .map(|u| u.to_string())
            .collect();
        Self {
            scope: scope.to_string(),
            constraint: LabelConstraint {
                key: SPECIAL_USE_KEY.to_string(),
                op: LabelConstraintOp::In,
                values,
            },
        }
    }
}

impl Filter for SpecialUseFilter {
    fn scope(&self) -> &str {
        &self.scope
    }
    fn kind(&self) -> &'static str {
        "special-use-filter"
    }
    fn source(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        store.is_low_space(cfg.low_space_ratio) || !self.constraint.match_store(store)
    }
    fn target(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        !self.constraint.match_store(store)
    }
}

/// Composite state filter parameterized by what the schedule does: it folds
/// the lifecycle, liveness, busy, snapshot, store-limit and `reject-leader`
/// checks appropriate for a leader transfer and/or a region move.
pub struct StoreStateFilter {
    pub action_scope: String,
    /// The schedule involves a leader transfer.
    pub transfer_leader: bool,
    /// The schedule involves moving a region peer.
    pub move_region: bool,
}

impl StoreStateFilter {
    fn check_move_region(&self, cfg: &ScheduleConfig, is_source: bool, store: &StoreInfo) -> bool {
        if store.busy {
            return false;
        }
        let kind = if is_source { StoreLimitKind::RemovePeer } else { StoreLimitKind::AddPeer };
        if !store.is_available(kind) {
            return false;
        }
        store.sending_snap_count <= cfg.max_snapshot_count
            && store.receiving_snap_count <= cfg.max_snapshot_count
            && store.applying_snap_count <= cfg.max_snapshot_count
    }
}

impl Filter for StoreStateFilter {
    fn scope(&self) -> &str {
        &self.action_scope
    }
    fn kind(&self) -> &'static str {
        "store-state-filter"
    }

    fn source(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        if store.is_tombstone() || store.down_time() > cfg.max_store_down_time {
            return false;
        }
        if self.transfer_leader && store.is_disconnected() {
            return false;
        }
        if self.move_region && !self.check_move_region(cfg, true, store) {
            return false;
        }
        true
    }

    fn target(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        if store.is_tombstone()
            || store.is_offline()
            || store.down_time() > cfg.max_store_down_time
        {
            return false;
        }
        if self.transfer_leader
            && (store.is_disconnected()
                || store.busy
                || cfg.check_label_property(REJECT_LEADER, &store.labels))
        {
            return false;
        }
        if self.move_region {
            // Only the target minds pending peers: piling more onto a slow
            // disk makes it slower.
            if cfg.max_pending_peer_count > 0
                && store.pending_peer_count as u64 > cfg.max_pending_peer_count
            {
                return false;
            }
            if !self.check_move_region(cfg, false, store) {
                return false;
            }
        }
        true
    }
}

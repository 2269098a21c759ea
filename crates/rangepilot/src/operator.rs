//! Operators: typed multi-step reconfiguration plans with a lifecycle.
//!
//! An operator targets one region and advances step by step as region
//! heartbeats reveal the new configuration. Advancement is monotone and
//! idempotent; re-observing the same post-step configuration is a no-op.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::heartbeat::{RegionHeartbeatResponse, SplitPolicy};
use crate::region::{Peer, RegionEpoch, RegionInfo};

/// Bitmask classifying an operator. An operator may carry several kinds
/// (e.g. a balance move is `REGION | BALANCE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpKind(pub u32);

impl OpKind {
    pub const LEADER: OpKind = OpKind(1);
    pub const REGION: OpKind = OpKind(1 << 1);
    pub const SPLIT: OpKind = OpKind(1 << 2);
    pub const ADMIN: OpKind = OpKind(1 << 3);
    pub const HOT_REGION: OpKind = OpKind(1 << 4);
    pub const REPLICA: OpKind = OpKind(1 << 5);
    pub const MERGE: OpKind = OpKind(1 << 6);
    pub const BALANCE: OpKind = OpKind(1 << 7);

    pub fn contains(self, other: OpKind) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: OpKind) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for OpKind {
    type Output = OpKind;
    fn bitor(self, rhs: OpKind) -> OpKind {
        OpKind(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpKind {
    fn bitor_assign(&mut self, rhs: OpKind) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (OpKind::LEADER, "leader"),
            (OpKind::REGION, "region"),
            (OpKind::SPLIT, "split"),
            (OpKind::ADMIN, "admin"),
            (OpKind::HOT_REGION, "hot-region"),
            (OpKind::REPLICA, "replica"),
            (OpKind::MERGE, "merge"),
            (OpKind::BALANCE, "balance"),
        ];
        let mut first = true;
        for (kind, name) in names {
            if self.contains(kind) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Operator priority; a higher-priority operator replaces a lower one on the
/// same region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OpPriority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Created,
    Started,
    Success,
    Cancelled,
    Replaced,
    Expired,
    Timeout,
}

impl OpStatus {
    pub fn is_end(self) -> bool {
        !matches!(self, OpStatus::Created | OpStatus::Started)
    }
}

/// One atomic reconfiguration. Steps carry the ids the transport needs so
/// the store can apply them without a second round-trip.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    AddLearner { store_id: u64, peer_id: u64 },
    PromoteLearner { store_id: u64, peer_id: u64 },
    RemovePeer { store_id: u64 },
    TransferLeader { from_store: u64, to_store: u64 },
    MergeRegion { target_id: u64, result_start: Vec<u8>, result_end: Vec<u8>, is_passive: bool },
    SplitRegion { policy: SplitPolicy, keys: Vec<Vec<u8>>, base_version: u64 },
}

impl Step {
    /// Whether the reported configuration shows the step applied.
    pub fn is_finished(&self, region: &RegionInfo) -> bool {
        match self {
            Step::AddLearner { store_id, peer_id } => {
                region.get_store_peer(*store_id).map_or(false, |p| p.id == *peer_id)
            }
            Step::PromoteLearner { store_id, peer_id } => {
                region.get_store_voter(*store_id).map_or(false, |p| p.id == *peer_id)
            }
            Step::RemovePeer { store_id } => region.get_store_peer(*store_id).is_none(),
            Step::TransferLeader { to_store, .. } => region.leader_store_id() == Some(*to_store),
            Step::MergeRegion { result_start, result_end, is_passive, .. } => {
                // The absorbing side observes its range growing to the union;
                // the absorbed side disappears and is finished by the
                // controller when the model drops the region.
                *is_passive
                    && region.start_key == *result_start
                    && region.end_key == *result_end
            }
            Step::SplitRegion { base_version, .. } => region.epoch.version > *base_version,
        }
    }

    /// Which store-limit token this step holds while in flight.
    pub fn token(&self) -> Option<(u64, crate::config::StoreLimitKind)> {
        match self {
            Step::AddLearner { store_id, .. } => {
                Some((*store_id, crate::config::StoreLimitKind::AddPeer))
            }
            Step::RemovePeer { store_id } => {
                Some((*store_id, crate::config::StoreLimitKind::RemovePeer))
            }
            _ => None,
        }
    }

    /// Wall-clock budget, derived from whether the step moves data and how
    /// big the region is.
    fn timeout(&self, region_size_mb: u64) -> Duration {
        const FAST: u64 = 10;
        const SLOW: u64 = 600;
        match self {
            Step::AddLearner { .. } => Duration::from_secs(SLOW.max(region_size_mb)),
            Step::MergeRegion { .. } | Step::SplitRegion { .. } => Duration::from_secs(SLOW),
            Step::PromoteLearner { .. } | Step::RemovePeer { .. } | Step::TransferLeader { .. } => {
                Duration::from_secs(FAST)
            }
        }
    }

    /// Render the step as a heartbeat response. Passive merge halves wait for
    /// the active side and send nothing.
    pub fn to_response(&self, region: &RegionInfo) -> Option<RegionHeartbeatResponse> {
        let region_id = region.id;
        match self {
            Step::AddLearner { store_id, peer_id } => Some(RegionHeartbeatResponse::AddLearner {
                region_id,
                peer: Peer::learner(*peer_id, *store_id),
            }),
            Step::PromoteLearner { store_id, peer_id } => {
                Some(RegionHeartbeatResponse::PromoteLearner {
                    region_id,
                    peer: Peer::voter(*peer_id, *store_id),
                })
            }
            Step::RemovePeer { store_id } => {
                let peer = region.get_store_peer(*store_id)?;
                Some(RegionHeartbeatResponse::RemovePeer { region_id, peer })
            }
            Step::TransferLeader { to_store, .. } => {
                let peer = region.get_store_voter(*to_store)?;
                Some(RegionHeartbeatResponse::TransferLeader { region_id, peer })
            }
            Step::MergeRegion { target_id, is_passive, .. } => {
                if *is_passive {
                    None
                } else {
                    Some(RegionHeartbeatResponse::MergeRegion { region_id, target: *target_id })
                }
            }
            Step::SplitRegion { policy, keys, .. } => Some(RegionHeartbeatResponse::SplitRegion {
                region_id,
                policy: *policy,
                keys: keys.clone(),
            }),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::AddLearner { store_id, .. } => write!(f, "add learner on store {store_id}"),
            Step::PromoteLearner { store_id, .. } => {
                write!(f, "promote learner on store {store_id}")
            }
            Step::RemovePeer { store_id } => write!(f, "remove peer on store {store_id}"),
            Step::TransferLeader { from_store, to_store } => {
                write!(f, "transfer leader from store {from_store} to store {to_store}")
            }
            Step::MergeRegion { target_id, is_passive, .. } => {
                if *is_passive {
                    write!(f, "await merge into region {target_id}")
                } else {
                    write!(f, "merge into region {target_id}")
                }
            }
            Step::SplitRegion { .. } => write!(f, "split region"),
        }
    }
}

/// A never-started operator is garbage-collected after this long.
pub const OPERATOR_MAX_WAIT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
struct OpState {
    status: OpStatus,
    current_step: usize,
    step_started_at: Instant,
    end_time: Option<Instant>,
}

/// An ordered list of steps targeting one region.
#[derive(Debug)]
pub struct Operator {
    pub region_id: u64,
    pub desc: String,
    pub kind: OpKind,
    pub region_epoch: RegionEpoch,
    pub priority: OpPriority,
    pub steps: Vec<Step>,
    pub create_time: Instant,
    step_budgets: Vec<Duration>,
    state: Mutex<OpState>,
}

impl Operator {
    pub fn new(
        desc: impl Into<String>,
        region: &RegionInfo,
        kind: OpKind,
        steps: Vec<Step>,
        priority: OpPriority,
    ) -> Self {
        let step_budgets = steps.iter().map(|s| s.timeout(region.approximate_size)).collect();
        Self {
            region_id: region.id,
            desc: desc.into(),
            kind,
            region_epoch: region.epoch,
            priority,
            steps,
            create_time: Instant::now(),
            step_budgets,
            state: Mutex::new(OpState {
                status: OpStatus::Created,
                current_step: 0,
                step_started_at: Instant::now(),
                end_time: None,
            }),
        }
    }

    pub fn status(&self) -> OpStatus {
        self.state.lock().unwrap().status
    }

    pub fn is_end(&self) -> bool {
        self.status().is_end()
    }

    pub fn current_step_index(&self) -> usize {
        self.state.lock().unwrap().current_step
    }

    pub fn step(&self, idx: usize) -> Option<&Step> {
        self.steps.get(idx)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Time spent since the operator ended, if it has.
    pub fn time_since_end(&self) -> Option<Duration> {
        self.state.lock().unwrap().end_time.map(|t| t.elapsed())
    }

    pub fn mark_started(&self) {
        let mut state = self.state.lock().unwrap();
        if state.status == OpStatus::Created {
            state.status = OpStatus::Started;
            state.step_started_at = Instant::now();
        }
    }

    fn finish(&self, status: OpStatus) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status.is_end() {
            return false;
        }
        state.status = status;
        state.end_time = Some(Instant::now());
        true
    }

    pub fn cancel(&self) -> bool {
        self.finish(OpStatus::Cancelled)
    }

    /// Force-complete the operator; used when success is observed out of
    /// band, e.g. the absorbed side of a merge vanishing from the model.
    pub fn mark_success(&self) -> bool {
        self.finish(OpStatus::Success)
    }

    pub fn replace(&self) -> bool {
        self.finish(OpStatus::Replaced)
    }

    pub fn expire(&self) -> bool {
        self.finish(OpStatus::Expired)
    }

    /// Advance past finished steps given the reported configuration, and
    /// return the current unfinished step. `None` means the operator just
    /// completed (or already ended).
    pub fn check(&self, region: &RegionInfo) -> Option<Step> {
        let mut state = self.state.lock().unwrap();
        if state.status.is_end() {
            return None;
        }
        while state.current_step < self.steps.len()
            && self.steps[state.current_step].is_finished(region)
        {
            state.current_step += 1;
            state.step_started_at = Instant::now();
        }
        if state.current_step == self.steps.len() {
            state.status = OpStatus::Success;
            state.end_time = Some(Instant::now());
            return None;
        }
        Some(self.steps[state.current_step].clone())
    }

    /// Whether the current step has exceeded its budget; marks the operator
    /// timed out when it has.
    pub fn check_timeout(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status.is_end() {
            return state.status == OpStatus::Timeout;
        }
        if state.status != OpStatus::Started {
            return false;
        }
        let budget = self.step_budgets.get(state.current_step).copied().unwrap_or_default();
        if state.step_started_at.elapsed() > budget {
            state.status = OpStatus::Timeout;
            state.end_time = Some(Instant::now());
            return true;
        }
        false
    }

    /// Whether the operator went stale before ever starting; marks it
    /// expired when it has.
    pub fn check_expired(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status.is_end() {
            return state.status == OpStatus::Expired;
        }
        if state.status == OpStatus::Created && self.create_time.elapsed() > OPERATOR_MAX_WAIT {
            state.status = OpStatus::Expired;
            state.end_time = Some(Instant::now());
            return true;
        }
        false
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (kind: {}, region: {}", self.desc, self.kind, self.region_id)?;
        for step in &self.steps {
            write!(f, ", {step}")?;
        }
        f.write_str(")")
    }
}

// ---- builders ----

pub fn create_transfer_leader_operator(
    desc: impl Into<String>,
    region: &RegionInfo,
    from_store: u64,
    to_store: u64,
    kind: OpKind,
) -> Operator {
    let steps = vec![Step::TransferLeader { from_store, to_store }];
    Operator::new(desc, region, kind | OpKind::LEADER, steps, OpPriority::Normal)
}

pub fn create_promote_learner_operator(
    desc: impl Into<String>,
    region: &RegionInfo,
    peer: Peer,
) -> Operator {
    let steps = vec![Step::PromoteLearner { store_id: peer.store_id, peer_id: peer.id }];
    Operator::new(desc, region, OpKind::REGION, steps, OpPriority::Normal)
}

pub fn create_remove_peer_operator(
    desc: impl Into<String>,
    region: &RegionInfo,
    kind: OpKind,
    store_id: u64,
) -> Operator {
    let steps = vec![Step::RemovePeer { store_id }];
    Operator::new(desc, region, kind | OpKind::REGION, steps, OpPriority::Normal)
}

pub fn create_add_peer_operator(
    desc: impl Into<String>,
    region: &RegionInfo,
    kind: OpKind,
    store_id: u64,
    peer_id: u64,
) -> Operator {
    let steps = vec![
        Step::AddLearner { store_id, peer_id },
        Step::PromoteLearner { store_id, peer_id },
    ];
    Operator::new(desc, region, kind | OpKind::REGION, steps, OpPriority::Normal)
}

/// Move a peer from `src_store` to `dst_store`: add a learner on the target,
/// promote it, hand leadership over if the source held it, then drop the
/// source peer.
pub fn create_move_peer_operator(
    desc: impl Into<String>,
    region: &RegionInfo,
    kind: OpKind,
    src_store: u64,
    dst_store: u64,
    new_peer_id: u64,
) -> Operator {
    let mut steps = vec![
        Step::AddLearner { store_id: dst_store, peer_id: new_peer_id },
        Step::PromoteLearner { store_id: dst_store, peer_id: new_peer_id },
    ];
    let mut op_kind = kind | OpKind::REGION;
    if region.leader_store_id() == Some(src_store) {
        steps.push(Step::TransferLeader { from_store: src_store, to_store: dst_store });
        op_kind |= OpKind::LEADER;
    }
    steps.push(Step::RemovePeer { store_id: src_store });
    Operator::new(desc, region, op_kind, steps, OpPriority::Normal)
}

/// Replace the peer on `old_store` with a fresh one on `new_store`. When the
/// outgoing store holds the leadership the transfer happens first so the
/// region never loses its leader mid-replacement; `leader_to` picks the
/// interim leader.
pub fn create_replace_peer_operator(
    desc: impl Into<String>,
    region: &RegionInfo,
    kind: OpKind,
    old_store: u64,
    new_store: u64,
    new_peer_id: u64,
    leader_to: Option<u64>,
) -> Operator {
    let mut steps = Vec::with_capacity(4);
    let mut op_kind = kind | OpKind::REGION;
    if region.leader_store_id() == Some(old_store) {
        if let Some(to_store) = leader_to {
            steps.push(Step::TransferLeader { from_store: old_store, to_store });
            op_kind |= OpKind::LEADER;
        }
    }
    steps.push(Step::AddLearner { store_id: new_store, peer_id: new_peer_id });
    steps.push(Step::PromoteLearner { store_id: new_store, peer_id: new_peer_id });
    steps.push(Step::RemovePeer { store_id: old_store });
    Operator::new(desc, region, op_kind, steps, OpPriority::Normal)
}

/// Merge `source` into `target`. Produces the coupled pair: the active
/// operator drives the source region, the passive one tracks the target until
/// its range covers the union. Both must be admitted together.
pub fn create_merge_operators(
    desc: impl Into<String>,
    source: &RegionInfo,
    target: &RegionInfo,
) -> (Operator, Operator) {
    let desc = desc.into();
    let result_start = source.start_key.clone().min(target.start_key.clone());
    let result_end = if source.end_key.is_empty() || target.end_key.is_empty() {
        Vec::new()
    } else {
        source.end_key.clone().max(target.end_key.clone())
    };
    let active = Operator::new(
        desc.clone(),
        source,
        OpKind::MERGE,
        vec![Step::MergeRegion {
            target_id: target.id,
            result_start: result_start.clone(),
            result_end: result_end.clone(),
            is_passive: false,
        }],
        OpPriority::Normal,
    );
    let passive = Operator::new(
        desc,
        target,
        OpKind::MERGE,
        vec![Step::MergeRegion {
            target_id: target.id,
            result_start,
            result_end,
            is_passive: true,
        }],
        OpPriority::Normal,
    );
    (active, passive)
}

pub fn create_split_operator(
    desc: impl Into<String>,
    region: &RegionInfo,
    policy: SplitPolicy,
    keys: Vec<Vec<u8>>,
) -> Operator {
    let steps = vec![Step::SplitRegion { policy, keys, base_version: region.epoch.version }];
    Operator::new(desc, region, OpKind::SPLIT, steps, OpPriority::Normal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> RegionInfo {
        let peers = vec![Peer::voter(1, 1), Peer::voter(2, 2), Peer::voter(3, 3)];
        let mut r = RegionInfo::new(1, peers.clone(), Some(peers[0]));
        r.approximate_size = 64;
        r
    }

    #[test]
    fn kind_mask_composes() {
        let kind = OpKind::REGION | OpKind::BALANCE;
        assert!(kind.contains(OpKind::REGION));
        assert!(kind.contains(OpKind::BALANCE));
        assert!(!kind.contains(OpKind::LEADER));
        assert!(kind.intersects(OpKind::REGION | OpKind::LEADER));
        assert_eq!(kind.to_string(), "region,balance");
    }

    #[test]
    fn move_peer_advances_through_configuration_changes() {
        let r = region();
        let op = create_move_peer_operator("test-move", &r, OpKind::BALANCE, 3, 4, 99);
        assert_eq!(op.steps.len(), 3);
        op.mark_started();

        // Nothing applied yet.
        assert_eq!(op.check(&r), Some(Step::AddLearner { store_id: 4, peer_id: 99 }));

        // Learner appears.
        let r = r.with_added_peer(Peer::learner(99, 4));
        assert_eq!(op.check(&r), Some(Step::PromoteLearner { store_id: 4, peer_id: 99 }));

        // Promotion and removal in one observed jump: both steps advance.
        let r = r.with_promoted_learner(99).with_removed_store_peer(3);
        assert_eq!(op.check(&r), None);
        assert_eq!(op.status(), OpStatus::Success);

        // Replaying the same heartbeat does not resurrect the operator.
        assert_eq!(op.check(&r), None);
        assert_eq!(op.status(), OpStatus::Success);
    }

    #[test]
    fn move_peer_from_leader_store_includes_transfer() {
        let r = region();
        let op = create_move_peer_operator("test-move", &r, OpKind::BALANCE, 1, 4, 99);
        assert!(op.kind.contains(OpKind::LEADER));
        assert_eq!(op.steps[2], Step::TransferLeader { from_store: 1, to_store: 4 });
    }

    #[test]
    fn replace_peer_transfers_leadership_first() {
        let r = region();
        let op = create_replace_peer_operator(
            "replace-offline-replica",
            &r,
            OpKind::REPLICA,
            1,
            4,
            99,
            Some(3),
        );
        assert_eq!(op.steps[0], Step::TransferLeader { from_store: 1, to_store: 3 });
        assert_eq!(op.steps[1], Step::AddLearner { store_id: 4, peer_id: 99 });
        assert_eq!(op.steps[3], Step::RemovePeer { store_id: 1 });
    }

    #[test]
    fn merge_pair_shares_the_result_range() {
        let source = region().with_range(b"b".to_vec(), b"c".to_vec());
        let mut target = region().with_range(b"a".to_vec(), b"b".to_vec());
        target.id = 2;
        let (active, passive) = create_merge_operators("merge-adjacent", &source, &target);
        assert_eq!(active.region_id, source.id);
        assert_eq!(passive.region_id, target.id);

        // The passive side completes once the target covers the union.
        let grown = target.clone().with_range(b"a".to_vec(), b"c".to_vec());
        assert!(passive.steps[0].is_finished(&grown));
        assert!(!active.steps[0].is_finished(&source));
    }

    #[test]
    fn terminal_status_is_sticky() {
        let r = region();
        let op = create_transfer_leader_operator("t", &r, 1, 2, OpKind::ADMIN);
        assert!(op.cancel());
        assert!(!op.replace());
        assert_eq!(op.status(), OpStatus::Cancelled);
        assert!(op.time_since_end().is_some());
    }

    #[test]
    fn step_tokens_cover_add_and_remove_only() {
        use crate::config::StoreLimitKind;
        let add = Step::AddLearner { store_id: 4, peer_id: 9 };
        let remove = Step::RemovePeer { store_id: 1 };
        let transfer = Step::TransferLeader { from_store: 1, to_store: 2 };
        assert_eq!(add.token(), Some((4, StoreLimitKind::AddPeer)));
        assert_eq!(remove.token(), Some((1, StoreLimitKind::RemovePeer)));
        assert_eq!(transfer.token(), None);
    }
}

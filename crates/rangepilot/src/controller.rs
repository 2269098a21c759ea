//! Operator controller: admission, tracking and garbage collection of
//! in-flight operators.
//!
//! The controller owns its lock and never acquires it while holding the
//! cluster write lock (lock order: controller, then cluster). Admission
//! atomically checks kind counters, reserves store-limit tokens and starts
//! the operator; region heartbeats advance steps through `dispatch`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cluster::Cluster;
use crate::config::StoreLimitKind;
use crate::error::{RejectReason, SchedError};
use crate::heartbeat::HeartbeatStreams;
use crate::operator::{OpKind, OpStatus, Operator, Step};
use crate::region::RegionInfo;

const RECORD_CAPACITY: usize = 1000;
const BACKGROUND_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// A finished operator kept for admin inspection.
#[derive(Debug, Clone)]
pub struct OperatorRecord {
    pub region_id: u64,
    pub desc: String,
    pub kind: OpKind,
    pub status: OpStatus,
    pub finished_at: Instant,
}

/// Store-limit tokens held by a live operator, one entry per unreleased step.
type Reservations = Vec<(usize, u64, StoreLimitKind)>;

#[derive(Default)]
struct Inner {
    operators: HashMap<u64, Arc<Operator>>,
    reservations: HashMap<u64, Reservations>,
    waiting: VecDeque<Arc<Operator>>,
    records: VecDeque<OperatorRecord>,
}

impl Inner {
    fn record(&mut self, op: &Operator) {
        if self.records.len() == RECORD_CAPACITY {
            self.records.pop_front();
        }
        self.records.push_back(OperatorRecord {
            region_id: op.region_id,
            desc: op.desc.clone(),
            kind: op.kind,
            status: op.status(),
            finished_at: Instant::now(),
        });
    }
}

pub struct OperatorController {
    cluster: Arc<Cluster>,
    streams: Arc<HeartbeatStreams>,
    inner: Mutex<Inner>,
}

impl OperatorController {
    pub fn new(cluster: Arc<Cluster>, streams: Arc<HeartbeatStreams>) -> Arc<Self> {
        Arc::new(Self { cluster, streams, inner: Mutex::new(Inner::default()) })
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Live operators whose kind intersects `mask`.
    pub fn operator_count(&self, mask: OpKind) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.operators.values().filter(|op| op.kind.intersects(mask)).count() as u64
    }

    pub fn get_operator(&self, region_id: u64) -> Option<Arc<Operator>> {
        self.inner.lock().unwrap().operators.get(&region_id).cloned()
    }

    pub fn records(&self) -> Vec<OperatorRecord> {
        self.inner.lock().unwrap().records.iter().cloned().collect()
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.lock().unwrap().waiting.len()
    }

    /// The schedule limit governing an operator of this kind, if any.
    fn kind_limit(&self, kind: OpKind) -> Option<(OpKind, u64)> {
        let cfg = self.cluster.config();
        if kind.contains(OpKind::ADMIN) {
            return None;
        }
        if kind.contains(OpKind::MERGE) {
            Some((OpKind::MERGE, cfg.merge_schedule_limit))
        } else if kind.contains(OpKind::HOT_REGION) {
            Some((OpKind::HOT_REGION, cfg.hot_region_schedule_limit))
        } else if kind.contains(OpKind::REPLICA) {
            Some((OpKind::REPLICA, cfg.replica_schedule_limit))
        } else if kind.contains(OpKind::REGION) {
            Some((OpKind::REGION, cfg.region_schedule_limit))
        } else {
            Some((OpKind::LEADER, cfg.leader_schedule_limit))
        }
    }

    fn has_capacity(&self, inner: &Inner, kind: OpKind) -> bool {
        match self.kind_limit(kind) {
            None => true,
            Some((mask, limit)) => {
                let live =
                    inner.operators.values().filter(|op| op.kind.intersects(mask)).count() as u64;
                live < limit
            }
        }
    }

    pub fn add_operator(&self, op: Operator) -> crate::error::Result<Arc<Operator>> {
        Ok(self.add_operators(vec![op])?.remove(0))
    }

    /// Admit a batch atomically: either every operator is accepted (running
    /// or queued) or none is. Merge pairs rely on this.
    pub fn add_operators(&self, ops: Vec<Operator>) -> crate::error::Result<Vec<Arc<Operator>>> {
        let mut inner = self.inner.lock().unwrap();

        // Validate everything before committing anything.
        for op in &ops {
            let region = self
                .cluster
                .get_region(op.region_id)
                .ok_or(SchedError::RegionNotFound(op.region_id))?;
            if region.epoch != op.region_epoch {
                return Err(SchedError::OperatorRejected(RejectReason::Cancelled));
            }
            if let Some(Step::TransferLeader { from_store, .. }) = op.step(0) {
                if region.leader_store_id() != Some(*from_store) {
                    return Err(SchedError::OperatorRejected(RejectReason::Cancelled));
                }
            }
            if let Some(old) = inner.operators.get(&op.region_id) {
                if old.priority >= op.priority {
                    return Err(SchedError::OperatorRejected(RejectReason::AlreadyExists));
                }
            }
        }

        // Preempt lower-priority operators now that the batch is accepted.
        for op in &ops {
            if let Some(old) = inner.operators.get(&op.region_id).cloned() {
                old.replace();
                tracing::info!(region = old.region_id, desc = %old.desc,
                    "operator replaced by a higher-priority one");
                self.finish_locked(&mut inner, &old);
            }
        }

        let mut admitted: Vec<Arc<Operator>> = Vec::with_capacity(ops.len());
        for op in ops {
            let op = Arc::new(op);
            let result = if self.has_capacity(&inner, op.kind) {
                self.start_locked(&mut inner, Arc::clone(&op))
            } else {
                let cfg = self.cluster.config();
                if inner.waiting.len() as u64 >= cfg.scheduler_max_waiting_operator {
                    Err(SchedError::SchedulerBusy)
                } else {
                    tracing::debug!(region = op.region_id, desc = %op.desc, "operator queued");
                    inner.waiting.push_back(Arc::clone(&op));
                    Ok(())
                }
            };
            if let Err(err) = result {
                // All-or-none: roll back everything admitted so far.
                for prior in &admitted {
                    prior.cancel();
                    self.rollback_locked(&mut inner, prior);
                }
                return Err(err);
            }
            admitted.push(op);
        }
        Ok(admitted)
    }

    /// Undo an admission made earlier in a failed batch: refund tokens and
    /// drop the operator without recording it.
    fn rollback_locked(&self, inner: &mut Inner, op: &Operator) {
        if let Some(reserved) = inner.reservations.remove(&op.region_id) {
            for (_, store_id, kind) in reserved {
                if let Some(store) = self.cluster.get_store(store_id) {
                    store.limit().refund(kind);
                }
            }
        }
        inner.operators.remove(&op.region_id);
        inner.waiting.retain(|w| w.region_id != op.region_id);
    }

    /// Reserve tokens and mark the operator started. Caller holds the lock.
    fn start_locked(&self, inner: &mut Inner, op: Arc<Operator>) -> crate::error::Result<()> {
        let mut reserved: Reservations = Vec::new();
        for (idx, step) in op.steps.iter().enumerate() {
            let Some((store_id, kind)) = step.token() else { continue };
            let store = self.cluster.get_store(store_id).ok_or_else(|| {
                for (_, id, k) in &reserved {
                    if let Some(s) = self.cluster.get_store(*id) {
                        s.limit().refund(*k);
                    }
                }
                SchedError::StoreNotFound(store_id)
            })?;
            if !store.limit().take(kind) {
                for (_, id, k) in &reserved {
                    if let Some(s) = self.cluster.get_store(*id) {
                        s.limit().refund(*k);
                    }
                }
                return Err(SchedError::OperatorRejected(RejectReason::StoreLimitExhausted));
            }
            reserved.push((idx, store_id, kind));
        }
        op.mark_started();
        tracing::info!(region = op.region_id, op = %op, "operator started");
        inner.reservations.insert(op.region_id, reserved);
        inner.operators.insert(op.region_id, op);
        Ok(())
    }

    /// Release tokens held for steps the operator has advanced past.
    fn release_completed_steps(&self, inner: &mut Inner, op: &Operator) {
        let current = op.current_step_index();
        if let Some(reserved) = inner.reservations.get_mut(&op.region_id) {
            reserved.retain(|(idx, store_id, kind)| {
                if *idx < current {
                    if let Some(store) = self.cluster.get_store(*store_id) {
                        store.limit().refund(*kind);
                    }
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Drop a finished operator: release every remaining token, record it and
    /// let a queued operator in.
    fn finish_locked(&self, inner: &mut Inner, op: &Operator) {
        // Whatever was not already released on step completion comes back
        // now; the buckets bound in-flight operations, not total throughput.
        if let Some(reserved) = inner.reservations.remove(&op.region_id) {
            for (_, store_id, kind) in reserved {
                if let Some(store) = self.cluster.get_store(store_id) {
                    store.limit().refund(kind);
                }
            }
        }
        inner.operators.remove(&op.region_id);
        inner.record(op);
        self.promote_waiting_locked(inner);
    }

    fn promote_waiting_locked(&self, inner: &mut Inner) {
        while let Some(op) = inner.waiting.front().cloned() {
            if op.is_end() {
                inner.waiting.pop_front();
                continue;
            }
            if !self.has_capacity(inner, op.kind) {
                break;
            }
            inner.waiting.pop_front();
            if let Err(err) = self.start_locked(inner, Arc::clone(&op)) {
                tracing::debug!(region = op.region_id, error = %err,
                    "queued operator could not start, requeueing");
                inner.waiting.push_back(op);
                break;
            }
        }
    }

    /// Full heartbeat ingestion: fold the report into the cluster model,
    /// settle operators on regions the report swallowed, then advance the
    /// region's own operator. This is the loop-closing entry point the
    /// transport calls per region heartbeat.
    pub fn process_region_heartbeat(&self, region: RegionInfo) -> crate::error::Result<()> {
        let removed = self.cluster.process_region_heartbeat(region.clone())?;
        for region_id in removed {
            self.on_region_removed(region_id);
        }
        self.dispatch(&region);
        Ok(())
    }

    /// Advance the operator on this region from a fresh heartbeat.
    pub fn dispatch(&self, region: &RegionInfo) {
        let Some(op) = self.get_operator(region.id) else { return };

        // The region reconfigured underneath the operator: a version bump
        // the operator did not ask for means it split or merged in flight.
        if region.epoch.version > op.region_epoch.version
            && !op.kind.intersects(OpKind::MERGE | OpKind::SPLIT)
        {
            tracing::info!(region = region.id, desc = %op.desc,
                "cancelling operator: region version changed in flight");
            self.cancel_locked(&op);
            return;
        }
        if region.leader.is_none() {
            tracing::info!(region = region.id, desc = %op.desc,
                "cancelling operator: region lost its leader");
            self.cancel_locked(&op);
            return;
        }

        match op.check(region) {
            None => {
                if op.status() == OpStatus::Success {
                    tracing::info!(region = region.id, op = %op, "operator finished");
                }
                let mut inner = self.inner.lock().unwrap();
                self.finish_locked(&mut inner, &op);
            }
            Some(step) => {
                let mut inner = self.inner.lock().unwrap();
                self.release_completed_steps(&mut inner, &op);
                drop(inner);
                if op.check_timeout() {
                    tracing::warn!(region = region.id, op = %op, "operator timed out");
                    let mut inner = self.inner.lock().unwrap();
                    self.finish_locked(&mut inner, &op);
                    return;
                }
                if let Some(msg) = step.to_response(region) {
                    self.streams.send_msg(region, msg);
                }
            }
        }
    }

    fn cancel_locked(&self, op: &Operator) {
        op.cancel();
        let mut inner = self.inner.lock().unwrap();
        self.finish_locked(&mut inner, op);
    }

    /// The region disappeared from the model. Its merge operator succeeded;
    /// anything else in flight is cancelled.
    pub fn on_region_removed(&self, region_id: u64) {
        let Some(op) = self.get_operator(region_id) else { return };
        if op.kind.contains(OpKind::MERGE) {
            // The absorbed side of a merge vanishing from the model is the
            // success signal for its operator.
            op.mark_success();
        } else {
            tracing::info!(region = region_id, desc = %op.desc,
                "cancelling operator: region removed from the model");
            op.cancel();
        }
        let mut inner = self.inner.lock().unwrap();
        self.finish_locked(&mut inner, &op);
    }

    /// Synchronous administrative cancel: returns once the operator is gone
    /// and its tokens are back.
    pub fn cancel_operator(&self, region_id: u64) -> bool {
        let Some(op) = self.get_operator(region_id) else { return false };
        op.cancel();
        let mut inner = self.inner.lock().unwrap();
        self.finish_locked(&mut inner, &op);
        true
    }

    /// One pass of the timeout/expiry scan.
    pub fn scan_once(&self) {
        let live: Vec<Arc<Operator>> =
            self.inner.lock().unwrap().operators.values().cloned().collect();
        for op in live {
            if op.check_timeout() {
                tracing::warn!(region = op.region_id, op = %op, "operator timed out");
                let mut inner = self.inner.lock().unwrap();
                self.finish_locked(&mut inner, &op);
            }
        }
        let mut inner = self.inner.lock().unwrap();
        let mut kept = VecDeque::with_capacity(inner.waiting.len());
        while let Some(op) = inner.waiting.pop_front() {
            if op.check_expired() {
                tracing::debug!(region = op.region_id, desc = %op.desc, "waiting operator expired");
                inner.record(&op);
            } else {
                kept.push_back(op);
            }
        }
        inner.waiting = kept;
        self.promote_waiting_locked(&mut inner);
    }

    /// Background loop driving the scan until shutdown.
    pub fn spawn_background(self: &Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BACKGROUND_SCAN_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => controller.scan_once(),
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

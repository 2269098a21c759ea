//! Store model: lifecycle, liveness, load counters and operation rate limits.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::StoreLimitKind;

/// A store is considered disconnected once its heartbeat is older than this.
pub const STORE_DISCONNECT_DURATION: Duration = Duration::from_secs(20);

/// Store lifecycle state. `Tombstone` is terminal; `Offline` only becomes
/// `Tombstone` once no region references the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreState {
    Up,
    Offline,
    Tombstone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLabel {
    pub key: String,
    pub value: String,
}

/// One refillable token bucket. Tokens are taken at operator admission and
/// refunded when the corresponding step completes or the operator ends.
#[derive(Debug)]
struct TokenBucket {
    rate_per_min: f64,
    available: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_min: f64) -> Self {
        Self { rate_per_min, available: rate_per_min.max(1.0), last_refill: Instant::now() }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.available =
            (self.available + elapsed / 60.0 * self.rate_per_min).min(self.rate_per_min.max(1.0));
        self.last_refill = now;
    }

    fn is_available(&mut self) -> bool {
        self.refill();
        self.available >= 1.0
    }

    fn take(&mut self) -> bool {
        self.refill();
        if self.available < 1.0 {
            return false;
        }
        self.available -= 1.0;
        true
    }

    fn refund(&mut self) {
        self.refill();
        self.available = (self.available + 1.0).min(self.rate_per_min.max(1.0));
    }

    fn reset_rate(&mut self, rate_per_min: f64) {
        self.refill();
        self.rate_per_min = rate_per_min;
        self.available = self.available.min(rate_per_min.max(1.0));
    }
}

/// Add-peer / remove-peer buckets for one store. Shared between clones of the
/// same `StoreInfo` so that admission from any snapshot draws from the same
/// budget.
#[derive(Debug)]
pub struct StoreRateLimit {
    add_peer: Mutex<TokenBucket>,
    remove_peer: Mutex<TokenBucket>,
}

impl StoreRateLimit {
    pub fn new(add_per_min: f64, remove_per_min: f64) -> Self {
        Self {
            add_peer: Mutex::new(TokenBucket::new(add_per_min)),
            remove_peer: Mutex::new(TokenBucket::new(remove_per_min)),
        }
    }

    fn bucket(&self, kind: StoreLimitKind) -> &Mutex<TokenBucket> {
        match kind {
            StoreLimitKind::AddPeer => &self.add_peer,
            StoreLimitKind::RemovePeer => &self.remove_peer,
        }
    }

    pub fn is_available(&self, kind: StoreLimitKind) -> bool {
        self.bucket(kind).lock().unwrap().is_available()
    }

    pub fn take(&self, kind: StoreLimitKind) -> bool {
        self.bucket(kind).lock().unwrap().take()
    }

    pub fn refund(&self, kind: StoreLimitKind) {
        self.bucket(kind).lock().unwrap().refund()
    }

    pub fn reset_rate(&self, kind: StoreLimitKind, rate_per_min: f64) {
        self.bucket(kind).lock().unwrap().reset_rate(rate_per_min)
    }
}

/// In-memory view of one storage node.
///
/// Counters derived from region indices (leader/region counts, sizes, pending
/// peers) are filled in by the cluster when the store is read out; heartbeat
/// fields are written by the heartbeat path.
#[derive(Debug, Clone)]
pub struct StoreInfo {
    pub id: u64,
    pub address: String,
    pub labels: Vec<StoreLabel>,
    pub state: StoreState,

    pub leader_weight: f64,
    pub region_weight: f64,

    pub last_heartbeat: Option<Instant>,
    pub busy: bool,

    // Capacity, in bytes.
    pub capacity: u64,
    pub available: u64,
    pub used_size: u64,

    // Filled from the cluster's per-store subtrees.
    pub leader_count: usize,
    pub region_count: usize,
    pub pending_peer_count: usize,
    pub leader_size: u64,
    pub region_size: u64,

    pub sending_snap_count: u64,
    pub receiving_snap_count: u64,
    pub applying_snap_count: u64,

    limit: Arc<StoreRateLimit>,
}

impl StoreInfo {
    pub fn new(id: u64, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            labels: Vec::new(),
            state: StoreState::Up,
            leader_weight: 1.0,
            region_weight: 1.0,
            last_heartbeat: None,
            busy: false,
            capacity: 0,
            available: 0,
            used_size: 0,
            leader_count: 0,
            region_count: 0,
            pending_peer_count: 0,
            leader_size: 0,
            region_size: 0,
            sending_snap_count: 0,
            receiving_snap_count: 0,
            applying_snap_count: 0,
            limit: Arc::new(StoreRateLimit::new(15.0, 15.0)),
        }
    }

    pub fn with_labels(mut self, labels: Vec<(&str, &str)>) -> Self {
        self.labels = labels
            .into_iter()
            .map(|(k, v)| StoreLabel { key: k.to_string(), value: v.to_string() })
            .collect();
        self
    }

    pub fn is_up(&self) -> bool {
        self.state == StoreState::Up
    }

    pub fn is_offline(&self) -> bool {
        self.state == StoreState::Offline
    }

    pub fn is_tombstone(&self) -> bool {
        self.state == StoreState::Tombstone
    }

    pub fn label_value(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|l| l.key == key).map(|l| l.value.as_str())
    }

    /// Time since the last heartbeat. A store that never reported is treated
    /// as down forever.
    pub fn down_time(&self) -> Duration {
        match self.last_heartbeat {
            Some(ts) => ts.elapsed(),
            None => Duration::MAX,
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.down_time() > STORE_DISCONNECT_DURATION
    }

    pub fn is_low_space(&self, low_space_ratio: f64) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let used_ratio = 1.0 - self.available as f64 / self.capacity as f64;
        used_ratio >= low_space_ratio
    }

    pub fn is_available(&self, kind: StoreLimitKind) -> bool {
        self.limit.is_available(kind)
    }

    pub fn limit(&self) -> Arc<StoreRateLimit> {
        Arc::clone(&self.limit)
    }

    /// Weighted leader score used by balance-leader.
    pub fn leader_score(&self, by_size: bool) -> f64 {
        let raw = if by_size { self.leader_size as f64 } else { self.leader_count as f64 };
        raw / self.leader_weight.max(f64::MIN_POSITIVE)
    }

    /// Weighted region score used by balance-region.
    pub fn region_score(&self) -> f64 {
        self.region_size as f64 / self.region_weight.max(f64::MIN_POSITIVE)
    }

    /// Region score amplified once the store's used space crosses the high
    /// watermark, so fuller stores shed data before they hit the low-space
    /// cutoff.
    pub fn region_score_with(&self, high_space_ratio: f64, low_space_ratio: f64) -> f64 {
        let base = self.region_score();
        if self.capacity == 0 {
            return base;
        }
        let used_ratio = 1.0 - self.available as f64 / self.capacity as f64;
        if used_ratio < high_space_ratio {
            return base;
        }
        let span = (low_space_ratio - high_space_ratio).max(f64::EPSILON);
        base * (1.0 + (used_ratio - high_space_ratio) / span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_exhausts_and_refunds() {
        let limit = StoreRateLimit::new(2.0, 2.0);
        assert!(limit.take(StoreLimitKind::AddPeer));
        assert!(limit.take(StoreLimitKind::AddPeer));
        assert!(!limit.take(StoreLimitKind::AddPeer));
        assert!(!limit.is_available(StoreLimitKind::AddPeer));
        // Remove-peer budget is independent.
        assert!(limit.take(StoreLimitKind::RemovePeer));
        limit.refund(StoreLimitKind::AddPeer);
        assert!(limit.take(StoreLimitKind::AddPeer));
    }

    #[test]
    fn clones_share_the_same_budget() {
        let store = StoreInfo::new(1, "127.0.0.1:20160");
        store.limit().reset_rate(StoreLimitKind::AddPeer, 1.0);
        let snapshot = store.clone();
        assert!(store.limit().take(StoreLimitKind::AddPeer));
        assert!(!snapshot.is_available(StoreLimitKind::AddPeer));
    }

    #[test]
    fn low_space_uses_used_ratio() {
        let mut store = StoreInfo::new(1, "");
        store.capacity = 100;
        store.available = 30;
        assert!(!store.is_low_space(0.8));
        store.available = 10;
        assert!(store.is_low_space(0.8));
        store.capacity = 0;
        assert!(!store.is_low_space(0.8));
    }

    #[test]
    fn scores_respect_weights() {
        let mut store = StoreInfo::new(1, "");
        store.leader_count = 10;
        store.leader_size = 100;
        store.leader_weight = 2.0;
        store.region_size = 50;
        assert_eq!(store.leader_score(false), 5.0);
        assert_eq!(store.leader_score(true), 50.0);
        assert_eq!(store.region_score(), 50.0);
    }
}

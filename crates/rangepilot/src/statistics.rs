//! Flow statistics consumed by the schedulers.
//!
//! Store heartbeats feed per-store rolling byte/key rates; region heartbeats
//! feed the hot-peer caches. The hot scheduler reads both and never writes.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use crate::region::RegionInfo;

/// Rolling window length for store flow rates.
const ROLLING_WINDOW: usize = 10;

/// Minimum per-peer rates below which a peer is never considered hot.
pub const HOT_WRITE_MIN_FLOW_RATE: f64 = 16.0 * 1024.0;
pub const HOT_READ_MIN_FLOW_RATE: f64 = 128.0 * 1024.0;
pub const HOT_WRITE_MIN_KEY_RATE: f64 = 256.0;
pub const HOT_READ_MIN_KEY_RATE: f64 = 512.0;

/// Divisor applied to cluster-total rates when deriving the dynamic hot
/// thresholds.
const HOT_THRESHOLD_DIVISOR: f64 = 2000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    Write,
    Read,
}

impl FlowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowKind::Write => "write",
            FlowKind::Read => "read",
        }
    }
}

#[derive(Debug, Default, Clone)]
struct RollingRates {
    bytes_write: VecDeque<f64>,
    keys_write: VecDeque<f64>,
    bytes_read: VecDeque<f64>,
    keys_read: VecDeque<f64>,
}

fn push(window: &mut VecDeque<f64>, v: f64) {
    if window.len() == ROLLING_WINDOW {
        window.pop_front();
    }
    window.push_back(v);
}

fn mean(window: &VecDeque<f64>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    window.iter().sum::<f64>() / window.len() as f64
}

/// Per-store flow rates smoothed over the last few heartbeats.
#[derive(Default)]
pub struct StoresStats {
    inner: RwLock<HashMap<u64, RollingRates>>,
}

impl StoresStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one store heartbeat's flow totals over `interval_secs`.
    pub fn observe(
        &self,
        store_id: u64,
        bytes_written: u64,
        keys_written: u64,
        bytes_read: u64,
        keys_read: u64,
        interval_secs: u64,
    ) {
        let secs = interval_secs.max(1) as f64;
        let mut inner = self.inner.write().unwrap();
        let rates = inner.entry(store_id).or_default();
        push(&mut rates.bytes_write, bytes_written as f64 / secs);
        push(&mut rates.keys_write, keys_written as f64 / secs);
        push(&mut rates.bytes_read, bytes_read as f64 / secs);
        push(&mut rates.keys_read, keys_read as f64 / secs);
    }

    pub fn remove(&self, store_id: u64) {
        self.inner.write().unwrap().remove(&store_id);
    }

    /// Smoothed (byte, key) rates per store for one flow direction.
    pub fn store_flow_rates(&self, kind: FlowKind) -> HashMap<u64, (f64, f64)> {
        let inner = self.inner.read().unwrap();
        inner
            .iter()
            .map(|(id, r)| {
                let pair = match kind {
                    FlowKind::Write => (mean(&r.bytes_write), mean(&r.keys_write)),
                    FlowKind::Read => (mean(&r.bytes_read), mean(&r.keys_read)),
                };
                (*id, pair)
            })
            .collect()
    }

    pub fn total_flow_rate(&self, kind: FlowKind) -> (f64, f64) {
        self.store_flow_rates(kind)
            .values()
            .fold((0.0, 0.0), |(b, k), (sb, sk)| (b + sb, k + sk))
    }

    /// Dynamic per-peer hot thresholds: cluster total scaled down, floored at
    /// the per-kind minimum flow/key rates.
    pub fn hot_region_threshold(&self, kind: FlowKind) -> (f64, f64) {
        let (total_bytes, total_keys) = self.total_flow_rate(kind);
        let (min_flow, min_keys) = match kind {
            FlowKind::Write => (HOT_WRITE_MIN_FLOW_RATE, HOT_WRITE_MIN_KEY_RATE),
            FlowKind::Read => (HOT_READ_MIN_FLOW_RATE, HOT_READ_MIN_KEY_RATE),
        };
        (
            (total_bytes / HOT_THRESHOLD_DIVISOR).max(min_flow),
            (total_keys / HOT_THRESHOLD_DIVISOR).max(min_keys),
        )
    }
}

/// Moving statistics for one (region, store) pair.
#[derive(Debug, Clone)]
pub struct HotPeerStat {
    pub region_id: u64,
    pub store_id: u64,
    pub byte_rate: f64,
    pub key_rate: f64,
    /// Incremented each heartbeat the peer stays above the minimum rates.
    pub hot_degree: i32,
    pub is_leader: bool,
}

/// Cache of hot peers for one flow direction.
///
/// Write flow is attributed to every peer of the region, read flow only to
/// the leader. Entries fall out as soon as a heartbeat reports the peer below
/// the minimum rate.
pub struct HotPeerCache {
    kind: FlowKind,
    // store id -> region id -> stat
    peers: RwLock<HashMap<u64, HashMap<u64, HotPeerStat>>>,
}

impl HotPeerCache {
    pub fn new(kind: FlowKind) -> Self {
        Self { kind, peers: RwLock::new(HashMap::new()) }
    }

    pub fn kind(&self) -> FlowKind {
        self.kind
    }

    /// Fold one region heartbeat into the cache.
    pub fn observe(&self, region: &RegionInfo) {
        let (byte_rate, key_rate) = match self.kind {
            FlowKind::Write => region.write_rate(),
            FlowKind::Read => region.read_rate(),
        };
        let min_flow = match self.kind {
            FlowKind::Write => HOT_WRITE_MIN_FLOW_RATE,
            FlowKind::Read => HOT_READ_MIN_FLOW_RATE,
        };
        let leader_store = region.leader_store_id();
        let target_stores: Vec<u64> = match self.kind {
            FlowKind::Write => region.peers.iter().map(|p| p.store_id).collect(),
            FlowKind::Read => leader_store.into_iter().collect(),
        };

        let mut peers = self.peers.write().unwrap();
        // Drop stale placements first: stores that no longer host this region
        // (or lost the leadership, for reads) must not keep an entry.
        for (store_id, regions) in peers.iter_mut() {
            if !target_stores.contains(store_id) {
                regions.remove(&region.id);
            }
        }
        if byte_rate < min_flow {
            for store_id in &target_stores {
                if let Some(regions) = peers.get_mut(store_id) {
                    regions.remove(&region.id);
                }
            }
            return;
        }
        for store_id in target_stores {
            let regions = peers.entry(store_id).or_default();
            let degree = regions.get(&region.id).map(|s| s.hot_degree).unwrap_or(0) + 1;
            regions.insert(
                region.id,
                HotPeerStat {
                    region_id: region.id,
                    store_id,
                    byte_rate,
                    key_rate,
                    hot_degree: degree,
                    is_leader: leader_store == Some(store_id),
                },
            );
        }
    }

    pub fn remove_region(&self, region_id: u64) {
        let mut peers = self.peers.write().unwrap();
        for regions in peers.values_mut() {
            regions.remove(&region_id);
        }
    }

    /// Hot peers grouped by store.
    pub fn store_hot_peers(&self) -> HashMap<u64, Vec<HotPeerStat>> {
        let peers = self.peers.read().unwrap();
        peers
            .iter()
            .map(|(store, regions)| (*store, regions.values().cloned().collect()))
            .collect()
    }

    /// Whether any peer of the region is hot with at least `min_degree`.
    pub fn is_region_hot(&self, region_id: u64, min_degree: i32) -> bool {
        let peers = self.peers.read().unwrap();
        peers
            .values()
            .filter_map(|regions| regions.get(&region_id))
            .any(|s| s.hot_degree >= min_degree)
    }
}

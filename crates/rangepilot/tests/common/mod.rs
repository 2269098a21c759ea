//! Shared helpers for the integration tests: a compact cluster builder in
//! the shape the schedulers expect, plus heartbeat fabrication.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Instant;

use rangepilot::cluster::Cluster;
use rangepilot::config::ScheduleConfig;
use rangepilot::controller::OperatorController;
use rangepilot::heartbeat::HeartbeatStreams;
use rangepilot::region::{Peer, RegionInfo};
use rangepilot::storage::{MemoryStore, MetaStore};
use rangepilot::store::{StoreInfo, StoreState};

pub struct TestCluster {
    pub cluster: Arc<Cluster>,
    pub controller: Arc<OperatorController>,
    pub storage: Arc<dyn MetaStore>,
}

pub fn new_cluster(tune: impl FnOnce(&mut ScheduleConfig)) -> TestCluster {
    let mut cfg = ScheduleConfig::default();
    tune(&mut cfg);
    let storage: Arc<dyn MetaStore> = Arc::new(MemoryStore::new());
    let cluster = Cluster::new(cfg, Arc::clone(&storage));
    let controller =
        OperatorController::new(Arc::clone(&cluster), Arc::new(HeartbeatStreams::new()));
    TestCluster { cluster, controller, storage }
}

impl TestCluster {
    pub fn add_store(&self, id: u64, labels: &[(&str, &str)]) {
        let mut store = StoreInfo::new(id, format!("127.0.0.1:{}", 20160 + id))
            .with_labels(labels.to_vec());
        store.last_heartbeat = Some(Instant::now());
        store.capacity = 100 * 1024;
        store.available = 100 * 1024;
        self.cluster.put_store(store);
    }

    pub fn set_store_offline(&self, id: u64) {
        self.cluster.set_store_state(id, StoreState::Offline).unwrap();
    }

    /// A region whose range derives from its id, so regions never collide.
    pub fn build_region(&self, id: u64, leader_store: u64, follower_stores: &[u64]) -> RegionInfo {
        let mut peers = vec![Peer::voter(id * 100, leader_store)];
        for (i, store) in follower_stores.iter().enumerate() {
            peers.push(Peer::voter(id * 100 + 1 + i as u64, *store));
        }
        let leader = peers[0];
        let mut region = RegionInfo::new(id, peers, Some(leader))
            .with_range(vec![id as u8], vec![id as u8 + 1]);
        region.approximate_size = 10;
        region.approximate_keys = 1000;
        region
    }

    pub fn add_leader_region(&self, id: u64, leader_store: u64, follower_stores: &[u64]) -> RegionInfo {
        let region = self.build_region(id, leader_store, follower_stores);
        self.cluster.set_region(region.clone());
        region
    }

    /// Report a store's write flow so its rates and the cluster totals move.
    pub fn report_store_written_bytes(&self, store_id: u64, bytes_per_interval: u64) {
        use rangepilot::heartbeat::StoreHeartbeat;
        let hb = StoreHeartbeat {
            store_id,
            capacity: 100 * 1024,
            available: 100 * 1024,
            bytes_written: bytes_per_interval,
            keys_written: bytes_per_interval / 100,
            interval_secs: 10,
            ..Default::default()
        };
        self.cluster.handle_store_heartbeat(&hb).unwrap();
    }

    /// Report one region's write flow `rounds` times so its hot degree grows.
    pub fn report_region_written_bytes(&self, region: &RegionInfo, bytes_per_interval: u64, rounds: usize) {
        let mut region = region.clone();
        region.bytes_written = bytes_per_interval;
        region.keys_written = bytes_per_interval / 100;
        region.interval_secs = 10;
        for _ in 0..rounds {
            self.cluster.process_region_heartbeat(region.clone()).unwrap();
        }
    }

    /// Drive an operator to completion by synthesizing the heartbeats a
    /// well-behaved store would send after applying each step.
    pub fn apply_operator_steps(&self, mut region: RegionInfo) -> RegionInfo {
        use rangepilot::operator::Step;
        for _ in 0..8 {
            let Some(op) = self.controller.get_operator(region.id) else { break };
            let idx = op.current_step_index();
            let Some(step) = op.step(idx).cloned() else { break };
            region = match step {
                Step::AddLearner { store_id, peer_id } => {
                    region.with_added_peer(Peer::learner(peer_id, store_id))
                }
                Step::PromoteLearner { peer_id, .. } => region.with_promoted_learner(peer_id),
                Step::RemovePeer { store_id } => region.with_removed_store_peer(store_id),
                Step::TransferLeader { to_store, .. } => {
                    let peer = region.get_store_voter(to_store);
                    region.with_leader(peer)
                }
                // Merge and split complete through range changes, which this
                // helper does not synthesize.
                _ => break,
            };
            self.controller.process_region_heartbeat(region.clone()).unwrap();
        }
        region
    }
}

//! Region model: key ranges, epochs and peers.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// One replica of a region on one store. Learners do not vote and must be
/// promoted before they count against quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: u64,
    pub store_id: u64,
    pub is_learner: bool,
}

impl Peer {
    pub fn voter(id: u64, store_id: u64) -> Self {
        Self { id, store_id, is_learner: false }
    }

    pub fn learner(id: u64, store_id: u64) -> Self {
        Self { id, store_id, is_learner: true }
    }
}

/// Configuration epoch. `conf_ver` advances on membership change, `version`
/// on split/merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegionEpoch {
    pub conf_ver: u64,
    pub version: u64,
}

impl RegionEpoch {
    /// A reported epoch is stale if it is behind the known one on either
    /// axis. Cross-source heartbeat races are resolved with this check.
    pub fn is_stale(&self, known: &RegionEpoch) -> bool {
        self.conf_ver < known.conf_ver || self.version < known.version
    }
}

/// A peer reported down by the leader's raft state, with how long it has been
/// unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownPeer {
    pub peer: Peer,
    pub down_seconds: u64,
}

/// A contiguous key range `[start_key, end_key)` and its replicas. An empty
/// `end_key` means the range is unbounded on the right.
#[derive(Debug, Clone, Default)]
pub struct RegionInfo {
    pub id: u64,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub epoch: RegionEpoch,
    pub peers: Vec<Peer>,
    pub leader: Option<Peer>,
    pub down_peers: Vec<DownPeer>,
    pub pending_peers: Vec<Peer>,
    /// Approximate size in MiB.
    pub approximate_size: u64,
    pub approximate_keys: u64,
    // Flow totals accumulated over the reporting interval.
    pub bytes_written: u64,
    pub keys_written: u64,
    pub bytes_read: u64,
    pub keys_read: u64,
    pub interval_secs: u64,
}

impl RegionInfo {
    pub fn new(id: u64, peers: Vec<Peer>, leader: Option<Peer>) -> Self {
        Self { id, peers, leader, interval_secs: 10, ..Default::default() }
    }

    pub fn with_range(mut self, start_key: Vec<u8>, end_key: Vec<u8>) -> Self {
        self.start_key = start_key;
        self.end_key = end_key;
        self
    }

    pub fn get_peer(&self, peer_id: u64) -> Option<Peer> {
        self.peers.iter().find(|p| p.id == peer_id).copied()
    }

    pub fn get_store_peer(&self, store_id: u64) -> Option<Peer> {
        self.peers.iter().find(|p| p.store_id == store_id).copied()
    }

    pub fn get_store_voter(&self, store_id: u64) -> Option<Peer> {
        self.peers.iter().find(|p| p.store_id == store_id && !p.is_learner).copied()
    }

    pub fn get_store_learner(&self, store_id: u64) -> Option<Peer> {
        self.peers.iter().find(|p| p.store_id == store_id && p.is_learner).copied()
    }

    pub fn voters(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| !p.is_learner)
    }

    pub fn learners(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| p.is_learner)
    }

    /// Voters that are not the leader.
    pub fn followers(&self) -> impl Iterator<Item = &Peer> + '_ {
        let leader_id = self.leader.map(|l| l.id);
        self.voters().filter(move |p| Some(p.id) != leader_id)
    }

    pub fn store_ids(&self) -> HashSet<u64> {
        self.peers.iter().map(|p| p.store_id).collect()
    }

    pub fn voter_store_ids(&self) -> HashSet<u64> {
        self.voters().map(|p| p.store_id).collect()
    }

    pub fn learner_store_ids(&self) -> HashSet<u64> {
        self.learners().map(|p| p.store_id).collect()
    }

    pub fn pending_store_ids(&self) -> HashSet<u64> {
        self.pending_peers.iter().map(|p| p.store_id).collect()
    }

    pub fn leader_store_id(&self) -> Option<u64> {
        self.leader.map(|l| l.store_id)
    }

    pub fn is_pending(&self, peer_id: u64) -> bool {
        self.pending_peers.iter().any(|p| p.id == peer_id)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }

    /// Byte/key rates derived from the last reported interval.
    pub fn write_rate(&self) -> (f64, f64) {
        let secs = self.interval_secs.max(1) as f64;
        (self.bytes_written as f64 / secs, self.keys_written as f64 / secs)
    }

    pub fn read_rate(&self) -> (f64, f64) {
        let secs = self.interval_secs.max(1) as f64;
        (self.bytes_read as f64 / secs, self.keys_read as f64 / secs)
    }

    // Clone-with builders used when simulating reconfigurations (rule fit,
    // step checks) without touching the authoritative copy.

    pub fn with_leader(mut self, leader: Option<Peer>) -> Self {
        self.leader = leader;
        self
    }

    pub fn with_pending_peers(mut self, pending: Vec<Peer>) -> Self {
        self.pending_peers = pending;
        self
    }

    pub fn with_down_peers(mut self, down: Vec<DownPeer>) -> Self {
        self.down_peers = down;
        self
    }

    pub fn with_replaced_peer_store(mut self, old_store: u64, new_store: u64) -> Self {
        for peer in &mut self.peers {
            if peer.store_id == old_store {
                peer.store_id = new_store;
            }
        }
        if let Some(leader) = &mut self.leader {
            if leader.store_id == old_store {
                leader.store_id = new_store;
            }
        }
        self
    }

    pub fn with_added_peer(mut self, peer: Peer) -> Self {
        self.peers.push(peer);
        self.epoch.conf_ver += 1;
        self
    }

    pub fn with_removed_store_peer(mut self, store_id: u64) -> Self {
        self.peers.retain(|p| p.store_id != store_id);
        self.pending_peers.retain(|p| p.store_id != store_id);
        self.down_peers.retain(|d| d.peer.store_id != store_id);
        if self.leader.map(|l| l.store_id) == Some(store_id) {
            self.leader = None;
        }
        self.epoch.conf_ver += 1;
        self
    }

    pub fn with_promoted_learner(mut self, peer_id: u64) -> Self {
        for peer in &mut self.peers {
            if peer.id == peer_id {
                peer.is_learner = false;
            }
        }
        self.epoch.conf_ver += 1;
        self
    }
}

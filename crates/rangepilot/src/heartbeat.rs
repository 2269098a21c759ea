//! Heartbeat input/output types and the per-store response streams.
//!
//! Each store keeps one stream bound via `bind_stream`; the dispatcher posts
//! operator steps to the stream bound to the region's leader store. Sends are
//! best-effort: a failed send is dropped and the step is resent on the next
//! heartbeat tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::region::{Peer, RegionInfo};

/// Periodic store status report.
#[derive(Debug, Clone, Default)]
pub struct StoreHeartbeat {
    pub store_id: u64,
    pub capacity: u64,
    pub available: u64,
    pub used_size: u64,
    pub keys_count: u64,
    pub sending_snap_count: u64,
    pub receiving_snap_count: u64,
    pub applying_snap_count: u64,
    // Flow totals accumulated over the reporting interval.
    pub bytes_written: u64,
    pub keys_written: u64,
    pub bytes_read: u64,
    pub keys_read: u64,
    pub interval_secs: u64,
    pub busy: bool,
}

/// Split policy carried by a split directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitPolicy {
    /// Scan the range to find accurate split keys.
    Scan,
    /// Derive split keys from size estimates.
    Approximate,
    /// Split exactly at the supplied keys.
    UseKeys,
}

/// One operator step rendered as a heartbeat response for the region leader.
#[derive(Debug, Clone)]
pub enum RegionHeartbeatResponse {
    AddLearner { region_id: u64, peer: Peer },
    PromoteLearner { region_id: u64, peer: Peer },
    RemovePeer { region_id: u64, peer: Peer },
    TransferLeader { region_id: u64, peer: Peer },
    SplitRegion { region_id: u64, policy: SplitPolicy, keys: Vec<Vec<u8>> },
    MergeRegion { region_id: u64, target: u64 },
}

/// One bound response stream. The transport owns reconnection; the core only
/// pushes messages.
pub trait HeartbeatStream: Send + Sync {
    fn send(&self, msg: RegionHeartbeatResponse) -> anyhow::Result<()>;
}

/// Streams keyed by store id.
#[derive(Default)]
pub struct HeartbeatStreams {
    streams: Mutex<HashMap<u64, Arc<dyn HeartbeatStream>>>,
}

impl HeartbeatStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_stream(&self, store_id: u64, stream: Arc<dyn HeartbeatStream>) {
        self.streams.lock().unwrap().insert(store_id, stream);
    }

    /// Post a message toward the region's leader store, dropping it when no
    /// stream is bound or the send fails.
    pub fn send_msg(&self, region: &RegionInfo, msg: RegionHeartbeatResponse) {
        let Some(store_id) = region.leader_store_id() else {
            tracing::debug!(region = region.id, "dropping response for leaderless region");
            return;
        };
        let stream = self.streams.lock().unwrap().get(&store_id).cloned();
        match stream {
            Some(stream) => {
                if let Err(err) = stream.send(msg) {
                    tracing::debug!(store = store_id, error = ?err, "heartbeat stream send failed");
                }
            }
            None => {
                tracing::debug!(store = store_id, "no heartbeat stream bound");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStream(AtomicUsize);

    impl HeartbeatStream for CountingStream {
        fn send(&self, _msg: RegionHeartbeatResponse) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn messages_route_to_leader_store_stream() {
        let streams = HeartbeatStreams::new();
        let stream = Arc::new(CountingStream(AtomicUsize::new(0)));
        streams.bind_stream(1, stream.clone());

        let peer = Peer::voter(10, 1);
        let region = RegionInfo::new(1, vec![peer], Some(peer));
        let msg = RegionHeartbeatResponse::TransferLeader { region_id: 1, peer };
        streams.send_msg(&region, msg.clone());
        assert_eq!(stream.0.load(Ordering::Relaxed), 1);

        // Unbound store: dropped without error.
        let peer2 = Peer::voter(20, 2);
        let region2 = RegionInfo::new(2, vec![peer2], Some(peer2));
        streams.send_msg(&region2, msg);
        assert_eq!(stream.0.load(Ordering::Relaxed), 1);
    }
}

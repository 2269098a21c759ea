//! Hot-write balancing end to end: an overloaded store sheds a hot peer,
//! and special-use stores only receive it when their label allows.

mod common;

use std::sync::Arc;

use common::new_cluster;
use rangepilot::filter::{SPECIAL_USE_HOT_REGION, SPECIAL_USE_KEY, SPECIAL_USE_RESERVED};
use rangepilot::hot_region::{HotRegionConfig, HotRegionScheduler};
use rangepilot::operator::Step;
use rangepilot::statistics::FlowKind;

const MB: u64 = 1024 * 1024;
const KB: u64 = 1024;

#[test]
fn hot_write_moves_peer_off_overloaded_store_avoiding_reserved() {
    let tc = new_cluster(|cfg| {
        cfg.hot_region_cache_hits_threshold = 0;
        cfg.leader_schedule_limit = 0;
    });
    tc.add_store(1, &[]);
    tc.add_store(2, &[]);
    tc.add_store(3, &[]);
    tc.add_store(4, &[(SPECIAL_USE_KEY, SPECIAL_USE_HOT_REGION)]);
    tc.add_store(5, &[(SPECIAL_USE_KEY, SPECIAL_USE_RESERVED)]);

    // Store 1 writes an order of magnitude more than its peers.
    tc.report_store_written_bytes(1, 60 * MB * 10);
    tc.report_store_written_bytes(2, 6 * MB * 10);
    tc.report_store_written_bytes(3, 6 * MB * 10);
    tc.report_store_written_bytes(4, 0);
    tc.report_store_written_bytes(5, 0);

    for id in 1..=3 {
        let region = tc.add_leader_region(id, 1, &[2, 3]);
        tc.report_region_written_bytes(&region, 512 * KB * 10, 2);
    }

    let scheduler =
        HotRegionScheduler::new(Arc::clone(&tc.controller), HotRegionConfig::default());

    let mut moved = None;
    for _ in 0..100 {
        scheduler.dispatch(FlowKind::Write, &tc.cluster);
        if let Some(op) = (1..=3).find_map(|id| tc.controller.get_operator(id)) {
            moved = Some(op);
            break;
        }
    }
    let op = moved.expect("hot scheduler produced no operator");
    assert!(op.kind.contains(rangepilot::operator::OpKind::HOT_REGION));
    // The only eligible destination is the hot-region store 4; the reserved
    // store 5 stays untouched.
    assert!(matches!(op.step(0), Some(Step::AddLearner { store_id: 4, .. })));
    assert!(matches!(
        op.steps.last(),
        Some(Step::RemovePeer { store_id: 1 })
    ));
}

#[test]
fn hot_scheduler_skips_regions_with_pending_hot_operator() {
    let tc = new_cluster(|cfg| {
        cfg.hot_region_cache_hits_threshold = 0;
        cfg.leader_schedule_limit = 0;
    });
    for id in 1..=5 {
        tc.add_store(id, &[]);
    }
    tc.report_store_written_bytes(1, 60 * MB * 10);
    for id in 2..=5 {
        tc.report_store_written_bytes(id, 0);
    }
    let region = tc.add_leader_region(1, 1, &[2, 3]);
    tc.report_region_written_bytes(&region, 512 * KB * 10, 2);

    let scheduler =
        HotRegionScheduler::new(Arc::clone(&tc.controller), HotRegionConfig::default());
    for _ in 0..100 {
        scheduler.dispatch(FlowKind::Write, &tc.cluster);
        if tc.controller.get_operator(1).is_some() {
            break;
        }
    }
    assert!(tc.controller.get_operator(1).is_some());

    // The region already has a pending hot operator; further ticks must not
    // replace or duplicate it.
    let op = tc.controller.get_operator(1).unwrap();
    for _ in 0..10 {
        scheduler.dispatch(FlowKind::Write, &tc.cluster);
    }
    let after = tc.controller.get_operator(1).unwrap();
    assert!(Arc::ptr_eq(&op, &after));
}

//! Operator lifecycle end to end: merge pairs settle through heartbeats,
//! step replays are idempotent, and admin cancellation is synchronous.

mod common;

use std::time::{Duration, Instant};

use common::new_cluster;
use rangepilot::checker::MergeChecker;
use rangepilot::config::StoreLimitKind;
use rangepilot::operator::{OpStatus, Step};

#[test]
fn merge_pair_completes_when_target_absorbs_source() {
    let tc = new_cluster(|cfg| cfg.split_merge_interval = Duration::from_secs(0));
    for id in 1..=3 {
        tc.add_store(id, &[]);
    }
    let mut left = tc.add_leader_region(1, 1, &[2, 3]);
    left.approximate_size = 5;
    tc.cluster.set_region(left.clone());
    let mut right = tc.add_leader_region(2, 1, &[2, 3]);
    right.approximate_size = 5;
    tc.cluster.set_region(right.clone());

    let checker =
        MergeChecker::with_start_time(tc.cluster.clone(), Instant::now() - Duration::from_secs(1));
    let ops = checker.check(&right);
    assert_eq!(ops.len(), 2, "expected an active/passive merge pair");
    let admitted = tc.controller.add_operators(ops).unwrap();
    let (active, passive) = (&admitted[0], &admitted[1]);
    assert_eq!(active.region_id, 2);
    assert_eq!(passive.region_id, 1);

    // The stores execute the merge: the left region grows over the union and
    // reports; the right region disappears with it.
    let mut grown = left.clone();
    grown.end_key = right.end_key.clone();
    grown.epoch.version += 1;
    tc.controller.process_region_heartbeat(grown).unwrap();

    assert_eq!(passive.status(), OpStatus::Success);
    assert_eq!(active.status(), OpStatus::Success);
    assert!(tc.cluster.get_region(2).is_none(), "absorbed region left the model");
    assert!(tc.controller.get_operator(1).is_none());
    assert!(tc.controller.get_operator(2).is_none());
}

#[test]
fn replaying_the_final_heartbeat_does_not_readvance() {
    let tc = new_cluster(|_| {});
    for id in 1..=4 {
        tc.add_store(id, &[]);
    }
    let region = tc.add_leader_region(1, 1, &[2, 3]);
    let op = rangepilot::operator::create_move_peer_operator(
        "test-move",
        &region,
        rangepilot::operator::OpKind::ADMIN,
        3,
        4,
        tc.cluster.alloc_id(),
    );
    tc.controller.add_operator(op).unwrap();

    let done = tc.apply_operator_steps(region);
    assert!(tc.controller.get_operator(1).is_none());
    assert!(tc.cluster.get_store(4).unwrap().is_available(StoreLimitKind::AddPeer));

    // Replay the final heartbeat several times: no operator reappears, no
    // token is taken again.
    for _ in 0..3 {
        tc.controller.process_region_heartbeat(done.clone()).unwrap();
    }
    assert!(tc.controller.get_operator(1).is_none());
    assert!(tc.cluster.get_store(4).unwrap().is_available(StoreLimitKind::AddPeer));
    assert!(tc.cluster.get_store(3).unwrap().is_available(StoreLimitKind::RemovePeer));
}

#[test]
fn admin_cancel_is_synchronous_and_returns_tokens() {
    let tc = new_cluster(|cfg| {
        cfg.default_store_limit =
            rangepilot::config::StoreLimitConfig { add_peer: 1.0, remove_peer: 1.0 };
    });
    for id in 1..=4 {
        tc.add_store(id, &[]);
    }
    let region = tc.add_leader_region(1, 1, &[2, 3]);
    let op = rangepilot::operator::create_move_peer_operator(
        "test-move",
        &region,
        rangepilot::operator::OpKind::ADMIN,
        3,
        4,
        tc.cluster.alloc_id(),
    );
    let op = tc.controller.add_operator(op).unwrap();
    assert!(!tc.cluster.get_store(4).unwrap().is_available(StoreLimitKind::AddPeer));

    assert!(tc.controller.cancel_operator(1));
    // The call returned: the operator is gone and the tokens are back.
    assert_eq!(op.status(), OpStatus::Cancelled);
    assert!(tc.controller.get_operator(1).is_none());
    assert!(tc.cluster.get_store(4).unwrap().is_available(StoreLimitKind::AddPeer));
    assert!(tc.cluster.get_store(3).unwrap().is_available(StoreLimitKind::RemovePeer));

    let records = tc.controller.records();
    assert!(matches!(records.last().map(|r| r.status), Some(OpStatus::Cancelled)));
}

#[test]
fn scatter_operator_steps_form_a_consistent_plan() {
    let tc = new_cluster(|_| {});
    for id in 1..=6 {
        tc.add_store(id, &[]);
    }
    let scatterer = rangepilot::scatter::RegionScatterer::new(tc.cluster.clone());
    // Two rounds so the second region has to relocate off the used stores.
    let first = tc.add_leader_region(1, 1, &[2, 3]);
    scatterer.scatter(&first, "g").unwrap();
    let second = tc.add_leader_region(2, 1, &[2, 3]);
    let op = scatterer.scatter(&second, "g").unwrap();

    // Every add pairs with a promote, and removals only touch stores the
    // region actually uses.
    let adds: Vec<u64> = op
        .steps
        .iter()
        .filter_map(|s| match s {
            Step::AddLearner { store_id, .. } => Some(*store_id),
            _ => None,
        })
        .collect();
    let removes: Vec<u64> = op
        .steps
        .iter()
        .filter_map(|s| match s {
            Step::RemovePeer { store_id } => Some(*store_id),
            _ => None,
        })
        .collect();
    assert_eq!(adds.len(), removes.len());
    assert!(removes.iter().all(|s| second.store_ids().contains(s)));
    assert!(adds.iter().all(|s| !second.store_ids().contains(s)));
}

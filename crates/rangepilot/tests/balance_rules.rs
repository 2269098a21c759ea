//! Balance-leader against placement rules: a leader-role rule that pins
//! leadership to one host must silence the balancer, and widening the rule
//! lets it work again.

mod common;

use common::new_cluster;
use rangepilot::balance::new_balance_leader;
use rangepilot::placement::{LabelConstraint, LabelConstraintOp, Rule, RuleRole};
use rangepilot::scheduler::SchedulerContext;

fn leader_rule(values: &[&str]) -> Rule {
    Rule {
        group_id: "pd".into(),
        id: "default".into(),
        index: 1,
        override_group: false,
        start_key: vec![],
        end_key: vec![],
        role: RuleRole::Leader,
        count: 1,
        label_constraints: vec![LabelConstraint {
            key: "host".into(),
            op: LabelConstraintOp::In,
            values: values.iter().map(|s| s.to_string()).collect(),
        }],
        location_labels: vec!["host".into()],
    }
}

fn voter_rule() -> Rule {
    Rule {
        group_id: "pd".into(),
        id: "default".into(),
        index: 1,
        override_group: false,
        start_key: vec![],
        end_key: vec![],
        role: RuleRole::Voter,
        count: 3,
        label_constraints: vec![],
        location_labels: vec!["host".into()],
    }
}

#[test]
fn balance_leader_with_conflicting_leader_rule() {
    let tc = new_cluster(|cfg| cfg.placement_rules_enabled = true);
    tc.add_store(1, &[("host", "a")]);
    tc.add_store(2, &[("host", "b")]);
    tc.add_store(3, &[("host", "c")]);
    // Sixteen leaders pile up on host a.
    for id in 1..=16 {
        tc.add_leader_region(id, 1, &[2, 3]);
    }

    let ctx = SchedulerContext {
        controller: tc.controller.clone(),
        storage: tc.storage.clone(),
    };
    let scheduler = new_balance_leader(&ctx, &[]).unwrap();

    // A plain voter rule allows balancing.
    tc.cluster.rules().set_rule(voter_rule()).unwrap();
    assert_eq!(scheduler.schedule(&tc.cluster).len(), 1);

    // Leadership restricted to host a: every transfer would break the rule.
    tc.cluster.rules().set_rule(leader_rule(&["a"])).unwrap();
    assert!(scheduler.schedule(&tc.cluster).is_empty());

    // Two allowed hosts make room again.
    tc.cluster.rules().set_rule(leader_rule(&["a", "b"])).unwrap();
    let ops = scheduler.schedule(&tc.cluster);
    assert_eq!(ops.len(), 1);
    assert!(matches!(
        ops[0].step(0),
        Some(rangepilot::operator::Step::TransferLeader { from_store: 1, to_store: 2 })
    ));
}

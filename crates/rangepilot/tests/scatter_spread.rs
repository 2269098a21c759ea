//! Scatter determinism: a batch of co-located regions spreads evenly over
//! the cluster, within one replica of the ideal share.

mod common;

use std::collections::{HashMap, HashSet};

use common::new_cluster;
use rangepilot::operator::Step;
use rangepilot::scatter::RegionScatterer;

#[test]
fn scattered_batch_spreads_within_one_of_even_share() {
    let tc = new_cluster(|_| {});
    let store_count = 5u64;
    for id in 1..=store_count {
        tc.add_store(id, &[]);
    }

    let scatterer = RegionScatterer::new(tc.cluster.clone());
    let region_count = 10u64;
    let replicas = 3u64;
    let mut placements: HashMap<u64, u64> = HashMap::new();
    let mut leader_counts: HashMap<u64, u64> = HashMap::new();

    for id in 1..=region_count {
        // Freshly split import regions all start on the same three stores.
        let region = tc.add_leader_region(id, 1, &[2, 3]);
        let op = scatterer.scatter(&region, "import-batch").expect("scatter");

        // Resolve the placement the operator aims at.
        let mut stores: HashSet<u64> = region.store_ids();
        let mut leader = region.leader_store_id().unwrap();
        for step in &op.steps {
            match step {
                Step::AddLearner { store_id, .. } => {
                    stores.insert(*store_id);
                }
                Step::RemovePeer { store_id } => {
                    stores.remove(store_id);
                }
                Step::TransferLeader { to_store, .. } => leader = *to_store,
                _ => {}
            }
        }
        assert_eq!(stores.len(), replicas as usize, "replica count preserved");
        assert!(stores.contains(&leader), "leader stays inside the region");
        *leader_counts.entry(leader).or_insert(0) += 1;
        for store in stores {
            *placements.entry(store).or_insert(0) += 1;
        }
    }

    let share = region_count * replicas / store_count;
    for id in 1..=store_count {
        let count = placements.get(&id).copied().unwrap_or(0);
        assert!(
            count.abs_diff(share) <= 1,
            "store {id} holds {count} replicas, even share is {share}"
        );
    }
    // Leadership also spreads: no store leads more than a fair share plus
    // slack.
    let max_leads = leader_counts.values().max().copied().unwrap_or(0);
    assert!(max_leads <= region_count / 2, "leaders still clustered: {leader_counts:?}");
}

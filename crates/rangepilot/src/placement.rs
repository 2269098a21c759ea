//! Placement rules: declarative replica constraints and region fit.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::ScheduleConfig;
use crate::region::{Peer, RegionInfo};
use crate::storage::{rule_key, MetaStore, RULES_PREFIX};
use crate::store::StoreInfo;

/// Base of the positional weight used by the distinct score. Outer location
/// levels dominate inner ones.
const REPLICA_BASE_SCORE: f64 = 100.0;

/// Isolation metric: how much `candidate` differs from `others` across the
/// ordered location labels. Differing at an outer level scores higher than at
/// an inner one.
pub fn distinct_score(labels: &[String], others: &[StoreInfo], candidate: &StoreInfo) -> f64 {
    let mut score = 0.0;
    for other in others {
        if other.id == candidate.id {
            continue;
        }
        for (i, label) in labels.iter().enumerate() {
            if other.label_value(label) != candidate.label_value(label) {
                score += REPLICA_BASE_SCORE.powi((labels.len() - i - 1) as i32);
                break;
            }
        }
    }
    score
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LabelConstraintOp {
    In,
    NotIn,
    Exists,
    NotExists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelConstraint {
    pub key: String,
    pub op: LabelConstraintOp,
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelConstraint {
    pub fn match_store(&self, store: &StoreInfo) -> bool {
        let value = store.label_value(&self.key);
        match self.op {
            LabelConstraintOp::In => value.map_or(false, |v| self.values.iter().any(|x| x == v)),
            LabelConstraintOp::NotIn => value.map_or(true, |v| !self.values.iter().any(|x| x == v)),
            LabelConstraintOp::Exists => value.is_some(),
            LabelConstraintOp::NotExists => value.is_none(),
        }
    }
}

pub fn match_label_constraints(store: &StoreInfo, constraints: &[LabelConstraint]) -> bool {
    constraints.iter().all(|c| c.match_store(store))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleRole {
    Voter,
    Leader,
    Follower,
    Learner,
}

impl RuleRole {
    fn matches_peer(self, peer: &Peer, leader: Option<&Peer>) -> bool {
        let is_leader = leader.map(|l| l.id) == Some(peer.id);
        match self {
            RuleRole::Voter => !peer.is_learner,
            RuleRole::Leader => !peer.is_learner && is_leader,
            RuleRole::Follower => !peer.is_learner && !is_leader,
            RuleRole::Learner => peer.is_learner,
        }
    }
}

/// One placement rule. Effective rules for a region are the rules whose key
/// range intersects the region's, deduplicated by (group, id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Rule {
    pub group_id: String,
    pub id: String,
    #[serde(default)]
    pub index: u32,
    #[serde(default, rename = "override")]
    pub override_group: bool,
    #[serde(default, with = "hex_key")]
    pub start_key: Vec<u8>,
    #[serde(default, with = "hex_key")]
    pub end_key: Vec<u8>,
    pub role: RuleRole,
    pub count: usize,
    #[serde(default)]
    pub label_constraints: Vec<LabelConstraint>,
    #[serde(default)]
    pub location_labels: Vec<String>,
}

impl Rule {
    /// Whether the rule's key range intersects `[start, end)`.
    fn intersects(&self, start: &[u8], end: &[u8]) -> bool {
        let left_ok = self.end_key.is_empty() || start < self.end_key.as_slice();
        let right_ok = end.is_empty() || self.start_key.as_slice() < end;
        left_ok && right_ok
    }
}

mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8], s: S) -> Result<S::Ok, S::Error> {
        let hex: String = key.iter().map(|b| format!("{b:02X}")).collect();
        s.serialize_str(&hex)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let hex = String::deserialize(d)?;
        if hex.len() % 2 != 0 {
            return Err(serde::de::Error::custom("odd-length hex key"));
        }
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// Assignment of peers to one rule.
#[derive(Debug, Clone)]
pub struct RuleFit {
    pub rule: Rule,
    pub peers: Vec<Peer>,
    pub isolation_score: f64,
}

impl RuleFit {
    pub fn is_satisfied(&self) -> bool {
        self.peers.len() == self.rule.count
    }
}

/// Best-effort assignment of a region's peers to the effective rules.
#[derive(Debug, Clone, Default)]
pub struct RegionFit {
    pub rule_fits: Vec<RuleFit>,
    /// Peers matched by no rule; the rule checker removes them.
    pub orphan_peers: Vec<Peer>,
}

impl RegionFit {
    pub fn is_satisfied(&self) -> bool {
        !self.rule_fits.is_empty()
            && self.rule_fits.iter().all(|rf| rf.is_satisfied())
            && self.orphan_peers.is_empty()
    }

    fn unsatisfied_count(&self) -> usize {
        self.rule_fits.iter().filter(|rf| !rf.is_satisfied()).count()
    }

    fn isolation_total(&self) -> f64 {
        self.rule_fits.iter().map(|rf| rf.isolation_score).sum()
    }
}

/// Total order on fits: fewer unsatisfied rules is better, then higher
/// isolation. `Greater` means `a` is the better fit.
pub fn compare_region_fit(a: &RegionFit, b: &RegionFit) -> Ordering {
    match b.unsatisfied_count().cmp(&a.unsatisfied_count()) {
        Ordering::Equal => {}
        ord => return ord,
    }
    a.isolation_total().partial_cmp(&b.isolation_total()).unwrap_or(Ordering::Equal)
}

/// Ordered rule set persisted in the metadata store under
/// `/rules/<group>/<id>`.
pub struct RuleManager {
    store: Arc<dyn MetaStore>,
    rules: RwLock<BTreeMap<(String, String), Rule>>,
}

impl RuleManager {
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self { store, rules: RwLock::new(BTreeMap::new()) }
    }

    /// Reload all persisted rules, replacing the in-memory set.
    pub fn load(&self) -> anyhow::Result<()> {
        let mut rules = BTreeMap::new();
        for (key, value) in self.store.scan_prefix(RULES_PREFIX)? {
            let rule: Rule =
                serde_json::from_str(&value).with_context(|| format!("decode rule at {key}"))?;
            rules.insert((rule.group_id.clone(), rule.id.clone()), rule);
        }
        *self.rules.write().unwrap() = rules;
        Ok(())
    }

    pub fn set_rule(&self, rule: Rule) -> anyhow::Result<()> {
        let value = serde_json::to_string(&rule).context("encode rule")?;
        self.store.put(&rule_key(&rule.group_id, &rule.id), value)?;
        self.rules.write().unwrap().insert((rule.group_id.clone(), rule.id.clone()), rule);
        Ok(())
    }

    pub fn delete_rule(&self, group_id: &str, id: &str) -> anyhow::Result<()> {
        self.store.remove(&rule_key(group_id, id))?;
        self.rules.write().unwrap().remove(&(group_id.to_string(), id.to_string()));
        Ok(())
    }

    pub fn get_rules(&self) -> Vec<Rule> {
        self.rules.read().unwrap().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().unwrap().is_empty()
    }

    /// Effective rules for a key range, ordered by (group, index, id). An
    /// `override` rule discards the earlier rules of its group.
    pub fn rules_for_range(&self, start: &[u8], end: &[u8]) -> Vec<Rule> {
        let rules = self.rules.read().unwrap();
        let mut matched: Vec<Rule> =
            rules.values().filter(|r| r.intersects(start, end)).cloned().collect();
        matched.sort_by(|a, b| {
            (&a.group_id, a.index, &a.id).cmp(&(&b.group_id, b.index, &b.id))
        });
        let mut effective: Vec<Rule> = Vec::with_capacity(matched.len());
        for rule in matched {
            if rule.override_group {
                effective.retain(|r| r.group_id != rule.group_id);
            }
            effective.push(rule);
        }
        effective
    }

    /// The degenerate rule used when no stored rule matches: `max-replicas`
    /// voters spread over the configured location labels.
    pub fn default_rule(config: &ScheduleConfig) -> Rule {
        Rule {
            group_id: "default".to_string(),
            id: "default".to_string(),
            index: 0,
            override_group: false,
            start_key: Vec::new(),
            end_key: Vec::new(),
            role: RuleRole::Voter,
            count: config.max_replicas,
            label_constraints: Vec::new(),
            location_labels: config.location_labels.clone(),
        }
    }

    /// Compute the best assignment of the region's peers to the effective
    /// rules.
    ///
    /// Rules are filled in order; each rule greedily takes the matching peers
    /// that maximize its isolation score. A peer is assigned to at most one
    /// rule; leftovers become orphans.
    pub fn fit_region(
        &self,
        config: &ScheduleConfig,
        region: &RegionInfo,
        stores: &[StoreInfo],
    ) -> RegionFit {
        let mut rules = self.rules_for_range(&region.start_key, &region.end_key);
        if rules.is_empty() {
            rules.push(Self::default_rule(config));
        }

        let store_of = |peer: &Peer| stores.iter().find(|s| s.id == peer.store_id);
        let leader = region.leader;
        let mut remaining: Vec<Peer> = region.peers.clone();
        let mut fits = Vec::with_capacity(rules.len());

        for rule in rules {
            let mut chosen: Vec<Peer> = Vec::with_capacity(rule.count);
            while chosen.len() < rule.count {
                // Among unassigned matching peers, take the one that keeps
                // the picked set most isolated.
                let mut best: Option<(usize, f64)> = None;
                for (idx, peer) in remaining.iter().enumerate() {
                    if !rule.role.matches_peer(peer, leader.as_ref()) {
                        continue;
                    }
                    let Some(store) = store_of(peer) else { continue };
                    if !match_label_constraints(store, &rule.label_constraints) {
                        continue;
                    }
                    let chosen_stores: Vec<StoreInfo> = chosen
                        .iter()
                        .filter_map(|p| store_of(p).cloned())
                        .collect();
                    let score = distinct_score(&rule.location_labels, &chosen_stores, store);
                    if best.map_or(true, |(_, s)| score > s) {
                        best = Some((idx, score));
                    }
                }
                match best {
                    Some((idx, _)) => chosen.push(remaining.remove(idx)),
                    None => break,
                }
            }
            let chosen_stores: Vec<StoreInfo> =
                chosen.iter().filter_map(|p| store_of(p).cloned()).collect();
            let isolation_score: f64 = chosen_stores
                .iter()
                .map(|s| distinct_score(&rule.location_labels, &chosen_stores, s))
                .sum::<f64>()
                / 2.0;
            fits.push(RuleFit { rule, peers: chosen, isolation_score });
        }

        RegionFit { rule_fits: fits, orphan_peers: remaining }
    }
}

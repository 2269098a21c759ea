//! Runtime-mutable scheduling options.
//!
//! The whole struct serializes to JSON so the coordinator can persist it in
//! the metadata store and admins can patch individual fields at runtime.
//! Schedulers take a cloned snapshot per tick; nothing on the decision path
//! re-reads shared configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::keys::KeyType;

/// Label property type: stores matched by any of the listed label pairs must
/// not be chosen as a leader target.
pub const REJECT_LEADER: &str = "reject-leader";

/// The two per-store rate-limited operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreLimitKind {
    AddPeer,
    RemovePeer,
}

/// How balance-leader scores a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaderSchedulePolicy {
    Count,
    Size,
}

/// One label selector inside a label property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelPropertyRule {
    pub key: String,
    pub value: String,
}

/// Per-store operation rate limits, in operations per minute.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StoreLimitConfig {
    pub add_peer: f64,
    pub remove_peer: f64,
}

impl Default for StoreLimitConfig {
    fn default() -> Self {
        Self { add_peer: 15.0, remove_peer: 15.0 }
    }
}

/// Every option the scheduling core reads at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ScheduleConfig {
    pub leader_schedule_limit: u64,
    pub region_schedule_limit: u64,
    pub replica_schedule_limit: u64,
    pub merge_schedule_limit: u64,
    pub hot_region_schedule_limit: u64,

    pub max_snapshot_count: u64,
    pub max_pending_peer_count: u64,
    #[serde(with = "duration_secs")]
    pub max_store_down_time: Duration,

    /// Mergeable combined size, in MiB.
    pub max_merge_region_size: u64,
    pub max_merge_region_keys: u64,
    #[serde(with = "duration_secs")]
    pub split_merge_interval: Duration,
    pub one_way_merge: bool,
    pub cross_table_merge: bool,

    pub max_replicas: usize,
    pub location_labels: Vec<String>,
    pub strictly_match_label: bool,
    pub placement_rules_enabled: bool,

    pub hot_region_cache_hits_threshold: i32,
    pub tolerant_size_ratio: f64,
    pub low_space_ratio: f64,
    pub high_space_ratio: f64,
    pub scheduler_max_waiting_operator: u64,

    pub remove_down_replica: bool,
    pub replace_offline_replica: bool,
    pub make_up_replica: bool,
    pub remove_extra_replica: bool,
    pub location_replacement: bool,
    pub debug_metrics: bool,

    pub leader_schedule_policy: LeaderSchedulePolicy,
    pub key_type: KeyType,

    /// Per-store overrides of the default operation rate limits.
    pub store_limits: HashMap<u64, StoreLimitConfig>,
    pub default_store_limit: StoreLimitConfig,

    /// Label properties, e.g. `reject-leader` -> selectors.
    pub label_properties: HashMap<String, Vec<LabelPropertyRule>>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            leader_schedule_limit: 4,
            region_schedule_limit: 64,
            replica_schedule_limit: 64,
            merge_schedule_limit: 8,
            hot_region_schedule_limit: 4,
            max_snapshot_count: 3,
            max_pending_peer_count: 16,
            max_store_down_time: Duration::from_secs(30 * 60),
            max_merge_region_size: 20,
            max_merge_region_keys: 200_000,
            split_merge_interval: Duration::from_secs(60 * 60),
            one_way_merge: false,
            cross_table_merge: false,
            max_replicas: 3,
            location_labels: Vec::new(),
            strictly_match_label: false,
            placement_rules_enabled: false,
            hot_region_cache_hits_threshold: 3,
            tolerant_size_ratio: 5.0,
            low_space_ratio: 0.8,
            high_space_ratio: 0.6,
            scheduler_max_waiting_operator: 5,
            remove_down_replica: true,
            replace_offline_replica: true,
            make_up_replica: true,
            remove_extra_replica: true,
            location_replacement: true,
            debug_metrics: false,
            leader_schedule_policy: LeaderSchedulePolicy::Count,
            key_type: KeyType::Raw,
            store_limits: HashMap::new(),
            default_store_limit: StoreLimitConfig::default(),
            label_properties: HashMap::new(),
        }
    }
}

impl ScheduleConfig {
    /// Rate limit for one store and operation kind, operations per minute.
    pub fn store_limit(&self, store_id: u64, kind: StoreLimitKind) -> f64 {
        let limits = self.store_limits.get(&store_id).copied().unwrap_or(self.default_store_limit);
        match kind {
            StoreLimitKind::AddPeer => limits.add_peer,
            StoreLimitKind::RemovePeer => limits.remove_peer,
        }
    }

    /// Whether any selector of label property `typ` matches the given labels.
    pub fn check_label_property(&self, typ: &str, labels: &[crate::store::StoreLabel]) -> bool {
        let Some(rules) = self.label_properties.get(typ) else {
            return false;
        };
        rules.iter().any(|rule| {
            labels.iter().any(|l| l.key == rule.key && l.value == rule.value)
        })
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreLabel;

    #[test]
    fn config_round_trips_through_json() {
        let mut cfg = ScheduleConfig::default();
        cfg.store_limits.insert(7, StoreLimitConfig { add_peer: 5.0, remove_peer: 3.0 });
        cfg.label_properties.insert(
            REJECT_LEADER.to_string(),
            vec![LabelPropertyRule { key: "noleader".into(), value: "true".into() }],
        );
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ScheduleConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_store_down_time, cfg.max_store_down_time);
        assert_eq!(back.store_limit(7, StoreLimitKind::RemovePeer), 3.0);
        assert_eq!(back.store_limit(8, StoreLimitKind::AddPeer), 15.0);
    }

    #[test]
    fn label_property_matches_any_selector() {
        let mut cfg = ScheduleConfig::default();
        cfg.label_properties.insert(
            REJECT_LEADER.to_string(),
            vec![LabelPropertyRule { key: "noleader".into(), value: "true".into() }],
        );
        let labels = vec![StoreLabel { key: "noleader".into(), value: "true".into() }];
        assert!(cfg.check_label_property(REJECT_LEADER, &labels));
        assert!(!cfg.check_label_property(REJECT_LEADER, &[]));
        assert!(!cfg.check_label_property("other", &labels));
    }
}

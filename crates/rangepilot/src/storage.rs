//! Facade over the external consensus-backed metadata store.
//!
//! The scheduling core treats the store as an opaque ordered key-value map;
//! only the key layout is contractual:
//!
//! - placement rules:       `/rules/<group>/<id>` (JSON)
//! - scheduler configs:     `/schedulers/<name>`  (JSON)
//! - last-known store meta: `/stores/<id>`        (JSON)
//! - cluster version:       `/cluster/version`

use std::collections::BTreeMap;
use std::sync::RwLock;

pub const RULES_PREFIX: &str = "/rules/";
pub const SCHEDULERS_PREFIX: &str = "/schedulers/";
pub const STORES_PREFIX: &str = "/stores/";
pub const CLUSTER_VERSION_KEY: &str = "/cluster/version";

pub fn rule_key(group: &str, id: &str) -> String {
    format!("{RULES_PREFIX}{group}/{id}")
}

pub fn scheduler_key(name: &str) -> String {
    format!("{SCHEDULERS_PREFIX}{name}")
}

pub fn store_key(store_id: u64) -> String {
    format!("{STORES_PREFIX}{store_id}")
}

/// Opaque get/put view of the metadata store.
///
/// The real implementation proxies a strongly-consistent store owned by the
/// coordinator; the in-memory one below backs tests and bootstrap.
pub trait MetaStore: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn put(&self, key: &str, value: String) -> anyhow::Result<()>;
    fn remove(&self, key: &str) -> anyhow::Result<()>;
    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, String)>>;
}

/// Last-known store metadata persisted under `/stores/<id>`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoreMeta {
    pub id: u64,
    pub address: String,
    pub labels: Vec<crate::store::StoreLabel>,
    pub state: crate::store::StoreState,
}

impl From<&crate::store::StoreInfo> for StoreMeta {
    fn from(store: &crate::store::StoreInfo) -> Self {
        Self {
            id: store.id,
            address: store.address.clone(),
            labels: store.labels.clone(),
            state: store.state,
        }
    }
}

/// In-memory metadata store.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaStore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.data.read().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: String) -> anyhow::Result<()> {
        self.data.write().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.data.write().unwrap().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, String)>> {
        let data = self.data.read().unwrap();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_is_ordered_and_bounded() {
        let kv = MemoryStore::new();
        kv.put(&rule_key("pd", "default"), "a".into()).unwrap();
        kv.put(&rule_key("pd", "learner"), "b".into()).unwrap();
        kv.put(&scheduler_key("balance-leader"), "c".into()).unwrap();

        let rules = kv.scan_prefix(RULES_PREFIX).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].0, "/rules/pd/default");
        assert_eq!(rules[1].0, "/rules/pd/learner");

        kv.remove(&rule_key("pd", "default")).unwrap();
        assert_eq!(kv.scan_prefix(RULES_PREFIX).unwrap().len(), 1);
        assert_eq!(kv.get(&scheduler_key("balance-leader")).unwrap().as_deref(), Some("c"));
    }
}

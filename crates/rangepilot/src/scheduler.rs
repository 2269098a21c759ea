//! Scheduler trait, the name -> factory registry, and the tick loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::cluster::Cluster;
use crate::controller::OperatorController;
use crate::operator::Operator;
use crate::storage::MetaStore;

/// Backoff factor applied to a scheduler's interval after an idle tick.
const INTERVAL_GROWTH: f64 = 1.5;

/// A long-lived decision loop body. Implementations keep their own state
/// behind interior locks; `schedule` must not block on I/O.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;
    fn scheduler_type(&self) -> &'static str;

    fn min_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn max_interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Cheap pre-check against the schedule limits, consulted before a tick.
    fn is_schedule_allowed(&self, cluster: &Cluster) -> bool;

    /// Produce zero or more operators. Returning none is the normal answer
    /// when no improving move exists.
    fn schedule(&self, cluster: &Cluster) -> Vec<Operator>;
}

/// Everything a scheduler factory gets to work with.
pub struct SchedulerContext {
    pub controller: Arc<OperatorController>,
    pub storage: Arc<dyn MetaStore>,
}

pub type SchedulerFactory =
    fn(&SchedulerContext, &[String]) -> anyhow::Result<Box<dyn Scheduler>>;

/// Maps scheduler type names to factories. Factories decode their args
/// (and/or persisted config) themselves.
#[derive(Default)]
pub struct SchedulerRegistry {
    factories: HashMap<&'static str, SchedulerFactory>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with every built-in scheduler.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(crate::balance::BALANCE_LEADER_TYPE, crate::balance::new_balance_leader);
        registry.register(crate::balance::BALANCE_REGION_TYPE, crate::balance::new_balance_region);
        registry.register(crate::hot_region::HOT_REGION_TYPE, crate::hot_region::new_hot_region);
        registry.register(
            crate::misc_schedulers::SHUFFLE_LEADER_TYPE,
            crate::misc_schedulers::new_shuffle_leader,
        );
        registry.register(
            crate::misc_schedulers::SHUFFLE_REGION_TYPE,
            crate::misc_schedulers::new_shuffle_region,
        );
        registry.register(
            crate::misc_schedulers::EVICT_LEADER_TYPE,
            crate::misc_schedulers::new_evict_leader,
        );
        registry.register(crate::misc_schedulers::LABEL_TYPE, crate::misc_schedulers::new_label);
        registry.register(
            crate::misc_schedulers::RANDOM_MERGE_TYPE,
            crate::misc_schedulers::new_random_merge,
        );
        registry.register(
            crate::misc_schedulers::ADJACENT_REGION_TYPE,
            crate::misc_schedulers::new_adjacent_region,
        );
        registry.register(
            crate::misc_schedulers::SCATTER_RANGE_TYPE,
            crate::misc_schedulers::new_scatter_range,
        );
        registry
    }

    pub fn register(&mut self, type_name: &'static str, factory: SchedulerFactory) {
        if self.factories.insert(type_name, factory).is_some() {
            tracing::warn!(scheduler = type_name, "scheduler factory re-registered");
        }
    }

    pub fn create(
        &self,
        type_name: &str,
        ctx: &SchedulerContext,
        args: &[String],
    ) -> anyhow::Result<Box<dyn Scheduler>> {
        let factory = self
            .factories
            .get(type_name)
            .with_context(|| format!("unknown scheduler type {type_name}"))?;
        factory(ctx, args)
    }
}

/// Drive one scheduler until shutdown. The interval stretches while ticks
/// come back empty and snaps back to the minimum when one produces work.
pub fn spawn_scheduler(
    scheduler: Box<dyn Scheduler>,
    controller: Arc<OperatorController>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = scheduler.min_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!(scheduler = scheduler.name(), "scheduler loop stopped");
                        return;
                    }
                    continue;
                }
            }

            let cluster = Arc::clone(controller.cluster());
            let mut produced = false;
            if scheduler.is_schedule_allowed(&cluster) {
                for op in scheduler.schedule(&cluster) {
                    produced = true;
                    if let Err(err) = controller.add_operator(op) {
                        tracing::debug!(scheduler = scheduler.name(), error = %err,
                            "operator not admitted");
                    }
                }
            }
            if cluster.config().debug_metrics {
                tracing::debug!(scheduler = scheduler.name(), produced, "scheduler tick");
            }
            interval = if produced {
                scheduler.min_interval()
            } else {
                grow_interval(interval, scheduler.max_interval())
            };
        }
    })
}

fn grow_interval(current: Duration, max: Duration) -> Duration {
    current.mul_f64(INTERVAL_GROWTH).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_grows_exponentially_to_cap() {
        let max = Duration::from_secs(60);
        let mut interval = Duration::from_secs(1);
        for _ in 0..20 {
            let next = grow_interval(interval, max);
            assert!(next >= interval);
            interval = next;
        }
        assert_eq!(interval, max);
    }

    #[test]
    fn registry_rejects_unknown_types() {
        use crate::cluster::Cluster;
        use crate::config::ScheduleConfig;
        use crate::heartbeat::HeartbeatStreams;
        use crate::storage::MemoryStore;

        let storage: Arc<dyn MetaStore> = Arc::new(MemoryStore::new());
        let cluster = Cluster::new(ScheduleConfig::default(), Arc::clone(&storage));
        let controller = OperatorController::new(cluster, Arc::new(HeartbeatStreams::new()));
        let ctx = SchedulerContext { controller, storage };

        let registry = SchedulerRegistry::with_defaults();
        assert!(registry.create("no-such-scheduler", &ctx, &[]).is_err());
        let balance = registry.create(crate::balance::BALANCE_LEADER_TYPE, &ctx, &[]).unwrap();
        assert_eq!(balance.name(), "balance-leader-scheduler");
    }
}

//! Lookup of scheduler instances by id
//!
//! The registry is assembled once at startup and never changes afterwards,
//! so lookups need no locking.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

use super::job_scheduler::Scheduler;
use super::policy::PolicyRegistry;
use super::storage::JobStorage;
use crate::config::{Config, SchedulerConfig};
use crate::errors::{SchedulerError, SchedulerResult};
use crate::observability::SchedulerMetrics;

#[derive(Debug, Default)]
pub struct SchedulerRegistry {
    schedulers: BTreeMap<String, Arc<Scheduler>>,
}

impl SchedulerRegistry {
    pub fn builder() -> SchedulerRegistryBuilder {
        SchedulerRegistryBuilder::default()
    }

    /// One scheduler per configured section, sharing `storage` if given
    pub fn from_config(
        config: &Config,
        storage: Option<Arc<dyn JobStorage>>,
    ) -> SchedulerResult<Self> {
        let mut builder = Self::builder();
        for settings in &config.schedulers {
            builder = builder.configure(settings.clone(), storage.clone())?;
        }
        Ok(builder.build())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Scheduler>> {
        self.schedulers.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.schedulers.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Scheduler>> {
        self.schedulers.values()
    }

    pub fn len(&self) -> usize {
        self.schedulers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedulers.is_empty()
    }

    /// Start every scheduler that is not running yet
    pub fn start_all(&self) -> SchedulerResult<()> {
        for scheduler in self.iter().filter(|s| !s.is_running()) {
            scheduler.start()?;
        }
        info!("Started {} schedulers", self.len());
        Ok(())
    }

    /// Stop every running scheduler; failures are logged, not returned
    pub async fn stop_all(&self) {
        for scheduler in self.iter().filter(|s| s.is_running()) {
            if let Err(e) = scheduler.stop().await {
                error!(scheduler_id = %scheduler.id(), "Failed to stop scheduler: {}", e);
            }
        }
    }
}

/// Collects schedulers before the registry is frozen
#[derive(Debug, Default)]
pub struct SchedulerRegistryBuilder {
    policies: PolicyRegistry,
    schedulers: BTreeMap<String, Arc<Scheduler>>,
}

impl SchedulerRegistryBuilder {
    /// Policies available to schedulers created by `configure`
    pub fn policies(mut self, policies: PolicyRegistry) -> Self {
        self.policies = policies;
        self
    }

    /// Add an existing scheduler; its id must not be taken yet
    pub fn add(mut self, scheduler: Arc<Scheduler>) -> SchedulerResult<Self> {
        let id = scheduler.id().to_string();
        if self.schedulers.contains_key(&id) {
            return Err(SchedulerError::DuplicateScheduler { id });
        }
        self.schedulers.insert(id, scheduler);
        Ok(self)
    }

    /// Create a scheduler from its settings and add it
    pub fn configure(
        self,
        settings: SchedulerConfig,
        storage: Option<Arc<dyn JobStorage>>,
    ) -> SchedulerResult<Self> {
        let metrics = SchedulerMetrics::new(&settings.id);
        let scheduler = Scheduler::new(settings, &self.policies, storage, metrics)?;
        self.add(scheduler)
    }

    pub fn build(self) -> SchedulerRegistry {
        SchedulerRegistry {
            schedulers: self.schedulers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let first = Scheduler::with_config(SchedulerConfig::with_id("get")).unwrap();
        let second = Scheduler::with_config(SchedulerConfig::with_id("get")).unwrap();
        let err = SchedulerRegistry::builder()
            .add(first)
            .unwrap()
            .add(second)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateScheduler { id } if id == "get"));
    }

    #[test]
    fn test_from_config_builds_every_section() {
        let config = Config {
            schedulers: vec![SchedulerConfig::with_id("put"), SchedulerConfig::with_id("get")],
            ..Config::default()
        };
        let registry = SchedulerRegistry::from_config(&config, None).unwrap();
        assert_eq!(registry.ids(), vec!["get", "put"]);
        assert!(registry.get("put").is_some());
        assert!(registry.get("copy").is_none());
    }

    #[test]
    fn test_unknown_policy_in_config_fails() {
        let mut settings = SchedulerConfig::with_id("ls");
        settings.priority_policy = "lottery".to_string();
        let err = SchedulerRegistry::builder()
            .configure(settings, None)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownPolicy { .. }));
    }

    #[tokio::test]
    async fn test_start_and_stop_all() {
        let registry = SchedulerRegistry::builder()
            .configure(SchedulerConfig::with_id("a"), None)
            .unwrap()
            .configure(SchedulerConfig::with_id("b"), None)
            .unwrap()
            .build();
        registry.start_all().unwrap();
        assert!(registry.iter().all(|s| s.is_running()));
        registry.stop_all().await;
        assert!(registry.iter().all(|s| !s.is_running()));
    }
}

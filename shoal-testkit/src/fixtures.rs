use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use shoal::{
    Action, AdmissionController, CAMPAIGN_LABEL, Campaign, CampaignSpec, ControllerConfig,
    ExecutionTemplate, InMemoryObjectStore, LifecycleManager, ListFilter, ObjectKey, ObjectStore,
    ObjectStoreExt, PartitionStrategy, Resource, Result, SchedulingPolicy, StaticDiscovery, WorkUnit,
};

use crate::{FaultyStore, RecordingPublisher, SubstrateSimulator};

/// Namespace every fixture lives in.
pub const NAMESPACE: &str = "maint";

/// `count` repository identifiers in a stable order.
pub fn repositories(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("org/repo-{i:02}")).collect()
}

/// Builds campaigns with readable defaults.
#[derive(Clone, Debug)]
pub struct CampaignBuilder {
    name: String,
    spec: CampaignSpec,
}

impl CampaignBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spec: CampaignSpec::default(),
        }
    }

    pub fn strategy(mut self, strategy: PartitionStrategy, batch_size: i64) -> Self {
        let parallelism = self.spec.policy.parallelism;
        self.spec.policy = SchedulingPolicy::new(strategy, batch_size).with_parallelism(parallelism);
        self
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.spec.policy.parallelism = parallelism;
        self
    }

    pub fn retention_seconds(mut self, seconds: i64) -> Self {
        self.spec.policy.retention_seconds = Some(seconds);
        self
    }

    pub fn suspended(mut self, suspended: bool) -> Self {
        self.spec.suspended = suspended;
        self
    }

    /// Base configuration; non-object values are ignored.
    pub fn base_config(mut self, config: Value) -> Self {
        if let Value::Object(fields) = config {
            self.spec.base_config = fields;
        }
        self
    }

    pub fn execution(mut self, template: Value) -> Self {
        self.spec.execution = ExecutionTemplate(template);
        self
    }

    pub fn build(self) -> Campaign {
        Campaign::new(NAMESPACE, self.name, self.spec)
    }
}

/// Both controllers wired to one in-memory store.
///
/// The store is wrapped in a [`FaultyStore`] with no faults armed, so tests
/// can inject failures through [`faults`](Self::faults) at any point.
pub struct Harness {
    pub config: ControllerConfig,
    pub memory: Arc<InMemoryObjectStore>,
    pub faults: Arc<FaultyStore>,
    pub store: Arc<dyn ObjectStore>,
    pub discovery: Arc<StaticDiscovery>,
    pub events: RecordingPublisher,
    pub admission: AdmissionController,
    pub lifecycle: LifecycleManager,
    pub substrate: SubstrateSimulator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let memory = Arc::new(InMemoryObjectStore::new());
        let faults = Arc::new(FaultyStore::new(memory.clone()));
        let store: Arc<dyn ObjectStore> = faults.clone();
        let discovery = Arc::new(StaticDiscovery::new());
        let events = RecordingPublisher::new();

        let admission = AdmissionController::new(
            store.clone(),
            discovery.clone(),
            Arc::new(events.clone()),
            config.clone(),
        );
        let lifecycle = LifecycleManager::new(store.clone(), Arc::new(events.clone()), config.clone());
        let substrate = SubstrateSimulator::new(memory.clone());

        Self {
            config,
            memory,
            faults,
            store,
            discovery,
            events,
            admission,
            lifecycle,
            substrate,
        }
    }

    /// Stores `campaign` and makes discovery return `repositories` for it.
    pub async fn create_campaign(&self, campaign: Campaign, repositories: &[String]) -> Campaign {
        self.discovery.set(campaign.key(), repositories.iter().cloned());
        self.memory
            .create(&campaign)
            .await
            .expect("campaign create failed")
    }

    pub async fn admit(&self, campaign: &ObjectKey) -> Result<Action> {
        self.admission.reconcile(campaign).await
    }

    pub async fn admit_at(&self, campaign: &ObjectKey, now: DateTime<Utc>) -> Result<Action> {
        self.admission.reconcile_at(campaign, now).await
    }

    pub async fn reconcile_unit(&self, unit: &ObjectKey) -> Result<Action> {
        self.lifecycle.reconcile(unit).await
    }

    pub async fn reconcile_unit_at(&self, unit: &ObjectKey, now: DateTime<Utc>) -> Result<Action> {
        self.lifecycle.reconcile_at(unit, now).await
    }

    /// Runs one lifecycle pass for every work unit of the campaign.
    pub async fn reconcile_units(&self, campaign: &ObjectKey, now: DateTime<Utc>) {
        for unit in self.work_units(campaign).await {
            self.lifecycle
                .reconcile_at(&unit.key(), now)
                .await
                .expect("lifecycle pass failed");
        }
    }

    pub async fn campaign(&self, key: &ObjectKey) -> Option<Campaign> {
        self.memory.get_opt::<Campaign>(key).await.expect("campaign read failed")
    }

    pub async fn work_unit(&self, key: &ObjectKey) -> Option<WorkUnit> {
        self.memory.get_opt::<WorkUnit>(key).await.expect("work unit read failed")
    }

    /// The campaign's work units ordered by batch index.
    pub async fn work_units(&self, campaign: &ObjectKey) -> Vec<WorkUnit> {
        let filter = ListFilter::in_namespace(&campaign.namespace).with_label(CAMPAIGN_LABEL, &campaign.name);
        let mut units = self
            .memory
            .list::<WorkUnit>(&filter)
            .await
            .expect("work unit list failed");
        units.sort_by_key(|u| u.spec.batch_index);
        units
    }

    /// Batch indices of the campaign's work units, ascending.
    pub async fn batch_indices(&self, campaign: &ObjectKey) -> Vec<usize> {
        self.work_units(campaign)
            .await
            .iter()
            .map(|u| u.spec.batch_index)
            .collect()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("config", &self.config)
            .field("objects", &self.memory.len())
            .finish_non_exhaustive()
    }
}

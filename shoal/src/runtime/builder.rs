use std::fmt;
use std::sync::Arc;

use crate::config::ControllerConfig;
use crate::discovery::RepositoryDiscovery;
use crate::events::InProcEventBus;
use crate::store::ObjectStore;

use super::supervisor::ControllerRuntime;

/// Builder for constructing a [`ControllerRuntime`] with explicit dependencies.
///
/// The store and discovery are required. Without an event bus the builder
/// creates one sized by `event_capacity`.
///
/// # Example
///
/// ```ignore
/// use shoal::*;
///
/// let runtime = ControllerRuntimeBuilder::new(ControllerConfig::default())
///     .with_store(store)
///     .with_discovery(discovery)
///     .build()?;
/// runtime.start().await?;
/// ```
pub struct ControllerRuntimeBuilder {
    config: ControllerConfig,
    store: Option<Arc<dyn ObjectStore>>,
    discovery: Option<Arc<dyn RepositoryDiscovery>>,
    events: Option<Arc<InProcEventBus>>,
}

impl fmt::Debug for ControllerRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerRuntimeBuilder")
            .field("config", &self.config)
            .field("store_set", &self.store.is_some())
            .field("discovery_set", &self.discovery.is_some())
            .field("events_set", &self.events.is_some())
            .finish()
    }
}

impl ControllerRuntimeBuilder {
    /// Create a new builder with the given controller configuration.
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            store: None,
            discovery: None,
            events: None,
        }
    }

    /// Set the object store.
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the repository discovery.
    pub fn with_discovery(mut self, discovery: Arc<dyn RepositoryDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Share an existing event bus.
    pub fn with_events(mut self, events: Arc<InProcEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if a required dependency is missing or the
    /// configuration cannot run.
    pub fn build(self) -> anyhow::Result<ControllerRuntime> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let discovery = self
            .discovery
            .ok_or_else(|| anyhow::anyhow!("discovery dependency missing"))?;
        if self.config.worker_count == 0 {
            anyhow::bail!("worker_count must be at least 1");
        }
        if self.config.event_capacity == 0 {
            anyhow::bail!("event_capacity must be at least 1");
        }
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(InProcEventBus::new(self.config.event_capacity)));

        Ok(ControllerRuntime::new(self.config, store, discovery, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscovery;
    use crate::store::InMemoryObjectStore;

    #[test]
    fn missing_store_is_reported() {
        let err = ControllerRuntimeBuilder::new(ControllerConfig::default())
            .with_discovery(Arc::new(StaticDiscovery::new()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("store"));
    }

    #[test]
    fn missing_discovery_is_reported() {
        let err = ControllerRuntimeBuilder::new(ControllerConfig::default())
            .with_store(Arc::new(InMemoryObjectStore::new()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("discovery"));
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = ControllerConfig::default();
        config.worker_count = 0;
        let result = ControllerRuntimeBuilder::new(config)
            .with_store(Arc::new(InMemoryObjectStore::new()))
            .with_discovery(Arc::new(StaticDiscovery::new()))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn shares_supplied_event_bus() {
        let bus = Arc::new(InProcEventBus::new(8));
        let runtime = ControllerRuntimeBuilder::new(ControllerConfig::default())
            .with_store(Arc::new(InMemoryObjectStore::new()))
            .with_discovery(Arc::new(StaticDiscovery::new()))
            .with_events(bus.clone())
            .build()
            .unwrap();
        assert!(Arc::ptr_eq(&runtime.events(), &bus));

        let debug = format!("{:?}", ControllerRuntimeBuilder::new(ControllerConfig::default()));
        assert!(debug.contains("store_set: false"));
    }
}

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use shoal::{EventPublisher, LifecycleEvent};

/// Publisher that keeps every event it receives.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    /// Payload labels in publish order.
    pub fn labels(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.payload.label()).collect()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.payload.label() == label)
            .count()
    }

    pub fn assert_emitted(&self, label: &str) {
        assert!(
            self.count(label) > 0,
            "expected a {label} event, got {:?}",
            self.labels()
        );
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl std::fmt::Debug for RecordingPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingPublisher")
            .field("events", &self.events.lock().len())
            .finish()
    }
}

#[async_trait]
impl EventPublisher<LifecycleEvent> for RecordingPublisher {
    async fn publish(&self, event: LifecycleEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

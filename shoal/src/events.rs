use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::resource::{ObjectKey, WorkUnitPhase};

/// Metadata envelope attached to every lifecycle event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    /// Shared by every event emitted during one reconcile pass.
    pub correlation_id: Uuid,
    pub idempotency_key: String,
    /// The object the event is about.
    pub entity: ObjectKey,
    /// The campaign the entity belongs to.
    pub campaign: ObjectKey,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(
        entity: ObjectKey,
        campaign: ObjectKey,
        correlation_id: Option<Uuid>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            idempotency_key: idempotency_key.into(),
            entity,
            campaign,
            timestamp: Utc::now(),
        }
    }
}

/// A work-unit or campaign lifecycle transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub meta: EventMeta,
    pub payload: LifecycleEventPayload,
}

impl LifecycleEvent {
    /// Builds an event whose idempotency key is derived from the entity and
    /// payload.
    pub fn new(
        entity: ObjectKey,
        campaign: ObjectKey,
        correlation_id: Uuid,
        payload: LifecycleEventPayload,
    ) -> Self {
        let idempotency_key = format!("{entity}:{}", payload.idempotency_suffix());
        Self {
            meta: EventMeta::new(entity, campaign, Some(correlation_id), idempotency_key),
            payload,
        }
    }
}

/// Event payload emitted for lifecycle transitions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum LifecycleEventPayload {
    /// A work unit record was created for a batch.
    Admitted {
        batch_index: usize,
        repositories: usize,
    },
    /// Admission found the work unit already present and adopted it.
    Adopted { batch_index: usize },
    /// The work unit's execution was created or adopted.
    ExecutionCreated {
        execution: ObjectKey,
        worker_index: usize,
    },
    /// The work unit moved between phases.
    PhaseChanged {
        from: WorkUnitPhase,
        to: WorkUnitPhase,
    },
    /// The execution vanished outside a terminal phase; the record was dropped.
    OrphanRemoved,
    /// A terminal work unit outlived its retention window.
    RetentionExpired,
    /// Cleanup ran and the finalizer was released.
    Finalized,
    /// A live work unit was deleted because its campaign is suspended.
    DrainRequested,
    /// The campaign's configuration cannot be admitted.
    AdmissionRejected { reason: String },
}

impl LifecycleEventPayload {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Admitted { .. } => "admitted",
            Self::Adopted { .. } => "adopted",
            Self::ExecutionCreated { .. } => "execution_created",
            Self::PhaseChanged { .. } => "phase_changed",
            Self::OrphanRemoved => "orphan_removed",
            Self::RetentionExpired => "retention_expired",
            Self::Finalized => "finalized",
            Self::DrainRequested => "drain_requested",
            Self::AdmissionRejected { .. } => "admission_rejected",
        }
    }

    fn idempotency_suffix(&self) -> String {
        match self {
            Self::PhaseChanged { from, to } => format!("{}:{from}:{to}", self.label()),
            other => other.label().to_string(),
        }
    }

    /// Whether the event frees a slot under the campaign's parallelism ceiling.
    pub fn frees_capacity(&self) -> bool {
        match self {
            Self::PhaseChanged { to, .. } => to.is_terminal(),
            Self::OrphanRemoved | Self::Finalized | Self::DrainRequested => true,
            _ => false,
        }
    }
}

/// Generic event publisher trait for publishing events of type `E`.
#[async_trait]
pub trait EventPublisher<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Publish an event to all subscribers.
    async fn publish(&self, event: E) -> anyhow::Result<()>;
}

/// Generic event subscriber trait for receiving events of type `E`.
pub trait EventSubscriber<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Subscribe to events, returning a broadcast receiver.
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never waits for subscribers. A subscriber that falls more than
/// `capacity` events behind receives `RecvError::Lagged` and skips ahead;
/// the runtime's periodic resync covers anything it missed.
pub struct InProcEventBus {
    sender: broadcast::Sender<LifecycleEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    /// Create a new event bus buffering up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub fn publish_event(&self, event: LifecycleEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher<LifecycleEvent> for InProcEventBus {
    async fn publish(&self, event: LifecycleEvent) -> anyhow::Result<()> {
        self.publish_event(event);
        Ok(())
    }
}

impl EventSubscriber<LifecycleEvent> for InProcEventBus {
    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.subscribe_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn event(name: &str, payload: LifecycleEventPayload) -> LifecycleEvent {
        LifecycleEvent::new(
            ObjectKey::new("maint", name),
            ObjectKey::new("maint", "nightly"),
            Uuid::now_v7(),
            payload,
        )
    }

    #[tokio::test]
    async fn test_broadcast_to_multiple_subscribers() {
        let bus = InProcEventBus::new(100);
        let mut rx1 = bus.subscribe_events();
        let mut rx2 = bus.subscribe_events();

        for i in 0..3 {
            bus.publish_event(event(
                &format!("nightly-batch-{i}"),
                LifecycleEventPayload::Admitted {
                    batch_index: i,
                    repositories: 2,
                },
            ));
        }

        for i in 0..3 {
            let a = timeout(Duration::from_millis(100), rx1.recv())
                .await
                .unwrap()
                .unwrap();
            let b = timeout(Duration::from_millis(100), rx2.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(a.meta.entity.name, format!("nightly-batch-{i}"));
            assert_eq!(b.meta.entity, a.meta.entity);
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_doesnt_block_publisher() {
        let bus = InProcEventBus::new(2);
        let mut rx = bus.subscribe_events();

        for _ in 0..5 {
            bus.publish(event("nightly-batch-0", LifecycleEventPayload::Finalized))
                .await
                .unwrap();
        }

        let result = timeout(Duration::from_millis(100), rx.recv()).await.unwrap();
        assert!(matches!(
            result,
            Err(broadcast::error::RecvError::Lagged(_)) | Ok(_)
        ));
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = InProcEventBus::new(4);
        bus.publish_event(event("nightly-batch-0", LifecycleEventPayload::OrphanRemoved));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_idempotency_key_includes_transition() {
        let evt = event(
            "nightly-batch-1",
            LifecycleEventPayload::PhaseChanged {
                from: WorkUnitPhase::Running,
                to: WorkUnitPhase::Succeeded,
            },
        );
        assert_eq!(
            evt.meta.idempotency_key,
            "maint/nightly-batch-1:phase_changed:Running:Succeeded"
        );
        assert_eq!(evt.meta.version, 1);
        assert_eq!(evt.meta.campaign.name, "nightly");
    }

    #[test]
    fn test_frees_capacity() {
        assert!(
            LifecycleEventPayload::PhaseChanged {
                from: WorkUnitPhase::Running,
                to: WorkUnitPhase::Failed,
            }
            .frees_capacity()
        );
        assert!(
            !LifecycleEventPayload::PhaseChanged {
                from: WorkUnitPhase::Pending,
                to: WorkUnitPhase::Running,
            }
            .frees_capacity()
        );
        assert!(LifecycleEventPayload::Finalized.frees_capacity());
        assert!(!LifecycleEventPayload::Adopted { batch_index: 0 }.frees_capacity());
    }

    #[test]
    fn test_debug_format() {
        let bus = InProcEventBus::new(16);
        let _rx = bus.subscribe_events();
        let debug = format!("{bus:?}");
        assert!(debug.contains("capacity: 16"));
        assert!(debug.contains("subscribers: 1"));
    }
}

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, Semaphore};

use crate::backoff::{Action, compute_retry_delay};
use crate::config::ControllerConfig;
use crate::discovery::RepositoryDiscovery;
use crate::error::Result;
use crate::events::{EventPublisher, InProcEventBus, LifecycleEvent, LifecycleEventPayload};
use crate::lifecycle::LifecycleManager;
use crate::resource::{Campaign, Resource, WorkUnit};
use crate::scheduler::AdmissionController;
use crate::store::{ListFilter, ObjectStore, ObjectStoreExt};

use super::queue::{ReconcileTarget, WorkQueue};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Cooperative shutdown signal shared by the runtime's background tasks.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Consecutive failed passes per target; cleared by a successful pass.
type FailureCounts = Arc<parking_lot::Mutex<HashMap<ReconcileTarget, u32>>>;

/// Drives campaigns and work units to their desired state.
///
/// The runtime owns a de-duplicating [`WorkQueue`] and runs at most
/// `worker_count` reconcile passes at a time, never two for the same target.
/// Targets enter the queue from three places:
///
/// - the requeue hint returned by each pass, or a backoff delay after a
///   retryable error (fatal errors are not requeued);
/// - the event observer, which enqueues new work units and re-admits a
///   campaign whenever one of its units frees capacity;
/// - the resync loop, which enqueues every campaign and work unit on an
///   interval.
pub struct ControllerRuntime {
    config: ControllerConfig,
    store: Arc<dyn ObjectStore>,
    admission: Arc<AdmissionController>,
    lifecycle: Arc<LifecycleManager>,
    events: Arc<InProcEventBus>,
    queue: Arc<WorkQueue>,
    permits: Arc<Semaphore>,
    failures: FailureCounts,
    shutdown_token: ShutdownToken,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl fmt::Debug for ControllerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerRuntime")
            .field("config", &self.config)
            .field("queued", &self.queue.len())
            .field("available_permits", &self.permits.available_permits())
            .field("shutdown", &self.shutdown_token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ControllerRuntime {
    /// Create a runtime; nothing runs until [`start`](Self::start).
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn ObjectStore>,
        discovery: Arc<dyn RepositoryDiscovery>,
        events: Arc<InProcEventBus>,
    ) -> Self {
        let publisher: Arc<dyn EventPublisher<LifecycleEvent>> = events.clone();
        let admission = Arc::new(AdmissionController::new(
            store.clone(),
            discovery,
            publisher.clone(),
            config.clone(),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            publisher,
            config.clone(),
        ));
        let worker_count = config.worker_count.max(1);

        Self {
            config,
            store,
            admission,
            lifecycle,
            events,
            queue: Arc::new(WorkQueue::new()),
            permits: Arc::new(Semaphore::new(worker_count)),
            failures: Arc::default(),
            shutdown_token: ShutdownToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    pub fn events(&self) -> Arc<InProcEventBus> {
        self.events.clone()
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    pub fn admission(&self) -> Arc<AdmissionController> {
        self.admission.clone()
    }

    pub fn lifecycle(&self) -> Arc<LifecycleManager> {
        self.lifecycle.clone()
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Queue a target for an immediate pass.
    pub fn enqueue(&self, target: ReconcileTarget) {
        self.queue.add(target);
    }

    /// Run one pass for `target` directly, bypassing the queue.
    pub async fn reconcile_once(&self, target: &ReconcileTarget) -> Result<Action> {
        reconcile(&self.admission, &self.lifecycle, target).await
    }

    /// Start the dispatcher, the event observer and the resync loop.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.shutdown_token.is_cancelled() {
            anyhow::bail!("controller runtime already shut down");
        }
        tracing::info!(
            worker_count = self.config.worker_count,
            resync_interval_ms = self.config.resync_interval_ms,
            "Starting controller runtime"
        );

        let observer = self.spawn_event_observer();
        let resync = self.spawn_resync();
        let dispatcher = self.spawn_dispatcher();

        let mut handles = self.worker_handles.lock().await;
        handles.extend([observer, resync, dispatcher]);
        Ok(())
    }

    /// Gracefully shut down background tasks and wait for in-flight passes.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating graceful shutdown of controller runtime");

        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Runtime task failed: {:?}", e),
                Err(_) => tracing::warn!("Runtime task timed out during shutdown"),
            }
        }

        let capacity = self.config.worker_count.max(1) as u32;
        match tokio::time::timeout(SHUTDOWN_GRACE, self.permits.acquire_many(capacity)).await {
            Ok(Ok(permits)) => drop(permits),
            Ok(Err(_)) => {}
            Err(_) => tracing::warn!("In-flight reconcile passes did not finish during shutdown"),
        }

        tracing::info!("Controller runtime shutdown complete");
        Ok(())
    }

    fn spawn_dispatcher(&self) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let permits = self.permits.clone();
        let failures = self.failures.clone();
        let admission = self.admission.clone();
        let lifecycle = self.lifecycle.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                let target = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    target = queue.next() => target,
                };
                let permit = tokio::select! {
                    _ = shutdown.cancelled() => {
                        queue.done(&target);
                        break;
                    }
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let queue = queue.clone();
                let failures = failures.clone();
                let admission = admission.clone();
                let lifecycle = lifecycle.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let next = {
                        let _in_flight = InFlight::new(&queue, &target);
                        let result = reconcile(&admission, &lifecycle, &target).await;
                        next_delay(&target, result, &failures, &config)
                    };
                    if let Some(delay) = next {
                        queue.add_after(target, delay);
                    }
                });
            }
            tracing::info!("Dispatcher shutting down");
        })
    }

    fn spawn_event_observer(&self) -> tokio::task::JoinHandle<()> {
        let mut rx = self.events.subscribe_events();
        let queue = self.queue.clone();
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Event observer shutting down");
                        break;
                    }
                    event = rx.recv() => match event {
                        Ok(event) => {
                            match &event.payload {
                                LifecycleEventPayload::Admitted { .. }
                                | LifecycleEventPayload::Adopted { .. } => {
                                    queue.add(ReconcileTarget::WorkUnit(event.meta.entity.clone()));
                                }
                                _ => {}
                            }
                            if event.payload.frees_capacity() {
                                queue.add(ReconcileTarget::Campaign(event.meta.campaign.clone()));
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            // The next resync covers whatever was dropped.
                            tracing::warn!("event observer lagged, skipped {skipped} events");
                        }
                    }
                }
            }
        })
    }

    fn spawn_resync(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let queue = self.queue.clone();
        let interval = Duration::from_millis(self.config.resync_interval_ms.max(1));
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                if let Err(err) = resync(store.as_ref(), &queue).await {
                    tracing::warn!("resync listing failed: {err}");
                }
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Resync loop shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }
}

async fn reconcile(
    admission: &AdmissionController,
    lifecycle: &LifecycleManager,
    target: &ReconcileTarget,
) -> Result<Action> {
    match target {
        ReconcileTarget::Campaign(key) => admission.reconcile(key).await,
        ReconcileTarget::WorkUnit(key) => lifecycle.reconcile(key).await,
    }
}

/// Turns a pass result into the delay before the target's next pass.
fn next_delay(
    target: &ReconcileTarget,
    result: Result<Action>,
    failures: &FailureCounts,
    config: &ControllerConfig,
) -> Option<Duration> {
    match result {
        Ok(action) => {
            failures.lock().remove(target);
            action.delay()
        }
        Err(err) if err.is_fatal() => {
            failures.lock().remove(target);
            tracing::warn!(%target, error = %err, "fatal reconcile error, waiting for a change");
            None
        }
        Err(err) => {
            let attempts = {
                let mut failures = failures.lock();
                let attempts = failures.entry(target.clone()).or_insert(0);
                *attempts = attempts.saturating_add(1);
                *attempts
            };
            let delay = compute_retry_delay(attempts, &config.retry);
            tracing::debug!(%target, attempts, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
            Some(delay)
        }
    }
}

/// Marks a target done when dropped, including when its pass panics.
struct InFlight<'a> {
    queue: &'a WorkQueue,
    target: &'a ReconcileTarget,
}

impl<'a> InFlight<'a> {
    fn new(queue: &'a WorkQueue, target: &'a ReconcileTarget) -> Self {
        Self { queue, target }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.queue.done(self.target);
    }
}

async fn resync(store: &dyn ObjectStore, queue: &WorkQueue) -> Result<()> {
    let filter = ListFilter::all();
    let campaigns = store.list::<Campaign>(&filter).await?;
    let units = store.list::<WorkUnit>(&filter).await?;
    tracing::debug!(campaigns = campaigns.len(), work_units = units.len(), "resync");

    for campaign in &campaigns {
        queue.add(ReconcileTarget::Campaign(campaign.key()));
    }
    for unit in &units {
        queue.add(ReconcileTarget::WorkUnit(unit.key()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RetryBackoffConfig;
    use crate::discovery::StaticDiscovery;
    use crate::error::{Error, StoreError};
    use crate::resource::{ObjectKey, Resource};
    use crate::store::InMemoryObjectStore;
    use tokio::time::timeout;

    fn build_runtime() -> ControllerRuntime {
        let config = ControllerConfig::default().with_worker_count(2);
        let events = Arc::new(InProcEventBus::new(config.event_capacity));
        ControllerRuntime::new(
            config,
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(StaticDiscovery::new()),
            events,
        )
    }

    fn unit_target() -> ReconcileTarget {
        ReconcileTarget::WorkUnit(ObjectKey::new("maint", "nightly-0"))
    }

    #[tokio::test]
    async fn panicking_pass_releases_its_target() {
        let queue = Arc::new(WorkQueue::new());
        queue.add(unit_target());
        let target = queue.next().await;
        queue.add(target.clone());
        assert!(queue.is_in_flight(&target));
        assert_eq!(queue.len(), 0);

        let task = {
            let queue = queue.clone();
            let target = target.clone();
            tokio::spawn(async move {
                let _in_flight = InFlight::new(&queue, &target);
                let pass: std::result::Result<(), &str> = Err("store client bug");
                pass.expect("reconcile pass failed");
            })
        };
        assert!(task.await.unwrap_err().is_panic());

        assert!(!queue.is_in_flight(&target));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_token_shared_state() {
        let token = ShutdownToken::new();
        let clone1 = token.clone();
        let clone2 = token.clone();

        token.cancel();

        assert!(clone1.is_cancelled());
        assert!(clone2.is_cancelled());

        timeout(Duration::from_secs(1), clone1.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_cancelled_wakes_clones() {
        let token = ShutdownToken::new();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let clone = token.clone();
                tokio::spawn(async move { clone.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let results = timeout(Duration::from_secs(5), futures::future::join_all(handles))
            .await
            .expect("tasks did not observe cancellation within 5 seconds");
        for r in results {
            r.expect("task panicked");
        }
    }

    #[tokio::test]
    async fn test_shutdown_token_default_not_cancelled() {
        let token = ShutdownToken::default();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_runtime_start_and_shutdown() {
        let runtime = build_runtime();
        runtime.start().await.unwrap();

        let result = timeout(Duration::from_secs(5), runtime.shutdown()).await;
        assert!(result.is_ok(), "shutdown did not complete within 5 seconds");
        result.unwrap().expect("shutdown returned error");

        assert!(runtime.start().await.is_err());
    }

    #[test]
    fn success_clears_failures_and_uses_hint() {
        let failures = FailureCounts::default();
        let config = ControllerConfig::default();
        failures.lock().insert(unit_target(), 3);

        let delay = next_delay(
            &unit_target(),
            Ok(Action::requeue(Duration::from_secs(15))),
            &failures,
            &config,
        );
        assert_eq!(delay, Some(Duration::from_secs(15)));
        assert!(failures.lock().is_empty());

        let delay = next_delay(&unit_target(), Ok(Action::await_change()), &failures, &config);
        assert_eq!(delay, None);
    }

    #[test]
    fn retryable_errors_back_off() {
        let failures = FailureCounts::default();
        let config = ControllerConfig::default().with_retry(RetryBackoffConfig {
            base_delay_ms: 100,
            max_backoff_ms: 250,
        });
        let err = || Err(Error::Store(StoreError::unavailable("connection reset")));

        let delays: Vec<_> = (0..3)
            .map(|_| next_delay(&unit_target(), err(), &failures, &config))
            .collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_millis(100)),
                Some(Duration::from_millis(200)),
                Some(Duration::from_millis(250)),
            ]
        );
    }

    #[test]
    fn fatal_errors_are_not_requeued() {
        let failures = FailureCounts::default();
        let config = ControllerConfig::default();
        let delay = next_delay(
            &unit_target(),
            Err(Error::invalid_document("batch 0 must be a JSON object")),
            &failures,
            &config,
        );
        assert_eq!(delay, None);
    }

    #[tokio::test]
    async fn resync_enqueues_every_object() {
        let store = InMemoryObjectStore::new();
        let campaign = store
            .create(&Campaign::new("maint", "nightly", Default::default()))
            .await
            .unwrap();
        let queue = WorkQueue::new();

        resync(&store, &queue).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await, ReconcileTarget::Campaign(campaign.key()));
        assert_eq!(Campaign::KIND, "Campaign");
    }
}

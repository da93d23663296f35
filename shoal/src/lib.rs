//! Shoal - batch partitioning, bounded admission and work-unit lifecycle for
//! repository maintenance campaigns.
//!
//! A campaign discovers a set of repositories, splits them into ordered
//! batches and runs a bounded number of batches at a time as isolated work
//! units. Each work unit is tracked until its execution succeeds or fails,
//! kept for a retention window, and then cleaned up. Workers pick their slice
//! of the configuration by index when they start.
//!
//! # Core Concepts
//!
//! - **Partitioner**: [`partition`] turns a repository list and a
//!   [`SchedulingPolicy`] into ordered [`Batch`]es.
//!
//! - **Admission**: [`AdmissionController`] compares the batches against the
//!   campaign's existing [`WorkUnit`]s and admits new ones in index order,
//!   never exceeding the campaign's parallelism ceiling.
//!
//! - **Lifecycle**: [`LifecycleManager`] creates each work unit's
//!   [`Execution`], observes it through the [`ExecutionProbe`] capability and
//!   moves the unit through `Pending → Running → Succeeded | Failed`.
//!
//! - **Dispatch**: [`dispatch::merge`] overlays one batch document onto the
//!   base configuration. The `shoal-dispatch` binary runs it inside workers.
//!
//! - **Store**: the [`ObjectStore`] trait is the versioned, optimistic
//!   concurrency seam. [`InMemoryObjectStore`] implements it with finalizers
//!   and owner-cascade deletion.
//!
//! - **Runtime**: [`ControllerRuntime`] drives both controllers from a
//!   de-duplicating delay queue fed by requeue hints, lifecycle events and a
//!   periodic resync.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use shoal::*;
//!
//! let store = Arc::new(InMemoryObjectStore::new());
//! let discovery = Arc::new(StaticDiscovery::new());
//! let runtime = ControllerRuntimeBuilder::new(ControllerConfig::default())
//!     .with_store(store.clone())
//!     .with_discovery(discovery)
//!     .build()?;
//! runtime.start().await?;
//! ```

/// Requeue hints and retry backoff.
pub mod backoff;

/// Controller configuration and per-campaign scheduling policy.
pub mod config;

/// Repository discovery seam.
pub mod discovery;

/// Worker-side configuration merge and the worker environment contract.
pub mod dispatch;

/// Error taxonomy with fatal and retryable classification.
pub mod error;

/// Lifecycle events and the in-process event bus.
///
/// - [`LifecycleEvent`] and [`LifecycleEventPayload`] for event data
/// - [`EventPublisher`] and [`EventSubscriber`] for pub/sub patterns
/// - [`InProcEventBus`] for in-process broadcasting
pub mod events;

/// Work-unit lifecycle: execution creation, observation, retention and
/// finalization.
pub mod lifecycle;

#[cfg(feature = "metrics")]
/// Prometheus metrics for admission and lifecycle.
pub mod metrics;

/// Deterministic, length-bounded object names.
pub mod naming;

/// Repository batch partitioning.
pub mod partition;

/// Data model: object metadata, campaigns, work units, executions and
/// configuration documents.
pub mod resource;

/// Controller runtime: work queue, supervisor, shutdown and builder.
///
/// - [`ControllerRuntime`] - main runtime type
/// - [`ControllerRuntimeBuilder`] - dependency injection
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - [`WorkQueue`] and [`ReconcileTarget`] - the de-duplicating delay queue
pub mod runtime;

/// Admission planning and the campaign controller.
pub mod scheduler;

/// Versioned object store seam and the in-memory implementation.
pub mod store;

/// Tracing spans and recorders.
pub mod telemetry;

pub use backoff::*;
pub use config::*;
pub use discovery::*;
pub use error::{Error, Result, StoreError};
pub use events::*;
pub use lifecycle::*;
pub use partition::*;
pub use resource::*;
pub use runtime::*;
pub use scheduler::*;
pub use store::*;

/// Runtime builder for constructing controller runtimes.
pub mod builder;
/// De-duplicating delay queue of reconcile targets.
pub mod queue;
/// Runtime supervisor running reconcile passes, the event observer and resync.
pub mod supervisor;

pub use builder::ControllerRuntimeBuilder;
pub use queue::{ReconcileTarget, WorkQueue};
pub use supervisor::{ControllerRuntime, ShutdownToken};

use std::sync::Arc;

use chrono::{DateTime, Utc};

use shoal::{
    Condition, ConditionStatus, DeletePropagation, EXECUTION_COMPLETE, EXECUTION_FAILED, Execution,
    ObjectKey, ObjectStore, ObjectStoreExt, Workload, set_condition, update_with_retry,
};

const ATTEMPTS: u32 = 5;

/// Plays the execution substrate: moves executions through their states by
/// writing their status, the way a real job controller would.
#[derive(Clone)]
pub struct SubstrateSimulator {
    store: Arc<dyn ObjectStore>,
}

impl SubstrateSimulator {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// One worker running.
    pub async fn mark_active(&self, key: &ObjectKey, at: DateTime<Utc>) -> Execution {
        self.write(key, |status| {
            status.active = 1;
            status.start_time.get_or_insert(at);
        })
        .await
    }

    /// Finished successfully with a completion time and `Complete=True`.
    pub async fn mark_succeeded(&self, key: &ObjectKey, at: DateTime<Utc>) -> Execution {
        self.write(key, |status| {
            status.active = 0;
            status.succeeded = 1;
            status.start_time.get_or_insert(at);
            status.completion_time = Some(at);
            set_condition(
                &mut status.conditions,
                Condition::new(EXECUTION_COMPLETE, ConditionStatus::True, "Completed", "", at),
            );
        })
        .await
    }

    /// Gave up with `Failed=True` carrying `message`.
    pub async fn mark_failed(&self, key: &ObjectKey, message: &str, at: DateTime<Utc>) -> Execution {
        self.write(key, |status| {
            status.active = 0;
            status.failed = 1;
            status.start_time.get_or_insert(at);
            set_condition(
                &mut status.conditions,
                Condition::new(EXECUTION_FAILED, ConditionStatus::True, "BackoffLimitExceeded", message, at),
            );
        })
        .await
    }

    /// Deletes the execution out from under its work unit.
    pub async fn remove(&self, key: &ObjectKey) {
        self.store
            .delete::<Execution>(key, DeletePropagation::Background)
            .await
            .expect("execution delete failed");
    }

    pub async fn get(&self, key: &ObjectKey) -> Option<Execution> {
        self.store
            .get_opt::<Execution>(key)
            .await
            .expect("execution read failed")
    }

    async fn write<F>(&self, key: &ObjectKey, mut apply: F) -> Execution
    where
        F: FnMut(&mut shoal::IndexedJobStatus) + Send,
    {
        update_with_retry::<Execution, _, _>(self.store.as_ref(), key, ATTEMPTS, |execution| {
            let Workload::IndexedJob(job) = &mut execution.workload;
            apply(&mut job.status);
            true
        })
        .await
        .expect("execution status write failed")
        .unwrap_or_else(|| panic!("execution {key} not found"))
    }
}

impl std::fmt::Debug for SubstrateSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubstrateSimulator").finish_non_exhaustive()
    }
}

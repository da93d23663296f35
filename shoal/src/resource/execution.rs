use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{find_condition, Condition, ExecutionTemplate, ObjectMeta, Resource};

/// Condition type an execution reports once it finished successfully.
pub const EXECUTION_COMPLETE: &str = "Complete";

/// Condition type an execution reports once it gave up.
pub const EXECUTION_FAILED: &str = "Failed";

/// Read-only view of an execution's progress.
///
/// Lifecycle evaluation only goes through this trait, so adding a workload
/// kind means implementing it for the new variant.
pub trait ExecutionProbe {
    fn conditions(&self) -> &[Condition];

    /// At least one worker is currently running.
    fn is_active(&self) -> bool;

    fn start_time(&self) -> Option<DateTime<Utc>>;

    fn completion_time(&self) -> Option<DateTime<Utc>>;

    fn has_failed(&self) -> bool {
        find_condition(self.conditions(), EXECUTION_FAILED).is_some_and(Condition::is_true)
    }

    fn has_completed(&self) -> bool {
        find_condition(self.conditions(), EXECUTION_COMPLETE).is_some_and(Condition::is_true)
            || self.completion_time().is_some()
    }

    /// Message of the failure condition, if any.
    fn failure_message(&self) -> Option<String> {
        find_condition(self.conditions(), EXECUTION_FAILED)
            .filter(|c| c.is_true())
            .map(|c| {
                if c.message.is_empty() {
                    c.reason.clone()
                } else {
                    c.message.clone()
                }
            })
    }

    /// When the execution reached its terminal state.
    fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.completion_time().or_else(|| {
            [EXECUTION_FAILED, EXECUTION_COMPLETE]
                .into_iter()
                .filter_map(|t| find_condition(self.conditions(), t))
                .find(|c| c.is_true())
                .map(|c| c.last_transition_time)
        })
    }
}

/// The substrate-facing object that runs a work unit's batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub metadata: ObjectMeta,
    pub workload: Workload,
}

/// Closed set of workload kinds the substrate understands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Workload {
    IndexedJob(IndexedJob),
}

/// A job whose worker reads its slice of the batch list by index.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexedJob {
    pub spec: IndexedJobSpec,
    #[serde(default)]
    pub status: IndexedJobStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedJobSpec {
    #[serde(default)]
    pub template: ExecutionTemplate,
    /// Index of this worker's batch in the configuration document.
    pub worker_index: usize,
    /// Configuration document mounted into the worker.
    pub config_document: String,
    #[serde(default)]
    pub repositories: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ttl_seconds_after_finished: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedJobStatus {
    #[serde(default)]
    pub active: u32,
    #[serde(default)]
    pub succeeded: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Execution {
    pub fn indexed_job(metadata: ObjectMeta, spec: IndexedJobSpec) -> Self {
        Self {
            metadata,
            workload: Workload::IndexedJob(IndexedJob {
                spec,
                status: IndexedJobStatus::default(),
            }),
        }
    }

    fn probe(&self) -> &dyn ExecutionProbe {
        match &self.workload {
            Workload::IndexedJob(job) => job,
        }
    }
}

impl ExecutionProbe for IndexedJob {
    fn conditions(&self) -> &[Condition] {
        &self.status.conditions
    }

    fn is_active(&self) -> bool {
        self.status.active > 0
    }

    fn start_time(&self) -> Option<DateTime<Utc>> {
        self.status.start_time
    }

    fn completion_time(&self) -> Option<DateTime<Utc>> {
        self.status.completion_time
    }
}

impl ExecutionProbe for Execution {
    fn conditions(&self) -> &[Condition] {
        self.probe().conditions()
    }

    fn is_active(&self) -> bool {
        self.probe().is_active()
    }

    fn start_time(&self) -> Option<DateTime<Utc>> {
        self.probe().start_time()
    }

    fn completion_time(&self) -> Option<DateTime<Utc>> {
        self.probe().completion_time()
    }
}

impl Resource for Execution {
    const KIND: &'static str = "Execution";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ConditionStatus;
    use chrono::TimeZone;

    fn job() -> IndexedJob {
        IndexedJob::default()
    }

    #[test]
    fn failure_condition_wins_message() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut job = job();
        job.status.conditions.push(Condition::new(
            EXECUTION_FAILED,
            ConditionStatus::True,
            "BackoffLimitExceeded",
            "",
            at,
        ));
        assert!(job.has_failed());
        assert!(!job.has_completed());
        assert_eq!(job.failure_message().as_deref(), Some("BackoffLimitExceeded"));
        assert_eq!(job.finished_at(), Some(at));
    }

    #[test]
    fn completion_time_marks_complete() {
        let at = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        let mut job = job();
        job.status.completion_time = Some(at);
        assert!(job.has_completed());
        assert_eq!(job.finished_at(), Some(at));
    }

    #[test]
    fn workload_is_tagged_by_kind() {
        let execution = Execution::indexed_job(
            ObjectMeta::new("maint", "nightly-batch-0"),
            IndexedJobSpec {
                worker_index: 0,
                config_document: "nightly-batches".into(),
                ..IndexedJobSpec::default()
            },
        );
        let value = serde_json::to_value(&execution).unwrap();
        assert_eq!(value["workload"]["kind"], "indexedJob");
        assert_eq!(value["workload"]["spec"]["configDocument"], "nightly-batches");
        assert!(!execution.is_active());
    }
}

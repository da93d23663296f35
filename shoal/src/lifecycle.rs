//! Work-unit lifecycle.
//!
//! Each pass reads the work unit and its execution fresh and moves the record
//! forward by at most one observation:
//!
//! ```text
//!   deleting ──────────────► finalize (delete execution, drop finalizer)
//!   terminal ──────────────► retention check, cleanup once expired
//!   no execution ref ──────► create or adopt the execution
//!   execution missing ─────► orphan: delete the record
//!   otherwise ─────────────► observe and transition
//! ```
//!
//! Observation checks the failure condition first, then completion, then the
//! active count, so the outcome does not depend on condition ordering.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::Instrument;
use uuid::Uuid;

use crate::backoff::Action;
use crate::config::{ControllerConfig, RetentionPolicy};
use crate::dispatch::{ENV_CONFIG_DOCUMENT, ENV_WORKER_INDEX};
use crate::error::{Error, Result};
use crate::events::{EventPublisher, LifecycleEvent, LifecycleEventPayload};
use crate::resource::{
    Condition, ConditionStatus, Execution, ExecutionProbe, IndexedJobSpec, ObjectKey, ObjectMeta,
    Resource, WorkUnit, WorkUnitPhase, set_condition,
};
use crate::store::{DeletePropagation, ObjectStore, ObjectStoreExt, update_with_retry};
use crate::telemetry;

/// Finalizer guarding execution cleanup.
pub const EXECUTION_FINALIZER: &str = "shoal.dev/execution-cleanup";

pub const CONDITION_RUNNING: &str = "Running";
pub const CONDITION_COMPLETE: &str = "Complete";
pub const CONDITION_FAILED: &str = "Failed";

/// What an execution currently reports.
#[derive(Clone, Debug, PartialEq)]
pub enum Observation {
    Failed {
        message: Option<String>,
        at: Option<DateTime<Utc>>,
    },
    Completed {
        at: Option<DateTime<Utc>>,
    },
    Active,
    Pending,
}

impl Observation {
    pub fn phase(&self) -> WorkUnitPhase {
        match self {
            Self::Failed { .. } => WorkUnitPhase::Failed,
            Self::Completed { .. } => WorkUnitPhase::Succeeded,
            Self::Active => WorkUnitPhase::Running,
            Self::Pending => WorkUnitPhase::Pending,
        }
    }
}

/// Evaluates an execution in priority order: failure, completion, activity.
pub fn observe(probe: &dyn ExecutionProbe) -> Observation {
    if probe.has_failed() {
        Observation::Failed {
            message: probe.failure_message(),
            at: probe.finished_at(),
        }
    } else if probe.has_completed() {
        Observation::Completed {
            at: probe.finished_at(),
        }
    } else if probe.is_active() {
        Observation::Active
    } else {
        Observation::Pending
    }
}

/// Time left before a terminal record may be cleaned up.
///
/// `None` for records that are not terminal or lack a completion time.
pub fn retention_remaining(
    unit: &WorkUnit,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Option<Duration> {
    if !unit.status.phase.is_terminal() {
        return None;
    }
    let completed = unit.status.completion_time?;
    let window = policy.window(unit.spec.retention_seconds);
    Some(match completed.checked_add_signed(window) {
        Some(deadline) => deadline - now,
        None => Duration::MAX,
    })
}

/// A terminal record is eligible once `now - completion_time >= window`.
pub fn is_retention_expired(unit: &WorkUnit, policy: &RetentionPolicy, now: DateTime<Utc>) -> bool {
    retention_remaining(unit, policy, now).is_some_and(|left| left <= Duration::zero())
}

/// Applies an observation to a work unit's status.
///
/// Returns the previous phase when the phase changed. Backward or sideways
/// moves are ignored.
pub fn apply_observation(
    unit: &mut WorkUnit,
    observation: &Observation,
    started: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<WorkUnitPhase> {
    let from = unit.status.phase;
    let to = observation.phase();
    if from == to || !from.can_transition_to(to) {
        return None;
    }

    let status = &mut unit.status;
    status.phase = to;
    if to != WorkUnitPhase::Pending && status.start_time.is_none() {
        status.start_time = Some(started.unwrap_or(now));
    }

    match observation {
        Observation::Active => {
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_RUNNING, ConditionStatus::True, "ExecutionActive", "", now),
            );
        }
        Observation::Completed { at } => {
            status.completion_time = Some(at.unwrap_or(now));
            status.processed_repositories = unit.spec.repositories.clone();
            status.message = None;
            finish_conditions(&mut status.conditions, CONDITION_COMPLETE, "ExecutionComplete", "", now);
        }
        Observation::Failed { message, at } => {
            status.completion_time = Some(at.unwrap_or(now));
            status.message = message.clone();
            finish_conditions(
                &mut status.conditions,
                CONDITION_FAILED,
                "ExecutionFailed",
                message.as_deref().unwrap_or_default(),
                now,
            );
        }
        Observation::Pending => {}
    }

    Some(from)
}

fn finish_conditions(
    conditions: &mut Vec<Condition>,
    terminal: &str,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    set_condition(
        conditions,
        Condition::new(CONDITION_RUNNING, ConditionStatus::False, reason, "", now),
    );
    set_condition(
        conditions,
        Condition::new(terminal, ConditionStatus::True, reason, message, now),
    );
}

/// The execution object for a work unit.
pub fn build_execution(unit: &WorkUnit) -> Execution {
    let mut metadata = ObjectMeta::new(&unit.metadata.namespace, &unit.metadata.name);
    metadata.labels = unit.metadata.labels.clone();
    metadata.owner = unit.metadata.owner_reference(WorkUnit::KIND);

    let env = BTreeMap::from([
        (ENV_WORKER_INDEX.to_string(), unit.spec.batch_index.to_string()),
        (ENV_CONFIG_DOCUMENT.to_string(), unit.spec.config_document.clone()),
    ]);

    Execution::indexed_job(
        metadata,
        IndexedJobSpec {
            template: unit.spec.execution.clone(),
            worker_index: unit.spec.batch_index,
            config_document: unit.spec.config_document.clone(),
            repositories: unit.spec.repositories.clone(),
            env,
            ttl_seconds_after_finished: unit.spec.retention_seconds,
        },
    )
}

/// Drives work units through their lifecycle.
pub struct LifecycleManager {
    store: Arc<dyn ObjectStore>,
    events: Arc<dyn EventPublisher<LifecycleEvent>>,
    config: ControllerConfig,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        events: Arc<dyn EventPublisher<LifecycleEvent>>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        self.reconcile_at(key, Utc::now()).await
    }

    /// One lifecycle pass for the work unit at `key` with an explicit clock.
    pub async fn reconcile_at(&self, key: &ObjectKey, now: DateTime<Utc>) -> Result<Action> {
        let span = telemetry::reconcile_span(key.to_string());
        async {
            let result = self.pass(key, now).await;
            if let Err(err) = &result {
                telemetry::record_reconcile_error(WorkUnit::KIND, err);
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn pass(&self, key: &ObjectKey, now: DateTime<Utc>) -> Result<Action> {
        let Some(mut unit) = self.store.get_opt::<WorkUnit>(key).await? else {
            return Ok(Action::await_change());
        };
        let correlation_id = Uuid::now_v7();

        if unit.metadata.is_deleting() {
            self.finalize(&unit, correlation_id).await?;
            return Ok(Action::await_change());
        }

        if !unit.metadata.has_finalizer(EXECUTION_FINALIZER) {
            let updated = update_with_retry::<WorkUnit, _, _>(
                self.store.as_ref(),
                key,
                self.config.max_conflict_retries,
                |u| u.metadata.add_finalizer(EXECUTION_FINALIZER),
            )
            .await?;
            let Some(updated) = updated else {
                return Ok(Action::await_change());
            };
            unit = updated;
        }

        if unit.status.phase.is_terminal() {
            return self.retain_or_clean(&unit, correlation_id, now).await;
        }

        let execution = match &unit.status.execution_ref {
            None => match self.start_execution(&unit, correlation_id, now).await? {
                Some((updated, execution)) => {
                    unit = updated;
                    Some(execution)
                }
                None => return Ok(Action::await_change()),
            },
            Some(execution_ref) => self.store.get_opt::<Execution>(execution_ref).await?,
        };

        let Some(execution) = execution else {
            tracing::warn!(phase = %unit.status.phase, "execution missing, removing orphaned work unit");
            self.delete_record(&unit, correlation_id, LifecycleEventPayload::OrphanRemoved)
                .await?;
            return Ok(Action::await_change());
        };

        let observation = observe(&execution);
        let started = execution.start_time();
        let mut transition = None;
        let updated = update_with_retry::<WorkUnit, _, _>(
            self.store.as_ref(),
            key,
            self.config.max_conflict_retries,
            |u| {
                transition = apply_observation(u, &observation, started, now);
                transition.is_some()
            },
        )
        .await?;
        let Some(unit) = updated else {
            return Ok(Action::await_change());
        };

        if let Some(from) = transition {
            let to = unit.status.phase;
            tracing::info!(from = %from, to = %to, "work unit phase changed");
            if to.is_terminal() {
                let duration = unit
                    .status
                    .start_time
                    .zip(unit.status.completion_time)
                    .map(|(s, c)| (c - s).num_milliseconds() as f64 / 1000.0);
                telemetry::record_work_unit_completed(campaign_key(&unit).to_string(), to, duration);
            }
            self.emit(&unit, correlation_id, LifecycleEventPayload::PhaseChanged { from, to })
                .await;
        }

        if unit.status.phase.is_terminal() {
            return self.retain_or_clean(&unit, correlation_id, now).await;
        }
        Ok(self.config.requeue.while_active())
    }

    /// Creates the execution (or adopts an existing one) and records the
    /// reference. `None` when the work unit vanished meanwhile.
    async fn start_execution(
        &self,
        unit: &WorkUnit,
        correlation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<(WorkUnit, Execution)>> {
        let desired = build_execution(unit);
        let execution = match self.store.create(&desired).await {
            Ok(created) => created,
            Err(e) if e.is_already_exists() => {
                tracing::debug!(execution = %desired.key(), "adopting existing execution");
                self.store.get::<Execution>(&desired.key()).await?
            }
            Err(e) => return Err(e.into()),
        };
        let execution_ref = execution.key();

        let worker_index = unit.spec.batch_index;
        let updated = update_with_retry::<WorkUnit, _, _>(
            self.store.as_ref(),
            &unit.key(),
            self.config.max_conflict_retries,
            |u| {
                if u.status.execution_ref.is_some() {
                    return false;
                }
                u.status.execution_ref = Some(execution_ref.clone());
                set_condition(
                    &mut u.status.conditions,
                    Condition::new(
                        crate::scheduler::CONDITION_ADMITTED,
                        ConditionStatus::True,
                        "ExecutionCreated",
                        format!("execution {execution_ref} created"),
                        now,
                    ),
                );
                true
            },
        )
        .await?;

        let Some(updated) = updated else {
            return Ok(None);
        };
        self.emit(
            &updated,
            correlation_id,
            LifecycleEventPayload::ExecutionCreated {
                execution: execution.key(),
                worker_index,
            },
        )
        .await;
        Ok(Some((updated, execution)))
    }

    async fn retain_or_clean(
        &self,
        unit: &WorkUnit,
        correlation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Action> {
        match retention_remaining(unit, &self.config.retention, now) {
            Some(left) if left <= Duration::zero() => {
                tracing::info!("retention expired, cleaning up");
                self.delete_record(unit, correlation_id, LifecycleEventPayload::RetentionExpired)
                    .await?;
                Ok(Action::await_change())
            }
            Some(left) => Ok(self.config.requeue.until_retention_expires(left)),
            // Terminal without a completion time; check back later.
            None => Ok(self.config.requeue.idle()),
        }
    }

    /// Requests deletion of the record and finalizes it right away.
    async fn delete_record(
        &self,
        unit: &WorkUnit,
        correlation_id: Uuid,
        reason: LifecycleEventPayload,
    ) -> Result<()> {
        match self
            .store
            .delete::<WorkUnit>(&unit.key(), DeletePropagation::Background)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        self.emit(unit, correlation_id, reason).await;

        if let Some(current) = self.store.get_opt::<WorkUnit>(&unit.key()).await?
            && current.metadata.is_deleting()
        {
            self.finalize(&current, correlation_id).await?;
        }
        Ok(())
    }

    /// Deletes the execution and releases the finalizer.
    async fn finalize(&self, unit: &WorkUnit, correlation_id: Uuid) -> Result<()> {
        if !unit.metadata.has_finalizer(EXECUTION_FINALIZER) {
            return Ok(());
        }

        let span = telemetry::finalize_span(unit.key().to_string());
        async {
            // The execution shares the record's name even before the
            // reference is recorded.
            let execution = unit.status.execution_ref.clone().unwrap_or_else(|| unit.key());
            match self
                .store
                .delete::<Execution>(&execution, DeletePropagation::Background)
                .await
            {
                Ok(()) => tracing::debug!(execution = %execution, "execution deleted"),
                Err(e) if e.is_not_found() => {
                    tracing::debug!(execution = %execution, "execution already gone");
                }
                Err(e) => return Err(e.into()),
            }

            update_with_retry::<WorkUnit, _, _>(
                self.store.as_ref(),
                &unit.key(),
                self.config.max_conflict_retries,
                |u| u.metadata.remove_finalizer(EXECUTION_FINALIZER),
            )
            .await?;

            tracing::info!("work unit finalized");
            self.emit(unit, correlation_id, LifecycleEventPayload::Finalized)
                .await;
            Ok::<(), Error>(())
        }
        .instrument(span)
        .await
    }

    async fn emit(&self, unit: &WorkUnit, correlation_id: Uuid, payload: LifecycleEventPayload) {
        let event = LifecycleEvent::new(unit.key(), campaign_key(unit), correlation_id, payload);
        if let Err(e) = self.events.publish(event).await {
            tracing::warn!(error = %e, "failed to publish lifecycle event");
        }
    }
}

/// Key of the campaign that owns `unit`.
pub fn campaign_key(unit: &WorkUnit) -> ObjectKey {
    ObjectKey::new(&unit.metadata.namespace, &unit.spec.campaign)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{EXECUTION_COMPLETE, EXECUTION_FAILED, IndexedJob, WorkUnitSpec};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn unit() -> WorkUnit {
        WorkUnit {
            metadata: ObjectMeta::new("maint", "nightly-batch-0"),
            spec: WorkUnitSpec {
                campaign: "nightly".into(),
                repositories: vec!["a".into(), "b".into()],
                batch_index: 0,
                config_document: "nightly-batches".into(),
                ..WorkUnitSpec::default()
            },
            status: Default::default(),
        }
    }

    fn job_with(conditions: &[(&str, ConditionStatus)], active: u32) -> IndexedJob {
        let mut job = IndexedJob::default();
        job.status.active = active;
        for (t, s) in conditions {
            job.status
                .conditions
                .push(Condition::new(*t, *s, "Reason", "boom", at(50)));
        }
        job
    }

    #[test]
    fn failure_is_checked_before_completion() {
        let job = job_with(
            &[
                (EXECUTION_COMPLETE, ConditionStatus::True),
                (EXECUTION_FAILED, ConditionStatus::True),
            ],
            1,
        );
        assert!(matches!(observe(&job), Observation::Failed { .. }));

        let reversed = job_with(
            &[
                (EXECUTION_FAILED, ConditionStatus::True),
                (EXECUTION_COMPLETE, ConditionStatus::True),
            ],
            1,
        );
        assert_eq!(observe(&job), observe(&reversed));
    }

    #[test]
    fn completion_before_activity() {
        let job = job_with(&[(EXECUTION_COMPLETE, ConditionStatus::True)], 1);
        assert!(matches!(observe(&job), Observation::Completed { .. }));
        assert_eq!(observe(&job_with(&[], 2)), Observation::Active);
        assert_eq!(observe(&job_with(&[], 0)), Observation::Pending);
        let false_failure = job_with(&[(EXECUTION_FAILED, ConditionStatus::False)], 0);
        assert_eq!(observe(&false_failure), Observation::Pending);
    }

    #[test]
    fn success_marks_all_repositories_processed() {
        let mut u = unit();
        let from = apply_observation(&mut u, &Observation::Completed { at: Some(at(30)) }, None, at(40));
        assert_eq!(from, Some(WorkUnitPhase::Pending));
        assert_eq!(u.status.phase, WorkUnitPhase::Succeeded);
        assert_eq!(u.status.completion_time, Some(at(30)));
        assert_eq!(u.status.processed_repositories, u.spec.repositories);
        assert_eq!(u.status.start_time, Some(at(40)));
    }

    #[test]
    fn failure_records_message() {
        let mut u = unit();
        u.status.phase = WorkUnitPhase::Running;
        let obs = Observation::Failed {
            message: Some("BackoffLimitExceeded".into()),
            at: None,
        };
        apply_observation(&mut u, &obs, Some(at(1)), at(60));
        assert_eq!(u.status.phase, WorkUnitPhase::Failed);
        assert_eq!(u.status.message.as_deref(), Some("BackoffLimitExceeded"));
        assert_eq!(u.status.completion_time, Some(at(60)));
        assert!(u.status.processed_repositories.is_empty());
    }

    #[test]
    fn phases_never_move_backwards() {
        let mut u = unit();
        u.status.phase = WorkUnitPhase::Running;
        assert_eq!(apply_observation(&mut u, &Observation::Pending, None, at(0)), None);
        assert_eq!(u.status.phase, WorkUnitPhase::Running);

        u.status.phase = WorkUnitPhase::Succeeded;
        let obs = Observation::Failed { message: None, at: None };
        assert_eq!(apply_observation(&mut u, &obs, None, at(0)), None);
        assert_eq!(u.status.phase, WorkUnitPhase::Succeeded);
    }

    #[test]
    fn completion_time_set_only_when_terminal() {
        let mut u = unit();
        apply_observation(&mut u, &Observation::Active, Some(at(5)), at(10));
        assert_eq!(u.status.phase, WorkUnitPhase::Running);
        assert_eq!(u.status.start_time, Some(at(5)));
        assert!(u.status.completion_time.is_none());
    }

    #[test]
    fn retention_boundary() {
        let policy = RetentionPolicy::default();
        let window = policy.window(None);
        let now = at(100_000);

        let mut u = unit();
        u.status.phase = WorkUnitPhase::Succeeded;

        u.status.completion_time = Some(now - (window + Duration::seconds(1)));
        assert!(is_retention_expired(&u, &policy, now));

        u.status.completion_time = Some(now - (window - Duration::seconds(1)));
        assert!(!is_retention_expired(&u, &policy, now));

        u.status.phase = WorkUnitPhase::Running;
        assert!(!is_retention_expired(&u, &policy, now));
    }

    #[test]
    fn retention_override_includes_buffer() {
        let policy = RetentionPolicy::default();
        let now = at(100_000);
        let mut u = unit();
        u.spec.retention_seconds = Some(600);
        u.status.phase = WorkUnitPhase::Failed;
        u.status.completion_time = Some(now - Duration::seconds(601));
        // 600s plus the 30 minute buffer has not elapsed.
        assert!(!is_retention_expired(&u, &policy, now));
        u.status.completion_time = Some(now - Duration::seconds(600 + 1800));
        assert!(is_retention_expired(&u, &policy, now));
    }

    #[test]
    fn huge_retention_override_never_expires() {
        let policy = RetentionPolicy::default();
        let now = at(100_000);
        let mut u = unit();
        u.spec.retention_seconds = Some(i64::MAX);
        u.status.phase = WorkUnitPhase::Succeeded;
        u.status.completion_time = Some(now - Duration::days(365));

        assert_eq!(retention_remaining(&u, &policy, now), Some(Duration::MAX));
        assert!(!is_retention_expired(&u, &policy, now));
    }

    #[test]
    fn execution_carries_worker_contract() {
        let mut u = unit();
        u.spec.batch_index = 4;
        u.spec.retention_seconds = Some(900);
        let execution = build_execution(&u);
        assert_eq!(execution.metadata.name, "nightly-batch-0");
        let crate::resource::Workload::IndexedJob(job) = &execution.workload;
        assert_eq!(job.spec.worker_index, 4);
        assert_eq!(job.spec.config_document, "nightly-batches");
        assert_eq!(job.spec.ttl_seconds_after_finished, Some(900));
        assert_eq!(job.spec.env.get(ENV_WORKER_INDEX).map(String::as_str), Some("4"));
    }
}

//! Admission of batches as work units.
//!
//! Planning is pure: given a campaign, the work units it already owns and the
//! current partition, [`plan_admission`] decides which work units to create
//! and which to drain. [`AdmissionController`] runs one pass of that plan
//! against the object store.
//!
//! # Admission rules
//!
//! - Live (pending or running) work units count against the campaign's
//!   parallelism ceiling; the quota is `max(0, ceiling - live)`.
//! - A batch is covered, and never offered again, when a work unit with the
//!   same batch index exists in any phase, or when a live work unit carries
//!   the identical repository set.
//! - Uncovered batches are offered in ascending index order and stamped with
//!   `priority = batch_index`.
//! - A suspended campaign admits nothing and drains every live work unit.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::Instrument;
use uuid::Uuid;

use crate::backoff::Action;
use crate::config::ControllerConfig;
use crate::discovery::RepositoryDiscovery;
use crate::dispatch::batch_documents;
use crate::error::{Error, Result};
use crate::events::{EventPublisher, LifecycleEvent, LifecycleEventPayload};
use crate::naming::{config_document_name, work_unit_name};
use crate::partition::{Batch, partition};
use crate::resource::{
    BATCH_INDEX_LABEL, CAMPAIGN_LABEL, Campaign, Condition, ConditionStatus, ConfigDocument,
    ObjectKey, ObjectMeta, Resource, WorkUnit, WorkUnitSpec, WorkUnitStatus, set_condition,
};
use crate::store::{DeletePropagation, ListFilter, ObjectStore, ObjectStoreExt, update_with_retry};
use crate::telemetry;

/// Campaign condition reporting whether its configuration can be admitted.
pub const CONFIGURATION_VALID: &str = "ConfigurationValid";

/// Work-unit condition set when the record is created.
pub const CONDITION_ADMITTED: &str = "Admitted";

/// Number of work units that count against the parallelism ceiling.
pub fn running_count(existing: &[WorkUnit]) -> usize {
    existing.iter().filter(|u| u.is_live()).count()
}

/// How many new work units may be created.
pub fn admission_quota(running: usize, ceiling: usize) -> usize {
    ceiling.saturating_sub(running)
}

/// Whether `batch` at `index` already has a work unit.
///
/// A live unit covers the batch when it holds the same repositories in any
/// order.
pub fn is_covered(existing: &[WorkUnit], index: usize, batch: &Batch) -> bool {
    existing.iter().any(|u| {
        u.spec.batch_index == index
            || (u.is_live() && same_repositories(&u.spec.repositories, batch))
    })
}

fn same_repositories(a: &[String], b: &[String]) -> bool {
    a.len() == b.len()
        && a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

/// Indices of the batches to admit this pass, ascending.
///
/// At most `min(quota, pending)` indices are returned.
pub fn select_batches(existing: &[WorkUnit], batches: &[Batch], ceiling: usize) -> Vec<usize> {
    let quota = admission_quota(running_count(existing), ceiling);
    batches
        .iter()
        .enumerate()
        .filter(|(index, batch)| !is_covered(existing, *index, batch))
        .map(|(index, _)| index)
        .take(quota)
        .collect()
}

/// Builds the tracking record for one batch of `campaign`.
pub fn build_work_unit(
    campaign: &Campaign,
    batch_index: usize,
    repositories: &Batch,
    now: DateTime<Utc>,
) -> WorkUnit {
    let mut metadata = ObjectMeta::new(
        &campaign.metadata.namespace,
        work_unit_name(&campaign.metadata.name, batch_index),
    )
    .with_label(CAMPAIGN_LABEL, &campaign.metadata.name)
    .with_label(BATCH_INDEX_LABEL, batch_index.to_string());
    metadata.owner = campaign.metadata.owner_reference(Campaign::KIND);

    let mut status = WorkUnitStatus::default();
    set_condition(
        &mut status.conditions,
        Condition::new(
            CONDITION_ADMITTED,
            ConditionStatus::True,
            "Scheduled",
            format!("batch {batch_index} admitted"),
            now,
        ),
    );

    WorkUnit {
        metadata,
        spec: WorkUnitSpec {
            campaign: campaign.metadata.name.clone(),
            repositories: repositories.clone(),
            batch_index,
            priority: i64::try_from(batch_index).unwrap_or(i64::MAX),
            execution: campaign.spec.execution.clone(),
            retention_seconds: campaign.spec.policy.retention_seconds,
            config_document: config_document_name(&campaign.metadata.name),
        },
        status,
    }
}

/// Outcome of planning one admission pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AdmissionPlan {
    /// Records to create, in ascending batch order.
    pub admit: Vec<WorkUnit>,
    /// Live records to delete because the campaign is suspended.
    pub drain: Vec<ObjectKey>,
    /// Live records before this pass.
    pub running: usize,
    /// Batches without a work unit.
    pub pending: usize,
}

/// Decides what one admission pass should do.
pub fn plan_admission(
    campaign: &Campaign,
    existing: &[WorkUnit],
    batches: &[Batch],
    now: DateTime<Utc>,
) -> AdmissionPlan {
    let running = running_count(existing);

    if campaign.spec.suspended {
        return AdmissionPlan {
            admit: Vec::new(),
            drain: existing
                .iter()
                .filter(|u| u.is_live() && !u.metadata.is_deleting())
                .map(|u| u.key())
                .collect(),
            running,
            pending: 0,
        };
    }

    let pending = batches
        .iter()
        .enumerate()
        .filter(|(index, batch)| !is_covered(existing, *index, batch))
        .count();

    let admit = select_batches(existing, batches, campaign.spec.policy.parallelism)
        .into_iter()
        .map(|index| build_work_unit(campaign, index, &batches[index], now))
        .collect();

    AdmissionPlan {
        admit,
        drain: Vec::new(),
        running,
        pending,
    }
}

/// Runs admission passes for campaigns.
pub struct AdmissionController {
    store: Arc<dyn ObjectStore>,
    discovery: Arc<dyn RepositoryDiscovery>,
    events: Arc<dyn EventPublisher<LifecycleEvent>>,
    config: ControllerConfig,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// What one pass did; drives the campaign status and the requeue hint.
#[derive(Default)]
struct PassOutcome {
    admitted: usize,
    live: usize,
    batch_count: usize,
    message: Option<String>,
}

impl AdmissionController {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        discovery: Arc<dyn RepositoryDiscovery>,
        events: Arc<dyn EventPublisher<LifecycleEvent>>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            discovery,
            events,
            config,
        }
    }

    /// One admission pass for the campaign at `key`.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        self.reconcile_at(key, Utc::now()).await
    }

    /// Like [`reconcile`](Self::reconcile) with an explicit clock.
    pub async fn reconcile_at(&self, key: &ObjectKey, now: DateTime<Utc>) -> Result<Action> {
        let span = telemetry::admission_span(key.to_string());
        async {
            let result = self.pass(key, now).await;
            if let Err(err) = &result {
                telemetry::record_reconcile_error(Campaign::KIND, err);
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn pass(&self, key: &ObjectKey, now: DateTime<Utc>) -> Result<Action> {
        let Some(campaign) = self.store.get_opt::<Campaign>(key).await? else {
            tracing::debug!("campaign gone");
            return Ok(Action::await_change());
        };
        if campaign.metadata.is_deleting() {
            tracing::debug!("campaign deleting, dependents cascade");
            return Ok(Action::await_change());
        }

        let correlation_id = Uuid::now_v7();
        let existing = self.list_work_units(&campaign).await?;

        if campaign.spec.suspended {
            let outcome = self.drain(&campaign, &existing, correlation_id, now).await?;
            self.write_status(&campaign, &outcome, None, now).await?;
            return Ok(self.config.requeue.idle());
        }

        let repositories = self.discovery.discover(&campaign).await?;
        let batches = match partition(&repositories, &campaign.spec.policy) {
            Ok(batches) => batches,
            Err(err) => {
                self.reject(&campaign, &err, correlation_id, now).await;
                return Err(err);
            }
        };

        self.upsert_config_document(&campaign, &batches).await?;

        let plan = plan_admission(&campaign, &existing, &batches, now);
        tracing::info!(
            repositories = repositories.len(),
            batches = batches.len(),
            running = plan.running,
            pending = plan.pending,
            admitting = plan.admit.len(),
            "admission planned"
        );

        let mut outcome = PassOutcome {
            live: plan.running,
            batch_count: batches.len(),
            ..PassOutcome::default()
        };
        let mut failure = None;

        for unit in &plan.admit {
            match self.store.create(unit).await {
                Ok(_) => {
                    outcome.admitted += 1;
                    outcome.live += 1;
                    telemetry::record_work_unit_admitted(key.to_string(), unit.spec.batch_index);
                    self.emit(
                        unit.key(),
                        &campaign,
                        correlation_id,
                        LifecycleEventPayload::Admitted {
                            batch_index: unit.spec.batch_index,
                            repositories: unit.spec.repositories.len(),
                        },
                    )
                    .await;
                }
                Err(e) if e.is_already_exists() => {
                    outcome.live += 1;
                    tracing::debug!(work_unit = %unit.key(), "adopted existing work unit");
                    self.emit(
                        unit.key(),
                        &campaign,
                        correlation_id,
                        LifecycleEventPayload::Adopted {
                            batch_index: unit.spec.batch_index,
                        },
                    )
                    .await;
                }
                Err(e) => {
                    // Later batches stay unscheduled; earlier ones are kept.
                    failure = Some(Error::from(e));
                    break;
                }
            }
        }

        telemetry::set_active_work_units(key.to_string(), outcome.live);
        self.write_status(&campaign, &outcome, Some(now), now).await?;

        if let Some(err) = failure {
            return Err(err);
        }

        let requeue = &self.config.requeue;
        Ok(if outcome.admitted > 0 {
            requeue.after_admission()
        } else if outcome.live > 0 {
            requeue.while_active()
        } else {
            requeue.idle()
        })
    }

    async fn list_work_units(&self, campaign: &Campaign) -> Result<Vec<WorkUnit>> {
        let filter = ListFilter::in_namespace(&campaign.metadata.namespace);
        let filter = match campaign.metadata.uid {
            Some(uid) => filter.owned_by(uid),
            None => filter.with_label(CAMPAIGN_LABEL, &campaign.metadata.name),
        };
        Ok(self.store.list::<WorkUnit>(&filter).await?)
    }

    async fn drain(
        &self,
        campaign: &Campaign,
        existing: &[WorkUnit],
        correlation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PassOutcome> {
        let plan = plan_admission(campaign, existing, &[], now);
        for key in &plan.drain {
            match self
                .store
                .delete::<WorkUnit>(key, DeletePropagation::Background)
                .await
            {
                Ok(()) => {
                    tracing::info!(work_unit = %key, "draining work unit");
                    self.emit(
                        key.clone(),
                        campaign,
                        correlation_id,
                        LifecycleEventPayload::DrainRequested,
                    )
                    .await;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        telemetry::set_active_work_units(campaign.key().to_string(), 0);
        Ok(PassOutcome {
            admitted: 0,
            live: 0,
            batch_count: campaign.status.batch_count,
            message: Some(format!(
                "suspended; drained {} work unit(s)",
                plan.drain.len()
            )),
        })
    }

    async fn upsert_config_document(&self, campaign: &Campaign, batches: &[Batch]) -> Result<()> {
        let key = ObjectKey::new(
            &campaign.metadata.namespace,
            config_document_name(&campaign.metadata.name),
        );
        let base_config = campaign.spec.base_config.clone();
        let documents = batch_documents(batches);

        let mut metadata = ObjectMeta::new(&key.namespace, &key.name)
            .with_label(CAMPAIGN_LABEL, &campaign.metadata.name);
        metadata.owner = campaign.metadata.owner_reference(Campaign::KIND);
        let fresh = ConfigDocument {
            metadata,
            base_config: base_config.clone(),
            batches: documents.clone(),
        };

        match self.store.create(&fresh).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e.into()),
        }

        update_with_retry::<ConfigDocument, _, _>(
            self.store.as_ref(),
            &key,
            self.config.max_conflict_retries,
            |doc| {
                if doc.base_config == base_config && doc.batches == documents {
                    return false;
                }
                doc.base_config = base_config.clone();
                doc.batches = documents.clone();
                true
            },
        )
        .await?;
        Ok(())
    }

    async fn write_status(
        &self,
        campaign: &Campaign,
        outcome: &PassOutcome,
        admitted_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let admitted = outcome.admitted;
        update_with_retry::<Campaign, _, _>(
            self.store.as_ref(),
            &campaign.key(),
            self.config.max_conflict_retries,
            |c| {
                let before = c.status.clone();
                c.status.batch_count = outcome.batch_count;
                c.status.active_work_units = outcome.live;
                c.status.message = outcome.message.clone();
                if admitted > 0 {
                    c.status.last_admission_time = admitted_at;
                }
                set_condition(
                    &mut c.status.conditions,
                    Condition::new(
                        CONFIGURATION_VALID,
                        ConditionStatus::True,
                        "Valid",
                        "",
                        now,
                    ),
                );
                c.status != before
            },
        )
        .await?;
        Ok(())
    }

    /// Surfaces a fatal configuration error on the campaign.
    ///
    /// Failures while reporting are logged; the configuration error is what
    /// the caller returns.
    async fn reject(
        &self,
        campaign: &Campaign,
        err: &Error,
        correlation_id: Uuid,
        now: DateTime<Utc>,
    ) {
        let reason = err.to_string();
        let result = update_with_retry::<Campaign, _, _>(
            self.store.as_ref(),
            &campaign.key(),
            self.config.max_conflict_retries,
            |c| {
                let message_changed = c.status.message.as_deref() != Some(reason.as_str());
                c.status.message = Some(reason.clone());
                set_condition(
                    &mut c.status.conditions,
                    Condition::new(
                        CONFIGURATION_VALID,
                        ConditionStatus::False,
                        "InvalidConfiguration",
                        reason.clone(),
                        now,
                    ),
                ) || message_changed
            },
        )
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to record configuration error on campaign");
        }

        self.emit(
            campaign.key(),
            campaign,
            correlation_id,
            LifecycleEventPayload::AdmissionRejected { reason },
        )
        .await;
    }

    async fn emit(
        &self,
        entity: ObjectKey,
        campaign: &Campaign,
        correlation_id: Uuid,
        payload: LifecycleEventPayload,
    ) {
        let event = LifecycleEvent::new(entity, campaign.key(), correlation_id, payload);
        if let Err(e) = self.events.publish(event).await {
            tracing::warn!(error = %e, "failed to publish lifecycle event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulingPolicy;
    use crate::partition::PartitionStrategy;
    use crate::resource::{CampaignSpec, WorkUnitPhase};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn repos(names: &[&str]) -> Batch {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn campaign(parallelism: usize) -> Campaign {
        let mut c = Campaign::new(
            "maint",
            "nightly",
            CampaignSpec {
                policy: SchedulingPolicy::new(PartitionStrategy::FixedBatchSize, 2)
                    .with_parallelism(parallelism),
                ..CampaignSpec::default()
            },
        );
        c.metadata.uid = Some(Uuid::now_v7());
        c
    }

    fn unit(c: &Campaign, index: usize, batch: &Batch, phase: WorkUnitPhase) -> WorkUnit {
        let mut u = build_work_unit(c, index, batch, now());
        u.status.phase = phase;
        u
    }

    fn batches() -> Vec<Batch> {
        vec![repos(&["a", "b"]), repos(&["c", "d"]), repos(&["e"])]
    }

    #[test]
    fn first_pass_admits_up_to_ceiling_in_order() {
        let c = campaign(2);
        let plan = plan_admission(&c, &[], &batches(), now());

        let indices: Vec<_> = plan.admit.iter().map(|u| u.spec.batch_index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(plan.pending, 3);
        assert_eq!(plan.admit[0].spec.priority, 0);
        assert_eq!(plan.admit[1].spec.priority, 1);
        assert_eq!(plan.admit[0].status.phase, WorkUnitPhase::Pending);
        assert_eq!(plan.admit[0].metadata.name, "nightly-batch-0");
        assert_eq!(plan.admit[0].spec.config_document, "nightly-batches");
        assert_eq!(
            plan.admit[0].metadata.owner.as_ref().map(|o| o.uid),
            c.metadata.uid
        );
    }

    #[test]
    fn completed_batch_frees_slot_for_next_index() {
        let c = campaign(2);
        let b = batches();
        let existing = vec![
            unit(&c, 0, &b[0], WorkUnitPhase::Succeeded),
            unit(&c, 1, &b[1], WorkUnitPhase::Running),
        ];
        let plan = plan_admission(&c, &existing, &b, now());
        let indices: Vec<_> = plan.admit.iter().map(|u| u.spec.batch_index).collect();
        assert_eq!(indices, vec![2]);
    }

    #[test]
    fn full_ceiling_admits_nothing() {
        let c = campaign(2);
        let b = batches();
        let existing = vec![
            unit(&c, 0, &b[0], WorkUnitPhase::Pending),
            unit(&c, 1, &b[1], WorkUnitPhase::Running),
        ];
        assert!(plan_admission(&c, &existing, &b, now()).admit.is_empty());
    }

    #[test]
    fn live_unit_with_same_repositories_covers_batch() {
        let c = campaign(5);
        let b = batches();
        // Same repositories under a different index, e.g. after a reshuffle.
        let existing = vec![unit(&c, 7, &b[1], WorkUnitPhase::Running)];
        assert!(is_covered(&existing, 1, &b[1]));
        let indices = select_batches(&existing, &b, 5);
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn live_unit_covers_batch_regardless_of_repository_order() {
        let c = campaign(5);
        let b = vec![repos(&["a", "b"]), repos(&["c", "d"])];
        let existing = vec![unit(&c, 7, &repos(&["d", "c"]), WorkUnitPhase::Running)];
        assert!(is_covered(&existing, 1, &b[1]));
        assert_eq!(select_batches(&existing, &b, 5), vec![0]);
    }

    #[test]
    fn different_repositories_of_same_length_do_not_cover() {
        let c = campaign(5);
        let existing = vec![unit(&c, 7, &repos(&["c", "x"]), WorkUnitPhase::Running)];
        assert!(!is_covered(&existing, 1, &repos(&["c", "d"])));
    }

    #[test]
    fn terminal_unit_with_same_repositories_does_not_cover_other_index() {
        let c = campaign(5);
        let b = batches();
        let existing = vec![unit(&c, 7, &b[1], WorkUnitPhase::Failed)];
        assert!(!is_covered(&existing, 1, &b[1]));
    }

    #[test]
    fn quota_never_negative() {
        assert_eq!(admission_quota(5, 2), 0);
        assert_eq!(admission_quota(1, 3), 2);
    }

    #[test]
    fn suspended_campaign_drains_live_units() {
        let mut c = campaign(3);
        c.spec.suspended = true;
        let b = batches();
        let existing = vec![
            unit(&c, 0, &b[0], WorkUnitPhase::Succeeded),
            unit(&c, 1, &b[1], WorkUnitPhase::Running),
            unit(&c, 2, &b[2], WorkUnitPhase::Pending),
        ];
        let plan = plan_admission(&c, &existing, &b, now());
        assert!(plan.admit.is_empty());
        let drained: Vec<_> = plan.drain.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(drained, vec!["nightly-batch-1", "nightly-batch-2"]);
    }

    #[test]
    fn zero_batches_admit_nothing() {
        let c = campaign(2);
        let plan = plan_admission(&c, &[], &[], now());
        assert!(plan.admit.is_empty());
        assert_eq!(plan.pending, 0);
    }
}

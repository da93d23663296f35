use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Condition, ExecutionTemplate, ObjectKey, ObjectMeta, Resource};

/// Lifecycle phase of a work unit.
///
/// Phases only move forward: `Pending → Running → {Succeeded, Failed}`, with
/// `Pending` allowed to jump straight to a terminal phase.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum WorkUnitPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl WorkUnitPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether moving from `self` to `next` keeps the phase sequence monotonic.
    ///
    /// Staying in the same phase is allowed.
    pub fn can_transition_to(&self, next: WorkUnitPhase) -> bool {
        match (self, next) {
            (a, b) if *a == b => true,
            (Self::Pending, _) => true,
            (Self::Running, Self::Succeeded | Self::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for WorkUnitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable tracking record for one scheduled batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub metadata: ObjectMeta,
    pub spec: WorkUnitSpec,
    #[serde(default)]
    pub status: WorkUnitStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkUnitSpec {
    /// Name of the owning campaign.
    pub campaign: String,
    pub repositories: Vec<String>,
    /// Position of the batch in the campaign's partition; also the worker index.
    pub batch_index: usize,
    /// Lower runs earlier.
    pub priority: i64,
    #[serde(default)]
    pub execution: ExecutionTemplate,
    #[serde(default)]
    pub retention_seconds: Option<i64>,
    /// Name of the campaign's configuration document.
    pub config_document: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkUnitStatus {
    #[serde(default)]
    pub phase: WorkUnitPhase,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Set exactly when the phase is terminal.
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
    /// Once set, never cleared while the record exists.
    #[serde(default)]
    pub execution_ref: Option<ObjectKey>,
    #[serde(default)]
    pub processed_repositories: Vec<String>,
    #[serde(default)]
    pub failed_repositories: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl WorkUnit {
    pub fn phase(&self) -> WorkUnitPhase {
        self.status.phase
    }

    /// Pending or running.
    pub fn is_live(&self) -> bool {
        !self.status.phase.is_terminal()
    }
}

impl Resource for WorkUnit {
    const KIND: &'static str = "WorkUnit";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

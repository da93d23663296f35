use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Condition, ObjectMeta, Resource};
use crate::config::SchedulingPolicy;

/// Execution settings passed through untouched to the execution substrate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionTemplate(pub Value);

/// The owning parent of a set of work units: one maintenance sweep over
/// the repositories discovery reports for it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub metadata: ObjectMeta,
    pub spec: CampaignSpec,
    #[serde(default)]
    pub status: CampaignStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignSpec {
    /// Drain: delete live work units and admit nothing new.
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub policy: SchedulingPolicy,
    #[serde(default)]
    pub execution: ExecutionTemplate,
    /// Base worker configuration; batch documents are overlaid onto it.
    #[serde(default)]
    pub base_config: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignStatus {
    #[serde(default)]
    pub batch_count: usize,
    #[serde(default)]
    pub active_work_units: usize,
    #[serde(default)]
    pub last_admission_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Campaign {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: CampaignSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: CampaignStatus::default(),
        }
    }
}

impl Resource for Campaign {
    const KIND: &'static str = "Campaign";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

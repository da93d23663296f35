//! Objects exchanged with the object store.
//!
//! Every stored object carries an [`ObjectMeta`] and implements [`Resource`].
//! The set of kinds is closed: campaigns own work units, work units own their
//! executions, and each campaign owns one configuration document.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod campaign;
mod config_document;
mod execution;
mod work_unit;

pub use campaign::{Campaign, CampaignSpec, CampaignStatus, ExecutionTemplate};
pub use config_document::ConfigDocument;
pub use execution::{
    EXECUTION_COMPLETE, EXECUTION_FAILED, Execution, ExecutionProbe, IndexedJob, IndexedJobSpec,
    IndexedJobStatus, Workload,
};
pub use work_unit::{WorkUnit, WorkUnitPhase, WorkUnitSpec, WorkUnitStatus};

/// Label carrying the owning campaign's name.
pub const CAMPAIGN_LABEL: &str = "shoal.dev/campaign";

/// Label carrying a work unit's batch index.
pub const BATCH_INDEX_LABEL: &str = "shoal.dev/batch-index";

/// Namespaced identity of a stored object.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reference from a dependent object to its owner.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: Uuid,
}

/// Metadata shared by all stored objects.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    /// Assigned by the store on create.
    #[serde(default)]
    pub uid: Option<Uuid>,
    /// Optimistic-concurrency token, bumped by the store on every write.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set when deletion was requested while finalizers were present.
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Adds `finalizer`; returns false if it was already present.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Removes `finalizer`; returns false if it was absent.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }

    /// Owner reference pointing at this object.
    ///
    /// Returns `None` until the store has assigned a uid.
    pub fn owner_reference(&self, kind: &str) -> Option<OwnerReference> {
        self.uid.map(|uid| OwnerReference {
            kind: kind.to_string(),
            name: self.name.clone(),
            uid,
        })
    }
}

/// A kind of object the store can hold.
pub trait Resource:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Kind name, unique across resources.
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }
}

/// Tri-state condition status.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// An observation about an object, keyed by `condition_type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: at,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Finds the condition of the given type.
pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

/// Inserts or replaces the condition with the same type.
///
/// The transition time is only moved when the status changes. Returns true
/// when anything changed.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) => {
            if existing.status == condition.status
                && existing.reason == condition.reason
                && existing.message == condition.message
            {
                return false;
            }
            let transition_time = if existing.status == condition.status {
                existing.last_transition_time
            } else {
                condition.last_transition_time
            };
            *existing = Condition {
                last_transition_time: transition_time,
                ..condition
            };
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn key_display() {
        assert_eq!(ObjectKey::new("maint", "nightly").to_string(), "maint/nightly");
    }

    #[test]
    fn finalizers_add_and_remove_once() {
        let mut meta = ObjectMeta::new("maint", "nightly");
        assert!(meta.add_finalizer("x"));
        assert!(!meta.add_finalizer("x"));
        assert!(meta.has_finalizer("x"));
        assert!(meta.remove_finalizer("x"));
        assert!(!meta.remove_finalizer("x"));
    }

    #[test]
    fn owner_reference_requires_uid() {
        let mut meta = ObjectMeta::new("maint", "nightly");
        assert!(meta.owner_reference("Campaign").is_none());
        let uid = Uuid::now_v7();
        meta.uid = Some(uid);
        let owner = meta.owner_reference("Campaign").unwrap();
        assert_eq!(owner.uid, uid);
        assert_eq!(owner.name, "nightly");
    }

    #[test]
    fn set_condition_keeps_transition_time_for_same_status() {
        let mut conditions = Vec::new();
        assert!(set_condition(
            &mut conditions,
            Condition::new("Running", ConditionStatus::True, "Active", "", at(0)),
        ));
        assert!(!set_condition(
            &mut conditions,
            Condition::new("Running", ConditionStatus::True, "Active", "", at(10)),
        ));
        assert!(set_condition(
            &mut conditions,
            Condition::new("Running", ConditionStatus::True, "Active", "2 pods", at(20)),
        ));
        assert_eq!(conditions[0].last_transition_time, at(0));

        assert!(set_condition(
            &mut conditions,
            Condition::new("Running", ConditionStatus::False, "Finished", "", at(30)),
        ));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, at(30));
        assert!(!find_condition(&conditions, "Running").unwrap().is_true());
    }
}

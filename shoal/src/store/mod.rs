//! Versioned object store abstraction.
//!
//! [`ObjectStore`] is the object-safe seam every controller talks to. It moves
//! [`RawObject`]s keyed by kind and [`ObjectKey`]; [`ObjectStoreExt`] layers
//! typed access for any [`Resource`] on top.
//!
//! Store semantics the controllers rely on:
//!
//! - `create` assigns uid, creation timestamp and the first resource version;
//!   a duplicate key fails with `AlreadyExists`.
//! - `update` is a compare-and-swap on `resource_version`; a stale version
//!   fails with `Conflict`. Uid, creation and deletion timestamps cannot be
//!   changed by an update.
//! - `delete` on an object with finalizers only stamps `deletion_timestamp`.
//!   The object goes away once an update leaves its finalizer list empty.
//! - Removing an object cascades to its dependents (by owner uid) unless the
//!   propagation is [`DeletePropagation::Orphan`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result, StoreError};
use crate::resource::{ObjectKey, ObjectMeta, Resource};

pub mod memory;

pub use memory::InMemoryObjectStore;

/// Result type of store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A stored object split into its metadata and the rest of its body.
#[derive(Clone, Debug, PartialEq)]
pub struct RawObject {
    pub metadata: ObjectMeta,
    pub body: Map<String, Value>,
}

impl RawObject {
    /// Splits a typed resource into metadata and body.
    pub fn encode<R: Resource>(resource: &R) -> StoreResult<Self> {
        let codec = |message: String| StoreError::Codec {
            kind: R::KIND,
            message,
        };

        let mut body = match serde_json::to_value(resource) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(codec("resource did not serialize to an object".into())),
            Err(e) => return Err(codec(e.to_string())),
        };
        let metadata = body
            .remove("metadata")
            .ok_or_else(|| codec("resource has no metadata field".into()))
            .and_then(|m| serde_json::from_value(m).map_err(|e| codec(e.to_string())))?;

        Ok(Self { metadata, body })
    }

    /// Reassembles a typed resource.
    pub fn decode<R: Resource>(self) -> StoreResult<R> {
        let mut body = self.body;
        let metadata = serde_json::to_value(&self.metadata).map_err(|e| StoreError::Codec {
            kind: R::KIND,
            message: e.to_string(),
        })?;
        body.insert("metadata".to_string(), metadata);
        serde_json::from_value(Value::Object(body)).map_err(|e| StoreError::Codec {
            kind: R::KIND,
            message: e.to_string(),
        })
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }
}

/// Selects objects in [`ObjectStore::list_raw`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub namespace: Option<String>,
    /// Every entry must match exactly.
    pub labels: BTreeMap<String, String>,
    pub owner_uid: Option<Uuid>,
}

impl ListFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn owned_by(mut self, owner_uid: Uuid) -> Self {
        self.owner_uid = Some(owner_uid);
        self
    }

    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        if let Some(namespace) = &self.namespace
            && &meta.namespace != namespace
        {
            return false;
        }
        if let Some(uid) = self.owner_uid
            && meta.owner.as_ref().map(|o| o.uid) != Some(uid)
        {
            return false;
        }
        self.labels
            .iter()
            .all(|(k, v)| meta.labels.get(k).is_some_and(|actual| actual == v))
    }
}

/// What happens to dependents when their owner is removed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DeletePropagation {
    /// Remove the owner now, then delete dependents.
    #[default]
    Background,
    /// Delete dependents before removing the owner.
    Foreground,
    /// Leave dependents in place and clear their owner reference.
    Orphan,
}

/// Storage abstraction for controller state.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_raw(&self, kind: &'static str, key: &ObjectKey) -> StoreResult<RawObject>;

    /// Objects of `kind` matching `filter`, ordered by key.
    async fn list_raw(&self, kind: &'static str, filter: &ListFilter) -> StoreResult<Vec<RawObject>>;

    async fn create_raw(&self, kind: &'static str, object: RawObject) -> StoreResult<RawObject>;

    /// Compare-and-swap on `object.metadata.resource_version`.
    async fn update_raw(&self, kind: &'static str, object: RawObject) -> StoreResult<RawObject>;

    async fn delete_raw(
        &self,
        kind: &'static str,
        key: &ObjectKey,
        propagation: DeletePropagation,
    ) -> StoreResult<()>;
}

/// Typed access to an [`ObjectStore`].
#[async_trait]
pub trait ObjectStoreExt: ObjectStore {
    async fn get<R: Resource>(&self, key: &ObjectKey) -> StoreResult<R> {
        self.get_raw(R::KIND, key).await?.decode()
    }

    /// Like [`get`](Self::get) but maps `NotFound` to `None`.
    async fn get_opt<R: Resource>(&self, key: &ObjectKey) -> StoreResult<Option<R>> {
        match self.get_raw(R::KIND, key).await {
            Ok(raw) => raw.decode().map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list<R: Resource>(&self, filter: &ListFilter) -> StoreResult<Vec<R>> {
        self.list_raw(R::KIND, filter)
            .await?
            .into_iter()
            .map(RawObject::decode)
            .collect()
    }

    async fn create<R: Resource>(&self, resource: &R) -> StoreResult<R> {
        let raw = RawObject::encode(resource)?;
        self.create_raw(R::KIND, raw).await?.decode()
    }

    async fn update<R: Resource>(&self, resource: &R) -> StoreResult<R> {
        let raw = RawObject::encode(resource)?;
        self.update_raw(R::KIND, raw).await?.decode()
    }

    async fn delete<R: Resource>(
        &self,
        key: &ObjectKey,
        propagation: DeletePropagation,
    ) -> StoreResult<()> {
        self.delete_raw(R::KIND, key, propagation).await
    }
}

impl<S: ObjectStore + ?Sized> ObjectStoreExt for S {}

/// Read-modify-write with conflict retry.
///
/// `mutate` receives the freshest copy and returns whether it changed
/// anything; unchanged objects are not written. A vanished object yields
/// `Ok(None)`.
///
/// # Errors
///
/// [`Error::ConflictRetriesExhausted`] after `max_attempts` conflicting
/// writes; any other store error is returned as is.
pub async fn update_with_retry<R, S, F>(
    store: &S,
    key: &ObjectKey,
    max_attempts: u32,
    mut mutate: F,
) -> Result<Option<R>>
where
    R: Resource,
    S: ObjectStore + ?Sized,
    F: FnMut(&mut R) -> bool + Send,
{
    let max_attempts = max_attempts.max(1);
    for attempt in 1..=max_attempts {
        let Some(mut current) = store.get_opt::<R>(key).await? else {
            return Ok(None);
        };
        if !mutate(&mut current) {
            return Ok(Some(current));
        }
        match store.update(&current).await {
            Ok(updated) => return Ok(Some(updated)),
            Err(e) if e.is_conflict() => {
                tracing::debug!(
                    kind = R::KIND,
                    key = %key,
                    attempt,
                    "version conflict, re-reading"
                );
            }
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }

    Err(Error::ConflictRetriesExhausted {
        key: key.clone(),
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Campaign, CampaignSpec};

    #[test]
    fn raw_object_round_trips_metadata() {
        let mut campaign = Campaign::new("maint", "nightly", CampaignSpec::default());
        campaign.metadata.resource_version = 7;
        let raw = RawObject::encode(&campaign).unwrap();
        assert_eq!(raw.metadata.name, "nightly");
        assert!(!raw.body.contains_key("metadata"));
        assert!(raw.body.contains_key("spec"));

        let back: Campaign = raw.decode().unwrap();
        assert_eq!(back, campaign);
    }

    #[test]
    fn decode_reports_kind_on_bad_body() {
        let raw = RawObject {
            metadata: ObjectMeta::new("maint", "nightly"),
            body: Map::new(),
        };
        let err = raw.decode::<Campaign>().unwrap_err();
        assert!(matches!(err, StoreError::Codec { kind: "Campaign", .. }));
    }

    #[test]
    fn filter_matches_labels_and_owner() {
        let owner = Uuid::now_v7();
        let mut meta = ObjectMeta::new("maint", "nightly-batch-0").with_label("team", "infra");
        meta.owner = Some(crate::resource::OwnerReference {
            kind: "Campaign".into(),
            name: "nightly".into(),
            uid: owner,
        });

        assert!(ListFilter::all().matches(&meta));
        assert!(ListFilter::in_namespace("maint").owned_by(owner).matches(&meta));
        assert!(!ListFilter::in_namespace("other").matches(&meta));
        assert!(!ListFilter::all().owned_by(Uuid::now_v7()).matches(&meta));
        assert!(!ListFilter::all().with_label("team", "web").matches(&meta));
    }
}

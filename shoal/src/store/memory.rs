//! In-memory object store.
//!
//! Backs the test suite and the demo binary. Everything lives behind one
//! mutex, so each call observes and produces a consistent snapshot.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{DeletePropagation, ListFilter, ObjectStore, RawObject, StoreResult};
use crate::error::StoreError;
use crate::resource::ObjectKey;

type SlotKey = (&'static str, ObjectKey);

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<SlotKey, RawObject>,
    /// Monotonic revision; every write takes the next value.
    revision: u64,
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Removes an object for good and applies `propagation` to its dependents.
    fn remove(&mut self, slot: &SlotKey, propagation: DeletePropagation) {
        let Some(removed) = self.objects.remove(slot) else {
            return;
        };
        let Some(uid) = removed.metadata.uid else {
            return;
        };

        let dependents: Vec<SlotKey> = self
            .objects
            .iter()
            .filter(|(_, obj)| obj.metadata.owner.as_ref().is_some_and(|o| o.uid == uid))
            .map(|(slot, _)| slot.clone())
            .collect();

        for dependent in dependents {
            match propagation {
                DeletePropagation::Orphan => {
                    let revision = self.next_revision();
                    if let Some(obj) = self.objects.get_mut(&dependent) {
                        obj.metadata.owner = None;
                        obj.metadata.resource_version = revision;
                    }
                }
                DeletePropagation::Background | DeletePropagation::Foreground => {
                    self.request_delete(&dependent, propagation);
                }
            }
        }
    }

    /// Deletes immediately, or marks for deletion while finalizers remain.
    fn request_delete(&mut self, slot: &SlotKey, propagation: DeletePropagation) -> bool {
        let revision = self.next_revision();
        let Some(obj) = self.objects.get_mut(slot) else {
            return false;
        };

        if obj.metadata.finalizers.is_empty() {
            self.remove(slot, propagation);
        } else if obj.metadata.deletion_timestamp.is_none() {
            obj.metadata.deletion_timestamp = Some(Utc::now());
            obj.metadata.resource_version = revision;
        }
        true
    }
}

/// Thread-safe in-memory [`ObjectStore`].
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    inner: Mutex<Inner>,
}

impl InMemoryObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects of `kind`.
    pub fn count(&self, kind: &'static str) -> usize {
        self.inner
            .lock()
            .objects
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    /// Total number of stored objects.
    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get_raw(&self, kind: &'static str, key: &ObjectKey) -> StoreResult<RawObject> {
        self.inner
            .lock()
            .objects
            .get(&(kind, key.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind,
                key: key.clone(),
            })
    }

    async fn list_raw(&self, kind: &'static str, filter: &ListFilter) -> StoreResult<Vec<RawObject>> {
        let inner = self.inner.lock();
        Ok(inner
            .objects
            .iter()
            .filter(|((k, _), obj)| *k == kind && filter.matches(&obj.metadata))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create_raw(&self, kind: &'static str, mut object: RawObject) -> StoreResult<RawObject> {
        let mut inner = self.inner.lock();
        let key = object.key();
        let slot = (kind, key.clone());
        if inner.objects.contains_key(&slot) {
            return Err(StoreError::AlreadyExists { kind, key });
        }

        let revision = inner.next_revision();
        object.metadata.uid = Some(Uuid::now_v7());
        object.metadata.resource_version = revision;
        object.metadata.creation_timestamp = Some(Utc::now());
        object.metadata.deletion_timestamp = None;

        inner.objects.insert(slot, object.clone());
        Ok(object)
    }

    async fn update_raw(&self, kind: &'static str, mut object: RawObject) -> StoreResult<RawObject> {
        let mut inner = self.inner.lock();
        let key = object.key();
        let slot = (kind, key.clone());

        let Some(stored) = inner.objects.get(&slot) else {
            return Err(StoreError::NotFound { kind, key });
        };
        if stored.metadata.resource_version != object.metadata.resource_version {
            return Err(StoreError::Conflict {
                kind,
                key,
                expected: object.metadata.resource_version,
                actual: stored.metadata.resource_version,
            });
        }

        object.metadata.uid = stored.metadata.uid;
        object.metadata.creation_timestamp = stored.metadata.creation_timestamp;
        object.metadata.deletion_timestamp = stored.metadata.deletion_timestamp;
        object.metadata.resource_version = inner.next_revision();

        let release = object.metadata.is_deleting() && object.metadata.finalizers.is_empty();
        inner.objects.insert(slot.clone(), object.clone());
        if release {
            inner.remove(&slot, DeletePropagation::Background);
        }
        Ok(object)
    }

    async fn delete_raw(
        &self,
        kind: &'static str,
        key: &ObjectKey,
        propagation: DeletePropagation,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let slot = (kind, key.clone());
        if inner.request_delete(&slot, propagation) {
            Ok(())
        } else {
            Err(StoreError::NotFound {
                kind,
                key: key.clone(),
            })
        }
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use shoal::store::{RawObject, StoreResult};
use shoal::{DeletePropagation, ListFilter, ObjectKey, ObjectStore, StoreError};

/// Store wrapper that injects failures into an inner store.
///
/// - `fail_creates_after(kind, n)`: the first `n` creates of `kind` go
///   through, later ones fail with `Unavailable`.
/// - `inject_conflicts(kind, n)`: the next `n` updates of `kind` fail with a
///   version conflict without touching the inner store.
/// - `set_unavailable(true)`: every call fails.
pub struct FaultyStore {
    inner: Arc<dyn ObjectStore>,
    create_budget: Mutex<HashMap<&'static str, usize>>,
    conflicts: Mutex<HashMap<&'static str, u32>>,
    unavailable: AtomicBool,
    creates: AtomicUsize,
    updates: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            create_budget: Mutex::new(HashMap::new()),
            conflicts: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
            creates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        }
    }

    pub fn fail_creates_after(&self, kind: &'static str, successes: usize) {
        self.create_budget.lock().insert(kind, successes);
    }

    pub fn inject_conflicts(&self, kind: &'static str, count: u32) {
        self.conflicts.lock().insert(kind, count);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Clears every injected fault.
    pub fn heal(&self) {
        self.create_budget.lock().clear();
        self.conflicts.lock().clear();
        self.set_unavailable(false);
    }

    /// Create calls seen, including failed ones.
    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Update calls seen, including failed ones.
    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("injected outage"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for FaultyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyStore")
            .field("unavailable", &self.unavailable.load(Ordering::SeqCst))
            .field("creates", &self.create_calls())
            .field("updates", &self.update_calls())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn get_raw(&self, kind: &'static str, key: &ObjectKey) -> StoreResult<RawObject> {
        self.check_available()?;
        self.inner.get_raw(kind, key).await
    }

    async fn list_raw(&self, kind: &'static str, filter: &ListFilter) -> StoreResult<Vec<RawObject>> {
        self.check_available()?;
        self.inner.list_raw(kind, filter).await
    }

    async fn create_raw(&self, kind: &'static str, object: RawObject) -> StoreResult<RawObject> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        {
            let mut budget = self.create_budget.lock();
            if let Some(remaining) = budget.get_mut(kind) {
                if *remaining == 0 {
                    return Err(StoreError::unavailable(format!("injected {kind} create failure")));
                }
                *remaining -= 1;
            }
        }
        self.inner.create_raw(kind, object).await
    }

    async fn update_raw(&self, kind: &'static str, object: RawObject) -> StoreResult<RawObject> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        {
            let mut conflicts = self.conflicts.lock();
            if let Some(remaining) = conflicts.get_mut(kind)
                && *remaining > 0
            {
                *remaining -= 1;
                let expected = object.metadata.resource_version;
                return Err(StoreError::Conflict {
                    kind,
                    key: object.key(),
                    expected,
                    actual: expected + 1,
                });
            }
        }
        self.inner.update_raw(kind, object).await
    }

    async fn delete_raw(
        &self,
        kind: &'static str,
        key: &ObjectKey,
        propagation: DeletePropagation,
    ) -> StoreResult<()> {
        self.check_available()?;
        self.inner.delete_raw(kind, key, propagation).await
    }
}

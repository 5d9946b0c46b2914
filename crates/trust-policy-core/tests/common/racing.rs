//! Store wrapper simulating a concurrent writer on the staging ref.
use std::sync::atomic::{AtomicUsize, Ordering};

use trust_policy_core::store::{ObjectKind, SledObjectStore};
use trust_policy_core::{ObjectId, ObjectStore, StoreError};

/// Moves the ref to a competing commit right before the next `races` ref updates.
pub struct RacingStore {
    inner: SledObjectStore,
    races: AtomicUsize,
}

impl RacingStore {
    pub fn new(inner: SledObjectStore) -> Self {
        Self {
            inner,
            races: AtomicUsize::new(0),
        }
    }

    /// Arms the store so the next `count` ref updates lose a race.
    pub fn lose_next(&self, count: usize) {
        self.races.store(count, Ordering::SeqCst);
    }

    fn race(&self, name: &str) -> Result<(), StoreError> {
        let Some(current) = self.inner.read_ref(name)? else {
            return Ok(());
        };
        let tree = self.inner.read_commit(&current)?.tree;
        let competing =
            self.inner
                .write_commit(vec![current.clone()], tree, "Concurrent policy edit", None)?;
        self.inner.update_ref(name, Some(&current), &competing)
    }
}

impl ObjectStore for RacingStore {
    fn read_ref(&self, name: &str) -> Result<Option<ObjectId>, StoreError> {
        self.inner.read_ref(name)
    }

    fn read_object(&self, id: &ObjectId) -> Result<(ObjectKind, Vec<u8>), StoreError> {
        self.inner.read_object(id)
    }

    fn write_object(&self, kind: ObjectKind, content: &[u8]) -> Result<ObjectId, StoreError> {
        self.inner.write_object(kind, content)
    }

    fn update_ref(
        &self,
        name: &str,
        expected: Option<&ObjectId>,
        new: &ObjectId,
    ) -> Result<(), StoreError> {
        let armed = self
            .races
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if armed {
            self.race(name)?;
        }
        self.inner.update_ref(name, expected, new)
    }
}

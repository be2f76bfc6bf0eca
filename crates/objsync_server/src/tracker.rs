//! Accumulates the side effects of one transaction.

use crate::object::{object_key, ObjectRef};
use std::collections::HashSet;

/// Objects changed and disposed during a transaction, in first-seen order.
#[derive(Debug, Default)]
pub struct TrackedChanges {
    /// Changed objects.
    pub changed: Vec<ObjectRef>,
    /// Disposed objects.
    pub disposed: Vec<ObjectRef>,
}

impl TrackedChanges {
    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.disposed.is_empty()
    }
}

/// Records which objects a transaction touched.
///
/// Each object is recorded once per list. An object that is disposed after
/// being changed is reported as disposed only.
#[derive(Debug, Default)]
pub struct UpdateTracker {
    changes: TrackedChanges,
    changed_keys: HashSet<usize>,
    disposed_keys: HashSet<usize>,
}

impl UpdateTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a changed object.
    pub fn object_changed(&mut self, handle: &ObjectRef) {
        let key = object_key(handle);
        if !self.disposed_keys.contains(&key) && self.changed_keys.insert(key) {
            self.changes.changed.push(ObjectRef::clone(handle));
        }
    }

    /// Records a disposed object.
    pub fn object_disposed(&mut self, handle: &ObjectRef) {
        let key = object_key(handle);
        if self.disposed_keys.insert(key) {
            if self.changed_keys.remove(&key) {
                self.changes.changed.retain(|h| object_key(h) != key);
            }
            self.changes.disposed.push(ObjectRef::clone(handle));
        }
    }

    /// Returns true if `handle` is recorded as disposed.
    pub fn is_disposed(&self, handle: &ObjectRef) -> bool {
        self.disposed_keys.contains(&object_key(handle))
    }

    /// Returns the objects recorded as changed.
    pub fn changed(&self) -> &[ObjectRef] {
        &self.changes.changed
    }

    /// Returns the objects recorded as disposed.
    pub fn disposed(&self) -> &[ObjectRef] {
        &self.changes.disposed
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Hands out everything recorded and resets the tracker.
    pub fn take(&mut self) -> TrackedChanges {
        self.changed_keys.clear();
        self.disposed_keys.clear();
        std::mem::take(&mut self.changes)
    }

    /// Forgets everything recorded.
    pub fn clear(&mut self) {
        self.take();
    }
}

//! Per-resource operation trackers
//!
//! A [`TrackerStore`] hands out exactly one [`AsyncTracker`] per resource
//! identity. The tracker carries the resource's [`Operation`] together with
//! the last known provider state, so that reconciliation passes can see the
//! outcome of asynchronous work started by an earlier pass.
//!
//! Entries are never evicted on their own: callers remove a tracker when the
//! resource it belongs to is deleted.

use crate::operation::Operation;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Stable identity of a managed resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Flat instance state kept by SDK-style providers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub id: String,
    pub attributes: BTreeMap<String, String>,
    pub meta: BTreeMap<String, serde_json::Value>,
}

/// Cached provider state. Only one flavour is held at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedState {
    Sdk(InstanceState),
    /// Encoded dynamic value from a plugin-framework provider
    Framework(Vec<u8>),
}

/// Where the cached state came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StateOrigin {
    #[default]
    Unset,
    /// Returned by a genuine observation of the external resource
    Observed,
    /// Rebuilt from a secondary source after a cache miss
    Reconstructed,
}

#[derive(Default)]
struct TrackedState {
    state: Option<CachedState>,
    origin: StateOrigin,
    tf_id: Option<String>,
}

/// Per-resource cache of the last operation and provider state
pub struct AsyncTracker {
    last_operation: Operation,
    state: Mutex<TrackedState>,
    deleted: AtomicBool,
}

impl Default for AsyncTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncTracker {
    pub fn new() -> Self {
        Self {
            last_operation: Operation::new(),
            state: Mutex::new(TrackedState::default()),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn last_operation(&self) -> &Operation {
        &self.last_operation
    }

    pub fn has_state(&self) -> bool {
        self.state.lock().state.is_some()
    }

    pub fn state_origin(&self) -> StateOrigin {
        self.state.lock().origin
    }

    pub fn cached_state(&self) -> Option<CachedState> {
        self.state.lock().state.clone()
    }

    pub fn sdk_state(&self) -> Option<InstanceState> {
        match &self.state.lock().state {
            Some(CachedState::Sdk(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn framework_state(&self) -> Option<Vec<u8>> {
        match &self.state.lock().state {
            Some(CachedState::Framework(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn set_sdk_state(&self, state: InstanceState) {
        self.store(CachedState::Sdk(state), StateOrigin::Observed);
    }

    pub fn set_reconstructed_sdk_state(&self, state: InstanceState) {
        self.store(CachedState::Sdk(state), StateOrigin::Reconstructed);
    }

    pub fn set_framework_state(&self, state: Vec<u8>) {
        self.store(CachedState::Framework(state), StateOrigin::Observed);
    }

    pub fn set_reconstructed_framework_state(&self, state: Vec<u8>) {
        self.store(CachedState::Framework(state), StateOrigin::Reconstructed);
    }

    fn store(&self, state: CachedState, origin: StateOrigin) {
        let mut guard = self.state.lock();
        guard.state = Some(state);
        guard.origin = origin;
    }

    /// Drops the SDK state only if it was reconstructed.
    /// Returns whether anything was cleared.
    pub fn reset_reconstructed_sdk_state(&self) -> bool {
        self.reset_reconstructed(|s| matches!(s, CachedState::Sdk(_)))
    }

    /// Drops the framework state only if it was reconstructed.
    /// Returns whether anything was cleared.
    pub fn reset_reconstructed_framework_state(&self) -> bool {
        self.reset_reconstructed(|s| matches!(s, CachedState::Framework(_)))
    }

    fn reset_reconstructed(&self, flavour: impl Fn(&CachedState) -> bool) -> bool {
        let mut guard = self.state.lock();
        let reconstructed = guard.origin == StateOrigin::Reconstructed
            && guard.state.as_ref().is_some_and(flavour);
        if reconstructed {
            guard.state = None;
            guard.origin = StateOrigin::Unset;
        }
        reconstructed
    }

    pub fn clear_state(&self) {
        let mut guard = self.state.lock();
        guard.state = None;
        guard.origin = StateOrigin::Unset;
    }

    pub fn tf_id(&self) -> Option<String> {
        self.state.lock().tf_id.clone()
    }

    pub fn set_tf_id(&self, id: Option<String>) {
        self.state.lock().tf_id = id;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn set_deleted(&self, deleted: bool) {
        self.deleted.store(deleted, Ordering::Release);
    }
}

/// Get-or-create cache of [`AsyncTracker`]s keyed by resource identity
#[derive(Default)]
pub struct TrackerStore {
    trackers: Mutex<HashMap<ResourceId, Arc<AsyncTracker>>>,
}

impl TrackerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the tracker for `id`, creating it on first use
    pub fn tracker(&self, id: &ResourceId) -> Arc<AsyncTracker> {
        let mut trackers = self.trackers.lock();
        Arc::clone(trackers.entry(id.clone()).or_insert_with(|| {
            tracing::debug!(resource = %id, "Created operation tracker");
            Arc::new(AsyncTracker::new())
        }))
    }

    /// Forgets the tracker for `id`. Missing entries are ignored.
    pub fn remove_tracker(&self, id: &ResourceId) {
        if self.trackers.lock().remove(id).is_some() {
            tracing::debug!(resource = %id, "Removed operation tracker");
        }
    }

    pub fn len(&self) -> usize {
        self.trackers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sdk_state(id: &str) -> InstanceState {
        InstanceState {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_concurrent_get_or_create() {
        let store = Arc::new(TrackerStore::new());
        let id = ResourceId::new("uid-1");

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let store = Arc::clone(&store);
                let id = id.clone();
                std::thread::spawn(move || store.tracker(&id))
            })
            .collect();
        let trackers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(trackers.iter().all(|t| Arc::ptr_eq(t, &trackers[0])));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_distinct_ids_do_not_collide() {
        let store = TrackerStore::new();
        let a = store.tracker(&"uid-a".into());
        let b = store.tracker(&"uid-b".into());

        assert!(!Arc::ptr_eq(&a, &b));
        a.set_deleted(true);
        assert!(!b.is_deleted());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_remove_tracker() {
        let store = TrackerStore::new();
        let id = ResourceId::new("uid-1");
        let first = store.tracker(&id);

        store.remove_tracker(&id);
        store.remove_tracker(&id);
        assert!(store.is_empty());

        let second = store.tracker(&id);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_state_flavours_are_exclusive() {
        let tracker = AsyncTracker::new();
        tracker.set_sdk_state(sdk_state("a"));
        assert!(tracker.sdk_state().is_some());

        tracker.set_framework_state(vec![1, 2, 3]);
        assert!(tracker.sdk_state().is_none());
        assert_eq!(tracker.framework_state(), Some(vec![1, 2, 3]));
        assert_eq!(tracker.state_origin(), StateOrigin::Observed);
    }

    #[test]
    fn test_reset_reconstructed_keeps_observed_state() {
        let tracker = AsyncTracker::new();
        tracker.set_reconstructed_sdk_state(sdk_state("rebuilt"));
        // a genuine observation lands before the reset
        tracker.set_sdk_state(sdk_state("observed"));

        assert!(!tracker.reset_reconstructed_sdk_state());
        assert_eq!(tracker.sdk_state().unwrap().id, "observed");
    }

    #[test]
    fn test_reset_reconstructed_clears_reconstructed_state() {
        let tracker = AsyncTracker::new();
        tracker.set_reconstructed_framework_state(vec![9]);

        assert!(!tracker.reset_reconstructed_sdk_state());
        assert!(tracker.has_state());

        assert!(tracker.reset_reconstructed_framework_state());
        assert!(!tracker.has_state());
        assert_eq!(tracker.state_origin(), StateOrigin::Unset);
    }

    #[test]
    fn test_deleted_flag_and_tf_id() {
        let tracker = AsyncTracker::new();
        assert!(!tracker.is_deleted());
        tracker.set_deleted(true);
        assert!(tracker.is_deleted());

        tracker.set_tf_id(Some("i-0abc".to_string()));
        assert_eq!(tracker.tf_id().as_deref(), Some("i-0abc"));
    }
}

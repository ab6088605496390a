//! Object tracker and synchronization service.
//!
//! Every value that crosses a task boundary gets a stable logical identity.
//! The tracker records whether the slot's resident copy is authoritative and
//! drives the backing-location round-trip when a caller needs to read a
//! still-pending result.
//!
//! Identity is a property of the tracker's bookkeeping, not of value
//! equality: seen-ness is keyed on the `Arc` pointer of the resident value,
//! so two structurally equal values get distinct identities. One tracker
//! serves one slot; the single-flight de-duplication below is scoped to the
//! instance.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use crate::resolver::{AccessMode, BackingResolver, Resolution, ResolveError};
use crate::serializer::{SerializeError, Serializer};
use crate::value::RuntimeValue;

/// Opaque identity of a tracked object, unique within one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(uuid::Uuid);

impl ObjectId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Read,
    Write,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Deserialize(#[from] SerializeError),
}

/// Identity-invariant violation. Logged and repaired in place, never
/// propagated: one variable's bookkeeping must not halt the worker.
#[derive(Debug, thiserror::Error)]
#[error("conflicting backing registration for {id}: {previous} vs {requested}")]
pub struct TrackerConsistencyError {
    pub id: ObjectId,
    pub previous: String,
    pub requested: String,
}

struct TrackedEntry {
    resident: Arc<RuntimeValue>,
    backing: Option<String>,
    pending_sync: bool,
    rewrites: u32,
    is_collection: bool,
}

struct TrackerState {
    entries: HashMap<ObjectId, TrackedEntry>,
    ids_by_ptr: HashMap<usize, ObjectId>,
    ids_by_backing: HashMap<String, ObjectId>,
}

impl TrackerState {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            ids_by_ptr: HashMap::new(),
            ids_by_backing: HashMap::new(),
        }
    }
}

fn ptr_of(value: &Arc<RuntimeValue>) -> usize {
    Arc::as_ptr(value) as usize
}

/// Per-slot tracker.
pub struct ObjectTracker {
    state: StdMutex<TrackerState>,
    /// Single-flight guards, one per identity with a fetch in flight or
    /// recently completed. Removed when the identity stops being tracked.
    in_flight: DashMap<ObjectId, Arc<AsyncMutex<()>>>,
    resolver: Arc<dyn BackingResolver>,
    serializer: Arc<dyn Serializer>,
}

impl ObjectTracker {
    pub fn new(resolver: Arc<dyn BackingResolver>, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            state: StdMutex::new(TrackerState::new()),
            in_flight: DashMap::new(),
            resolver,
            serializer,
        }
    }

    /// Register a value, or return the identity it already has.
    pub fn track(&self, value: &Arc<RuntimeValue>, is_collection: bool) -> (ObjectId, Option<String>) {
        let mut state = self.lock_state();
        let ptr = ptr_of(value);
        if let Some(id) = state.ids_by_ptr.get(&ptr).copied() {
            let backing = state.entries.get(&id).and_then(|e| e.backing.clone());
            return (id, backing);
        }

        let id = ObjectId::new();
        state.entries.insert(
            id,
            TrackedEntry {
                resident: Arc::clone(value),
                backing: None,
                pending_sync: false,
                rewrites: 0,
                is_collection,
            },
        );
        state.ids_by_ptr.insert(ptr, id);
        tracing::trace!(%id, is_collection, "tracking value");
        (id, None)
    }

    /// Record that a task produced a new, not-yet-consumed version of this
    /// identity at `backing`.
    pub fn mark_pending_after_produce(&self, id: ObjectId, backing: impl Into<String>) {
        let backing = backing.into();
        let mut state = self.lock_state();

        let Some(entry) = state.entries.get_mut(&id) else {
            tracing::warn!(%id, "mark_pending_after_produce for unknown identity, ignoring");
            return;
        };

        if entry.pending_sync && entry.backing.as_deref() != Some(backing.as_str()) {
            let err = TrackerConsistencyError {
                id,
                previous: entry.backing.clone().unwrap_or_default(),
                requested: backing.clone(),
            };
            tracing::warn!(error = %err, "tracker consistency violation, entry re-created");
            entry.rewrites = 0;
        }

        let previous = entry.backing.replace(backing.clone());
        entry.pending_sync = true;
        entry.rewrites += 1;

        if let Some(previous) = previous
            && previous != backing
        {
            state.ids_by_backing.remove(&previous);
        }
        state.ids_by_backing.insert(backing, id);
    }

    /// Resident copy of the identity registered at this backing location, if
    /// any. Used by the executor to route FILE parameters that name a
    /// pending output of an earlier task.
    pub fn resident_for_backing(&self, location: &str) -> Option<Arc<RuntimeValue>> {
        let state = self.lock_state();
        let id = state.ids_by_backing.get(location)?;
        state.entries.get(id).map(|e| Arc::clone(&e.resident))
    }

    pub fn identity_of(&self, value: &Arc<RuntimeValue>) -> Option<ObjectId> {
        self.lock_state().ids_by_ptr.get(&ptr_of(value)).copied()
    }

    pub fn is_tracked(&self, id: ObjectId) -> bool {
        self.lock_state().entries.contains_key(&id)
    }

    pub fn pending_sync(&self, id: ObjectId) -> Option<bool> {
        self.lock_state().entries.get(&id).map(|e| e.pending_sync)
    }

    pub fn rewrites(&self, id: ObjectId) -> Option<u32> {
        self.lock_state().entries.get(&id).map(|e| e.rewrites)
    }

    pub fn is_collection(&self, id: ObjectId) -> Option<bool> {
        self.lock_state().entries.get(&id).map(|e| e.is_collection)
    }

    /// Terminal for this identity; a new identity must be issued for future
    /// use of the same logical variable.
    pub fn stop_tracking(&self, id: ObjectId) {
        let mut state = self.lock_state();
        if let Some(entry) = state.entries.remove(&id) {
            let ptr = ptr_of(&entry.resident);
            state.ids_by_ptr.remove(&ptr);
            if let Some(backing) = entry.backing {
                state.ids_by_backing.remove(&backing);
            }
            tracing::trace!(%id, "stopped tracking");
        }
        drop(state);
        self.in_flight.remove(&id);
    }

    /// Forget everything, for reuse between applications.
    pub fn reset(&self) {
        let mut state = self.lock_state();
        state.entries.clear();
        state.ids_by_ptr.clear();
        state.ids_by_backing.clear();
        drop(state);
        self.in_flight.clear();
    }

    /// Synchronize a value for use.
    ///
    /// Untracked values come back unchanged, except containers, which are
    /// rebuilt from element-wise synchronization. A tracked, pending value
    /// triggers one backing-location fetch; concurrent callers on the same
    /// identity block on that fetch and reuse its result. READ installs the
    /// fresh copy and clears the pending flag; WRITE hands the caller an
    /// owned copy and untracks the identity.
    pub async fn wait_on(
        &self,
        value: Arc<RuntimeValue>,
        mode: SyncMode,
    ) -> Result<Arc<RuntimeValue>, SyncError> {
        self.wait_on_boxed(value, mode).await
    }

    fn wait_on_boxed<'a>(
        &'a self,
        value: Arc<RuntimeValue>,
        mode: SyncMode,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<RuntimeValue>, SyncError>> + Send + 'a>> {
        Box::pin(async move {
            let id = self.identity_of(&value);
            let Some(id) = id else {
                return self.sync_untracked(value, mode).await;
            };

            // Fast path: already synchronized.
            {
                let state = self.lock_state();
                match state.entries.get(&id) {
                    Some(entry) if !entry.pending_sync => {
                        let resident = Arc::clone(&entry.resident);
                        drop(state);
                        if mode == SyncMode::Write {
                            self.stop_tracking(id);
                        }
                        return Ok(resident);
                    }
                    Some(_) => {}
                    None => return Ok(value),
                }
            }

            let guard = self
                .in_flight
                .entry(id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone();
            let _fetch_permit = guard.lock().await;

            // Re-check: the fetch we queued behind may have synchronized or
            // untracked this identity already.
            let (backing, resident) = {
                let state = self.lock_state();
                match state.entries.get(&id) {
                    Some(entry) if entry.pending_sync => {
                        (entry.backing.clone(), Arc::clone(&entry.resident))
                    }
                    Some(entry) => {
                        let resident = Arc::clone(&entry.resident);
                        drop(state);
                        if mode == SyncMode::Write {
                            self.stop_tracking(id);
                        }
                        return Ok(resident);
                    }
                    None => return Ok(value),
                }
            };

            let Some(backing) = backing else {
                tracing::warn!(%id, "pending identity without backing location, clearing flag");
                let mut state = self.lock_state();
                if let Some(entry) = state.entries.get_mut(&id) {
                    entry.pending_sync = false;
                }
                return Ok(resident);
            };

            let access = match mode {
                SyncMode::Read => AccessMode::Read,
                SyncMode::Write => AccessMode::Write,
            };

            let resolution = self.resolver.open(&backing, access).await?;
            if let Err(e) = self.resolver.close(&backing, access).await {
                tracing::warn!(%id, backing, error = %e, "failed to close backing location");
            }

            let fresh = match resolution {
                Resolution::Content(bytes) => Arc::new(self.serializer.deserialize(&bytes)?),
                Resolution::Absent => {
                    tracing::debug!(%id, backing, "backing location reported no result");
                    Arc::new(RuntimeValue::NullResult)
                }
            };

            match mode {
                SyncMode::Read => {
                    let mut state = self.lock_state();
                    if let Some(entry) = state.entries.get_mut(&id) {
                        let old_ptr = ptr_of(&entry.resident);
                        entry.resident = Arc::clone(&fresh);
                        entry.pending_sync = false;
                        state.ids_by_ptr.remove(&old_ptr);
                        state.ids_by_ptr.insert(ptr_of(&fresh), id);
                    }
                }
                SyncMode::Write => {
                    drop(_fetch_permit);
                    self.stop_tracking(id);
                }
            }

            Ok(fresh)
        })
    }

    async fn sync_untracked(
        &self,
        value: Arc<RuntimeValue>,
        mode: SyncMode,
    ) -> Result<Arc<RuntimeValue>, SyncError> {
        match &*value {
            RuntimeValue::List(items) => {
                let mut synced = Vec::with_capacity(items.len());
                for item in items {
                    synced.push(self.wait_on_boxed(Arc::clone(item), mode).await?);
                }
                Ok(Arc::new(RuntimeValue::List(synced)))
            }
            RuntimeValue::Map(map) => {
                let mut synced = BTreeMap::new();
                for (key, item) in map {
                    synced.insert(key.clone(), self.wait_on_boxed(Arc::clone(item), mode).await?);
                }
                Ok(Arc::new(RuntimeValue::Map(synced)))
            }
            _ => Ok(value),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().expect("tracker state lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::FileResolver;
    use crate::serializer::JsonSerializer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Resolver wrapper that counts open calls and can slow them down, for
    /// idempotence and single-flight assertions.
    struct CountingResolver {
        inner: FileResolver,
        opens: AtomicUsize,
        delay_millis: u64,
    }

    impl CountingResolver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: FileResolver::new(),
                opens: AtomicUsize::new(0),
                delay_millis: 0,
            })
        }

        fn slow(delay_millis: u64) -> Arc<Self> {
            Arc::new(Self {
                inner: FileResolver::new(),
                opens: AtomicUsize::new(0),
                delay_millis,
            })
        }

        fn open_count(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl BackingResolver for CountingResolver {
        async fn open(&self, location: &str, mode: AccessMode) -> Result<Resolution, ResolveError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.delay_millis > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_millis)).await;
            }
            self.inner.open(location, mode).await
        }

        async fn close(&self, location: &str, mode: AccessMode) -> Result<(), ResolveError> {
            self.inner.close(location, mode).await
        }

        async fn delete(&self, location: &str) -> Result<(), ResolveError> {
            self.inner.delete(location).await
        }
    }

    fn tracker_with(resolver: Arc<dyn BackingResolver>) -> ObjectTracker {
        ObjectTracker::new(resolver, Arc::new(JsonSerializer))
    }

    fn write_backing(dir: &tempfile::TempDir, name: &str, value: &RuntimeValue) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, serde_json::to_vec(value).unwrap()).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn structurally_equal_values_get_distinct_identities() {
        let tracker = tracker_with(CountingResolver::new());
        let a = Arc::new(RuntimeValue::Int(5));
        let b = Arc::new(RuntimeValue::Int(5));

        let (id_a, _) = tracker.track(&a, false);
        let (id_b, _) = tracker.track(&b, false);
        assert_ne!(id_a, id_b);
    }

    #[test]
    fn tracking_twice_returns_the_same_identity() {
        let tracker = tracker_with(CountingResolver::new());
        let v = Arc::new(RuntimeValue::Str("x".into()));

        let (first, _) = tracker.track(&v, false);
        let (second, hint) = tracker.track(&v, false);
        assert_eq!(first, second);
        assert_eq!(hint, None);
        assert_eq!(tracker.is_collection(first), Some(false));
    }

    #[tokio::test]
    async fn wait_on_untracked_scalar_is_identity() {
        let tracker = tracker_with(CountingResolver::new());
        let v = Arc::new(RuntimeValue::Int(3));

        let out = tracker.wait_on(Arc::clone(&v), SyncMode::Read).await.unwrap();
        assert!(Arc::ptr_eq(&v, &out));
    }

    #[tokio::test]
    async fn wait_on_synchronized_entry_returns_resident() {
        let tracker = tracker_with(CountingResolver::new());
        let v = Arc::new(RuntimeValue::Int(3));
        let (id, _) = tracker.track(&v, false);

        let out = tracker.wait_on(Arc::clone(&v), SyncMode::Read).await.unwrap();
        assert!(Arc::ptr_eq(&v, &out));
        assert_eq!(tracker.pending_sync(id), Some(false));
    }

    #[tokio::test]
    async fn read_sync_fetches_and_clears_pending() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CountingResolver::new();
        let tracker = tracker_with(resolver.clone());

        let stale = Arc::new(RuntimeValue::Int(1));
        let (id, _) = tracker.track(&stale, false);
        let backing = write_backing(&dir, "v2.json", &RuntimeValue::Int(2));
        tracker.mark_pending_after_produce(id, &backing);
        assert_eq!(tracker.pending_sync(id), Some(true));
        assert_eq!(tracker.rewrites(id), Some(1));

        let fresh = tracker.wait_on(Arc::clone(&stale), SyncMode::Read).await.unwrap();
        assert_eq!(*fresh, RuntimeValue::Int(2));
        assert_eq!(tracker.pending_sync(id), Some(false));
        assert_eq!(resolver.open_count(), 1);

        // The fresh copy is now the tracked resident.
        assert_eq!(tracker.identity_of(&fresh), Some(id));
    }

    #[tokio::test]
    async fn second_read_does_not_fetch_again() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CountingResolver::new();
        let tracker = tracker_with(resolver.clone());

        let stale = Arc::new(RuntimeValue::Int(1));
        let (id, _) = tracker.track(&stale, false);
        let backing = write_backing(&dir, "v.json", &RuntimeValue::Int(2));
        tracker.mark_pending_after_produce(id, &backing);

        let first = tracker.wait_on(Arc::clone(&stale), SyncMode::Read).await.unwrap();
        let second = tracker.wait_on(Arc::clone(&first), SyncMode::Read).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(resolver.open_count(), 1);
    }

    #[tokio::test]
    async fn write_sync_untracks_and_retrack_issues_new_identity() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_with(CountingResolver::new());

        let stale = Arc::new(RuntimeValue::Int(1));
        let (id, _) = tracker.track(&stale, false);
        let backing = write_backing(&dir, "v.json", &RuntimeValue::Int(2));
        tracker.mark_pending_after_produce(id, &backing);

        let owned = tracker.wait_on(Arc::clone(&stale), SyncMode::Write).await.unwrap();
        assert_eq!(*owned, RuntimeValue::Int(2));
        assert!(!tracker.is_tracked(id));

        let (new_id, _) = tracker.track(&owned, false);
        assert_ne!(new_id, id);
    }

    #[tokio::test]
    async fn write_sync_on_synchronized_entry_still_untracks() {
        let tracker = tracker_with(CountingResolver::new());
        let v = Arc::new(RuntimeValue::Int(9));
        let (id, _) = tracker.track(&v, false);

        let out = tracker.wait_on(Arc::clone(&v), SyncMode::Write).await.unwrap();
        assert!(Arc::ptr_eq(&v, &out));
        assert!(!tracker.is_tracked(id));
    }

    #[tokio::test]
    async fn absent_resolution_yields_null_result() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_with(CountingResolver::new());

        let stale = Arc::new(RuntimeValue::Int(1));
        let (id, _) = tracker.track(&stale, false);
        let missing = dir.path().join("never-produced.json");
        tracker.mark_pending_after_produce(id, missing.to_str().unwrap());

        let out = tracker.wait_on(Arc::clone(&stale), SyncMode::Read).await.unwrap();
        assert!(out.is_null_result());
        // READ keeps the identity tracked but no longer pending.
        assert_eq!(tracker.pending_sync(id), Some(false));
    }

    #[tokio::test]
    async fn absent_resolution_in_write_mode_untracks() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_with(CountingResolver::new());

        let stale = Arc::new(RuntimeValue::Int(1));
        let (id, _) = tracker.track(&stale, false);
        let missing = dir.path().join("never-produced.json");
        tracker.mark_pending_after_produce(id, missing.to_str().unwrap());

        let out = tracker.wait_on(stale, SyncMode::Write).await.unwrap();
        assert!(out.is_null_result());
        assert!(!tracker.is_tracked(id));
    }

    #[tokio::test]
    async fn untracked_container_synchronizes_element_wise() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CountingResolver::new();
        let tracker = tracker_with(resolver.clone());

        let stale = Arc::new(RuntimeValue::Int(1));
        let (id, _) = tracker.track(&stale, false);
        let backing = write_backing(&dir, "elem.json", &RuntimeValue::Int(42));
        tracker.mark_pending_after_produce(id, &backing);

        let container = Arc::new(RuntimeValue::List(vec![
            Arc::clone(&stale),
            Arc::new(RuntimeValue::Str("plain".into())),
        ]));

        let rebuilt = tracker.wait_on(container, SyncMode::Read).await.unwrap();
        match &*rebuilt {
            RuntimeValue::List(items) => {
                assert_eq!(*items[0], RuntimeValue::Int(42));
                assert_eq!(*items[1], RuntimeValue::Str("plain".into()));
            }
            other => panic!("expected list, got {other:?}"),
        }
        assert_eq!(resolver.open_count(), 1);
    }

    #[tokio::test]
    async fn tracked_pending_container_synchronizes_whole() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CountingResolver::new();
        let tracker = tracker_with(resolver.clone());

        let stale = Arc::new(RuntimeValue::List(vec![Arc::new(RuntimeValue::Int(0))]));
        let (id, _) = tracker.track(&stale, true);
        let replacement = RuntimeValue::List(vec![
            Arc::new(RuntimeValue::Int(1)),
            Arc::new(RuntimeValue::Int(2)),
        ]);
        let backing = write_backing(&dir, "whole.json", &replacement);
        tracker.mark_pending_after_produce(id, &backing);

        let out = tracker.wait_on(stale, SyncMode::Read).await.unwrap();
        assert_eq!(*out, replacement);
        assert_eq!(resolver.open_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_waits_collapse_into_one_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CountingResolver::slow(50);
        let tracker = Arc::new(tracker_with(resolver.clone()));

        let stale = Arc::new(RuntimeValue::Int(1));
        let (id, _) = tracker.track(&stale, false);
        let backing = write_backing(&dir, "v.json", &RuntimeValue::Int(7));
        tracker.mark_pending_after_produce(id, &backing);

        let (a, b) = tokio::join!(
            tracker.wait_on(Arc::clone(&stale), SyncMode::Read),
            tracker.wait_on(Arc::clone(&stale), SyncMode::Read),
        );
        assert_eq!(*a.unwrap(), RuntimeValue::Int(7));
        assert_eq!(*b.unwrap(), RuntimeValue::Int(7));
        assert_eq!(resolver.open_count(), 1);
    }

    #[test]
    fn conflicting_registration_recreates_entry() {
        let tracker = tracker_with(CountingResolver::new());
        let v = Arc::new(RuntimeValue::Int(1));
        let (id, _) = tracker.track(&v, false);

        tracker.mark_pending_after_produce(id, "/tmp/first.obj");
        tracker.mark_pending_after_produce(id, "/tmp/second.obj");

        // Still tracked, still pending, rewrite counter restarted.
        assert_eq!(tracker.pending_sync(id), Some(true));
        assert_eq!(tracker.rewrites(id), Some(1));
        assert!(tracker.resident_for_backing("/tmp/first.obj").is_none());
        assert!(tracker.resident_for_backing("/tmp/second.obj").is_some());
    }

    #[test]
    fn reset_forgets_everything() {
        let tracker = tracker_with(CountingResolver::new());
        let v = Arc::new(RuntimeValue::Int(1));
        let (id, _) = tracker.track(&v, false);

        tracker.reset();
        assert!(!tracker.is_tracked(id));
        assert!(tracker.identity_of(&v).is_none());
    }

    #[test]
    fn stop_tracking_is_terminal() {
        let tracker = tracker_with(CountingResolver::new());
        let v = Arc::new(RuntimeValue::Int(1));
        let (id, _) = tracker.track(&v, false);

        tracker.stop_tracking(id);
        assert!(!tracker.is_tracked(id));

        let (new_id, _) = tracker.track(&v, false);
        assert_ne!(new_id, id);
    }
}

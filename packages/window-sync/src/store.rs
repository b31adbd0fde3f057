//! In-memory state store and the capability traits the sync agents need.
//!
//! A store holds four kinds of members, declared up front by whoever defines
//! the state shape:
//!
//! - **data fields**: plain JSON values, mirrored to every window
//! - **cache fields**: a [`RecencyCache`] keyed by numeric id, mirrored as a
//!   plain `{id: value}` map
//! - **local-only fields**: never leave the process
//! - **actions**: async handlers, invocable locally or from a secondary
//!
//! # Two write paths
//!
//! | Path                           | Notifies subscribers | Used by                       |
//! |--------------------------------|----------------------|-------------------------------|
//! | [`StateStore::set_local`]      | yes                  | local mutations and actions   |
//! | [`RemoteApply::apply_remote`]  | no                   | secondaries mirroring primary |
//!
//! Remote applies stay silent so a mirrored update is never mistaken for a
//! local change and echoed back.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, trace};

use crate::cache::RecencyCache;
use crate::error::{ActionError, SyncError};

/// The cache type carried by cache fields.
pub type CachedEntries = RecencyCache<u64, Value>;

/// Callback invoked with `(new, old)` after every local write.
pub type StateListener = Arc<dyn Fn(&StoreState, &StoreState) + Send + Sync>;

/// Type-erased action handler.
pub type ActionFn = Arc<dyn Fn(Store, Vec<Value>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

// =============================================================================
// State values
// =============================================================================

/// Value of one store field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Data(Value),
    Cache(CachedEntries),
}

impl FieldValue {
    pub fn as_data(&self) -> Option<&Value> {
        match self {
            FieldValue::Data(value) => Some(value),
            FieldValue::Cache(_) => None,
        }
    }

    pub fn as_cache(&self) -> Option<&CachedEntries> {
        match self {
            FieldValue::Cache(cache) => Some(cache),
            FieldValue::Data(_) => None,
        }
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        FieldValue::Data(value)
    }
}

impl From<CachedEntries> for FieldValue {
    fn from(cache: CachedEntries) -> Self {
        FieldValue::Cache(cache)
    }
}

/// Full state of a store, ordered by field name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreState {
    fields: BTreeMap<String, FieldValue>,
}

impl StoreState {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn data(&self, name: &str) -> Option<&Value> {
        self.get(name).and_then(FieldValue::as_data)
    }

    pub fn cache(&self, name: &str) -> Option<&CachedEntries> {
        self.get(name).and_then(FieldValue::as_cache)
    }

    pub fn cache_mut(&mut self, name: &str) -> Option<&mut CachedEntries> {
        match self.fields.get_mut(name) {
            Some(FieldValue::Cache(cache)) => Some(cache),
            _ => None,
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> + '_ {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Overwrite every field present in `patch`.
    pub fn merge(&mut self, patch: StatePatch) {
        self.fields.extend(patch.fields);
    }
}

/// A partial write: only the fields present are replaced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    fields: BTreeMap<String, FieldValue>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`StatePatch::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

// =============================================================================
// Schema
// =============================================================================

/// How a cache field is rebuilt on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheFieldSpec {
    /// Data field whose numeric value is the cache capacity, if any.
    pub capacity_hint: Option<String>,
}

/// Static split of a store's members into data, caches, local-only fields
/// and actions.
///
/// Built once by [`StoreBuilder`] and immutable for the store's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSchema {
    data: BTreeSet<String>,
    local_only: BTreeSet<String>,
    caches: BTreeMap<String, CacheFieldSpec>,
    actions: BTreeSet<String>,
}

impl StateSchema {
    pub fn is_action(&self, name: &str) -> bool {
        self.actions.contains(name)
    }

    pub fn is_local_only(&self, name: &str) -> bool {
        self.local_only.contains(name)
    }

    /// False for actions and local-only fields.
    pub fn is_synced(&self, name: &str) -> bool {
        !self.is_action(name) && !self.is_local_only(name)
    }

    pub fn cache_spec(&self, name: &str) -> Option<&CacheFieldSpec> {
        self.caches.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.data.contains(name) || self.local_only.contains(name) || self.caches.contains_key(name)
    }

    pub fn actions(&self) -> impl Iterator<Item = &str> + '_ {
        self.actions.iter().map(String::as_str)
    }

    fn declared(&self, name: &str) -> bool {
        self.has_field(name) || self.is_action(name)
    }
}

// =============================================================================
// Capability traits
// =============================================================================

/// Read access, change notification and the local write path.
pub trait StateStore: Send + Sync + 'static {
    fn schema(&self) -> Arc<StateSchema>;

    /// Current state. Cheap: the returned `Arc` is shared until the next write.
    fn state(&self) -> Arc<StoreState>;

    /// Register a `(new, old)` listener for local writes.
    fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StoreState, &StoreState) + Send + Sync + 'static;

    /// Write `patch` and notify subscribers.
    fn set_local(&self, patch: StatePatch);
}

/// Silent write path used by secondaries.
pub trait RemoteApply: StateStore {
    /// Write `patch` without notifying subscribers.
    fn apply_remote(&self, patch: StatePatch);
}

/// Action execution on the primary.
#[async_trait]
pub trait ActionHost: StateStore {
    async fn invoke(&self, action: &str, args: Vec<Value>) -> Result<(), ActionError>;
}

/// Handle returned by [`StateStore::subscribe`].
///
/// The listener is removed by [`Subscription::unsubscribe`] or on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

// =============================================================================
// Store
// =============================================================================

/// In-memory store. Cloning yields another handle to the same state.
///
/// # Example
///
/// ```ignore
/// let store = Store::builder()
///     .field("volume", json!(1.0))
///     .field("windowSize", json!(50))
///     .cache_field_with_hint("cachedSongs", NonZeroUsize::new(50).unwrap(), "windowSize")
///     .local_field("outputDevice", json!(null))
///     .action("setVolume", |store, args| async move {
///         store.set_local(StatePatch::new().with("volume", args[0].clone()));
///         Ok(())
///     })
///     .build()?;
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    schema: Arc<StateSchema>,
    state: Mutex<Arc<StoreState>>,
    subscribers: DashMap<u64, StateListener>,
    next_subscriber: AtomicU64,
    actions: BTreeMap<String, ActionFn>,
}

impl Store {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    /// Run a local transition through a closure and notify subscribers.
    pub fn mutate<F>(&self, transition: F)
    where
        F: FnOnce(&mut StoreState),
    {
        let (old, new) = self.write(transition);
        self.notify(&new, &old);
    }

    /// Convenience read of one data field.
    pub fn data(&self, name: &str) -> Option<Value> {
        self.state().data(name).cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Recover the state lock even if a writer panicked mid-transition.
    fn lock_state(&self) -> MutexGuard<'_, Arc<StoreState>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write<F>(&self, transition: F) -> (Arc<StoreState>, Arc<StoreState>)
    where
        F: FnOnce(&mut StoreState),
    {
        let mut guard = self.lock_state();
        let old = Arc::clone(&guard);
        let mut next = StoreState::clone(&old);
        transition(&mut next);
        let new = Arc::new(next);
        *guard = Arc::clone(&new);
        (old, new)
    }

    fn notify(&self, new: &StoreState, old: &StoreState) {
        // Snapshot the listeners so none runs while a map shard is locked.
        let listeners: Vec<StateListener> = self
            .inner
            .subscribers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        trace!(listeners = listeners.len(), "notifying store subscribers");
        for listener in listeners {
            listener(new, old);
        }
    }
}

impl StateStore for Store {
    fn schema(&self) -> Arc<StateSchema> {
        Arc::clone(&self.inner.schema)
    }

    fn state(&self) -> Arc<StoreState> {
        Arc::clone(&self.lock_state())
    }

    fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StoreState, &StoreState) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.insert(id, Arc::new(listener));

        let inner: Weak<StoreInner> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.subscribers.remove(&id);
            }
        })
    }

    fn set_local(&self, patch: StatePatch) {
        trace!(fields = patch.len(), "local write");
        self.mutate(|state| state.merge(patch));
    }
}

impl RemoteApply for Store {
    fn apply_remote(&self, patch: StatePatch) {
        trace!(fields = patch.len(), "remote apply");
        self.write(|state| state.merge(patch));
    }
}

#[async_trait]
impl ActionHost for Store {
    async fn invoke(&self, action: &str, args: Vec<Value>) -> Result<(), ActionError> {
        let Some(handler) = self.inner.actions.get(action).cloned() else {
            return Err(if self.inner.schema.has_field(action) {
                ActionError::NotCallable(action.to_string())
            } else {
                ActionError::NotFound(action.to_string())
            });
        };

        debug!(action, args = args.len(), "invoking store action");
        handler(self.clone(), args).await.map_err(ActionError::Failed)
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("schema", &self.inner.schema)
            .field("subscriber_count", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Declares the shape of a [`Store`].
#[derive(Default)]
pub struct StoreBuilder {
    schema: StateSchema,
    state: StoreState,
    actions: BTreeMap<String, ActionFn>,
    duplicate: Option<String>,
}

impl StoreBuilder {
    /// A mirrored data field with its initial value.
    pub fn field(mut self, name: impl Into<String>, initial: Value) -> Self {
        let name = name.into();
        if self.claim(&name) {
            self.schema.data.insert(name.clone());
            self.state.set(name, initial);
        }
        self
    }

    /// A field that is never included in snapshots.
    pub fn local_field(mut self, name: impl Into<String>, initial: Value) -> Self {
        let name = name.into();
        if self.claim(&name) {
            self.schema.local_only.insert(name.clone());
            self.state.set(name, initial);
        }
        self
    }

    /// An empty recency cache field.
    pub fn cache_field(self, name: impl Into<String>, capacity: NonZeroUsize) -> Self {
        self.declare_cache(name.into(), capacity, None)
    }

    /// A cache field whose capacity is mirrored through the data field `hint`.
    pub fn cache_field_with_hint(
        self,
        name: impl Into<String>,
        capacity: NonZeroUsize,
        hint: impl Into<String>,
    ) -> Self {
        self.declare_cache(name.into(), capacity, Some(hint.into()))
    }

    /// An action callable locally and from secondaries.
    pub fn action<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Store, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        if self.claim(&name) {
            self.schema.actions.insert(name.clone());
            let handler: ActionFn = Arc::new(move |store: Store, args: Vec<Value>| handler(store, args).boxed());
            self.actions.insert(name, handler);
        }
        self
    }

    pub fn build(self) -> Result<Store, SyncError> {
        if let Some(name) = self.duplicate {
            return Err(SyncError::DuplicateField { name });
        }

        Ok(Store {
            inner: Arc::new(StoreInner {
                schema: Arc::new(self.schema),
                state: Mutex::new(Arc::new(self.state)),
                subscribers: DashMap::new(),
                next_subscriber: AtomicU64::new(0),
                actions: self.actions,
            }),
        })
    }

    fn declare_cache(mut self, name: String, capacity: NonZeroUsize, hint: Option<String>) -> Self {
        if self.claim(&name) {
            self.schema
                .caches
                .insert(name.clone(), CacheFieldSpec { capacity_hint: hint });
            self.state.set(name, CachedEntries::new(capacity));
        }
        self
    }

    /// Returns false (and remembers the name) if it was already declared.
    fn claim(&mut self, name: &str) -> bool {
        if self.schema.declared(name) {
            self.duplicate.get_or_insert_with(|| name.to_string());
            return false;
        }
        true
    }
}

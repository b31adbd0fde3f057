//! Secondary windows: read-only mirrors of the primary.
//!
//! A secondary never writes its store directly. It:
//! 1. Requests the primary's state once at startup (`state-request`)
//! 2. Applies `state-update` broadcasts and the one `state-response` through
//!    the store's silent [`RemoteApply`] path
//! 3. Forwards intents to the primary with [`RemoteAction`]
//!
//! # Apply state machine
//!
//! ```text
//! Idle ──apply──► Applying ──done, nothing pending──► Idle
//!                    ▲   │
//!                    └───┘ done, pending snapshot exists
//! ```
//!
//! While `Applying`, incoming snapshots replace the single pending slot
//! instead of queueing, so only the newest state is applied under load and
//! nothing is lost.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::bus::{EventBus, Listener};
use crate::error::SyncError;
use crate::protocol::{
    ActionRequest, ActionResponse, Channel, Channels, CorrelationId, HydrationResponse, StateSnapshot,
    SyncConfig,
};
use crate::snapshot::SnapshotCodec;
use crate::store::RemoteApply;

/// What happened to a snapshot handed to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Written to the store (possibly after pending snapshots were drained).
    Applied,
    /// Identical to the current projection; nothing written.
    Unchanged,
    /// Another apply is in progress; stored as the pending snapshot.
    Deferred,
    /// A hydration response arrived after the mirror was already hydrated.
    Ignored,
}

// =============================================================================
// Mirror
// =============================================================================

/// Per-agent apply state: re-entrancy guard, pending slot and hydration flag.
pub struct Mirror<S> {
    store: S,
    codec: SnapshotCodec,
    gate: Mutex<ApplyGate>,
}

/// Everything the apply path decides on, behind one lock so the
/// hydration check and the apply/defer decision are a single step.
#[derive(Default)]
struct ApplyGate {
    applying: bool,
    pending: Option<StateSnapshot>,
    hydrated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Live,
    Hydration,
}

impl<S: RemoteApply> Mirror<S> {
    pub fn new(store: S, codec: SnapshotCodec) -> Self {
        Self {
            store,
            codec,
            gate: Mutex::new(ApplyGate::default()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Apply a live `state-update` snapshot.
    ///
    /// Live state is canonical, so it also completes hydration: a
    /// `state-response` arriving afterwards is ignored.
    pub fn apply_update(&self, snapshot: StateSnapshot) -> ApplyOutcome {
        self.apply(snapshot, Source::Live)
    }

    /// Apply the one-shot hydration snapshot, unless already hydrated.
    pub fn apply_hydration(&self, snapshot: StateSnapshot) -> ApplyOutcome {
        self.apply(snapshot, Source::Hydration)
    }

    pub fn is_hydrated(&self) -> bool {
        self.lock_gate().hydrated
    }

    pub fn is_applying(&self) -> bool {
        self.lock_gate().applying
    }

    /// Forget hydration and any pending snapshot.
    pub fn reset(&self) {
        let mut gate = self.lock_gate();
        gate.hydrated = false;
        gate.pending = None;
    }

    fn apply(&self, snapshot: StateSnapshot, source: Source) -> ApplyOutcome {
        {
            let mut gate = self.lock_gate();
            if source == Source::Hydration && gate.hydrated {
                debug!("ignoring state response, already hydrated");
                return ApplyOutcome::Ignored;
            }
            gate.hydrated = true;
            if gate.applying {
                trace!("apply in progress, replacing pending snapshot");
                gate.pending = Some(snapshot);
                return ApplyOutcome::Deferred;
            }
            gate.applying = true;
        }

        let mut flag = ApplyingFlag {
            gate: &self.gate,
            armed: true,
        };
        let mut outcome = ApplyOutcome::Unchanged;
        let mut snapshot = snapshot;

        loop {
            let current = self.store.state();
            if self.codec.project(&current) != snapshot {
                let patch = self.codec.restore(&snapshot, &current);
                trace!(fields = patch.len(), "applying snapshot");
                self.store.apply_remote(patch);
                outcome = ApplyOutcome::Applied;
            }

            let mut gate = self.lock_gate();
            match gate.pending.take() {
                Some(next) => snapshot = next,
                None => {
                    gate.applying = false;
                    flag.armed = false;
                    return outcome;
                }
            }
        }
    }

    fn lock_gate(&self) -> MutexGuard<'_, ApplyGate> {
        lock_gate(&self.gate)
    }
}

fn lock_gate(gate: &Mutex<ApplyGate>) -> MutexGuard<'_, ApplyGate> {
    gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Returns the gate to `Idle` if a store write panics mid-apply.
struct ApplyingFlag<'a> {
    gate: &'a Mutex<ApplyGate>,
    armed: bool,
}

impl Drop for ApplyingFlag<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock_gate(self.gate).applying = false;
        }
    }
}

// =============================================================================
// Agent
// =============================================================================

/// Builder for the secondary side of synchronization.
///
/// # Example
///
/// ```ignore
/// let handle = SecondaryAgent::new(store.clone(), bus.clone())
///     .with_channels(Channels::namespaced("player"))
///     .attach();
///
/// let play = handle.remote_action("play");
/// play.call(vec![]).await?;
/// ```
pub struct SecondaryAgent<S> {
    store: S,
    bus: EventBus,
    config: SyncConfig,
    channels: Channels,
}

impl<S: RemoteApply> SecondaryAgent<S> {
    pub fn new(store: S, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            config: SyncConfig::default(),
            channels: Channels::new(),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_channels(mut self, channels: Channels) -> Self {
        self.channels = channels;
        self
    }

    /// Open the update listeners, then request hydration once.
    ///
    /// Must be called inside a tokio runtime.
    pub fn attach(self) -> SecondaryHandle<S> {
        let SecondaryAgent {
            store,
            bus,
            config,
            channels,
        } = self;
        let codec = SnapshotCodec::for_store(&store, &config);
        let mirror = Arc::new(Mirror::new(store, codec));

        let updates = {
            let mirror = Arc::clone(&mirror);
            bus.listen(&channels.name(Channel::StateUpdate), move |payload| {
                match serde_json::from_value::<StateSnapshot>(payload) {
                    Ok(snapshot) => {
                        let outcome = mirror.apply_update(snapshot);
                        trace!(?outcome, "state update");
                    }
                    Err(e) => warn!(error = %e, "ignoring malformed state update"),
                }
                async {}
            })
        };

        let hydration = {
            let mirror = Arc::clone(&mirror);
            bus.listen(&channels.name(Channel::StateResponse), move |payload| {
                match serde_json::from_value::<HydrationResponse>(payload) {
                    Ok(response) => {
                        let outcome = mirror.apply_hydration(response.state);
                        debug!(?outcome, "state response");
                    }
                    Err(e) => warn!(error = %e, "ignoring malformed state response"),
                }
                async {}
            })
        };

        let handle = SecondaryHandle {
            mirror,
            listeners: vec![updates, hydration],
            bus,
            config,
            channels,
        };
        handle.request_hydration();
        info!("secondary window sync attached");
        handle
    }
}

/// Keeps a secondary attached. Dropping it detaches.
#[must_use = "dropping a SecondaryHandle detaches the secondary immediately"]
pub struct SecondaryHandle<S> {
    mirror: Arc<Mirror<S>>,
    listeners: Vec<Listener>,
    bus: EventBus,
    config: SyncConfig,
    channels: Channels,
}

impl<S: RemoteApply> SecondaryHandle<S> {
    pub fn mirror(&self) -> &Mirror<S> {
        &self.mirror
    }

    /// Apply a snapshot as if it had arrived on `state-update`.
    pub fn apply_update(&self, snapshot: StateSnapshot) -> ApplyOutcome {
        self.mirror.apply_update(snapshot)
    }

    pub fn is_hydrated(&self) -> bool {
        self.mirror.is_hydrated()
    }

    /// Clear the hydration flag and pending snapshot. Call
    /// [`SecondaryHandle::request_hydration`] afterwards to hydrate again.
    pub fn reset(&self) {
        self.mirror.reset();
    }

    /// Emit `state-request`. Failures are logged; the next broadcast
    /// supersedes a lost request.
    pub fn request_hydration(&self) {
        match self.bus.emit(&self.channels.name(Channel::StateRequest), &()) {
            Ok(receivers) => debug!(receivers, "requested state from primary"),
            Err(e) => error!(error = %e, "failed to request state from primary"),
        }
    }

    /// Proxy for the primary's action `name`.
    pub fn remote_action(&self, name: &str) -> RemoteAction {
        RemoteAction::new(name, self.bus.clone(), &self.channels, &self.config)
    }

    pub fn detach(self) {
        drop(self);
    }
}

impl<S> Drop for SecondaryHandle<S> {
    fn drop(&mut self) {
        self.listeners.clear();
        debug!("secondary window sync detached");
    }
}

// =============================================================================
// Remote actions
// =============================================================================

/// Invokes an action on the primary and waits for its correlated response.
///
/// Each call mints a fresh [`CorrelationId`]. No retries: after a timeout the
/// caller decides whether to call again.
#[derive(Clone)]
pub struct RemoteAction {
    name: Arc<str>,
    bus: EventBus,
    request_channel: String,
    response_channel: String,
    timeout: Duration,
}

impl RemoteAction {
    pub fn new(name: &str, bus: EventBus, channels: &Channels, config: &SyncConfig) -> Self {
        Self {
            name: Arc::from(name),
            bus,
            request_channel: channels.name(Channel::ActionRequest),
            response_channel: channels.name(Channel::ActionResponse),
            timeout: config.action_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send the request with `args` and wait for the outcome.
    pub async fn call(&self, args: Vec<Value>) -> Result<(), SyncError> {
        let id = CorrelationId::new();

        // Subscribe before emitting so a fast response cannot be missed.
        let mut responses = self.bus.subscribe_channel(&self.response_channel);

        let request = ActionRequest {
            id,
            action: self.name.to_string(),
            args,
        };
        if let Err(e) = self.bus.emit(&self.request_channel, &request) {
            error!(%id, action = %self.name, error = %e, "failed to send remote action");
            return Err(e);
        }
        debug!(%id, action = %self.name, "sent remote action");

        let wait = async {
            loop {
                let payload = responses.recv().await?;
                let response: ActionResponse = match serde_json::from_value(payload) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "ignoring malformed action response");
                        continue;
                    }
                };
                if response.id != id {
                    continue;
                }

                return if response.success {
                    Ok(())
                } else {
                    Err(SyncError::ActionFailed {
                        action: self.name.to_string(),
                        message: response
                            .error
                            .unwrap_or_else(|| "unknown error".to_string()),
                    })
                };
            }
        };

        match tokio::time::timeout(self.timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    %id,
                    action = %self.name,
                    timeout = ?self.timeout,
                    "remote action timed out"
                );
                Err(SyncError::ActionTimeout {
                    action: self.name.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Like [`RemoteAction::call`] with typed arguments.
    ///
    /// A tuple or array becomes the argument list, `()` means no arguments,
    /// and any other value is passed as the single argument.
    pub async fn call_with<A: Serialize>(&self, args: A) -> Result<(), SyncError> {
        let args = match serde_json::to_value(args)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            single => vec![single],
        };
        self.call(args).await
    }
}

impl std::fmt::Debug for RemoteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteAction")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StatePatch, StateStore, Store, Subscription};
    use serde_json::json;
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mirror_store() -> Store {
        Store::builder()
            .field("volume", json!(1.0))
            .field("track", json!(null))
            .field("windowSize", json!(4))
            .cache_field_with_hint("cachedSongs", NonZeroUsize::new(4).unwrap(), "windowSize")
            .build()
            .unwrap()
    }

    fn snapshot(value: Value) -> StateSnapshot {
        serde_json::from_value(value).unwrap()
    }

    fn mirror(store: &Store) -> Mirror<Store> {
        Mirror::new(store.clone(), SnapshotCodec::for_store(store, &SyncConfig::default()))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    /// Store wrapper that runs a hook from inside `apply_remote`, standing in
    /// for a snapshot that arrives while a write is in flight.
    #[derive(Clone)]
    struct HookedStore {
        inner: Store,
        applied: Arc<Mutex<Vec<StatePatch>>>,
        hook: Arc<Mutex<Option<Box<dyn FnMut() + Send>>>>,
    }

    impl HookedStore {
        fn new(inner: Store) -> Self {
            Self {
                inner,
                applied: Arc::new(Mutex::new(Vec::new())),
                hook: Arc::new(Mutex::new(None)),
            }
        }
    }

    impl StateStore for HookedStore {
        fn schema(&self) -> Arc<crate::store::StateSchema> {
            self.inner.schema()
        }

        fn state(&self) -> Arc<crate::store::StoreState> {
            self.inner.state()
        }

        fn subscribe<F>(&self, listener: F) -> Subscription
        where
            F: Fn(&crate::store::StoreState, &crate::store::StoreState) + Send + Sync + 'static,
        {
            self.inner.subscribe(listener)
        }

        fn set_local(&self, patch: StatePatch) {
            self.inner.set_local(patch);
        }
    }

    impl RemoteApply for HookedStore {
        fn apply_remote(&self, patch: StatePatch) {
            self.applied.lock().unwrap().push(patch.clone());
            self.inner.apply_remote(patch);
            let hook = self.hook.lock().unwrap().take();
            if let Some(mut hook) = hook {
                hook();
            }
        }
    }

    #[test]
    fn test_identical_snapshot_is_noop_second_time() {
        let store = mirror_store();
        let mirror = mirror(&store);
        let update = snapshot(json!({ "volume": 0.4, "track": "a", "windowSize": 4, "cachedSongs": {} }));

        assert_eq!(mirror.apply_update(update.clone()), ApplyOutcome::Applied);
        assert_eq!(mirror.apply_update(update), ApplyOutcome::Unchanged);
        assert_eq!(store.data("volume"), Some(json!(0.4)));
    }

    #[test]
    fn test_remote_apply_does_not_notify_local_subscribers() {
        let store = mirror_store();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let _sub = store.subscribe(move |_, _| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        mirror(&store).apply_update(snapshot(json!({ "volume": 0.2 })));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.data("volume"), Some(json!(0.2)));
    }

    #[test]
    fn test_snapshots_arriving_mid_apply_coalesce_to_latest() {
        let hooked = HookedStore::new(mirror_store());
        let mirror = Arc::new(Mirror::new(
            hooked.clone(),
            SnapshotCodec::for_store(&hooked, &SyncConfig::default()),
        ));

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        {
            let mirror = Arc::clone(&mirror);
            let outcomes = outcomes.clone();
            *hooked.hook.lock().unwrap() = Some(Box::new(move || {
                for volume in 2..=6 {
                    let outcome = mirror.apply_update(snapshot(json!({ "volume": volume })));
                    outcomes.lock().unwrap().push(outcome);
                }
            }));
        }

        let outcome = mirror.apply_update(snapshot(json!({ "volume": 1 })));

        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(*outcomes.lock().unwrap(), vec![ApplyOutcome::Deferred; 5]);

        // The first write, then only the last of the five deferred snapshots.
        let applied = hooked.applied.lock().unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[1].get("volume").and_then(|v| v.as_data()), Some(&json!(6)));
        assert_eq!(hooked.inner.data("volume"), Some(json!(6)));
        assert!(!mirror.is_applying());
    }

    #[test]
    fn test_hydration_applies_once() {
        let store = mirror_store();
        let mirror = mirror(&store);

        let first = snapshot(json!({ "volume": 0.3 }));
        let second = snapshot(json!({ "volume": 0.9 }));

        assert_eq!(mirror.apply_hydration(first), ApplyOutcome::Applied);
        assert_eq!(mirror.apply_hydration(second), ApplyOutcome::Ignored);
        assert_eq!(store.data("volume"), Some(json!(0.3)));
    }

    #[test]
    fn test_live_update_blocks_later_hydration() {
        let store = mirror_store();
        let mirror = mirror(&store);

        mirror.apply_update(snapshot(json!({ "volume": 0.7 })));
        assert!(mirror.is_hydrated());

        let stale = snapshot(json!({ "volume": 0.1 }));
        assert_eq!(mirror.apply_hydration(stale), ApplyOutcome::Ignored);
        assert_eq!(store.data("volume"), Some(json!(0.7)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hydration_racing_live_update_never_wins() {
        for trial in 0..200 {
            let store = mirror_store();
            let shared = Arc::new(mirror(&store));
            let start = Arc::new(tokio::sync::Barrier::new(2));

            let hydration = {
                let mirror = Arc::clone(&shared);
                let start = Arc::clone(&start);
                tokio::spawn(async move {
                    start.wait().await;
                    mirror.apply_hydration(snapshot(json!({ "volume": 0.1 })))
                })
            };
            let live = {
                let mirror = Arc::clone(&shared);
                let start = Arc::clone(&start);
                tokio::spawn(async move {
                    start.wait().await;
                    mirror.apply_update(snapshot(json!({ "volume": 0.9 })))
                })
            };
            hydration.await.unwrap();
            live.await.unwrap();

            assert_eq!(store.data("volume"), Some(json!(0.9)), "trial {trial}");
            assert!(!shared.is_applying());
        }
    }

    #[test]
    fn test_reset_allows_hydration_again() {
        let store = mirror_store();
        let mirror = mirror(&store);

        mirror.apply_hydration(snapshot(json!({ "volume": 0.3 })));
        mirror.reset();
        assert!(!mirror.is_hydrated());

        assert_eq!(
            mirror.apply_hydration(snapshot(json!({ "volume": 0.6 }))),
            ApplyOutcome::Applied
        );
        assert_eq!(store.data("volume"), Some(json!(0.6)));
    }

    #[test]
    fn test_cache_field_rebuilt_with_incoming_capacity() {
        let store = mirror_store();
        let mirror = mirror(&store);

        mirror.apply_update(snapshot(json!({
            "windowSize": 2,
            "cachedSongs": { "5": "e", "1": "a", "3": "c" }
        })));

        let state = store.state();
        let cache = state.cache("cachedSongs").unwrap();
        assert_eq!(cache.capacity().get(), 2);
        assert_eq!(cache.keys().copied().collect::<Vec<_>>(), vec![3, 5]);
    }

    #[test]
    fn test_malformed_cache_does_not_break_apply() {
        let store = mirror_store();
        let mirror = mirror(&store);

        let outcome = mirror.apply_update(snapshot(json!({
            "volume": 0.5,
            "cachedSongs": "corrupted"
        })));

        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(store.data("volume"), Some(json!(0.5)));
        assert!(store.state().cache("cachedSongs").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attach_requests_state_once() {
        let bus = EventBus::new();
        let mut requests = bus.subscribe_channel("state-request");
        let _handle = SecondaryAgent::new(mirror_store(), bus.clone()).attach();

        assert_eq!(requests.recv().await.unwrap(), Value::Null);
        let next = tokio::time::timeout(Duration::from_millis(50), requests.recv()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn test_listeners_apply_bus_traffic() {
        let store = mirror_store();
        let bus = EventBus::new();
        let handle = SecondaryAgent::new(store.clone(), bus.clone()).attach();

        bus.emit("state-response", &json!({ "state": { "volume": 0.25 } }))
            .unwrap();
        settle().await;
        assert!(handle.is_hydrated());
        assert_eq!(store.data("volume"), Some(json!(0.25)));

        bus.emit("state-update", &json!({ "volume": 0.75, "track": "b" }))
            .unwrap();
        bus.emit("state-update", &json!("not a snapshot")).unwrap();
        settle().await;
        assert_eq!(store.data("volume"), Some(json!(0.75)));
        assert_eq!(store.data("track"), Some(json!("b")));
    }

    #[tokio::test]
    async fn test_detach_stops_mirroring() {
        let store = mirror_store();
        let bus = EventBus::new();
        let handle = SecondaryAgent::new(store.clone(), bus.clone()).attach();
        handle.detach();

        bus.emit("state-update", &json!({ "volume": 0.0 })).unwrap();
        settle().await;
        assert_eq!(store.data("volume"), Some(json!(1.0)));
    }

    /// Minimal stand-in for the primary's action listener.
    fn respond_with(bus: &EventBus, reply: fn(&ActionRequest) -> Option<ActionResponse>) -> Listener {
        let responder = bus.clone();
        bus.listen("action-request", move |payload| {
            let request: ActionRequest = serde_json::from_value(payload).unwrap();
            if let Some(response) = reply(&request) {
                responder.emit("action-response", &response).unwrap();
            }
            async {}
        })
    }

    #[tokio::test]
    async fn test_remote_action_success() {
        let bus = EventBus::new();
        let _primary = respond_with(&bus, |request| {
            assert_eq!(request.action, "seek");
            assert_eq!(request.args, vec![json!(12.5)]);
            Some(ActionResponse::succeeded(request.id))
        });

        let handle = SecondaryAgent::new(mirror_store(), bus.clone()).attach();
        let seek = handle.remote_action("seek");

        seek.call(vec![json!(12.5)]).await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_action_failure_carries_message() {
        let bus = EventBus::new();
        let _primary = respond_with(&bus, |request| {
            Some(ActionResponse::failed(request.id, "queue is empty"))
        });

        let action = RemoteAction::new("skip", bus.clone(), &Channels::new(), &SyncConfig::default());
        let err = action.call(vec![]).await.unwrap_err();

        match err {
            SyncError::ActionFailed { action, message } => {
                assert_eq!(action, "skip");
                assert_eq!(message, "queue is empty");
            }
            other => panic!("expected ActionFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remote_action_failure_without_message() {
        let bus = EventBus::new();
        let _primary = respond_with(&bus, |request| {
            Some(ActionResponse {
                id: request.id,
                success: false,
                error: None,
            })
        });

        let action = RemoteAction::new("skip", bus.clone(), &Channels::new(), &SyncConfig::default());
        let err = action.call(vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "action skip failed: unknown error");
    }

    #[tokio::test]
    async fn test_remote_action_ignores_other_correlation_ids() {
        let bus = EventBus::new();
        let _primary = respond_with(&bus, |request| Some(ActionResponse::succeeded(request.id)));
        let noise = bus.clone();
        let _noise = bus.listen("action-request", move |_payload| {
            noise
                .emit("action-response", &ActionResponse::failed(CorrelationId::new(), "not yours"))
                .unwrap();
            async {}
        });

        let action = RemoteAction::new("play", bus.clone(), &Channels::new(), &SyncConfig::default());
        action.call(vec![]).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_action_times_out() {
        let bus = EventBus::new();
        let _primary = respond_with(&bus, |_request| None);

        let action = RemoteAction::new("play", bus.clone(), &Channels::new(), &SyncConfig::default());
        let started = tokio::time::Instant::now();
        let err = action.call(vec![]).await.unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "action play timed out after 30000ms");
        assert!(started.elapsed() >= Duration::from_secs(30));
        // The response receiver is released with the call.
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_call_with_typed_args() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let responder = bus.clone();
        let _primary = bus.listen("action-request", move |payload| {
            let request: ActionRequest = serde_json::from_value(payload).unwrap();
            seen_clone.lock().unwrap().push(request.args.clone());
            responder
                .emit("action-response", &ActionResponse::succeeded(request.id))
                .unwrap();
            async {}
        });

        let action = RemoteAction::new("playAt", bus.clone(), &Channels::new(), &SyncConfig::default());
        action.call_with((3, "queue")).await.unwrap();
        action.call_with(()).await.unwrap();
        action.call_with(0.5).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], vec![json!(3), json!("queue")]);
        assert!(seen[1].is_empty());
        assert_eq!(seen[2], vec![json!(0.5)]);
    }
}

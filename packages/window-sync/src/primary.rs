//! Primary window: the single source of truth.
//!
//! The primary agent:
//! 1. Watches local writes and broadcasts the new projection on
//!    `state-update`, throttled (leading + trailing)
//! 2. Answers `state-request` immediately with the current projection,
//!    bypassing the throttle
//! 3. Runs `action-request`s against the store and reports the outcome on
//!    `action-response`
//!
//! Nothing that goes wrong in here propagates to a secondary as a panic or an
//! `anyhow::Error`; failures become an [`ActionResponse`] or a log line.

use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::bus::{EventBus, Listener};
use crate::protocol::{
    ActionRequest, ActionResponse, Channel, Channels, HydrationResponse, StateSnapshot, SyncConfig,
};
use crate::snapshot::SnapshotCodec;
use crate::store::{ActionHost, StateStore, Subscription};
use crate::throttle::Throttle;

/// Builder for the primary side of synchronization.
///
/// # Example
///
/// ```ignore
/// let handle = PrimaryAgent::new(store.clone(), bus.clone())
///     .with_channels(Channels::namespaced("player"))
///     .attach();
///
/// // ... later, on window close
/// handle.detach();
/// ```
pub struct PrimaryAgent<S> {
    store: S,
    bus: EventBus,
    config: SyncConfig,
    channels: Channels,
}

impl<S> PrimaryAgent<S>
where
    S: StateStore + ActionHost + Clone,
{
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

    /// Subscribe to the store and open the request listeners.
    ///
    /// Must be called inside a tokio runtime.
    pub fn attach(self) -> PrimaryHandle {
        let PrimaryAgent {
            store,
            bus,
            config,
            channels,
        } = self;
        let codec = SnapshotCodec::for_store(&store, &config);

        // The throttle only signals a change; each broadcast projects the
        // store as it is when it fires.
        let throttle = {
            let store = store.clone();
            let codec = codec.clone();
            let bus = bus.clone();
            let channel = channels.name(Channel::StateUpdate);
            let last_sent: Mutex<Option<StateSnapshot>> = Mutex::new(None);
            Throttle::new(config.throttle_interval, move |()| {
                // Held across project + emit so sends leave in projection order.
                let mut last_sent = last_sent
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let snapshot = codec.project(&store.state());
                if last_sent.as_ref() == Some(&snapshot) {
                    trace!("projection unchanged since last broadcast");
                    return;
                }
                match bus.emit(&channel, &snapshot) {
                    Ok(receivers) => {
                        debug!(receivers, fields = snapshot.len(), "broadcast state update");
                        *last_sent = Some(snapshot);
                    }
                    Err(e) => error!(error = %e, "failed to broadcast state update"),
                }
            })
        };

        let subscription = {
            let codec = codec.clone();
            let throttle = throttle.clone();
            store.subscribe(move |new, old| {
                if codec.project(new) != codec.project(old) {
                    throttle.call(());
                }
            })
        };

        let hydration = {
            let store = store.clone();
            let codec = codec.clone();
            let bus = bus.clone();
            let channel = channels.name(Channel::StateResponse);
            bus.clone()
                .listen(&channels.name(Channel::StateRequest), move |_payload| {
                    let response = HydrationResponse {
                        state: codec.project(&store.state()),
                    };
                    match bus.emit(&channel, &response) {
                        Ok(receivers) => debug!(receivers, "answered state request"),
                        Err(e) => error!(error = %e, "failed to answer state request"),
                    }
                    async {}
                })
        };

        let actions = {
            let store = store.clone();
            let bus = bus.clone();
            let channel = channels.name(Channel::ActionResponse);
            bus.clone()
                .listen(&channels.name(Channel::ActionRequest), move |payload| {
                    let store = store.clone();
                    let bus = bus.clone();
                    let channel = channel.clone();
                    async move {
                        match serde_json::from_value::<ActionRequest>(payload) {
                            // One task per request so a slow action never
                            // holds up the ones behind it.
                            Ok(request) => {
                                tokio::spawn(execute_action(store, bus, channel, request));
                            }
                            Err(e) => warn!(error = %e, "ignoring malformed action request"),
                        }
                    }
                })
        };

        info!(
            actions = codec.schema().actions().count(),
            "primary window sync attached"
        );

        PrimaryHandle {
            subscription: Some(subscription),
            listeners: vec![hydration, actions],
            throttle,
        }
    }
}

/// Run one requested action and emit its [`ActionResponse`].
async fn execute_action<S>(store: S, bus: EventBus, channel: String, request: ActionRequest)
where
    S: ActionHost,
{
    let ActionRequest { id, action, args } = request;
    debug!(%id, action = %action, "executing remote action");

    let outcome = AssertUnwindSafe(invoke(&store, &action, args))
        .catch_unwind()
        .await;

    let response = match outcome {
        Ok(Ok(())) => ActionResponse::succeeded(id),
        Ok(Err(message)) => {
            error!(%id, action = %action, error = %message, "remote action failed");
            ActionResponse::failed(id, message)
        }
        Err(panic_info) => {
            let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            error!(%id, action = %action, panic = %panic_msg, "remote action panicked");
            ActionResponse::failed(id, format!("action {action} panicked: {panic_msg}"))
        }
    };

    if let Err(e) = bus.emit(&channel, &response) {
        error!(%id, action = %action, error = %e, "failed to send action response");
    }
}

async fn invoke<S: ActionHost>(store: &S, action: &str, args: Vec<Value>) -> Result<(), String> {
    store.invoke(action, args).await.map_err(|e| e.to_string())
}

/// Keeps the primary attached. Dropping it detaches.
#[must_use = "dropping a PrimaryHandle detaches the primary immediately"]
pub struct PrimaryHandle {
    subscription: Option<Subscription>,
    listeners: Vec<Listener>,
    throttle: Throttle<()>,
}

impl PrimaryHandle {
    /// Release the store subscription and listeners, and drop any pending
    /// trailing broadcast. Actions already running are not cancelled.
    pub fn detach(self) {
        drop(self);
    }
}

impl Drop for PrimaryHandle {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.listeners.clear();
        self.throttle.cancel();
        debug!("primary window sync detached");
    }
}

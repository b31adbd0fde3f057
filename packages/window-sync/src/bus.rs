//! Named-channel event bus carrying JSON payloads.
//!
//! # Guarantees
//!
//! - **Best-effort delivery**: lagging receivers skip messages (logged)
//! - **Per-channel order**: one listener sees a channel's messages in emission order
//! - **No cross-channel order**: each listener runs on its own task
//! - **No replay**: listeners only see messages emitted after they registered
//!
//! Payloads are always `serde_json::Value`, so whatever crosses this bus can
//! also cross a process boundary through a [`Bridge`](crate::Bridge).

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::SyncError;

/// Default channel capacity for the event bus.
const DEFAULT_CAPACITY: usize = 1024;

/// One message on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub channel: Arc<str>,
    pub payload: Value,
    /// Bridge that injected this message, `None` if emitted locally.
    pub via: Option<Uuid>,
}

/// Broadcast bus shared by every participant in one process.
///
/// Cloning yields another handle to the same channel.
///
/// # Example
///
/// ```ignore
/// let bus = EventBus::new();
///
/// let _listener = bus.listen("state-request", |_payload| async move {
///     tracing::info!("hydration requested");
/// });
///
/// bus.emit("state-request", &())?;
/// ```
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusMessage>,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    ///
    /// The capacity determines how many messages can be buffered before
    /// slow receivers start lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Serialize `payload` and emit it on `channel` (fire-and-forget).
    ///
    /// Returns the number of receivers that got the message. Zero receivers
    /// is not an error.
    pub fn emit<T: Serialize + ?Sized>(&self, channel: &str, payload: &T) -> Result<usize, SyncError> {
        let payload = serde_json::to_value(payload)?;
        Ok(self.emit_value(channel, payload))
    }

    /// Emit an already-encoded payload.
    pub fn emit_value(&self, channel: &str, payload: Value) -> usize {
        self.emit_message(BusMessage {
            channel: Arc::from(channel),
            payload,
            via: None,
        })
    }

    /// Emit a message as-is, preserving its `via` tag.
    pub fn emit_message(&self, message: BusMessage) -> usize {
        trace!(channel = %message.channel, "emit");
        self.sender.send(message).unwrap_or(0)
    }

    /// Raw receiver for every channel.
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }

    /// Receiver filtered to one channel.
    ///
    /// Registration happens immediately, so subscribing before emitting a
    /// request guarantees its response cannot be missed.
    pub fn subscribe_channel(&self, channel: &str) -> ChannelReceiver {
        ChannelReceiver {
            channel: Arc::from(channel),
            receiver: self.sender.subscribe(),
        }
    }

    /// Run `handler` for every message on `channel` until the returned
    /// [`Listener`] is dropped or the bus closes.
    ///
    /// Handlers for one listener run sequentially. Must be called inside a
    /// tokio runtime.
    pub fn listen<F, Fut>(&self, channel: &str, handler: F) -> Listener
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut receiver = self.subscribe_channel(channel);
        let channel: Arc<str> = Arc::from(channel);

        let task_channel = Arc::clone(&channel);
        let task = tokio::spawn(async move {
            while let Ok(payload) = receiver.recv().await {
                handler(payload).await;
            }
            debug!(channel = %task_channel, "listener stopped, bus closed");
        });

        Listener { channel, task }
    }

    /// Returns the number of active receivers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

/// A receiver that yields only one channel's payloads.
pub struct ChannelReceiver {
    channel: Arc<str>,
    receiver: broadcast::Receiver<BusMessage>,
}

impl ChannelReceiver {
    /// Wait for the next payload on this channel.
    pub async fn recv(&mut self) -> Result<Value, SyncError> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if message.channel == self.channel => return Ok(message.payload),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => {
                    warn!(channel = %self.channel, lagged = n, "receiver lagged, messages may be missed");
                }
                Err(RecvError::Closed) => return Err(SyncError::BusClosed),
            }
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// Handle for a running [`EventBus::listen`] task.
///
/// Dropping it (or calling [`Listener::unlisten`]) stops the handler.
#[must_use = "dropping a Listener stops it immediately"]
pub struct Listener {
    channel: Arc<str>,
    task: JoinHandle<()>,
}

impl Listener {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn unlisten(self) {
        drop(self);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("channel", &self.channel)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

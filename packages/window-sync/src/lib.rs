//! # Window Sync
//!
//! Keeps the state of one application consistent across several windows
//! (processes), with exactly one window holding authoritative state.
//!
//! ## Core Concepts
//!
//! - The **primary** owns the store. Local writes are projected to a
//!   [`StateSnapshot`] and broadcast, throttled.
//! - **Secondaries** mirror the primary. They never write their store
//!   directly; they apply snapshots silently and send intents back as
//!   [`RemoteAction`] calls.
//!
//! ## Architecture
//!
//! ```text
//! Primary window                                 Secondary window
//!
//! Store ──subscribe──► PrimaryAgent              SecondaryAgent ──apply_remote──► Store
//!   ▲                    │  project + throttle      ▲     │
//!   │                    ▼                          │     │ RemoteAction::call
//!   │ invoke       EventBus ◄══ Bridge (NDJSON) ══► EventBus
//!   │                    │                                │
//!   └── action-request ◄─┘                                │
//!       action-response ─────────────────────────────────►┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One writer** - Only the primary mutates authoritative state
//! 2. **Wire-safe snapshots** - Actions and local-only fields never cross the bus
//! 3. **Silent mirrors** - Applying remote state never triggers a re-broadcast
//! 4. **Latest wins** - Snapshots arriving mid-apply collapse to the newest one
//! 5. **Bounded calls** - A remote action resolves, fails or times out
//!
//! ## Example
//!
//! ```ignore
//! use window_sync::{EventBus, PrimaryAgent, SecondaryAgent, Store, StatePatch};
//!
//! let bus = EventBus::new();
//!
//! let canonical = Store::builder()
//!     .field("volume", json!(1.0))
//!     .action("setVolume", |store, args| async move {
//!         store.set_local(StatePatch::new().with("volume", args[0].clone()));
//!         Ok(())
//!     })
//!     .build()?;
//! let _primary = PrimaryAgent::new(canonical, bus.clone()).attach();
//!
//! let mirror = Store::builder().field("volume", json!(1.0)).build()?;
//! let secondary = SecondaryAgent::new(mirror, bus.clone()).attach();
//!
//! secondary.remote_action("setVolume").call(vec![json!(0.5)]).await?;
//! ```

mod bridge;
mod bus;
mod cache;
mod error;
mod primary;
mod protocol;
mod secondary;
mod snapshot;
mod store;
mod throttle;

pub mod config;


pub use crate::bridge::Bridge;
pub use crate::bus::{BusMessage, ChannelReceiver, EventBus, Listener};
pub use crate::cache::RecencyCache;
pub use crate::config::Config;
pub use crate::error::{ActionError, SyncError};
pub use crate::primary::{PrimaryAgent, PrimaryHandle};
pub use crate::protocol::{
    ActionRequest, ActionResponse, Channel, Channels, CorrelationId, HydrationResponse, Role,
    StateSnapshot, SyncConfig, WindowLabel, ACTION_TIMEOUT, DEFAULT_CACHE_CAPACITY,
    MAX_CACHE_CAPACITY, MAX_RETRIES, THROTTLE_INTERVAL,
};
pub use crate::secondary::{ApplyOutcome, Mirror, RemoteAction, SecondaryAgent, SecondaryHandle};
pub use crate::snapshot::{decode_cache, encode_cache, SnapshotCodec};
pub use crate::store::{
    ActionFn, ActionHost, CacheFieldSpec, CachedEntries, FieldValue, RemoteApply, StateListener,
    StatePatch, StateSchema, StateStore, Store, StoreBuilder, StoreState, Subscription,
};
pub use crate::throttle::Throttle;

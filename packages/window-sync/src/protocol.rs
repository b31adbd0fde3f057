//! Wire protocol shared by the primary and secondary windows.
//!
//! Every payload that crosses the event bus is defined here and is plain
//! JSON. Nothing in this module knows about stores or agents.
//!
//! # Channels
//!
//! | Channel           | Direction                      | Payload                 |
//! |-------------------|--------------------------------|-------------------------|
//! | `state-update`    | primary → secondaries          | [`StateSnapshot`]       |
//! | `state-request`   | secondary → primary            | `null`                  |
//! | `state-response`  | primary → requesters           | [`HydrationResponse`]   |
//! | `action-request`  | secondary → primary            | [`ActionRequest`]       |
//! | `action-response` | primary → all (filtered by id) | [`ActionResponse`]      |

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Wire-safe projection of store state: field name → JSON value.
///
/// Never contains actions or local-only fields.
pub type StateSnapshot = Map<String, Value>;

/// Minimum spacing between two `state-update` broadcasts.
pub const THROTTLE_INTERVAL: Duration = Duration::from_millis(100);

/// How long a remote action waits for its correlated response.
pub const ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote actions are never retried automatically.
pub const MAX_RETRIES: u32 = 0;

/// Capacity used to rebuild a cache field when no hint is available.
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Upper bound on a capacity taken from a hint field. Larger hints are clamped.
pub const MAX_CACHE_CAPACITY: usize = 10_000;

// =============================================================================
// Configuration
// =============================================================================

/// Protocol timing and sizing.
///
/// These values are fixed for a deployment; `SyncConfig::default()` is what
/// every process should use so both ends agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub throttle_interval: Duration,
    pub action_timeout: Duration,
    pub max_retries: u32,
    pub default_cache_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            throttle_interval: THROTTLE_INTERVAL,
            action_timeout: ACTION_TIMEOUT,
            max_retries: MAX_RETRIES,
            default_cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

// =============================================================================
// Channels
// =============================================================================

/// The five named channels of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    StateUpdate,
    StateRequest,
    StateResponse,
    ActionRequest,
    ActionResponse,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::StateUpdate,
        Channel::StateRequest,
        Channel::StateResponse,
        Channel::ActionRequest,
        Channel::ActionResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::StateUpdate => "state-update",
            Channel::StateRequest => "state-request",
            Channel::StateResponse => "state-response",
            Channel::ActionRequest => "action-request",
            Channel::ActionResponse => "action-response",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves protocol channels to bus channel names.
///
/// A namespace lets several independent synchronized stores share one bus:
/// with namespace `player`, [`Channel::StateUpdate`] becomes
/// `player:state-update`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Channels {
    prefix: String,
}

impl Channels {
    /// Bare channel names (`state-update`, ...).
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel names prefixed with `<namespace>:`.
    pub fn namespaced(namespace: &str) -> Self {
        if namespace.is_empty() {
            return Self::new();
        }
        Self {
            prefix: format!("{namespace}:"),
        }
    }

    pub fn name(&self, channel: Channel) -> String {
        format!("{}{}", self.prefix, channel.as_str())
    }
}

// =============================================================================
// Correlation
// =============================================================================

/// Token linking one action request to its response.
///
/// Serialized as a hyphenated UUID string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Mint a fresh random token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// A secondary asking the primary to run a store action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub id: CorrelationId,
    pub action: String,
    pub args: Vec<Value>,
}

/// Outcome of an [`ActionRequest`], broadcast to every listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub id: CorrelationId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResponse {
    pub fn succeeded(id: CorrelationId) -> Self {
        Self {
            id,
            success: true,
            error: None,
        }
    }

    pub fn failed(id: CorrelationId, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// The primary's answer to `state-request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HydrationResponse {
    pub state: StateSnapshot,
}

// =============================================================================
// Window labels
// =============================================================================

/// Static labels of the participating windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WindowLabel {
    Main,
    MiniPlayer,
    FullscreenPlayer,
}

/// Whether a window owns canonical state or mirrors it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
}

impl WindowLabel {
    /// Map a raw window label, falling back to [`WindowLabel::Main`].
    pub fn from_label(label: &str) -> Self {
        match label {
            "miniPlayer" => WindowLabel::MiniPlayer,
            "fullscreenPlayer" => WindowLabel::FullscreenPlayer,
            _ => WindowLabel::Main,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowLabel::Main => "main",
            WindowLabel::MiniPlayer => "miniPlayer",
            WindowLabel::FullscreenPlayer => "fullscreenPlayer",
        }
    }

    pub fn role(&self) -> Role {
        match self {
            WindowLabel::Main => Role::Primary,
            WindowLabel::MiniPlayer | WindowLabel::FullscreenPlayer => Role::Secondary,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.role() == Role::Primary
    }
}

impl fmt::Display for WindowLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

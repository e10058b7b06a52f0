//! System event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

use crate::gadget::{GadgetStatus, LockInfo, Mode};

/// System event enumeration
///
/// All events are tagged with their event name for serialization.
/// The `serde(tag = "event", content = "data")` attribute creates a
/// JSON structure like:
/// ```json
/// {
///   "event": "gadget.active_mode_changed",
///   "data": { "mode": "ethernet_p2p" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    /// Active gadget mode changed after a successful operation
    #[serde(rename = "gadget.active_mode_changed")]
    ActiveModeChanged {
        /// New active mode ("none" after deactivation)
        mode: Mode,
    },

    /// Exclusivity lock acquired or released
    #[serde(rename = "gadget.lock_changed")]
    LockChanged {
        /// Current holder, `None` once released
        lock: Option<LockInfo>,
    },

    /// An activation or deactivation failed
    #[serde(rename = "gadget.operation_failed")]
    OperationFailed {
        /// Mode the operation was working on
        mode: Mode,
        /// "activate" or "deactivate"
        operation: String,
        /// Error kind
        kind: String,
        /// Error message
        message: String,
    },

    /// Full status snapshot, sent to WebSocket clients after they subscribe
    #[serde(rename = "gadget.status")]
    Status { status: GadgetStatus },

    /// Delivery problem on the event stream itself
    #[serde(rename = "error")]
    Error { message: String },
}

impl SystemEvent {
    /// Get the event name (for filtering)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ActiveModeChanged { .. } => "gadget.active_mode_changed",
            Self::LockChanged { .. } => "gadget.lock_changed",
            Self::OperationFailed { .. } => "gadget.operation_failed",
            Self::Status { .. } => "gadget.status",
            Self::Error { .. } => "error",
        }
    }

    /// Check if event matches a topic pattern
    ///
    /// Supports wildcards:
    /// - `*` matches all events
    /// - `gadget.*` matches all gadget events
    /// - `gadget.lock_changed` matches exact event
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if let Some(prefix) = topic.strip_suffix(".*") {
            return event_name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'));
        }

        event_name == topic
    }
}

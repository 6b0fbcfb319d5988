//! Event — the universal message type for slidecast.
//!
//! ARCHITECTURE
//! ============
//! Every communication is an Event. Clients send request events over
//! WebSocket, the server dispatches by `kind`, and replies flow back with
//! `parent_id` pointing at the originating event. Room fanout sends
//! uncorrelated copies so peers never see another connection's request ids.
//!
//! DESIGN
//! ======
//! - Flat data: payload is always `Map<String, Value>`, never nested.
//! - Deck actions reply with `<kind>-applied` so the broadcast name follows
//!   the inbound action name mechanically.
//! - Errors are events too (`kind = "error"`), scoped to the originating
//!   connection and never broadcast.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Event data key for error messages.
pub const EVENT_MESSAGE: &str = "message";

/// Event data key for grepable error codes.
pub const EVENT_CODE: &str = "code";

/// Event data key for the retryable flag on error events.
pub const EVENT_RETRYABLE: &str = "retryable";

/// Kind of every error event.
pub const KIND_ERROR: &str = "error";

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value payload. Alias to reduce noise in signatures.
pub type Data = HashMap<String, serde_json::Value>;

/// The universal message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// Set on replies; points at the event that caused this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    #[serde(default)]
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presentation_id: Option<Uuid>,
    pub kind: String,
    #[serde(default)]
    pub data: Data,
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error events.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Event {
    /// Create a fresh event. Entry point for every inbound kind and for
    /// server-initiated notices (`member-joined`, `member-left`, ...).
    pub fn new(kind: impl Into<String>, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            ts: now_ms(),
            presentation_id: None,
            kind: kind.into(),
            data,
        }
    }

    /// Create a reply correlated to this event. Inherits `presentation_id`.
    #[must_use]
    pub fn reply(&self, kind: impl Into<String>, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            ts: now_ms(),
            presentation_id: self.presentation_id,
            kind: kind.into(),
            data,
        }
    }

    /// Reply to a deck action with its `-applied` counterpart.
    #[must_use]
    pub fn applied(&self, data: Data) -> Self {
        self.reply(format!("{}-applied", self.kind), data)
    }

    /// Create an error reply from a plain string. Scoped to the caller.
    #[must_use]
    pub fn error(&self, message: impl Into<String>) -> Self {
        let mut data = Data::new();
        data.insert(EVENT_MESSAGE.into(), serde_json::Value::String(message.into()));
        self.reply(KIND_ERROR, data)
    }

    /// Create a structured error reply from a typed error.
    #[must_use]
    pub fn error_from(&self, err: &(impl ErrorCode + ?Sized)) -> Self {
        let mut data = Data::new();
        data.insert(EVENT_CODE.into(), serde_json::Value::String(err.error_code().to_string()));
        data.insert(EVENT_MESSAGE.into(), serde_json::Value::String(err.to_string()));
        data.insert(EVENT_RETRYABLE.into(), serde_json::Value::Bool(err.retryable()));
        self.reply(KIND_ERROR, data)
    }

    /// Copy of this event for room peers: fresh id, no request correlation.
    #[must_use]
    pub fn peer_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4();
        copy.parent_id = None;
        copy
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Event {
    #[must_use]
    pub fn with_presentation_id(mut self, presentation_id: Uuid) -> Self {
        self.presentation_id = Some(presentation_id);
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// TESTS
// =============================================================================

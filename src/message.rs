//! Envelope — the wire message type for inkboard.
//!
//! DESIGN
//! ======
//! Every websocket communication is an Envelope: a `kind` string, a flat
//! key-value `data` payload, and server-stamped authorship and timestamp.
//! Drawing operations are fire-and-forget, so there is no request/response
//! correlation; errors flow back as `error` envelopes carrying a grepable
//! code. The WS handler routes on `kind` and never inspects `data`.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Envelope data key for error messages.
pub const DATA_MESSAGE: &str = "message";

/// Envelope data key for grepable error codes.
pub const DATA_CODE: &str = "code";

/// Envelope data key for the retryable flag on error envelopes.
pub const DATA_RETRYABLE: &str = "retryable";

/// Envelope data key naming the operation an error envelope responds to.
pub const DATA_OP: &str = "op";

/// Kind used by all error envelopes.
pub const KIND_ERROR: &str = "error";

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value payload. Alias to reduce noise in signatures.
pub type Data = HashMap<String, serde_json::Value>;

/// The wire message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub kind: String,
    /// Milliseconds since Unix epoch. Stamped by the server.
    #[serde(default)]
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<Uuid>,
    /// Verified author identity. Stamped by the server; any client-supplied
    /// value is overwritten before dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_user_id: Option<Uuid>,
    #[serde(default)]
    pub data: Data,
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error envelopes.
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
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Envelope {
    /// Create an envelope of the given kind. Entry point for every message.
    pub fn new(kind: impl Into<String>, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            ts: now_ms(),
            document_id: None,
            author_user_id: None,
            data,
        }
    }

    /// Create an `error` envelope from a plain validation message.
    /// `op` names the operation that failed.
    #[must_use]
    pub fn error(op: &str, message: impl Into<String>) -> Self {
        let mut data = Data::new();
        data.insert(DATA_OP.into(), serde_json::Value::String(op.to_string()));
        data.insert(DATA_CODE.into(), serde_json::Value::String("E_VALIDATION".into()));
        data.insert(DATA_MESSAGE.into(), serde_json::Value::String(message.into()));
        data.insert(DATA_RETRYABLE.into(), serde_json::Value::Bool(false));
        Self::new(KIND_ERROR, data)
    }

    /// Create a structured `error` envelope from a typed error.
    #[must_use]
    pub fn error_from(op: &str, err: &(impl ErrorCode + ?Sized)) -> Self {
        let mut data = Data::new();
        data.insert(DATA_OP.into(), serde_json::Value::String(op.to_string()));
        data.insert(DATA_CODE.into(), serde_json::Value::String(err.error_code().to_string()));
        data.insert(DATA_MESSAGE.into(), serde_json::Value::String(err.to_string()));
        data.insert(DATA_RETRYABLE.into(), serde_json::Value::Bool(err.retryable()));
        Self::new(KIND_ERROR, data)
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Envelope {
    #[must_use]
    pub fn with_document_id(mut self, document_id: Uuid) -> Self {
        self.document_id = Some(document_id);
        self
    }

    #[must_use]
    pub fn with_author(mut self, user_id: Uuid) -> Self {
        self.author_user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;

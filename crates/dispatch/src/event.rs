// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Canonical event record shared by the store, router, and gateway.
//!
//! Every observable effect of a session becomes one immutable record with a
//! dense, 1-based per-session sequence number. Ordering is defined by `seq`,
//! never by timestamp.

use serde::{Deserialize, Serialize};

/// Channels emitted by the built-in adapters.
pub mod channel {
    pub const PTY_STDOUT: &str = "pty:stdout";
    pub const PTY_STDERR: &str = "pty:stderr";
    pub const AI_MESSAGE: &str = "ai:message";
    pub const AI_ERROR: &str = "ai:error";
    pub const FILE_CONTENT: &str = "file:content";
    pub const FILE_SAVED: &str = "file:saved";
    pub const FILE_ERROR: &str = "file:error";
    pub const SYSTEM_STATUS: &str = "system:status";
}

/// Event types. The `(channel, type)` pair determines the payload schema.
pub mod event_type {
    pub const CHUNK: &str = "chunk";
    pub const TEXT: &str = "text";
    pub const JSON: &str = "json";
    pub const EVENT: &str = "event";
    pub const OPEN: &str = "open";
    pub const CLOSE: &str = "close";
    pub const EXIT: &str = "exit";
    pub const ERROR: &str = "error";
}

/// One persisted, immutable session event.
///
/// `payload` is opaque to everything but the producer and the client:
/// typically a JSON document, or `{"data": "<base64>"}` for raw output
/// chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: i64,
    pub channel: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
    pub ts: u64,
}

impl EventRecord {
    /// Whether this event closes the session's router.
    ///
    /// Only `system:status` carries terminal types; kind-scoped error
    /// channels (`ai:error`, `file:error`) are ordinary events.
    pub fn is_terminal(&self) -> bool {
        self.channel == channel::SYSTEM_STATUS
            && matches!(
                self.event_type.as_str(),
                event_type::EXIT | event_type::CLOSE | event_type::ERROR
            )
    }

    /// Exit code carried by a `system:status/exit` event, if any.
    pub fn exit_code(&self) -> Option<i64> {
        if self.channel != channel::SYSTEM_STATUS || self.event_type != event_type::EXIT {
            return None;
        }
        self.payload.get("exitCode").and_then(|v| v.as_i64())
    }
}

/// An emission before the router has assigned it a sequence number.
#[derive(Debug, Clone)]
pub struct Emission {
    pub channel: &'static str,
    pub event_type: &'static str,
    pub payload: serde_json::Value,
}

impl Emission {
    pub fn new(
        channel: &'static str,
        event_type: &'static str,
        payload: serde_json::Value,
    ) -> Self {
        Self { channel, event_type, payload }
    }

    /// `system:status/open` — the resource behind the adapter is ready.
    pub fn open() -> Self {
        Self::new(channel::SYSTEM_STATUS, event_type::OPEN, serde_json::json!({}))
    }

    /// Terminal `system:status/exit` with the child's exit code.
    pub fn exit(exit_code: i64) -> Self {
        Self::new(
            channel::SYSTEM_STATUS,
            event_type::EXIT,
            serde_json::json!({ "exitCode": exit_code }),
        )
    }

    /// Terminal `system:status/close` with a reason.
    pub fn close(reason: &str) -> Self {
        Self::new(channel::SYSTEM_STATUS, event_type::CLOSE, serde_json::json!({ "reason": reason }))
    }

    /// Terminal `system:status/error` for unrecoverable faults.
    pub fn fatal(message: &str) -> Self {
        Self::new(
            channel::SYSTEM_STATUS,
            event_type::ERROR,
            serde_json::json!({ "message": message }),
        )
    }
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;

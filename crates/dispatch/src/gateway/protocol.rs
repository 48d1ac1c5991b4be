// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol for the attachment gateway.
//!
//! Frames are JSON objects tagged by `frame`. Requests carry an optional
//! opaque correlation `id` that the matching response echoes back. `event`
//! frames have the exact shape `{runId, seq, channel, type, payload, ts}`
//! plus the envelope tag; payloads are opaque to the transport.

use serde::{Deserialize, Serialize};

use crate::event::EventRecord;
use crate::store::SessionStatus;

/// Frames a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Connection handshake. `client_id` is an opaque per-device string
    /// used only for workspace-layout scoping.
    Hello {
        #[serde(default)]
        id: Option<String>,
        client_id: String,
    },
    /// Attach to a session, replaying everything after `since_seq`.
    Attach {
        #[serde(default)]
        id: Option<String>,
        run_id: String,
        #[serde(default)]
        since_seq: i64,
    },
    Detach {
        #[serde(default)]
        id: Option<String>,
        run_id: String,
    },
    /// Fire-and-forget input; errors surface as async `error` frames.
    Input {
        #[serde(default)]
        id: Option<String>,
        run_id: String,
        data: serde_json::Value,
    },
    Resize {
        #[serde(default)]
        id: Option<String>,
        run_id: String,
        cols: u16,
        rows: u16,
    },
    Close {
        #[serde(default)]
        id: Option<String>,
        run_id: String,
    },
}

/// Frames the server sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    HelloOk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    HelloError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        reason: String,
    },
    AttachOk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        run_id: String,
        kind: String,
        status: SessionStatus,
    },
    AttachError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        run_id: String,
        reason: String,
    },
    DetachOk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        run_id: String,
    },
    ResizeOk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        run_id: String,
    },
    ResizeError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        run_id: String,
        reason: String,
    },
    CloseOk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        run_id: String,
    },
    CloseError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        run_id: String,
        reason: String,
    },
    /// One delivered event, replayed or live, in per-session seq order.
    Event {
        run_id: String,
        seq: i64,
        channel: String,
        #[serde(rename = "type")]
        event_type: String,
        payload: serde_json::Value,
        ts: u64,
    },
    /// Asynchronous error notification, optionally scoped to a run.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        message: String,
    },
    /// The credential backing this connection expired; reconnect.
    SessionExpired {},
}

impl ServerMessage {
    /// Build an `event` frame from a stored record.
    pub fn event(run_id: &str, record: &EventRecord) -> Self {
        Self::Event {
            run_id: run_id.to_owned(),
            seq: record.seq,
            channel: record.channel.clone(),
            event_type: record.event_type.clone(),
            payload: record.payload.clone(),
            ts: record.ts,
        }
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;

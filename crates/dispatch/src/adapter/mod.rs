// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Adapter contract and factory registry.
//!
//! An adapter owns exactly one external resource for one session and
//! translates everything it observes into events on the sink it was given at
//! start. Adapters never touch the store or clients; the router is their
//! only egress.

pub mod agent;
pub mod editor;
pub mod pty;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCode, Fault};
use crate::router::EventSink;

/// Per-session context handed to an adapter at start.
#[derive(Clone)]
pub struct AdapterContext {
    pub session_id: String,
    pub shutdown: CancellationToken,
}

/// Uniform contract every session kind implements.
///
/// Object-safe for use as `Box<dyn Adapter>`; methods return boxed futures
/// so no async-trait machinery is needed. All calls are serialized by the
/// registry's per-session driver task — adapters are single-owner and need
/// no internal locking for their command path.
pub trait Adapter: Send + 'static {
    /// Acquire the resource and register internal readers. Must emit
    /// `system:status/open` once the resource is ready and must not block
    /// the caller indefinitely; long-lived reading happens on spawned
    /// tasks that hold sink clones.
    fn start(
        &mut self,
        ctx: AdapterContext,
        sink: EventSink,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Deliver input to the resource. Input that is invalid for the kind is
    /// surfaced as an error event on the kind's error channel, never as a
    /// fault to the caller.
    fn write(
        &mut self,
        data: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Only meaningful for the pty kind; others ignore it.
    fn resize(&mut self, cols: u16, rows: u16)
        -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Cooperative shutdown. Idempotent; leads to exactly one terminal
    /// event, after which the adapter is inert.
    fn close(&mut self, reason: &str) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Constructor for one session kind: parses the kind-specific config blob
/// and returns a not-yet-started adapter.
pub type AdapterFactory =
    Box<dyn Fn(&serde_json::Value) -> Result<Box<dyn Adapter>, Fault> + Send + Sync>;

/// Registry of adapter factories keyed by kind tag.
///
/// The set is closed per build: factories register before the session
/// registry starts serving, and a new kind means a new registration at the
/// composition root.
#[derive(Default)]
pub struct AdapterFactories {
    map: HashMap<&'static str, AdapterFactory>,
}

pub const KIND_PTY: &str = "pty";
pub const KIND_AI_AGENT: &str = "ai-agent";
pub const KIND_FILE_EDITOR: &str = "file-editor";

impl AdapterFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// The three built-in kinds.
    pub fn builtin() -> Self {
        let mut factories = Self::new();
        factories.register(KIND_PTY, Box::new(pty::factory));
        factories.register(KIND_AI_AGENT, Box::new(agent::factory));
        factories.register(KIND_FILE_EDITOR, Box::new(editor::factory));
        factories
    }

    pub fn register(&mut self, kind: &'static str, factory: AdapterFactory) {
        self.map.insert(kind, factory);
    }

    /// Instantiate an adapter for `kind` from its config blob.
    pub fn create(
        &self,
        kind: &str,
        config: &serde_json::Value,
    ) -> Result<Box<dyn Adapter>, Fault> {
        let factory = self
            .map
            .get(kind)
            .ok_or_else(|| Fault::new(ErrorCode::UnknownKind, format!("unknown kind: {kind}")))?;
        factory(config)
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.map.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

/// Parse a kind-specific config blob, mapping serde errors to `BadRequest`.
/// An absent blob is treated as `{}` so kinds with all-default fields work
/// without one.
pub(crate) fn parse_config<T: serde::de::DeserializeOwned>(
    config: &serde_json::Value,
) -> Result<T, Fault> {
    let value = if config.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        config.clone()
    };
    serde_json::from_value(value)
        .map_err(|e| Fault::new(ErrorCode::BadRequest, format!("invalid config: {e}")))
}

#[cfg(test)]
#[path = "adapter_tests.rs"]
mod tests;

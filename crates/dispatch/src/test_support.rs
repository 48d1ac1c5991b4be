// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared helpers for unit and spec tests. Not part of the public contract.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::adapter::{Adapter, AdapterContext, AdapterFactories};
use crate::config::Config;
use crate::error::Fault;
use crate::event::{channel, event_type, Emission};
use crate::registry::Registry;
use crate::router::EventSink;
use crate::state::AppState;
use crate::store::EventStore;

/// Kind tag for [`EchoAdapter`].
pub const KIND_ECHO: &str = "echo";

/// In-process adapter that mirrors input back as events.
///
/// Write semantics: the string `"close"` emits the terminal close; any
/// other string comes back as `ai:message/event{events:[{"text": ...}]}`.
/// Useful wherever a test needs a deterministic event source without a
/// child process.
pub struct EchoAdapter {
    sink: Option<EventSink>,
    closed: bool,
}

impl EchoAdapter {
    pub fn new() -> Self {
        Self { sink: None, closed: false }
    }
}

impl Default for EchoAdapter {
    fn default() -> Self {
        Self::new()
    }
}

pub fn echo_factory(_config: &serde_json::Value) -> Result<Box<dyn Adapter>, Fault> {
    Ok(Box::new(EchoAdapter::new()))
}

impl Adapter for EchoAdapter {
    fn start(
        &mut self,
        _ctx: AdapterContext,
        sink: EventSink,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            sink.emit(Emission::open()).await;
            self.sink = Some(sink);
            Ok(())
        })
    }

    fn write(
        &mut self,
        data: serde_json::Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let Some(sink) = self.sink.clone() else {
                return;
            };
            match data.as_str() {
                Some("close") => {
                    self.closed = true;
                    sink.emit(Emission::close("echo close")).await;
                }
                Some(text) => {
                    sink.emit(Emission::new(
                        channel::AI_MESSAGE,
                        event_type::EVENT,
                        serde_json::json!({ "events": [{ "text": text }] }),
                    ))
                    .await;
                }
                None => {
                    sink.emit(Emission::new(
                        channel::AI_ERROR,
                        event_type::JSON,
                        serde_json::json!({ "message": "echo input must be a string" }),
                    ))
                    .await;
                }
            }
        })
    }

    fn resize(
        &mut self,
        _cols: u16,
        _rows: u16,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }

    fn close(
        &mut self,
        reason: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        let reason = reason.to_owned();
        Box::pin(async move {
            if self.closed {
                return;
            }
            self.closed = true;
            if let Some(sink) = self.sink.take() {
                sink.emit(Emission::close(&reason)).await;
            }
        })
    }
}

/// Factory set with the built-in kinds plus [`EchoAdapter`].
pub fn factories_with_echo() -> AdapterFactories {
    let mut factories = AdapterFactories::builtin();
    factories.register(KIND_ECHO, Box::new(echo_factory));
    factories
}

/// In-memory application state for transport-level tests.
pub fn test_state() -> Arc<AppState> {
    let config = Config::default();
    let store = Arc::new(
        EventStore::in_memory(config.max_payload).unwrap_or_else(|e| {
            unreachable!("in-memory store cannot fail to open: {e}")
        }),
    );
    let shutdown = CancellationToken::new();
    let registry = Registry::new(Arc::clone(&store), factories_with_echo(), shutdown.clone());
    Arc::new(AppState::new(config, store, registry, shutdown))
}

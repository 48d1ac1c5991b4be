// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File-editor adapter: loads one file into memory and persists structured
//! save commands back to disk.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::debug;

use super::{parse_config, Adapter, AdapterContext};
use crate::error::Fault;
use crate::event::{channel, event_type, Emission};
use crate::router::EventSink;

/// Kind-specific config blob for `file-editor` sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct EditorConfig {
    /// Target file. A missing file opens as an empty buffer and is created
    /// on first save.
    pub path: PathBuf,
}

/// Structured commands accepted on the input channel.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum EditorCommand {
    Save { content: String },
    Reload,
}

pub fn factory(config: &serde_json::Value) -> Result<Box<dyn Adapter>, Fault> {
    let config: EditorConfig = parse_config(config)?;
    Ok(Box::new(EditorAdapter::new(config)))
}

/// One open file for one session.
pub struct EditorAdapter {
    config: EditorConfig,
    sink: Option<EventSink>,
    closed: bool,
}

impl EditorAdapter {
    pub fn new(config: EditorConfig) -> Self {
        Self { config, sink: None, closed: false }
    }

    /// Read the file and emit a `file:content/text` snapshot.
    async fn emit_content(&self, sink: &EventSink) -> anyhow::Result<()> {
        let content = match tokio::fs::read_to_string(&self.config.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        sink.emit(Emission::new(
            channel::FILE_CONTENT,
            event_type::TEXT,
            serde_json::json!({ "content": content, "size": content.len() }),
        ))
        .await;
        Ok(())
    }

    async fn emit_error(&self, sink: &EventSink, message: String) {
        sink.emit(Emission::new(
            channel::FILE_ERROR,
            event_type::JSON,
            serde_json::json!({ "message": message }),
        ))
        .await;
    }
}

impl Adapter for EditorAdapter {
    fn start(
        &mut self,
        _ctx: AdapterContext,
        sink: EventSink,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            sink.emit(Emission::open()).await;
            self.emit_content(&sink).await?;
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
            let command: EditorCommand = match serde_json::from_value(data) {
                Ok(command) => command,
                Err(e) => {
                    self.emit_error(&sink, format!("invalid editor command: {e}")).await;
                    return;
                }
            };

            match command {
                EditorCommand::Save { content } => {
                    if let Err(e) = tokio::fs::write(&self.config.path, &content).await {
                        self.emit_error(&sink, format!("save failed: {e}")).await;
                        return;
                    }
                    sink.emit(Emission::new(
                        channel::FILE_SAVED,
                        event_type::JSON,
                        serde_json::json!({
                            "path": self.config.path.display().to_string(),
                            "size": content.len(),
                        }),
                    ))
                    .await;
                }
                EditorCommand::Reload => {
                    if let Err(e) = self.emit_content(&sink).await {
                        self.emit_error(&sink, format!("reload failed: {e}")).await;
                    }
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
            debug!(reason, path = %self.config.path.display(), "closing editor session");
            if let Some(sink) = self.sink.take() {
                sink.emit(Emission::close(&reason)).await;
            }
        })
    }
}

#[cfg(test)]
#[path = "editor_tests.rs"]
mod tests;

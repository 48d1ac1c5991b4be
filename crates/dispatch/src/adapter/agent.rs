// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! AI coding-agent adapter: drives an external agent process over piped
//! stdio and surfaces its newline-delimited JSON event stream as
//! `ai:message/event` records.
//!
//! Resume semantics: resuming a stopped session starts a *fresh* agent
//! conversation that appends to the original event log (same run id, seq
//! continues). The log, not the external agent's private state, is the
//! continuity mechanism.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{parse_config, Adapter, AdapterContext};
use crate::error::Fault;
use crate::event::{channel, event_type, Emission};
use crate::router::EventSink;

/// Kind-specific config blob for `ai-agent` sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Agent binary to spawn.
    #[serde(default = "default_command")]
    pub command: String,
    /// Extra arguments appended after the generated flags.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Model tag passed as `--model`.
    #[serde(default)]
    pub model: Option<String>,
    /// Permission mode passed as `--permission-mode`.
    #[serde(default)]
    pub permission_mode: Option<String>,
    /// Turn cap passed as `--max-turns`.
    #[serde(default)]
    pub max_turns: Option<u32>,
}

fn default_command() -> String {
    "claude".to_owned()
}

pub fn factory(config: &serde_json::Value) -> Result<Box<dyn Adapter>, Fault> {
    let config: AgentConfig = parse_config(config)?;
    Ok(Box::new(AgentAdapter::new(config)))
}

/// One external agent process for one session.
pub struct AgentAdapter {
    config: AgentConfig,
    child_pid: Option<u32>,
    stdin: Option<Arc<Mutex<ChildStdin>>>,
    sink: Option<EventSink>,
    closed: bool,
}

impl AgentAdapter {
    pub fn new(config: AgentConfig) -> Self {
        Self { config, child_pid: None, stdin: None, sink: None, closed: false }
    }

    fn build_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.config.command);
        cmd.arg("--output-format").arg("stream-json");
        cmd.arg("--input-format").arg("stream-json");
        if let Some(ref model) = self.config.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(ref mode) = self.config.permission_mode {
            cmd.arg("--permission-mode").arg(mode);
        }
        if let Some(turns) = self.config.max_turns {
            cmd.arg("--max-turns").arg(turns.to_string());
        }
        cmd.args(&self.config.args);
        if let Some(ref cwd) = self.config.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

impl Adapter for AgentAdapter {
    fn start(
        &mut self,
        ctx: AdapterContext,
        sink: EventSink,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut child = self.build_command().spawn().with_context(|| {
                format!("failed to spawn agent process: {}", self.config.command)
            })?;

            let stdin = child.stdin.take().context("agent stdin unavailable")?;
            let stdout = child.stdout.take().context("agent stdout unavailable")?;
            let stderr = child.stderr.take().context("agent stderr unavailable")?;

            self.stdin = Some(Arc::new(Mutex::new(stdin)));
            self.sink = Some(sink.clone());
            self.child_pid = child.id();

            sink.emit(Emission::open()).await;

            tokio::spawn(pump_stderr(stderr, sink.clone()));

            // The stdout pump owns the child so it can reap it at EOF and
            // emit the single terminal close.
            let session_id = ctx.session_id;
            tokio::spawn(pump_stdout(child, stdout, sink, session_id));
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

            let Some(line) = input_line(&data) else {
                sink.emit(Emission::new(
                    channel::AI_ERROR,
                    event_type::JSON,
                    serde_json::json!({ "message": "agent input must be a string or object" }),
                ))
                .await;
                return;
            };

            let Some(stdin) = self.stdin.clone() else {
                return;
            };
            let mut stdin = stdin.lock().await;
            let write = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            };
            if let Err(e) = write.await {
                sink.emit(Emission::new(
                    channel::AI_ERROR,
                    event_type::JSON,
                    serde_json::json!({ "message": format!("agent stdin write failed: {e}") }),
                ))
                .await;
            }
        })
    }

    fn resize(
        &mut self,
        _cols: u16,
        _rows: u16,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        // No terminal behind this kind.
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
            debug!(reason, "closing agent session");

            // Dropping stdin signals the agent to finish; the stdout pump
            // emits the terminal close once the process exits.
            self.stdin = None;
            if let Some(pid) = self.child_pid {
                tokio::spawn(escalate_kill(pid));
            }
        })
    }
}

/// Grace period after stdin EOF, then SIGTERM, then SIGKILL.
async fn escalate_kill(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    let pid = Pid::from_raw(pid);

    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    if kill(pid, None).is_err() {
        return;
    }
    let _ = kill(pid, Signal::SIGTERM);
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    if kill(pid, None).is_ok() {
        let _ = kill(pid, Signal::SIGKILL);
    }
}

/// Read the agent's stdout line stream until EOF, then reap and emit the
/// terminal `system:status/close`.
async fn pump_stdout(
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    sink: EventSink,
    session_id: String,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<serde_json::Value>(line) {
                    Ok(value) => {
                        sink.emit(Emission::new(
                            channel::AI_MESSAGE,
                            event_type::EVENT,
                            serde_json::json!({ "events": [value] }),
                        ))
                        .await;
                    }
                    Err(e) => {
                        sink.emit(Emission::new(
                            channel::AI_ERROR,
                            event_type::JSON,
                            serde_json::json!({
                                "message": format!("unparseable agent output: {e}"),
                                "line": line,
                            }),
                        ))
                        .await;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(session = %session_id, "agent stdout read failed: {e}");
                break;
            }
        }
    }

    let payload = match child.wait().await {
        Ok(status) => {
            let code = status.code();
            serde_json::json!({ "reason": "exit", "exitCode": code })
        }
        Err(e) => {
            warn!(session = %session_id, "agent wait failed: {e}");
            serde_json::json!({ "reason": "exit" })
        }
    };
    sink.emit(Emission::new(channel::SYSTEM_STATUS, event_type::CLOSE, payload)).await;
}

/// Encode one stdin line for the agent process. A string becomes a user
/// message; an object is forwarded as a raw protocol line.
fn input_line(data: &serde_json::Value) -> Option<String> {
    match data {
        serde_json::Value::String(text) => {
            Some(serde_json::json!({ "type": "user", "text": text }).to_string())
        }
        serde_json::Value::Object(_) => Some(data.to_string()),
        _ => None,
    }
}

/// Agent diagnostics on stderr become non-terminal `ai:error` events.
async fn pump_stderr(stderr: tokio::process::ChildStderr, sink: EventSink) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        sink.emit(Emission::new(
            channel::AI_ERROR,
            event_type::JSON,
            serde_json::json!({ "message": line }),
        ))
        .await;
    }
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PTY adapter: spawns a shell under a pseudo-terminal via `forkpty` and
//! streams its output as `pty:stdout/chunk` events (base64 inside the JSON
//! payload). The PTY merges the child's stdout and stderr on the master fd,
//! so the `pty:stderr` channel stays reserved but unused.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, Pid};
use serde::Deserialize;
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

use super::{parse_config, Adapter, AdapterContext};
use crate::error::Fault;
use crate::event::{channel, event_type, Emission};
use crate::router::EventSink;

/// Kind-specific config blob for `pty` sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct PtyConfig {
    /// Shell to spawn; falls back to `$SHELL`, then `/bin/sh`.
    #[serde(default)]
    pub shell: Option<String>,
    /// Working directory for the child.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Environment overlay applied on top of the parent environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}

pub fn factory(config: &serde_json::Value) -> Result<Box<dyn Adapter>, Fault> {
    let config: PtyConfig = parse_config(config)?;
    Ok(Box::new(PtyAdapter::new(config)))
}

/// Non-blocking PTY master fd with async read/write.
struct Master(AsyncFd<OwnedFd>);

impl Master {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        let flags = fcntl(&fd, FcntlArg::F_GETFL).map_err(errno_io)?;
        let flags = OFlag::from_bits_truncate(flags);
        fcntl(&fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(errno_io)?;
        Ok(Self(AsyncFd::new(fd)?))
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.0.readable().await?;
            match guard
                .try_io(|inner| nix::unistd::read(inner, buf).map_err(errno_io))
            {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let mut guard = self.0.writable().await?;
            match guard
                .try_io(|inner| nix::unistd::write(inner, &data[offset..]).map_err(errno_io))
            {
                Ok(Ok(n)) => offset += n,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

impl AsRawFd for Master {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.get_ref().as_raw_fd()
    }
}

fn errno_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// Shell session behind a pseudo-terminal.
pub struct PtyAdapter {
    config: PtyConfig,
    master: Option<Arc<Master>>,
    child: Option<Pid>,
    closed: bool,
}

impl PtyAdapter {
    pub fn new(config: PtyConfig) -> Self {
        Self { config, master: None, child: None, closed: false }
    }

    fn resolved_shell(&self) -> String {
        self.config
            .shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_owned())
    }

    /// Fork a child on a fresh PTY and exec the shell in it.
    // forkpty requires unsafe: post-fork child is partially initialized
    #[allow(unsafe_code)]
    fn spawn_child(&self) -> anyhow::Result<(Master, Pid)> {
        let winsize = Winsize {
            ws_col: self.config.cols,
            ws_row: self.config.rows,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let shell = self.resolved_shell();

        // SAFETY: forkpty is unsafe because the child is in a
        // partially-initialized state after fork. We immediately exec.
        let result = unsafe { forkpty(&winsize, None) }.context("forkpty failed")?;

        match result {
            ForkptyResult::Child => {
                if let Some(ref cwd) = self.config.cwd {
                    let _ = std::env::set_current_dir(cwd);
                }
                std::env::set_var("TERM", "xterm-256color");
                std::env::set_var("DISPATCH", "1");
                for (k, v) in &self.config.env {
                    std::env::set_var(k, v);
                }

                let c_shell = CString::new(shell.as_bytes()).context("invalid shell path")?;
                execvp(&c_shell, &[c_shell.clone()]).context("execvp failed")?;
                unreachable!();
            }
            ForkptyResult::Parent { child, master } => {
                let master = Master::new(master).context("pty master setup failed")?;
                Ok((master, child))
            }
        }
    }
}

impl Adapter for PtyAdapter {
    fn start(
        &mut self,
        ctx: AdapterContext,
        sink: EventSink,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let (master, child) = self.spawn_child()?;
            let master = Arc::new(master);
            self.master = Some(Arc::clone(&master));
            self.child = Some(child);

            sink.emit(Emission::open()).await;
            tokio::spawn(pump_output(master, sink, child, ctx.session_id));
            Ok(())
        })
    }

    fn write(
        &mut self,
        data: serde_json::Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let Some(text) = data.as_str() else {
                // The pty vocabulary has no error channel; non-string input
                // is dropped rather than written as garbage.
                warn!("pty input must be a string, dropping");
                return;
            };
            let Some(ref master) = self.master else {
                return;
            };
            if let Err(e) = master.write_all(text.as_bytes()).await {
                debug!("pty write failed: {e}");
            }
        })
    }

    // TIOCSWINSZ ioctl requires unsafe for the libc::ioctl call
    #[allow(unsafe_code)]
    fn resize(
        &mut self,
        cols: u16,
        rows: u16,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let Some(ref master) = self.master else {
                return;
            };
            let ws = Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };

            // SAFETY: TIOCSWINSZ is a well-defined ioctl that sets the
            // window size on the PTY master fd. The Winsize struct is
            // properly initialized. The ioctl also delivers SIGWINCH to the
            // child.
            let ret = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
            if ret < 0 {
                warn!("TIOCSWINSZ ioctl failed: {}", io::Error::last_os_error());
            }
        })
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
            debug!(reason, "closing pty session");

            // EOF at an idle prompt lets the shell exit cleanly (status 0);
            // the escalation task covers children that ignore it.
            if let Some(ref master) = self.master {
                let _ = master.write_all(b"\x04").await;
            }
            if let Some(child) = self.child {
                tokio::spawn(escalate_kill(child));
            }
        })
    }
}

impl Drop for PtyAdapter {
    fn drop(&mut self) {
        // Best-effort teardown: SIGHUP then SIGKILL.
        if let Some(child) = self.child {
            let _ = kill(child, Signal::SIGHUP);
            std::thread::sleep(Duration::from_millis(50));
            let _ = kill(child, Signal::SIGKILL);
            let _ = waitpid(child, Some(WaitPidFlag::WNOHANG));
        }
    }
}

/// Read loop: master fd → `pty:stdout/chunk` events, then the terminal
/// `system:status/exit` once the child is reaped.
async fn pump_output(master: Arc<Master>, sink: EventSink, child: Pid, session_id: String) {
    let engine = base64::engine::general_purpose::STANDARD;
    let mut buf = vec![0u8; 8192];

    loop {
        match master.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let payload = serde_json::json!({ "data": engine.encode(&buf[..n]) });
                sink.emit(Emission::new(channel::PTY_STDOUT, event_type::CHUNK, payload)).await;
            }
            // EIO is the normal end-of-stream signal once the slave side
            // closes.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
            Err(e) => {
                debug!(session = %session_id, "pty read failed: {e}");
                break;
            }
        }
    }

    // Reap on a blocking thread to avoid stalling the runtime.
    let code = match tokio::task::spawn_blocking(move || wait_for_exit(child)).await {
        Ok(Ok(code)) => code,
        Ok(Err(e)) => {
            warn!(session = %session_id, "waitpid failed: {e}");
            1
        }
        Err(e) => {
            warn!(session = %session_id, "reap task failed: {e}");
            1
        }
    };
    sink.emit(Emission::exit(code)).await;
}

/// Give the child a grace period after EOF, then SIGHUP, then SIGKILL.
async fn escalate_kill(child: Pid) {
    tokio::time::sleep(Duration::from_secs(2)).await;
    if kill(child, None).is_err() {
        return;
    }
    let _ = kill(child, Signal::SIGHUP);
    tokio::time::sleep(Duration::from_secs(1)).await;
    if kill(child, None).is_ok() {
        let _ = kill(child, Signal::SIGKILL);
    }
}

/// Block until the child exits; signals map to `128 + signo`.
fn wait_for_exit(pid: Pid) -> anyhow::Result<i64> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(i64::from(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(128 + sig as i64),
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => anyhow::bail!("waitpid failed: {e}"),
        }
    }
}

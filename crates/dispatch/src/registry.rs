// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session registry: the in-memory directory of live adapters.
//!
//! Each running session is one `LiveSession` entry: a router handle and a
//! command channel into a driver task that exclusively owns the boxed
//! adapter, so every adapter call is serialized. A shared reaper loop
//! consumes router exit notices, writes the final status, and drops the
//! entry — at most one live adapter per session id at any instant.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{Adapter, AdapterContext, AdapterFactories};
use crate::error::{ErrorCode, Fault};
use crate::event::{epoch_ms, Emission};
use crate::router::{self, RouterExit, RouterHandle, RouterOutcome, Subscription};
use crate::store::{EventStore, SessionRow, SessionStatus};

/// Commands routed to a session's driver task.
#[derive(Debug)]
enum AdapterCommand {
    Write(serde_json::Value),
    Resize { cols: u16, rows: u16 },
    Close { reason: String },
}

struct LiveSession {
    kind: String,
    router: RouterHandle,
    cmd_tx: mpsc::Sender<AdapterCommand>,
}

/// Directory of live adapter instances, keyed by run id.
pub struct Registry {
    store: Arc<EventStore>,
    factories: AdapterFactories,
    live: Arc<RwLock<HashMap<String, LiveSession>>>,
    exit_tx: mpsc::Sender<RouterExit>,
    shutdown: CancellationToken,
}

impl Registry {
    /// Build the registry and spawn its reaper loop.
    pub fn new(
        store: Arc<EventStore>,
        factories: AdapterFactories,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (exit_tx, exit_rx) = mpsc::channel(64);
        let live = Arc::new(RwLock::new(HashMap::new()));
        tokio::spawn(reap(Arc::clone(&store), Arc::clone(&live), exit_rx, shutdown.clone()));
        Arc::new(Self { store, factories, live, exit_tx, shutdown })
    }

    /// Create a new session: write the row, instantiate the adapter for
    /// `kind`, and start it bound to a fresh router.
    pub async fn start(
        &self,
        kind: &str,
        config: serde_json::Value,
        owner: &str,
    ) -> Result<String, Fault> {
        // Resolve the factory before any row exists, so an unknown kind
        // leaves no trace.
        let adapter = self.factories.create(kind, &config)?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = epoch_ms();
        let row = SessionRow {
            id: id.clone(),
            kind: kind.to_owned(),
            status: SessionStatus::Starting,
            owner: owner.to_owned(),
            metadata: config,
            created_at: now,
            updated_at: now,
        };
        self.store.create_session(&row)?;

        info!(session = %id, kind, "starting session");
        self.launch(id, kind.to_owned(), adapter).await
    }

    /// Re-instantiate the adapter for a previously stopped session. The
    /// resumed session shares the id and continues the same event log.
    pub async fn resume(&self, id: &str) -> Result<(), Fault> {
        let row = self.store.get_session(id)?;
        if self.live.read().await.contains_key(id) {
            return Err(Fault::new(
                ErrorCode::AlreadyRunning,
                format!("session already running: {id}"),
            ));
        }
        let adapter = self.factories.create(&row.kind, &row.metadata)?;
        self.store.update_session_status(id, SessionStatus::Starting, epoch_ms())?;

        info!(session = %id, kind = %row.kind, "resuming session");
        self.launch(row.id, row.kind, adapter).await.map(|_| ())
    }

    /// Common start/resume path: reserve the live slot, start the adapter,
    /// and hand it to a driver task.
    async fn launch(
        &self,
        id: String,
        kind: String,
        mut adapter: Box<dyn Adapter>,
    ) -> Result<String, Fault> {
        let (router, cmd_rx) = {
            let mut live = self.live.write().await;
            if live.contains_key(&id) {
                return Err(Fault::new(
                    ErrorCode::AlreadyRunning,
                    format!("session already running: {id}"),
                ));
            }
            let router =
                router::spawn(id.clone(), Arc::clone(&self.store), self.exit_tx.clone());
            let (cmd_tx, cmd_rx) = mpsc::channel(64);
            live.insert(id.clone(), LiveSession { kind, router: router.clone(), cmd_tx });
            (router, cmd_rx)
        };

        let ctx = AdapterContext {
            session_id: id.clone(),
            shutdown: self.shutdown.child_token(),
        };

        match adapter.start(ctx, router.sink()).await {
            Ok(()) => {
                if let Err(fault) =
                    self.store.update_session_status(&id, SessionStatus::Running, epoch_ms())
                {
                    // The terminal fault event makes the reaper drop the
                    // half-started entry.
                    router.sink().emit(Emission::fatal(&fault.message)).await;
                    return Err(fault);
                }
                tokio::spawn(drive(adapter, cmd_rx));
                Ok(id)
            }
            Err(e) => {
                warn!(session = %id, "adapter start failed: {e:#}");
                // The terminal error event takes the normal path; the reaper
                // removes the slot and writes the error status.
                router.sink().emit(Emission::fatal(&format!("start failed: {e:#}"))).await;
                Err(Fault::new(ErrorCode::AdapterFailed, format!("start failed: {e:#}")))
            }
        }
    }

    /// Deliver input to the live adapter.
    pub async fn input(&self, id: &str, data: serde_json::Value) -> Result<(), Fault> {
        self.command(id, AdapterCommand::Write(data)).await
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), Fault> {
        self.command(id, AdapterCommand::Resize { cols, rows }).await
    }

    /// Cooperative close; the final status lands when the adapter's
    /// terminal event is reaped.
    pub async fn close(&self, id: &str, reason: &str) -> Result<(), Fault> {
        self.command(id, AdapterCommand::Close { reason: reason.to_owned() }).await
    }

    async fn command(&self, id: &str, cmd: AdapterCommand) -> Result<(), Fault> {
        let cmd_tx = {
            let live = self.live.read().await;
            let Some(entry) = live.get(id) else {
                return Err(Fault::not_running(id));
            };
            entry.cmd_tx.clone()
        };
        cmd_tx.send(cmd).await.map_err(|_| Fault::not_running(id))
    }

    /// Subscribe a gateway attachment to the live router, if any.
    pub async fn subscribe(&self, id: &str, buffer: usize) -> Option<Subscription> {
        let router = {
            let live = self.live.read().await;
            live.get(id).map(|entry| entry.router.clone())
        }?;
        router.subscribe(buffer).await
    }

    /// Whether the session currently has a live adapter.
    pub async fn is_live(&self, id: &str) -> bool {
        self.live.read().await.contains_key(id)
    }

    /// Kind of the live adapter, if any.
    pub async fn live_kind(&self, id: &str) -> Option<String> {
        self.live.read().await.get(id).map(|entry| entry.kind.clone())
    }

    /// Close every live adapter (process shutdown).
    pub async fn shutdown_all(&self) {
        let targets: Vec<_> = {
            let live = self.live.read().await;
            live.values().map(|entry| entry.cmd_tx.clone()).collect()
        };
        for cmd_tx in targets {
            let _ = cmd_tx.send(AdapterCommand::Close { reason: "shutdown".to_owned() }).await;
        }
    }
}

/// Driver task: exclusive owner of one boxed adapter. Ends when the reaper
/// drops the live entry (closing the command channel); the adapter is
/// dropped here, releasing the OS resource if it still holds one.
async fn drive(mut adapter: Box<dyn Adapter>, mut cmd_rx: mpsc::Receiver<AdapterCommand>) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            AdapterCommand::Write(data) => adapter.write(data).await,
            AdapterCommand::Resize { cols, rows } => adapter.resize(cols, rows).await,
            AdapterCommand::Close { reason } => adapter.close(&reason).await,
        }
    }
}

/// Reaper loop: one per registry, shared by all routers. Applies the final
/// status and removes the live entry once a session's router ends.
async fn reap(
    store: Arc<EventStore>,
    live: Arc<RwLock<HashMap<String, LiveSession>>>,
    mut exit_rx: mpsc::Receiver<RouterExit>,
    shutdown: CancellationToken,
) {
    loop {
        let exit = tokio::select! {
            _ = shutdown.cancelled() => break,
            exit = exit_rx.recv() => match exit {
                Some(exit) => exit,
                None => break,
            },
        };

        let RouterExit { session_id, outcome } = exit;
        live.write().await.remove(&session_id);

        let status = match &outcome {
            RouterOutcome::Terminal(record) => match record.exit_code() {
                Some(code) if code != 0 => SessionStatus::Error,
                _ => {
                    if record.event_type == crate::event::event_type::ERROR {
                        SessionStatus::Error
                    } else {
                        SessionStatus::Stopped
                    }
                }
            },
            RouterOutcome::StoreFault(_) => SessionStatus::Error,
        };

        debug!(session = %session_id, %status, "session ended");
        if let Err(e) = store.update_session_status(&session_id, status, epoch_ms()) {
            warn!(session = %session_id, "failed to record final status: {e}");
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;

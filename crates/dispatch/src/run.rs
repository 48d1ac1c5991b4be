// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level server runner — shared by `main` and the spec tests.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::adapter::AdapterFactories;
use crate::config::Config;
use crate::registry::Registry;
use crate::state::AppState;
use crate::store::EventStore;
use crate::transport::build_router;

/// A bound, not-yet-serving server.
///
/// Returned by [`prepare`] so callers (tests in particular) can reach
/// [`AppState`] and the resolved address before entering [`serve`].
pub struct PreparedServer {
    pub state: Arc<AppState>,
    pub addr: SocketAddr,
    listener: TcpListener,
}

impl PreparedServer {
    /// Serve until the shutdown token fires, then close every live adapter.
    pub async fn serve(self) -> anyhow::Result<()> {
        let shutdown = self.state.shutdown.clone();
        let registry = Arc::clone(&self.state.registry);
        let router = build_router(Arc::clone(&self.state));

        info!("listening on {}", self.addr);
        axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        // Refuse-new-connections has happened; now close adapters. In-flight
        // appends complete on the routers before they observe the terminals.
        registry.shutdown_all().await;
        Ok(())
    }

    /// Spawn [`serve`] in the background; used by the spec tests.
    pub fn spawn(self) -> (Arc<AppState>, SocketAddr) {
        let state = Arc::clone(&self.state);
        let addr = self.addr;
        tokio::spawn(async move {
            if let Err(e) = self.serve().await {
                error!("server error: {e:#}");
            }
        });
        (state, addr)
    }
}

/// Run a dispatch server to completion.
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);
    let prepared = prepare(config).await?;
    spawn_signal_handler(prepared.state.shutdown.clone());
    prepared.serve().await
}

/// Initialize tracing/logging from config.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    // Priority: --log-level / DISPATCH_LOG_LEVEL > RUST_LOG > default.
    let filter = if std::env::var("DISPATCH_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Explicit composition root: store, factories, registry, state, listener.
pub async fn prepare(config: Config) -> anyhow::Result<PreparedServer> {
    let shutdown = CancellationToken::new();

    let store = Arc::new(EventStore::open(&config.db, config.max_payload)?);
    let factories = AdapterFactories::builtin();
    let registry = Registry::new(Arc::clone(&store), factories, shutdown.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    let addr = listener.local_addr()?;

    let state = Arc::new(AppState::new(config, store, registry, shutdown));
    Ok(PreparedServer { state, addr, listener })
}

/// First SIGTERM/SIGINT triggers graceful shutdown; a second forces exit.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
            }
        }
        shutdown.cancel();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM again, forcing exit");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT again, forcing exit");
            }
        }
        std::process::exit(130);
    });
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::registry::Registry;
use crate::store::EventStore;

/// Shared application state handed to every transport handler.
pub struct AppState {
    pub config: Config,
    pub store: Arc<EventStore>,
    pub registry: Arc<Registry>,
    pub shutdown: CancellationToken,
    /// Flips to true when the external auth layer revokes the credential
    /// backing current connections; the gateway forwards `session-expired`.
    expired_tx: watch::Sender<bool>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<EventStore>,
        registry: Arc<Registry>,
        shutdown: CancellationToken,
    ) -> Self {
        let (expired_tx, _) = watch::channel(false);
        Self { config, store, registry, shutdown, expired_tx }
    }

    /// Signal every open gateway connection that its auth session expired.
    pub fn expire_connections(&self) {
        let _ = self.expired_tx.send(true);
    }

    pub fn expired(&self) -> watch::Receiver<bool> {
        self.expired_tx.subscribe()
    }
}

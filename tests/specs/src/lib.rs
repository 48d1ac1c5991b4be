// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end spec scenarios.
//!
//! Boots a real dispatch server in-process on an ephemeral port and
//! exercises it over HTTP and WebSocket, exactly as an external client
//! would. The echo adapter from `dispatch::test_support` is registered so
//! scenarios can generate deterministic event streams without a child
//! process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use dispatch::config::Config;
use dispatch::registry::Registry;
use dispatch::state::AppState;
use dispatch::store::EventStore;
use dispatch::test_support::factories_with_echo;
use dispatch::transport::build_router;

const TIMEOUT: Duration = Duration::from_secs(10);

/// A dispatch server running in-process; shut down on drop.
pub struct TestServer {
    pub state: Arc<AppState>,
    pub addr: SocketAddr,
    _db_dir: tempfile::TempDir,
}

impl TestServer {
    /// Boot a server on an ephemeral port with a fresh on-disk store.
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(|config| config).await
    }

    /// Boot a server after applying `adjust` to the default test config.
    pub async fn start_with(
        adjust: impl FnOnce(Config) -> Config,
    ) -> anyhow::Result<Self> {
        let db_dir = tempfile::tempdir()?;
        let mut config = Config::default();
        config.db = db_dir.path().join("dispatch.db");
        config.log_level = "warn".to_owned();
        config.log_format = "text".to_owned();
        let config = adjust(config);
        dispatch::run::init_tracing(&config);

        let shutdown = CancellationToken::new();
        let store = Arc::new(EventStore::open(&config.db, config.max_payload)?);
        let registry =
            Registry::new(Arc::clone(&store), factories_with_echo(), shutdown.clone());
        let state = Arc::new(AppState::new(config, store, registry, shutdown.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let router = build_router(Arc::clone(&state));
        tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await;
        });

        Ok(Self { state, addr, _db_dir: db_dir })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Open a gateway connection and complete the hello handshake.
    pub async fn connect(&self, client_id: &str) -> anyhow::Result<WsClient> {
        let mut client = WsClient::connect(&self.ws_url()).await?;
        client
            .send(serde_json::json!({ "frame": "hello", "clientId": client_id }))
            .await?;
        let reply = client.next_frame().await?;
        anyhow::ensure!(reply["frame"] == "hello-ok", "handshake failed: {reply}");
        Ok(client)
    }

    /// Create a session over the control plane and return its run id.
    pub async fn create_session(
        &self,
        kind: &str,
        config: serde_json::Value,
    ) -> anyhow::Result<String> {
        let resp: serde_json::Value = reqwest::Client::new()
            .post(format!("{}/api/v1/sessions", self.base_url()))
            .json(&serde_json::json!({ "kind": kind, "config": config }))
            .send()
            .await?
            .json()
            .await?;
        resp["run_id"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| anyhow::anyhow!("no run_id in response: {resp}"))
    }

    /// Fetch stored history for a run.
    pub async fn history(
        &self,
        run_id: &str,
        since_seq: i64,
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        let resp: serde_json::Value = reqwest::get(format!(
            "{}/api/v1/sessions/{run_id}/history?since_seq={since_seq}",
            self.base_url()
        ))
        .await?
        .json()
        .await?;
        resp["events"]
            .as_array()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no events in response: {resp}"))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
    }
}

/// Thin JSON-frame wrapper over a tungstenite WebSocket.
pub struct WsClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let (ws, _) = tokio_tungstenite::connect_async(url).await?;
        Ok(Self { ws })
    }

    pub async fn send(&mut self, frame: serde_json::Value) -> anyhow::Result<()> {
        self.ws.send(Message::Text(frame.to_string().into())).await?;
        Ok(())
    }

    /// Next text frame as JSON; non-text frames are skipped.
    pub async fn next_frame(&mut self) -> anyhow::Result<serde_json::Value> {
        loop {
            let msg = tokio::time::timeout(TIMEOUT, self.ws.next())
                .await
                .map_err(|_| anyhow::anyhow!("timed out waiting for frame"))?
                .ok_or_else(|| anyhow::anyhow!("ws stream ended"))??;
            match msg {
                Message::Text(text) => return Ok(serde_json::from_str(&text)?),
                Message::Close(_) => anyhow::bail!("ws closed"),
                _ => continue,
            }
        }
    }

    /// Next `event` frame, skipping everything else.
    pub async fn next_event(&mut self) -> anyhow::Result<serde_json::Value> {
        loop {
            let frame = self.next_frame().await?;
            if frame["frame"] == "event" {
                return Ok(frame);
            }
        }
    }

    /// Collect `count` event frames.
    pub async fn collect_events(
        &mut self,
        count: usize,
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        let mut events = Vec::with_capacity(count);
        while events.len() < count {
            events.push(self.next_event().await?);
        }
        Ok(events)
    }

    /// Attach to a run and consume the attach-ok response.
    pub async fn attach(&mut self, run_id: &str, since_seq: i64) -> anyhow::Result<serde_json::Value> {
        self.send(serde_json::json!({
            "frame": "attach",
            "runId": run_id,
            "sinceSeq": since_seq,
        }))
        .await?;
        let reply = self.next_frame().await?;
        anyhow::ensure!(reply["frame"] == "attach-ok", "attach failed: {reply}");
        Ok(reply)
    }

    pub async fn input(&mut self, run_id: &str, data: serde_json::Value) -> anyhow::Result<()> {
        self.send(serde_json::json!({ "frame": "input", "runId": run_id, "data": data })).await
    }
}

/// Decode the base64 `data` field of a `pty:stdout` chunk payload.
pub fn decode_chunk(event: &serde_json::Value) -> anyhow::Result<Vec<u8>> {
    use base64::Engine;
    let data = event["payload"]["data"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("chunk without data: {event}"))?;
    Ok(base64::engine::general_purpose::STANDARD.decode(data)?)
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Attachment gateway: the bidirectional WebSocket between clients and the
//! core.
//!
//! One connection multiplexes any number of session attachments. The attach
//! path subscribes to the live router *before* reading the store, then
//! replays stored events and relays live deliveries while skipping anything
//! already replayed — so a client that re-attaches from its last delivered
//! seq sees no gap and no duplicate.

pub mod protocol;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::router::{Delivery, DROP_BACKPRESSURE};
use crate::state::AppState;
use crate::transport::auth;

use protocol::{ClientMessage, ServerMessage};

/// Query parameters for the WS upgrade.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Auth token (the WS handshake cannot carry headers from browsers).
    pub token: Option<String>,
}

/// `GET /ws` — WebSocket upgrade for the attachment gateway.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let policy = auth::AuthPolicy::from_token(state.config.auth_token.as_deref());
    if policy.authorize_query(query.token.as_deref()).is_err() {
        return axum::http::Response::builder()
            .status(401)
            .body(axum::body::Body::from("unauthorized"))
            .unwrap_or_default()
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_connection(state, socket)).into_response()
}

/// Per-connection loop: inbound frames on this task, outbound frames
/// through a bounded channel drained by a writer task.
async fn handle_connection(state: Arc<AppState>, socket: WebSocket) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<ServerMessage>(256);
    let writer = tokio::spawn(write_frames(ws_tx, out_rx));

    let mut expired_rx = state.expired();
    let mut attachments: HashMap<String, CancellationToken> = HashMap::new();
    let mut client_id: Option<String> = None;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            changed = expired_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if *expired_rx.borrow() {
                    let _ = out_tx.send(ServerMessage::SessionExpired {}).await;
                    break;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&state, &out_tx, &mut attachments, &mut client_id, &text)
                            .await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    // Disconnect tears down this connection's attachments; sessions are
    // unaffected.
    for (_, cancel) in attachments.drain() {
        cancel.cancel();
    }
    drop(out_tx);
    let _ = writer.await;
}

async fn handle_frame(
    state: &Arc<AppState>,
    out_tx: &mpsc::Sender<ServerMessage>,
    attachments: &mut HashMap<String, CancellationToken>,
    client_id: &mut Option<String>,
    text: &str,
) {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            let _ = out_tx
                .send(ServerMessage::Error {
                    run_id: None,
                    message: format!("malformed message: {e}"),
                })
                .await;
            return;
        }
    };

    match msg {
        ClientMessage::Hello { id, client_id: cid } => {
            debug!(client = %cid, "hello");
            *client_id = Some(cid);
            let _ = out_tx.send(ServerMessage::HelloOk { id }).await;
        }

        ClientMessage::Attach { id, run_id, since_seq } => {
            if attachments.contains_key(&run_id) {
                let _ = out_tx
                    .send(ServerMessage::AttachError {
                        id,
                        run_id,
                        reason: "already attached".to_owned(),
                    })
                    .await;
                return;
            }
            let cancel = CancellationToken::new();
            attachments.insert(run_id.clone(), cancel.clone());
            tokio::spawn(run_attachment(
                Arc::clone(state),
                out_tx.clone(),
                run_id,
                since_seq,
                id,
                cancel,
            ));
        }

        ClientMessage::Detach { id, run_id } => {
            if let Some(cancel) = attachments.remove(&run_id) {
                cancel.cancel();
            }
            let _ = out_tx.send(ServerMessage::DetachOk { id, run_id }).await;
        }

        ClientMessage::Input { id: _, run_id, data } => {
            if let Err(fault) = state.registry.input(&run_id, data).await {
                let _ = out_tx
                    .send(ServerMessage::Error {
                        run_id: Some(run_id),
                        message: fault.message,
                    })
                    .await;
            }
        }

        ClientMessage::Resize { id, run_id, cols, rows } => {
            let reply = match state.registry.resize(&run_id, cols, rows).await {
                Ok(()) => ServerMessage::ResizeOk { id, run_id },
                Err(fault) => {
                    ServerMessage::ResizeError { id, run_id, reason: fault.message }
                }
            };
            let _ = out_tx.send(reply).await;
        }

        ClientMessage::Close { id, run_id } => {
            let reply = match state.registry.close(&run_id, "client close").await {
                Ok(()) => ServerMessage::CloseOk { id, run_id },
                Err(fault) => ServerMessage::CloseError { id, run_id, reason: fault.message },
            };
            let _ = out_tx.send(reply).await;
        }
    }
}

/// One attachment: replay from the cursor, then follow the live stream.
async fn run_attachment(
    state: Arc<AppState>,
    out: mpsc::Sender<ServerMessage>,
    run_id: String,
    since_seq: i64,
    corr: Option<String>,
    cancel: CancellationToken,
) {
    let row = match state.store.get_session(&run_id) {
        Ok(row) => row,
        Err(fault) => {
            let _ = out
                .send(ServerMessage::AttachError {
                    id: corr,
                    run_id,
                    reason: fault.message,
                })
                .await;
            return;
        }
    };

    // Subscribe before the replay read so nothing emitted during replay can
    // fall between the stored prefix and the live stream.
    let sub = state.registry.subscribe(&run_id, state.config.sub_buffer).await;

    let replay = match state.store.read_events_since(&run_id, since_seq, None) {
        Ok(events) => events,
        Err(fault) => {
            let _ = out
                .send(ServerMessage::AttachError {
                    id: corr,
                    run_id,
                    reason: fault.message,
                })
                .await;
            return;
        }
    };

    if out
        .send(ServerMessage::AttachOk {
            id: corr,
            run_id: run_id.clone(),
            kind: row.kind,
            status: row.status,
        })
        .await
        .is_err()
    {
        return;
    }

    let mut last_seq = since_seq;
    for record in replay {
        if cancel.is_cancelled() {
            return;
        }
        if out.send(ServerMessage::event(&run_id, &record)).await.is_err() {
            return;
        }
        last_seq = record.seq;
    }

    // No live router (stopped session): history is all there is.
    let Some(mut sub) = sub else {
        return;
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            delivery = sub.rx.recv() => match delivery {
                Some(Delivery::Event(record)) => {
                    // Anything at or below the replay cursor was already
                    // delivered from the store.
                    if record.seq <= last_seq {
                        continue;
                    }
                    if out.send(ServerMessage::event(&run_id, &record)).await.is_err() {
                        return;
                    }
                    last_seq = record.seq;
                }
                Some(Delivery::Fault(message)) => {
                    let _ = out
                        .send(ServerMessage::Error { run_id: Some(run_id.clone()), message })
                        .await;
                }
                None => {
                    if sub.drop_reason() == Some(DROP_BACKPRESSURE) {
                        let _ = out
                            .send(ServerMessage::Error {
                                run_id: Some(run_id.clone()),
                                message: "backpressure: subscription dropped, re-attach from your last seq".to_owned(),
                            })
                            .await;
                    }
                    return;
                }
            }
        }
    }
}

/// Writer task: drains the outbound channel into the socket.
async fn write_frames(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerMessage>,
) {
    while let Some(msg) = rx.recv().await {
        let Ok(json) = serde_json::to_string(&msg) else {
            continue;
        };
        if ws_tx.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.close().await;
}

#[cfg(test)]
#[path = "gateway_tests.rs"]
mod tests;

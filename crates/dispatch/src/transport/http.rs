// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-plane HTTP handlers consumed by the external HTTP layer.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use crate::error::Fault;
use crate::event::EventRecord;
use crate::store::{LayoutRow, SessionFilter, SessionRow};
use crate::state::AppState;

use super::auth::Principal;

impl IntoResponse for Fault {
    fn into_response(self) -> Response {
        self.code.to_http_response(self.message).into_response()
    }
}

/// `GET /api/v1/health`
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub run_id: String,
}

/// `POST /api/v1/sessions` — create and start a session.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    principal: Option<Extension<Principal>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, Fault> {
    let owner = principal.map(|Extension(p)| p.0).unwrap_or_else(|| "local".to_owned());
    let run_id = state.registry.start(&req.kind, req.config, &owner).await?;
    Ok(Json(CreateSessionResponse { run_id }))
}

/// `GET /api/v1/sessions?kind=&status=`
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<SessionFilter>,
) -> Result<Json<Vec<SessionRow>>, Fault> {
    Ok(Json(state.store.list_sessions(&filter)?))
}

/// `GET /api/v1/sessions/{id}`
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionRow>, Fault> {
    Ok(Json(state.store.get_session(&id)?))
}

/// `POST /api/v1/sessions/{id}/resume`
pub async fn resume_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, Fault> {
    state.registry.resume(&id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// `DELETE /api/v1/sessions/{id}` — close the session. A status
/// transition, never a row delete.
pub async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, Fault> {
    state.registry.close(&id, "api close").await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub since_seq: i64,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub run_id: String,
    pub events: Vec<EventRecord>,
}

/// `GET /api/v1/sessions/{id}/history?since_seq=&limit=`
pub async fn session_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, Fault> {
    // Verify the session exists so an unknown run id is distinguishable
    // from an empty log.
    state.store.get_session(&id)?;
    let events = state.store.read_events_since(&id, query.since_seq, query.limit)?;
    Ok(Json(HistoryResponse { run_id: id, events }))
}

#[derive(Debug, Deserialize)]
pub struct LayoutQuery {
    pub client_id: String,
}

/// `GET /api/v1/layout?client_id=`
pub async fn get_layout(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LayoutQuery>,
) -> Result<Json<Vec<LayoutRow>>, Fault> {
    Ok(Json(state.store.get_layout(&query.client_id)?))
}

#[derive(Debug, Deserialize)]
pub struct SetLayoutRequest {
    pub client_id: String,
    pub run_id: String,
    pub tile_id: String,
}

/// `PUT /api/v1/layout`
pub async fn set_layout(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetLayoutRequest>,
) -> Result<Json<serde_json::Value>, Fault> {
    state.store.set_layout(
        &req.client_id,
        &req.run_id,
        &req.tile_id,
        crate::event::epoch_ms(),
    )?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct RemoveLayoutQuery {
    pub client_id: String,
    pub run_id: String,
}

/// `DELETE /api/v1/layout?client_id=&run_id=`
pub async fn remove_layout(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RemoveLayoutQuery>,
) -> Result<Json<serde_json::Value>, Fault> {
    state.store.remove_layout(&query.client_id, &query.run_id)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;

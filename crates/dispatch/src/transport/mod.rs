// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport wiring.

pub mod auth;
pub mod http;

use std::sync::Arc;

use axum::middleware;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::gateway;
use crate::state::AppState;

/// Build the axum `Router` with the control plane and the gateway.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/api/v1/health", get(http::health))
        // Session control plane
        .route(
            "/api/v1/sessions",
            axum::routing::post(http::create_session).get(http::list_sessions),
        )
        .route(
            "/api/v1/sessions/{id}",
            get(http::get_session).delete(http::close_session),
        )
        .route("/api/v1/sessions/{id}/resume", axum::routing::post(http::resume_session))
        .route("/api/v1/sessions/{id}/history", get(http::session_history))
        // Workspace layout
        .route(
            "/api/v1/layout",
            get(http::get_layout).put(http::set_layout).delete(http::remove_layout),
        )
        // Attachment gateway
        .route("/ws", get(gateway::ws_handler))
        // Middleware
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Request authentication for the control plane and the gateway.
//!
//! Credential management lives outside the core; dispatch only checks the
//! statically configured bearer token and resolves the principal the rest
//! of the system receives. Browsers cannot attach headers to a WebSocket
//! upgrade, so the gateway accepts the same token as a `?token=` query
//! parameter instead.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::{ErrorCode, ErrorResponse};
use crate::state::AppState;

/// The authenticated principal resolved for a request.
///
/// Dispatch is single-user; every accepted credential maps to the same
/// local principal, which the registry records as the session owner.
#[derive(Debug, Clone)]
pub struct Principal(pub String);

impl Principal {
    fn local() -> Self {
        Self("local".to_owned())
    }
}

/// How this deployment authenticates requests.
#[derive(Debug, Clone)]
pub enum AuthPolicy {
    /// No token configured: a trusted local deployment.
    Open,
    /// Every request must present this static bearer token.
    Bearer(String),
}

impl AuthPolicy {
    pub fn from_token(token: Option<&str>) -> Self {
        match token {
            Some(token) if !token.is_empty() => Self::Bearer(token.to_owned()),
            _ => Self::Open,
        }
    }

    /// Authorize an HTTP request by its `Authorization: Bearer` header.
    pub fn authorize_header(&self, headers: &HeaderMap) -> Result<Principal, ErrorCode> {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        self.authorize(presented)
    }

    /// Authorize a WebSocket upgrade by its query-string token.
    pub fn authorize_query(&self, token: Option<&str>) -> Result<Principal, ErrorCode> {
        self.authorize(token)
    }

    fn authorize(&self, presented: Option<&str>) -> Result<Principal, ErrorCode> {
        match self {
            Self::Open => Ok(Principal::local()),
            Self::Bearer(expected) => match presented {
                Some(presented) if tokens_match(presented, expected) => Ok(Principal::local()),
                _ => Err(ErrorCode::Unauthorized),
            },
        }
    }
}

/// Token comparison whose duration does not depend on where the first
/// mismatching byte sits. The length difference is folded into the
/// accumulator so equal-prefix tokens of different lengths are rejected on
/// the same code path.
fn tokens_match(presented: &str, expected: &str) -> bool {
    let presented = presented.as_bytes();
    let expected = expected.as_bytes();
    let mut diff = presented.len() ^ expected.len();
    for (a, b) in presented.iter().zip(expected.iter()) {
        diff |= usize::from(a ^ b);
    }
    diff == 0
}

/// Middleware guarding the control plane.
///
/// `/api/v1/health` stays open as a liveness probe; `/ws` defers to the
/// gateway handler, which authorizes the upgrade from its query string.
pub async fn auth_layer(
    state: State<Arc<AppState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if path == "/api/v1/health" || path == "/ws" {
        return next.run(req).await;
    }

    let policy = AuthPolicy::from_token(state.config.auth_token.as_deref());
    match policy.authorize_header(req.headers()) {
        Ok(principal) => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(code) => {
            let status = StatusCode::from_u16(code.http_status())
                .unwrap_or(StatusCode::UNAUTHORIZED);
            let body = ErrorResponse {
                error: code.to_error_body("invalid or missing bearer token"),
            };
            (status, axum::Json(body)).into_response()
        }
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;

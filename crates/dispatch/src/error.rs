// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

/// Unified error codes shared across the store, registry, and transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    BadRequest,
    UnknownKind,
    UnknownSession,
    NotFound,
    AlreadyExists,
    AlreadyRunning,
    NotRunning,
    PayloadTooLarge,
    AdapterFailed,
    StoreFailed,
    Backpressure,
    Unauthorized,
    SessionExpired,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::UnknownKind => 400,
            Self::UnknownSession => 404,
            Self::NotFound => 404,
            Self::AlreadyExists => 409,
            Self::AlreadyRunning => 409,
            Self::NotRunning => 409,
            Self::PayloadTooLarge => 413,
            Self::AdapterFailed => 502,
            Self::StoreFailed => 500,
            Self::Backpressure => 503,
            Self::Unauthorized => 401,
            Self::SessionExpired => 401,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::UnknownKind => "UNKNOWN_KIND",
            Self::UnknownSession => "UNKNOWN_SESSION",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::NotRunning => "NOT_RUNNING",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::AdapterFailed => "ADAPTER_FAILED",
            Self::StoreFailed => "STORE_FAILED",
            Self::Backpressure => "BACKPRESSURE",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into() }
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, Json(body))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure carried across component boundaries.
///
/// Internal plumbing uses `anyhow`; operations that clients can observe
/// return `Fault` so transports can map the code without string matching.
#[derive(Debug, Clone)]
pub struct Fault {
    pub code: ErrorCode,
    pub message: String,
}

impl Fault {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn unknown_session(id: &str) -> Self {
        Self::new(ErrorCode::UnknownSession, format!("unknown session: {id}"))
    }

    pub fn not_running(id: &str) -> Self {
        Self::new(ErrorCode::NotRunning, format!("session has no live adapter: {id}"))
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Fault {}

/// Top-level error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

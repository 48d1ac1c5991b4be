// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

/// Run-session broker for terminals, AI coding agents, and file editors.
#[derive(Debug, Clone, Parser)]
#[command(name = "dispatch", version, about)]
pub struct Config {
    /// HTTP port to listen on.
    #[arg(long, env = "DISPATCH_PORT", default_value = "3030")]
    pub port: u16,

    /// Host address to bind to.
    #[arg(long, env = "DISPATCH_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Bearer token for API authentication (unset = no auth).
    #[arg(long, env = "DISPATCH_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// SQLite database path.
    #[arg(long, env = "DISPATCH_DB", default_value = "dispatch.db")]
    pub db: PathBuf,

    /// Per-subscriber outbound buffer in events before the subscription
    /// is dropped with a backpressure error.
    #[arg(long, env = "DISPATCH_SUB_BUFFER", default_value = "4096")]
    pub sub_buffer: usize,

    /// Maximum event payload size in bytes.
    #[arg(long, env = "DISPATCH_MAX_PAYLOAD", default_value = "1048576")]
    pub max_payload: usize,

    /// Log format (json or text).
    #[arg(long, env = "DISPATCH_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "DISPATCH_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sub_buffer == 0 {
            anyhow::bail!("--sub-buffer must be at least 1");
        }
        if self.max_payload == 0 {
            anyhow::bail!("--max-payload must be at least 1");
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3030,
            host: "127.0.0.1".to_owned(),
            auth_token: None,
            db: PathBuf::from("dispatch.db"),
            sub_buffer: 4096,
            max_payload: 1024 * 1024,
            log_format: "json".to_owned(),
            log_level: "info".to_owned(),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

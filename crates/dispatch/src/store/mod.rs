// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SQLite-backed event store: session table, append-only event log, and the
//! workspace-layout row.
//!
//! The store is the authoritative source for replay and for the next
//! sequence number. All writes go through one connection behind a mutex, so
//! sequence allocation and insertion happen in a single serialized scope and
//! concurrent appends to the same session always produce dense, monotonic
//! seq values. Readers share the same connection; WAL mode keeps individual
//! operations short.

use std::fmt;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, Fault};
use crate::event::EventRecord;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id         TEXT PRIMARY KEY,
    kind       TEXT NOT NULL,
    status     TEXT NOT NULL,
    owner      TEXT NOT NULL,
    metadata   TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_kind ON sessions(kind);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

CREATE TABLE IF NOT EXISTS events (
    session_id TEXT NOT NULL,
    seq        INTEGER NOT NULL,
    channel    TEXT NOT NULL,
    type       TEXT NOT NULL,
    payload    TEXT NOT NULL,
    ts         INTEGER NOT NULL,
    PRIMARY KEY (session_id, seq)
);

CREATE TABLE IF NOT EXISTS layouts (
    client_id  TEXT NOT NULL,
    session_id TEXT NOT NULL,
    tile_id    TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (session_id, client_id)
);
";

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: String,
    pub kind: String,
    pub status: SessionStatus,
    pub owner: String,
    pub metadata: serde_json::Value,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Filter for [`EventStore::list_sessions`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionFilter {
    pub kind: Option<String>,
    pub status: Option<SessionStatus>,
}

/// A persisted UI placement row: which tile a session occupies for a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutRow {
    pub client_id: String,
    pub session_id: String,
    pub tile_id: String,
    pub updated_at: u64,
}

/// Append-only event store plus the mutable session table.
pub struct EventStore {
    conn: Mutex<Connection>,
    max_payload: usize,
    /// Countdown to an injected append failure (tests only).
    #[cfg(feature = "test_hooks")]
    fault_countdown: Mutex<Option<u64>>,
}

impl EventStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, max_payload: usize) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_conn(conn, max_payload))
    }

    /// In-memory store for tests.
    pub fn in_memory(max_payload: usize) -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_conn(conn, max_payload))
    }

    fn from_conn(conn: Connection, max_payload: usize) -> Self {
        Self {
            conn: Mutex::new(conn),
            max_payload,
            #[cfg(feature = "test_hooks")]
            fault_countdown: Mutex::new(None),
        }
    }

    /// Arm an injected failure on the n-th append from now (1-based).
    #[cfg(feature = "test_hooks")]
    pub fn fail_append_after(&self, n: u64) {
        *self.fault_countdown.lock() = Some(n);
    }

    #[cfg(feature = "test_hooks")]
    fn check_fault(&self) -> Result<(), Fault> {
        let mut guard = self.fault_countdown.lock();
        match *guard {
            Some(1) => {
                *guard = None;
                Err(Fault::new(ErrorCode::StoreFailed, "injected append failure"))
            }
            Some(n) => {
                *guard = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Insert a new session row.
    pub fn create_session(&self, row: &SessionRow) -> Result<(), Fault> {
        let metadata = row.metadata.to_string();
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO sessions (id, kind, status, owner, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.id,
                row.kind,
                row.status.as_str(),
                row.owner,
                metadata,
                row.created_at as i64,
                row.updated_at as i64,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Fault::new(ErrorCode::AlreadyExists, format!("session exists: {}", row.id)))
            }
            Err(e) => Err(store_fault(e)),
        }
    }

    pub fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
        updated_at: u64,
    ) -> Result<(), Fault> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), updated_at as i64, id],
            )
            .map_err(store_fault)?;
        if n == 0 {
            return Err(Fault::unknown_session(id));
        }
        Ok(())
    }

    /// Append an event and return its sequence number.
    ///
    /// `seq = MAX(seq) + 1` and the insert happen under one lock, so the
    /// stored seq values for a session are exactly `{1..N}` no matter how
    /// many tasks append concurrently.
    pub fn append_event(
        &self,
        session_id: &str,
        channel: &str,
        event_type: &str,
        payload: &serde_json::Value,
        ts: u64,
    ) -> Result<i64, Fault> {
        let encoded = payload.to_string();
        if encoded.len() > self.max_payload {
            return Err(Fault::new(
                ErrorCode::PayloadTooLarge,
                format!("payload is {} bytes (max {})", encoded.len(), self.max_payload),
            ));
        }

        #[cfg(feature = "test_hooks")]
        self.check_fault()?;

        let conn = self.conn.lock();
        let status: Option<String> = conn
            .query_row("SELECT status FROM sessions WHERE id = ?1", [session_id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(store_fault)?;
        let Some(status) = status else {
            return Err(Fault::unknown_session(session_id));
        };
        // A terminated session's log is closed; resume reopens it by moving
        // the row back to `starting` first.
        if matches!(
            SessionStatus::parse(&status),
            Some(SessionStatus::Stopped) | Some(SessionStatus::Error)
        ) {
            return Err(Fault::not_running(session_id));
        }

        let seq: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .map_err(store_fault)?;

        conn.execute(
            "INSERT INTO events (session_id, seq, channel, type, payload, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![session_id, seq, channel, event_type, encoded, ts as i64],
        )
        .map_err(store_fault)?;

        Ok(seq)
    }

    /// Read events with `seq > since_seq`, ascending.
    pub fn read_events_since(
        &self,
        session_id: &str,
        since_seq: i64,
        limit: Option<u32>,
    ) -> Result<Vec<EventRecord>, Fault> {
        let limit = limit.map(i64::from).unwrap_or(i64::MAX);
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT seq, channel, type, payload, ts
                 FROM events WHERE session_id = ?1 AND seq > ?2
                 ORDER BY seq ASC
                 LIMIT ?3",
            )
            .map_err(store_fault)?;
        let rows = stmt
            .query_map(params![session_id, since_seq, limit], row_to_event)
            .map_err(store_fault)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_fault)?;
        Ok(rows)
    }

    /// Highest stored seq for a session (0 if none).
    pub fn max_seq(&self, session_id: &str) -> Result<i64, Fault> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM events WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )
        .map_err(store_fault)
    }

    pub fn get_session(&self, id: &str) -> Result<SessionRow, Fault> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, kind, status, owner, metadata, created_at, updated_at
             FROM sessions WHERE id = ?1",
            [id],
            row_to_session,
        )
        .optional()
        .map_err(store_fault)?
        .ok_or_else(|| Fault::unknown_session(id))
    }

    pub fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionRow>, Fault> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, kind, status, owner, metadata, created_at, updated_at
                 FROM sessions
                 WHERE (?1 IS NULL OR kind = ?1) AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at ASC",
            )
            .map_err(store_fault)?;
        let rows = stmt
            .query_map(
                params![filter.kind, filter.status.map(|s| s.as_str())],
                row_to_session,
            )
            .map_err(store_fault)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_fault)?;
        Ok(rows)
    }

    /// All layout rows for one client.
    pub fn get_layout(&self, client_id: &str) -> Result<Vec<LayoutRow>, Fault> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT client_id, session_id, tile_id, updated_at
                 FROM layouts WHERE client_id = ?1
                 ORDER BY updated_at ASC",
            )
            .map_err(store_fault)?;
        let rows = stmt
            .query_map([client_id], |row| {
                Ok(LayoutRow {
                    client_id: row.get(0)?,
                    session_id: row.get(1)?,
                    tile_id: row.get(2)?,
                    updated_at: row.get::<_, i64>(3)? as u64,
                })
            })
            .map_err(store_fault)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_fault)?;
        Ok(rows)
    }

    pub fn set_layout(
        &self,
        client_id: &str,
        session_id: &str,
        tile_id: &str,
        updated_at: u64,
    ) -> Result<(), Fault> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO layouts (client_id, session_id, tile_id, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (session_id, client_id)
             DO UPDATE SET tile_id = ?3, updated_at = ?4",
            params![client_id, session_id, tile_id, updated_at as i64],
        )
        .map_err(store_fault)?;
        Ok(())
    }

    pub fn remove_layout(&self, client_id: &str, session_id: &str) -> Result<(), Fault> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM layouts WHERE client_id = ?1 AND session_id = ?2",
            params![client_id, session_id],
        )
        .map_err(store_fault)?;
        Ok(())
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRecord> {
    let payload_str: String = row.get(3)?;
    Ok(EventRecord {
        seq: row.get(0)?,
        channel: row.get(1)?,
        event_type: row.get(2)?,
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
        ts: row.get::<_, i64>(4)? as u64,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    let status_str: String = row.get(2)?;
    let metadata_str: String = row.get(4)?;
    Ok(SessionRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        status: SessionStatus::parse(&status_str).unwrap_or(SessionStatus::Error),
        owner: row.get(3)?,
        metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::Value::Null),
        created_at: row.get::<_, i64>(5)? as u64,
        updated_at: row.get::<_, i64>(6)? as u64,
    })
}

fn store_fault(e: rusqlite::Error) -> Fault {
    Fault::new(ErrorCode::StoreFailed, e.to_string())
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

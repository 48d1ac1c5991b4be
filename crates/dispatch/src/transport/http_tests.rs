// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde_json::json;

use super::{
    close_session, create_session, get_layout, get_session, list_sessions, remove_layout,
    resume_session, session_history, set_layout, CreateSessionRequest, HistoryQuery,
    LayoutQuery, RemoveLayoutQuery, SetLayoutRequest,
};
use crate::error::ErrorCode;
use crate::store::{SessionFilter, SessionStatus};
use crate::test_support::{test_state, KIND_ECHO};

#[tokio::test]
async fn create_then_get_and_list() -> anyhow::Result<()> {
    let state = test_state();

    let Json(created) = create_session(
        State(state.clone()),
        None,
        Json(CreateSessionRequest { kind: KIND_ECHO.to_owned(), config: json!({}) }),
    )
    .await
    .map_err(|f| anyhow::anyhow!("{f}"))?;

    let Json(row) = get_session(State(state.clone()), Path(created.run_id.clone()))
        .await
        .map_err(|f| anyhow::anyhow!("{f}"))?;
    assert_eq!(row.kind, KIND_ECHO);
    assert_eq!(row.status, SessionStatus::Running);
    assert_eq!(row.owner, "local");

    let Json(rows) = list_sessions(State(state), Query(SessionFilter::default()))
        .await
        .map_err(|f| anyhow::anyhow!("{f}"))?;
    assert_eq!(rows.len(), 1);
    Ok(())
}

#[tokio::test]
async fn create_with_unknown_kind_fails() -> anyhow::Result<()> {
    let state = test_state();
    let result = create_session(
        State(state),
        None,
        Json(CreateSessionRequest { kind: "teletype".to_owned(), config: json!({}) }),
    )
    .await;
    match result {
        Err(fault) => assert_eq!(fault.code, ErrorCode::UnknownKind),
        Ok(_) => anyhow::bail!("expected an error"),
    }
    Ok(())
}

#[tokio::test]
async fn history_returns_events_after_the_cursor() -> anyhow::Result<()> {
    let state = test_state();
    let run_id = state.registry.start(KIND_ECHO, json!({}), "local").await?;
    for i in 0..4 {
        state.registry.input(&run_id, json!(format!("m{i}"))).await?;
    }
    for _ in 0..200 {
        if state.store.max_seq(&run_id)? >= 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let Json(history) = session_history(
        State(state.clone()),
        Path(run_id.clone()),
        Query(HistoryQuery { since_seq: 2, limit: None }),
    )
    .await
    .map_err(|f| anyhow::anyhow!("{f}"))?;
    assert_eq!(history.events.len(), 3);
    assert_eq!(history.events[0].seq, 3);

    let missing = session_history(
        State(state),
        Path("ghost".to_owned()),
        Query(HistoryQuery { since_seq: 0, limit: None }),
    )
    .await;
    match missing {
        Err(fault) => assert_eq!(fault.code, ErrorCode::UnknownSession),
        Ok(_) => anyhow::bail!("expected an error"),
    }
    Ok(())
}

#[tokio::test]
async fn close_is_a_status_transition_not_a_delete() -> anyhow::Result<()> {
    let state = test_state();
    let run_id = state.registry.start(KIND_ECHO, json!({}), "local").await?;

    close_session(State(state.clone()), Path(run_id.clone()))
        .await
        .map_err(|f| anyhow::anyhow!("{f}"))?;

    for _ in 0..200 {
        if state.store.get_session(&run_id)?.status == SessionStatus::Stopped {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The row and its events survive the close.
    let Json(row) = get_session(State(state.clone()), Path(run_id.clone()))
        .await
        .map_err(|f| anyhow::anyhow!("{f}"))?;
    assert_eq!(row.status, SessionStatus::Stopped);
    assert!(state.store.max_seq(&run_id)? > 0);

    // And the session can come back.
    resume_session(State(state.clone()), Path(run_id.clone()))
        .await
        .map_err(|f| anyhow::anyhow!("{f}"))?;
    assert!(state.registry.is_live(&run_id).await);
    Ok(())
}

#[tokio::test]
async fn layout_round_trip() -> anyhow::Result<()> {
    let state = test_state();

    set_layout(
        State(state.clone()),
        Json(SetLayoutRequest {
            client_id: "device-1".to_owned(),
            run_id: "r1".to_owned(),
            tile_id: "tile-a".to_owned(),
        }),
    )
    .await
    .map_err(|f| anyhow::anyhow!("{f}"))?;

    let Json(layout) = get_layout(
        State(state.clone()),
        Query(LayoutQuery { client_id: "device-1".to_owned() }),
    )
    .await
    .map_err(|f| anyhow::anyhow!("{f}"))?;
    assert_eq!(layout.len(), 1);
    assert_eq!(layout[0].tile_id, "tile-a");

    remove_layout(
        State(state.clone()),
        Query(RemoveLayoutQuery {
            client_id: "device-1".to_owned(),
            run_id: "r1".to_owned(),
        }),
    )
    .await
    .map_err(|f| anyhow::anyhow!("{f}"))?;

    let Json(layout) = get_layout(
        State(state),
        Query(LayoutQuery { client_id: "device-1".to_owned() }),
    )
    .await
    .map_err(|f| anyhow::anyhow!("{f}"))?;
    assert!(layout.is_empty());
    Ok(())
}

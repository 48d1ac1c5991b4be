// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios exercising the full stack: control plane, gateway,
//! adapters, and the event log — over a real TCP socket.

use std::time::Duration;

use serde_json::json;
use serial_test::serial;

use dispatch_specs::{decode_chunk, TestServer};

// -- PTY ----------------------------------------------------------------------

/// Start a shell, run a command, observe its output, close cleanly, and
/// check the stored history matches what was delivered live.
#[tokio::test]
#[serial]
async fn pty_echo_round_trip() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let run_id = server
        .create_session("pty", json!({ "shell": "/bin/sh", "cwd": "/tmp", "cols": 80, "rows": 24 }))
        .await?;

    let mut client = server.connect("device-1").await?;
    client.attach(&run_id, 0).await?;

    let first = client.next_event().await?;
    assert_eq!(first["seq"], 1);
    assert_eq!(first["channel"], "system:status");
    assert_eq!(first["type"], "open");

    // The quoting keeps the echoed command line from containing the marker.
    client.input(&run_id, json!("echo h\"\"i\n")).await?;

    let mut output = Vec::new();
    let mut live_seqs = vec![1i64];
    loop {
        let event = client.next_event().await?;
        live_seqs.push(event["seq"].as_i64().unwrap_or(0));
        if event["channel"] == "pty:stdout" {
            output.extend(decode_chunk(&event)?);
            if String::from_utf8_lossy(&output).contains("hi") {
                break;
            }
        }
    }

    client.send(json!({ "frame": "close", "runId": run_id })).await?;
    loop {
        let frame = client.next_frame().await?;
        if frame["frame"] == "close-ok" {
            continue;
        }
        if frame["frame"] == "event" && frame["channel"] == "system:status" {
            assert_eq!(frame["type"], "exit");
            assert_eq!(frame["payload"]["exitCode"], 0);
            break;
        }
    }

    // Replay equivalence: the stored log contains the same events the live
    // client observed, in the same order.
    let history = server.history(&run_id, 0).await?;
    let stored_seqs: Vec<i64> =
        history.iter().map(|e| e["seq"].as_i64().unwrap_or(0)).collect();
    for (i, seq) in stored_seqs.iter().enumerate() {
        assert_eq!(*seq, i as i64 + 1);
    }
    assert!(stored_seqs.len() as i64 >= *live_seqs.last().unwrap_or(&0));
    Ok(())
}

/// Resize propagates to the child: `stty size` reports the new geometry.
#[tokio::test]
#[serial]
async fn pty_resize_reaches_the_shell() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let run_id = server
        .create_session("pty", json!({ "shell": "/bin/sh", "cols": 80, "rows": 24 }))
        .await?;

    let mut client = server.connect("device-1").await?;
    client.attach(&run_id, 0).await?;

    client
        .send(json!({ "frame": "resize", "runId": run_id, "cols": 120, "rows": 40 }))
        .await?;
    loop {
        let frame = client.next_frame().await?;
        if frame["frame"] == "resize-ok" {
            break;
        }
    }

    client.input(&run_id, json!("stty size\n")).await?;

    let mut output = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "stty output never appeared: {}",
            String::from_utf8_lossy(&output)
        );
        let event = client.next_event().await?;
        if event["channel"] == "pty:stdout" {
            output.extend(decode_chunk(&event)?);
            if String::from_utf8_lossy(&output).contains("40 120") {
                break;
            }
        }
    }
    Ok(())
}

// -- Replay -------------------------------------------------------------------

/// Produce a long event stream, then re-attach from the middle: exactly the
/// suffix arrives, in order, once each.
#[tokio::test]
async fn replay_from_cursor_is_exact() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let run_id = server.create_session("echo", json!({})).await?;

    for i in 0..1000 {
        server.state.registry.input(&run_id, json!(format!("chunk-{i}"))).await?;
    }
    // 1 open + 1000 echoes.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while server.state.store.max_seq(&run_id)? < 1001 {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "log never filled");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut client = server.connect("device-1").await?;
    client.attach(&run_id, 500).await?;
    let events = client.collect_events(501).await?;

    for (i, event) in events.iter().enumerate() {
        assert_eq!(event["seq"].as_i64(), Some(501 + i as i64), "gap or duplicate");
    }
    Ok(())
}

/// Disconnect mid-stream and resume from the last delivered seq with no gap
/// and no duplicate against the stored log.
#[tokio::test]
async fn reattach_after_disconnect_loses_nothing() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let run_id = server.create_session("echo", json!({})).await?;

    let mut first = server.connect("device-1").await?;
    first.attach(&run_id, 0).await?;

    for i in 0..50 {
        server.state.registry.input(&run_id, json!(format!("m{i}"))).await?;
    }

    // Read a prefix, remember the cursor, and drop the connection.
    let prefix = first.collect_events(20).await?;
    let cursor = prefix
        .last()
        .and_then(|e| e["seq"].as_i64())
        .ok_or_else(|| anyhow::anyhow!("no prefix"))?;
    drop(first);

    for i in 50..80 {
        server.state.registry.input(&run_id, json!(format!("m{i}"))).await?;
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while server.state.store.max_seq(&run_id)? < 81 {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "log never filled");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut second = server.connect("device-1").await?;
    second.attach(&run_id, cursor).await?;
    let rest = second.collect_events((81 - cursor) as usize).await?;

    let mut seqs: Vec<i64> = prefix.iter().chain(rest.iter())
        .filter_map(|e| e["seq"].as_i64())
        .collect();
    let expected: Vec<i64> = (1..=81).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, expected, "recovered stream has a gap or duplicate");
    Ok(())
}

// -- Multi-client -------------------------------------------------------------

/// Two connections attached at different cursors observe prefixes of the
/// same total order, and input from either is visible to both.
#[tokio::test]
async fn multiple_clients_share_one_order() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let run_id = server.create_session("echo", json!({})).await?;

    let mut alice = server.connect("alice").await?;
    alice.attach(&run_id, 0).await?;

    alice.input(&run_id, json!("from alice")).await?;
    // Make sure some history exists before bob joins.
    let head = alice.collect_events(2).await?;
    assert_eq!(head[0]["type"], "open");

    let mut bob = server.connect("bob").await?;
    bob.attach(&run_id, 1).await?;

    // Bob's input lands (observed at seq 3) before alice sends again, so the
    // total order is deterministic.
    bob.input(&run_id, json!("from bob")).await?;
    let bob_head = bob.collect_events(2).await?;
    alice.input(&run_id, json!("from alice again")).await?;
    let bob_tail = bob.collect_events(1).await?;
    let alice_rest = alice.collect_events(2).await?;

    // Bob sees seq 2..=4; alice saw 1..=4. The shared suffix is identical.
    let alice_seqs: Vec<i64> =
        head.iter().chain(alice_rest.iter()).filter_map(|e| e["seq"].as_i64()).collect();
    let bob_seqs: Vec<i64> =
        bob_head.iter().chain(bob_tail.iter()).filter_map(|e| e["seq"].as_i64()).collect();
    assert_eq!(alice_seqs, vec![1, 2, 3, 4]);
    assert_eq!(bob_seqs, vec![2, 3, 4]);

    let texts: Vec<&str> = bob_head
        .iter()
        .chain(bob_tail.iter())
        .filter_map(|e| e["payload"]["events"][0]["text"].as_str())
        .collect();
    assert_eq!(texts, vec!["from alice", "from bob", "from alice again"]);
    Ok(())
}

// -- File editor --------------------------------------------------------------

/// Open a preloaded file, save new content, and verify the disk round trip.
#[tokio::test]
async fn file_editor_round_trip() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("x.txt");
    tokio::fs::write(&path, "alpha").await?;

    let server = TestServer::start().await?;
    let run_id = server
        .create_session("file-editor", json!({ "path": path.to_string_lossy() }))
        .await?;

    let mut client = server.connect("device-1").await?;
    client.attach(&run_id, 0).await?;

    let open = client.next_event().await?;
    assert_eq!(open["type"], "open");
    let content = client.next_event().await?;
    assert_eq!(content["channel"], "file:content");
    assert_eq!(content["payload"]["content"], "alpha");
    assert_eq!(content["payload"]["size"], 5);

    client.input(&run_id, json!({ "action": "save", "content": "beta" })).await?;
    let saved = client.next_event().await?;
    assert_eq!(saved["channel"], "file:saved");
    assert_eq!(saved["payload"]["path"], path.to_string_lossy().as_ref());
    assert_eq!(saved["payload"]["size"], 4);

    assert_eq!(tokio::fs::read_to_string(&path).await?, "beta");
    Ok(())
}

// -- Auth ---------------------------------------------------------------------

#[tokio::test]
async fn auth_token_guards_http_and_ws() -> anyhow::Result<()> {
    let server = TestServer::start_with(|mut config| {
        config.auth_token = Some("secret".to_owned());
        config
    })
    .await?;

    // Health stays open.
    let resp = reqwest::get(format!("{}/api/v1/health", server.base_url())).await?;
    assert_eq!(resp.status().as_u16(), 200);

    // Control plane requires the bearer token.
    let resp = reqwest::get(format!("{}/api/v1/sessions", server.base_url())).await?;
    assert_eq!(resp.status().as_u16(), 401);
    let resp = reqwest::Client::new()
        .get(format!("{}/api/v1/sessions", server.base_url()))
        .bearer_auth("secret")
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 200);

    // The WS upgrade requires the query token.
    assert!(tokio_tungstenite::connect_async(server.ws_url()).await.is_err());
    let authed = format!("{}?token=secret", server.ws_url());
    assert!(tokio_tungstenite::connect_async(authed).await.is_ok());
    Ok(())
}

#[tokio::test]
async fn expired_auth_pushes_session_expired() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let run_id = server.create_session("echo", json!({})).await?;

    let mut client = server.connect("device-1").await?;
    client.attach(&run_id, 0).await?;
    client.collect_events(1).await?;

    server.state.expire_connections();

    loop {
        let frame = client.next_frame().await?;
        if frame["frame"] == "session-expired" {
            break;
        }
    }
    Ok(())
}

// -- Store fault --------------------------------------------------------------

/// A failed append faults the session; the persisted prefix stays intact
/// and the failed seq never becomes visible.
#[cfg(feature = "test_hooks")]
#[tokio::test]
async fn store_fault_preserves_the_prefix() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let run_id = server.create_session("echo", json!({})).await?;

    // The open event already consumed one append; arm the 42nd overall.
    server.state.store.fail_append_after(41);
    for i in 0..45 {
        // Sends can start failing once the session faults.
        let _ = server.state.registry.input(&run_id, json!(format!("m{i}"))).await;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "session never faulted");
        let resp: serde_json::Value = reqwest::get(format!(
            "{}/api/v1/sessions/{run_id}",
            server.base_url()
        ))
        .await?
        .json()
        .await?;
        if resp["status"] == "error" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let history = server.history(&run_id, 0).await?;
    assert_eq!(history.len(), 41);
    for (i, event) in history.iter().enumerate() {
        assert_eq!(event["seq"].as_i64(), Some(i as i64 + 1));
    }
    Ok(())
}

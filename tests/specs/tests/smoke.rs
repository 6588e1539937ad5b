// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `agtmux` binary and exercise
//! the Unix socket API and the TTY v2 upgrade.

use std::time::Duration;

use agtmux_specs::{unix_http_get, unix_http_post, AgtmuxProcess, TtyClient};

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn socket_health() -> anyhow::Result<()> {
    let daemon = AgtmuxProcess::start()?;
    daemon.wait_healthy(TIMEOUT).await?;

    let (status, body) = unix_http_get(daemon.socket_path(), "/v1/health").await?;
    assert_eq!(status, 200);
    let parsed: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(parsed["status"], "ok");
    assert_eq!(parsed["schema_version"], "v1");

    Ok(())
}

#[tokio::test]
async fn second_daemon_refuses_same_socket() -> anyhow::Result<()> {
    let daemon = AgtmuxProcess::start()?;
    daemon.wait_healthy(TIMEOUT).await?;

    // A second instance against the same socket must exit with an error.
    let binary = agtmux_specs::agtmux_binary();
    let output = std::process::Command::new(binary)
        .args([
            "--socket",
            &daemon.socket_path().to_string_lossy(),
            "--log-level",
            "error",
        ])
        .output()?;
    assert!(!output.status.success(), "second daemon unexpectedly started");

    Ok(())
}

#[tokio::test]
async fn targets_register_and_list() -> anyhow::Result<()> {
    let daemon = AgtmuxProcess::start()?;
    daemon.wait_healthy(TIMEOUT).await?;

    let (status, _) = unix_http_post(
        daemon.socket_path(),
        "/v1/targets",
        &serde_json::json!({ "name": "local", "kind": "local", "is_default": true }),
    )
    .await?;
    assert_eq!(status, 201);

    let (status, body) = unix_http_get(daemon.socket_path(), "/v1/targets").await?;
    assert_eq!(status, 200);
    let parsed: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(parsed["targets"][0]["target_name"], "local");

    Ok(())
}

#[tokio::test]
async fn events_flow_updates_pane_listing() -> anyhow::Result<()> {
    let daemon = AgtmuxProcess::start()?;
    daemon.wait_healthy(TIMEOUT).await?;

    let (status, _) = unix_http_post(
        daemon.socket_path(),
        "/v1/targets",
        &serde_json::json!({ "name": "local", "kind": "local", "is_default": true }),
    )
    .await?;
    assert_eq!(status, 201);

    let (status, body) = unix_http_post(
        daemon.socket_path(),
        "/v1/events",
        &serde_json::json!({
            "event_type": "turn-started",
            "source": "hook",
            "dedupe_key": "smoke-1",
            "pane_id": "%1",
        }),
    )
    .await?;
    assert_eq!(status, 200, "body: {body}");
    let parsed: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(parsed["status"], "pending_bind");

    let (status, body) = unix_http_get(daemon.socket_path(), "/v1/panes").await?;
    assert_eq!(status, 200);
    let parsed: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(parsed["panes"][0]["pane_id"], "%1");
    assert_eq!(parsed["panes"][0]["state"], "running");

    Ok(())
}

#[tokio::test]
async fn watch_cursor_resume() -> anyhow::Result<()> {
    let daemon = AgtmuxProcess::start()?;
    daemon.wait_healthy(TIMEOUT).await?;

    let (status, body) = unix_http_get(daemon.socket_path(), "/v1/watch").await?;
    assert_eq!(status, 200);
    let first: serde_json::Value = serde_json::from_str(body.lines().next().unwrap_or(""))?;
    assert_eq!(first["type"], "snapshot");
    let cursor = first["cursor"].as_str().unwrap_or_default().to_owned();

    let (status, body) =
        unix_http_get(daemon.socket_path(), &format!("/v1/watch?cursor={cursor}")).await?;
    assert_eq!(status, 200);
    assert_eq!(body.lines().count(), 1, "current cursor must not reset");

    Ok(())
}

#[tokio::test]
async fn action_on_unknown_target_is_404() -> anyhow::Result<()> {
    let daemon = AgtmuxProcess::start()?;
    daemon.wait_healthy(TIMEOUT).await?;

    let (status, body) = unix_http_post(
        daemon.socket_path(),
        "/v1/actions/attach",
        &serde_json::json!({ "request_ref": "r1", "target": "ghost", "pane_id": "%1" }),
    )
    .await?;
    assert_eq!(status, 404, "body: {body}");
    let parsed: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(parsed["error"]["code"], "E_REF_NOT_FOUND");

    Ok(())
}

#[tokio::test]
async fn tty_upgrade_hello_roundtrip() -> anyhow::Result<()> {
    let daemon = AgtmuxProcess::start()?;
    daemon.wait_healthy(TIMEOUT).await?;

    // Same-UID peer: the upgrade must succeed and negotiate tty.v2.0.
    let mut tty = TtyClient::connect(daemon.socket_path()).await?;
    tty.send("hello", serde_json::json!({ "versions": ["tty.v2.0"] })).await?;
    let ack = tty.recv().await?;
    assert_eq!(ack.frame_type, "hello_ack");
    assert_eq!(ack.payload["version"], "tty.v2.0");

    tty.send("ping", serde_json::json!({})).await?;
    let pong = tty.recv().await?;
    assert_eq!(pong.frame_type, "pong");
    assert!(pong.seq > ack.seq);

    Ok(())
}

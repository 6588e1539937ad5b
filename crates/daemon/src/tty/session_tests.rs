// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::clock::FakeClock;
use crate::model::StateRow;
use crate::storage::MemoryStorage;
use crate::test_support::{base_time, local_target, CannedRun, RecordingExecutor};
use serde_json::Value;
use tokio::io::DuplexStream;
use tokio::time::timeout;

fn test_tuning() -> TtyTuning {
    TtyTuning {
        enable_bridge: false,
        enable_tap: false,
        scheduler_tick: StdDuration::from_millis(10),
        ..TtyTuning::default()
    }
}

struct Harness {
    client_read: FramedRead<tokio::io::ReadHalf<DuplexStream>, tokio_util::codec::LengthDelimitedCodec>,
    client_write: FramedWrite<tokio::io::WriteHalf<DuplexStream>, tokio_util::codec::LengthDelimitedCodec>,
    seq: u64,
    storage: Arc<MemoryStorage>,
    exec: Arc<RecordingExecutor>,
    shutdown: CancellationToken,
}

impl Harness {
    async fn send(&mut self, frame_type: &str, payload: Value) {
        self.seq += 1;
        let envelope = Envelope {
            frame_type: frame_type.to_owned(),
            seq: self.seq,
            request_id: None,
            payload,
        };
        let body = frame::encode_envelope(&envelope).unwrap_or_default();
        let sent = self.client_write.send(body).await;
        assert!(sent.is_ok());
    }

    async fn recv(&mut self) -> Envelope {
        let frame = timeout(StdDuration::from_secs(2), self.client_read.next()).await;
        let Ok(Some(Ok(body))) = frame else {
            assert!(false, "no frame received: {frame:?}");
            return Envelope {
                frame_type: String::new(),
                seq: 0,
                request_id: None,
                payload: Value::Null,
            };
        };
        match frame::decode_envelope(&body) {
            Ok(envelope) => envelope,
            Err(err) => {
                assert!(false, "bad frame: {err}");
                Envelope { frame_type: String::new(), seq: 0, request_id: None, payload: Value::Null }
            }
        }
    }

    async fn hello(&mut self) {
        self.send("hello", serde_json::json!({ "versions": ["tty.v2.0"] })).await;
        let ack = self.recv().await;
        assert_eq!(ack.frame_type, "hello_ack");
    }

    async fn attach(&mut self, pane_id: &str) -> Envelope {
        self.send(
            "attach",
            serde_json::json!({
                "session_name": "main",
                "window_id": "@1",
                "pane_id": pane_id,
                "cols": 120,
                "rows": 42,
            }),
        )
        .await;
        let attached = self.recv().await;
        assert_eq!(attached.frame_type, "attached");
        attached
    }
}

fn harness() -> Harness {
    let (client, server) = tokio::io::duplex(256 * 1024);
    let storage = Arc::new(MemoryStorage::new());
    storage.upsert_target(local_target());
    let exec = Arc::new(RecordingExecutor::new());
    let deps = Arc::new(TtyDeps {
        storage: Arc::clone(&storage) as Arc<dyn Storage>,
        executor: Arc::clone(&exec) as Arc<dyn Executor>,
        clock: Arc::new(FakeClock::new(base_time())),
        tuning: test_tuning(),
    });
    let shutdown = CancellationToken::new();
    let session_shutdown = shutdown.clone();
    tokio::spawn(async move {
        serve(server, deps, session_shutdown).await;
    });

    let (client_read, client_write) = tokio::io::split(client);
    Harness {
        client_read: FramedRead::new(client_read, frame::frame_codec()),
        client_write: FramedWrite::new(client_write, frame::frame_codec()),
        seq: 0,
        storage,
        exec,
        shutdown,
    }
}

fn seed_state(storage: &MemoryStorage, pane_id: &str, runtime_id: &str) {
    let mut row = StateRow::unknown("local", pane_id, base_time());
    row.runtime_id = runtime_id.to_owned();
    row.state = crate::model::PaneState::Running;
    storage.upsert_state(row);
}

#[tokio::test]
async fn hello_negotiates_version_and_features() {
    let mut h = harness();
    h.send("hello", serde_json::json!({ "versions": ["tty.v1.0", "tty.v2.0"] })).await;
    let ack = h.recv().await;
    assert_eq!(ack.frame_type, "hello_ack");
    assert_eq!(ack.payload["version"], "tty.v2.0");
    let features = ack.payload["features"].as_array().cloned().unwrap_or_default();
    assert!(features.iter().any(|f| f == "coalescing_latest_wins"));
    assert!(features.iter().any(|f| f == "peer_cred_auth"));
    h.shutdown.cancel();
}

#[tokio::test]
async fn unsupported_version_errors() {
    let mut h = harness();
    h.send("hello", serde_json::json!({ "versions": ["tty.v1.0"] })).await;
    let err = h.recv().await;
    assert_eq!(err.frame_type, "error");
    assert_eq!(err.payload["code"], frame::E_PROTOCOL_UNSUPPORTED_VERSION);
    h.shutdown.cancel();
}

#[tokio::test]
async fn frames_before_hello_rejected() {
    let mut h = harness();
    h.send("ping", serde_json::json!({})).await;
    let err = h.recv().await;
    assert_eq!(err.frame_type, "error");
    assert_eq!(err.payload["code"], frame::E_PROTOCOL_INVALID_FRAME);
    h.shutdown.cancel();
}

#[tokio::test]
async fn attach_reports_alias_seq_and_applies_resize() {
    let mut h = harness();
    h.hello().await;
    let attached = h.attach("%1").await;

    assert_eq!(attached.payload["pane_alias"], "p1");
    assert_eq!(attached.payload["snapshot_mode"], "stream");
    assert_eq!(attached.payload["output_seq"], 1);

    let calls = h.exec.calls.lock().clone();
    assert!(
        calls.contains(&vec![
            "tmux".to_owned(),
            "resize-pane".to_owned(),
            "-t".to_owned(),
            "%1".to_owned(),
            "-x".to_owned(),
            "120".to_owned(),
            "-y".to_owned(),
            "42".to_owned(),
        ]),
        "resize not issued: {calls:?}"
    );
    h.shutdown.cancel();
}

#[tokio::test]
async fn attach_with_state_row_emits_state_frame() {
    let mut h = harness();
    seed_state(&h.storage, "%1", "r1");
    h.hello().await;
    let _ = h.attach("%1").await;
    let state = h.recv().await;
    assert_eq!(state.frame_type, "state");
    assert_eq!(state.payload["state"], "running");
    h.shutdown.cancel();
}

#[tokio::test]
async fn write_plain_text_uses_literal_send_keys() {
    let mut h = harness();
    h.hello().await;
    let _ = h.attach("%1").await;

    h.send("write", serde_json::json!({ "pane": "p1", "bytes_base64": "YQ==" })).await;
    let ack = h.recv().await;
    assert_eq!(ack.frame_type, "ack");
    assert_eq!(ack.payload["op"], "write");
    assert_eq!(ack.payload["status"], "ok");

    let calls = h.exec.effect_calls();
    assert!(
        calls.contains(&vec![
            "tmux".to_owned(),
            "send-keys".to_owned(),
            "-t".to_owned(),
            "%1".to_owned(),
            "-l".to_owned(),
            "a".to_owned(),
        ]),
        "literal send-keys missing: {calls:?}"
    );
    h.shutdown.cancel();
}

#[tokio::test]
async fn write_control_bytes_use_hex_send_keys() {
    let mut h = harness();
    h.hello().await;
    let _ = h.attach("%1").await;

    // ESC [ A
    let encoded = base64::engine::general_purpose::STANDARD.encode(b"\x1b[A");
    h.send("write", serde_json::json!({ "pane": "p1", "bytes_base64": encoded })).await;
    let ack = h.recv().await;
    assert_eq!(ack.payload["status"], "ok");

    let calls = h.exec.effect_calls();
    assert!(
        calls.contains(&vec![
            "tmux".to_owned(),
            "send-keys".to_owned(),
            "-t".to_owned(),
            "%1".to_owned(),
            "-H".to_owned(),
            "1b".to_owned(),
            "5b".to_owned(),
            "41".to_owned(),
        ]),
        "hex send-keys missing: {calls:?}"
    );
    h.shutdown.cancel();
}

#[tokio::test]
async fn write_rejects_empty_and_bad_base64() {
    let mut h = harness();
    h.hello().await;
    let _ = h.attach("%1").await;

    h.send("write", serde_json::json!({ "pane": "p1", "bytes_base64": "" })).await;
    let err = h.recv().await;
    assert_eq!(err.payload["code"], frame::E_REF_INVALID);

    h.send("write", serde_json::json!({ "pane": "p1", "bytes_base64": "not-base64!!" })).await;
    let err = h.recv().await;
    assert_eq!(err.payload["code"], frame::E_REF_INVALID_ENCODING);
    h.shutdown.cancel();
}

#[tokio::test]
async fn write_on_changed_runtime_is_stale_and_drops_slot() {
    let mut h = harness();
    seed_state(&h.storage, "%1", "r1");
    h.hello().await;
    let _ = h.attach("%1").await;
    let _state_frame = h.recv().await;

    // Runtime moves underneath the attachment.
    seed_state(&h.storage, "%1", "r2");

    h.send("write", serde_json::json!({ "pane": "p1", "bytes_base64": "YQ==" })).await;
    let err = h.recv().await;
    assert_eq!(err.frame_type, "error");
    assert_eq!(err.payload["code"], frame::E_STALE_RUNTIME);

    // Slot is gone: further writes say not attached.
    h.send("write", serde_json::json!({ "pane": "p1", "bytes_base64": "YQ==" })).await;
    let err = h.recv().await;
    assert_eq!(err.payload["code"], frame::E_REF_NOT_FOUND);
    h.shutdown.cancel();
}

#[tokio::test]
async fn resync_acks_then_reattaches_with_next_seq() {
    let mut h = harness();
    h.hello().await;
    let _ = h.attach("%1").await;

    h.send("resync", serde_json::json!({ "pane": "p1", "reason": "manual" })).await;
    let ack = h.recv().await;
    assert_eq!(ack.frame_type, "ack");
    assert_eq!(ack.payload["op"], "resync");
    assert_eq!(ack.payload["status"], "ok");

    let attached = h.recv().await;
    assert_eq!(attached.frame_type, "attached");
    assert_eq!(attached.payload["snapshot_mode"], "stream_resync");
    assert_eq!(attached.payload["output_seq"], 2);
    h.shutdown.cancel();
}

#[tokio::test]
async fn resize_applies_only_to_foreground() {
    let mut h = harness();
    h.hello().await;
    let _ = h.attach("%1").await;

    h.send("resize", serde_json::json!({ "pane": "p1", "cols": 100, "rows": 30 })).await;
    let ack = h.recv().await;
    assert_eq!(ack.payload["status"], "skipped_conflict");

    h.send("focus", serde_json::json!({ "pane": "p1" })).await;
    let ack = h.recv().await;
    assert_eq!(ack.payload["op"], "focus");

    h.send("resize", serde_json::json!({ "pane": "p1", "cols": 100, "rows": 30 })).await;
    let ack = h.recv().await;
    assert_eq!(ack.payload["op"], "resize");
    assert_eq!(ack.payload["status"], "ok");
    h.shutdown.cancel();
}

#[tokio::test]
async fn resize_bounds_enforced() {
    let mut h = harness();
    h.hello().await;
    let _ = h.attach("%1").await;

    for (cols, rows) in [(19u16, 30u16), (501, 30), (100, 4), (100, 301)] {
        h.send("resize", serde_json::json!({ "pane": "p1", "cols": cols, "rows": rows })).await;
        let err = h.recv().await;
        assert_eq!(err.payload["code"], frame::E_REF_INVALID, "cols={cols} rows={rows}");
    }
    h.shutdown.cancel();
}

#[tokio::test]
async fn detach_removes_pane() {
    let mut h = harness();
    h.hello().await;
    let _ = h.attach("%1").await;

    h.send("detach", serde_json::json!({ "pane": "p1" })).await;
    let detached = h.recv().await;
    assert_eq!(detached.frame_type, "detached");
    assert_eq!(detached.payload["pane"], "p1");

    h.send("focus", serde_json::json!({ "pane": "p1" })).await;
    let err = h.recv().await;
    assert_eq!(err.payload["code"], frame::E_REF_NOT_FOUND);
    h.shutdown.cancel();
}

#[tokio::test]
async fn session_frame_seq_is_strictly_monotonic() {
    let mut h = harness();
    h.hello().await;
    let mut last_seq = 0;
    let attached = h.attach("%1").await;
    assert!(attached.seq > last_seq);
    last_seq = attached.seq;

    for _ in 0..3 {
        h.send("ping", serde_json::json!({})).await;
        let pong = h.recv().await;
        assert_eq!(pong.frame_type, "pong");
        assert!(pong.seq > last_seq, "seq {} !> {last_seq}", pong.seq);
        last_seq = pong.seq;
    }
    h.shutdown.cancel();
}

#[tokio::test]
async fn second_attach_gets_next_alias() {
    let mut h = harness();
    h.hello().await;
    let first = h.attach("%1").await;
    let second = h.attach("%2").await;
    assert_eq!(first.payload["pane_alias"], "p1");
    assert_eq!(second.payload["pane_alias"], "p2");
    h.shutdown.cancel();
}

#[tokio::test]
async fn duplicate_attach_rejected() {
    let mut h = harness();
    h.hello().await;
    let _ = h.attach("%1").await;
    h.send(
        "attach",
        serde_json::json!({ "session_name": "main", "window_id": "@1", "pane_id": "%1" }),
    )
    .await;
    let err = h.recv().await;
    assert_eq!(err.frame_type, "error");
    assert_eq!(err.payload["code"], frame::E_REF_INVALID);
    h.shutdown.cancel();
}

// Coalescing internals, exercised directly on the session state.

fn bare_session() -> (Arc<TtySession>, mpsc::Receiver<Outgoing>, Arc<RecordingExecutor>) {
    let storage = Arc::new(MemoryStorage::new());
    storage.upsert_target(local_target());
    let exec = Arc::new(RecordingExecutor::new());
    let deps = Arc::new(TtyDeps {
        storage: storage as Arc<dyn Storage>,
        executor: Arc::clone(&exec) as Arc<dyn Executor>,
        clock: Arc::new(FakeClock::new(base_time())),
        tuning: TtyTuning {
            dispatch_interval: StdDuration::from_secs(3600),
            coalesce_watermark: 3,
            ..test_tuning()
        },
    });
    let (session, out_rx) = TtySession::new(deps);
    (session, out_rx, exec)
}

async fn insert_slot(session: &TtySession, alias: &str) {
    let mut state = session.state.lock().await;
    state.slots.insert(
        alias.to_owned(),
        PaneSlot {
            alias: alias.to_owned(),
            target_id: "local".to_owned(),
            session_name: "main".to_owned(),
            window_id: "@1".to_owned(),
            pane_id: "%1".to_owned(),
            runtime_id: String::new(),
            output_seq: 1,
            foreground: false,
            pending: None,
            last_dispatch: None,
            next_capture_at: Instant::now(),
            failures: 0,
            last_error_at: None,
            force_resync: None,
            last_content: None,
        },
    );
}

#[tokio::test]
async fn coalescing_latest_wins_with_drop_counter() {
    let (session, mut out_rx, _exec) = bare_session();
    insert_slot(&session, "p1").await;

    // First snapshot: dispatch window open, goes out immediately.
    session.stage_snapshot("p1", b"one".to_vec()).await;
    let first = out_rx.recv().await;
    let Some(first) = first else {
        assert!(first.is_some());
        return;
    };
    assert_eq!(first.frame_type, "output");
    assert_eq!(first.payload["source"], "snapshot");
    assert_eq!(first.payload["output_seq"], 2);
    assert!(first.payload.get("coalesced").is_none());

    // Window closed (1h dispatch interval): snapshots coalesce latest-wins.
    session.stage_snapshot("p1", b"two".to_vec()).await;
    session.stage_snapshot("p1", b"three".to_vec()).await;
    session.stage_snapshot("p1", b"four".to_vec()).await;
    // dropped reaches the watermark (3) on the fourth staged payload.
    session.stage_snapshot("p1", b"five".to_vec()).await;

    let flushed = out_rx.recv().await;
    let Some(flushed) = flushed else {
        assert!(flushed.is_some());
        return;
    };
    assert_eq!(flushed.payload["coalesced"], true);
    assert_eq!(flushed.payload["dropped_chunks"], 3);
    // Latest payload wins.
    let bytes = flushed.payload["bytes_base64"].as_str().unwrap_or_default();
    assert_eq!(
        base64::engine::general_purpose::STANDARD.decode(bytes).unwrap_or_default(),
        b"five"
    );
    // coalesced_from_seq ≤ output_seq.
    let from_seq = flushed.payload["coalesced_from_seq"].as_u64().unwrap_or_default();
    let out_seq = flushed.payload["output_seq"].as_u64().unwrap_or_default();
    assert!(from_seq <= out_seq, "{from_seq} !<= {out_seq}");

    let telemetry = session.telemetry().await;
    assert_eq!(telemetry.output_snapshot, 2);
}

#[tokio::test]
async fn identical_snapshot_content_is_skipped() {
    let (session, mut out_rx, _exec) = bare_session();
    insert_slot(&session, "p1").await;

    session.stage_snapshot("p1", b"same".to_vec()).await;
    let first = out_rx.recv().await;
    assert!(first.is_some());

    // Same content again: no frame.
    session.stage_snapshot("p1", b"same".to_vec()).await;
    let second = timeout(StdDuration::from_millis(100), out_rx.recv()).await;
    assert!(second.is_err(), "unexpected frame for identical content");
}

#[tokio::test]
async fn flush_pending_respects_dispatch_window() {
    let (session, mut out_rx, _exec) = bare_session();
    insert_slot(&session, "p1").await;

    session.stage_snapshot("p1", b"one".to_vec()).await;
    let _ = out_rx.recv().await;
    session.stage_snapshot("p1", b"two".to_vec()).await;

    // Window still closed: nothing flushes.
    session.flush_pending(Instant::now()).await;
    let nothing = timeout(StdDuration::from_millis(50), out_rx.recv()).await;
    assert!(nothing.is_err());

    // Window opens far in the future: pending flushes coalesced.
    session
        .flush_pending(Instant::now() + StdDuration::from_secs(7200))
        .await;
    let flushed = out_rx.recv().await;
    let Some(flushed) = flushed else {
        assert!(flushed.is_some());
        return;
    };
    assert_eq!(flushed.payload["coalesced"], true);
    assert_eq!(flushed.payload["dropped_chunks"], 0);
}

#[test]
fn backoff_grows_and_caps() {
    let tuning = TtyTuning::default();
    // Local background: 250ms, 500ms, 1s, 2s, capped at 2s.
    assert_eq!(
        backoff(&tuning, TargetKind::Local, false, 1),
        StdDuration::from_millis(250)
    );
    assert_eq!(
        backoff(&tuning, TargetKind::Local, false, 2),
        StdDuration::from_millis(500)
    );
    assert_eq!(backoff(&tuning, TargetKind::Local, false, 4), StdDuration::from_secs(2));
    assert_eq!(backoff(&tuning, TargetKind::Local, false, 10), StdDuration::from_secs(2));
    // SSH foreground base.
    assert_eq!(
        backoff(&tuning, TargetKind::Ssh, true, 1),
        StdDuration::from_millis(280)
    );
    assert_eq!(backoff(&tuning, TargetKind::Ssh, false, 20), StdDuration::from_secs(8));
}

#[test]
fn cadence_by_target_kind() {
    let tuning = TtyTuning::default();
    assert_eq!(cadence(&tuning, TargetKind::Local, false), StdDuration::from_millis(250));
    assert_eq!(cadence(&tuning, TargetKind::Ssh, false), StdDuration::from_millis(450));
    // Foreground fallback polls at the hotpath base.
    assert_eq!(cadence(&tuning, TargetKind::Local, true), StdDuration::from_millis(100));
    assert_eq!(cadence(&tuning, TargetKind::Ssh, true), StdDuration::from_millis(280));
}

#[tokio::test]
async fn collect_due_skips_stream_covered_foreground() {
    let (session, _out_rx, _exec) = bare_session();
    insert_slot(&session, "p1").await;
    let mut state = session.state.lock().await;
    if let Some(slot) = state.slots.get_mut("p1") {
        slot.foreground = true;
    }

    // Neither tap nor bridge is live: the foreground pane is due.
    let due = collect_due(&mut state, Instant::now(), StdDuration::from_secs(8));
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].0, "p1");

    // Bridge up: stream-only again.
    state.bridge_up = true;
    if let Some(slot) = state.slots.get_mut("p1") {
        slot.next_capture_at = Instant::now();
    }
    assert!(collect_due(&mut state, Instant::now(), StdDuration::from_secs(8)).is_empty());

    // Tap serving the pane: also stream-only.
    state.bridge_up = false;
    state.tap_active_for = Some("p1".to_owned());
    assert!(collect_due(&mut state, Instant::now(), StdDuration::from_secs(8)).is_empty());

    // Background panes are captured regardless of live sources.
    state.tap_active_for = None;
    state.bridge_up = true;
    if let Some(slot) = state.slots.get_mut("p1") {
        slot.foreground = false;
        slot.next_capture_at = Instant::now();
    }
    assert_eq!(collect_due(&mut state, Instant::now(), StdDuration::from_secs(8)).len(), 1);
}

#[tokio::test]
async fn foreground_capture_fallback_counts_hotpath() {
    let (session, mut out_rx, exec) = bare_session();
    insert_slot(&session, "p1").await;
    {
        let mut state = session.state.lock().await;
        state.focus = Some("p1".to_owned());
        if let Some(slot) = state.slots.get_mut("p1") {
            slot.foreground = true;
        }
    }

    exec.push_canned(CannedRun::Ok(b"fg bytes".to_vec()));
    session.capture_once("p1", "local", "%1", None).await;

    let frame = out_rx.recv().await;
    let Some(frame) = frame else {
        assert!(frame.is_some());
        return;
    };
    assert_eq!(frame.frame_type, "output");
    assert_eq!(frame.payload["source"], "snapshot");

    let telemetry = session.telemetry().await;
    assert_eq!(telemetry.captures_foreground, 1);
    assert_eq!(telemetry.captures_background, 0);
}

#[tokio::test]
async fn layout_change_queues_resync_on_geometry_diff() {
    let (session, _out_rx, _exec) = bare_session();
    insert_slot(&session, "p1").await;

    // First observation stores the geometry without queueing.
    session
        .handle_layout_change("@1", Some(Geometry { cols: 200, rows: 50 }))
        .await;
    {
        let state = session.state.lock().await;
        assert!(state.slots["p1"].force_resync.is_none());
    }

    // Unchanged geometry: still nothing.
    session
        .handle_layout_change("@1", Some(Geometry { cols: 200, rows: 50 }))
        .await;
    {
        let state = session.state.lock().await;
        assert!(state.slots["p1"].force_resync.is_none());
    }

    // Geometry diff queues the resync.
    session
        .handle_layout_change("@1", Some(Geometry { cols: 100, rows: 50 }))
        .await;
    let state = session.state.lock().await;
    assert_eq!(state.slots["p1"].force_resync.as_deref(), Some("layout_change"));
    assert_eq!(state.telemetry.resync_queued.get("layout_change"), Some(&1));
}

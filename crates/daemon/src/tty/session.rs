// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TTY streaming session: the per-connection multiplexer behind the
//! `agtmux-tty-v2` upgrade. One read loop, one writer task stamping the
//! session-wide frame sequence, a capture scheduler for background panes,
//! and per-focus bridge/tap supervisors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use base64::Engine;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use indexmap::IndexMap;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::bridge::ControlBridge;
use super::control::{ControlEvent, Geometry};
use super::frame::{self, AttachPayload, ClientFrame, Envelope, Outgoing};
use super::tap::PaneTap;
use crate::clock::Clock;
use crate::exec::Executor;
use crate::model::{Target, TargetKind};
use crate::storage::Storage;
use crate::tmux;

/// Tuning knobs for the streaming session.
#[derive(Debug, Clone)]
pub struct TtyTuning {
    pub dispatch_interval: StdDuration,
    pub coalesce_watermark: u32,
    pub local_bg_cadence: StdDuration,
    pub ssh_bg_cadence: StdDuration,
    pub local_fg_backoff_base: StdDuration,
    pub local_bg_backoff_base: StdDuration,
    pub local_backoff_cap: StdDuration,
    pub ssh_fg_backoff_base: StdDuration,
    pub ssh_bg_backoff_base: StdDuration,
    pub ssh_backoff_cap: StdDuration,
    pub fg_error_throttle: StdDuration,
    pub bg_error_throttle: StdDuration,
    pub capture_lines: u32,
    pub scheduler_tick: StdDuration,
    pub enable_bridge: bool,
    pub enable_tap: bool,
}

impl Default for TtyTuning {
    fn default() -> Self {
        Self {
            dispatch_interval: StdDuration::from_millis(350),
            coalesce_watermark: 4,
            local_bg_cadence: StdDuration::from_millis(250),
            ssh_bg_cadence: StdDuration::from_millis(450),
            local_fg_backoff_base: StdDuration::from_millis(100),
            local_bg_backoff_base: StdDuration::from_millis(250),
            local_backoff_cap: StdDuration::from_secs(2),
            ssh_fg_backoff_base: StdDuration::from_millis(280),
            ssh_bg_backoff_base: StdDuration::from_millis(650),
            ssh_backoff_cap: StdDuration::from_secs(8),
            fg_error_throttle: StdDuration::from_millis(1200),
            bg_error_throttle: StdDuration::from_secs(3),
            capture_lines: 200,
            scheduler_tick: StdDuration::from_millis(50),
            enable_bridge: true,
            enable_tap: true,
        }
    }
}

/// Shared dependencies of every TTY session.
pub struct TtyDeps {
    pub storage: Arc<dyn Storage>,
    pub executor: Arc<dyn Executor>,
    pub clock: Arc<dyn Clock>,
    pub tuning: TtyTuning,
}

/// In-process counters, per session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Telemetry {
    pub captures_foreground: u64,
    pub captures_background: u64,
    pub output_bridge: u64,
    pub output_pane_tap: u64,
    pub output_snapshot: u64,
    pub resync_queued: HashMap<String, u64>,
    pub resync_applied: HashMap<String, u64>,
}

/// Pending coalesced snapshot for a background pane.
struct Pending {
    bytes: Vec<u8>,
    from_seq: u64,
    dropped: u32,
}

/// One attached pane.
struct PaneSlot {
    alias: String,
    target_id: String,
    session_name: String,
    window_id: String,
    pane_id: String,
    /// Runtime bound at attach time; a later change fails writes stale.
    runtime_id: String,
    output_seq: u64,
    foreground: bool,
    pending: Option<Pending>,
    last_dispatch: Option<Instant>,
    next_capture_at: Instant,
    failures: u32,
    last_error_at: Option<Instant>,
    /// Reason for a queued resync, applied at the next capture.
    force_resync: Option<String>,
    /// Hash of the last dispatched capture; identical captures are skipped.
    last_content: Option<u64>,
}

impl PaneSlot {
    fn next_output_seq(&mut self) -> u64 {
        self.output_seq += 1;
        self.output_seq
    }
}

#[derive(Default)]
struct SessionState {
    slots: IndexMap<String, PaneSlot>,
    focus: Option<String>,
    next_alias: u32,
    /// Last observed geometry per (target_id, window_id).
    window_geometry: HashMap<(String, String), Geometry>,
    /// Alias the pane tap currently serves, if any.
    tap_active_for: Option<String>,
    /// Whether a control bridge is currently live. While neither the tap
    /// nor the bridge covers the foreground pane, it falls back to capture.
    bridge_up: bool,
    telemetry: Telemetry,
    hello_done: bool,
}

/// Supervised subprocesses, one bridge per focused session, one tap per
/// focused pane.
#[derive(Default)]
struct Procs {
    bridge: Option<Arc<ControlBridge>>,
    bridge_key: Option<(String, String)>,
    tap: Option<Arc<PaneTap>>,
}

pub struct TtySession {
    deps: Arc<TtyDeps>,
    state: tokio::sync::Mutex<SessionState>,
    procs: tokio::sync::Mutex<Procs>,
    out_tx: mpsc::Sender<Outgoing>,
    closed: CancellationToken,
}

/// Serve one upgraded connection until the peer disconnects or the daemon
/// shuts down.
pub async fn serve<S>(stream: S, deps: Arc<TtyDeps>, shutdown: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (session, out_rx) = TtySession::new(deps);
    session.run(stream, out_rx, shutdown).await;
}

impl TtySession {
    pub fn new(deps: Arc<TtyDeps>) -> (Arc<Self>, mpsc::Receiver<Outgoing>) {
        let (out_tx, out_rx) = mpsc::channel(256);
        let session = Arc::new(Self {
            deps,
            state: tokio::sync::Mutex::new(SessionState::default()),
            procs: tokio::sync::Mutex::new(Procs::default()),
            out_tx,
            closed: CancellationToken::new(),
        });
        (session, out_rx)
    }

    pub async fn telemetry(&self) -> Telemetry {
        self.state.lock().await.telemetry.clone()
    }

    /// Run the read loop, writer task, and capture scheduler.
    pub async fn run<S>(
        self: &Arc<Self>,
        stream: S,
        out_rx: mpsc::Receiver<Outgoing>,
        shutdown: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, frame::frame_codec());
        let writer = FramedWrite::new(write_half, frame::frame_codec());

        let writer_task = tokio::spawn(write_loop(writer, out_rx, self.closed.clone()));

        let scheduler = Arc::clone(self);
        let scheduler_cancel = self.closed.clone();
        let scheduler_task = tokio::spawn(async move {
            scheduler.capture_loop(scheduler_cancel).await;
        });

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.closed.cancelled() => break,
                framed = reader.next() => match framed {
                    Some(Ok(body)) => {
                        if self.handle_frame(&body).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        debug!(error = %err, "tty frame read error");
                        let _ = self
                            .send(frame::error(frame::E_PROTOCOL_INVALID_FRAME, "unreadable frame"))
                            .await;
                        break;
                    }
                    None => break,
                },
            }
        }

        self.teardown().await;
        scheduler_task.abort();
        self.closed.cancel();
        let _ = writer_task.await;
    }

    async fn send(&self, outgoing: Outgoing) -> Result<(), ()> {
        self.out_tx.send(outgoing).await.map_err(|_| ())
    }

    /// Idempotent teardown: stop tap then bridge.
    async fn teardown(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        let mut procs = self.procs.lock().await;
        if let Some(tap) = procs.tap.take() {
            tap.stop().await;
        }
        if let Some(bridge) = procs.bridge.take() {
            bridge.stop();
        }
        procs.bridge_key = None;
        self.state.lock().await.bridge_up = false;
    }

    /// Decode and dispatch one client frame. `Err` tears the session down.
    async fn handle_frame(self: &Arc<Self>, body: &[u8]) -> Result<(), ()> {
        let envelope: Envelope = match frame::decode_envelope(body) {
            Ok(envelope) => envelope,
            Err(_) => {
                self.send(frame::error(frame::E_PROTOCOL_INVALID_FRAME, "invalid json")).await?;
                return Ok(());
            }
        };
        let request_id = envelope.request_id.clone();
        let parsed = match frame::parse_client_frame(&envelope) {
            Ok(parsed) => parsed,
            Err(code) => {
                self.send(frame::error(code, "malformed frame").with_request(request_id)).await?;
                return Ok(());
            }
        };

        let hello_done = self.state.lock().await.hello_done;
        if !hello_done && !matches!(parsed, ClientFrame::Hello { .. }) {
            self.send(
                frame::error(frame::E_PROTOCOL_INVALID_FRAME, "hello required first")
                    .with_request(request_id),
            )
            .await?;
            return Ok(());
        }

        match parsed {
            ClientFrame::Hello { versions } => {
                if !versions.iter().any(|v| v == frame::PROTOCOL_VERSION) {
                    self.send(
                        frame::error(
                            frame::E_PROTOCOL_UNSUPPORTED_VERSION,
                            &format!("server speaks {}", frame::PROTOCOL_VERSION),
                        )
                        .with_request(request_id),
                    )
                    .await?;
                    return Err(());
                }
                self.state.lock().await.hello_done = true;
                self.send(frame::hello_ack().with_request(request_id)).await?;
            }
            ClientFrame::Ping => {
                self.send(frame::pong().with_request(request_id)).await?;
            }
            ClientFrame::Attach(attach) => {
                self.handle_attach(attach, request_id).await?;
            }
            ClientFrame::Focus { pane } => {
                self.handle_focus(&pane, request_id).await?;
            }
            ClientFrame::Write { pane, bytes_base64 } => {
                self.handle_write(&pane, &bytes_base64, request_id).await?;
            }
            ClientFrame::Resize { pane, cols, rows } => {
                self.handle_resize(&pane, cols, rows, request_id).await?;
            }
            ClientFrame::Resync { pane, reason } => {
                self.handle_resync(&pane, &reason, request_id).await?;
            }
            ClientFrame::Detach { pane } => {
                self.handle_detach(&pane, request_id).await?;
            }
        }
        Ok(())
    }

    fn resolve_target_row(&self, requested: Option<&str>) -> Option<Target> {
        if let Some(name) = requested.map(str::trim).filter(|t| !t.is_empty()) {
            return self
                .deps
                .storage
                .get_target(name)
                .or_else(|| {
                    self.deps
                        .storage
                        .list_targets()
                        .into_iter()
                        .find(|t| t.target_name == name)
                });
        }
        self.deps
            .storage
            .default_target()
            .or_else(|| self.deps.storage.get_target("local"))
            .or_else(|| self.deps.storage.list_targets().into_iter().next())
    }

    async fn handle_attach(
        self: &Arc<Self>,
        attach: AttachPayload,
        request_id: Option<String>,
    ) -> Result<(), ()> {
        let Some(target) = self.resolve_target_row(attach.target.as_deref()) else {
            self.send(
                frame::error(frame::E_REF_NOT_FOUND, "no such target").with_request(request_id),
            )
            .await?;
            return Ok(());
        };

        {
            let state = self.state.lock().await;
            let duplicate = state.slots.values().any(|slot| {
                slot.target_id == target.target_id && slot.pane_id == attach.pane_id
            });
            if duplicate {
                drop(state);
                self.send(
                    frame::error(frame::E_REF_INVALID, "pane already attached")
                        .with_request(request_id),
                )
                .await?;
                return Ok(());
            }
        }

        // Best-effort: apply the client's desired geometry.
        if let (Some(cols), Some(rows)) = (attach.cols, attach.rows) {
            let argv = tmux::resize_pane_argv(&attach.pane_id, cols, rows);
            if let Err(err) = self.deps.executor.run(&target, &argv).await {
                debug!(pane = %attach.pane_id, error = %err, "attach resize failed");
            }
        }

        // Initial snapshot, when requested.
        let mut snapshot_base64 = None;
        let mut cursor = None;
        let mut size = None;
        if attach.want_initial_snapshot {
            let capture = self
                .deps
                .executor
                .run(&target, &tmux::capture_visible_argv(&attach.pane_id))
                .await;
            match capture {
                Ok(bytes) => {
                    snapshot_base64 =
                        Some(base64::engine::general_purpose::STANDARD.encode(&bytes));
                }
                Err(err) => {
                    debug!(pane = %attach.pane_id, error = %err, "initial snapshot failed");
                }
            }
            if let Ok(raw) =
                self.deps.executor.run(&target, &tmux::pane_query_argv(&attach.pane_id)).await
            {
                if let Some(geometry) = tmux::parse_pane_query(&raw) {
                    cursor = Some(json!({ "row": geometry.cursor_row, "col": geometry.cursor_col }));
                    size = Some(json!({ "cols": geometry.cols, "rows": geometry.rows }));
                }
            }
        }

        // Runtime binding recorded for write-staleness checks.
        let runtime_id = self
            .deps
            .storage
            .get_state(&target.target_id, &attach.pane_id)
            .map(|row| row.runtime_id)
            .unwrap_or_default();

        let (alias, output_seq, pane_state) = {
            let mut state = self.state.lock().await;
            state.next_alias += 1;
            let alias = format!("p{}", state.next_alias);
            let mut slot = PaneSlot {
                alias: alias.clone(),
                target_id: target.target_id.clone(),
                session_name: attach.session_name.clone(),
                window_id: attach.window_id.clone(),
                pane_id: attach.pane_id.clone(),
                runtime_id,
                output_seq: 0,
                foreground: false,
                pending: None,
                last_dispatch: None,
                next_capture_at: Instant::now(),
                failures: 0,
                last_error_at: None,
                force_resync: None,
                last_content: None,
            };
            let output_seq = slot.next_output_seq();
            state.slots.insert(alias.clone(), slot);
            let pane_state = self
                .deps
                .storage
                .get_state(&target.target_id, &attach.pane_id)
                .map(|row| row.state.as_str());
            (alias, output_seq, pane_state)
        };

        let mut payload = json!({
            "pane": alias,
            "pane_id": attach.pane_id,
            "pane_alias": alias,
            "snapshot_mode": "stream",
            "output_seq": output_seq,
        });
        if let Some(snapshot) = snapshot_base64 {
            payload["snapshot_base64"] = json!(snapshot);
        }
        if let Some(cursor) = cursor {
            payload["cursor"] = cursor;
        }
        if let Some(size) = size {
            payload["size"] = size;
        }
        self.send(Outgoing::new("attached", payload).with_request(request_id)).await?;

        if let Some(pane_state) = pane_state {
            self.send(Outgoing::new("state", json!({ "pane": alias, "state": pane_state })))
                .await?;
        }
        Ok(())
    }

    /// Resolve a pane reference (alias or pane id) to its alias.
    async fn resolve_alias(&self, pane_ref: &str) -> Option<String> {
        let state = self.state.lock().await;
        if state.slots.contains_key(pane_ref) {
            return Some(pane_ref.to_owned());
        }
        state
            .slots
            .values()
            .find(|slot| slot.pane_id == pane_ref)
            .map(|slot| slot.alias.clone())
    }

    async fn handle_focus(
        self: &Arc<Self>,
        pane_ref: &str,
        request_id: Option<String>,
    ) -> Result<(), ()> {
        let Some(alias) = self.resolve_alias(pane_ref).await else {
            self.send(frame::error(frame::E_REF_NOT_FOUND, "pane not attached").with_request(request_id))
                .await?;
            return Ok(());
        };

        let (target_id, session_name, window_id, pane_id) = {
            let mut state = self.state.lock().await;
            if let Some(previous) = state.focus.clone() {
                if let Some(slot) = state.slots.get_mut(&previous) {
                    slot.foreground = false;
                    slot.next_capture_at = Instant::now();
                }
            }
            state.focus = Some(alias.clone());
            let Some(slot) = state.slots.get_mut(&alias) else {
                return Ok(());
            };
            slot.foreground = true;
            (
                slot.target_id.clone(),
                slot.session_name.clone(),
                slot.window_id.clone(),
                slot.pane_id.clone(),
            )
        };

        let Some(target) = self.deps.storage.get_target(&target_id) else {
            self.send(frame::error(frame::E_REF_NOT_FOUND, "target vanished").with_request(request_id))
                .await?;
            return Ok(());
        };

        self.align_procs(&target, &session_name, &window_id, &pane_id, &alias).await;
        self.send(frame::ack("focus", "ok").with_request(request_id)).await?;
        Ok(())
    }

    /// Start or re-align the bridge and tap for the new foreground pane.
    async fn align_procs(
        self: &Arc<Self>,
        target: &Target,
        session_name: &str,
        window_id: &str,
        pane_id: &str,
        alias: &str,
    ) {
        let mut procs = self.procs.lock().await;

        // Tap follows the foreground pane exactly.
        if self.deps.tuning.enable_tap {
            if let Some(tap) = procs.tap.take() {
                self.state.lock().await.tap_active_for = None;
                tap.stop().await;
            }
            match PaneTap::spawn(target, pane_id, Arc::clone(&self.deps.executor)) {
                Ok((tap, bytes_rx, err_rx)) => {
                    let tap = Arc::new(tap);
                    procs.tap = Some(Arc::clone(&tap));
                    self.state.lock().await.tap_active_for = Some(alias.to_owned());
                    self.spawn_tap_pump(alias.to_owned(), bytes_rx, err_rx);
                }
                Err(err) => {
                    warn!(pane = pane_id, error = %err, "pane tap spawn failed");
                    let _ = self
                        .send(frame::error(frame::E_TMUX_PIPE_DOWN, "pane tap unavailable"))
                        .await;
                }
            }
        }

        // One bridge per (target, session); re-focus only realigns it.
        if self.deps.tuning.enable_bridge {
            let key = (target.target_id.clone(), session_name.to_owned());
            if procs.bridge_key.as_ref() != Some(&key) {
                if let Some(bridge) = procs.bridge.take() {
                    bridge.stop();
                }
                match ControlBridge::spawn(target, session_name) {
                    Ok((bridge, err_rx)) => {
                        let bridge = Arc::new(bridge);
                        self.spawn_bridge_pump(bridge.subscribe(), err_rx);
                        procs.bridge = Some(Arc::clone(&bridge));
                        procs.bridge_key = Some(key);
                        self.state.lock().await.bridge_up = true;
                    }
                    Err(err) => {
                        warn!(session = session_name, error = %err, "bridge spawn failed");
                        self.state.lock().await.bridge_up = false;
                        let _ = self
                            .send(frame::error(frame::E_TMUX_BRIDGE_DOWN, "bridge unavailable"))
                            .await;
                    }
                }
            }
            if let Some(bridge) = procs.bridge.as_ref() {
                if let Err(err) = bridge.align_focus(window_id, pane_id).await {
                    warn!(error = %err, "bridge focus alignment failed");
                    let _ = self
                        .send(frame::error(frame::E_TMUX_BRIDGE_DOWN, "bridge write failed"))
                        .await;
                    if let Some(bridge) = procs.bridge.take() {
                        bridge.stop();
                    }
                    procs.bridge_key = None;
                    self.state.lock().await.bridge_up = false;
                }
            }
        }
    }

    fn spawn_tap_pump(
        self: &Arc<Self>,
        alias: String,
        mut bytes_rx: mpsc::Receiver<Bytes>,
        mut err_rx: mpsc::Receiver<anyhow::Error>,
    ) {
        let session = Arc::clone(self);
        let closed = self.closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    chunk = bytes_rx.recv() => match chunk {
                        Some(bytes) => {
                            if session.emit_live_output(&alias, &bytes, "pane_tap").await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    err = err_rx.recv() => {
                        if let Some(err) = err {
                            debug!(error = %err, "pane tap exited");
                            let mut state = session.state.lock().await;
                            if state.tap_active_for.as_deref() == Some(alias.as_str()) {
                                state.tap_active_for = None;
                            }
                            drop(state);
                            session.procs.lock().await.tap = None;
                            let _ = session
                                .send(frame::error(frame::E_TMUX_PIPE_DOWN, "pane tap exited"))
                                .await;
                        }
                        break;
                    }
                }
            }
        });
    }

    fn spawn_bridge_pump(
        self: &Arc<Self>,
        mut events: tokio::sync::broadcast::Receiver<ControlEvent>,
        mut err_rx: mpsc::Receiver<anyhow::Error>,
    ) {
        let session = Arc::clone(self);
        let closed = self.closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => session.handle_bridge_event(event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(dropped)) => {
                            debug!(dropped, "bridge events lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    err = err_rx.recv() => {
                        if let Some(err) = err {
                            debug!(error = %err, "bridge exited");
                            let mut procs = session.procs.lock().await;
                            if let Some(bridge) = procs.bridge.take() {
                                bridge.stop();
                            }
                            procs.bridge_key = None;
                            drop(procs);
                            session.state.lock().await.bridge_up = false;
                            let _ = session
                                .send(frame::error(frame::E_TMUX_BRIDGE_DOWN, "bridge exited"))
                                .await;
                        }
                        break;
                    }
                }
            }
        });
    }

    async fn handle_bridge_event(self: &Arc<Self>, event: ControlEvent) {
        match event {
            ControlEvent::Output { pane_id, bytes } => {
                let forward = {
                    let state = self.state.lock().await;
                    let tap_active = state.tap_active_for.is_some();
                    state
                        .focus
                        .as_ref()
                        .and_then(|alias| state.slots.get(alias))
                        .filter(|slot| slot.pane_id == pane_id && !tap_active)
                        .map(|slot| slot.alias.clone())
                };
                if let Some(alias) = forward {
                    let _ = self.emit_live_output(&alias, &bytes, "bridge").await;
                }
            }
            ControlEvent::LayoutChange { window_id, geometry } => {
                self.handle_layout_change(&window_id, geometry).await;
            }
            ControlEvent::SessionChanged { session_name, .. } => {
                debug!(session = %session_name, "bridge session changed");
            }
            ControlEvent::WindowAdd { window_id } => {
                debug!(window = %window_id, "bridge window added");
            }
            ControlEvent::Exit => {
                debug!("bridge control stream exit");
            }
        }
    }

    /// Geometry diff on layout change queues a forced resync for the
    /// window's attached panes.
    async fn handle_layout_change(&self, window_id: &str, geometry: Option<Geometry>) {
        let mut state = self.state.lock().await;
        let Some(new_geometry) = geometry else {
            debug!(window = window_id, "layout change with unknown geometry");
            return;
        };
        // Window identity is per target; every attached slot knows its own.
        let targets: Vec<String> = state
            .slots
            .values()
            .filter(|slot| slot.window_id == window_id)
            .map(|slot| slot.target_id.clone())
            .collect();
        for target_id in targets {
            let key = (target_id.clone(), window_id.to_owned());
            let previous = state.window_geometry.insert(key, new_geometry);
            let changed = previous.is_some_and(|old| old != new_geometry);
            if !changed {
                continue;
            }
            *state
                .telemetry
                .resync_queued
                .entry("layout_change".to_owned())
                .or_default() += 1;
            for slot in state.slots.values_mut() {
                if slot.window_id == window_id && slot.target_id == target_id {
                    slot.force_resync = Some("layout_change".to_owned());
                }
            }
        }
    }

    /// Forward live bytes (tap or bridge) for the foreground pane,
    /// bypassing coalescing.
    async fn emit_live_output(
        &self,
        alias: &str,
        bytes: &[u8],
        source: &'static str,
    ) -> Result<(), ()> {
        let (output_seq, encoded) = {
            let mut state = self.state.lock().await;
            let Some(slot) = state.slots.get_mut(alias) else {
                return Ok(());
            };
            let seq = slot.next_output_seq();
            match source {
                "bridge" => state.telemetry.output_bridge += 1,
                "pane_tap" => state.telemetry.output_pane_tap += 1,
                _ => {}
            }
            (seq, base64::engine::general_purpose::STANDARD.encode(bytes))
        };
        self.send(Outgoing::new(
            "output",
            json!({
                "pane": alias,
                "output_seq": output_seq,
                "bytes_base64": encoded,
                "source": source,
            }),
        ))
        .await
    }

    async fn handle_write(
        self: &Arc<Self>,
        pane_ref: &str,
        bytes_base64: &str,
        request_id: Option<String>,
    ) -> Result<(), ()> {
        let Some(alias) = self.resolve_alias(pane_ref).await else {
            self.send(frame::error(frame::E_REF_NOT_FOUND, "pane not attached").with_request(request_id))
                .await?;
            return Ok(());
        };
        if bytes_base64.is_empty() {
            self.send(
                frame::error(frame::E_REF_INVALID, "write requires bytes").with_request(request_id),
            )
            .await?;
            return Ok(());
        }
        let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(bytes_base64) else {
            self.send(
                frame::error(frame::E_REF_INVALID_ENCODING, "invalid base64")
                    .with_request(request_id),
            )
            .await?;
            return Ok(());
        };
        if bytes.is_empty() {
            self.send(
                frame::error(frame::E_REF_INVALID, "write requires bytes").with_request(request_id),
            )
            .await?;
            return Ok(());
        }

        let (target_id, pane_id, attached_runtime, was_foreground) = {
            let state = self.state.lock().await;
            let Some(slot) = state.slots.get(&alias) else {
                return Ok(());
            };
            (
                slot.target_id.clone(),
                slot.pane_id.clone(),
                slot.runtime_id.clone(),
                slot.foreground,
            )
        };

        // Stale runtime: the pane's canonical binding moved since attach.
        let current_runtime = self
            .deps
            .storage
            .get_state(&target_id, &pane_id)
            .map(|row| row.runtime_id)
            .unwrap_or_default();
        if current_runtime != attached_runtime {
            self.drop_slot(&alias, was_foreground).await;
            self.send(
                frame::error(frame::E_STALE_RUNTIME, "runtime changed since attach")
                    .with_request(request_id),
            )
            .await?;
            return Ok(());
        }

        let Some(target) = self.deps.storage.get_target(&target_id) else {
            self.send(frame::error(frame::E_REF_NOT_FOUND, "target vanished").with_request(request_id))
                .await?;
            return Ok(());
        };

        let argv = if tmux::is_plain_text(&bytes) {
            tmux::send_text_argv(&pane_id, &String::from_utf8_lossy(&bytes), false)
        } else {
            tmux::send_hex_argv(&pane_id, &bytes)
        };
        match self.deps.executor.run(&target, &argv).await {
            Ok(_) => {
                self.send(frame::ack("write", "ok").with_request(request_id)).await?;
            }
            Err(err) => {
                debug!(pane = %pane_id, error = %err, "write failed");
                self.send(
                    frame::error(frame::E_TARGET_UNREACHABLE, "write failed")
                        .with_request(request_id),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn drop_slot(self: &Arc<Self>, alias: &str, was_foreground: bool) {
        {
            let mut state = self.state.lock().await;
            state.slots.shift_remove(alias);
            if state.focus.as_deref() == Some(alias) {
                state.focus = None;
            }
            if state.tap_active_for.as_deref() == Some(alias) {
                state.tap_active_for = None;
            }
            if was_foreground {
                state.bridge_up = false;
            }
        }
        if was_foreground {
            let mut procs = self.procs.lock().await;
            if let Some(tap) = procs.tap.take() {
                tap.stop().await;
            }
            if let Some(bridge) = procs.bridge.take() {
                bridge.stop();
            }
            procs.bridge_key = None;
        }
    }

    async fn handle_resize(
        self: &Arc<Self>,
        pane_ref: &str,
        cols: u16,
        rows: u16,
        request_id: Option<String>,
    ) -> Result<(), ()> {
        if !(20..=500).contains(&cols) || !(5..=300).contains(&rows) {
            self.send(
                frame::error(frame::E_REF_INVALID, "cols 20..=500, rows 5..=300")
                    .with_request(request_id),
            )
            .await?;
            return Ok(());
        }
        let Some(alias) = self.resolve_alias(pane_ref).await else {
            self.send(frame::error(frame::E_REF_NOT_FOUND, "pane not attached").with_request(request_id))
                .await?;
            return Ok(());
        };
        let (foreground, target_id, pane_id) = {
            let state = self.state.lock().await;
            let Some(slot) = state.slots.get(&alias) else {
                return Ok(());
            };
            (slot.foreground, slot.target_id.clone(), slot.pane_id.clone())
        };
        if !foreground {
            self.send(frame::ack("resize", "skipped_conflict").with_request(request_id)).await?;
            return Ok(());
        }
        let Some(target) = self.deps.storage.get_target(&target_id) else {
            self.send(frame::error(frame::E_REF_NOT_FOUND, "target vanished").with_request(request_id))
                .await?;
            return Ok(());
        };
        match self.deps.executor.run(&target, &tmux::resize_pane_argv(&pane_id, cols, rows)).await
        {
            Ok(_) => self.send(frame::ack("resize", "ok").with_request(request_id)).await,
            Err(_) => self
                .send(
                    frame::error(frame::E_TARGET_UNREACHABLE, "resize failed")
                        .with_request(request_id),
                )
                .await,
        }
    }

    async fn handle_resync(
        self: &Arc<Self>,
        pane_ref: &str,
        reason: &str,
        request_id: Option<String>,
    ) -> Result<(), ()> {
        let Some(alias) = self.resolve_alias(pane_ref).await else {
            self.send(frame::error(frame::E_REF_NOT_FOUND, "pane not attached").with_request(request_id))
                .await?;
            return Ok(());
        };
        let reason_key = match reason {
            "manual" | "layout_change" => reason.to_owned(),
            _ => "unknown".to_owned(),
        };
        let output_seq = {
            let mut state = self.state.lock().await;
            *state.telemetry.resync_queued.entry(reason_key.clone()).or_default() += 1;
            *state.telemetry.resync_applied.entry(reason_key).or_default() += 1;
            let Some(slot) = state.slots.get_mut(&alias) else {
                return Ok(());
            };
            slot.last_content = None;
            slot.pending = None;
            slot.force_resync = None;
            slot.next_output_seq()
        };
        self.send(frame::ack("resync", "ok").with_request(request_id)).await?;
        self.send(Outgoing::new(
            "attached",
            json!({
                "pane": alias,
                "pane_alias": alias,
                "snapshot_mode": "stream_resync",
                "output_seq": output_seq,
            }),
        ))
        .await
    }

    async fn handle_detach(
        self: &Arc<Self>,
        pane_ref: &str,
        request_id: Option<String>,
    ) -> Result<(), ()> {
        let Some(alias) = self.resolve_alias(pane_ref).await else {
            self.send(frame::error(frame::E_REF_NOT_FOUND, "pane not attached").with_request(request_id))
                .await?;
            return Ok(());
        };
        let was_foreground = {
            let state = self.state.lock().await;
            state.slots.get(&alias).map(|slot| slot.foreground).unwrap_or(false)
        };
        self.drop_slot(&alias, was_foreground).await;
        self.send(frame::detached(&alias).with_request(request_id)).await
    }

    /// Capture scheduler: cadence-driven capture fallback with per-pane
    /// backoff and latest-wins coalescing. Serves background panes, plus
    /// the foreground pane whenever no tap or bridge covers it.
    async fn capture_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.deps.tuning.scheduler_tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            let now = Instant::now();
            let due = {
                let mut state = self.state.lock().await;
                collect_due(&mut state, now, self.deps.tuning.ssh_backoff_cap)
            };

            for (alias, target_id, pane_id, force_resync) in due {
                self.capture_once(&alias, &target_id, &pane_id, force_resync).await;
            }

            self.flush_pending(now).await;
        }
    }

    async fn capture_once(
        self: &Arc<Self>,
        alias: &str,
        target_id: &str,
        pane_id: &str,
        force_resync: Option<String>,
    ) {
        let Some(target) = self.deps.storage.get_target(target_id) else {
            return;
        };
        let lines = self.deps.tuning.capture_lines;
        let captured = self.deps.executor.run(&target, &tmux::capture_pane_argv(pane_id, lines)).await;
        let now = Instant::now();

        match captured {
            Ok(bytes) => {
                let resync_outgoing = {
                    let mut state = self.state.lock().await;
                    let Some(slot) = state.slots.get_mut(alias) else {
                        return;
                    };
                    slot.failures = 0;
                    let foreground = slot.foreground;
                    slot.next_capture_at = now + cadence(&self.deps.tuning, target.kind, foreground);

                    let mut resync_outgoing = None;
                    if let Some(reason) = force_resync {
                        slot.force_resync = None;
                        slot.last_content = None;
                        slot.pending = None;
                        let output_seq = slot.next_output_seq();
                        let alias = slot.alias.clone();
                        *state.telemetry.resync_applied.entry(reason).or_default() += 1;
                        resync_outgoing = Some(Outgoing::new(
                            "attached",
                            json!({
                                "pane": alias,
                                "pane_alias": alias,
                                "snapshot_mode": "stream_resync",
                                "output_seq": output_seq,
                            }),
                        ));
                    }
                    if foreground {
                        state.telemetry.captures_foreground += 1;
                    } else {
                        state.telemetry.captures_background += 1;
                    }
                    resync_outgoing
                };
                if let Some(outgoing) = resync_outgoing {
                    let _ = self.send(outgoing).await;
                }
                self.stage_snapshot(alias, bytes).await;
            }
            Err(err) => {
                let error_outgoing = {
                    let mut state = self.state.lock().await;
                    let Some(slot) = state.slots.get_mut(alias) else {
                        return;
                    };
                    slot.failures = slot.failures.saturating_add(1);
                    slot.next_capture_at =
                        now + backoff(&self.deps.tuning, target.kind, slot.foreground, slot.failures);
                    let throttle = if slot.foreground {
                        self.deps.tuning.fg_error_throttle
                    } else {
                        self.deps.tuning.bg_error_throttle
                    };
                    let may_surface = slot
                        .last_error_at
                        .is_none_or(|at| now.duration_since(at) >= throttle);
                    if may_surface {
                        slot.last_error_at = Some(now);
                        Some(frame::error(frame::E_TARGET_UNREACHABLE, "capture failed"))
                    } else {
                        None
                    }
                };
                debug!(pane = pane_id, error = %err, "capture fallback failed");
                if let Some(outgoing) = error_outgoing {
                    let _ = self.send(outgoing).await;
                }
            }
        }
    }

    /// Latest-wins staging: send immediately when the dispatch window is
    /// open, otherwise overwrite the pending payload and count the drop.
    async fn stage_snapshot(self: &Arc<Self>, alias: &str, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let now = Instant::now();
        let hash = content_hash(&bytes);
        let outgoing = {
            let mut state = self.state.lock().await;
            let watermark = self.deps.tuning.coalesce_watermark;
            let dispatch_interval = self.deps.tuning.dispatch_interval;
            let Some(slot) = state.slots.get_mut(alias) else {
                return;
            };
            if slot.last_content == Some(hash) {
                return;
            }
            let window_open = slot
                .last_dispatch
                .is_none_or(|at| now.duration_since(at) >= dispatch_interval);

            if window_open && slot.pending.is_none() {
                slot.last_dispatch = Some(now);
                slot.last_content = Some(hash);
                let output_seq = slot.next_output_seq();
                state.telemetry.output_snapshot += 1;
                Some(Outgoing::new(
                    "output",
                    json!({
                        "pane": alias,
                        "output_seq": output_seq,
                        "bytes_base64": base64::engine::general_purpose::STANDARD.encode(&bytes),
                        "source": "snapshot",
                    }),
                ))
            } else {
                match slot.pending.as_mut() {
                    Some(pending) => {
                        pending.bytes = bytes;
                        pending.dropped += 1;
                    }
                    None => {
                        slot.pending =
                            Some(Pending { bytes, from_seq: slot.output_seq, dropped: 0 });
                    }
                }
                let crossed = slot
                    .pending
                    .as_ref()
                    .is_some_and(|pending| pending.dropped >= watermark);
                if crossed {
                    flush_slot(&mut state, alias, now)
                } else {
                    None
                }
            }
        };
        if let Some(outgoing) = outgoing {
            let _ = self.send(outgoing).await;
        }
    }

    /// Flush any pending coalesced payloads whose dispatch window opened.
    async fn flush_pending(self: &Arc<Self>, now: Instant) {
        let outgoing: Vec<Outgoing> = {
            let mut state = self.state.lock().await;
            let dispatch_interval = self.deps.tuning.dispatch_interval;
            let aliases: Vec<String> = state
                .slots
                .values()
                .filter(|slot| {
                    slot.pending.is_some()
                        && slot
                            .last_dispatch
                            .is_none_or(|at| now.duration_since(at) >= dispatch_interval)
                })
                .map(|slot| slot.alias.clone())
                .collect();
            aliases
                .into_iter()
                .filter_map(|alias| flush_slot(&mut state, &alias, now))
                .collect()
        };
        for out in outgoing {
            let _ = self.send(out).await;
        }
    }
}

/// Emit the pending coalesced output for a slot. Caller holds the state
/// lock.
fn flush_slot(state: &mut SessionState, alias: &str, now: Instant) -> Option<Outgoing> {
    let slot = state.slots.get_mut(alias)?;
    let pending = slot.pending.take()?;
    slot.last_dispatch = Some(now);
    slot.last_content = Some(content_hash(&pending.bytes));
    let output_seq = slot.next_output_seq();
    state.telemetry.output_snapshot += 1;
    Some(Outgoing::new(
        "output",
        json!({
            "pane": alias,
            "output_seq": output_seq,
            "bytes_base64": base64::engine::general_purpose::STANDARD.encode(&pending.bytes),
            "source": "snapshot",
            "coalesced": true,
            "coalesced_from_seq": pending.from_seq,
            "dropped_chunks": pending.dropped,
        }),
    ))
}

/// Collect panes due for capture fallback, provisionally rescheduling each
/// so a slow capture is not re-picked by the next tick. A foreground pane
/// is stream-only while the tap or a live bridge covers it; once both are
/// down it falls back to capture like any other pane.
fn collect_due(
    state: &mut SessionState,
    now: Instant,
    reschedule: StdDuration,
) -> Vec<(String, String, String, Option<String>)> {
    let tap_for = state.tap_active_for.clone();
    let bridge_up = state.bridge_up;
    let mut due = Vec::new();
    for slot in state.slots.values_mut() {
        let stream_covered = slot.foreground
            && (tap_for.as_deref() == Some(slot.alias.as_str()) || bridge_up);
        if stream_covered {
            continue;
        }
        if now >= slot.next_capture_at {
            slot.next_capture_at = now + reschedule;
            due.push((
                slot.alias.clone(),
                slot.target_id.clone(),
                slot.pane_id.clone(),
                slot.force_resync.clone(),
            ));
        }
    }
    due
}

/// Foreground fallback polls at the hotpath base; background panes at the
/// target-kind cadence.
fn cadence(tuning: &TtyTuning, kind: TargetKind, foreground: bool) -> StdDuration {
    match (kind, foreground) {
        (TargetKind::Local, false) => tuning.local_bg_cadence,
        (TargetKind::Ssh, false) => tuning.ssh_bg_cadence,
        (TargetKind::Local, true) => tuning.local_fg_backoff_base,
        (TargetKind::Ssh, true) => tuning.ssh_fg_backoff_base,
    }
}

fn backoff(tuning: &TtyTuning, kind: TargetKind, foreground: bool, failures: u32) -> StdDuration {
    let (base, cap) = match (kind, foreground) {
        (TargetKind::Local, true) => (tuning.local_fg_backoff_base, tuning.local_backoff_cap),
        (TargetKind::Local, false) => (tuning.local_bg_backoff_base, tuning.local_backoff_cap),
        (TargetKind::Ssh, true) => (tuning.ssh_fg_backoff_base, tuning.ssh_backoff_cap),
        (TargetKind::Ssh, false) => (tuning.ssh_bg_backoff_base, tuning.ssh_backoff_cap),
    };
    let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(16));
    base.saturating_mul(factor).min(cap)
}

fn content_hash(bytes: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Writer task: total ordering plus monotonic envelope sequencing. On
/// session close the queue is drained so already-accepted frames still
/// reach the wire.
async fn write_loop<W>(
    mut writer: FramedWrite<WriteHalf<W>, tokio_util::codec::LengthDelimitedCodec>,
    mut out_rx: mpsc::Receiver<Outgoing>,
    cancel: CancellationToken,
) where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut seq = 0u64;
    let mut emit = |outgoing: Outgoing, seq: &mut u64| {
        *seq += 1;
        let envelope = Envelope {
            frame_type: outgoing.frame_type.to_owned(),
            seq: *seq,
            request_id: outgoing.request_id,
            payload: outgoing.payload,
        };
        frame::encode_envelope(&envelope).ok()
    };
    loop {
        tokio::select! {
            outgoing = out_rx.recv() => match outgoing {
                Some(outgoing) => {
                    if let Some(body) = emit(outgoing, &mut seq) {
                        if writer.send(body).await.is_err() {
                            return;
                        }
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                while let Ok(outgoing) = out_rx.try_recv() {
                    if let Some(body) = emit(outgoing, &mut seq) {
                        if writer.send(body).await.is_err() {
                            return;
                        }
                    }
                }
                break;
            }
        }
    }
    let _ = writer.flush().await;
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;

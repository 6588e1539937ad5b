// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-mode bridge: one `tmux -C attach-session` child per
//! (target, session), parsed into a bounded event stream. Oldest events are
//! dropped on overflow; the session never blocks on a slow consumer.

use std::process::Stdio;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::control::{parse_control_line, ControlEvent};
use crate::model::{Target, TargetKind};
use crate::tmux;

/// Bounded control event buffer.
const EVENT_BUFFER: usize = 512;

pub struct ControlBridge {
    stdin: Mutex<ChildStdin>,
    events: broadcast::Sender<ControlEvent>,
    cancel: CancellationToken,
    pub session_name: String,
}

impl ControlBridge {
    /// Spawn the bridge child and its reader/reaper tasks. Returns the
    /// supervisor plus the single-slot exit-error receiver.
    pub fn spawn(
        target: &Target,
        session_name: &str,
    ) -> anyhow::Result<(Self, mpsc::Receiver<anyhow::Error>)> {
        let argv = tmux::control_mode_argv(session_name);
        let mut cmd = match target.kind {
            TargetKind::Local => {
                let mut cmd = Command::new(&argv[0]);
                cmd.args(&argv[1..]);
                cmd
            }
            TargetKind::Ssh => {
                let mut cmd = Command::new("ssh");
                cmd.arg("-o").arg("BatchMode=yes");
                cmd.arg(&target.connection_ref);
                cmd.args(&argv);
                cmd
            }
        };
        // A nested TMUX environment makes tmux refuse the attach.
        for (key, _) in std::env::vars() {
            if key.starts_with("TMUX") {
                cmd.env_remove(&key);
            }
        }
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().context("spawn control bridge")?;
        let stdin = child.stdin.take().context("bridge stdin")?;
        let stdout = child.stdout.take().context("bridge stdout")?;
        let stderr = child.stderr.take().context("bridge stderr")?;

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let (err_tx, err_rx) = mpsc::channel(1);

        let stdout_events = events.clone();
        let stdout_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = stdout_cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Some(event) = parse_control_line(&line) {
                                let _ = stdout_events.send(event);
                            }
                        }
                        Ok(None) | Err(_) => break,
                    },
                }
            }
        });

        let stderr_events = events.clone();
        let stderr_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                tokio::select! {
                    _ = stderr_cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Some(event) = parse_control_line(&line) {
                                let _ = stderr_events.send(event);
                            }
                        }
                        Ok(None) | Err(_) => break,
                    },
                }
            }
        });

        // Reaper: cancel → kill → reap; child death → one exit error.
        let reap_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = reap_cancel.cancelled() => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
                status = child.wait() => {
                    let _ = err_tx
                        .try_send(anyhow::anyhow!("control bridge exited: {status:?}"));
                }
            }
        });

        Ok((
            Self {
                stdin: Mutex::new(stdin),
                events,
                cancel,
                session_name: session_name.to_owned(),
            },
            err_rx,
        ))
    }

    /// Subscribe to the bridge's control events. Lagging subscribers lose
    /// the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    /// Write one newline-delimited tmux command to the bridge stdin. The
    /// mutex keeps concurrent alignment commands from interleaving bytes.
    pub async fn send_command(&self, command: &str) -> anyhow::Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(command.as_bytes()).await.context("bridge stdin write")?;
        stdin.write_all(b"\n").await.context("bridge stdin write")?;
        stdin.flush().await.context("bridge stdin flush")?;
        Ok(())
    }

    /// Align the bridge's client to the given window and pane so `%output`
    /// lines track the focused pane.
    pub async fn align_focus(&self, window_id: &str, pane_id: &str) -> anyhow::Result<()> {
        self.send_command(&format!("select-window -t {window_id}")).await?;
        self.send_command(&format!("select-pane -t {pane_id}")).await?;
        Ok(())
    }

    /// Stop the bridge: cancel tasks, kill and reap the child.
    pub fn stop(&self) {
        debug!(session = %self.session_name, "stopping control bridge");
        self.cancel.cancel();
    }
}

impl Drop for ControlBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pane tap: one child per foreground pane relaying raw `pipe-pane` bytes.
//! The child creates a private FIFO on the target, points `pipe-pane` at
//! it, and cats the FIFO to stdout; stopping the tap detaches the
//! multiplexer-side pipe before the child is killed.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::exec::Executor;
use crate::model::{Target, TargetKind};
use crate::tmux;

/// Raw byte chunks buffered between the relay child and the session.
const CHUNK_BUFFER: usize = 64;

pub struct PaneTap {
    cancel: CancellationToken,
    executor: Arc<dyn Executor>,
    target: Target,
    pub pane_id: String,
}

impl PaneTap {
    /// Spawn the tap relay for a pane. Returns the supervisor, the byte
    /// stream, and the single-slot exit-error receiver.
    pub fn spawn(
        target: &Target,
        pane_id: &str,
        executor: Arc<dyn Executor>,
    ) -> anyhow::Result<(Self, mpsc::Receiver<Bytes>, mpsc::Receiver<anyhow::Error>)> {
        let script = relay_script(pane_id);
        let mut cmd = match target.kind {
            TargetKind::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(&script);
                cmd
            }
            TargetKind::Ssh => {
                let mut cmd = Command::new("ssh");
                cmd.arg("-o").arg("BatchMode=yes");
                cmd.arg(&target.connection_ref);
                cmd.arg(script);
                cmd
            }
        };
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::null());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().context("spawn pane tap")?;
        let stdout = child.stdout.take().context("tap stdout")?;

        let (bytes_tx, bytes_rx) = mpsc::channel(CHUNK_BUFFER);
        let (err_tx, err_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let read_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut buf = vec![0u8; 8192];
            loop {
                tokio::select! {
                    _ = read_cancel.cancelled() => break,
                    read = stdout.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if bytes_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                                break;
                            }
                        }
                    },
                }
            }
        });

        let reap_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = reap_cancel.cancelled() => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
                status = child.wait() => {
                    let _ = err_tx.try_send(anyhow::anyhow!("pane tap exited: {status:?}"));
                }
            }
        });

        Ok((
            Self {
                cancel,
                executor,
                target: target.clone(),
                pane_id: pane_id.to_owned(),
            },
            bytes_rx,
            err_rx,
        ))
    }

    /// Stop the tap: detach the multiplexer-side pipe (best effort, so a
    /// dead target does not wedge teardown), then kill the relay child.
    pub async fn stop(&self) {
        debug!(pane = %self.pane_id, "stopping pane tap");
        let detach = tmux::pipe_pane_detach_argv(&self.pane_id);
        if let Err(err) = self.executor.run(&self.target, &detach).await {
            debug!(pane = %self.pane_id, error = %err, "pipe-pane detach failed");
        }
        self.cancel.cancel();
    }
}

impl Drop for PaneTap {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Shell relay: FIFO + `pipe-pane -o` + cat. The FIFO is private (0600)
/// and removed when the relay exits.
fn relay_script(pane_id: &str) -> String {
    let attach = shell_line(&tmux::pipe_pane_attach_argv(pane_id, "cat >> $fifo"));
    format!(
        "fifo=$(mktemp -u); mkfifo -m 600 \"$fifo\" || exit 1; \
         trap 'rm -f \"$fifo\"' EXIT INT TERM; \
         {attach} || exit 1; \
         cat \"$fifo\""
    )
}

/// Render a pipe-pane argv as one shell line. Only the trailing shell
/// command needs quoting; tmux flags and pane ids are shell-safe, and the
/// double quotes keep `$fifo` expanding inside the relay.
fn shell_line(argv: &[String]) -> String {
    let mut parts = argv.to_vec();
    if let Some(last) = parts.last_mut() {
        *last = format!("\"{last}\"");
    }
    parts.join(" ")
}

#[cfg(test)]
#[path = "tap_tests.rs"]
mod tests;

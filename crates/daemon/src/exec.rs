// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command execution boundary. The daemon never shells out directly; every
//! multiplexer command goes through an [`Executor`] that fans out to a
//! local process or a remote shell depending on the target kind.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::process::Command;

use crate::model::{Target, TargetKind};

/// Runs one argv on a target and returns its stdout bytes.
pub trait Executor: Send + Sync {
    fn run<'a>(
        &'a self,
        target: &'a Target,
        argv: &'a [String],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<u8>>> + Send + 'a>>;
}

/// Production executor: local shell for `local` targets, `ssh <alias>` for
/// `ssh` targets. Every run is bounded by `command_timeout`.
pub struct ShellExecutor {
    command_timeout: Duration,
}

impl ShellExecutor {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    /// Build the process invocation for a target: the argv verbatim for
    /// local targets, prefixed with `ssh <connection_ref>` for remote ones.
    fn command_for(&self, target: &Target, argv: &[String]) -> anyhow::Result<Command> {
        if argv.is_empty() {
            bail!("empty argv");
        }
        match target.kind {
            TargetKind::Local => {
                let mut cmd = Command::new(&argv[0]);
                cmd.args(&argv[1..]);
                Ok(cmd)
            }
            TargetKind::Ssh => {
                if target.connection_ref.is_empty() {
                    bail!("ssh target {} has no connection ref", target.target_id);
                }
                let mut cmd = Command::new("ssh");
                cmd.arg("-o").arg("BatchMode=yes");
                cmd.arg(&target.connection_ref);
                cmd.args(argv);
                Ok(cmd)
            }
        }
    }
}

impl Executor for ShellExecutor {
    fn run<'a>(
        &'a self,
        target: &'a Target,
        argv: &'a [String],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<u8>>> + Send + 'a>> {
        Box::pin(async move {
            let mut cmd = self.command_for(target, argv)?;
            cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
            cmd.kill_on_drop(true);

            let output = tokio::time::timeout(self.command_timeout, async {
                cmd.output().await.context("spawn command")
            })
            .await
            .map_err(|_| anyhow::anyhow!("command timed out: {}", argv.join(" ")))??;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                bail!(
                    "command failed ({}): {}",
                    output.status,
                    stderr.trim().chars().take(200).collect::<String>()
                );
            }
            Ok(output.stdout)
        })
    }
}

#[cfg(test)]
#[path = "exec_tests.rs"]
mod tests;

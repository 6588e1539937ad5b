// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

/// Fleet supervisor daemon for coding agents in tmux panes.
#[derive(Debug, Parser)]
#[command(name = "agtmux", version, about)]
pub struct Config {
    /// Unix socket path to listen on.
    #[arg(long, env = "AGTMUX_SOCKET")]
    pub socket: PathBuf,

    /// Budget for future-skewed event timestamps, in seconds.
    #[arg(long, env = "AGTMUX_SKEW_BUDGET_SECS", default_value = "30")]
    pub skew_budget_secs: i64,

    /// Runtime binding window around start hints, in seconds.
    #[arg(long, env = "AGTMUX_BIND_WINDOW_SECS", default_value = "5")]
    pub bind_window_secs: i64,

    /// Action snapshot TTL, in seconds.
    #[arg(long, env = "AGTMUX_SNAPSHOT_TTL_SECS", default_value = "30")]
    pub snapshot_ttl_secs: i64,

    /// Recency window for promoting recently-active idle panes, in seconds.
    #[arg(long, env = "AGTMUX_RECENCY_WINDOW_SECS", default_value = "20")]
    pub recency_window_secs: i64,

    /// Default capture depth for view-output and TTY fallback, in lines.
    #[arg(long, env = "AGTMUX_CAPTURE_LINES", default_value = "200")]
    pub capture_lines: u32,

    /// Dropped-chunk watermark that forces a coalesced dispatch.
    #[arg(long, env = "AGTMUX_COALESCE_WATERMARK", default_value = "4")]
    pub coalesce_watermark: u32,

    /// Timeout for one multiplexer command, in seconds.
    #[arg(long, env = "AGTMUX_COMMAND_TIMEOUT_SECS", default_value = "10")]
    pub command_timeout_secs: u64,

    /// Log format (json or text).
    #[arg(long, env = "AGTMUX_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "AGTMUX_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.socket.as_os_str().is_empty() {
            anyhow::bail!("--socket must not be empty");
        }
        for (name, value) in [
            ("--skew-budget-secs", self.skew_budget_secs),
            ("--bind-window-secs", self.bind_window_secs),
            ("--snapshot-ttl-secs", self.snapshot_ttl_secs),
            ("--recency-window-secs", self.recency_window_secs),
        ] {
            if value <= 0 {
                anyhow::bail!("{name} must be positive");
            }
        }
        if self.capture_lines == 0 {
            anyhow::bail!("--capture-lines must be positive");
        }
        if self.coalesce_watermark == 0 {
            anyhow::bail!("--coalesce-watermark must be positive");
        }
        if !matches!(self.log_format.as_str(), "json" | "text") {
            anyhow::bail!("--log-format must be json or text");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

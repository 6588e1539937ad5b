// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use agtmux::clock::SystemClock;
use agtmux::config::Config;
use agtmux::enrich::NoopEnricher;
use agtmux::exec::ShellExecutor;
use agtmux::server::{self, Daemon};
use agtmux::storage::MemoryStorage;

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    if config.log_format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    let config = Config::parse();
    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }
    init_tracing(&config);

    let storage = Arc::new(MemoryStorage::new());
    let executor =
        Arc::new(ShellExecutor::new(Duration::from_secs(config.command_timeout_secs)));
    let daemon = Daemon::new(
        &config,
        storage,
        executor,
        Arc::new(SystemClock),
        Arc::new(NoopEnricher),
    );

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            signal_shutdown.cancel();
        }
    });

    let socket = config.socket.clone();
    info!(socket = %socket.display(), "starting agtmux daemon");
    if let Err(e) = server::run(daemon, &socket, shutdown).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

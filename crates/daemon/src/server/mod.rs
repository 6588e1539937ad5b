// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unix-socket server: daemon state wiring, router construction, the
//! single-instance lock, and the accept loop with peer-credential capture.

pub mod http;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::routing::{delete, get, post};
use axum::Router;
use chrono::Duration;
use nix::fcntl::{Flock, FlockArg};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error, info};

use crate::actions::ActionExecutor;
use crate::adapters::AdapterRegistry;
use crate::clock::Clock;
use crate::config::Config;
use crate::enrich::ThreadEnricher;
use crate::exec::Executor;
use crate::ingest::IngestEngine;
use crate::present::Projector;
use crate::registry::RuntimeRegistry;
use crate::storage::Storage;
use crate::targets::TargetRegistry;
use crate::tty::{TtyDeps, TtyTuning};
use crate::watch::WatchState;

/// Peer UID captured at accept time; absent when the platform exposes no
/// credentials for the socket.
#[derive(Debug, Clone, Copy)]
pub struct PeerUid(pub Option<u32>);

/// Shared daemon state handed to every handler.
pub struct Daemon {
    pub storage: Arc<dyn Storage>,
    pub executor: Arc<dyn Executor>,
    pub clock: Arc<dyn Clock>,
    pub registry: Arc<RuntimeRegistry>,
    pub ingest: IngestEngine,
    pub projector: Projector,
    pub actions: ActionExecutor,
    pub targets: TargetRegistry,
    pub adapters: AdapterRegistry,
    pub watch: WatchState,
    pub tty: Arc<TtyDeps>,
    pub shutdown: CancellationToken,
}

impl Daemon {
    /// Wire the component graph from configuration plus its external
    /// collaborators.
    pub fn new(
        config: &Config,
        storage: Arc<dyn Storage>,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
        enricher: Arc<dyn ThreadEnricher>,
    ) -> Arc<Self> {
        let registry = Arc::new(RuntimeRegistry::new(
            Arc::clone(&storage),
            Arc::clone(&clock),
            Duration::seconds(config.bind_window_secs),
        ));
        let ingest = IngestEngine::new(
            Arc::clone(&storage),
            Arc::clone(&registry),
            Arc::clone(&clock),
            Duration::seconds(config.skew_budget_secs),
        );
        let projector = Projector::new(
            Arc::clone(&storage),
            enricher,
            Arc::clone(&clock),
            Duration::seconds(config.recency_window_secs),
        );
        let actions = ActionExecutor::new(
            Arc::clone(&storage),
            Arc::clone(&executor),
            Arc::clone(&clock),
            Duration::seconds(config.snapshot_ttl_secs),
            config.capture_lines,
        );
        let targets =
            TargetRegistry::new(Arc::clone(&storage), Arc::clone(&executor), Arc::clone(&clock));
        let adapters = AdapterRegistry::new(Arc::clone(&storage), Arc::clone(&clock));
        let tty = Arc::new(TtyDeps {
            storage: Arc::clone(&storage),
            executor: Arc::clone(&executor),
            clock: Arc::clone(&clock),
            tuning: TtyTuning {
                coalesce_watermark: config.coalesce_watermark,
                ..TtyTuning::default()
            },
        });
        Arc::new(Self {
            storage,
            executor,
            clock,
            registry,
            ingest,
            projector,
            actions,
            targets,
            adapters,
            watch: WatchState::new(),
            tty,
            shutdown: CancellationToken::new(),
        })
    }
}

/// Build the axum router with every HTTP and upgrade route.
pub fn build_router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/v1/health", get(http::health))
        .route("/v1/capabilities", get(http::capabilities))
        .route("/v1/snapshot", get(http::snapshot))
        .route("/v1/targets", get(http::list_targets).post(http::create_target))
        .route("/v1/targets/{name}", delete(http::delete_target))
        .route("/v1/targets/{name}/connect", post(http::connect_target))
        .route("/v1/adapters", get(http::list_adapters).post(http::register_adapter))
        .route("/v1/adapters/{name}/enable", post(http::enable_adapter))
        .route("/v1/adapters/{name}/disable", post(http::disable_adapter))
        .route("/v1/panes", get(http::list_panes))
        .route("/v1/windows", get(http::list_windows))
        .route("/v1/sessions", get(http::list_sessions))
        .route("/v1/watch", get(http::watch))
        .route("/v1/events", post(http::ingest_event))
        .route("/v1/actions/attach", post(http::action_attach))
        .route("/v1/actions/send", post(http::action_send))
        .route("/v1/actions/view-output", post(http::action_view_output))
        .route("/v1/actions/kill", post(http::action_kill))
        .route("/v1/actions/{action_id}/events", get(http::action_events))
        .route("/v2/tty/session", get(http::tty_session))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(daemon)
}

/// Exclusive `<socket>.lock`, held for the daemon's lifetime.
pub struct InstanceLock {
    _flock: Flock<File>,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock or fail when another daemon holds it.
    pub fn acquire(socket_path: &Path) -> anyhow::Result<Self> {
        let path = lock_path(socket_path);
        let file = File::create(&path)
            .with_context(|| format!("create lock file {}", path.display()))?;
        let flock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            anyhow::anyhow!(
                "another daemon holds {} ({errno})",
                path.display()
            )
        })?;
        Ok(Self { _flock: flock, path })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_path(socket_path: &Path) -> PathBuf {
    let mut name = socket_path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Bind the Unix socket (mode 0600) behind the instance lock.
pub fn bind_socket(socket_path: &Path) -> anyhow::Result<(InstanceLock, UnixListener)> {
    if let Some(dir) = socket_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create socket dir {}", dir.display()))?;
    }
    let lock = InstanceLock::acquire(socket_path)?;
    // The lock guarantees no live daemon; a leftover socket is stale.
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("bind {}", socket_path.display()))?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
            .context("chmod socket")?;
    }
    Ok((lock, listener))
}

/// Accept loop: per-connection peer credentials feed the `PeerUid`
/// extension, and upgrades stay enabled for the TTY route.
pub async fn serve(
    daemon: Arc<Daemon>,
    listener: UnixListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let router = build_router(Arc::clone(&daemon));
    info!("listening");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        debug!(error = %err, "accept error");
                        continue;
                    }
                };
                let peer_uid = PeerUid(stream.peer_cred().ok().map(|cred| cred.uid()));
                let svc = router.clone().map_request(
                    move |mut req: axum::http::Request<hyper::body::Incoming>| {
                        req.extensions_mut().insert(peer_uid);
                        req
                    },
                );
                let conn_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let io = hyper_util::rt::TokioIo::new(stream);
                    let hyper_svc = hyper_util::service::TowerToHyperService::new(svc);
                    let builder = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    );
                    let conn = builder.serve_connection_with_upgrades(io, hyper_svc);
                    tokio::pin!(conn);
                    tokio::select! {
                        result = conn.as_mut() => {
                            if let Err(err) = result {
                                debug!(error = %err, "connection error");
                            }
                        }
                        _ = conn_shutdown.cancelled() => {
                            // Bounded grace for in-flight requests.
                            conn.as_mut().graceful_shutdown();
                            let _ = tokio::time::timeout(
                                std::time::Duration::from_secs(5),
                                conn.as_mut(),
                            )
                            .await;
                        }
                    }
                });
            }
        }
    }
    Ok(())
}

/// Bind, serve, and clean up the socket on shutdown.
pub async fn run(
    daemon: Arc<Daemon>,
    socket_path: &Path,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let (lock, listener) = bind_socket(socket_path)?;
    let result = serve(daemon, listener, shutdown).await;
    if let Err(ref err) = result {
        error!(error = %err, "server error");
    }
    let _ = std::fs::remove_file(socket_path);
    drop(lock);
    result
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

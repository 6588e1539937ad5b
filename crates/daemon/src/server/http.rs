// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for the v1 JSON API and the v2 TTY upgrade.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{Daemon, PeerUid};
use crate::actions::{ActionError, ActionPayload, ActionRequest, Guards, KillMode};
use crate::adapters::AdapterSpec;
use crate::clock::format_rfc3339;
use crate::error::ErrorCode;
use crate::ingest::{IngestError, RawEvent};
use crate::model::ADAPTER_PROTOCOL_VERSION;
use crate::targets::TargetSpec;
use crate::tty;
use crate::tty::frame::UPGRADE_TOKEN;
use crate::watch::WatchScope;

const SCHEMA_VERSION: &str = "v1";

fn bad_json(rejection: &JsonRejection) -> Response {
    ErrorCode::RefInvalid.to_http_response(rejection.body_text()).into_response()
}

pub async fn health(State(daemon): State<Arc<Daemon>>) -> Response {
    Json(json!({
        "schema_version": SCHEMA_VERSION,
        "generated_at": format_rfc3339(daemon.clock.now()),
        "status": "ok",
    }))
    .into_response()
}

pub async fn capabilities(State(_daemon): State<Arc<Daemon>>) -> Response {
    Json(json!({
        "schema_version": SCHEMA_VERSION,
        "adapter_protocol_version": ADAPTER_PROTOCOL_VERSION,
        "features": [
            "watch_cursor",
            "actions_idempotent",
            "action_guards",
            "tty_v2",
            "targets_ssh",
        ],
    }))
    .into_response()
}

pub async fn snapshot(State(daemon): State<Arc<Daemon>>) -> Response {
    Json(json!({
        "schema_version": SCHEMA_VERSION,
        "generated_at": format_rfc3339(daemon.clock.now()),
        "targets": daemon.targets.list(),
        "panes": daemon.projector.pane_items(None),
        "windows": daemon.projector.window_items(None),
        "sessions": daemon.projector.session_items(None),
    }))
    .into_response()
}

// Targets

pub async fn list_targets(State(daemon): State<Arc<Daemon>>) -> Response {
    Json(json!({ "targets": daemon.targets.list() })).into_response()
}

pub async fn create_target(
    State(daemon): State<Arc<Daemon>>,
    body: Result<Json<TargetSpec>, JsonRejection>,
) -> Response {
    let Json(spec) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_json(&rejection),
    };
    match daemon.targets.upsert(spec) {
        Ok(target) => (StatusCode::CREATED, Json(target)).into_response(),
        Err((code, message)) => code.to_http_response(message).into_response(),
    }
}

pub async fn delete_target(
    State(daemon): State<Arc<Daemon>>,
    Path(name): Path<String>,
) -> Response {
    if daemon.targets.delete(&name) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        ErrorCode::RefNotFound.to_http_response(format!("unknown target: {name}")).into_response()
    }
}

pub async fn connect_target(
    State(daemon): State<Arc<Daemon>>,
    Path(name): Path<String>,
) -> Response {
    match daemon.targets.connect(&name).await {
        Ok(target) => Json(target).into_response(),
        Err((code, message)) => code.to_http_response(message).into_response(),
    }
}

// Adapters

#[derive(Debug, Deserialize)]
pub struct AdapterListQuery {
    #[serde(default)]
    enabled: Option<bool>,
}

pub async fn list_adapters(
    State(daemon): State<Arc<Daemon>>,
    Query(query): Query<AdapterListQuery>,
) -> Response {
    Json(json!({ "adapters": daemon.adapters.list(query.enabled) })).into_response()
}

pub async fn register_adapter(
    State(daemon): State<Arc<Daemon>>,
    body: Result<Json<AdapterSpec>, JsonRejection>,
) -> Response {
    let Json(spec) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_json(&rejection),
    };
    match daemon.adapters.register(spec) {
        Ok(adapter) => (StatusCode::CREATED, Json(adapter)).into_response(),
        Err((code, message)) => code.to_http_response(message).into_response(),
    }
}

pub async fn enable_adapter(
    State(daemon): State<Arc<Daemon>>,
    Path(name): Path<String>,
) -> Response {
    match daemon.adapters.enable(&name) {
        Ok(adapter) => Json(adapter).into_response(),
        // Incompatible adapter version surfaces as 412.
        Err((ErrorCode::PreconditionFailed, message)) => (
            StatusCode::PRECONDITION_FAILED,
            Json(crate::error::ErrorResponse {
                error: ErrorCode::PreconditionFailed.to_error_body(message),
            }),
        )
            .into_response(),
        Err((code, message)) => code.to_http_response(message).into_response(),
    }
}

pub async fn disable_adapter(
    State(daemon): State<Arc<Daemon>>,
    Path(name): Path<String>,
) -> Response {
    match daemon.adapters.disable(&name) {
        Ok(adapter) => Json(adapter).into_response(),
        Err((code, message)) => code.to_http_response(message).into_response(),
    }
}

// Listings

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    target: Option<String>,
}

pub async fn list_panes(
    State(daemon): State<Arc<Daemon>>,
    Query(query): Query<ListQuery>,
) -> Response {
    Json(json!({ "panes": daemon.projector.pane_items(query.target.as_deref()) }))
        .into_response()
}

pub async fn list_windows(
    State(daemon): State<Arc<Daemon>>,
    Query(query): Query<ListQuery>,
) -> Response {
    Json(json!({ "windows": daemon.projector.window_items(query.target.as_deref()) }))
        .into_response()
}

pub async fn list_sessions(
    State(daemon): State<Arc<Daemon>>,
    Query(query): Query<ListQuery>,
) -> Response {
    Json(json!({ "sessions": daemon.projector.session_items(query.target.as_deref()) }))
        .into_response()
}

// Watch

#[derive(Debug, Deserialize)]
pub struct WatchQuery {
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    target: Option<String>,
}

pub async fn watch(
    State(daemon): State<Arc<Daemon>>,
    Query(query): Query<WatchQuery>,
) -> Response {
    let scope = match query.scope.as_deref() {
        None | Some("") => WatchScope::Panes,
        Some(raw) => match WatchScope::parse(raw) {
            Some(scope) => scope,
            None => {
                return ErrorCode::RefInvalid
                    .to_http_response(format!("unknown scope: {raw}"))
                    .into_response();
            }
        },
    };
    match daemon.watch.render(
        &daemon.projector,
        scope,
        query.cursor.as_deref(),
        query.target.as_deref(),
    ) {
        Ok(body) => (
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson"))],
            body,
        )
            .into_response(),
        Err(code) => code.to_http_response("invalid cursor").into_response(),
    }
}

// Events

pub async fn ingest_event(
    State(daemon): State<Arc<Daemon>>,
    body: Result<Json<RawEvent>, JsonRejection>,
) -> Response {
    let Json(raw) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_json(&rejection),
    };
    match daemon.ingest.ingest(raw) {
        Ok(outcome) => Json(outcome).into_response(),
        Err(IngestError::RefInvalid(message)) => {
            ErrorCode::RefInvalid.to_http_response(message).into_response()
        }
        Err(IngestError::RefNotFound(message)) => {
            ErrorCode::RefNotFound.to_http_response(message).into_response()
        }
        Err(IngestError::RuntimeStale(message)) => {
            ErrorCode::RuntimeStale.to_http_response(message).into_response()
        }
        Err(IngestError::OutOfOrder(message)) => {
            ErrorCode::PreconditionFailed.to_http_response(message).into_response()
        }
    }
}

// Actions

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuardFields {
    #[serde(default)]
    if_runtime: Option<String>,
    #[serde(default)]
    if_state: Option<String>,
    #[serde(default)]
    if_updated_within: Option<String>,
    #[serde(default)]
    force_stale: Option<bool>,
}

impl GuardFields {
    fn into_guards(self) -> Guards {
        Guards {
            if_runtime: self.if_runtime,
            if_state: self.if_state,
            if_updated_within: self.if_updated_within,
            force_stale: self.force_stale.unwrap_or(false),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AttachBody {
    request_ref: String,
    target: String,
    pane_id: String,
    #[serde(flatten)]
    guards: GuardFields,
}

#[derive(Debug, Deserialize)]
pub struct SendBody {
    request_ref: String,
    target: String,
    pane_id: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    enter: Option<bool>,
    #[serde(default)]
    paste: Option<bool>,
    #[serde(flatten)]
    guards: GuardFields,
}

#[derive(Debug, Deserialize)]
pub struct ViewOutputBody {
    request_ref: String,
    target: String,
    pane_id: String,
    #[serde(default)]
    lines: Option<u32>,
    #[serde(flatten)]
    guards: GuardFields,
}

#[derive(Debug, Deserialize)]
pub struct KillBody {
    request_ref: String,
    target: String,
    pane_id: String,
    mode: String,
    #[serde(default)]
    signal: Option<String>,
    #[serde(flatten)]
    guards: GuardFields,
}

fn action_response(result: Result<crate::actions::ActionResponse, ActionError>) -> Response {
    match result {
        Ok(response) => Json(response).into_response(),
        Err(ActionError { code, message }) => code.to_http_response(message).into_response(),
    }
}

pub async fn action_attach(
    State(daemon): State<Arc<Daemon>>,
    body: Result<Json<AttachBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_json(&rejection),
    };
    let request = ActionRequest {
        request_ref: body.request_ref,
        target: body.target,
        pane_id: body.pane_id,
        payload: ActionPayload::Attach,
        guards: body.guards.into_guards(),
    };
    action_response(daemon.actions.execute(request).await)
}

pub async fn action_send(
    State(daemon): State<Arc<Daemon>>,
    body: Result<Json<SendBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_json(&rejection),
    };
    let request = ActionRequest {
        request_ref: body.request_ref,
        target: body.target,
        pane_id: body.pane_id,
        payload: ActionPayload::Send {
            text: body.text,
            key: body.key,
            enter: body.enter.unwrap_or(false),
            paste: body.paste.unwrap_or(false),
        },
        guards: body.guards.into_guards(),
    };
    action_response(daemon.actions.execute(request).await)
}

pub async fn action_view_output(
    State(daemon): State<Arc<Daemon>>,
    body: Result<Json<ViewOutputBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_json(&rejection),
    };
    let lines = body.lines.unwrap_or(daemon.actions.default_capture_lines());
    let request = ActionRequest {
        request_ref: body.request_ref,
        target: body.target,
        pane_id: body.pane_id,
        payload: ActionPayload::ViewOutput { lines },
        guards: body.guards.into_guards(),
    };
    action_response(daemon.actions.execute(request).await)
}

pub async fn action_kill(
    State(daemon): State<Arc<Daemon>>,
    body: Result<Json<KillBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_json(&rejection),
    };
    let mode = match body.mode.as_str() {
        "key" => KillMode::Key,
        "signal" => KillMode::Signal,
        other => {
            return ErrorCode::RefInvalid
                .to_http_response(format!("unknown kill mode: {other}"))
                .into_response();
        }
    };
    let signal = body.signal.unwrap_or_else(|| "INT".to_owned());
    let request = ActionRequest {
        request_ref: body.request_ref,
        target: body.target,
        pane_id: body.pane_id,
        payload: ActionPayload::Kill { mode, signal },
        guards: body.guards.into_guards(),
    };
    action_response(daemon.actions.execute(request).await)
}

pub async fn action_events(
    State(daemon): State<Arc<Daemon>>,
    Path(action_id): Path<String>,
) -> Response {
    if daemon.storage.get_action(&action_id).is_none() {
        return ErrorCode::RefNotFound
            .to_http_response(format!("unknown action: {action_id}"))
            .into_response();
    }
    Json(json!({ "events": daemon.storage.events_for_action(&action_id) })).into_response()
}

// TTY upgrade

fn wants_tty_upgrade(req: &Request) -> bool {
    let connection_has_upgrade = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let upgrade_token = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().eq_ignore_ascii_case(UPGRADE_TOKEN))
        .unwrap_or(false);
    connection_has_upgrade && upgrade_token
}

/// `GET /v2/tty/session`: same-UID peer check, then a hijacked framed
/// session over `101 Switching Protocols`.
pub async fn tty_session(State(daemon): State<Arc<Daemon>>, mut req: Request) -> Response {
    if !wants_tty_upgrade(&req) {
        return ErrorCode::RefInvalid
            .to_http_response(format!("expected upgrade: {UPGRADE_TOKEN}"))
            .into_response();
    }

    // Fail closed when credentials are unavailable.
    let peer_uid = req.extensions().get::<PeerUid>().copied().and_then(|peer| peer.0);
    let daemon_uid = nix::unistd::Uid::effective().as_raw();
    match peer_uid {
        Some(uid) if uid == daemon_uid => {}
        Some(uid) => {
            warn!(peer_uid = uid, daemon_uid, "tty upgrade from foreign uid rejected");
            return (StatusCode::FORBIDDEN, "peer uid mismatch").into_response();
        }
        None => {
            warn!("tty upgrade without peer credentials rejected");
            return (StatusCode::FORBIDDEN, "peer credentials unavailable").into_response();
        }
    }

    let Some(on_upgrade) = req.extensions_mut().remove::<hyper::upgrade::OnUpgrade>() else {
        return ErrorCode::Internal.to_http_response("connection does not support upgrade").into_response();
    };

    let tty_deps = Arc::clone(&daemon.tty);
    let shutdown = daemon.shutdown.clone();
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let io = hyper_util::rt::TokioIo::new(upgraded);
                tty::serve(io, tty_deps, shutdown).await;
            }
            Err(err) => debug!(error = %err, "tty upgrade failed"),
        }
    });

    let mut response = Response::new(axum::body::Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    response
        .headers_mut()
        .insert(header::UPGRADE, HeaderValue::from_static(UPGRADE_TOKEN));
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    response
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Action execution: idempotent attach/send/view-output/kill with
//! fail-closed runtime and state guards, admission snapshots, and audit
//! event correlation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::ErrorCode;
use crate::exec::Executor;
use crate::model::{
    action_dedupe_key, Action, ActionSnapshot, ActionType, EventEnvelope, Pane, ResultCode,
    StateRow, StateSource, Target,
};
use crate::storage::{Storage, StorageError};
use crate::tmux;

/// Kill delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillMode {
    Key,
    Signal,
}

/// Action-specific payload, already shape-checked by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionPayload {
    Attach,
    Send {
        text: Option<String>,
        key: Option<String>,
        enter: bool,
        paste: bool,
    },
    ViewOutput {
        lines: u32,
    },
    Kill {
        mode: KillMode,
        signal: String,
    },
}

impl ActionPayload {
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::Attach => ActionType::Attach,
            Self::Send { .. } => ActionType::Send,
            Self::ViewOutput { .. } => ActionType::ViewOutput,
            Self::Kill { .. } => ActionType::Kill,
        }
    }

    /// Canonical metadata JSON used for idempotent replay comparison.
    /// serde_json maps are sorted, so serialization is deterministic.
    fn canonical_metadata(&self) -> String {
        let value = match self {
            Self::Attach => json!({}),
            Self::Send { text, key, enter, paste } => json!({
                "text": text,
                "key": key,
                "enter": enter,
                "paste": paste,
            }),
            Self::ViewOutput { lines } => json!({ "lines": lines }),
            Self::Kill { mode, signal } => {
                let mode = match mode {
                    KillMode::Key => "key",
                    KillMode::Signal => "signal",
                };
                json!({ "mode": mode, "signal": signal })
            }
        };
        value.to_string()
    }
}

/// Fail-closed guards accepted by every action.
#[derive(Debug, Clone, Default)]
pub struct Guards {
    pub if_runtime: Option<String>,
    pub if_state: Option<String>,
    pub if_updated_within: Option<String>,
    pub force_stale: bool,
}

impl Guards {
    fn any_set(&self) -> bool {
        self.if_runtime.is_some() || self.if_state.is_some() || self.if_updated_within.is_some()
    }
}

/// A fully-described action submission.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub request_ref: String,
    pub target: String,
    pub pane_id: String,
    pub payload: ActionPayload,
    pub guards: Guards,
}

/// Wire response; replays return the original verbatim (minus output).
#[derive(Debug, Clone, Serialize)]
pub struct ActionResponse {
    pub action_id: String,
    pub result_code: ResultCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Action failure surfaced before a row is recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionError {
    pub code: ErrorCode,
    pub message: String,
}

impl ActionError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Parse a compact duration literal (`300ms`, `5s`, `2m`, `1h`).
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = raw.split_at(split);
    let value: i64 = digits.parse().ok()?;
    if value <= 0 {
        return None;
    }
    match unit {
        "ms" => Some(Duration::milliseconds(value)),
        "s" => Some(Duration::seconds(value)),
        "m" => Some(Duration::minutes(value)),
        "h" => Some(Duration::hours(value)),
        _ => None,
    }
}

/// Ref-counted keyed lock table serializing duplicate action submissions.
#[derive(Default)]
struct LockTable {
    entries: Mutex<HashMap<(ActionType, String), LockEntry>>,
}

struct LockEntry {
    lock: Arc<tokio::sync::Mutex<()>>,
    refs: usize,
}

struct LockLease {
    table: Arc<LockTable>,
    key: (ActionType, String),
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl LockTable {
    async fn acquire(self: &Arc<Self>, key: (ActionType, String)) -> LockLease {
        let lock = {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| LockEntry { lock: Arc::new(tokio::sync::Mutex::new(())), refs: 0 });
            entry.refs += 1;
            Arc::clone(&entry.lock)
        };
        let guard = lock.lock_owned().await;
        LockLease { table: Arc::clone(self), key, guard: Some(guard) }
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        // Release the mutex before the refcount so a waiter never observes
        // a removed entry while still queued on its lock.
        self.guard.take();
        let mut entries = self.table.entries.lock();
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(&self.key);
            }
        }
    }
}

pub struct ActionExecutor {
    storage: Arc<dyn Storage>,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    locks: Arc<LockTable>,
    snapshot_ttl: Duration,
    default_capture_lines: u32,
}

impl ActionExecutor {
    pub fn new(
        storage: Arc<dyn Storage>,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
        snapshot_ttl: Duration,
        default_capture_lines: u32,
    ) -> Self {
        Self {
            storage,
            executor,
            clock,
            locks: Arc::new(LockTable::default()),
            snapshot_ttl,
            default_capture_lines,
        }
    }

    pub fn default_capture_lines(&self) -> u32 {
        self.default_capture_lines
    }

    /// Run one action through the full pipeline.
    pub async fn execute(&self, request: ActionRequest) -> Result<ActionResponse, ActionError> {
        let action_type = request.payload.action_type();
        self.validate(&request)?;

        // Per-key serialization: duplicate submissions queue here and take
        // the replay path once the first completes.
        let _lease =
            self.locks.acquire((action_type, request.request_ref.clone())).await;

        let target = self.resolve_target(&request.target)?;
        let metadata = request.payload.canonical_metadata();

        // Idempotent lookup.
        if let Some(existing) = self.storage.get_action_by_ref(action_type, &request.request_ref) {
            if existing.target_id != target.target_id
                || existing.pane_id != request.pane_id
                || existing.metadata_json.as_deref() != Some(metadata.as_str())
            {
                return Err(ActionError::new(
                    ErrorCode::IdempotencyConflict,
                    "request_ref exists with different target, pane, or metadata",
                ));
            }
            self.backfill_audit(&existing);
            return Ok(ActionResponse {
                action_id: existing.action_id,
                result_code: existing.result_code,
                completed_at: existing.completed_at,
                error_code: existing.error_code,
                output: None,
            });
        }

        // Resolution: pane existence via the full pane listing.
        self.resolve_pane(&target, &request.pane_id).await?;

        // Guards + admission snapshot.
        let now = self.clock.now();
        let row = self.storage.get_state(&target.target_id, &request.pane_id);
        self.check_guards(&request.guards, row.as_ref())?;

        // First read materializes the unknown default row.
        let row = match row {
            Some(row) => row,
            None => {
                let row = StateRow::unknown(&target.target_id, &request.pane_id, now);
                self.storage.upsert_state(row.clone());
                row
            }
        };
        let admission =
            (row.runtime_id.clone(), row.state_version, now, now + self.snapshot_ttl);
        if admission.3 <= now {
            return Err(ActionError::new(ErrorCode::SnapshotExpired, "snapshot ttl elapsed"));
        }

        // Re-read: fail if the runtime or version moved since admission.
        {
            let reread = self.storage.get_state(&target.target_id, &request.pane_id);
            let moved = reread.map(|r| (r.runtime_id, r.state_version));
            if moved != Some((admission.0.clone(), admission.1)) {
                return Err(ActionError::new(
                    ErrorCode::RuntimeStale,
                    "state moved during admission",
                ));
            }
        }

        // Kill-by-signal needs a known runtime PID before any side effect.
        let kill_pid = match &request.payload {
            ActionPayload::Kill { mode: KillMode::Signal, .. } => {
                let pid = self
                    .storage
                    .get_state(&target.target_id, &request.pane_id)
                    .filter(|row| !row.runtime_id.is_empty())
                    .and_then(|row| self.storage.get_runtime(&row.runtime_id))
                    .and_then(|runtime| runtime.pid);
                match pid {
                    Some(pid) => Some(pid),
                    None => {
                        return Err(ActionError::new(
                            ErrorCode::PidUnavailable,
                            "no runtime pid known for pane",
                        ));
                    }
                }
            }
            _ => None,
        };

        // Side effect.
        let effect = self.run_side_effect(&target, &request, kill_pid).await;
        let completed_at = self.clock.now();
        let (result_code, error_code, output) = match effect {
            Ok(output) => (ResultCode::Completed, None, output),
            Err(err) => {
                warn!(action = %action_type, error = %err, "action side effect failed");
                (ResultCode::Failed, Some(ErrorCode::TargetUnreachable.token().to_owned()), None)
            }
        };

        // Persist: action row first, snapshot second, audit last.
        let snapshot_runtime = admission.0.clone();
        let action = Action {
            action_id: Uuid::new_v4().to_string(),
            action_type,
            request_ref: request.request_ref.clone(),
            target_id: target.target_id.clone(),
            pane_id: request.pane_id.clone(),
            runtime_id: if snapshot_runtime.is_empty() {
                None
            } else {
                Some(snapshot_runtime.clone())
            },
            requested_at: now,
            completed_at: Some(completed_at),
            result_code,
            error_code: error_code.clone(),
            metadata_json: Some(metadata),
        };
        match self.storage.insert_action(action.clone()) {
            Ok(()) => {}
            Err(StorageError::Conflict(_)) => {
                // A concurrent writer won the key despite the lock; replay.
                if let Some(existing) =
                    self.storage.get_action_by_ref(action_type, &request.request_ref)
                {
                    self.backfill_audit(&existing);
                    return Ok(ActionResponse {
                        action_id: existing.action_id,
                        result_code: existing.result_code,
                        completed_at: existing.completed_at,
                        error_code: existing.error_code,
                        output: None,
                    });
                }
                return Err(ActionError::new(ErrorCode::PreconditionFailed, "storage conflict"));
            }
            Err(err) => {
                return Err(ActionError::new(ErrorCode::PreconditionFailed, err.to_string()));
            }
        }

        let (runtime_id, state_version, observed_at, expires_at) = admission;
        let snapshot = ActionSnapshot {
            snapshot_id: Uuid::new_v4().to_string(),
            action_id: action.action_id.clone(),
            target_id: target.target_id.clone(),
            pane_id: request.pane_id.clone(),
            runtime_id,
            state_version,
            observed_at,
            expires_at,
            nonce: Uuid::new_v4().to_string(),
        };
        self.storage.insert_snapshot_once(snapshot);

        self.emit_audit(&action);

        Ok(ActionResponse {
            action_id: action.action_id,
            result_code,
            completed_at: Some(completed_at),
            error_code,
            output,
        })
    }

    /// Shape-check the payload and guards before taking any lock.
    fn validate(&self, request: &ActionRequest) -> Result<(), ActionError> {
        if request.request_ref.trim().is_empty() {
            return Err(ActionError::new(ErrorCode::RefInvalid, "request_ref is required"));
        }
        if request.pane_id.trim().is_empty() {
            return Err(ActionError::new(ErrorCode::RefInvalid, "pane_id is required"));
        }
        match &request.payload {
            ActionPayload::Attach => {}
            ActionPayload::Send { text, key, .. } => {
                if text.is_some() == key.is_some() {
                    return Err(ActionError::new(
                        ErrorCode::RefInvalid,
                        "send takes exactly one of text or key",
                    ));
                }
                if let Some(key) = key {
                    if key.trim().is_empty() {
                        return Err(ActionError::new(
                            ErrorCode::RefInvalid,
                            "whitespace-only key rejected",
                        ));
                    }
                }
            }
            ActionPayload::ViewOutput { lines } => {
                if *lines == 0 {
                    return Err(ActionError::new(ErrorCode::RefInvalid, "lines must be positive"));
                }
            }
            ActionPayload::Kill { mode, signal } => match mode {
                KillMode::Key => {
                    if !signal.eq_ignore_ascii_case("int") {
                        return Err(ActionError::new(
                            ErrorCode::RefInvalid,
                            "key mode only delivers INT",
                        ));
                    }
                }
                KillMode::Signal => {
                    let upper = signal.to_uppercase();
                    if !matches!(upper.as_str(), "INT" | "TERM" | "KILL") {
                        return Err(ActionError::new(
                            ErrorCode::RefInvalid,
                            format!("unsupported signal: {signal}"),
                        ));
                    }
                }
            },
        }
        if let Some(state) = request.guards.if_state.as_deref() {
            if crate::model::PaneState::parse(state).is_none() {
                return Err(ActionError::new(
                    ErrorCode::RefInvalid,
                    format!("if_state is not a canonical state: {state}"),
                ));
            }
        }
        if let Some(window) = request.guards.if_updated_within.as_deref() {
            if parse_duration(window).is_none() {
                return Err(ActionError::new(
                    ErrorCode::RefInvalid,
                    format!("if_updated_within is not a positive duration: {window}"),
                ));
            }
        }
        Ok(())
    }

    fn resolve_target(&self, name: &str) -> Result<Target, ActionError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ActionError::new(ErrorCode::RefInvalid, "target is required"));
        }
        if let Some(target) = self.storage.get_target(name) {
            return Ok(target);
        }
        if let Some(target) =
            self.storage.list_targets().into_iter().find(|t| t.target_name == name)
        {
            return Ok(target);
        }
        Err(ActionError::new(ErrorCode::RefNotFound, format!("unknown target: {name}")))
    }

    /// Pane existence check via `list-panes -a`; refreshes pane rows as a
    /// side benefit.
    async fn resolve_pane(&self, target: &Target, pane_id: &str) -> Result<(), ActionError> {
        let listing = self
            .executor
            .run(target, &tmux::list_panes_argv())
            .await
            .map_err(|e| ActionError::new(ErrorCode::TargetUnreachable, e.to_string()))?;
        let panes = tmux::parse_pane_list(&listing);
        let now = self.clock.now();
        let mut found = false;
        for info in &panes {
            if info.pane_id == pane_id {
                found = true;
            }
            let existing = self.storage.get_pane(&target.target_id, &info.pane_id);
            let pane = Pane {
                target_id: target.target_id.clone(),
                pane_id: info.pane_id.clone(),
                session_name: info.session_name.clone(),
                window_id: info.window_id.clone(),
                window_name: info.window_name.clone(),
                current_cmd: info.current_cmd.clone(),
                current_path: info.current_path.clone(),
                pane_title: info.pane_title.clone(),
                last_activity_at: existing.as_ref().and_then(|p| p.last_activity_at),
                updated_at: now,
            };
            self.storage.upsert_pane(pane);
        }
        if found {
            Ok(())
        } else {
            Err(ActionError::new(
                ErrorCode::RefNotFound,
                format!("pane {pane_id} not present on {}", target.target_id),
            ))
        }
    }

    /// Fail-closed guard checks. `force_stale` bypasses everything.
    fn check_guards(&self, guards: &Guards, row: Option<&StateRow>) -> Result<(), ActionError> {
        if guards.force_stale {
            return Ok(());
        }
        let Some(row) = row else {
            if guards.any_set() {
                return Err(ActionError::new(ErrorCode::RuntimeStale, "no state observed for pane"));
            }
            return Ok(());
        };
        if guards.any_set() && row.runtime_id.is_empty() {
            return Err(ActionError::new(ErrorCode::RuntimeStale, "pane has no bound runtime"));
        }
        if let Some(if_runtime) = guards.if_runtime.as_deref() {
            if row.runtime_id != if_runtime {
                return Err(ActionError::new(ErrorCode::RuntimeStale, "runtime moved"));
            }
        }
        if let Some(if_state) = guards.if_state.as_deref() {
            // Validated canonical earlier.
            if crate::model::PaneState::parse(if_state) != Some(row.state) {
                return Err(ActionError::new(
                    ErrorCode::PreconditionFailed,
                    format!("state is {} not {if_state}", row.state),
                ));
            }
        }
        if let Some(window) = guards.if_updated_within.as_deref() {
            let window = parse_duration(window).unwrap_or_default();
            if self.clock.now() - row.updated_at > window {
                return Err(ActionError::new(
                    ErrorCode::PreconditionFailed,
                    "state older than if_updated_within",
                ));
            }
        }
        Ok(())
    }

    /// The per-action external command. Attach records completion without
    /// touching the target.
    async fn run_side_effect(
        &self,
        target: &Target,
        request: &ActionRequest,
        kill_pid: Option<u32>,
    ) -> anyhow::Result<Option<String>> {
        match &request.payload {
            ActionPayload::Attach => Ok(None),
            ActionPayload::Send { text, key, enter, paste } => {
                let argv = match (text, key) {
                    (Some(text), None) => {
                        let payload = if *paste { text.clone() } else { text.trim().to_owned() };
                        tmux::send_text_argv(&request.pane_id, &payload, *enter)
                    }
                    (None, Some(key)) => tmux::send_key_argv(&request.pane_id, key.trim()),
                    _ => anyhow::bail!("unreachable: validated"),
                };
                self.executor.run(target, &argv).await?;
                Ok(None)
            }
            ActionPayload::ViewOutput { lines } => {
                let argv = tmux::capture_pane_argv(&request.pane_id, *lines);
                let raw = self.executor.run(target, &argv).await?;
                Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
            }
            ActionPayload::Kill { mode, signal } => {
                match mode {
                    KillMode::Key => {
                        let argv = tmux::send_key_argv(&request.pane_id, "C-c");
                        self.executor.run(target, &argv).await?;
                    }
                    KillMode::Signal => {
                        let Some(pid) = kill_pid else {
                            anyhow::bail!("pid resolved before the side effect");
                        };
                        let argv = tmux::kill_argv(&signal.to_uppercase(), pid);
                        self.executor.run(target, &argv).await?;
                    }
                }
                Ok(None)
            }
        }
    }

    /// Write the `action.<type>` audit event; best-effort, idempotent via
    /// its dedupe key.
    fn emit_audit(&self, action: &Action) {
        let now = self.clock.now();
        let event = EventEnvelope {
            event_id: Uuid::new_v4().to_string(),
            event_type: format!("action.{}", action.action_type.as_str().replace('_', "-")),
            source: StateSource::Wrapper,
            dedupe_key: action_dedupe_key(&action.action_id),
            source_event_id: None,
            source_seq: None,
            event_time: action.completed_at.unwrap_or(now),
            ingested_at: now,
            pid: None,
            start_hint: None,
            runtime_id: action.runtime_id.clone(),
            target_id: Some(action.target_id.clone()),
            pane_id: Some(action.pane_id.clone()),
            agent_type: None,
            raw_payload: json!({
                "request_ref": action.request_ref,
                "result_code": action.result_code.as_str(),
                "error_code": action.error_code,
            }),
            action_id: Some(action.action_id.clone()),
        };
        let _ = self.storage.insert_event(event);
    }

    /// Replay path: emit the audit event if an earlier attempt failed.
    fn backfill_audit(&self, action: &Action) {
        if self.storage.events_for_action(&action.action_id).is_empty() {
            debug!(action_id = %action.action_id, "backfilling missing audit event");
            self.emit_audit(action);
        }
    }
}

#[cfg(test)]
#[path = "actions_tests.rs"]
mod tests;

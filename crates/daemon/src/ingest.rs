// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event ingestion: normalize, validate, bind to a runtime, dedupe, order,
//! and fold the signal into the canonical per-pane state row.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::clock::{parse_rfc3339, Clock};
use crate::model::{Confidence, EventEnvelope, Pane, PaneState, StateRow, StateSource};
use crate::registry::{CandidateQuery, Resolution, RuntimeRegistry};
use crate::storage::{EventInsert, Storage};

/// Wire shape of `POST /v1/events`. Unknown fields are rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawEvent {
    pub event_type: String,
    pub source: String,
    pub dedupe_key: String,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub event_time: Option<String>,
    #[serde(default)]
    pub source_event_id: Option<String>,
    #[serde(default)]
    pub source_seq: Option<u64>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub start_hint: Option<String>,
    #[serde(default)]
    pub runtime_id: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub pane_id: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub raw_payload: serde_json::Value,
    #[serde(default)]
    pub action_id: Option<String>,
}

/// How the event was attached to a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindStatus {
    Bound,
    PendingBind,
}

/// Successful ingestion result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub event_id: String,
    pub status: BindStatus,
    /// True when the (source, dedupe_key) pair had been seen before and the
    /// insert was swallowed.
    #[serde(skip)]
    pub duplicate: bool,
}

/// Ingestion failure classes; the server maps these onto wire codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    RefInvalid(String),
    RefNotFound(String),
    RuntimeStale(String),
    OutOfOrder(String),
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RefInvalid(msg) => write!(f, "ref_invalid: {msg}"),
            Self::RefNotFound(msg) => write!(f, "ref_not_found: {msg}"),
            Self::RuntimeStale(msg) => write!(f, "runtime_stale: {msg}"),
            Self::OutOfOrder(msg) => write!(f, "out_of_order: {msg}"),
        }
    }
}

impl std::error::Error for IngestError {}

/// A classified signal: the state contribution of one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub state: PaneState,
    pub reason_code: &'static str,
    /// Heartbeat-class signals may never downgrade a waiting state.
    pub heartbeat: bool,
}

/// Map a normalized event type to its state contribution.
///
/// Matching is ordered: the most specific classes first, substring matches
/// on the normalized (lower-case, trimmed) type.
pub fn classify_event(event_type: &str) -> Classified {
    let t = event_type;
    let hit = |state, reason_code| Classified { state, reason_code, heartbeat: false };

    if t.starts_with("action.") {
        // Audit events are administrative; they never override a signal.
        return hit(PaneState::Unknown, "administrative");
    }
    if t.contains("approval") || t.contains("permission") {
        return hit(PaneState::WaitingApproval, "approval_requested");
    }
    if t.contains("question") || t.contains("input-request") || t.contains("waiting-input") {
        return hit(PaneState::WaitingInput, "input_requested");
    }
    if t.contains("error") || t.contains("fail") {
        return hit(PaneState::Error, "agent_error");
    }
    if t.contains("session-end") || t == "wrapper-exit" || t.contains("exited") {
        return hit(PaneState::Completed, "session_ended");
    }
    if t.contains("turn-complete") || t.contains("task-complete") || t == "stop" {
        return hit(PaneState::Idle, "turn_complete");
    }
    if t.contains("idle") {
        return hit(PaneState::Idle, "agent_idle");
    }
    if t.contains("heartbeat") || t.contains("activity") || t.contains("poll") {
        return Classified { state: PaneState::Running, reason_code: "heartbeat", heartbeat: true };
    }
    if t == "user-input" || t == "prompt-submit" {
        return hit(PaneState::Running, "user_input");
    }
    if t.contains("start") || t.contains("tool") || t.contains("working") || t.contains("busy") {
        return hit(PaneState::Running, "agent_working");
    }
    hit(PaneState::Unknown, "unsupported_signal")
}

/// Confidence assigned per signal source.
pub fn source_confidence(source: StateSource) -> Confidence {
    match source {
        StateSource::Hook | StateSource::Wrapper => Confidence::High,
        StateSource::Notify => Confidence::Medium,
        StateSource::Poller => Confidence::Low,
    }
}

pub struct IngestEngine {
    storage: Arc<dyn Storage>,
    registry: Arc<RuntimeRegistry>,
    clock: Arc<dyn Clock>,
    skew_budget: Duration,
}

impl IngestEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<RuntimeRegistry>,
        clock: Arc<dyn Clock>,
        skew_budget: Duration,
    ) -> Self {
        Self { storage, registry, clock, skew_budget }
    }

    /// Ingest one envelope: the single operation of this engine.
    pub fn ingest(&self, raw: RawEvent) -> Result<IngestOutcome, IngestError> {
        let now = self.clock.now();

        // Normalization: trim strings, lower-case source and agent type.
        let event_type = raw.event_type.trim().to_lowercase();
        let source_raw = raw.source.trim().to_lowercase();
        let dedupe_key = raw.dedupe_key.trim().to_owned();
        let agent_type = raw
            .agent_type
            .as_deref()
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty());

        if event_type.is_empty() {
            return Err(IngestError::RefInvalid("event_type is required".to_owned()));
        }
        if source_raw.is_empty() {
            return Err(IngestError::RefInvalid("source is required".to_owned()));
        }
        if dedupe_key.is_empty() {
            return Err(IngestError::RefInvalid("dedupe_key is required".to_owned()));
        }
        let source = StateSource::parse(&source_raw)
            .ok_or_else(|| IngestError::RefInvalid(format!("unknown source: {source_raw}")))?;

        // Event time: parse, clamp future skew to now.
        let event_time = match raw.event_time.as_deref().map(str::trim) {
            None | Some("") => now,
            Some(raw_time) => {
                let parsed = parse_rfc3339(raw_time).ok_or_else(|| {
                    IngestError::RefInvalid(format!("unparsable event_time: {raw_time}"))
                })?;
                if parsed > now + self.skew_budget {
                    now
                } else {
                    parsed
                }
            }
        };
        let start_hint = match raw.start_hint.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw_hint) => Some(parse_rfc3339(raw_hint).ok_or_else(|| {
                IngestError::RefInvalid(format!("unparsable start_hint: {raw_hint}"))
            })?),
        };

        // Binding.
        let (target_id, pane_id, runtime_id, status) = match raw.runtime_id.as_deref() {
            Some(runtime_id) if !runtime_id.trim().is_empty() => {
                let runtime_id = runtime_id.trim();
                let runtime = self
                    .storage
                    .get_runtime(runtime_id)
                    .ok_or_else(|| IngestError::RuntimeStale("runtime not found".to_owned()))?;
                if !runtime.is_active() {
                    return Err(IngestError::RuntimeStale("runtime has ended".to_owned()));
                }
                (runtime.target_id, runtime.pane_id, Some(runtime.runtime_id), BindStatus::Bound)
            }
            _ => {
                let pane_id = raw
                    .pane_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| {
                        IngestError::RefInvalid("pane_id or runtime_id is required".to_owned())
                    })?;
                let target = self.resolve_target(raw.target_id.as_deref())?;

                let query = CandidateQuery {
                    pid: raw.pid,
                    start_hint,
                    agent_type: agent_type.clone(),
                };
                match self.registry.resolve(&target, pane_id, &query) {
                    Resolution::Bound(runtime_id) => {
                        (target, pane_id.to_owned(), Some(runtime_id), BindStatus::Bound)
                    }
                    Resolution::Ambiguous => {
                        (target, pane_id.to_owned(), None, BindStatus::PendingBind)
                    }
                }
            }
        };

        // First mention creates the pane row.
        self.ensure_pane(&target_id, &pane_id, now);

        // Per-runtime source ordering: reject regressions, never reorder.
        if let (Some(runtime_id), Some(seq)) = (runtime_id.as_deref(), raw.source_seq) {
            if let Some(runtime) = self.storage.get_runtime(runtime_id) {
                if let Some(last) = runtime.last_source_seq {
                    if seq < last {
                        return Err(IngestError::OutOfOrder(format!(
                            "source_seq {seq} < last accepted {last}"
                        )));
                    }
                }
                let _ = self.storage.set_runtime_source_seq(runtime_id, seq);
            }
        }

        let event_id = raw
            .event_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let envelope = EventEnvelope {
            event_id: event_id.clone(),
            event_type: event_type.clone(),
            source,
            dedupe_key,
            source_event_id: raw.source_event_id,
            source_seq: raw.source_seq,
            event_time,
            ingested_at: now,
            pid: raw.pid,
            start_hint,
            runtime_id: runtime_id.clone(),
            target_id: Some(target_id.clone()),
            pane_id: Some(pane_id.clone()),
            agent_type,
            raw_payload: raw.raw_payload,
            action_id: raw.action_id,
        };

        if self.storage.insert_event(envelope) == EventInsert::Duplicate {
            debug!(event_type, "duplicate event swallowed");
            return Ok(IngestOutcome { event_id, status, duplicate: true });
        }

        self.apply_state(&target_id, &pane_id, runtime_id.as_deref(), &event_type, source, event_time, now);
        self.touch_pane(&target_id, &pane_id, &event_type, event_time, now);

        Ok(IngestOutcome { event_id, status, duplicate: false })
    }

    /// Resolve the target for an unbound event: explicit name or id, the
    /// default target, `"local"`, or the first registered target.
    fn resolve_target(&self, requested: Option<&str>) -> Result<String, IngestError> {
        if let Some(requested) = requested.map(str::trim).filter(|t| !t.is_empty()) {
            if let Some(target) = self.storage.get_target(requested) {
                return Ok(target.target_id);
            }
            if let Some(target) =
                self.storage.list_targets().into_iter().find(|t| t.target_name == requested)
            {
                return Ok(target.target_id);
            }
            return Err(IngestError::RefNotFound(format!("unknown target: {requested}")));
        }
        if let Some(target) = self.storage.default_target() {
            return Ok(target.target_id);
        }
        if let Some(target) = self.storage.get_target("local") {
            return Ok(target.target_id);
        }
        if let Some(target) = self.storage.list_targets().into_iter().next() {
            return Ok(target.target_id);
        }
        Err(IngestError::RefNotFound("no targets registered".to_owned()))
    }

    fn ensure_pane(&self, target_id: &str, pane_id: &str, now: DateTime<Utc>) {
        if self.storage.get_pane(target_id, pane_id).is_none() {
            self.storage.upsert_pane(Pane::placeholder(target_id, pane_id, now));
        }
    }

    /// Fold the classified signal into the canonical state row.
    ///
    /// Acceptance rules, in order:
    /// - heartbeats never downgrade a waiting state;
    /// - a signal at equal or stronger precedence always lands;
    /// - a weaker-precedence signal lands only when it is newer than the
    ///   last accepted event and is a real (non-administrative) signal —
    ///   this is how a pane leaves `waiting_*` once the user answers;
    /// - accepted updates bump `state_version` monotonically.
    fn apply_state(
        &self,
        target_id: &str,
        pane_id: &str,
        runtime_id: Option<&str>,
        event_type: &str,
        source: StateSource,
        event_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let classified = classify_event(event_type);
        let mut row = self
            .storage
            .get_state(target_id, pane_id)
            .unwrap_or_else(|| StateRow::unknown(target_id, pane_id, now));

        let accepted = {
            let new_prec = classified.state.precedence();
            let cur_prec = row.state.precedence();
            let newer = row.last_event_at.is_none_or(|last| event_time >= last);
            if classified.heartbeat && row.state.is_waiting() {
                false
            } else if classified.state == PaneState::Unknown && row.state != PaneState::Unknown {
                // Administrative or unclassifiable signals never override.
                false
            } else if new_prec <= cur_prec {
                true
            } else {
                // Precedence downgrade: only a newer concrete signal relaxes
                // the state (e.g. waiting_input → running after an answer).
                newer && !classified.heartbeat
            }
        };

        if accepted {
            row.state = classified.state;
            row.reason_code = classified.reason_code.to_owned();
            row.confidence = source_confidence(source);
            row.state_source = source;
            row.last_event_type = event_type.to_owned();
            row.last_event_at = Some(event_time);
            row.state_version += 1;
            if let Some(runtime_id) = runtime_id {
                row.runtime_id = runtime_id.to_owned();
            }
        }
        row.last_seen_at = now;
        row.updated_at = now;
        self.storage.upsert_state(row);
    }

    /// Record pane activity for non-administrative events.
    fn touch_pane(
        &self,
        target_id: &str,
        pane_id: &str,
        event_type: &str,
        event_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        if crate::derive::is_administrative(event_type) {
            return;
        }
        if let Some(mut pane) = self.storage.get_pane(target_id, pane_id) {
            let newer = pane.last_activity_at.is_none_or(|last| event_time > last);
            if newer {
                pane.last_activity_at = Some(event_time);
                pane.updated_at = now;
                self.storage.upsert_pane(pane);
            }
        }
    }
}

#[cfg(test)]
#[path = "ingest_tests.rs"]
mod tests;

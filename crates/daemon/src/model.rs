// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Canonical rows and enums for targets, panes, runtimes, states, events,
//! and actions. Pure data; all fusion logic lives in `ingest` and `derive`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of multiplexer host a target runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Local,
    Ssh,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Ssh => "ssh",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "local" => Some(Self::Local),
            "ssh" => Some(Self::Ssh),
            _ => None,
        }
    }
}

/// Liveness of a target as observed by the last connect probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetHealth {
    Ok,
    Down,
}

/// A multiplexer host the daemon can drive commands on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub target_id: String,
    pub target_name: String,
    pub kind: TargetKind,
    /// Connection reference, e.g. an SSH alias. Empty for local targets.
    pub connection_ref: String,
    pub is_default: bool,
    pub health: TargetHealth,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A multiplexer pane on a target. Created on first mention, never
/// implicitly deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pane {
    pub target_id: String,
    pub pane_id: String,
    pub session_name: String,
    pub window_id: String,
    pub window_name: String,
    pub current_cmd: String,
    pub current_path: String,
    pub pane_title: String,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Pane {
    /// Minimal placeholder pane for first-mention creation.
    pub fn placeholder(target_id: &str, pane_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            target_id: target_id.to_owned(),
            pane_id: pane_id.to_owned(),
            session_name: "unknown-session".to_owned(),
            window_id: "@0".to_owned(),
            window_name: "unknown-window".to_owned(),
            current_cmd: String::new(),
            current_path: String::new(),
            pane_title: String::new(),
            last_activity_at: None,
            updated_at: now,
        }
    }
}

/// An observed agent process instance inside a pane.
///
/// Invariant: at most one active (`ended_at == None`) runtime per
/// (`target_id`, `pane_id`); the registry ends the previous one before
/// opening a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runtime {
    pub runtime_id: String,
    pub target_id: String,
    pub pane_id: String,
    pub tmux_server_boot_id: String,
    pub pane_epoch: u64,
    /// Lower-cased agent type: `codex`, `claude`, `gemini`, `none` for an
    /// unmanaged pane, `unknown` when undetected.
    pub agent_type: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Highest accepted `source_seq` for this runtime; ordering guard state.
    pub last_source_seq: Option<u64>,
}

impl Runtime {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Canonical per-pane state, fused from incoming signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaneState {
    #[default]
    Unknown,
    Running,
    WaitingInput,
    WaitingApproval,
    Idle,
    Completed,
    Error,
}

impl PaneState {
    /// Total precedence order: lower wins a fusion conflict.
    /// `waiting_approval < waiting_input < error < running < idle =
    /// completed < unknown`.
    pub fn precedence(&self) -> u8 {
        match self {
            Self::WaitingApproval => 0,
            Self::WaitingInput => 1,
            Self::Error => 2,
            Self::Running => 3,
            Self::Idle | Self::Completed => 4,
            Self::Unknown => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Running => "running",
            Self::WaitingInput => "waiting_input",
            Self::WaitingApproval => "waiting_approval",
            Self::Idle => "idle",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "unknown" => Some(Self::Unknown),
            "running" => Some(Self::Running),
            "waiting_input" => Some(Self::WaitingInput),
            "waiting_approval" => Some(Self::WaitingApproval),
            "idle" => Some(Self::Idle),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// `waiting_input` or `waiting_approval`.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::WaitingInput | Self::WaitingApproval)
    }
}

impl fmt::Display for PaneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Confidence attached to a fused state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Where a signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateSource {
    Hook,
    Notify,
    Wrapper,
    Poller,
}

impl StateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hook => "hook",
            Self::Notify => "notify",
            Self::Wrapper => "wrapper",
            Self::Poller => "poller",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "hook" => Some(Self::Hook),
            "notify" => Some(Self::Notify),
            "wrapper" => Some(Self::Wrapper),
            "poller" => Some(Self::Poller),
            _ => None,
        }
    }
}

impl fmt::Display for StateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical per-pane state row, keyed by (`target_id`, `pane_id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRow {
    pub target_id: String,
    pub pane_id: String,
    /// Runtime that produced the last accepted signal; empty when no
    /// runtime has ever been bound.
    pub runtime_id: String,
    pub state: PaneState,
    pub reason_code: String,
    pub confidence: Confidence,
    pub state_source: StateSource,
    pub last_event_type: String,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,
    /// Monotonic per pane; bumped on every accepted update.
    pub state_version: u64,
    pub updated_at: DateTime<Utc>,
}

impl StateRow {
    /// Default row materialized on first read when no signal has arrived.
    pub fn unknown(target_id: &str, pane_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            target_id: target_id.to_owned(),
            pane_id: pane_id.to_owned(),
            runtime_id: String::new(),
            state: PaneState::Unknown,
            reason_code: "unsupported_signal".to_owned(),
            confidence: Confidence::Low,
            state_source: StateSource::Poller,
            last_event_type: String::new(),
            last_event_at: None,
            last_seen_at: now,
            state_version: 0,
            updated_at: now,
        }
    }
}

/// A normalized event accepted by the ingestion engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub event_type: String,
    pub source: StateSource,
    pub dedupe_key: String,
    pub source_event_id: Option<String>,
    pub source_seq: Option<u64>,
    pub event_time: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub pid: Option<u32>,
    pub start_hint: Option<DateTime<Utc>>,
    pub runtime_id: Option<String>,
    pub target_id: Option<String>,
    pub pane_id: Option<String>,
    pub agent_type: Option<String>,
    pub raw_payload: serde_json::Value,
    pub action_id: Option<String>,
}

/// The four side-effecting operations the daemon exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Attach,
    Send,
    ViewOutput,
    Kill,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attach => "attach",
            Self::Send => "send",
            Self::ViewOutput => "view_output",
            Self::Kill => "kill",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of an action run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Completed,
    Failed,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A fully-resolved action row. Immutable after insert; written only once
/// the side-effect outcome is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub action_id: String,
    pub action_type: ActionType,
    /// Caller idempotency key, unique per (`action_type`, `request_ref`).
    pub request_ref: String,
    pub target_id: String,
    pub pane_id: String,
    pub runtime_id: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_code: ResultCode,
    pub error_code: Option<String>,
    /// Canonical JSON of the action-specific metadata, used for idempotent
    /// replay comparison.
    pub metadata_json: Option<String>,
}

/// Observed state at action admission, enabling fail-closed replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSnapshot {
    pub snapshot_id: String,
    pub action_id: String,
    pub target_id: String,
    pub pane_id: String,
    pub runtime_id: String,
    pub state_version: u64,
    pub observed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub nonce: String,
}

/// A registered adapter binary (hook/wrapper/notifier) allowed to emit
/// events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adapter {
    pub name: String,
    pub version: String,
    /// Adapter wire protocol major the binary speaks.
    pub protocol_version: u32,
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
}

/// Adapter protocol major this daemon accepts.
pub const ADAPTER_PROTOCOL_VERSION: u32 = 1;

/// Dedupe key prefix for action audit events.
pub fn action_dedupe_key(action_id: &str) -> String {
    format!("action:{action_id}")
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pure derivation of display facts from the canonical state row. No
//! storage access here; everything is a function of its inputs so the
//! fusion rules stay unit-testable.

use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::PaneState;

/// Whether an agent occupies the pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPresence {
    Managed,
    None,
    Unknown,
}

impl AgentPresence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Managed => "managed",
            Self::None => "none",
            Self::Unknown => "unknown",
        }
    }
}

/// Collapsed activity across the seven canonical states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    WaitingInput,
    WaitingApproval,
    Error,
    Running,
    Idle,
    Unknown,
}

impl ActivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitingInput => "waiting_input",
            Self::WaitingApproval => "waiting_approval",
            Self::Error => "error",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Unknown => "unknown",
        }
    }
}

/// Top-level display bucket with precedence
/// `attention < running < idle < unmanaged < unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayCategory {
    Attention,
    Running,
    Idle,
    Unmanaged,
    #[default]
    Unknown,
}

impl DisplayCategory {
    pub fn precedence(&self) -> u8 {
        match self {
            Self::Attention => 0,
            Self::Running => 1,
            Self::Idle => 2,
            Self::Unmanaged => 3,
            Self::Unknown => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attention => "attention",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Unmanaged => "unmanaged",
            Self::Unknown => "unknown",
        }
    }
}

/// What the pane is waiting on, when derivable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitingKind {
    Input,
    Approval,
}

/// Inputs to the derivation: the relevant slice of a state row.
#[derive(Debug, Clone)]
pub struct DeriveInput<'a> {
    pub agent_type: &'a str,
    pub state: PaneState,
    pub reason_code: &'a str,
    pub last_event_type: &'a str,
}

/// Derived display facts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derived {
    pub agent_presence: AgentPresence,
    pub activity_state: ActivityState,
    pub display_category: DisplayCategory,
    pub needs_user_action: bool,
    pub awaiting_kind: Option<AwaitingKind>,
}

fn admin_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^(wrapper-start|wrapper-exit|action\.(view-output|kill|attach))$").unwrap()
    })
}

/// Administrative events carry no user-visible activity: wrapper lifecycle
/// markers and action audit records.
pub fn is_administrative(event_type: &str) -> bool {
    admin_regex().is_match(event_type)
}

pub fn agent_presence(agent_type: &str) -> AgentPresence {
    match agent_type {
        "none" => AgentPresence::None,
        "" | "unknown" => AgentPresence::Unknown,
        _ => AgentPresence::Managed,
    }
}

pub fn activity_state(state: PaneState) -> ActivityState {
    match state {
        PaneState::WaitingInput => ActivityState::WaitingInput,
        PaneState::WaitingApproval => ActivityState::WaitingApproval,
        PaneState::Error => ActivityState::Error,
        PaneState::Running => ActivityState::Running,
        PaneState::Idle | PaneState::Completed => ActivityState::Idle,
        PaneState::Unknown => ActivityState::Unknown,
    }
}

pub fn display_category(presence: AgentPresence, activity: ActivityState) -> DisplayCategory {
    if presence == AgentPresence::None {
        return DisplayCategory::Unmanaged;
    }
    match activity {
        ActivityState::WaitingInput | ActivityState::WaitingApproval | ActivityState::Error => {
            DisplayCategory::Attention
        }
        ActivityState::Running => DisplayCategory::Running,
        ActivityState::Idle => DisplayCategory::Idle,
        ActivityState::Unknown => DisplayCategory::Unknown,
    }
}

/// Awaiting kind: the canonical state decides; otherwise inferred by
/// substring match on the normalized reason and event type.
pub fn awaiting_kind(state: PaneState, reason_code: &str, last_event_type: &str) -> Option<AwaitingKind> {
    match state {
        PaneState::WaitingInput => return Some(AwaitingKind::Input),
        PaneState::WaitingApproval => return Some(AwaitingKind::Approval),
        _ => {}
    }
    let haystack = format!("{} {}", reason_code.to_lowercase(), last_event_type.to_lowercase());
    if haystack.contains("approval") || haystack.contains("permission") {
        return Some(AwaitingKind::Approval);
    }
    if haystack.contains("input") || haystack.contains("question") {
        return Some(AwaitingKind::Input);
    }
    None
}

/// Full derivation over one state row.
pub fn derive(input: &DeriveInput<'_>) -> Derived {
    let presence = agent_presence(input.agent_type);
    let activity = activity_state(input.state);
    let category = display_category(presence, activity);
    let needs_user_action = matches!(
        activity,
        ActivityState::WaitingInput | ActivityState::WaitingApproval | ActivityState::Error
    );
    Derived {
        agent_presence: presence,
        activity_state: activity,
        display_category: category,
        needs_user_action,
        awaiting_kind: awaiting_kind(input.state, input.reason_code, input.last_event_type),
    }
}

/// Recency refinement: a managed pane reported idle, whose last signal was
/// a recent non-administrative event and whose reason is not an explicit
/// idle/completion marker, is promoted to running for display.
pub fn promote_idle_to_running(
    derived: &Derived,
    reason_code: &str,
    last_event_type: &str,
    last_event_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    recency_window: Duration,
) -> bool {
    if derived.agent_presence != AgentPresence::Managed {
        return false;
    }
    if derived.activity_state != ActivityState::Idle {
        return false;
    }
    if is_administrative(last_event_type) {
        return false;
    }
    let explicit_idle = matches!(reason_code, "turn_complete" | "agent_idle" | "session_ended");
    if explicit_idle {
        return false;
    }
    match last_event_at {
        Some(at) => now - at <= recency_window,
        None => false,
    }
}

#[cfg(test)]
#[path = "derive_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Presentation projection: pane/window/session items with labels,
//! interaction times, and category aggregation for the list and watch
//! endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::Serialize;

use crate::clock::Clock;
use crate::derive::{self, AwaitingKind, DisplayCategory};
use crate::enrich::ThreadEnricher;
use crate::model::{Confidence, EventEnvelope, PaneState, Runtime, StateRow, StateSource};
use crate::storage::Storage;

/// Max characters of an event preview used as a label.
const LABEL_PREVIEW_CAP: usize = 80;

/// One pane with everything the UI needs.
#[derive(Debug, Clone, Serialize)]
pub struct PaneItem {
    pub target_id: String,
    pub pane_id: String,
    pub session_name: String,
    pub window_id: String,
    pub window_name: String,
    pub current_cmd: String,
    pub state: PaneState,
    pub reason_code: String,
    pub confidence: Confidence,
    pub state_source: StateSource,
    pub state_version: u64,
    pub agent_type: String,
    pub agent_presence: &'static str,
    pub activity_state: &'static str,
    pub display_category: DisplayCategory,
    pub needs_user_action: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awaiting_kind: Option<AwaitingKind>,
    pub label: String,
    pub label_source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_interaction_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregated counts shared by window and session items.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Aggregate {
    pub total_panes: usize,
    pub running_count: usize,
    pub waiting_count: usize,
    pub by_category: BTreeMap<&'static str, usize>,
    pub top_state: PaneState,
    pub top_category: DisplayCategory,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowItem {
    pub target_id: String,
    pub session_name: String,
    pub window_id: String,
    pub window_name: String,
    #[serde(flatten)]
    pub aggregate: Aggregate,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionItem {
    pub target_id: String,
    pub session_name: String,
    pub total_windows: usize,
    #[serde(flatten)]
    pub aggregate: Aggregate,
}

pub struct Projector {
    storage: Arc<dyn Storage>,
    enricher: Arc<dyn ThreadEnricher>,
    clock: Arc<dyn Clock>,
    recency_window: Duration,
}

impl Projector {
    pub fn new(
        storage: Arc<dyn Storage>,
        enricher: Arc<dyn ThreadEnricher>,
        clock: Arc<dyn Clock>,
        recency_window: Duration,
    ) -> Self {
        Self { storage, enricher, clock, recency_window }
    }

    /// Build pane items, sorted by identity.
    pub fn pane_items(&self, target: Option<&str>) -> Vec<PaneItem> {
        let now = self.clock.now();
        let mut items: Vec<PaneItem> = self
            .storage
            .list_panes(target)
            .into_iter()
            .map(|pane| self.build_pane_item(pane, now))
            .collect();
        items.sort_by(|a, b| {
            (&a.target_id, &a.session_name, &a.window_id, &a.pane_id)
                .cmp(&(&b.target_id, &b.session_name, &b.window_id, &b.pane_id))
        });
        items
    }

    /// Group pane items by (target, session, window).
    pub fn window_items(&self, target: Option<&str>) -> Vec<WindowItem> {
        let mut grouped: BTreeMap<(String, String, String), (String, Vec<PaneItem>)> =
            BTreeMap::new();
        for item in self.pane_items(target) {
            let key =
                (item.target_id.clone(), item.session_name.clone(), item.window_id.clone());
            let entry = grouped.entry(key).or_insert_with(|| (item.window_name.clone(), vec![]));
            entry.1.push(item);
        }
        grouped
            .into_iter()
            .map(|((target_id, session_name, window_id), (window_name, panes))| WindowItem {
                target_id,
                session_name,
                window_id,
                window_name,
                aggregate: aggregate(&panes),
            })
            .collect()
    }

    /// Group pane items by (target, session).
    pub fn session_items(&self, target: Option<&str>) -> Vec<SessionItem> {
        let mut grouped: BTreeMap<(String, String), Vec<PaneItem>> = BTreeMap::new();
        for item in self.pane_items(target) {
            grouped
                .entry((item.target_id.clone(), item.session_name.clone()))
                .or_default()
                .push(item);
        }
        grouped
            .into_iter()
            .map(|((target_id, session_name), panes)| {
                let windows: std::collections::BTreeSet<&str> =
                    panes.iter().map(|p| p.window_id.as_str()).collect();
                SessionItem {
                    target_id,
                    session_name,
                    total_windows: windows.len(),
                    aggregate: aggregate(&panes),
                }
            })
            .collect()
    }

    fn build_pane_item(&self, pane: crate::model::Pane, now: DateTime<Utc>) -> PaneItem {
        let row = self
            .storage
            .get_state(&pane.target_id, &pane.pane_id)
            .unwrap_or_else(|| StateRow::unknown(&pane.target_id, &pane.pane_id, now));
        let runtime = if row.runtime_id.is_empty() {
            None
        } else {
            self.storage.get_runtime(&row.runtime_id)
        };
        let agent_type = runtime.as_ref().map(|r| r.agent_type.clone()).unwrap_or_default();

        let derived = derive::derive(&derive::DeriveInput {
            agent_type: &agent_type,
            state: row.state,
            reason_code: &row.reason_code,
            last_event_type: &row.last_event_type,
        });

        let promoted = derive::promote_idle_to_running(
            &derived,
            &row.reason_code,
            &row.last_event_type,
            row.last_event_at,
            now,
            self.recency_window,
        );
        let (state, activity, category) = if promoted {
            (PaneState::Running, derive::ActivityState::Running, DisplayCategory::Running)
        } else {
            (row.state, derived.activity_state, derived.display_category)
        };

        let runtime_events = runtime
            .as_ref()
            .map(|r| self.storage.events_for_runtime(&r.runtime_id))
            .unwrap_or_default();
        let pane_events = self.storage.events_for_pane(&pane.target_id, &pane.pane_id);
        let hint = self.enricher.pane_hint(&pane.target_id, &pane.pane_id);

        let (label, label_source) = pick_label(
            &pane,
            runtime.as_ref(),
            &runtime_events,
            &pane_events,
            hint.as_ref(),
            derived.agent_presence,
        );

        let last_interaction_at = last_interaction(
            &pane,
            runtime.as_ref(),
            &runtime_events,
            &pane_events,
            hint.as_ref(),
            derived.agent_presence,
        );

        PaneItem {
            target_id: pane.target_id,
            pane_id: pane.pane_id,
            session_name: pane.session_name,
            window_id: pane.window_id,
            window_name: pane.window_name,
            current_cmd: pane.current_cmd,
            state,
            reason_code: row.reason_code,
            confidence: row.confidence,
            state_source: row.state_source,
            state_version: row.state_version,
            agent_type,
            agent_presence: derived.agent_presence.as_str(),
            activity_state: activity.as_str(),
            display_category: category,
            needs_user_action: derived.needs_user_action,
            awaiting_kind: derived.awaiting_kind,
            label,
            label_source,
            last_interaction_at,
            last_event_at: row.last_event_at,
            updated_at: row.updated_at,
        }
    }
}

/// Aggregate counts over a group of pane items; top fields are the
/// minimum-precedence observed values.
fn aggregate(panes: &[PaneItem]) -> Aggregate {
    let mut agg = Aggregate {
        total_panes: panes.len(),
        top_state: PaneState::Unknown,
        top_category: DisplayCategory::Unknown,
        ..Default::default()
    };
    for pane in panes {
        match pane.display_category {
            DisplayCategory::Running => agg.running_count += 1,
            DisplayCategory::Attention if pane.state.is_waiting() => agg.waiting_count += 1,
            _ => {}
        }
        *agg.by_category.entry(pane.display_category.as_str()).or_default() += 1;
        if pane.state.precedence() < agg.top_state.precedence() {
            agg.top_state = pane.state;
        }
        if pane.display_category.precedence() < agg.top_category.precedence() {
            agg.top_category = pane.display_category;
        }
    }
    agg
}

/// True when the event is a user-input hint.
fn is_input_event(event: &EventEnvelope) -> bool {
    matches!(event.event_type.as_str(), "user-input" | "prompt-submit")
}

/// Extract a short preview string from an event payload.
fn event_preview(event: &EventEnvelope) -> Option<String> {
    let payload = event.raw_payload.as_object()?;
    for key in ["text", "preview", "message"] {
        if let Some(text) = payload.get(key).and_then(|v| v.as_str()) {
            let collapsed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if !collapsed.is_empty() {
                return Some(collapsed.chars().take(LABEL_PREVIEW_CAP).collect());
            }
        }
    }
    None
}

fn hostish_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^\S+@\S+$").unwrap()
    })
}

/// Normalize a pane title for use as a label. Rejects host/workspace-like
/// strings (`user@host`, absolute or home-relative paths).
fn normalized_title(title: &str) -> Option<String> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return None;
    }
    if hostish_regex().is_match(trimmed) {
        return None;
    }
    if trimmed.starts_with('/') || trimmed.starts_with('~') {
        return None;
    }
    Some(trimmed.to_owned())
}

/// The label priority chain of the presentation contract.
fn pick_label(
    pane: &crate::model::Pane,
    runtime: Option<&Runtime>,
    runtime_events: &[EventEnvelope],
    pane_events: &[EventEnvelope],
    hint: Option<&crate::enrich::ThreadHint>,
    presence: derive::AgentPresence,
) -> (String, &'static str) {
    if let Some(hint) = hint {
        if hint.single_pane && !hint.title.trim().is_empty() {
            return (hint.title.trim().to_owned(), "thread_hint");
        }
    }
    if runtime.is_some() {
        // First-observed input hint for the runtime.
        if let Some(label) =
            runtime_events.iter().filter(|e| is_input_event(e)).find_map(event_preview)
        {
            return (label, "runtime_input");
        }
        // Latest non-administrative event preview.
        if let Some(label) = runtime_events
            .iter()
            .rev()
            .filter(|e| !derive::is_administrative(&e.event_type))
            .find_map(event_preview)
        {
            return (label, "runtime_event");
        }
    }
    if let Some(label) = pane_events.iter().rev().filter(|e| is_input_event(e)).find_map(event_preview)
    {
        return (label, "pane_input");
    }
    if let Some(title) = normalized_title(&pane.pane_title) {
        return (title, "pane_title");
    }
    if presence == derive::AgentPresence::None && !pane.current_cmd.is_empty() {
        return (pane.current_cmd.clone(), "current_cmd");
    }
    if !pane.window_name.is_empty() && pane.window_name != "unknown-window" {
        return (pane.window_name.clone(), "window_name");
    }
    (pane.pane_id.clone(), "pane_id")
}

/// Last interaction time of the presentation contract.
fn last_interaction(
    pane: &crate::model::Pane,
    runtime: Option<&Runtime>,
    runtime_events: &[EventEnvelope],
    pane_events: &[EventEnvelope],
    hint: Option<&crate::enrich::ThreadHint>,
    presence: derive::AgentPresence,
) -> Option<DateTime<Utc>> {
    if presence == derive::AgentPresence::None {
        return pane.last_activity_at.or(Some(pane.updated_at));
    }
    if runtime.is_some() {
        if let Some(at) =
            runtime_events.iter().filter(|e| is_input_event(e)).map(|e| e.event_time).max()
        {
            return Some(at);
        }
        if let Some(at) = runtime_events
            .iter()
            .filter(|e| !derive::is_administrative(&e.event_type))
            .map(|e| e.event_time)
            .max()
        {
            return Some(at);
        }
    }
    if let Some(hint) = hint {
        return Some(hint.at);
    }
    pane_events.iter().filter(|e| is_input_event(e)).map(|e| e.event_time).max()
}

#[cfg(test)]
#[path = "present_tests.rs"]
mod tests;

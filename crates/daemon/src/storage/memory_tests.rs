// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::model::{Confidence, PaneState, ResultCode, StateSource, TargetHealth, TargetKind};
use chrono::Utc;

fn target(id: &str, is_default: bool) -> Target {
    Target {
        target_id: id.to_owned(),
        target_name: id.to_owned(),
        kind: TargetKind::Local,
        connection_ref: String::new(),
        is_default,
        health: TargetHealth::Ok,
        last_seen_at: None,
        updated_at: Utc::now(),
    }
}

fn runtime(id: &str, pane: &str) -> Runtime {
    Runtime {
        runtime_id: id.to_owned(),
        target_id: "t1".to_owned(),
        pane_id: pane.to_owned(),
        tmux_server_boot_id: "boot-1".to_owned(),
        pane_epoch: 1,
        agent_type: "codex".to_owned(),
        pid: Some(101),
        started_at: Utc::now(),
        ended_at: None,
        last_source_seq: None,
    }
}

fn event(dedupe: &str, pane: Option<&str>) -> EventEnvelope {
    EventEnvelope {
        event_id: format!("ev-{dedupe}"),
        event_type: "agent-turn-complete".to_owned(),
        source: StateSource::Notify,
        dedupe_key: dedupe.to_owned(),
        source_event_id: None,
        source_seq: None,
        event_time: Utc::now(),
        ingested_at: Utc::now(),
        pid: None,
        start_hint: None,
        runtime_id: Some("r1".to_owned()),
        target_id: Some("t1".to_owned()),
        pane_id: pane.map(str::to_owned),
        agent_type: None,
        raw_payload: serde_json::Value::Null,
        action_id: None,
    }
}

fn action(id: &str, request_ref: &str) -> Action {
    Action {
        action_id: id.to_owned(),
        action_type: ActionType::Send,
        request_ref: request_ref.to_owned(),
        target_id: "t1".to_owned(),
        pane_id: "%1".to_owned(),
        runtime_id: None,
        requested_at: Utc::now(),
        completed_at: Some(Utc::now()),
        result_code: ResultCode::Completed,
        error_code: None,
        metadata_json: None,
    }
}

#[test]
fn single_default_target() {
    let store = MemoryStorage::new();
    store.upsert_target(target("a", true));
    store.upsert_target(target("b", true));

    let defaults: Vec<_> = store.list_targets().into_iter().filter(|t| t.is_default).collect();
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults[0].target_id, "b");
    assert_eq!(store.default_target().map(|t| t.target_id), Some("b".to_owned()));
}

#[test]
fn delete_target() {
    let store = MemoryStorage::new();
    store.upsert_target(target("a", false));
    assert!(store.delete_target("a"));
    assert!(!store.delete_target("a"));
    assert!(store.get_target("a").is_none());
}

#[test]
fn one_active_runtime_per_pane() {
    let store = MemoryStorage::new();
    assert_eq!(store.insert_runtime(runtime("r1", "%1")), Ok(()));
    assert_eq!(
        store.insert_runtime(runtime("r2", "%1")),
        Err(StorageError::Conflict("active runtime per pane"))
    );

    // Ending r1 releases the slot.
    assert_eq!(store.end_runtime("r1", Utc::now()), Ok(()));
    assert_eq!(store.insert_runtime(runtime("r2", "%1")), Ok(()));
    assert_eq!(store.active_runtimes_for_pane("t1", "%1").len(), 1);
}

#[test]
fn end_runtime_is_idempotent() {
    let store = MemoryStorage::new();
    assert_eq!(store.insert_runtime(runtime("r1", "%1")), Ok(()));
    let first = Utc::now();
    assert_eq!(store.end_runtime("r1", first), Ok(()));
    assert_eq!(store.end_runtime("r1", first + chrono::Duration::seconds(10)), Ok(()));
    assert_eq!(store.get_runtime("r1").and_then(|r| r.ended_at), Some(first));
}

#[test]
fn end_missing_runtime_errors() {
    let store = MemoryStorage::new();
    assert_eq!(store.end_runtime("nope", Utc::now()), Err(StorageError::NotFound("runtime")));
}

#[test]
fn runtime_source_seq_updates() {
    let store = MemoryStorage::new();
    assert_eq!(store.insert_runtime(runtime("r1", "%1")), Ok(()));
    assert_eq!(store.set_runtime_source_seq("r1", 7), Ok(()));
    assert_eq!(store.get_runtime("r1").and_then(|r| r.last_source_seq), Some(7));
}

#[test]
fn duplicate_event_key_is_noop() {
    let store = MemoryStorage::new();
    assert_eq!(store.insert_event(event("k1", Some("%1"))), EventInsert::Inserted);
    assert_eq!(store.insert_event(event("k1", Some("%1"))), EventInsert::Duplicate);
    assert_eq!(store.events_for_pane("t1", "%1").len(), 1);
}

#[test]
fn same_dedupe_key_different_source_inserts() {
    let store = MemoryStorage::new();
    let mut other = event("k1", Some("%1"));
    other.source = StateSource::Hook;
    other.event_id = "ev-other".to_owned();
    assert_eq!(store.insert_event(event("k1", Some("%1"))), EventInsert::Inserted);
    assert_eq!(store.insert_event(other), EventInsert::Inserted);
}

#[test]
fn per_pane_event_cap_prunes_oldest() {
    let store = MemoryStorage::new();
    for i in 0..(EVENTS_PER_PANE_CAP + 5) {
        let outcome = store.insert_event(event(&format!("k{i}"), Some("%1")));
        assert_eq!(outcome, EventInsert::Inserted);
    }
    let events = store.events_for_pane("t1", "%1");
    assert_eq!(events.len(), EVENTS_PER_PANE_CAP);
    // Oldest keys pruned; the pruned dedupe key may be reused.
    assert_eq!(events[0].dedupe_key, "k5");
    assert_eq!(store.insert_event(event("k0", Some("%1"))), EventInsert::Inserted);
}

#[test]
fn action_ref_uniqueness() {
    let store = MemoryStorage::new();
    assert_eq!(store.insert_action(action("a1", "r1")), Ok(()));
    assert_eq!(
        store.insert_action(action("a2", "r1")),
        Err(StorageError::Conflict("request_ref"))
    );
    assert_eq!(
        store.get_action_by_ref(ActionType::Send, "r1").map(|a| a.action_id),
        Some("a1".to_owned())
    );
    // Same ref under a different action type is a distinct key.
    let mut kill = action("a3", "r1");
    kill.action_type = ActionType::Kill;
    assert_eq!(store.insert_action(kill), Ok(()));
}

#[test]
fn snapshot_written_at_most_once() {
    let store = MemoryStorage::new();
    let snap = ActionSnapshot {
        snapshot_id: "s1".to_owned(),
        action_id: "a1".to_owned(),
        target_id: "t1".to_owned(),
        pane_id: "%1".to_owned(),
        runtime_id: "r1".to_owned(),
        state_version: 3,
        observed_at: Utc::now(),
        expires_at: Utc::now(),
        nonce: "n1".to_owned(),
    };
    assert!(store.insert_snapshot_once(snap.clone()));
    assert!(!store.insert_snapshot_once(snap));
    assert_eq!(store.get_snapshot("a1").map(|s| s.state_version), Some(3));
}

#[test]
fn state_rows_round_trip() {
    let store = MemoryStorage::new();
    let row = StateRow {
        target_id: "t1".to_owned(),
        pane_id: "%1".to_owned(),
        runtime_id: "r1".to_owned(),
        state: PaneState::Running,
        reason_code: "turn_started".to_owned(),
        confidence: Confidence::High,
        state_source: StateSource::Hook,
        last_event_type: "turn-started".to_owned(),
        last_event_at: None,
        last_seen_at: Utc::now(),
        state_version: 1,
        updated_at: Utc::now(),
    };
    store.upsert_state(row.clone());
    assert_eq!(store.get_state("t1", "%1").map(|r| r.state), Some(PaneState::Running));
    assert_eq!(store.list_states(Some("t1")).len(), 1);
    assert!(store.list_states(Some("t2")).is_empty());
}

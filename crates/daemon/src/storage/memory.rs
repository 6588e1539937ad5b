// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process row store. One lock around all tables keeps multi-row
//! mutators (end-then-insert runtime, action-then-snapshot) atomic with
//! respect to readers.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;

use super::{EventInsert, Storage, StorageError};
use crate::model::{
    Action, ActionSnapshot, ActionType, Adapter, EventEnvelope, Pane, Runtime, StateRow, Target,
};

/// Events retained per pane before the oldest are pruned. The daemon only
/// needs a bounded window for presentation previews and action audit.
const EVENTS_PER_PANE_CAP: usize = 256;

#[derive(Default)]
struct Tables {
    targets: IndexMap<String, Target>,
    panes: IndexMap<(String, String), Pane>,
    runtimes: IndexMap<String, Runtime>,
    states: IndexMap<(String, String), StateRow>,
    /// Insertion-ordered event log, bounded per pane.
    events: Vec<EventEnvelope>,
    /// Uniqueness index for (source, dedupe_key).
    event_keys: HashSet<(String, String)>,
    actions: IndexMap<String, Action>,
    /// Uniqueness index for (action_type, request_ref) → action_id.
    action_refs: HashMap<(ActionType, String), String>,
    snapshots: HashMap<String, ActionSnapshot>,
    adapters: IndexMap<String, Adapter>,
}

/// Thread-safe in-memory implementation of [`Storage`].
#[derive(Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn upsert_target(&self, target: Target) {
        let mut t = self.tables.write();
        // Exactly zero or one default: a new default demotes the old one.
        if target.is_default {
            for existing in t.targets.values_mut() {
                existing.is_default = false;
            }
        }
        t.targets.insert(target.target_id.clone(), target);
    }

    fn get_target(&self, target_id: &str) -> Option<Target> {
        self.tables.read().targets.get(target_id).cloned()
    }

    fn list_targets(&self) -> Vec<Target> {
        self.tables.read().targets.values().cloned().collect()
    }

    fn delete_target(&self, target_id: &str) -> bool {
        self.tables.write().targets.shift_remove(target_id).is_some()
    }

    fn default_target(&self) -> Option<Target> {
        self.tables.read().targets.values().find(|t| t.is_default).cloned()
    }

    fn upsert_pane(&self, pane: Pane) {
        let key = (pane.target_id.clone(), pane.pane_id.clone());
        self.tables.write().panes.insert(key, pane);
    }

    fn get_pane(&self, target_id: &str, pane_id: &str) -> Option<Pane> {
        self.tables.read().panes.get(&(target_id.to_owned(), pane_id.to_owned())).cloned()
    }

    fn list_panes(&self, target_id: Option<&str>) -> Vec<Pane> {
        self.tables
            .read()
            .panes
            .values()
            .filter(|p| target_id.is_none_or(|t| p.target_id == t))
            .cloned()
            .collect()
    }

    fn insert_runtime(&self, runtime: Runtime) -> Result<(), StorageError> {
        let mut t = self.tables.write();
        if t.runtimes.contains_key(&runtime.runtime_id) {
            return Err(StorageError::Conflict("runtime_id"));
        }
        if runtime.is_active() {
            let duplicate_active = t.runtimes.values().any(|r| {
                r.is_active()
                    && r.target_id == runtime.target_id
                    && r.pane_id == runtime.pane_id
            });
            if duplicate_active {
                return Err(StorageError::Conflict("active runtime per pane"));
            }
        }
        t.runtimes.insert(runtime.runtime_id.clone(), runtime);
        Ok(())
    }

    fn get_runtime(&self, runtime_id: &str) -> Option<Runtime> {
        self.tables.read().runtimes.get(runtime_id).cloned()
    }

    fn end_runtime(&self, runtime_id: &str, at: DateTime<Utc>) -> Result<(), StorageError> {
        let mut t = self.tables.write();
        let runtime =
            t.runtimes.get_mut(runtime_id).ok_or(StorageError::NotFound("runtime"))?;
        if runtime.ended_at.is_none() {
            runtime.ended_at = Some(at);
        }
        Ok(())
    }

    fn active_runtimes_for_pane(&self, target_id: &str, pane_id: &str) -> Vec<Runtime> {
        self.tables
            .read()
            .runtimes
            .values()
            .filter(|r| r.is_active() && r.target_id == target_id && r.pane_id == pane_id)
            .cloned()
            .collect()
    }

    fn set_runtime_source_seq(&self, runtime_id: &str, seq: u64) -> Result<(), StorageError> {
        let mut t = self.tables.write();
        let runtime =
            t.runtimes.get_mut(runtime_id).ok_or(StorageError::NotFound("runtime"))?;
        runtime.last_source_seq = Some(seq);
        Ok(())
    }

    fn get_state(&self, target_id: &str, pane_id: &str) -> Option<StateRow> {
        self.tables.read().states.get(&(target_id.to_owned(), pane_id.to_owned())).cloned()
    }

    fn upsert_state(&self, row: StateRow) {
        let key = (row.target_id.clone(), row.pane_id.clone());
        self.tables.write().states.insert(key, row);
    }

    fn list_states(&self, target_id: Option<&str>) -> Vec<StateRow> {
        self.tables
            .read()
            .states
            .values()
            .filter(|s| target_id.is_none_or(|t| s.target_id == t))
            .cloned()
            .collect()
    }

    fn insert_event(&self, event: EventEnvelope) -> EventInsert {
        let mut t = self.tables.write();
        let key = (event.source.as_str().to_owned(), event.dedupe_key.clone());
        if !t.event_keys.insert(key) {
            return EventInsert::Duplicate;
        }

        if let (Some(target_id), Some(pane_id)) = (&event.target_id, &event.pane_id) {
            let per_pane = t
                .events
                .iter()
                .filter(|e| {
                    e.target_id.as_deref() == Some(target_id)
                        && e.pane_id.as_deref() == Some(pane_id)
                })
                .count();
            if per_pane >= EVENTS_PER_PANE_CAP {
                let target_id = target_id.clone();
                let pane_id = pane_id.clone();
                if let Some(idx) = t.events.iter().position(|e| {
                    e.target_id.as_deref() == Some(target_id.as_str())
                        && e.pane_id.as_deref() == Some(pane_id.as_str())
                }) {
                    let removed = t.events.remove(idx);
                    t.event_keys
                        .remove(&(removed.source.as_str().to_owned(), removed.dedupe_key));
                }
            }
        }

        t.events.push(event);
        EventInsert::Inserted
    }

    fn events_for_action(&self, action_id: &str) -> Vec<EventEnvelope> {
        self.tables
            .read()
            .events
            .iter()
            .filter(|e| e.action_id.as_deref() == Some(action_id))
            .cloned()
            .collect()
    }

    fn events_for_runtime(&self, runtime_id: &str) -> Vec<EventEnvelope> {
        self.tables
            .read()
            .events
            .iter()
            .filter(|e| e.runtime_id.as_deref() == Some(runtime_id))
            .cloned()
            .collect()
    }

    fn events_for_pane(&self, target_id: &str, pane_id: &str) -> Vec<EventEnvelope> {
        self.tables
            .read()
            .events
            .iter()
            .filter(|e| {
                e.target_id.as_deref() == Some(target_id) && e.pane_id.as_deref() == Some(pane_id)
            })
            .cloned()
            .collect()
    }

    fn insert_action(&self, action: Action) -> Result<(), StorageError> {
        let mut t = self.tables.write();
        if t.actions.contains_key(&action.action_id) {
            return Err(StorageError::Conflict("action_id"));
        }
        let ref_key = (action.action_type, action.request_ref.clone());
        if t.action_refs.contains_key(&ref_key) {
            return Err(StorageError::Conflict("request_ref"));
        }
        t.action_refs.insert(ref_key, action.action_id.clone());
        t.actions.insert(action.action_id.clone(), action);
        Ok(())
    }

    fn get_action(&self, action_id: &str) -> Option<Action> {
        self.tables.read().actions.get(action_id).cloned()
    }

    fn get_action_by_ref(&self, action_type: ActionType, request_ref: &str) -> Option<Action> {
        let t = self.tables.read();
        let action_id = t.action_refs.get(&(action_type, request_ref.to_owned()))?;
        t.actions.get(action_id).cloned()
    }

    fn insert_snapshot_once(&self, snapshot: ActionSnapshot) -> bool {
        let mut t = self.tables.write();
        if t.snapshots.contains_key(&snapshot.action_id) {
            return false;
        }
        t.snapshots.insert(snapshot.action_id.clone(), snapshot);
        true
    }

    fn get_snapshot(&self, action_id: &str) -> Option<ActionSnapshot> {
        self.tables.read().snapshots.get(action_id).cloned()
    }

    fn upsert_adapter(&self, adapter: Adapter) {
        self.tables.write().adapters.insert(adapter.name.clone(), adapter);
    }

    fn get_adapter(&self, name: &str) -> Option<Adapter> {
        self.tables.read().adapters.get(name).cloned()
    }

    fn list_adapters(&self) -> Vec<Adapter> {
        self.tables.read().adapters.values().cloned().collect()
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

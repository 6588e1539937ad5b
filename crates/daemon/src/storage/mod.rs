// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Storage boundary: an opaque transactional key/row store with a fixed
//! operation set. Every mutator is transactional at the row level; the
//! in-process engine is [`MemoryStorage`].

mod memory;

pub use memory::MemoryStorage;

use std::fmt;

use chrono::{DateTime, Utc};

use crate::model::{
    Action, ActionSnapshot, ActionType, Adapter, EventEnvelope, Pane, Runtime, StateRow, Target,
};

/// Row-level storage failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A uniqueness constraint was violated (duplicate key).
    Conflict(&'static str),
    /// The referenced row does not exist.
    NotFound(&'static str),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict(what) => write!(f, "conflict: {what}"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Outcome of an event insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventInsert {
    Inserted,
    /// The (source, dedupe_key) pair already exists; insert was a no-op.
    Duplicate,
}

/// The fixed operation set the daemon requires from its store.
pub trait Storage: Send + Sync {
    // Targets
    fn upsert_target(&self, target: Target);
    fn get_target(&self, target_id: &str) -> Option<Target>;
    fn list_targets(&self) -> Vec<Target>;
    fn delete_target(&self, target_id: &str) -> bool;
    fn default_target(&self) -> Option<Target>;

    // Panes
    fn upsert_pane(&self, pane: Pane);
    fn get_pane(&self, target_id: &str, pane_id: &str) -> Option<Pane>;
    fn list_panes(&self, target_id: Option<&str>) -> Vec<Pane>;

    // Runtimes
    fn insert_runtime(&self, runtime: Runtime) -> Result<(), StorageError>;
    fn get_runtime(&self, runtime_id: &str) -> Option<Runtime>;
    fn end_runtime(&self, runtime_id: &str, at: DateTime<Utc>) -> Result<(), StorageError>;
    fn active_runtimes_for_pane(&self, target_id: &str, pane_id: &str) -> Vec<Runtime>;
    fn set_runtime_source_seq(&self, runtime_id: &str, seq: u64) -> Result<(), StorageError>;

    // State rows
    fn get_state(&self, target_id: &str, pane_id: &str) -> Option<StateRow>;
    fn upsert_state(&self, row: StateRow);
    fn list_states(&self, target_id: Option<&str>) -> Vec<StateRow>;

    // Events
    fn insert_event(&self, event: EventEnvelope) -> EventInsert;
    fn events_for_action(&self, action_id: &str) -> Vec<EventEnvelope>;
    fn events_for_runtime(&self, runtime_id: &str) -> Vec<EventEnvelope>;
    fn events_for_pane(&self, target_id: &str, pane_id: &str) -> Vec<EventEnvelope>;

    // Actions
    fn insert_action(&self, action: Action) -> Result<(), StorageError>;
    fn get_action(&self, action_id: &str) -> Option<Action>;
    fn get_action_by_ref(&self, action_type: ActionType, request_ref: &str) -> Option<Action>;

    // Action snapshots
    /// Persist the admission snapshot unless one already exists for the
    /// action. Returns `false` when a snapshot was already present.
    fn insert_snapshot_once(&self, snapshot: ActionSnapshot) -> bool;
    fn get_snapshot(&self, action_id: &str) -> Option<ActionSnapshot>;

    // Adapters
    fn upsert_adapter(&self, adapter: Adapter);
    fn get_adapter(&self, name: &str) -> Option<Adapter>;
    fn list_adapters(&self) -> Vec<Adapter>;
}

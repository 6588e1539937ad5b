// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runtime registry: opens and closes per-pane agent runtimes and resolves
//! the runtime an unbound event belongs to.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::clock::Clock;
use crate::model::Runtime;
use crate::storage::{Storage, StorageError};

/// Inputs to candidate resolution for an event without a `runtime_id`.
#[derive(Debug, Clone, Default)]
pub struct CandidateQuery {
    pub pid: Option<u32>,
    pub start_hint: Option<DateTime<Utc>>,
    pub agent_type: Option<String>,
}

/// Result of candidate resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Exactly one active runtime survived the filters.
    Bound(String),
    /// Zero or multiple candidates; the event stays pending.
    Ambiguous,
}

pub struct RuntimeRegistry {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    bind_window: Duration,
}

impl RuntimeRegistry {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>, bind_window: Duration) -> Self {
        Self { storage, clock, bind_window }
    }

    /// Resolve the runtime for an unbound event. Binding succeeds only when
    /// exactly one active runtime for the pane survives every provided
    /// filter; ambiguity never guesses.
    pub fn resolve(&self, target_id: &str, pane_id: &str, query: &CandidateQuery) -> Resolution {
        let candidates: Vec<Runtime> = self
            .storage
            .active_runtimes_for_pane(target_id, pane_id)
            .into_iter()
            .filter(|r| match query.agent_type.as_deref() {
                Some(agent_type) => r.agent_type == agent_type,
                None => true,
            })
            .filter(|r| match query.pid {
                Some(pid) => r.pid == Some(pid),
                None => true,
            })
            .filter(|r| match query.start_hint {
                Some(hint) => {
                    let delta = (r.started_at - hint).abs();
                    delta <= self.bind_window
                }
                None => true,
            })
            .collect();

        match candidates.as_slice() {
            [only] => Resolution::Bound(only.runtime_id.clone()),
            _ => Resolution::Ambiguous,
        }
    }

    /// Open a new runtime for a pane, ending any previously active one
    /// first (the single-active invariant is a storage precondition).
    pub fn open(
        &self,
        target_id: &str,
        pane_id: &str,
        agent_type: &str,
        pid: Option<u32>,
        tmux_server_boot_id: &str,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<Runtime, StorageError> {
        let now = self.clock.now();
        let previous = self.storage.active_runtimes_for_pane(target_id, pane_id);
        let pane_epoch = previous.iter().map(|r| r.pane_epoch).max().unwrap_or(0) + 1;
        for runtime in &previous {
            self.storage.end_runtime(&runtime.runtime_id, now)?;
        }

        let runtime = Runtime {
            runtime_id: Uuid::new_v4().to_string(),
            target_id: target_id.to_owned(),
            pane_id: pane_id.to_owned(),
            tmux_server_boot_id: tmux_server_boot_id.to_owned(),
            pane_epoch,
            agent_type: agent_type.to_owned(),
            pid,
            started_at: started_at.unwrap_or(now),
            ended_at: None,
            last_source_seq: None,
        };
        self.storage.insert_runtime(runtime.clone())?;
        Ok(runtime)
    }

    /// Explicitly close a runtime.
    pub fn close(&self, runtime_id: &str) -> Result<(), StorageError> {
        self.storage.end_runtime(runtime_id, self.clock.now())
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;

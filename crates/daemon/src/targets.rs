// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Target registry: register multiplexer hosts and probe their liveness.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::clock::Clock;
use crate::error::ErrorCode;
use crate::exec::Executor;
use crate::model::{Target, TargetHealth, TargetKind};
use crate::storage::Storage;
use crate::tmux;

/// Wire shape of `POST /v1/targets`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetSpec {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub connection_ref: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

pub struct TargetRegistry {
    storage: Arc<dyn Storage>,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
}

impl TargetRegistry {
    pub fn new(storage: Arc<dyn Storage>, executor: Arc<dyn Executor>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, executor, clock }
    }

    /// Register or update a target. The target id is its name.
    pub fn upsert(&self, spec: TargetSpec) -> Result<Target, (ErrorCode, String)> {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err((ErrorCode::RefInvalid, "name is required".to_owned()));
        }
        let kind = TargetKind::parse(spec.kind.trim())
            .ok_or_else(|| (ErrorCode::RefInvalid, format!("unknown kind: {}", spec.kind)))?;
        let connection_ref = spec.connection_ref.unwrap_or_default().trim().to_owned();
        if kind == TargetKind::Ssh && connection_ref.is_empty() {
            return Err((ErrorCode::RefInvalid, "ssh targets need a connection_ref".to_owned()));
        }

        let existing = self.storage.get_target(name);
        let target = Target {
            target_id: name.to_owned(),
            target_name: name.to_owned(),
            kind,
            connection_ref,
            is_default: spec.is_default,
            health: existing.as_ref().map(|t| t.health).unwrap_or(TargetHealth::Down),
            last_seen_at: existing.as_ref().and_then(|t| t.last_seen_at),
            updated_at: self.clock.now(),
        };
        self.storage.upsert_target(target.clone());
        Ok(target)
    }

    pub fn list(&self) -> Vec<Target> {
        self.storage.list_targets()
    }

    pub fn delete(&self, name: &str) -> bool {
        self.storage.delete_target(name)
    }

    /// Probe liveness by listing sessions on the target. Success marks the
    /// target ok and stamps `last_seen_at`; failure marks it down.
    pub async fn connect(&self, name: &str) -> Result<Target, (ErrorCode, String)> {
        let Some(mut target) = self.storage.get_target(name) else {
            return Err((ErrorCode::RefNotFound, format!("unknown target: {name}")));
        };
        let now = self.clock.now();
        match self.executor.run(&target, &tmux::list_sessions_argv()).await {
            Ok(_) => {
                target.health = TargetHealth::Ok;
                target.last_seen_at = Some(now);
                target.updated_at = now;
                self.storage.upsert_target(target.clone());
                Ok(target)
            }
            Err(err) => {
                debug!(target = name, error = %err, "connect probe failed");
                target.health = TargetHealth::Down;
                target.updated_at = now;
                self.storage.upsert_target(target);
                Err((ErrorCode::TargetUnreachable, err.to_string()))
            }
        }
    }
}

#[cfg(test)]
#[path = "targets_tests.rs"]
mod tests;

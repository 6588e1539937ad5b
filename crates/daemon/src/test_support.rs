// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for unit and integration tests.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use crate::exec::Executor;
use crate::model::{Target, TargetHealth, TargetKind};

/// Deterministic baseline instant used across fixtures.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap_or_default()
}

/// A local target row named `local`, marked default.
pub fn local_target() -> Target {
    Target {
        target_id: "local".to_owned(),
        target_name: "local".to_owned(),
        kind: TargetKind::Local,
        connection_ref: String::new(),
        is_default: true,
        health: TargetHealth::Ok,
        last_seen_at: None,
        updated_at: base_time(),
    }
}

/// One canned response for [`RecordingExecutor`].
pub enum CannedRun {
    Ok(Vec<u8>),
    Err(String),
}

/// Executor double: records every argv and replays canned responses.
///
/// With no canned responses queued, every run succeeds with empty output —
/// except `list-panes`, which replies with the configured pane listing so
/// action resolution finds panes.
pub struct RecordingExecutor {
    pub calls: Mutex<Vec<Vec<String>>>,
    canned: Mutex<VecDeque<CannedRun>>,
    pane_listing: Mutex<Vec<u8>>,
    fail_listing: Mutex<Option<String>>,
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            canned: Mutex::new(VecDeque::new()),
            pane_listing: Mutex::new(
                b"%1\tmain\t@1\tcode\tzsh\t/home/u\ttitle\n%2\tmain\t@1\tcode\tnvim\t/home/u\t\n"
                    .to_vec(),
            ),
            fail_listing: Mutex::new(None),
        }
    }
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pane_listing(&self, raw: &[u8]) {
        *self.pane_listing.lock() = raw.to_vec();
    }

    pub fn push_canned(&self, run: CannedRun) {
        self.canned.lock().push_back(run);
    }

    /// Make every subsequent `list-panes` resolution call fail.
    pub fn fail_listing(&self, message: &str) {
        *self.fail_listing.lock() = Some(message.to_owned());
    }

    /// Recorded argv vectors, excluding `list-panes` resolution calls.
    pub fn effect_calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .iter()
            .filter(|argv| argv.get(1).map(String::as_str) != Some("list-panes"))
            .cloned()
            .collect()
    }
}

impl Executor for RecordingExecutor {
    fn run<'a>(
        &'a self,
        _target: &'a Target,
        argv: &'a [String],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<u8>>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.lock().push(argv.to_vec());
            if argv.get(1).map(String::as_str) == Some("list-panes") {
                if let Some(message) = self.fail_listing.lock().clone() {
                    return Err(anyhow::anyhow!(message));
                }
                return Ok(self.pane_listing.lock().clone());
            }
            if let Some(canned) = self.canned.lock().pop_front() {
                return match canned {
                    CannedRun::Ok(bytes) => Ok(bytes),
                    CannedRun::Err(message) => Err(anyhow::anyhow!(message)),
                };
            }
            Ok(Vec::new())
        })
    }
}

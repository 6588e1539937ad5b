// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Watch stream: monotonic snapshot/reset NDJSON lines with a
//! `<stream_id>:<seq>` cursor for resume detection.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::present::Projector;

/// Scope of a watch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchScope {
    Panes,
    Windows,
    Sessions,
}

impl WatchScope {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "panes" => Some(Self::Panes),
            "windows" => Some(Self::Windows),
            "sessions" => Some(Self::Sessions),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Panes => "panes",
            Self::Windows => "windows",
            Self::Sessions => "sessions",
        }
    }
}

/// A parsed `<stream_id>:<seq>` cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub stream_id: String,
    pub seq: u64,
}

impl Cursor {
    /// Parse a cursor literal. Empty stream ids and non-numeric or negative
    /// sequences are invalid.
    pub fn parse(raw: &str) -> Result<Self, ErrorCode> {
        let (stream_id, seq) = raw.rsplit_once(':').ok_or(ErrorCode::CursorInvalid)?;
        if stream_id.is_empty() {
            return Err(ErrorCode::CursorInvalid);
        }
        if seq.starts_with('-') {
            return Err(ErrorCode::CursorInvalid);
        }
        let seq: u64 = seq.parse().map_err(|_| ErrorCode::CursorInvalid)?;
        Ok(Self { stream_id: stream_id.to_owned(), seq })
    }
}

/// Process-wide stream identity plus the monotonic sequence counter.
pub struct WatchState {
    stream_id: String,
    counter: AtomicU64,
}

impl Default for WatchState {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchState {
    pub fn new() -> Self {
        Self { stream_id: Uuid::new_v4().to_string(), counter: AtomicU64::new(0) }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    fn next_seq(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn cursor_for(&self, seq: u64) -> String {
        format!("{}:{seq}", self.stream_id)
    }

    /// Render the NDJSON body for one watch request: an optional `reset`
    /// line for stale or foreign cursors, then exactly one `snapshot`.
    pub fn render(
        &self,
        projector: &Projector,
        scope: WatchScope,
        cursor: Option<&str>,
        target: Option<&str>,
    ) -> Result<String, ErrorCode> {
        let cursor = match cursor {
            Some(raw) => Some(Cursor::parse(raw)?),
            None => None,
        };

        let items = match scope {
            WatchScope::Panes => serde_json::to_value(projector.pane_items(target)),
            WatchScope::Windows => serde_json::to_value(projector.window_items(target)),
            WatchScope::Sessions => serde_json::to_value(projector.session_items(target)),
        }
        .map_err(|_| ErrorCode::Internal)?;
        let item_count = items.as_array().map(Vec::len).unwrap_or(0);

        let mut body = String::new();
        if let Some(cursor) = cursor {
            let stale = cursor.stream_id != self.stream_id || cursor.seq < self.current();
            if stale {
                let seq = self.next_seq();
                let reset = json!({
                    "type": "reset",
                    "sequence": seq,
                    "scope": scope.as_str(),
                    "filters": { "target": target },
                    "summary": { "items": item_count },
                    "cursor": self.cursor_for(seq),
                });
                body.push_str(&reset.to_string());
                body.push('\n');
            }
        }

        let seq = self.next_seq();
        let snapshot = json!({
            "type": "snapshot",
            "sequence": seq,
            "scope": scope.as_str(),
            "items": items,
            "cursor": self.cursor_for(seq),
        });
        body.push_str(&snapshot.to_string());
        body.push('\n');
        Ok(body)
    }
}

#[cfg(test)]
#[path = "watch_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! tmux command construction and output parsing. All argv vectors are built
//! here so action/TTY code paths agree on flag spelling; execution goes
//! through [`crate::exec::Executor`].

use serde::{Deserialize, Serialize};

/// Tab-separated format used for the full pane listing.
const PANE_FORMAT: &str = "#{pane_id}\t#{session_name}\t#{window_id}\t#{window_name}\t#{pane_current_command}\t#{pane_current_path}\t#{pane_title}";

/// Format used for the per-pane cursor/size query.
const PANE_QUERY_FORMAT: &str = "#{cursor_y}\t#{cursor_x}\t#{pane_height}\t#{pane_width}";

/// One row of `list-panes -a` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneInfo {
    pub pane_id: String,
    pub session_name: String,
    pub window_id: String,
    pub window_name: String,
    pub current_cmd: String,
    pub current_path: String,
    pub pane_title: String,
}

/// Cursor position and pane geometry from a pane query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneGeometry {
    pub cursor_row: u16,
    pub cursor_col: u16,
    pub rows: u16,
    pub cols: u16,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_owned()).collect()
}

/// `tmux list-panes -a -F <fmt>` across every session on the target.
pub fn list_panes_argv() -> Vec<String> {
    argv(&["tmux", "list-panes", "-a", "-F", PANE_FORMAT])
}

/// `tmux list-sessions` used as the connect liveness probe.
pub fn list_sessions_argv() -> Vec<String> {
    argv(&["tmux", "list-sessions", "-F", "#{session_name}"])
}

/// `tmux display-message` pane query for cursor position and size.
pub fn pane_query_argv(pane_id: &str) -> Vec<String> {
    argv(&["tmux", "display-message", "-p", "-t", pane_id, "-F", PANE_QUERY_FORMAT])
}

/// `tmux capture-pane -t <pane> -p -e -S -<lines>`: last `lines` rows with
/// escape sequences preserved.
pub fn capture_pane_argv(pane_id: &str, lines: u32) -> Vec<String> {
    argv(&["tmux", "capture-pane", "-t", pane_id, "-p", "-e", "-S", &format!("-{lines}")])
}

/// Visible-screen capture (no scrollback), used for attach snapshots.
pub fn capture_visible_argv(pane_id: &str) -> Vec<String> {
    argv(&["tmux", "capture-pane", "-t", pane_id, "-p", "-e"])
}

/// Literal text entry; `enter` appends the Enter key press.
pub fn send_text_argv(pane_id: &str, text: &str, enter: bool) -> Vec<String> {
    let mut out = argv(&["tmux", "send-keys", "-t", pane_id, "-l", text]);
    if enter {
        out.push("Enter".to_owned());
    }
    out
}

/// Named-key entry (e.g. `Enter`, `C-c`, `Escape`).
pub fn send_key_argv(pane_id: &str, key: &str) -> Vec<String> {
    argv(&["tmux", "send-keys", "-t", pane_id, key])
}

/// Control-sequence-safe byte entry via `send-keys -H` hex bytes.
pub fn send_hex_argv(pane_id: &str, bytes: &[u8]) -> Vec<String> {
    let mut out = argv(&["tmux", "send-keys", "-t", pane_id, "-H"]);
    out.extend(bytes.iter().map(|b| format!("{b:02x}")));
    out
}

/// `tmux resize-pane -t <pane> -x <cols> -y <rows>`.
pub fn resize_pane_argv(pane_id: &str, cols: u16, rows: u16) -> Vec<String> {
    argv(&[
        "tmux",
        "resize-pane",
        "-t",
        pane_id,
        "-x",
        &cols.to_string(),
        "-y",
        &rows.to_string(),
    ])
}

/// Attach the pane's output pipe to a shell command (`pipe-pane -o`).
pub fn pipe_pane_attach_argv(pane_id: &str, shell_cmd: &str) -> Vec<String> {
    argv(&["tmux", "pipe-pane", "-t", pane_id, "-o", shell_cmd])
}

/// Detach any output pipe from the pane (`pipe-pane` with no command).
pub fn pipe_pane_detach_argv(pane_id: &str) -> Vec<String> {
    argv(&["tmux", "pipe-pane", "-t", pane_id])
}

/// Control-mode attach for the bridge subprocess.
pub fn control_mode_argv(session_name: &str) -> Vec<String> {
    argv(&["tmux", "-C", "attach-session", "-t", session_name])
}

/// POSIX `kill -SIG <pid>` on the target host (not a tmux command).
pub fn kill_argv(signal: &str, pid: u32) -> Vec<String> {
    argv(&["kill", &format!("-{signal}"), &pid.to_string()])
}

/// Parse `list-panes -a` output into rows; malformed lines are skipped.
pub fn parse_pane_list(raw: &[u8]) -> Vec<PaneInfo> {
    let text = String::from_utf8_lossy(raw);
    text.lines().filter_map(parse_pane_line).collect()
}

fn parse_pane_line(line: &str) -> Option<PaneInfo> {
    if line.is_empty() {
        return None;
    }
    // pane_title may itself contain tabs; the first six fields are tmux
    // identifiers that cannot, so split at most six times.
    let mut fields = line.splitn(7, '\t');
    let pane_id = fields.next()?;
    if !pane_id.starts_with('%') {
        return None;
    }
    Some(PaneInfo {
        pane_id: pane_id.to_owned(),
        session_name: fields.next()?.to_owned(),
        window_id: fields.next()?.to_owned(),
        window_name: fields.next()?.to_owned(),
        current_cmd: fields.next()?.to_owned(),
        current_path: fields.next()?.to_owned(),
        pane_title: fields.next().unwrap_or("").to_owned(),
    })
}

/// Parse the pane query (cursor row/col, pane rows/cols).
pub fn parse_pane_query(raw: &[u8]) -> Option<PaneGeometry> {
    let text = String::from_utf8_lossy(raw);
    let line = text.lines().next()?;
    let mut fields = line.split('\t');
    let cursor_row = fields.next()?.trim().parse().ok()?;
    let cursor_col = fields.next()?.trim().parse().ok()?;
    let rows = fields.next()?.trim().parse().ok()?;
    let cols = fields.next()?.trim().parse().ok()?;
    Some(PaneGeometry { cursor_row, cursor_col, rows, cols })
}

/// True when every byte is printable ASCII (space..tilde), safe for
/// `send-keys -l`.
pub fn is_plain_text(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes.iter().all(|b| (0x20..=0x7e).contains(b))
}

#[cfg(test)]
#[path = "tmux_tests.rs"]
mod tests;

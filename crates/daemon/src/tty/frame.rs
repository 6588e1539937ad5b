// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TTY v2 wire protocol: length-prefixed JSON envelopes exchanged after the
//! `agtmux-tty-v2` connection upgrade.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::codec::LengthDelimitedCodec;

/// Protocol version this daemon speaks.
pub const PROTOCOL_VERSION: &str = "tty.v2.0";

/// Upgrade token expected on the HTTP request.
pub const UPGRADE_TOKEN: &str = "agtmux-tty-v2";

/// Hard cap on a single frame.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Features advertised in `hello_ack`.
pub const FEATURES: &[&str] = &[
    "raw_output",
    "resync",
    "peer_cred_auth",
    "resize_conflict_ack",
    "pane_alias",
    "coalescing_latest_wins",
];

// Frame-level error codes (lower-case, distinct from the HTTP wire codes).
pub const E_PROTOCOL_INVALID_FRAME: &str = "e_protocol_invalid_frame";
pub const E_PROTOCOL_UNSUPPORTED_VERSION: &str = "e_protocol_unsupported_version";
pub const E_REF_INVALID: &str = "e_ref_invalid";
pub const E_REF_INVALID_ENCODING: &str = "e_ref_invalid_encoding";
pub const E_REF_NOT_FOUND: &str = "e_ref_not_found";
pub const E_STALE_RUNTIME: &str = "e_stale_runtime";
pub const E_TARGET_UNREACHABLE: &str = "e_target_unreachable";
pub const E_TMUX_BRIDGE_DOWN: &str = "e_tmux_bridge_down";
pub const E_TMUX_PIPE_DOWN: &str = "e_tmux_pipe_down";

/// One frame on the wire, either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// Codec for the u32 big-endian length prefix.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_type::<u32>()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

/// Serialize an envelope to its JSON body (the codec adds the prefix).
pub fn encode_envelope(envelope: &Envelope) -> Result<Bytes, serde_json::Error> {
    Ok(Bytes::from(serde_json::to_vec(envelope)?))
}

/// Parse a received frame body.
pub fn decode_envelope(body: &[u8]) -> Result<Envelope, serde_json::Error> {
    serde_json::from_slice(body)
}

/// Typed client frames, decoded from an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Hello { versions: Vec<String> },
    Attach(AttachPayload),
    Write { pane: String, bytes_base64: String },
    Resize { pane: String, cols: u16, rows: u16 },
    Focus { pane: String },
    Detach { pane: String },
    Resync { pane: String, reason: String },
    Ping,
}

/// Attach payload: the pane reference plus the client's desired geometry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttachPayload {
    #[serde(default)]
    pub target: Option<String>,
    pub session_name: String,
    pub window_id: String,
    pub pane_id: String,
    #[serde(default)]
    pub want_initial_snapshot: bool,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct HelloPayload {
    #[serde(default)]
    versions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PanePayload {
    pane: String,
}

#[derive(Debug, Deserialize)]
struct WritePayload {
    pane: String,
    bytes_base64: String,
}

#[derive(Debug, Deserialize)]
struct ResizePayload {
    pane: String,
    cols: u16,
    rows: u16,
}

#[derive(Debug, Deserialize)]
struct ResyncPayload {
    pane: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Decode a client envelope into a typed frame. Returns the frame error
/// code on failure.
pub fn parse_client_frame(envelope: &Envelope) -> Result<ClientFrame, &'static str> {
    let payload = envelope.payload.clone();
    match envelope.frame_type.as_str() {
        "hello" => {
            let hello: HelloPayload =
                serde_json::from_value(payload).map_err(|_| E_PROTOCOL_INVALID_FRAME)?;
            Ok(ClientFrame::Hello { versions: hello.versions })
        }
        "attach" => {
            let attach: AttachPayload =
                serde_json::from_value(payload).map_err(|_| E_PROTOCOL_INVALID_FRAME)?;
            Ok(ClientFrame::Attach(attach))
        }
        "write" => {
            let write: WritePayload =
                serde_json::from_value(payload).map_err(|_| E_PROTOCOL_INVALID_FRAME)?;
            Ok(ClientFrame::Write { pane: write.pane, bytes_base64: write.bytes_base64 })
        }
        "resize" => {
            let resize: ResizePayload =
                serde_json::from_value(payload).map_err(|_| E_PROTOCOL_INVALID_FRAME)?;
            Ok(ClientFrame::Resize { pane: resize.pane, cols: resize.cols, rows: resize.rows })
        }
        "focus" => {
            let focus: PanePayload =
                serde_json::from_value(payload).map_err(|_| E_PROTOCOL_INVALID_FRAME)?;
            Ok(ClientFrame::Focus { pane: focus.pane })
        }
        "detach" => {
            let detach: PanePayload =
                serde_json::from_value(payload).map_err(|_| E_PROTOCOL_INVALID_FRAME)?;
            Ok(ClientFrame::Detach { pane: detach.pane })
        }
        "resync" => {
            let resync: ResyncPayload =
                serde_json::from_value(payload).map_err(|_| E_PROTOCOL_INVALID_FRAME)?;
            Ok(ClientFrame::Resync {
                pane: resync.pane,
                reason: resync.reason.unwrap_or_else(|| "unknown".to_owned()),
            })
        }
        "ping" => Ok(ClientFrame::Ping),
        _ => Err(E_PROTOCOL_INVALID_FRAME),
    }
}

/// An outgoing frame before the writer task stamps its sequence number.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub frame_type: &'static str,
    pub request_id: Option<String>,
    pub payload: Value,
}

impl Outgoing {
    pub fn new(frame_type: &'static str, payload: Value) -> Self {
        Self { frame_type, request_id: None, payload }
    }

    pub fn with_request(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}

pub fn hello_ack() -> Outgoing {
    Outgoing::new(
        "hello_ack",
        json!({ "version": PROTOCOL_VERSION, "features": FEATURES }),
    )
}

pub fn pong() -> Outgoing {
    Outgoing::new("pong", json!({}))
}

pub fn ack(op: &str, status: &str) -> Outgoing {
    Outgoing::new("ack", json!({ "op": op, "status": status }))
}

pub fn error(code: &str, message: &str) -> Outgoing {
    Outgoing::new("error", json!({ "code": code, "message": message }))
}

pub fn detached(pane_alias: &str) -> Outgoing {
    Outgoing::new("detached", json!({ "pane": pane_alias }))
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;

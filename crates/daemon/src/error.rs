// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error codes shared across the HTTP API and the TTY frame protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    RefInvalid,
    RefInvalidEncoding,
    RefNotFound,
    CursorInvalid,
    IdempotencyConflict,
    PreconditionFailed,
    RuntimeStale,
    SnapshotExpired,
    PidUnavailable,
    TargetUnreachable,
    ProtocolInvalidFrame,
    ProtocolUnsupportedVersion,
    TmuxBridgeDown,
    TmuxPipeDown,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::RefInvalid => 400,
            Self::RefInvalidEncoding => 400,
            Self::RefNotFound => 404,
            Self::CursorInvalid => 400,
            Self::IdempotencyConflict => 409,
            Self::PreconditionFailed => 409,
            Self::RuntimeStale => 409,
            Self::SnapshotExpired => 409,
            Self::PidUnavailable => 409,
            Self::TargetUnreachable => 502,
            Self::ProtocolInvalidFrame => 400,
            Self::ProtocolUnsupportedVersion => 400,
            Self::TmuxBridgeDown => 502,
            Self::TmuxPipeDown => 502,
            Self::Internal => 500,
        }
    }

    /// Wire form used in HTTP error envelopes and TTY error frames.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RefInvalid => "E_REF_INVALID",
            Self::RefInvalidEncoding => "E_REF_INVALID_ENCODING",
            Self::RefNotFound => "E_REF_NOT_FOUND",
            Self::CursorInvalid => "E_CURSOR_INVALID",
            Self::IdempotencyConflict => "E_IDEMPOTENCY_CONFLICT",
            Self::PreconditionFailed => "E_PRECONDITION_FAILED",
            Self::RuntimeStale => "E_RUNTIME_STALE",
            Self::SnapshotExpired => "E_SNAPSHOT_EXPIRED",
            Self::PidUnavailable => "E_PID_UNAVAILABLE",
            Self::TargetUnreachable => "E_TARGET_UNREACHABLE",
            Self::ProtocolInvalidFrame => "E_PROTOCOL_INVALID_FRAME",
            Self::ProtocolUnsupportedVersion => "E_PROTOCOL_UNSUPPORTED_VERSION",
            Self::TmuxBridgeDown => "E_TMUX_BRIDGE_DOWN",
            Self::TmuxPipeDown => "E_TMUX_PIPE_DOWN",
            Self::Internal => "E_INTERNAL",
        }
    }

    /// Row form stored in action `error_code` columns and event payloads.
    pub fn token(&self) -> &'static str {
        match self {
            Self::RefInvalid => "ref_invalid",
            Self::RefInvalidEncoding => "ref_invalid_encoding",
            Self::RefNotFound => "ref_not_found",
            Self::CursorInvalid => "cursor_invalid",
            Self::IdempotencyConflict => "idempotency_conflict",
            Self::PreconditionFailed => "precondition_failed",
            Self::RuntimeStale => "runtime_stale",
            Self::SnapshotExpired => "snapshot_expired",
            Self::PidUnavailable => "pid_unavailable",
            Self::TargetUnreachable => "target_unreachable",
            Self::ProtocolInvalidFrame => "protocol_invalid_frame",
            Self::ProtocolUnsupportedVersion => "protocol_unsupported_version",
            Self::TmuxBridgeDown => "tmux_bridge_down",
            Self::TmuxPipeDown => "tmux_pipe_down",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error response envelope for the HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body containing a machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorCode {
    /// Convert this error code into a transport [`ErrorBody`].
    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into() }
    }

    /// Convert this error code into an axum JSON error response.
    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, Json(body))
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

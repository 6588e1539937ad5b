// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

#[parameterized(
    ref_invalid = { ErrorCode::RefInvalid, 400, "E_REF_INVALID", "ref_invalid" },
    ref_not_found = { ErrorCode::RefNotFound, 404, "E_REF_NOT_FOUND", "ref_not_found" },
    cursor_invalid = { ErrorCode::CursorInvalid, 400, "E_CURSOR_INVALID", "cursor_invalid" },
    idempotency = { ErrorCode::IdempotencyConflict, 409, "E_IDEMPOTENCY_CONFLICT", "idempotency_conflict" },
    precondition = { ErrorCode::PreconditionFailed, 409, "E_PRECONDITION_FAILED", "precondition_failed" },
    runtime_stale = { ErrorCode::RuntimeStale, 409, "E_RUNTIME_STALE", "runtime_stale" },
    snapshot_expired = { ErrorCode::SnapshotExpired, 409, "E_SNAPSHOT_EXPIRED", "snapshot_expired" },
    pid_unavailable = { ErrorCode::PidUnavailable, 409, "E_PID_UNAVAILABLE", "pid_unavailable" },
    unreachable = { ErrorCode::TargetUnreachable, 502, "E_TARGET_UNREACHABLE", "target_unreachable" },
    bad_frame = { ErrorCode::ProtocolInvalidFrame, 400, "E_PROTOCOL_INVALID_FRAME", "protocol_invalid_frame" },
    bad_version = { ErrorCode::ProtocolUnsupportedVersion, 400, "E_PROTOCOL_UNSUPPORTED_VERSION", "protocol_unsupported_version" },
    internal = { ErrorCode::Internal, 500, "E_INTERNAL", "internal" },
)]
fn mappings(code: ErrorCode, status: u16, wire: &str, token: &str) {
    assert_eq!(code.http_status(), status);
    assert_eq!(code.as_str(), wire);
    assert_eq!(code.token(), token);
    assert_eq!(code.to_string(), wire);
}

#[test]
fn error_body_round_trip() {
    let body = ErrorCode::RuntimeStale.to_error_body("runtime moved");
    assert_eq!(body.code, "E_RUNTIME_STALE");
    assert_eq!(body.message, "runtime moved");

    let json = serde_json::to_string(&ErrorResponse { error: body });
    assert!(matches!(json, Ok(ref s) if s.contains("E_RUNTIME_STALE")));
}

#[test]
fn http_response_status() {
    let (status, _) = ErrorCode::TargetUnreachable.to_http_response("probe failed");
    assert_eq!(status.as_u16(), 502);
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TTY streaming: the hijacked framed protocol plus its subprocess
//! supervisors and output multiplexer.

pub mod bridge;
pub mod control;
pub mod frame;
pub mod session;
pub mod tap;

pub use session::{serve, TtyDeps, TtySession, TtyTuning};

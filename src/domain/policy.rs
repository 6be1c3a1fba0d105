// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Policy environment passed to authorization rules.
//!
//! A [`PolicyEnv`] is built per call by the authorization wrapper and is
//! immutable during evaluation. Rules see the operation constant, the
//! normalized path, the open flags and mode, and the caller identity
//! fields. The environment is an open mapping from the rule's point of
//! view: names it does not know evaluate as undefined, never as errors, so
//! older rules keep working when new fields are added.

/// Operation: `open_file`.
pub const OP_OPEN: i64 = 1;
/// Operation: `stat`.
pub const OP_STAT: i64 = 2;
/// Operation: `mkdir`.
pub const OP_MKDIR: i64 = 3;
/// Operation: `remove_all`.
pub const OP_REMOVE: i64 = 4;
/// Operation: `rename`.
pub const OP_RENAME: i64 = 5;
/// Operation: directory listing (exposed for transport-level checks).
pub const OP_READDIR: i64 = 6;

/// Per-call environment evaluated by authorization rules.
#[derive(Debug, Clone)]
pub struct PolicyEnv {
    /// One of the `OP_*` constants. Always present.
    pub operation: i64,
    /// Normalized absolute path the operation targets.
    pub path: String,
    /// Open flags for `OP_OPEN`, 0 otherwise.
    pub flag: i64,
    /// Permission bits for `OP_OPEN`/`OP_MKDIR`, 0 otherwise.
    pub mode: i64,
    /// Subject of the caller identity.
    pub subject: String,
    /// Identity provider that authenticated the caller.
    pub provider: String,
    /// Names of every group the caller belongs to.
    pub groups: Vec<String>,
}

impl PolicyEnv {
    /// Environment for an operation that carries no flags or mode.
    pub fn for_operation(operation: i64, path: impl Into<String>) -> Self {
        Self {
            operation,
            path: path.into(),
            flag: 0,
            mode: 0,
            subject: String::new(),
            provider: String::new(),
            groups: Vec::new(),
        }
    }
}

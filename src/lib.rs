// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Composable filesystem core for an authenticated WebDAV gateway.
//!
//! Projects heterogeneous backing stores (local directory, S3-compatible
//! object store, embedded SQLite blob store) behind one hierarchical
//! filesystem contract, with stackable decorators: a copy-on-read cache, a
//! size-capped LRU eviction layer, per-operation structured logging, and
//! an expression-rule authorization wrapper tied to the ambient caller
//! identity.
//!
//! Stacks are declared in configuration and built through the type
//! registry (see [`infrastructure::storage`]); the WebDAV transport
//! consumes the resulting [`domain::fs::FileSystem`].

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::*;

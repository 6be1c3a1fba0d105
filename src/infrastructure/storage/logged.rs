// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Logging decorator.
//!
//! Wraps any filesystem and emits a structured event per operation with
//! outcome and duration. Usually the outermost layer of a configured
//! stack.

use crate::domain::fs::{FileHandle, FileInfo, FileSystem, FsError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

pub struct LoggedFileSystem {
    inner: Arc<dyn FileSystem>,
}

impl LoggedFileSystem {
    pub fn new(inner: Arc<dyn FileSystem>) -> Self {
        Self { inner }
    }
}

fn record<T>(op: &'static str, fs_path: &str, start: Instant, result: &Result<T, FsError>) {
    let elapsed_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(_) => tracing::debug!(op, path = %fs_path, elapsed_ms, "filesystem operation"),
        Err(err) => {
            tracing::debug!(op, path = %fs_path, elapsed_ms, error = %err, "filesystem operation failed")
        }
    }
}

#[async_trait]
impl FileSystem for LoggedFileSystem {
    async fn mkdir(&self, fs_path: &str, mode: u32) -> Result<(), FsError> {
        let start = Instant::now();
        let result = self.inner.mkdir(fs_path, mode).await;
        record("mkdir", fs_path, start, &result);
        result
    }

    async fn open_file(
        &self,
        fs_path: &str,
        flag: i64,
        mode: u32,
    ) -> Result<Box<dyn FileHandle>, FsError> {
        let start = Instant::now();
        let result = self.inner.open_file(fs_path, flag, mode).await;
        record("open_file", fs_path, start, &result);
        result
    }

    async fn stat(&self, fs_path: &str) -> Result<FileInfo, FsError> {
        let start = Instant::now();
        let result = self.inner.stat(fs_path).await;
        record("stat", fs_path, start, &result);
        result
    }

    async fn remove_all(&self, fs_path: &str) -> Result<(), FsError> {
        let start = Instant::now();
        let result = self.inner.remove_all(fs_path).await;
        record("remove_all", fs_path, start, &result);
        result
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        let start = Instant::now();
        let result = self.inner.rename(old_path, new_path).await;
        record("rename", old_path, start, &result);
        result
    }
}

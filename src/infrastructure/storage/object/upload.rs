// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Streaming upload state machine.
//!
//! The native object-store write primitive is a one-shot put of the full
//! object. A write handle therefore buffers into fixed-size parts:
//!
//! 1. **OPEN** — writes fill an in-memory buffer of `buffer_size` bytes.
//! 2. **FLUSH_PART** — a full buffer is uploaded as an auxiliary part
//!    object under `.parts/<key>/<upload-id>/<n>`, bounded by
//!    [`MAX_PARTS`].
//! 3. On finish: zero parts publish an empty object; one part is
//!    server-side copied to the target; two or more parts are composed by
//!    copying part 0 and then repeatedly downloading target + next part,
//!    concatenating, and putting the result back.
//! 4. **ABORT** — any failure deletes the auxiliary parts best-effort and
//!    surfaces the original cause.
//!
//! A close either publishes a fully-formed object or leaves the target key
//! untouched. The per-handle upload id keeps concurrent uploads to the
//! same path from sharing part objects.

use crate::domain::fs::FsError;
use bytes::Bytes;
use object_store::path::Path as ObjPath;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;
use uuid::Uuid;

use super::{object_key, PART_PREFIX};

/// Maximum number of part objects per upload (S3 limit).
pub const MAX_PARTS: usize = 10_000;

pub(crate) struct StreamingUpload {
    store: Arc<dyn ObjectStore>,
    target: ObjPath,
    part_prefix: String,
    buffer: Vec<u8>,
    buffer_size: usize,
    part_keys: Vec<ObjPath>,
    total_size: u64,
    finished: bool,
    failed: Option<String>,
}

impl StreamingUpload {
    pub(crate) fn new(store: Arc<dyn ObjectStore>, fs_path: &str, buffer_size: usize) -> Self {
        let target = object_key(fs_path);
        let part_prefix = format!("{}/{}/{}", PART_PREFIX, target, Uuid::new_v4());

        Self {
            store,
            target,
            part_prefix,
            buffer: Vec::with_capacity(buffer_size),
            buffer_size,
            part_keys: Vec::new(),
            total_size: 0,
            finished: false,
            failed: None,
        }
    }

    pub(crate) async fn write(&mut self, data: &[u8]) -> Result<usize, FsError> {
        if self.finished {
            return Err(FsError::Closed);
        }
        if let Some(msg) = &self.failed {
            return Err(FsError::Io(msg.clone()));
        }

        let mut written = 0;
        while written < data.len() {
            let space = self.buffer_size - self.buffer.len();
            if space == 0 {
                self.flush_part().await?;
                continue;
            }

            let take = space.min(data.len() - written);
            self.buffer.extend_from_slice(&data[written..written + take]);
            written += take;
        }

        Ok(written)
    }

    async fn flush_part(&mut self) -> Result<(), FsError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        if self.part_keys.len() >= MAX_PARTS {
            let msg = format!(
                "upload for '{}' exceeded {} parts",
                self.target, MAX_PARTS
            );
            tracing::error!(target = %self.target, "{msg}");
            self.failed = Some(msg.clone());
            return Err(FsError::Io(msg));
        }

        let part_key = ObjPath::from(format!("{}/{}", self.part_prefix, self.part_keys.len()));
        let part = Bytes::from(std::mem::take(&mut self.buffer));
        let part_len = part.len() as u64;

        if let Err(err) = self.store.put(&part_key, PutPayload::from(part)).await {
            tracing::warn!(part = %part_key, error = %err, "part upload failed");
            self.failed = Some(err.to_string());
            return Err(err.into());
        }

        self.part_keys.push(part_key);
        self.total_size += part_len;
        self.buffer = Vec::with_capacity(self.buffer_size);

        Ok(())
    }

    /// Finalize the upload. Idempotent: a second call is a no-op, so a
    /// stat-triggered flush followed by close publishes exactly once.
    pub(crate) async fn finish(&mut self) -> Result<(), FsError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        if let Some(msg) = self.failed.clone() {
            self.abort().await;
            return Err(FsError::Io(msg));
        }

        if let Err(err) = self.flush_part().await {
            self.abort().await;
            return Err(err);
        }

        let publish = match self.part_keys.len() {
            0 => self
                .store
                .put(&self.target, PutPayload::default())
                .await
                .map(|_| ())
                .map_err(FsError::from),
            1 => self
                .store
                .copy(&self.part_keys[0], &self.target)
                .await
                .map_err(FsError::from),
            _ => self.compose().await,
        };

        match publish {
            Ok(()) => {
                tracing::debug!(target = %self.target, bytes = self.total_size, "object published");
                self.cleanup_parts().await
            }
            Err(err) => {
                self.abort().await;
                Err(err)
            }
        }
    }

    /// Materialize the target from two or more parts.
    async fn compose(&self) -> Result<(), FsError> {
        self.store.copy(&self.part_keys[0], &self.target).await?;

        for part_key in &self.part_keys[1..] {
            let current = self.store.get(&self.target).await?.bytes().await?;
            let part = self.store.get(part_key).await?.bytes().await?;

            let mut combined = Vec::with_capacity(current.len() + part.len());
            combined.extend_from_slice(&current);
            combined.extend_from_slice(&part);

            self.store
                .put(&self.target, PutPayload::from(Bytes::from(combined)))
                .await?;
        }

        Ok(())
    }

    /// Delete the auxiliary part objects after a successful publish. The
    /// first failure is surfaced so leaked parts are visible to operators.
    async fn cleanup_parts(&mut self) -> Result<(), FsError> {
        let mut first_err = None;

        for key in std::mem::take(&mut self.part_keys) {
            if let Err(err) = self.store.delete(&key).await {
                tracing::warn!(part = %key, error = %err, "failed to remove part object");
                first_err.get_or_insert(FsError::from(err));
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Best-effort cleanup on the failure path; the original cause is
    /// surfaced by the caller.
    async fn abort(&mut self) {
        for key in std::mem::take(&mut self.part_keys) {
            if let Err(err) = self.store.delete(&key).await {
                tracing::warn!(part = %key, error = %err, "failed to remove part object during abort");
            }
        }
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! File handles for the object-store adapter.

use crate::domain::fs::{FileHandle, FileInfo, FsError};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::stream::BoxStream;
use futures::StreamExt;
use object_store::{GetOptions, GetRange, ObjectStore};
use std::io::SeekFrom;
use std::sync::Arc;

use super::upload::StreamingUpload;
use super::{list_dir, stat_path};

/// Read handle: a lazy object stream re-opened with a range after a seek.
pub(crate) struct ObjectReadHandle {
    store: Arc<dyn ObjectStore>,
    fs_path: String,
    size: u64,
    pos: u64,
    stream: Option<BoxStream<'static, Result<Bytes, object_store::Error>>>,
    leftover: Bytes,
    closed: bool,
}

impl ObjectReadHandle {
    pub(crate) fn new(store: Arc<dyn ObjectStore>, fs_path: String, size: u64) -> Self {
        Self {
            store,
            fs_path,
            size,
            pos: 0,
            stream: None,
            leftover: Bytes::new(),
            closed: false,
        }
    }
}

#[async_trait]
impl FileHandle for ObjectReadHandle {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if !self.leftover.is_empty() {
                let n = self.leftover.len().min(buf.len());
                buf[..n].copy_from_slice(&self.leftover[..n]);
                self.leftover.advance(n);
                self.pos += n as u64;
                return Ok(n);
            }

            if self.pos >= self.size {
                return Ok(0);
            }

            if self.stream.is_none() {
                let options = GetOptions {
                    range: Some(GetRange::Offset(self.pos)),
                    ..Default::default()
                };
                let result = self
                    .store
                    .get_opts(&super::object_key(&self.fs_path), options)
                    .await?;
                self.stream = Some(result.into_stream());
            }

            let Some(stream) = self.stream.as_mut() else {
                return Err(FsError::Io("object stream unavailable".to_string()));
            };

            match stream.next().await {
                Some(Ok(chunk)) => self.leftover = chunk,
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(0),
            }
        }
    }

    async fn write(&mut self, _buf: &[u8]) -> Result<usize, FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }
        Err(FsError::NotSupported(
            "handle not opened for writing".to_string(),
        ))
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }

        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.size) + i128::from(delta),
        };

        if target < 0 {
            return Err(FsError::Io("seek before start of file".to_string()));
        }
        let target = target as u64;

        if target != self.pos {
            self.stream = None;
            self.leftover = Bytes::new();
            self.pos = target;
        }

        Ok(self.pos)
    }

    async fn readdir(&mut self, _count: i64) -> Result<Vec<FileInfo>, FsError> {
        Err(FsError::NotDirectory(self.fs_path.clone()))
    }

    async fn stat(&mut self) -> Result<FileInfo, FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }
        stat_path(&self.store, &self.fs_path).await
    }

    async fn close(&mut self) -> Result<(), FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }
        self.closed = true;
        self.stream = None;
        Ok(())
    }
}

/// Write handle over a streaming upload. Close publishes the object.
pub(crate) struct ObjectWriteHandle {
    store: Arc<dyn ObjectStore>,
    fs_path: String,
    upload: StreamingUpload,
    closed: bool,
}

impl ObjectWriteHandle {
    pub(crate) fn new(store: Arc<dyn ObjectStore>, fs_path: String, buffer_size: usize) -> Self {
        let upload = StreamingUpload::new(store.clone(), &fs_path, buffer_size);
        Self {
            store,
            fs_path,
            upload,
            closed: false,
        }
    }
}

#[async_trait]
impl FileHandle for ObjectWriteHandle {
    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }
        Err(FsError::NotSupported(
            "handle not opened for reading".to_string(),
        ))
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }
        self.upload.write(buf).await
    }

    async fn seek(&mut self, _pos: SeekFrom) -> Result<u64, FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }
        Err(FsError::NotSupported(
            "seek on a streaming upload".to_string(),
        ))
    }

    async fn readdir(&mut self, _count: i64) -> Result<Vec<FileInfo>, FsError> {
        Err(FsError::NotDirectory(self.fs_path.clone()))
    }

    async fn stat(&mut self) -> Result<FileInfo, FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }

        // Publishing is the only way to observe the object's metadata; the
        // finalizer is idempotent so a following close will not publish
        // twice.
        self.upload.finish().await?;
        stat_path(&self.store, &self.fs_path).await
    }

    async fn close(&mut self) -> Result<(), FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }
        self.closed = true;
        self.upload.finish().await
    }
}

/// Directory handle carrying a listing cursor.
pub(crate) struct ObjectDirHandle {
    store: Arc<dyn ObjectStore>,
    fs_path: String,
    entries: Option<Vec<FileInfo>>,
    cursor: usize,
    closed: bool,
}

impl ObjectDirHandle {
    pub(crate) fn new(store: Arc<dyn ObjectStore>, fs_path: String) -> Self {
        Self {
            store,
            fs_path,
            entries: None,
            cursor: 0,
            closed: false,
        }
    }
}

#[async_trait]
impl FileHandle for ObjectDirHandle {
    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, FsError> {
        Err(FsError::IsDirectory(self.fs_path.clone()))
    }

    async fn write(&mut self, _buf: &[u8]) -> Result<usize, FsError> {
        Err(FsError::IsDirectory(self.fs_path.clone()))
    }

    async fn seek(&mut self, _pos: SeekFrom) -> Result<u64, FsError> {
        Err(FsError::IsDirectory(self.fs_path.clone()))
    }

    async fn readdir(&mut self, count: i64) -> Result<Vec<FileInfo>, FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }

        if self.entries.is_none() {
            self.entries = Some(list_dir(&self.store, &self.fs_path).await?);
        }

        let Some(entries) = self.entries.as_ref() else {
            return Ok(Vec::new());
        };
        let remaining = &entries[self.cursor.min(entries.len())..];

        let take = if count < 0 {
            remaining.len()
        } else {
            remaining.len().min(count as usize)
        };

        let out = remaining[..take].to_vec();
        self.cursor += take;
        Ok(out)
    }

    async fn stat(&mut self) -> Result<FileInfo, FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }
        stat_path(&self.store, &self.fs_path).await
    }

    async fn close(&mut self) -> Result<(), FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }
        self.closed = true;
        Ok(())
    }
}

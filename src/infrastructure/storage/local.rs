// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Local filesystem adapter.
//!
//! Passthrough to a host directory. Suitable as a standalone backend, and
//! as the cache side of the copy-on-read compositor.

use crate::domain::fs::{
    FileHandle, FileInfo, FileSystem, FsError, O_APPEND, O_CREATE, O_EXCL, O_RDWR, O_TRUNC,
    O_WRONLY,
};
use crate::domain::path;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Options for the `local` filesystem type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalOptions {
    /// Host directory backing the namespace root.
    pub dir: PathBuf,
}

/// Host-directory filesystem.
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    /// Create the adapter, creating the backing directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, FsError> {
        let root = dir.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, fs_path: &str) -> PathBuf {
        self.root.join(fs_path.trim_start_matches('/'))
    }
}

fn mode_of(metadata: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        if metadata.is_dir() {
            crate::domain::fs::DEFAULT_DIR_MODE
        } else {
            crate::domain::fs::DEFAULT_FILE_MODE
        }
    }
}

fn info_from_metadata(name: &str, metadata: &std::fs::Metadata) -> FileInfo {
    let mtime = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    FileInfo {
        name: name.to_string(),
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        mode: mode_of(metadata),
        mtime,
        is_dir: metadata.is_dir(),
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn mkdir(&self, fs_path: &str, _mode: u32) -> Result<(), FsError> {
        let fs_path = path::normalize(fs_path)?;
        let full = self.resolve(&fs_path);

        // create_dir (not create_dir_all): missing parents surface NotFound
        // per the contract.
        tokio::fs::create_dir(&full)
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::AlreadyExists => FsError::AlreadyExists(fs_path.clone()),
                std::io::ErrorKind::NotFound => FsError::NotFound(fs_path.clone()),
                _ => err.into(),
            })
    }

    async fn open_file(
        &self,
        fs_path: &str,
        flag: i64,
        _mode: u32,
    ) -> Result<Box<dyn FileHandle>, FsError> {
        let fs_path = path::normalize(fs_path)?;
        let full = self.resolve(&fs_path);
        let writing = flag & (O_WRONLY | O_RDWR | O_CREATE | O_TRUNC | O_APPEND) != 0;

        if let Ok(metadata) = tokio::fs::metadata(&full).await {
            if metadata.is_dir() {
                if writing {
                    return Err(FsError::IsDirectory(fs_path));
                }
                return Ok(Box::new(LocalDirHandle {
                    full,
                    fs_path,
                    entries: None,
                    cursor: 0,
                    closed: false,
                }));
            }
        }

        let mut options = OpenOptions::new();
        match flag & (O_WRONLY | O_RDWR) {
            x if x == O_WRONLY => {
                options.write(true);
            }
            x if x == O_RDWR => {
                options.read(true).write(true);
            }
            _ => {
                options.read(true);
            }
        }
        if flag & O_CREATE != 0 {
            // Creation requires write access even when the caller asked for
            // O_RDONLY | O_CREATE.
            options.write(true);
            if flag & O_EXCL != 0 {
                options.create_new(true);
            } else {
                options.create(true);
            }
        }
        if flag & O_TRUNC != 0 {
            options.write(true).truncate(true);
        }
        if flag & O_APPEND != 0 {
            options.append(true);
        }

        let file = options.open(&full).await.map_err(|err| match err.kind() {
            std::io::ErrorKind::AlreadyExists => FsError::AlreadyExists(fs_path.clone()),
            std::io::ErrorKind::NotFound => FsError::NotFound(fs_path.clone()),
            _ => err.into(),
        })?;

        Ok(Box::new(LocalFileHandle {
            file: Some(file),
            fs_path,
            closed: false,
        }))
    }

    async fn stat(&self, fs_path: &str) -> Result<FileInfo, FsError> {
        let fs_path = path::normalize(fs_path)?;
        let full = self.resolve(&fs_path);

        let metadata = tokio::fs::metadata(&full)
            .await
            .map_err(|_| FsError::NotFound(fs_path.clone()))?;

        Ok(info_from_metadata(path::base(&fs_path), &metadata))
    }

    async fn remove_all(&self, fs_path: &str) -> Result<(), FsError> {
        let fs_path = path::normalize(fs_path)?;
        let full = self.resolve(&fs_path);

        let metadata = match tokio::fs::metadata(&full).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&full).await?;
        } else {
            tokio::fs::remove_file(&full).await?;
        }

        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        let old_path = path::normalize(old_path)?;
        let new_path = path::normalize(new_path)?;

        tokio::fs::rename(self.resolve(&old_path), self.resolve(&new_path))
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => FsError::NotFound(old_path.clone()),
                _ => err.into(),
            })
    }
}

/// Handle over a regular file.
struct LocalFileHandle {
    file: Option<File>,
    fs_path: String,
    closed: bool,
}

#[async_trait]
impl FileHandle for LocalFileHandle {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        let file = self.file.as_mut().ok_or(FsError::Closed)?;
        Ok(file.read(buf).await?)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
        let file = self.file.as_mut().ok_or(FsError::Closed)?;
        file.write_all(buf).await?;
        Ok(buf.len())
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, FsError> {
        let file = self.file.as_mut().ok_or(FsError::Closed)?;
        Ok(file.seek(pos).await?)
    }

    async fn readdir(&mut self, _count: i64) -> Result<Vec<FileInfo>, FsError> {
        Err(FsError::NotDirectory(self.fs_path.clone()))
    }

    async fn stat(&mut self) -> Result<FileInfo, FsError> {
        let file = self.file.as_mut().ok_or(FsError::Closed)?;
        let metadata = file.metadata().await?;
        Ok(info_from_metadata(path::base(&self.fs_path), &metadata))
    }

    async fn close(&mut self) -> Result<(), FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }
        self.closed = true;

        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }

        Ok(())
    }
}

/// Handle over a directory; carries the listing cursor for `readdir(n)`.
struct LocalDirHandle {
    full: PathBuf,
    fs_path: String,
    entries: Option<Vec<FileInfo>>,
    cursor: usize,
    closed: bool,
}

impl LocalDirHandle {
    async fn load_entries(full: &Path) -> Result<Vec<FileInfo>, FsError> {
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(full).await?;

        while let Some(entry) = reader.next_entry().await? {
            let metadata = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push(info_from_metadata(&name, &metadata));
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

#[async_trait]
impl FileHandle for LocalDirHandle {
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
            self.entries = Some(Self::load_entries(&self.full).await?);
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
        let metadata = tokio::fs::metadata(&self.full).await?;
        Ok(info_from_metadata(path::base(&self.fs_path), &metadata))
    }

    async fn close(&mut self) -> Result<(), FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }
        self.closed = true;
        Ok(())
    }
}

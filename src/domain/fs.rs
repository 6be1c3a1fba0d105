// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Filesystem contract shared by every adapter and decorator.
//!
//! [`FileSystem`] is a root of a hierarchical namespace; [`FileHandle`] is
//! the object returned by [`FileSystem::open_file`]. Adapters (local
//! directory, object store, blob database) and decorators (copy-on-read,
//! size cap, authorization, logging) all implement the same flat contract,
//! so composition is structural: a decorator holds an inner
//! `Arc<dyn FileSystem>`.
//!
//! All operations take normalized absolute paths (see
//! [`crate::domain::path`]); every implementation re-normalizes at its
//! entry points so the invariant holds regardless of stacking order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use thiserror::Error;

/// Open for reading only.
pub const O_RDONLY: i64 = 0o0;
/// Open for writing only.
pub const O_WRONLY: i64 = 0o1;
/// Open for reading and writing.
pub const O_RDWR: i64 = 0o2;
/// Create the file if it does not exist.
pub const O_CREATE: i64 = 0o100;
/// With `O_CREATE`, fail if the file already exists.
pub const O_EXCL: i64 = 0o200;
/// Truncate the file to zero length on open.
pub const O_TRUNC: i64 = 0o1000;
/// Append on each write. Not supported by object-store adapters.
pub const O_APPEND: i64 = 0o2000;

/// Mask of every flag implying write intent.
pub const O_WRITE: i64 = O_WRONLY | O_RDWR | O_APPEND | O_TRUNC | O_CREATE;

/// Whether the flag combination requests write access.
pub fn is_write(flag: i64) -> bool {
    flag & O_WRITE != 0
}

/// Default permission bits for regular files created by adapters that have
/// no native mode concept.
pub const DEFAULT_FILE_MODE: u32 = 0o644;
/// Default permission bits for directories.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Snapshot of a file's metadata. Invalid after any mutation of the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    /// Base name of the entry, not the full path.
    pub name: String,
    /// Size in bytes. Directories advertise 0.
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
    /// Last modification time.
    pub mtime: DateTime<Utc>,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

impl FileInfo {
    /// Synthetic directory entry for stores without native directories.
    pub fn directory(name: impl Into<String>, mtime: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            mode: DEFAULT_DIR_MODE,
            mtime,
            is_dir: true,
        }
    }
}

/// Error taxonomy surfaced by every layer of the stack.
///
/// Layers translate underlying-store errors into this taxonomy; unknown
/// errors become [`FsError::Io`] with the cause stringified and logged at
/// the innermost layer that can identify the store.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    /// Authorization denial. Emitted only by the authorization wrapper.
    #[error("operation not permitted: {0}")]
    PermissionDenied(String),

    /// Credential mismatch against the underlying store.
    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Capacity budget exceeded and not relievable.
    #[error("no space left on device: {0}")]
    InsufficientSpace(String),

    /// Operation on a closed file handle.
    #[error("file handle already closed")]
    Closed,

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("timeout while communicating with storage backend")]
    Timeout,

    /// Backend failure with the cause retained for logging.
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => FsError::NotFound(err.to_string()),
            ErrorKind::AlreadyExists => FsError::AlreadyExists(err.to_string()),
            ErrorKind::PermissionDenied => FsError::AccessDenied(err.to_string()),
            ErrorKind::TimedOut => FsError::Timeout,
            _ => FsError::Io(err.to_string()),
        }
    }
}

impl From<object_store::Error> for FsError {
    fn from(err: object_store::Error) -> Self {
        use object_store::Error as StoreError;
        match err {
            StoreError::NotFound { path, .. } => FsError::NotFound(path),
            StoreError::AlreadyExists { path, .. } => FsError::AlreadyExists(path),
            StoreError::PermissionDenied { path, .. } => FsError::AccessDenied(path),
            StoreError::Unauthenticated { path, .. } => FsError::AccessDenied(path),
            StoreError::NotSupported { source } => FsError::NotSupported(source.to_string()),
            StoreError::NotImplemented => {
                FsError::NotSupported("not implemented by object store".to_string())
            }
            StoreError::InvalidPath { source } => FsError::InvalidPath(source.to_string()),
            other => FsError::Io(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for FsError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => FsError::NotFound(err.to_string()),
            other => FsError::Io(other.to_string()),
        }
    }
}

/// A root of a hierarchical namespace.
///
/// Implementations must be safe to call from many request contexts
/// simultaneously. Cancellation is future-drop: dropping an in-flight
/// operation aborts the underlying store call.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Create `path` as a directory.
    ///
    /// Fails with [`FsError::AlreadyExists`] if present and
    /// [`FsError::NotFound`] if a parent is missing.
    async fn mkdir(&self, path: &str, mode: u32) -> Result<(), FsError>;

    /// Open a file handle on `path`.
    ///
    /// `flag` combines at most one of `O_RDONLY | O_WRONLY | O_RDWR` with
    /// any of `O_CREATE | O_TRUNC | O_EXCL | O_APPEND`. Opening a directory
    /// for writing fails with [`FsError::IsDirectory`].
    async fn open_file(
        &self,
        path: &str,
        flag: i64,
        mode: u32,
    ) -> Result<Box<dyn FileHandle>, FsError>;

    /// Metadata snapshot for `path`. [`FsError::NotFound`] if missing.
    async fn stat(&self, path: &str) -> Result<FileInfo, FsError>;

    /// Recursively remove `path`. Not an error if the target is missing.
    async fn remove_all(&self, path: &str) -> Result<(), FsError>;

    /// Move a single entry, possibly across directories within this
    /// filesystem.
    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), FsError>;
}

/// An open file obtained from [`FileSystem::open_file`].
///
/// A handle exclusively owns its underlying-store resources; decorator
/// handles own the inner handles they wrap and close them in reverse-open
/// order. Operations after a successful close return [`FsError::Closed`],
/// including a second close.
#[async_trait]
pub trait FileHandle: Send {
    /// Read up to `buf.len()` bytes at the current position. Returns 0 at
    /// end of file. Directories reject reads.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Write `buf` at the current position. Directories reject writes.
    async fn write(&mut self, buf: &[u8]) -> Result<usize, FsError>;

    /// Reposition the handle. Positions are byte offsets from the start.
    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, FsError>;

    /// List directory entries. A negative `count` returns all remaining
    /// entries; a positive `count` returns at most that many, advancing an
    /// internal cursor. Regular files reject listing with
    /// [`FsError::NotDirectory`].
    async fn readdir(&mut self, count: i64) -> Result<Vec<FileInfo>, FsError>;

    /// Metadata snapshot for the open file.
    async fn stat(&mut self) -> Result<FileInfo, FsError>;

    /// Release the handle. This is the only point permitted to surface late
    /// errors (for example an object-store upload finalize).
    async fn close(&mut self) -> Result<(), FsError>;
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Single-database blob store adapter.
//!
//! Persists the whole namespace in one SQLite database: a `files` table
//! holding the metadata tree and a `file_contents` table holding blobs,
//! with foreign-key cascade so removing a file row drops its content. The
//! root `/` row is upserted at open.
//!
//! Handles buffer content in memory and flush on close in a single
//! transaction, so concurrent writers to the same path publish one
//! writer's bytes, never a splice.

use crate::domain::fs::{
    FileHandle, FileInfo, FileSystem, FsError, DEFAULT_DIR_MODE, O_APPEND, O_CREATE, O_EXCL,
    O_RDWR, O_TRUNC, O_WRONLY,
};
use crate::domain::path;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::io::SeekFrom;
use std::str::FromStr;

/// Options for the `sqlite` filesystem type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobDbOptions {
    /// Database file path, or `:memory:` for an in-memory store.
    pub path: String,
}

/// SQLite-backed filesystem.
pub struct BlobDbFileSystem {
    pool: SqlitePool,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS files (
        path TEXT PRIMARY KEY,
        is_dir INTEGER NOT NULL,
        mode INTEGER NOT NULL,
        size INTEGER NOT NULL,
        mtime INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS file_contents (
        path TEXT PRIMARY KEY
            REFERENCES files(path) ON DELETE CASCADE ON UPDATE CASCADE,
        content BLOB
    )",
];

impl BlobDbFileSystem {
    /// Open (or create) the database at `db_path` and ensure the schema.
    pub async fn connect(db_path: &str) -> Result<Self, FsError> {
        let in_memory = db_path == ":memory:";

        let options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(FsError::from)?
        } else {
            SqliteConnectOptions::new()
                .filename(db_path)
                .create_if_missing(true)
        }
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

        // An in-memory database lives and dies with its connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        sqlx::query(
            "INSERT OR IGNORE INTO files (path, is_dir, mode, size, mtime) VALUES ('/', 1, ?, 0, ?)",
        )
        .bind(i64::from(DEFAULT_DIR_MODE))
        .bind(Utc::now().timestamp())
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// LIKE pattern matching every descendant of a directory.
fn child_pattern(fs_path: &str) -> String {
    if fs_path == "/" {
        "/%".to_string()
    } else {
        format!("{fs_path}/%")
    }
}

fn child_prefix_len(fs_path: &str) -> usize {
    if fs_path == "/" {
        1
    } else {
        fs_path.len() + 1
    }
}

fn info_from_row(fs_path: &str, row: &sqlx::sqlite::SqliteRow) -> Result<FileInfo, FsError> {
    let is_dir: i64 = row.try_get("is_dir")?;
    let mode: i64 = row.try_get("mode")?;
    let size: i64 = row.try_get("size")?;
    let mtime: i64 = row.try_get("mtime")?;

    Ok(FileInfo {
        name: path::base(fs_path).to_string(),
        size: if is_dir != 0 { 0 } else { size.max(0) as u64 },
        mode: mode as u32,
        mtime: DateTime::from_timestamp(mtime, 0).unwrap_or_else(Utc::now),
        is_dir: is_dir != 0,
    })
}

async fn fetch_info(pool: &SqlitePool, fs_path: &str) -> Result<FileInfo, FsError> {
    let row = sqlx::query("SELECT is_dir, mode, size, mtime FROM files WHERE path = ?")
        .bind(fs_path)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => info_from_row(fs_path, &row),
        None => Err(FsError::NotFound(fs_path.to_string())),
    }
}

async fn require_parent_dir(pool: &SqlitePool, fs_path: &str) -> Result<(), FsError> {
    let parent = path::parent(fs_path);
    match fetch_info(pool, parent).await {
        Ok(info) if info.is_dir => Ok(()),
        Ok(_) => Err(FsError::NotDirectory(parent.to_string())),
        Err(FsError::NotFound(_)) => Err(FsError::NotFound(parent.to_string())),
        Err(err) => Err(err),
    }
}

#[async_trait]
impl FileSystem for BlobDbFileSystem {
    async fn mkdir(&self, fs_path: &str, mode: u32) -> Result<(), FsError> {
        let fs_path = path::normalize(fs_path)?;

        if fetch_info(&self.pool, &fs_path).await.is_ok() {
            return Err(FsError::AlreadyExists(fs_path));
        }
        require_parent_dir(&self.pool, &fs_path).await?;

        let result =
            sqlx::query("INSERT INTO files (path, is_dir, mode, size, mtime) VALUES (?, 1, ?, 0, ?)")
                .bind(&fs_path)
                .bind(i64::from(mode))
                .bind(Utc::now().timestamp())
                .execute(&self.pool)
                .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(FsError::AlreadyExists(fs_path))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn open_file(
        &self,
        fs_path: &str,
        flag: i64,
        mode: u32,
    ) -> Result<Box<dyn FileHandle>, FsError> {
        let fs_path = path::normalize(fs_path)?;
        let writing = flag & (O_WRONLY | O_RDWR | O_CREATE | O_TRUNC | O_APPEND) != 0;

        let existing = match fetch_info(&self.pool, &fs_path).await {
            Ok(info) => Some(info),
            Err(FsError::NotFound(_)) => None,
            Err(err) => return Err(err),
        };

        match existing {
            Some(info) if info.is_dir => {
                if writing {
                    return Err(FsError::IsDirectory(fs_path));
                }
                Ok(Box::new(BlobDbDirHandle {
                    pool: self.pool.clone(),
                    fs_path,
                    entries: None,
                    cursor: 0,
                    closed: false,
                }))
            }
            Some(info) => {
                if flag & O_CREATE != 0 && flag & O_EXCL != 0 {
                    return Err(FsError::AlreadyExists(fs_path));
                }

                let content = if flag & O_TRUNC != 0 {
                    Vec::new()
                } else {
                    let row =
                        sqlx::query("SELECT content FROM file_contents WHERE path = ?")
                            .bind(&fs_path)
                            .fetch_optional(&self.pool)
                            .await?;
                    match row {
                        Some(row) => row
                            .try_get::<Option<Vec<u8>>, _>("content")?
                            .unwrap_or_default(),
                        None => Vec::new(),
                    }
                };

                Ok(Box::new(BlobDbFileHandle {
                    pool: self.pool.clone(),
                    fs_path,
                    mode: info.mode,
                    flag,
                    content,
                    pos: 0,
                    dirty: flag & O_TRUNC != 0,
                    closed: false,
                }))
            }
            None => {
                if flag & O_CREATE == 0 {
                    return Err(FsError::NotFound(fs_path));
                }
                require_parent_dir(&self.pool, &fs_path).await?;

                // OR IGNORE keeps a concurrent create of the same path from
                // surfacing a constraint error.
                let mut tx = self.pool.begin().await?;
                sqlx::query(
                    "INSERT OR IGNORE INTO files (path, is_dir, mode, size, mtime) VALUES (?, 0, ?, 0, ?)",
                )
                .bind(&fs_path)
                .bind(i64::from(mode))
                .bind(Utc::now().timestamp())
                .execute(&mut *tx)
                .await?;
                sqlx::query("INSERT OR IGNORE INTO file_contents (path, content) VALUES (?, ?)")
                    .bind(&fs_path)
                    .bind(Vec::<u8>::new())
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;

                Ok(Box::new(BlobDbFileHandle {
                    pool: self.pool.clone(),
                    fs_path,
                    mode,
                    flag,
                    content: Vec::new(),
                    pos: 0,
                    dirty: false,
                    closed: false,
                }))
            }
        }
    }

    async fn stat(&self, fs_path: &str) -> Result<FileInfo, FsError> {
        let fs_path = path::normalize(fs_path)?;
        fetch_info(&self.pool, &fs_path).await
    }

    async fn remove_all(&self, fs_path: &str) -> Result<(), FsError> {
        let fs_path = path::normalize(fs_path)?;

        if fs_path == "/" {
            // The root row must survive.
            sqlx::query("DELETE FROM files WHERE path != '/'")
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        sqlx::query("DELETE FROM files WHERE path = ? OR path LIKE ?")
            .bind(&fs_path)
            .bind(child_pattern(&fs_path))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        let old_path = path::normalize(old_path)?;
        let new_path = path::normalize(new_path)?;

        let info = fetch_info(&self.pool, &old_path).await?;
        require_parent_dir(&self.pool, &new_path).await?;

        let mut tx = self.pool.begin().await?;

        // Replace semantics: a pre-existing target is dropped first.
        sqlx::query("DELETE FROM files WHERE path = ? OR path LIKE ?")
            .bind(&new_path)
            .bind(child_pattern(&new_path))
            .execute(&mut *tx)
            .await?;

        if info.is_dir {
            sqlx::query(
                "UPDATE files SET path = ? || substr(path, length(?) + 1)
                 WHERE path = ? OR path LIKE ?",
            )
            .bind(&new_path)
            .bind(&old_path)
            .bind(&old_path)
            .bind(child_pattern(&old_path))
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query("UPDATE files SET path = ? WHERE path = ?")
                .bind(&new_path)
                .bind(&old_path)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/// Regular-file handle buffering content in memory until close.
struct BlobDbFileHandle {
    pool: SqlitePool,
    fs_path: String,
    mode: u32,
    flag: i64,
    content: Vec<u8>,
    pos: usize,
    dirty: bool,
    closed: bool,
}

#[async_trait]
impl FileHandle for BlobDbFileHandle {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }

        let remaining = &self.content[self.pos.min(self.content.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }
        if self.flag & (O_WRONLY | O_RDWR | O_CREATE | O_TRUNC | O_APPEND) == 0 {
            return Err(FsError::NotSupported(
                "handle not opened for writing".to_string(),
            ));
        }

        if self.flag & O_APPEND != 0 {
            self.pos = self.content.len();
        }

        let end = self.pos + buf.len();
        if end > self.content.len() {
            self.content.resize(end, 0);
        }
        self.content[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        self.dirty = true;

        Ok(buf.len())
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }

        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => self.pos as i128 + i128::from(delta),
            SeekFrom::End(delta) => self.content.len() as i128 + i128::from(delta),
        };

        if target < 0 {
            return Err(FsError::Io("seek before start of file".to_string()));
        }

        self.pos = target as usize;
        Ok(self.pos as u64)
    }

    async fn readdir(&mut self, _count: i64) -> Result<Vec<FileInfo>, FsError> {
        Err(FsError::NotDirectory(self.fs_path.clone()))
    }

    async fn stat(&mut self) -> Result<FileInfo, FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }

        Ok(FileInfo {
            name: path::base(&self.fs_path).to_string(),
            size: self.content.len() as u64,
            mode: self.mode,
            mtime: Utc::now(),
            is_dir: false,
        })
    }

    async fn close(&mut self) -> Result<(), FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }
        self.closed = true;

        if !self.dirty {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE files SET size = ?, mtime = ? WHERE path = ?")
            .bind(self.content.len() as i64)
            .bind(Utc::now().timestamp())
            .bind(&self.fs_path)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO file_contents (path, content) VALUES (?, ?)
             ON CONFLICT(path) DO UPDATE SET content = excluded.content",
        )
        .bind(&self.fs_path)
        .bind(std::mem::take(&mut self.content))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(())
    }
}

/// Directory handle carrying a listing cursor.
struct BlobDbDirHandle {
    pool: SqlitePool,
    fs_path: String,
    entries: Option<Vec<FileInfo>>,
    cursor: usize,
    closed: bool,
}

impl BlobDbDirHandle {
    async fn load_entries(&self) -> Result<Vec<FileInfo>, FsError> {
        let rows =
            sqlx::query("SELECT path, is_dir, mode, size, mtime FROM files WHERE path LIKE ? ORDER BY path")
                .bind(child_pattern(&self.fs_path))
                .fetch_all(&self.pool)
                .await?;

        let prefix_len = child_prefix_len(&self.fs_path);
        let mut entries = Vec::new();

        for row in rows {
            let row_path: String = row.try_get("path")?;
            // Immediate children only.
            if row_path[prefix_len..].contains('/') {
                continue;
            }
            entries.push(info_from_row(&row_path, &row)?);
        }

        Ok(entries)
    }
}

#[async_trait]
impl FileHandle for BlobDbDirHandle {
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
            self.entries = Some(self.load_entries().await?);
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
        fetch_info(&self.pool, &self.fs_path).await
    }

    async fn close(&mut self) -> Result<(), FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fs::O_RDONLY;

    async fn memory_fs() -> BlobDbFileSystem {
        BlobDbFileSystem::connect(":memory:").await.unwrap()
    }

    async fn write_file(fs: &BlobDbFileSystem, fs_path: &str, data: &[u8]) {
        let mut file = fs
            .open_file(fs_path, O_CREATE | O_WRONLY | O_TRUNC, 0o644)
            .await
            .unwrap();
        file.write(data).await.unwrap();
        file.close().await.unwrap();
    }

    async fn read_file(fs: &BlobDbFileSystem, fs_path: &str) -> Vec<u8> {
        let mut file = fs.open_file(fs_path, O_RDONLY, 0).await.unwrap();
        let mut out = Vec::new();
        let mut buf = vec![0u8; 1024];
        loop {
            let n = file.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        file.close().await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_root_exists_at_open() {
        let fs = memory_fs().await;
        let info = fs.stat("/").await.unwrap();
        assert!(info.is_dir);
    }

    #[tokio::test]
    async fn test_mkdir_and_stat() {
        let fs = memory_fs().await;
        fs.mkdir("/docs", 0o755).await.unwrap();

        let info = fs.stat("/docs").await.unwrap();
        assert!(info.is_dir);
        assert_eq!(info.size, 0);

        assert!(matches!(
            fs.mkdir("/docs", 0o755).await,
            Err(FsError::AlreadyExists(_))
        ));
        assert!(matches!(
            fs.mkdir("/a/b", 0o755).await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let fs = memory_fs().await;
        write_file(&fs, "/a.txt", b"blob content").await;

        assert_eq!(fs.stat("/a.txt").await.unwrap().size, 12);
        assert_eq!(read_file(&fs, "/a.txt").await, b"blob content");
    }

    #[tokio::test]
    async fn test_truncate_discards_previous_content() {
        let fs = memory_fs().await;
        write_file(&fs, "/a.txt", b"something long").await;
        write_file(&fs, "/a.txt", b"short").await;

        assert_eq!(read_file(&fs, "/a.txt").await, b"short");
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let fs = memory_fs().await;
        let result = fs
            .open_file("/missing/a.txt", O_CREATE | O_WRONLY, 0o644)
            .await;
        assert!(matches!(result, Err(FsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_excl_create_fails_on_existing() {
        let fs = memory_fs().await;
        write_file(&fs, "/a.txt", b"x").await;
        let result = fs
            .open_file("/a.txt", O_CREATE | O_EXCL | O_WRONLY, 0o644)
            .await;
        assert!(matches!(result, Err(FsError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_readdir_immediate_children_only() {
        let fs = memory_fs().await;
        fs.mkdir("/top", 0o755).await.unwrap();
        fs.mkdir("/top/sub", 0o755).await.unwrap();
        write_file(&fs, "/top/a.txt", b"a").await;
        write_file(&fs, "/top/sub/deep.txt", b"deep").await;

        let mut dir = fs.open_file("/top", O_RDONLY, 0).await.unwrap();
        let entries = dir.readdir(-1).await.unwrap();
        dir.close().await.unwrap();

        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub"]);
    }

    #[tokio::test]
    async fn test_remove_all_cascades() {
        let fs = memory_fs().await;
        fs.mkdir("/top", 0o755).await.unwrap();
        write_file(&fs, "/top/a.txt", b"a").await;

        fs.remove_all("/top").await.unwrap();

        assert!(matches!(fs.stat("/top").await, Err(FsError::NotFound(_))));
        assert!(matches!(
            fs.stat("/top/a.txt").await,
            Err(FsError::NotFound(_))
        ));

        fs.remove_all("/top").await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_file_and_directory() {
        let fs = memory_fs().await;
        fs.mkdir("/src", 0o755).await.unwrap();
        write_file(&fs, "/src/f.txt", b"payload").await;

        fs.rename("/src", "/dst").await.unwrap();

        assert!(matches!(fs.stat("/src").await, Err(FsError::NotFound(_))));
        assert!(fs.stat("/dst").await.unwrap().is_dir);
        assert_eq!(read_file(&fs, "/dst/f.txt").await, b"payload");

        fs.rename("/dst/f.txt", "/dst/g.txt").await.unwrap();
        assert_eq!(read_file(&fs, "/dst/g.txt").await, b"payload");
    }

    #[tokio::test]
    async fn test_append_flag() {
        let fs = memory_fs().await;
        write_file(&fs, "/log.txt", b"one").await;

        let mut file = fs
            .open_file("/log.txt", O_WRONLY | O_APPEND, 0o644)
            .await
            .unwrap();
        file.write(b"+two").await.unwrap();
        file.close().await.unwrap();

        assert_eq!(read_file(&fs, "/log.txt").await, b"one+two");
    }
}

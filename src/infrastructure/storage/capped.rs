// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Size-capped filesystem with least-recently-accessed eviction.
//!
//! Tracks every file of the wrapped filesystem in an in-memory index
//! (`path → {size, last_access}`) plus a running total. When a write would
//! push the total over the byte budget, the least recently accessed files
//! are removed until the budget holds; if the budget cannot be satisfied
//! the triggering write fails with `InsufficientSpace` and nothing is
//! evicted.
//!
//! The index is established lazily by a one-shot recursive scan before the
//! first operation. The index lock is never held across wrapped-filesystem
//! I/O.

use crate::domain::fs::{
    is_write, FileHandle, FileInfo, FileSystem, FsError, O_APPEND, O_CREATE, O_RDONLY, O_TRUNC,
};
use crate::domain::path;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::{Arc, RwLock};
use std::time::Instant;

#[derive(Debug, Clone)]
struct LruEntry {
    size: u64,
    last_access: Instant,
    is_dir: bool,
}

#[derive(Default)]
struct CappedState {
    files: HashMap<String, LruEntry>,
    cur_size: u64,
}

struct CappedShared {
    inner: Arc<dyn FileSystem>,
    max_size: u64,
    state: RwLock<CappedState>,
    init: tokio::sync::OnceCell<()>,
}

/// Byte-budgeted filesystem wrapper.
pub struct CappedFileSystem {
    shared: Arc<CappedShared>,
}

impl CappedFileSystem {
    pub fn new(inner: Arc<dyn FileSystem>, max_size: u64) -> Self {
        Self {
            shared: Arc::new(CappedShared {
                inner,
                max_size,
                state: RwLock::new(CappedState::default()),
                init: tokio::sync::OnceCell::new(),
            }),
        }
    }

    /// Tracked byte total, for tests and introspection.
    pub fn current_size(&self) -> u64 {
        self.shared.state.read().unwrap_or_else(|e| e.into_inner()).cur_size
    }
}

impl CappedShared {
    async fn ensure_initialized(&self) -> Result<(), FsError> {
        self.init
            .get_or_try_init(|| async {
                self.scan().await?;
                // The wrapped tree may already exceed the budget.
                self.ensure_space("/", 0).await
            })
            .await?;
        Ok(())
    }

    /// Walk the wrapped filesystem and populate the index. The lock is
    /// taken per directory, not across the walk.
    async fn scan(&self) -> Result<(), FsError> {
        let mut pending = vec!["/".to_string()];

        while let Some(dir) = pending.pop() {
            let mut handle = self.inner.open_file(&dir, O_RDONLY, 0).await?;
            let entries = handle.readdir(-1).await?;
            let _ = handle.close().await;

            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            for entry in entries {
                let full = path::join(&dir, &entry.name);
                if entry.is_dir {
                    pending.push(full.clone());
                }
                state.files.insert(
                    full,
                    LruEntry {
                        size: if entry.is_dir { 0 } else { entry.size },
                        last_access: Instant::now(),
                        is_dir: entry.is_dir,
                    },
                );
                if !entry.is_dir {
                    state.cur_size += entry.size;
                }
            }
        }

        Ok(())
    }

    fn touch(&self, fs_path: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = state.files.get_mut(fs_path) {
            entry.last_access = Instant::now();
        }
    }

    /// Record a file's size, adjusting the running total.
    fn update_file_size(&self, fs_path: &str, size: u64, is_dir: bool) {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        let state = &mut *guard;

        match state.files.get_mut(fs_path) {
            Some(entry) => {
                entry.last_access = Instant::now();
                if !entry.is_dir && entry.size != size {
                    state.cur_size = state.cur_size - entry.size + size;
                    entry.size = size;
                }
            }
            None => {
                state.files.insert(
                    fs_path.to_string(),
                    LruEntry {
                        size: if is_dir { 0 } else { size },
                        last_access: Instant::now(),
                        is_dir,
                    },
                );
                if !is_dir {
                    state.cur_size += size;
                }
            }
        }
    }

    /// Drop tracking for a path and everything under it.
    fn remove_tracking(&self, fs_path: &str) {
        let prefix = format!("{}/", fs_path);
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        let doomed: Vec<String> = state
            .files
            .keys()
            .filter(|p| p.as_str() == fs_path || p.starts_with(&prefix))
            .cloned()
            .collect();

        for p in doomed {
            if let Some(entry) = state.files.remove(&p) {
                if !entry.is_dir {
                    state.cur_size -= entry.size;
                }
            }
        }
    }

    /// Move tracking from one prefix to another, preserving access times.
    fn move_tracking(&self, old_path: &str, new_path: &str) {
        let old_prefix = format!("{}/", old_path);
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        let moved: Vec<String> = state
            .files
            .keys()
            .filter(|p| p.as_str() == old_path || p.starts_with(&old_prefix))
            .cloned()
            .collect();

        for p in moved {
            if let Some(entry) = state.files.remove(&p) {
                let suffix = &p[old_path.len()..];
                state.files.insert(format!("{new_path}{suffix}"), entry);
            }
        }
    }

    /// Evict least-recently-accessed files until `cur_size + additional`
    /// fits the budget.
    async fn ensure_space(&self, fs_path: &str, additional: u64) -> Result<(), FsError> {
        {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if state.cur_size + additional <= self.max_size {
                return Ok(());
            }
        }

        // Snapshot candidates under the write lock, sort outside it.
        let mut candidates: Vec<(String, u64, Instant)> = {
            let state = self.state.write().unwrap_or_else(|e| e.into_inner());
            if state.cur_size + additional <= self.max_size {
                return Ok(());
            }
            state
                .files
                .iter()
                .filter(|(_, entry)| !entry.is_dir && entry.size > 0)
                .map(|(p, entry)| (p.clone(), entry.size, entry.last_access))
                .collect()
        };

        candidates.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));

        // If evicting everything still cannot satisfy the request, fail
        // before deleting anything.
        let reclaimable: u64 = candidates.iter().map(|(_, size, _)| *size).sum();
        {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if state.cur_size.saturating_sub(reclaimable) + additional > self.max_size {
                return Err(FsError::InsufficientSpace(fs_path.to_string()));
            }
        }

        let mut last_error = None;

        for (candidate, _, _) in candidates {
            let still_needed = {
                let state = self.state.read().unwrap_or_else(|e| e.into_inner());
                state.cur_size + additional > self.max_size
            };
            if !still_needed {
                break;
            }

            match self.inner.remove_all(&candidate).await {
                Ok(()) => {
                    tracing::debug!(path = %candidate, "evicted to reclaim space");
                    let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                    if let Some(entry) = state.files.remove(&candidate) {
                        if !entry.is_dir {
                            state.cur_size -= entry.size;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(path = %candidate, error = %err, "eviction failed");
                    last_error = Some(err);
                }
            }
        }

        let satisfied = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            state.cur_size + additional <= self.max_size
        };

        if satisfied {
            Ok(())
        } else if let Some(err) = last_error {
            Err(err)
        } else {
            Err(FsError::InsufficientSpace(fs_path.to_string()))
        }
    }
}

#[async_trait]
impl FileSystem for CappedFileSystem {
    async fn mkdir(&self, fs_path: &str, mode: u32) -> Result<(), FsError> {
        let fs_path = path::normalize(fs_path)?;
        self.shared.ensure_initialized().await?;

        self.shared.inner.mkdir(&fs_path, mode).await?;
        self.shared.update_file_size(&fs_path, 0, true);
        Ok(())
    }

    async fn open_file(
        &self,
        fs_path: &str,
        flag: i64,
        mode: u32,
    ) -> Result<Box<dyn FileHandle>, FsError> {
        let fs_path = path::normalize(fs_path)?;
        self.shared.ensure_initialized().await?;

        if is_write(flag) && flag & O_CREATE != 0 {
            self.shared.ensure_space(&fs_path, 0).await?;
        } else {
            self.shared.touch(&fs_path);
        }

        let inner = self.shared.inner.open_file(&fs_path, flag, mode).await?;

        // Seed the growth estimate from the index; a fresh or truncated
        // file starts from zero. Append handles write at the end of the
        // existing content, so their position starts there too.
        let known_size = if flag & O_TRUNC != 0 {
            0
        } else {
            let state = self.shared.state.read().unwrap_or_else(|e| e.into_inner());
            state.files.get(&fs_path).map(|e| e.size).unwrap_or(0)
        };
        let pos = if flag & O_APPEND != 0 { known_size } else { 0 };

        Ok(Box::new(CappedFileHandle {
            shared: self.shared.clone(),
            fs_path,
            inner,
            pos,
            known_size,
        }))
    }

    async fn stat(&self, fs_path: &str) -> Result<FileInfo, FsError> {
        let fs_path = path::normalize(fs_path)?;
        self.shared.ensure_initialized().await?;

        let info = self.shared.inner.stat(&fs_path).await?;
        self.shared
            .update_file_size(&fs_path, info.size, info.is_dir);
        Ok(info)
    }

    async fn remove_all(&self, fs_path: &str) -> Result<(), FsError> {
        let fs_path = path::normalize(fs_path)?;
        self.shared.ensure_initialized().await?;

        self.shared.inner.remove_all(&fs_path).await?;
        self.shared.remove_tracking(&fs_path);
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        let old_path = path::normalize(old_path)?;
        let new_path = path::normalize(new_path)?;
        self.shared.ensure_initialized().await?;

        self.shared.inner.rename(&old_path, &new_path).await?;
        self.shared.move_tracking(&old_path, &new_path);
        Ok(())
    }
}

/// Handle wrapper: accounts growth before writes, access times on use, and
/// the final size at close.
struct CappedFileHandle {
    shared: Arc<CappedShared>,
    fs_path: String,
    inner: Box<dyn FileHandle>,
    pos: u64,
    known_size: u64,
}

#[async_trait]
impl FileHandle for CappedFileHandle {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        let n = self.inner.read(buf).await?;
        if n > 0 {
            self.pos += n as u64;
            self.shared.touch(&self.fs_path);
        }
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
        let expected = self.known_size.max(self.pos + buf.len() as u64);
        let growth = expected - self.known_size;
        if growth > 0 {
            self.shared
                .ensure_space(&self.fs_path, growth)
                .await
                .map_err(|err| match err {
                    FsError::InsufficientSpace(_) => err,
                    other => {
                        tracing::warn!(path = %self.fs_path, error = %other, "space reclaim failed");
                        FsError::InsufficientSpace(self.fs_path.clone())
                    }
                })?;
        }

        let n = self.inner.write(buf).await?;
        self.pos += n as u64;
        self.known_size = self.known_size.max(self.pos);

        if n > 0 {
            self.shared.touch(&self.fs_path);
        }
        Ok(n)
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, FsError> {
        let new_pos = self.inner.seek(pos).await?;
        self.pos = new_pos;
        Ok(new_pos)
    }

    async fn readdir(&mut self, count: i64) -> Result<Vec<FileInfo>, FsError> {
        self.inner.readdir(count).await
    }

    async fn stat(&mut self) -> Result<FileInfo, FsError> {
        let info = self.inner.stat().await?;
        self.shared.touch(&self.fs_path);
        Ok(info)
    }

    async fn close(&mut self) -> Result<(), FsError> {
        // Refresh tracking from the post-write metadata before releasing
        // the inner handle.
        if let Ok(info) = self.inner.stat().await {
            self.shared
                .update_file_size(&self.fs_path, info.size, info.is_dir);
        }
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fs::{O_RDONLY, O_WRONLY};
    use crate::infrastructure::storage::local::LocalFileSystem;
    use tempfile::TempDir;

    fn capped_over_local(dir: &TempDir, max_size: u64) -> CappedFileSystem {
        let local = Arc::new(LocalFileSystem::new(dir.path()).unwrap());
        CappedFileSystem::new(local, max_size)
    }

    async fn write_file(fs: &CappedFileSystem, fs_path: &str, data: &[u8]) -> Result<(), FsError> {
        let mut file = fs
            .open_file(fs_path, O_CREATE | O_WRONLY | O_TRUNC, 0o644)
            .await?;
        file.write(data).await?;
        file.close().await
    }

    #[tokio::test]
    async fn test_eviction_prefers_least_recently_accessed() {
        let dir = TempDir::new().unwrap();
        let fs = capped_over_local(&dir, 200);

        write_file(&fs, "/a.bin", &[0u8; 100]).await.unwrap();
        write_file(&fs, "/b.bin", &[0u8; 80]).await.unwrap();

        // Touch /a.bin so /b.bin becomes the eviction candidate.
        fs.stat("/a.bin").await.unwrap();

        write_file(&fs, "/c.bin", &[0u8; 60]).await.unwrap();

        assert!(matches!(fs.stat("/b.bin").await, Err(FsError::NotFound(_))));
        assert_eq!(fs.stat("/a.bin").await.unwrap().size, 100);
        assert_eq!(fs.stat("/c.bin").await.unwrap().size, 60);
        assert_eq!(fs.current_size(), 160);
    }

    #[tokio::test]
    async fn test_budget_holds_after_each_close() {
        let dir = TempDir::new().unwrap();
        let fs = capped_over_local(&dir, 150);

        for i in 0..6 {
            write_file(&fs, &format!("/f{i}.bin"), &[0u8; 60])
                .await
                .unwrap();
            assert!(fs.current_size() <= 150, "budget exceeded after close");
        }
    }

    #[tokio::test]
    async fn test_unsatisfiable_write_fails_without_eviction() {
        let dir = TempDir::new().unwrap();
        let fs = capped_over_local(&dir, 100);

        write_file(&fs, "/keep.bin", &[0u8; 40]).await.unwrap();

        // 200 bytes can never fit in a 100-byte budget.
        let result = write_file(&fs, "/huge.bin", &[0u8; 200]).await;
        assert!(matches!(result, Err(FsError::InsufficientSpace(_))));

        // The pre-existing file was not sacrificed.
        assert_eq!(fs.stat("/keep.bin").await.unwrap().size, 40);
    }

    #[tokio::test]
    async fn test_startup_scan_counts_existing_files() {
        let dir = TempDir::new().unwrap();

        // Seed the backing directory before the capped wrapper exists.
        {
            let local = LocalFileSystem::new(dir.path()).unwrap();
            let mut file = local
                .open_file("/big.bin", O_CREATE | O_WRONLY, 0o644)
                .await
                .unwrap();
            file.write(&[0u8; 1200]).await.unwrap();
            file.close().await.unwrap();
        }

        let fs = capped_over_local(&dir, 1000);

        // First mutating call triggers the scan; the oversized survivor is
        // evicted to bring the tree under budget.
        write_file(&fs, "/small.bin", &[0u8; 50]).await.unwrap();

        assert!(matches!(fs.stat("/big.bin").await, Err(FsError::NotFound(_))));
        assert_eq!(fs.stat("/small.bin").await.unwrap().size, 50);
        assert!(fs.current_size() <= 1000);
    }

    #[tokio::test]
    async fn test_remove_and_rename_keep_accounting() {
        let dir = TempDir::new().unwrap();
        let fs = capped_over_local(&dir, 1000);

        fs.mkdir("/sub", 0o755).await.unwrap();
        write_file(&fs, "/sub/a.bin", &[0u8; 100]).await.unwrap();
        write_file(&fs, "/sub/b.bin", &[0u8; 50]).await.unwrap();
        assert_eq!(fs.current_size(), 150);

        fs.rename("/sub", "/moved").await.unwrap();
        assert_eq!(fs.current_size(), 150);
        assert_eq!(fs.stat("/moved/a.bin").await.unwrap().size, 100);

        fs.remove_all("/moved").await.unwrap();
        assert_eq!(fs.current_size(), 0);
    }

    #[tokio::test]
    async fn test_append_growth_is_accounted() {
        let dir = TempDir::new().unwrap();
        let fs = capped_over_local(&dir, 200);

        write_file(&fs, "/old.bin", &[0u8; 80]).await.unwrap();
        write_file(&fs, "/log.bin", &[0u8; 60]).await.unwrap();

        let mut file = fs
            .open_file("/log.bin", O_WRONLY | O_APPEND, 0o644)
            .await
            .unwrap();
        file.write(&[1u8; 80]).await.unwrap();
        file.close().await.unwrap();

        // The append grew the file past the budget's remainder, so the
        // oldest untouched file was evicted and the total stayed under
        // the cap.
        assert!(matches!(fs.stat("/old.bin").await, Err(FsError::NotFound(_))));
        assert_eq!(fs.stat("/log.bin").await.unwrap().size, 140);
        assert_eq!(fs.current_size(), 140);
    }

    #[tokio::test]
    async fn test_readdir_passthrough() {
        let dir = TempDir::new().unwrap();
        let fs = capped_over_local(&dir, 1000);

        fs.mkdir("/d", 0o755).await.unwrap();
        write_file(&fs, "/d/x.bin", &[0u8; 10]).await.unwrap();

        let mut handle = fs.open_file("/d", O_RDONLY, 0).await.unwrap();
        let entries = handle.readdir(-1).await.unwrap();
        handle.close().await.unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "x.bin");
    }
}

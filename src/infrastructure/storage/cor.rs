// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Copy-on-read compositor.
//!
//! Composes a cache filesystem and a backend filesystem. Reads probe the
//! cache and materialize misses from the backend; writes go through a
//! write-through handle that duplicates every write to both sides. The
//! backend is the source of truth: every successful write has been seen by
//! it, and cache-side failures are logged but never fail the call.
//!
//! No freshness guarantee is made when the backend is mutated out of band.

use crate::domain::fs::{
    is_write, FileHandle, FileInfo, FileSystem, FsError, O_CREATE, O_RDONLY, O_TRUNC, O_WRONLY,
};
use crate::domain::path;
use async_trait::async_trait;
use dashmap::DashMap;
use std::io::SeekFrom;
use std::sync::Arc;

const COPY_CHUNK: usize = 64 * 1024;

struct CorShared {
    cache: Arc<dyn FileSystem>,
    backend: Arc<dyn FileSystem>,
    /// Directory path → complete listing. Invalidated by mutations.
    dir_cache: DashMap<String, Vec<FileInfo>>,
}

impl CorShared {
    fn invalidate(&self, fs_path: &str) {
        self.dir_cache.remove(fs_path);
    }
}

/// Two-level read-through filesystem.
pub struct CopyOnReadFileSystem {
    shared: Arc<CorShared>,
}

impl CopyOnReadFileSystem {
    pub fn new(cache: Arc<dyn FileSystem>, backend: Arc<dyn FileSystem>) -> Self {
        Self {
            shared: Arc::new(CorShared {
                cache,
                backend,
                dir_cache: DashMap::new(),
            }),
        }
    }
}

/// Create `dir` and any missing ancestors in the cache.
async fn ensure_directory(cache: &Arc<dyn FileSystem>, dir: &str) -> Result<(), FsError> {
    let mut targets = path::ancestors(dir);
    targets.push(dir.to_string());

    for target in targets {
        if cache.stat(&target).await.is_ok() {
            continue;
        }
        match cache.mkdir(&target, 0o755).await {
            Ok(()) | Err(FsError::AlreadyExists(_)) => {}
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

/// Materialize a backend file into the cache. A partial copy is removed so
/// the cache only ever holds consistent snapshots.
async fn copy_to_cache(
    shared: &CorShared,
    fs_path: &str,
    backend_file: &mut Box<dyn FileHandle>,
    info: &FileInfo,
) -> Result<(), FsError> {
    let dir = path::parent(fs_path);
    if dir != "/" {
        ensure_directory(&shared.cache, dir).await?;
    }

    let mut cache_file = shared
        .cache
        .open_file(fs_path, O_WRONLY | O_CREATE | O_TRUNC, info.mode)
        .await?;

    let result = async {
        backend_file.seek(SeekFrom::Start(0)).await?;
        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            let n = backend_file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            cache_file.write(&buf[..n]).await?;
        }
        cache_file.close().await
    }
    .await;

    if let Err(err) = result {
        let _ = shared.cache.remove_all(fs_path).await;
        return Err(err);
    }

    Ok(())
}

#[async_trait]
impl FileSystem for CopyOnReadFileSystem {
    async fn mkdir(&self, fs_path: &str, mode: u32) -> Result<(), FsError> {
        let fs_path = path::normalize(fs_path)?;

        self.shared.backend.mkdir(&fs_path, mode).await?;

        if let Err(err) = self.shared.cache.mkdir(&fs_path, mode).await {
            if !matches!(err, FsError::AlreadyExists(_) | FsError::NotFound(_)) {
                tracing::warn!(path = %fs_path, error = %err, "cache mkdir failed");
            }
        }

        self.shared.invalidate(path::parent(&fs_path));
        Ok(())
    }

    async fn open_file(
        &self,
        fs_path: &str,
        flag: i64,
        mode: u32,
    ) -> Result<Box<dyn FileHandle>, FsError> {
        let fs_path = path::normalize(fs_path)?;

        if is_write(flag) {
            let backend_file = self.shared.backend.open_file(&fs_path, flag, mode).await?;

            // The cache side is best-effort: a failed cache open degrades to
            // mirroring nothing rather than failing the write.
            let cache_file = {
                let parent = path::parent(&fs_path);
                let prepared = if parent == "/" {
                    Ok(())
                } else {
                    ensure_directory(&self.shared.cache, parent).await
                };

                match prepared {
                    Ok(()) => match self.shared.cache.open_file(&fs_path, flag, mode).await {
                        Ok(file) => Some(file),
                        Err(err) => {
                            tracing::warn!(path = %fs_path, error = %err, "cache open failed, writes will not be mirrored");
                            None
                        }
                    },
                    Err(err) => {
                        tracing::warn!(path = %fs_path, error = %err, "cache directory setup failed, writes will not be mirrored");
                        None
                    }
                }
            };

            return Ok(Box::new(WriteThroughHandle {
                shared: self.shared.clone(),
                fs_path,
                backend: backend_file,
                cache: cache_file,
                closed: false,
            }));
        }

        // Read path: cache hit wins.
        if let Ok(file) = self.shared.cache.open_file(&fs_path, flag, mode).await {
            return Ok(Box::new(CorReadHandle {
                shared: self.shared.clone(),
                fs_path,
                inner: file,
                from_cache: true,
                listed: false,
                closed: false,
            }));
        }

        let mut backend_file = self.shared.backend.open_file(&fs_path, flag, mode).await?;

        let info = match backend_file.stat().await {
            Ok(info) => info,
            Err(err) => {
                let _ = backend_file.close().await;
                return Err(err);
            }
        };

        // Directories are served straight from the backend.
        if info.is_dir {
            return Ok(Box::new(CorReadHandle {
                shared: self.shared.clone(),
                fs_path,
                inner: backend_file,
                from_cache: false,
                listed: false,
                closed: false,
            }));
        }

        if let Err(err) = copy_to_cache(&self.shared, &fs_path, &mut backend_file, &info).await {
            tracing::warn!(path = %fs_path, error = %err, "cache materialization failed, serving from backend");
            let _ = backend_file.seek(SeekFrom::Start(0)).await;
            return Ok(Box::new(CorReadHandle {
                shared: self.shared.clone(),
                fs_path,
                inner: backend_file,
                from_cache: false,
                listed: false,
                closed: false,
            }));
        }

        let _ = backend_file.close().await;

        match self.shared.cache.open_file(&fs_path, flag, mode).await {
            Ok(file) => Ok(Box::new(CorReadHandle {
                shared: self.shared.clone(),
                fs_path,
                inner: file,
                from_cache: true,
                listed: false,
                closed: false,
            })),
            Err(_) => {
                let file = self.shared.backend.open_file(&fs_path, flag, mode).await?;
                Ok(Box::new(CorReadHandle {
                    shared: self.shared.clone(),
                    fs_path,
                    inner: file,
                    from_cache: false,
                    listed: false,
                    closed: false,
                }))
            }
        }
    }

    async fn stat(&self, fs_path: &str) -> Result<FileInfo, FsError> {
        let fs_path = path::normalize(fs_path)?;

        if let Ok(info) = self.shared.cache.stat(&fs_path).await {
            return Ok(info);
        }

        let info = self.shared.backend.stat(&fs_path).await?;

        if !info.is_dir {
            // Best-effort backfill, detached from the request so its
            // cancellation cannot abandon a half-copied file.
            let shared = self.shared.clone();
            let target = fs_path.clone();
            let snapshot = info.clone();
            tokio::spawn(async move {
                let mut backend_file =
                    match shared.backend.open_file(&target, O_RDONLY, 0).await {
                        Ok(file) => file,
                        Err(_) => return,
                    };
                if let Err(err) =
                    copy_to_cache(&shared, &target, &mut backend_file, &snapshot).await
                {
                    tracing::debug!(path = %target, error = %err, "async cache backfill failed");
                }
                let _ = backend_file.close().await;
            });
        }

        Ok(info)
    }

    async fn remove_all(&self, fs_path: &str) -> Result<(), FsError> {
        let fs_path = path::normalize(fs_path)?;

        self.shared.backend.remove_all(&fs_path).await?;

        if let Err(err) = self.shared.cache.remove_all(&fs_path).await {
            tracing::warn!(path = %fs_path, error = %err, "cache remove failed");
        }

        self.shared.invalidate(&fs_path);
        self.shared.invalidate(path::parent(&fs_path));
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        let old_path = path::normalize(old_path)?;
        let new_path = path::normalize(new_path)?;

        self.shared.backend.rename(&old_path, &new_path).await?;

        if let Err(err) = self.shared.cache.rename(&old_path, &new_path).await {
            if !matches!(err, FsError::NotFound(_)) {
                tracing::warn!(old = %old_path, new = %new_path, error = %err, "cache rename failed");
            }
        }

        self.shared.invalidate(&old_path);
        self.shared.invalidate(path::parent(&old_path));
        self.shared.invalidate(path::parent(&new_path));
        Ok(())
    }
}

/// Read-side handle, tagged with where it came from.
struct CorReadHandle {
    shared: Arc<CorShared>,
    fs_path: String,
    inner: Box<dyn FileHandle>,
    from_cache: bool,
    /// Whether the listing cursor has advanced (partial listings are never
    /// cached).
    listed: bool,
    closed: bool,
}

#[async_trait]
impl FileHandle for CorReadHandle {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        self.inner.read(buf).await
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
        let n = self.inner.write(buf).await?;
        if !self.from_cache {
            self.shared.invalidate(path::parent(&self.fs_path));
        }
        Ok(n)
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, FsError> {
        self.inner.seek(pos).await
    }

    async fn readdir(&mut self, count: i64) -> Result<Vec<FileInfo>, FsError> {
        if count < 0 && !self.listed {
            self.listed = true;
            if let Some(entries) = self.shared.dir_cache.get(&self.fs_path) {
                return Ok(entries.clone());
            }
            let entries = self.inner.readdir(-1).await?;
            self.shared
                .dir_cache
                .insert(self.fs_path.clone(), entries.clone());
            return Ok(entries);
        }

        self.listed = true;
        self.inner.readdir(count).await
    }

    async fn stat(&mut self) -> Result<FileInfo, FsError> {
        self.inner.stat().await
    }

    async fn close(&mut self) -> Result<(), FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }
        self.closed = true;
        self.inner.close().await
    }
}

/// Write-side handle duplicating every write to backend and cache.
struct WriteThroughHandle {
    shared: Arc<CorShared>,
    fs_path: String,
    backend: Box<dyn FileHandle>,
    cache: Option<Box<dyn FileHandle>>,
    closed: bool,
}

#[async_trait]
impl FileHandle for WriteThroughHandle {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        // Backend for consistency.
        self.backend.read(buf).await
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
        let n = self.backend.write(buf).await?;

        if let Some(cache) = self.cache.as_mut() {
            if let Err(err) = cache.write(&buf[..n]).await {
                tracing::warn!(path = %self.fs_path, error = %err, "cache write failed, disabling mirror");
                self.cache = None;
            }
        }

        Ok(n)
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, FsError> {
        let backend_pos = self.backend.seek(pos).await?;

        if let Some(cache) = self.cache.as_mut() {
            match cache.seek(pos).await {
                Ok(cache_pos) if cache_pos == backend_pos => {}
                // Re-sync the cache to the backend position.
                _ => {
                    if cache.seek(SeekFrom::Start(backend_pos)).await.is_err() {
                        tracing::warn!(path = %self.fs_path, "cache seek failed, disabling mirror");
                        self.cache = None;
                    }
                }
            }
        }

        Ok(backend_pos)
    }

    async fn readdir(&mut self, count: i64) -> Result<Vec<FileInfo>, FsError> {
        let entries = self.backend.readdir(count).await?;
        if count < 0 {
            self.shared
                .dir_cache
                .insert(self.fs_path.clone(), entries.clone());
        }
        Ok(entries)
    }

    async fn stat(&mut self) -> Result<FileInfo, FsError> {
        self.backend.stat().await
    }

    async fn close(&mut self) -> Result<(), FsError> {
        if self.closed {
            return Err(FsError::Closed);
        }
        self.closed = true;

        let cache_result = match self.cache.as_mut() {
            Some(cache) => cache.close().await,
            None => Ok(()),
        };
        let backend_result = self.backend.close().await;

        self.shared.invalidate(path::parent(&self.fs_path));

        // Backend error wins; a cache-side failure only costs the mirror.
        if let Err(err) = backend_result {
            return Err(err);
        }
        if let Err(err) = cache_result {
            tracing::warn!(path = %self.fs_path, error = %err, "cache close failed");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::local::LocalFileSystem;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Wrapper counting open calls, standing in for a backend mock.
    struct CountingFs {
        inner: Arc<dyn FileSystem>,
        opens: AtomicUsize,
    }

    #[async_trait]
    impl FileSystem for CountingFs {
        async fn mkdir(&self, fs_path: &str, mode: u32) -> Result<(), FsError> {
            self.inner.mkdir(fs_path, mode).await
        }

        async fn open_file(
            &self,
            fs_path: &str,
            flag: i64,
            mode: u32,
        ) -> Result<Box<dyn FileHandle>, FsError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.inner.open_file(fs_path, flag, mode).await
        }

        async fn stat(&self, fs_path: &str) -> Result<FileInfo, FsError> {
            self.inner.stat(fs_path).await
        }

        async fn remove_all(&self, fs_path: &str) -> Result<(), FsError> {
            self.inner.remove_all(fs_path).await
        }

        async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), FsError> {
            self.inner.rename(old_path, new_path).await
        }
    }

    struct Fixture {
        _cache_dir: TempDir,
        _backend_dir: TempDir,
        cache: Arc<dyn FileSystem>,
        backend: Arc<CountingFs>,
        fs: CopyOnReadFileSystem,
    }

    fn fixture() -> Fixture {
        let cache_dir = TempDir::new().unwrap();
        let backend_dir = TempDir::new().unwrap();
        let cache: Arc<dyn FileSystem> =
            Arc::new(LocalFileSystem::new(cache_dir.path()).unwrap());
        let backend = Arc::new(CountingFs {
            inner: Arc::new(LocalFileSystem::new(backend_dir.path()).unwrap()),
            opens: AtomicUsize::new(0),
        });
        let fs = CopyOnReadFileSystem::new(cache.clone(), backend.clone());
        Fixture {
            _cache_dir: cache_dir,
            _backend_dir: backend_dir,
            cache,
            backend,
            fs,
        }
    }

    async fn write_through(fs: &CopyOnReadFileSystem, fs_path: &str, data: &[u8]) {
        let mut file = fs
            .open_file(fs_path, O_CREATE | O_WRONLY | O_TRUNC, 0o644)
            .await
            .unwrap();
        file.write(data).await.unwrap();
        file.close().await.unwrap();
    }

    async fn read_all(fs: &dyn FileSystem, fs_path: &str) -> Vec<u8> {
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
    async fn test_write_lands_on_both_sides() {
        let fx = fixture();
        write_through(&fx.fs, "/a.txt", b"payload").await;

        assert_eq!(read_all(fx.backend.inner.as_ref(), "/a.txt").await, b"payload");
        assert_eq!(read_all(fx.cache.as_ref(), "/a.txt").await, b"payload");
    }

    #[tokio::test]
    async fn test_cold_read_materializes_then_serves_from_cache() {
        let fx = fixture();

        // Seed the backend directly, bypassing the compositor.
        {
            let mut file = fx
                .backend
                .inner
                .open_file("/x.txt", O_CREATE | O_WRONLY, 0o644)
                .await
                .unwrap();
            file.write(b"hello").await.unwrap();
            file.close().await.unwrap();
        }

        let baseline = fx.backend.opens.load(Ordering::SeqCst);
        assert_eq!(read_all(&fx.fs, "/x.txt").await, b"hello");
        assert!(fx.backend.opens.load(Ordering::SeqCst) > baseline);

        // Warm read: the backend is not consulted again.
        let warm_baseline = fx.backend.opens.load(Ordering::SeqCst);
        assert_eq!(read_all(&fx.fs, "/x.txt").await, b"hello");
        assert_eq!(fx.backend.opens.load(Ordering::SeqCst), warm_baseline);
    }

    #[tokio::test]
    async fn test_nested_read_creates_cache_parents() {
        let fx = fixture();
        fx.backend.inner.mkdir("/a", 0o755).await.unwrap();
        fx.backend.inner.mkdir("/a/b", 0o755).await.unwrap();
        {
            let mut file = fx
                .backend
                .inner
                .open_file("/a/b/x.txt", O_CREATE | O_WRONLY, 0o644)
                .await
                .unwrap();
            file.write(b"deep").await.unwrap();
            file.close().await.unwrap();
        }

        assert_eq!(read_all(&fx.fs, "/a/b/x.txt").await, b"deep");
        assert_eq!(read_all(fx.cache.as_ref(), "/a/b/x.txt").await, b"deep");
    }

    #[tokio::test]
    async fn test_mutations_apply_to_both_and_invalidate_listings() {
        let fx = fixture();
        fx.fs.mkdir("/docs", 0o755).await.unwrap();
        write_through(&fx.fs, "/docs/a.txt", b"a").await;

        let mut dir = fx.fs.open_file("/docs", O_RDONLY, 0).await.unwrap();
        let entries = dir.readdir(-1).await.unwrap();
        dir.close().await.unwrap();
        assert_eq!(entries.len(), 1);

        fx.fs.remove_all("/docs/a.txt").await.unwrap();

        let mut dir = fx.fs.open_file("/docs", O_RDONLY, 0).await.unwrap();
        let entries = dir.readdir(-1).await.unwrap();
        dir.close().await.unwrap();
        assert!(entries.is_empty());

        assert!(matches!(
            fx.backend.inner.stat("/docs/a.txt").await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            fx.cache.stat("/docs/a.txt").await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stat_falls_back_to_backend() {
        let fx = fixture();
        {
            let mut file = fx
                .backend
                .inner
                .open_file("/y.txt", O_CREATE | O_WRONLY, 0o644)
                .await
                .unwrap();
            file.write(b"12345").await.unwrap();
            file.close().await.unwrap();
        }

        let info = fx.fs.stat("/y.txt").await.unwrap();
        assert_eq!(info.size, 5);
    }

    #[tokio::test]
    async fn test_rename_applies_to_cache() {
        let fx = fixture();
        write_through(&fx.fs, "/old.txt", b"data").await;

        fx.fs.rename("/old.txt", "/new.txt").await.unwrap();

        assert_eq!(read_all(fx.cache.as_ref(), "/new.txt").await, b"data");
        assert!(matches!(
            fx.cache.stat("/old.txt").await,
            Err(FsError::NotFound(_))
        ));
    }
}

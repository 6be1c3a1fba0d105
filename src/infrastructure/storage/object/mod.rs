// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Object-store filesystem adapter.
//!
//! Models a bucket as a tree using `/`-delimited object keys. A directory
//! is materialized by a zero-byte sentinel object `<dir>/.keepdir`;
//! listings strip the sentinel. Streaming uploads buffer writes into part
//! objects under the reserved `.parts/` prefix, which is never listed to
//! callers and cannot be opened through the filesystem interface (see
//! [`upload`]).
//!
//! The wire layer is an [`ObjectStore`]: S3-compatible endpoints via the
//! AWS builder (virtual-hosted vs path-style addressing is a configuration
//! choice), in-memory stores for tests.

mod file;
pub(crate) mod upload;

use crate::domain::fs::{
    FileHandle, FileInfo, FileSystem, FsError, DEFAULT_FILE_MODE, O_APPEND, O_CREATE, O_EXCL,
    O_RDWR, O_TRUNC, O_WRONLY,
};
use crate::domain::path;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjPath;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use file::{ObjectDirHandle, ObjectReadHandle, ObjectWriteHandle};

/// Sentinel object marking an otherwise-empty directory.
pub const KEEP_DIR_FILE: &str = ".keepdir";

/// Reserved prefix holding in-flight upload part objects.
pub const PART_PREFIX: &str = ".parts";

/// Default part buffer size: 10 MiB.
pub const DEFAULT_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// Options for the `s3` filesystem type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectOptions {
    pub endpoint: String,
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    pub user: String,
    pub secret: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub secure: bool,
    /// `dns` for virtual-hosted addressing, `path` for path-style.
    #[serde(default = "default_bucket_lookup")]
    pub bucket_lookup: String,
    /// Part buffer size in bytes for streaming uploads.
    #[serde(default)]
    pub buffer_size: Option<usize>,
}

fn default_bucket_lookup() -> String {
    "path".to_string()
}

/// Bucket-backed filesystem.
pub struct ObjectFileSystem {
    store: Arc<dyn ObjectStore>,
    buffer_size: usize,
}

impl ObjectFileSystem {
    pub fn new(store: Arc<dyn ObjectStore>, buffer_size: usize) -> Self {
        Self {
            store,
            buffer_size: if buffer_size == 0 {
                DEFAULT_BUFFER_SIZE
            } else {
                buffer_size
            },
        }
    }

    /// Build the adapter against an S3-compatible endpoint.
    pub fn from_options(opts: ObjectOptions) -> anyhow::Result<Self> {
        let endpoint = if opts.endpoint.contains("://") {
            opts.endpoint.clone()
        } else if opts.secure {
            format!("https://{}", opts.endpoint)
        } else {
            format!("http://{}", opts.endpoint)
        };

        let virtual_hosted = match opts.bucket_lookup.as_str() {
            "dns" => true,
            "path" => false,
            other => anyhow::bail!(
                "unknown bucket lookup value '{other}', expected 'dns' or 'path'"
            ),
        };

        let mut builder = AmazonS3Builder::new()
            .with_endpoint(endpoint)
            .with_bucket_name(&opts.bucket)
            .with_access_key_id(&opts.user)
            .with_secret_access_key(&opts.secret)
            .with_allow_http(!opts.secure)
            .with_virtual_hosted_style_request(virtual_hosted);

        if !opts.region.is_empty() {
            builder = builder.with_region(&opts.region);
        }
        if let Some(token) = &opts.token {
            builder = builder.with_token(token);
        }

        let store = builder.build()?;

        Ok(Self::new(
            Arc::new(store),
            opts.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
        ))
    }
}

/// Object key for a normalized path: the path without its leading slash.
pub(crate) fn object_key(fs_path: &str) -> ObjPath {
    ObjPath::from(fs_path.trim_start_matches('/'))
}

/// Whether the path falls inside the reserved part prefix.
pub(crate) fn is_reserved(fs_path: &str) -> bool {
    fs_path == "/.parts" || fs_path.starts_with("/.parts/")
}

fn file_info(fs_path: &str, size: u64, mtime: DateTime<Utc>) -> FileInfo {
    FileInfo {
        name: path::base(fs_path).to_string(),
        size,
        mode: DEFAULT_FILE_MODE,
        mtime,
        is_dir: false,
    }
}

/// Stat a path: direct object HEAD first, then the prefix-list directory
/// probe.
pub(crate) async fn stat_path(
    store: &Arc<dyn ObjectStore>,
    fs_path: &str,
) -> Result<FileInfo, FsError> {
    if fs_path == "/" {
        return Ok(FileInfo::directory("/", Utc::now()));
    }

    match store.head(&object_key(fs_path)).await {
        Ok(meta) => Ok(file_info(fs_path, meta.size, meta.last_modified)),
        Err(object_store::Error::NotFound { .. }) => stat_dir(store, fs_path).await,
        Err(err) => {
            tracing::warn!(path = %fs_path, error = %err, "object head failed");
            Err(err.into())
        }
    }
}

/// Directory probe: any object under `<path>/` makes the path a directory
/// whose mtime is the latest of the listed objects.
async fn stat_dir(store: &Arc<dyn ObjectStore>, fs_path: &str) -> Result<FileInfo, FsError> {
    let prefix = object_key(fs_path);
    let mut stream = store.list(Some(&prefix));
    let mut latest: Option<DateTime<Utc>> = None;

    while let Some(meta) = stream.next().await {
        let meta = meta?;
        latest = Some(match latest {
            Some(current) if current >= meta.last_modified => current,
            _ => meta.last_modified,
        });
    }

    match latest {
        Some(mtime) => Ok(FileInfo::directory(path::base(fs_path), mtime)),
        None => Err(FsError::NotFound(fs_path.to_string())),
    }
}

/// Non-recursive listing of a directory. The sentinel and the reserved
/// part prefix never appear in the result.
pub(crate) async fn list_dir(
    store: &Arc<dyn ObjectStore>,
    fs_path: &str,
) -> Result<Vec<FileInfo>, FsError> {
    let prefix = if fs_path == "/" {
        None
    } else {
        Some(object_key(fs_path))
    };

    let listing = store.list_with_delimiter(prefix.as_ref()).await?;
    let mut entries = Vec::new();

    for common_prefix in listing.common_prefixes {
        let Some(name) = common_prefix.filename() else {
            continue;
        };
        if fs_path == "/" && name == PART_PREFIX {
            continue;
        }
        entries.push(FileInfo::directory(name, Utc::now()));
    }

    for meta in listing.objects {
        let Some(name) = meta.location.filename() else {
            continue;
        };
        if name == KEEP_DIR_FILE {
            continue;
        }
        entries.push(file_info(
            &path::join(fs_path, name),
            meta.size,
            meta.last_modified,
        ));
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Every object key under a prefix, sentinel included.
async fn list_keys(
    store: &Arc<dyn ObjectStore>,
    fs_path: &str,
) -> Result<Vec<ObjPath>, FsError> {
    let prefix = if fs_path == "/" {
        None
    } else {
        Some(object_key(fs_path))
    };

    let mut stream = store.list(prefix.as_ref());
    let mut keys = Vec::new();
    while let Some(meta) = stream.next().await {
        keys.push(meta?.location);
    }
    Ok(keys)
}

#[async_trait]
impl FileSystem for ObjectFileSystem {
    async fn mkdir(&self, fs_path: &str, _mode: u32) -> Result<(), FsError> {
        let fs_path = path::normalize(fs_path)?;
        if is_reserved(&fs_path) {
            return Err(FsError::InvalidPath(fs_path));
        }
        if fs_path == "/" {
            return Err(FsError::AlreadyExists(fs_path));
        }

        match stat_path(&self.store, &fs_path).await {
            Ok(_) => return Err(FsError::AlreadyExists(fs_path)),
            Err(FsError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        let parent = path::parent(&fs_path);
        if parent != "/" {
            match stat_path(&self.store, parent).await {
                Ok(info) if info.is_dir => {}
                Ok(_) => return Err(FsError::NotDirectory(parent.to_string())),
                Err(FsError::NotFound(_)) => {
                    return Err(FsError::NotFound(parent.to_string()))
                }
                Err(err) => return Err(err),
            }
        }

        let sentinel = object_key(&path::join(&fs_path, KEEP_DIR_FILE));
        self.store
            .put(&sentinel, object_store::PutPayload::default())
            .await?;

        Ok(())
    }

    async fn open_file(
        &self,
        fs_path: &str,
        flag: i64,
        _mode: u32,
    ) -> Result<Box<dyn FileHandle>, FsError> {
        let fs_path = path::normalize(fs_path)?;
        if is_reserved(&fs_path) {
            return Err(FsError::NotFound(fs_path));
        }

        if flag & O_APPEND != 0 {
            return Err(FsError::NotSupported(
                "append is not supported on object stores".to_string(),
            ));
        }

        let writing = flag & (O_WRONLY | O_RDWR | O_CREATE | O_TRUNC) != 0;

        if writing {
            match stat_path(&self.store, &fs_path).await {
                Ok(info) if info.is_dir => return Err(FsError::IsDirectory(fs_path)),
                Ok(_) => {
                    if flag & O_CREATE != 0 && flag & O_EXCL != 0 {
                        return Err(FsError::AlreadyExists(fs_path));
                    }
                }
                Err(FsError::NotFound(_)) => {
                    if flag & O_CREATE == 0 {
                        return Err(FsError::NotFound(fs_path));
                    }
                }
                Err(err) => return Err(err),
            }

            return Ok(Box::new(ObjectWriteHandle::new(
                self.store.clone(),
                fs_path,
                self.buffer_size,
            )));
        }

        let info = stat_path(&self.store, &fs_path).await?;
        if info.is_dir {
            return Ok(Box::new(ObjectDirHandle::new(self.store.clone(), fs_path)));
        }

        Ok(Box::new(ObjectReadHandle::new(
            self.store.clone(),
            fs_path,
            info.size,
        )))
    }

    async fn stat(&self, fs_path: &str) -> Result<FileInfo, FsError> {
        let fs_path = path::normalize(fs_path)?;
        if is_reserved(&fs_path) {
            return Err(FsError::NotFound(fs_path));
        }
        stat_path(&self.store, &fs_path).await
    }

    async fn remove_all(&self, fs_path: &str) -> Result<(), FsError> {
        let fs_path = path::normalize(fs_path)?;
        if is_reserved(&fs_path) {
            return Ok(());
        }

        let info = match stat_path(&self.store, &fs_path).await {
            Ok(info) => info,
            Err(FsError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };

        if info.is_dir {
            for key in list_keys(&self.store, &fs_path).await? {
                self.store.delete(&key).await?;
            }
        } else {
            self.store.delete(&object_key(&fs_path)).await?;
        }

        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        let old_path = path::normalize(old_path)?;
        let new_path = path::normalize(new_path)?;
        if is_reserved(&old_path) || is_reserved(&new_path) {
            return Err(FsError::NotFound(old_path));
        }

        let info = match stat_path(&self.store, &old_path).await {
            Ok(info) => info,
            Err(FsError::NotFound(_)) => return Err(FsError::NotFound(old_path)),
            Err(err) => return Err(err),
        };

        if info.is_dir {
            // Copy-then-delete for each entry under the old prefix.
            let old_prefix = format!("{}/", object_key(&old_path));
            for key in list_keys(&self.store, &old_path).await? {
                let key_str = key.to_string();
                let Some(suffix) = key_str.strip_prefix(&old_prefix) else {
                    continue;
                };
                let target = object_key(&path::join(&new_path, suffix));
                self.store.copy(&key, &target).await?;
                self.store.delete(&key).await?;
            }
            return Ok(());
        }

        let src = object_key(&old_path);
        let dst = object_key(&new_path);
        self.store.copy(&src, &dst).await?;
        self.store.delete(&src).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fs::O_RDONLY;
    use object_store::memory::InMemory;

    fn memory_fs(buffer_size: usize) -> ObjectFileSystem {
        ObjectFileSystem::new(Arc::new(InMemory::new()), buffer_size)
    }

    async fn write_file(fs: &ObjectFileSystem, fs_path: &str, data: &[u8]) {
        let mut file = fs
            .open_file(fs_path, O_CREATE | O_WRONLY | O_TRUNC, 0o644)
            .await
            .unwrap();
        file.write(data).await.unwrap();
        file.close().await.unwrap();
    }

    async fn read_file(fs: &ObjectFileSystem, fs_path: &str) -> Vec<u8> {
        let mut file = fs.open_file(fs_path, O_RDONLY, 0).await.unwrap();
        let mut out = Vec::new();
        let mut buf = vec![0u8; 8 * 1024];
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
    async fn test_mkdir_creates_sentinel_and_stat_sees_directory() {
        let fs = memory_fs(0);

        fs.mkdir("/docs", 0o755).await.unwrap();

        let info = fs.stat("/docs").await.unwrap();
        assert!(info.is_dir);
        assert_eq!(info.size, 0);

        // The sentinel never shows up in listings.
        let mut dir = fs.open_file("/docs", O_RDONLY, 0).await.unwrap();
        let entries = dir.readdir(-1).await.unwrap();
        assert!(entries.is_empty());
        dir.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_mkdir_existing_fails() {
        let fs = memory_fs(0);
        fs.mkdir("/docs", 0o755).await.unwrap();
        assert!(matches!(
            fs.mkdir("/docs", 0o755).await,
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_mkdir_missing_parent_fails() {
        let fs = memory_fs(0);
        assert!(matches!(
            fs.mkdir("/a/b", 0o755).await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_append_not_supported() {
        let fs = memory_fs(0);
        let result = fs.open_file("/f", O_WRONLY | O_APPEND, 0o644).await;
        assert!(matches!(result, Err(FsError::NotSupported(_))));
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let fs = memory_fs(0);
        write_file(&fs, "/a.bin", b"streaming payload").await;

        assert_eq!(fs.stat("/a.bin").await.unwrap().size, 17);
        assert_eq!(read_file(&fs, "/a.bin").await, b"streaming payload");
    }

    #[tokio::test]
    async fn test_multi_part_upload_composes_and_cleans_parts() {
        // Buffer of 4 bytes forces multiple FLUSH_PART transitions.
        let fs = memory_fs(4);
        let payload: Vec<u8> = (0u8..=25).collect();
        write_file(&fs, "/big.bin", &payload).await;

        assert_eq!(read_file(&fs, "/big.bin").await, payload);

        // No leaked part objects.
        let store = fs.store.clone();
        let mut stream = store.list(Some(&ObjPath::from(PART_PREFIX)));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_zero_byte_create_publishes_empty_object() {
        let fs = memory_fs(0);
        let mut file = fs.open_file("/empty", O_CREATE | O_WRONLY, 0o644).await.unwrap();
        file.close().await.unwrap();

        let info = fs.stat("/empty").await.unwrap();
        assert_eq!(info.size, 0);
        assert!(!info.is_dir);
    }

    #[tokio::test]
    async fn test_excl_create_on_existing_fails() {
        let fs = memory_fs(0);
        write_file(&fs, "/a", b"x").await;
        let result = fs.open_file("/a", O_CREATE | O_EXCL | O_WRONLY, 0o644).await;
        assert!(matches!(result, Err(FsError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_stat_directory_from_deep_object() {
        let fs = memory_fs(0);
        fs.mkdir("/a", 0o755).await.unwrap();
        fs.mkdir("/a/b", 0o755).await.unwrap();
        write_file(&fs, "/a/b/c.txt", b"deep").await;

        assert!(fs.stat("/a").await.unwrap().is_dir);
        assert!(fs.stat("/a/b").await.unwrap().is_dir);
    }

    #[tokio::test]
    async fn test_readdir_skips_parts_and_sentinel() {
        let fs = memory_fs(4);
        fs.mkdir("/sub", 0o755).await.unwrap();
        write_file(&fs, "/top.txt", b"0123456789").await;

        let mut root = fs.open_file("/", O_RDONLY, 0).await.unwrap();
        let entries = root.readdir(-1).await.unwrap();
        root.close().await.unwrap();

        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["sub", "top.txt"]);
    }

    #[tokio::test]
    async fn test_remove_all_recursive() {
        let fs = memory_fs(0);
        fs.mkdir("/a", 0o755).await.unwrap();
        fs.mkdir("/a/b", 0o755).await.unwrap();
        write_file(&fs, "/a/b/c.txt", b"x").await;

        fs.remove_all("/a").await.unwrap();

        assert!(matches!(fs.stat("/a").await, Err(FsError::NotFound(_))));
        assert!(matches!(fs.stat("/a/b/c.txt").await, Err(FsError::NotFound(_))));

        // Removing a missing path is not an error.
        fs.remove_all("/a").await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_file() {
        let fs = memory_fs(0);
        write_file(&fs, "/old.txt", b"content").await;

        fs.rename("/old.txt", "/new.txt").await.unwrap();

        assert!(matches!(fs.stat("/old.txt").await, Err(FsError::NotFound(_))));
        assert_eq!(read_file(&fs, "/new.txt").await, b"content");
    }

    #[tokio::test]
    async fn test_rename_directory_moves_entries() {
        let fs = memory_fs(0);
        fs.mkdir("/src", 0o755).await.unwrap();
        write_file(&fs, "/src/f.txt", b"moved").await;

        fs.rename("/src", "/dst").await.unwrap();

        assert!(matches!(fs.stat("/src").await, Err(FsError::NotFound(_))));
        assert!(fs.stat("/dst").await.unwrap().is_dir);
        assert_eq!(read_file(&fs, "/dst/f.txt").await, b"moved");
    }

    #[tokio::test]
    async fn test_reserved_prefix_is_invisible() {
        let fs = memory_fs(0);
        assert!(matches!(
            fs.stat("/.parts/x/0").await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            fs.open_file("/.parts/x/0", O_RDONLY, 0).await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_seek_reissues_ranged_read() {
        let fs = memory_fs(0);
        write_file(&fs, "/a.bin", b"0123456789").await;

        let mut file = fs.open_file("/a.bin", O_RDONLY, 0).await.unwrap();
        let pos = file.seek(std::io::SeekFrom::Start(4)).await.unwrap();
        assert_eq!(pos, 4);

        let mut buf = [0u8; 3];
        let n = file.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"456");

        let pos = file.seek(std::io::SeekFrom::End(-2)).await.unwrap();
        assert_eq!(pos, 8);
        let n = file.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"89");

        file.close().await.unwrap();
    }
}

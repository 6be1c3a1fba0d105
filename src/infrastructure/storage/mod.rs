// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Storage adapters, decorators, and the filesystem type registry.
//!
//! The registry maps a string tag (`local`, `s3`, `sqlite`, `cor`,
//! `capped`, `logged`) to a constructor taking an opaque options bag.
//! Decorator constructors carry nested `{type, options}` entries and build
//! their wrapped filesystems through the same factory, so arbitrary
//! layering can be declared in configuration:
//!
//! ```json
//! {
//!   "type": "capped",
//!   "options": {
//!     "maxSize": 1073741824,
//!     "backend": {
//!       "type": "cor",
//!       "options": {
//!         "cache": { "type": "local", "options": { "dir": "/var/cache/dav" } },
//!         "backend": { "type": "s3", "options": { "endpoint": "…", "bucket": "…" } }
//!       }
//!     }
//!   }
//! }
//! ```

pub mod blobdb;
pub mod capped;
pub mod cor;
pub mod local;
pub mod logged;
pub mod object;

use crate::domain::fs::FileSystem;
use anyhow::Context;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Once, RwLock};

/// A filesystem declaration: a registered type tag plus its options bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

/// Constructor registered for a type tag.
pub type Constructor = Box<
    dyn Fn(serde_json::Value) -> BoxFuture<'static, anyhow::Result<Arc<dyn FileSystem>>>
        + Send
        + Sync,
>;

static REGISTRY: Lazy<RwLock<HashMap<String, Constructor>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static BUILTINS: Once = Once::new();

/// Register a constructor under a type tag. Safe to call from multiple
/// initializers; the last registration for a tag wins.
pub fn register(tag: &str, constructor: Constructor) {
    REGISTRY
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(tag.to_string(), constructor);
}

/// Registered type tags, sorted.
pub fn registered() -> Vec<String> {
    ensure_builtins();
    let mut tags: Vec<String> = REGISTRY
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .keys()
        .cloned()
        .collect();
    tags.sort();
    tags
}

/// Build a filesystem from a registered type tag and its options.
pub async fn create(tag: &str, options: serde_json::Value) -> anyhow::Result<Arc<dyn FileSystem>> {
    ensure_builtins();

    let future = {
        let registry = REGISTRY
            .read()
            .unwrap_or_else(|e| e.into_inner());
        registry.get(tag).map(|constructor| constructor(options))
    };

    match future {
        Some(future) => future.await,
        None => anyhow::bail!(
            "unknown filesystem type '{tag}', expected one of {:?}",
            registered()
        ),
    }
}

/// Build a filesystem from an `FsConfig` declaration.
pub async fn create_from_config(config: &FsConfig) -> anyhow::Result<Arc<dyn FileSystem>> {
    create(&config.fs_type, config.options.clone()).await
}

fn ensure_builtins() {
    BUILTINS.call_once(|| {
        register(
            "local",
            Box::new(|options| {
                Box::pin(async move {
                    let opts: local::LocalOptions = serde_json::from_value(options)
                        .context("could not parse 'local' filesystem options")?;
                    let fs = local::LocalFileSystem::new(opts.dir)?;
                    Ok(Arc::new(fs) as Arc<dyn FileSystem>)
                })
            }),
        );

        register(
            "s3",
            Box::new(|options| {
                Box::pin(async move {
                    let opts: object::ObjectOptions = serde_json::from_value(options)
                        .context("could not parse 's3' filesystem options")?;
                    let fs = object::ObjectFileSystem::from_options(opts)?;
                    Ok(Arc::new(fs) as Arc<dyn FileSystem>)
                })
            }),
        );

        register(
            "sqlite",
            Box::new(|options| {
                Box::pin(async move {
                    let opts: blobdb::BlobDbOptions = serde_json::from_value(options)
                        .context("could not parse 'sqlite' filesystem options")?;
                    let fs = blobdb::BlobDbFileSystem::connect(&opts.path).await?;
                    Ok(Arc::new(fs) as Arc<dyn FileSystem>)
                })
            }),
        );

        register(
            "cor",
            Box::new(|options| {
                Box::pin(async move {
                    #[derive(Deserialize)]
                    struct CorOptions {
                        cache: FsConfig,
                        backend: FsConfig,
                    }

                    let opts: CorOptions = serde_json::from_value(options)
                        .context("could not parse 'cor' filesystem options")?;
                    let cache = create_from_config(&opts.cache)
                        .await
                        .with_context(|| {
                            format!("could not create cache filesystem '{}'", opts.cache.fs_type)
                        })?;
                    let backend = create_from_config(&opts.backend)
                        .await
                        .with_context(|| {
                            format!(
                                "could not create backend filesystem '{}'",
                                opts.backend.fs_type
                            )
                        })?;
                    Ok(Arc::new(cor::CopyOnReadFileSystem::new(cache, backend))
                        as Arc<dyn FileSystem>)
                })
            }),
        );

        register(
            "capped",
            Box::new(|options| {
                Box::pin(async move {
                    #[derive(Deserialize)]
                    #[serde(rename_all = "camelCase")]
                    struct CappedOptions {
                        max_size: u64,
                        backend: FsConfig,
                    }

                    let opts: CappedOptions = serde_json::from_value(options)
                        .context("could not parse 'capped' filesystem options")?;
                    let backend = create_from_config(&opts.backend)
                        .await
                        .with_context(|| {
                            format!(
                                "could not create backend filesystem '{}'",
                                opts.backend.fs_type
                            )
                        })?;
                    Ok(Arc::new(capped::CappedFileSystem::new(backend, opts.max_size))
                        as Arc<dyn FileSystem>)
                })
            }),
        );

        register(
            "logged",
            Box::new(|options| {
                Box::pin(async move {
                    #[derive(Deserialize)]
                    struct LoggedOptions {
                        backend: FsConfig,
                    }

                    let opts: LoggedOptions = serde_json::from_value(options)
                        .context("could not parse 'logged' filesystem options")?;
                    let backend = create_from_config(&opts.backend)
                        .await
                        .with_context(|| {
                            format!(
                                "could not create backend filesystem '{}'",
                                opts.backend.fs_type
                            )
                        })?;
                    Ok(Arc::new(logged::LoggedFileSystem::new(backend)) as Arc<dyn FileSystem>)
                })
            }),
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_unknown_type_is_an_error() {
        let result = create("bogus", serde_json::Value::Null).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_registered_lists_builtins() {
        let tags = registered();
        for tag in ["local", "s3", "sqlite", "cor", "capped", "logged"] {
            assert!(tags.iter().any(|t| t == tag), "missing tag '{tag}'");
        }
    }

    #[tokio::test]
    async fn test_create_local_from_options() {
        let dir = TempDir::new().unwrap();
        let fs = create("local", json!({ "dir": dir.path() })).await.unwrap();
        fs.mkdir("/sub", 0o755).await.unwrap();
        assert!(fs.stat("/sub").await.unwrap().is_dir);
    }

    #[tokio::test]
    async fn test_recursive_composition_from_config() {
        let cache_dir = TempDir::new().unwrap();
        let backend_dir = TempDir::new().unwrap();

        let config: FsConfig = serde_json::from_value(json!({
            "type": "capped",
            "options": {
                "maxSize": 1000000,
                "backend": {
                    "type": "cor",
                    "options": {
                        "cache": { "type": "local", "options": { "dir": cache_dir.path() } },
                        "backend": { "type": "local", "options": { "dir": backend_dir.path() } }
                    }
                }
            }
        }))
        .unwrap();

        let fs = create_from_config(&config).await.unwrap();
        fs.mkdir("/nested", 0o755).await.unwrap();
        assert!(fs.stat("/nested").await.unwrap().is_dir);
    }

    #[tokio::test]
    async fn test_sqlite_memory_from_config() {
        let fs = create("sqlite", json!({ "path": ":memory:" })).await.unwrap();
        assert!(fs.stat("/").await.unwrap().is_dir);
    }
}

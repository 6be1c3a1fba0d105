// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Path normalization for the virtual filesystem namespace.
//!
//! Every path crossing a [`FileSystem`](crate::domain::fs::FileSystem)
//! boundary is normalized here first: absolute, `/`-separated, no `.`
//! segments, no empty segments, no trailing slash except the root `/`.
//! Two paths are equal iff their normalized forms are identical.
//!
//! `..` segments and NUL bytes are rejected outright rather than resolved,
//! preventing traversal out of the namespace.

use crate::domain::fs::FsError;

/// Maximum accepted path length in bytes.
const MAX_PATH_LEN: usize = 4096;

/// Normalize a path into its canonical absolute form.
///
/// Relative paths are interpreted from the root. Returns
/// [`FsError::InvalidPath`] for traversal attempts (`..`), embedded NUL
/// bytes, or overlong paths.
///
/// # Examples
///
/// ```
/// use davstack::domain::path::normalize;
///
/// assert_eq!(normalize("/a//b/./c/").unwrap(), "/a/b/c");
/// assert_eq!(normalize("").unwrap(), "/");
/// assert!(normalize("/a/../b").is_err());
/// ```
pub fn normalize(path: &str) -> Result<String, FsError> {
    if path.len() > MAX_PATH_LEN {
        return Err(FsError::InvalidPath(format!(
            "path exceeds {} bytes",
            MAX_PATH_LEN
        )));
    }

    if path.contains('\0') {
        return Err(FsError::InvalidPath("path contains NUL byte".to_string()));
    }

    let mut normalized = String::with_capacity(path.len() + 1);

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                tracing::warn!(path = %path, "path traversal attempt rejected");
                return Err(FsError::InvalidPath(format!(
                    "path contains '..' segment: {path}"
                )));
            }
            name => {
                normalized.push('/');
                normalized.push_str(name);
            }
        }
    }

    if normalized.is_empty() {
        normalized.push('/');
    }

    Ok(normalized)
}

/// Parent directory of a normalized path. The parent of `/` is `/`.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Final segment of a normalized path. The base of `/` is `/`.
pub fn base(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) if idx + 1 < path.len() => &path[idx + 1..],
        _ => "/",
    }
}

/// Join a normalized directory path with a child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Ancestors of a normalized path from the root down, excluding the root
/// and the path itself: `/a/b/c` yields `/a`, `/a/b`.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return out;
    }
    for segment in &segments[..segments.len() - 1] {
        current.push('/');
        current.push_str(segment);
        out.push(current.clone());
    }
    out
}

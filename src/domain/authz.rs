// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Rule-gated filesystem wrapper.
//!
//! Core security boundary for all file operations. Wraps any
//! [`FileSystem`] and gates every entry point through the caller's rule
//! set: personal rules first, then every rule of every group the caller
//! belongs to. Admin identities implicitly carry an always-allow rule
//! ahead of the set. Evaluation short-circuits on the first rule returning
//! `true`; if no rule matches, the operation is denied with
//! [`FsError::PermissionDenied`].
//!
//! The caller identity is read from the ambient task scope (see
//! [`crate::domain::identity`]). A missing identity is a programming error
//! in the transport and fails closed.
//!
//! File-handle operations (`read`, `write`, `readdir`, `seek`, `stat`,
//! `close`) are not re-checked beyond the gating performed at `open_file`
//! and `stat`.

use crate::domain::fs::{FileHandle, FileInfo, FileSystem, FsError};
use crate::domain::identity::{self, CallerIdentity};
use crate::domain::path;
use crate::domain::policy::{
    PolicyEnv, OP_MKDIR, OP_OPEN, OP_REMOVE, OP_RENAME, OP_STAT,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Authorization wrapper over an inner filesystem.
pub struct AuthzFileSystem {
    inner: Arc<dyn FileSystem>,
}

impl AuthzFileSystem {
    pub fn new(inner: Arc<dyn FileSystem>) -> Self {
        Self { inner }
    }

    /// Evaluate the ambient identity's rules against an operation.
    ///
    /// Public so the transport can gate operations the filesystem contract
    /// does not carry directly (for example `OP_READDIR` on `PROPFIND`).
    pub fn authorize(&self, operation: i64, fs_path: &str, flag: i64, mode: u32) -> Result<(), FsError> {
        let user = identity::current().ok_or_else(|| {
            tracing::error!(
                path = %fs_path,
                "no caller identity in scope, denying"
            );
            FsError::PermissionDenied("no caller identity".to_string())
        })?;

        let env = PolicyEnv {
            operation,
            path: fs_path.to_string(),
            flag,
            mode: i64::from(mode),
            subject: user.subject().to_string(),
            provider: user.provider().to_string(),
            groups: user.group_names(),
        };

        if Self::evaluate(&user, &env) {
            return Ok(());
        }

        tracing::debug!(
            subject = %user.subject(),
            operation,
            path = %fs_path,
            "operation denied by policy"
        );

        Err(FsError::PermissionDenied(fs_path.to_string()))
    }

    fn evaluate(user: &CallerIdentity, env: &PolicyEnv) -> bool {
        if user.is_admin() {
            return true;
        }

        let group_rules = user.groups().iter().flat_map(|g| g.rules().iter());

        for rule in user.rules().iter().chain(group_rules) {
            match rule.evaluate(env) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => {
                    // A failing rule is a deny on that rule only; the rest
                    // of the set still gets a chance to allow.
                    tracing::warn!(
                        subject = %user.subject(),
                        rule = %rule,
                        error = %err,
                        "rule evaluation failed"
                    );
                }
            }
        }

        false
    }
}

#[async_trait]
impl FileSystem for AuthzFileSystem {
    async fn mkdir(&self, fs_path: &str, mode: u32) -> Result<(), FsError> {
        let fs_path = path::normalize(fs_path)?;
        self.authorize(OP_MKDIR, &fs_path, 0, mode)?;
        self.inner.mkdir(&fs_path, mode).await
    }

    async fn open_file(
        &self,
        fs_path: &str,
        flag: i64,
        mode: u32,
    ) -> Result<Box<dyn FileHandle>, FsError> {
        let fs_path = path::normalize(fs_path)?;
        self.authorize(OP_OPEN, &fs_path, flag, mode)?;
        self.inner.open_file(&fs_path, flag, mode).await
    }

    async fn stat(&self, fs_path: &str) -> Result<FileInfo, FsError> {
        let fs_path = path::normalize(fs_path)?;
        self.authorize(OP_STAT, &fs_path, 0, 0)?;
        self.inner.stat(&fs_path).await
    }

    async fn remove_all(&self, fs_path: &str) -> Result<(), FsError> {
        let fs_path = path::normalize(fs_path)?;
        self.authorize(OP_REMOVE, &fs_path, 0, 0)?;
        self.inner.remove_all(&fs_path).await
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        let old_path = path::normalize(old_path)?;
        let new_path = path::normalize(new_path)?;
        // Both ends of the move are gated.
        self.authorize(OP_RENAME, &old_path, 0, 0)?;
        self.authorize(OP_RENAME, &new_path, 0, 0)?;
        self.inner.rename(&old_path, &new_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::identity::{scope, Group, Rule, RuleError};
    use crate::domain::fs::{O_CREATE, O_RDONLY, O_WRONLY};
    use crate::infrastructure::storage::local::LocalFileSystem;
    use std::fmt;
    use tempfile::TempDir;

    struct OpRule(i64);

    impl fmt::Display for OpRule {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "operation == {}", self.0)
        }
    }

    impl Rule for OpRule {
        fn evaluate(&self, env: &PolicyEnv) -> Result<bool, RuleError> {
            Ok(env.operation == self.0)
        }
    }

    fn stack(dir: &TempDir) -> AuthzFileSystem {
        let local = LocalFileSystem::new(dir.path()).unwrap();
        AuthzFileSystem::new(Arc::new(local))
    }

    fn user_with_rule(rule: impl Rule + 'static) -> Arc<CallerIdentity> {
        Arc::new(CallerIdentity::new(
            "tester",
            "local",
            vec![],
            vec![Arc::new(rule)],
            false,
        ))
    }

    #[tokio::test]
    async fn test_no_identity_fails_closed() {
        let dir = TempDir::new().unwrap();
        let fs = stack(&dir);

        let result = fs.stat("/").await;
        assert!(matches!(result, Err(FsError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_stat_only_rule() {
        let dir = TempDir::new().unwrap();
        let fs = stack(&dir);
        let user = user_with_rule(OpRule(OP_STAT));

        scope(user, async {
            assert!(fs.stat("/").await.is_ok());

            let denied = fs.open_file("/f.txt", O_RDONLY, 0).await;
            assert!(matches!(denied, Err(FsError::PermissionDenied(_))));
        })
        .await;
    }

    #[tokio::test]
    async fn test_admin_allows_everything() {
        let dir = TempDir::new().unwrap();
        let fs = stack(&dir);
        let admin = Arc::new(CallerIdentity::new("root", "local", vec![], vec![], true));

        scope(admin, async {
            fs.mkdir("/sub", 0o755).await.unwrap();
            let mut file = fs
                .open_file("/sub/a.txt", O_CREATE | O_WRONLY, 0o644)
                .await
                .unwrap();
            file.write(b"hello").await.unwrap();
            file.close().await.unwrap();
            fs.rename("/sub/a.txt", "/sub/b.txt").await.unwrap();
            assert!(fs.stat("/sub/b.txt").await.is_ok());
            fs.remove_all("/sub").await.unwrap();
        })
        .await;
    }

    #[tokio::test]
    async fn test_group_rules_are_consulted() {
        let dir = TempDir::new().unwrap();
        let fs = stack(&dir);
        let group = Arc::new(Group::new("statters", vec![Arc::new(OpRule(OP_STAT)) as Arc<dyn Rule>]));
        let user = Arc::new(CallerIdentity::new(
            "tester",
            "local",
            vec![group],
            vec![],
            false,
        ));

        scope(user, async {
            assert!(fs.stat("/").await.is_ok());
            assert!(matches!(
                fs.mkdir("/sub", 0o755).await,
                Err(FsError::PermissionDenied(_))
            ));
        })
        .await;
    }
}

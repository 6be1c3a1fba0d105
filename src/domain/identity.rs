// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Caller identity and authorization rules.
//!
//! The authenticated principal is a [`CallerIdentity`]: subject, provider,
//! group memberships (each carrying rules), personal rules and an admin
//! flag. The identity travels with the request through a tokio task-local
//! scope: the transport wraps request handling in [`scope`], and the
//! authorization wrapper reads it back with [`current`]. Absence of an
//! identity inside the wrapper is a programming error and fails closed.

use crate::domain::policy::PolicyEnv;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Rule evaluation errors.
#[derive(Debug, Error)]
pub enum RuleError {
    /// The rule script failed to compile. The rule is a permanent deny.
    #[error("rule compile error: {0}")]
    Compile(String),

    #[error("rule evaluation error: {0}")]
    Eval(String),

    /// The rule program returned a non-boolean result.
    #[error("rule returned non-boolean result")]
    NotBoolean,
}

/// A boolean expression over the policy environment. Returning `true`
/// authorizes the operation. Evaluation must be read-only and re-entrant.
pub trait Rule: Send + Sync + fmt::Display {
    fn evaluate(&self, env: &PolicyEnv) -> Result<bool, RuleError>;
}

/// A named group carrying its own rule set.
pub struct Group {
    name: String,
    rules: Vec<Arc<dyn Rule>>,
}

impl Group {
    pub fn new(name: impl Into<String>, rules: Vec<Arc<dyn Rule>>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rules(&self) -> &[Arc<dyn Rule>] {
        &self.rules
    }
}

/// The authenticated principal bound to a request context.
pub struct CallerIdentity {
    subject: String,
    provider: String,
    groups: Vec<Arc<Group>>,
    rules: Vec<Arc<dyn Rule>>,
    is_admin: bool,
}

impl CallerIdentity {
    pub fn new(
        subject: impl Into<String>,
        provider: impl Into<String>,
        groups: Vec<Arc<Group>>,
        rules: Vec<Arc<dyn Rule>>,
        is_admin: bool,
    ) -> Self {
        Self {
            subject: subject.into(),
            provider: provider.into(),
            groups,
            rules,
            is_admin,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn groups(&self) -> &[Arc<Group>] {
        &self.groups
    }

    pub fn rules(&self) -> &[Arc<dyn Rule>] {
        &self.rules
    }

    /// Admin identities implicitly carry an always-allow rule ahead of the
    /// evaluated set.
    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.name().to_string()).collect()
    }
}

impl fmt::Debug for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallerIdentity")
            .field("subject", &self.subject)
            .field("provider", &self.provider)
            .field("groups", &self.group_names())
            .field("is_admin", &self.is_admin)
            .finish()
    }
}

tokio::task_local! {
    static CURRENT_IDENTITY: Arc<CallerIdentity>;
}

/// Run `fut` with `identity` as the ambient caller identity.
pub async fn scope<F>(identity: Arc<CallerIdentity>, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT_IDENTITY.scope(identity, fut).await
}

/// The ambient caller identity, if one is in scope.
pub fn current() -> Option<Arc<CallerIdentity>> {
    CURRENT_IDENTITY.try_with(Arc::clone).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysTrue;

    impl fmt::Display for AlwaysTrue {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "true")
        }
    }

    impl Rule for AlwaysTrue {
        fn evaluate(&self, _env: &PolicyEnv) -> Result<bool, RuleError> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_identity_scope() {
        assert!(current().is_none());

        let identity = Arc::new(CallerIdentity::new(
            "alice",
            "local",
            vec![Arc::new(Group::new("readers", vec![Arc::new(AlwaysTrue)]))],
            vec![],
            false,
        ));

        scope(identity, async {
            let found = current().expect("identity should be in scope");
            assert_eq!(found.subject(), "alice");
            assert_eq!(found.group_names(), vec!["readers"]);
        })
        .await;

        assert!(current().is_none());
    }
}

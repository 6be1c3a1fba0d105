// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Assembly of identities and filesystem stacks from configuration.

use crate::domain::identity::{CallerIdentity, Group, Rule};
use crate::domain::fs::FileSystem;
use crate::infrastructure::policy_engine::ExprRule;
use crate::infrastructure::storage::{self, FsConfig};
use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Declarative group: a name and its rule scripts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<String>,
}

/// Declarative user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default)]
    pub admin: bool,
}

/// Authorization section of the gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

fn compile_rules(scripts: &[String]) -> Vec<Arc<dyn Rule>> {
    scripts
        .iter()
        .map(|script| Arc::new(ExprRule::new(script.clone())) as Arc<dyn Rule>)
        .collect()
}

/// Build identities from configuration.
///
/// Groups are constructed first; a user referencing a group name that does
/// not exist is a fatal error.
pub fn create_users_from_config(config: &AuthConfig) -> anyhow::Result<Vec<Arc<CallerIdentity>>> {
    let groups: Vec<Arc<Group>> = config
        .groups
        .iter()
        .map(|g| Arc::new(Group::new(g.name.clone(), compile_rules(&g.rules))))
        .collect();

    let mut users = Vec::with_capacity(config.users.len());

    for user in &config.users {
        let mut user_groups = Vec::with_capacity(user.groups.len());
        for name in &user.groups {
            match groups.iter().find(|g| g.name() == name.as_str()) {
                Some(group) => user_groups.push(group.clone()),
                None => bail!(
                    "could not find group '{}' referenced by user '{}'",
                    name,
                    user.name
                ),
            }
        }

        users.push(Arc::new(CallerIdentity::new(
            user.name.clone(),
            user.provider.clone().unwrap_or_else(|| "local".to_string()),
            user_groups,
            compile_rules(&user.rules),
            user.admin,
        )));
    }

    Ok(users)
}

/// Build the configured filesystem stack.
pub async fn create_filesystem_from_config(
    config: &FsConfig,
) -> anyhow::Result<Arc<dyn FileSystem>> {
    storage::create_from_config(config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: serde_json::Value) -> AuthConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_users_and_groups_from_config() {
        let auth = config(json!({
            "groups": [
                { "name": "readers", "rules": ["bitand(flag, O_WRITE) == 0"] }
            ],
            "users": [
                { "name": "alice", "groups": ["readers"], "rules": ["operation == OP_STAT"] },
                { "name": "root", "admin": true }
            ]
        }));

        let users = create_users_from_config(&auth).unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].subject(), "alice");
        assert_eq!(users[0].group_names(), vec!["readers"]);
        assert_eq!(users[0].rules().len(), 1);
        assert!(users[1].is_admin());
    }

    #[test]
    fn test_unknown_group_reference_is_fatal() {
        let auth = config(json!({
            "groups": [],
            "users": [
                { "name": "bob", "groups": ["ghosts"] }
            ]
        }));

        let err = create_users_from_config(&auth).unwrap_err();
        assert!(err.to_string().contains("ghosts"));
        assert!(err.to_string().contains("bob"));
    }
}

//! Operator access control for catalog edits and manual overrides.
//!
//! Roles form an inheritance chain through `parent_role_id`; a role holds
//! its own permissions plus everything its ancestors hold.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Edit levels and move the default flag
pub const PERM_LEVELS_WRITE: &str = "levels:write";
/// Force an agent onto a level or reset it to the default
pub const PERM_LEVELS_OVERRIDE: &str = "levels:override";
/// Grants every permission
pub const PERM_ALL: &str = "*";

/// Answers whether an operator may perform a privileged call
pub trait PermissionChecker: Send + Sync {
    fn has_permission(&self, user_id: &str, permission_code: &str) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parent_role_id: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Role graph plus user bindings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RbacConfig {
    #[serde(default)]
    pub roles: Vec<Role>,
    /// user id -> role ids
    #[serde(default)]
    pub users: HashMap<String, Vec<String>>,
}

pub struct RoleResolver {
    roles: HashMap<String, Role>,
    users: HashMap<String, Vec<String>>,
}

impl RoleResolver {
    pub fn new(config: RbacConfig) -> Self {
        let roles = config.roles.into_iter().map(|r| (r.id.clone(), r)).collect();
        Self {
            roles,
            users: config.users,
        }
    }

    /// Effective permissions of a role, walking up through its parents.
    pub fn role_permissions(&self, role_id: &str) -> HashSet<String> {
        let mut perms = HashSet::new();
        let mut visited = HashSet::new();
        let mut current = Some(role_id.to_string());

        while let Some(id) = current {
            if !visited.insert(id.clone()) {
                warn!(role = %role_id, cycle_at = %id, "role inheritance cycle");
                break;
            }
            match self.roles.get(&id) {
                Some(role) => {
                    perms.extend(role.permissions.iter().cloned());
                    current = role.parent_role_id.clone();
                }
                None => break,
            }
        }
        perms
    }

    pub fn user_permissions(&self, user_id: &str) -> HashSet<String> {
        self.users
            .get(user_id)
            .map(|roles| roles.iter().flat_map(|r| self.role_permissions(r)).collect())
            .unwrap_or_default()
    }
}

impl PermissionChecker for RoleResolver {
    fn has_permission(&self, user_id: &str, permission_code: &str) -> bool {
        let perms = self.user_permissions(user_id);
        perms.contains(PERM_ALL) || perms.contains(permission_code)
    }
}

/// Grants everything. For embedded use where access control happens upstream.
pub struct AllowAll;

impl PermissionChecker for AllowAll {
    fn has_permission(&self, _user_id: &str, _permission_code: &str) -> bool {
        true
    }
}

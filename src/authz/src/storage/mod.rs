//! Storage collaborator for users, roles, permissions and resources
//!
//! The engine never owns persistent state; it reads and writes through a
//! [`Storage`] implementation. Writes are plain upserts. Invariants such as
//! acyclic hierarchies and domain scoping are enforced by the engine before it
//! calls into storage.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Permission, PermissionId, Resource, Role, RoleAssignment, RoleId, User};

pub mod memory;

pub use memory::InMemoryStorage;

/// One staged cell of a permission matrix
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatrixChange {
    pub role_id: RoleId,
    pub permission_id: PermissionId,

    /// Target state: `true` grants, `false` revokes
    pub granted: bool,
}

impl MatrixChange {
    pub fn new(role_id: impl Into<RoleId>, permission_id: impl Into<PermissionId>, granted: bool) -> Self {
        Self {
            role_id: role_id.into(),
            permission_id: permission_id.into(),
            granted,
        }
    }
}

/// Result of persisting one [`MatrixChange`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeOutcome {
    pub change: MatrixChange,

    /// Failure message; `None` when the write succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChangeOutcome {
    pub fn success(change: MatrixChange) -> Self {
        Self { change, error: None }
    }

    pub fn failure(change: MatrixChange, error: impl Into<String>) -> Self {
        Self {
            change,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Storage trait
pub trait Storage: Send + Sync {
    /// Get a user by ID
    fn get_user(&self, user_id: &str) -> Result<Option<User>>;

    /// Get a role by ID
    fn get_role(&self, role_id: &str) -> Result<Option<Role>>;

    /// Get a permission by ID
    fn get_permission(&self, permission_id: &str) -> Result<Option<Permission>>;

    /// Get a registered resource by ID
    fn get_resource(&self, resource_id: &str) -> Result<Option<Resource>>;

    /// Assignments of a user that apply to `domain` (`None` = global only),
    /// including expired ones
    fn list_roles_for_user(&self, user_id: &str, domain: Option<&str>) -> Result<Vec<RoleAssignment>>;

    /// Roles visible in `domain`: global roles plus that domain's roles.
    /// `None` lists every role.
    fn list_roles(&self, domain: Option<&str>) -> Result<Vec<Role>>;

    /// All permissions
    fn list_permissions(&self) -> Result<Vec<Permission>>;

    /// Roles whose `parent_id` is `role_id`
    fn list_child_roles(&self, role_id: &str) -> Result<Vec<Role>>;

    /// Insert or replace a user
    fn persist_user(&self, user: User) -> Result<()>;

    /// Insert or replace a role
    fn persist_role(&self, role: Role) -> Result<()>;

    /// Insert or replace a permission
    fn persist_permission(&self, permission: Permission) -> Result<()>;

    /// Insert or replace a resource; the resource must carry an id
    fn persist_resource(&self, resource: Resource) -> Result<()>;

    /// Apply each change as an independent write; earlier successes are kept
    /// when a later change fails
    fn persist_matrix_changes(&self, changes: &[MatrixChange]) -> Vec<ChangeOutcome>;
}

//! In-memory storage implementation

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{ChangeOutcome, MatrixChange, Storage};
use crate::error::{AuthzError, EntityKind, Result};
use crate::types::{Permission, PermissionId, Resource, Role, RoleAssignment, RoleId, User, UserId};

#[derive(Debug, Default)]
struct State {
    users: HashMap<UserId, User>,
    roles: BTreeMap<RoleId, Role>,
    permissions: BTreeMap<PermissionId, Permission>,
    resources: HashMap<String, Resource>,
}

/// In-memory storage backed by a single `RwLock`
///
/// Cloning is cheap and shares the underlying state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<RwLock<State>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_count(&self) -> usize {
        self.state.read().users.len()
    }

    pub fn role_count(&self) -> usize {
        self.state.read().roles.len()
    }

    pub fn permission_count(&self) -> usize {
        self.state.read().permissions.len()
    }

    pub fn resource_count(&self) -> usize {
        self.state.read().resources.len()
    }

    fn apply_change(state: &mut State, change: &MatrixChange) -> Result<()> {
        if !state.permissions.contains_key(&change.permission_id) {
            return Err(AuthzError::not_found(EntityKind::Permission, &change.permission_id));
        }
        let role = state
            .roles
            .get_mut(&change.role_id)
            .ok_or_else(|| AuthzError::not_found(EntityKind::Role, &change.role_id))?;

        if change.granted {
            role.permissions.insert(change.permission_id.clone());
        } else {
            role.permissions.remove(&change.permission_id);
        }
        Ok(())
    }
}

impl Storage for InMemoryStorage {
    fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.state.read().users.get(user_id).cloned())
    }

    fn get_role(&self, role_id: &str) -> Result<Option<Role>> {
        Ok(self.state.read().roles.get(role_id).cloned())
    }

    fn get_permission(&self, permission_id: &str) -> Result<Option<Permission>> {
        Ok(self.state.read().permissions.get(permission_id).cloned())
    }

    fn get_resource(&self, resource_id: &str) -> Result<Option<Resource>> {
        Ok(self.state.read().resources.get(resource_id).cloned())
    }

    fn list_roles_for_user(&self, user_id: &str, domain: Option<&str>) -> Result<Vec<RoleAssignment>> {
        let state = self.state.read();
        Ok(state
            .users
            .get(user_id)
            .map(|user| {
                user.assignments
                    .iter()
                    .filter(|a| a.applies_to(domain))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn list_roles(&self, domain: Option<&str>) -> Result<Vec<Role>> {
        let state = self.state.read();
        Ok(state
            .roles
            .values()
            .filter(|role| match domain {
                None => true,
                Some(d) => role.domain.as_deref().map_or(true, |rd| rd == d),
            })
            .cloned()
            .collect())
    }

    fn list_permissions(&self) -> Result<Vec<Permission>> {
        Ok(self.state.read().permissions.values().cloned().collect())
    }

    fn list_child_roles(&self, role_id: &str) -> Result<Vec<Role>> {
        let state = self.state.read();
        Ok(state
            .roles
            .values()
            .filter(|role| role.parent_id.as_deref() == Some(role_id))
            .cloned()
            .collect())
    }

    fn persist_user(&self, user: User) -> Result<()> {
        self.state.write().users.insert(user.id.clone(), user);
        Ok(())
    }

    fn persist_role(&self, role: Role) -> Result<()> {
        self.state.write().roles.insert(role.id.clone(), role);
        Ok(())
    }

    fn persist_permission(&self, permission: Permission) -> Result<()> {
        self.state
            .write()
            .permissions
            .insert(permission.id.clone(), permission);
        Ok(())
    }

    fn persist_resource(&self, resource: Resource) -> Result<()> {
        let id = resource
            .id
            .clone()
            .ok_or_else(|| AuthzError::Validation("resource id must not be empty".to_string()))?;
        self.state.write().resources.insert(id, resource);
        Ok(())
    }

    fn persist_matrix_changes(&self, changes: &[MatrixChange]) -> Vec<ChangeOutcome> {
        let mut state = self.state.write();
        changes
            .iter()
            .map(|change| match Self::apply_change(&mut state, change) {
                Ok(()) => ChangeOutcome::success(change.clone()),
                Err(e) => ChangeOutcome::failure(change.clone(), e.to_string()),
            })
            .collect()
    }
}

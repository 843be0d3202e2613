//! Administrative writes
//!
//! Every method takes the write side of the engine gate, validates before
//! touching storage, then drops the hierarchy memo and cached decisions the
//! change can affect.

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::{AuthEngine, MetricsCollector};
use crate::cache::CacheProvider;
use crate::condition::Condition;
use crate::error::{AuthzError, EntityKind, Result};
use crate::hierarchy::HierarchyResolver;
use crate::matrix::{MatrixMode, MatrixScope, MatrixWriter, PermissionMatrix};
use crate::storage::{ChangeOutcome, MatrixChange, Storage};
use crate::types::{Permission, Resource, Role, RoleAssignment, User, UserStatus};

impl AuthEngine {
    /// Register a user
    ///
    /// Creating an identical user again is a no-op; a different user under
    /// the same id is rejected. Every assigned role must exist and be
    /// assignable in the assignment's domain.
    pub fn create_user(&self, mut user: User) -> Result<()> {
        let _gate = self.write_gate.write();

        require_id("user", &user.id)?;

        if let Some(existing) = self.storage.get_user(&user.id)? {
            if existing.same_content(&user) {
                debug!(user_id = %user.id, "User already exists, nothing to do");
                return Ok(());
            }
            return Err(AuthzError::Validation(format!(
                "user '{}' already exists with different content",
                user.id
            )));
        }

        let now = self.clock.now();
        for assignment in &mut user.assignments {
            self.check_assignable(&assignment.role_id, assignment.domain.as_deref())?;
            assignment.granted_at = now;
        }

        let user_id = user.id.clone();
        self.storage.persist_user(user)?;
        self.invalidate_user(&user_id);
        self.record_write();

        info!(user_id = %user_id, "User created");
        Ok(())
    }

    /// Activate or suspend a user
    pub fn set_user_status(&self, user_id: &str, status: UserStatus) -> Result<()> {
        let _gate = self.write_gate.write();

        let user = self.load_user(user_id)?;
        if user.status == status {
            return Ok(());
        }

        self.storage.persist_user(user.with_status(status))?;
        self.invalidate_user(user_id);
        self.record_write();

        info!(user_id = %user_id, status = status.as_str(), "User status changed");
        Ok(())
    }

    /// Register a permission
    pub fn create_permission(&self, permission: Permission) -> Result<()> {
        let _gate = self.write_gate.write();

        require_id("permission", &permission.id)?;
        if permission.action.trim().is_empty() || permission.resource_type.trim().is_empty() {
            return Err(AuthzError::Validation(format!(
                "permission '{}' needs an action and a resource type",
                permission.id
            )));
        }

        if let Some(existing) = self.storage.get_permission(&permission.id)? {
            if existing == permission {
                debug!(permission_id = %permission.id, "Permission already exists, nothing to do");
                return Ok(());
            }
            return Err(AuthzError::Validation(format!(
                "permission '{}' already exists with different content",
                permission.id
            )));
        }

        let permission_id = permission.id.clone();
        self.storage.persist_permission(permission)?;
        self.record_write();

        info!(permission_id = %permission_id, "Permission created");
        Ok(())
    }

    /// Register a permission whose conditions arrive as untrusted JSON
    ///
    /// Every invalid predicate is reported at once through
    /// [`AuthzError::InvalidConditions`].
    pub fn create_conditional_permission(
        &self,
        id: &str,
        action: &str,
        resource_type: &str,
        conditions: &Value,
    ) -> Result<Permission> {
        let conditions = self.evaluator.validate_json(conditions)?;
        let permission = Permission::new(id, action, resource_type).with_conditions(conditions);
        self.create_permission(permission.clone())?;
        Ok(permission)
    }

    /// Replace or remove the condition tree of a permission
    pub fn update_permission_conditions(&self, permission_id: &str, conditions: Option<Condition>) -> Result<()> {
        let _gate = self.write_gate.write();

        let mut permission = self
            .storage
            .get_permission(permission_id)?
            .ok_or_else(|| AuthzError::not_found(EntityKind::Permission, permission_id))?;

        permission.conditions = conditions;
        self.storage.persist_permission(permission)?;
        self.invalidate_cache();
        self.record_write();

        info!(permission_id = %permission_id, "Permission conditions updated");
        Ok(())
    }

    /// Register a resource so checks that pass only its id see its attributes
    ///
    /// Registering an identical resource again is a no-op; different content
    /// under the same id is rejected.
    pub fn create_resource(&self, resource: Resource) -> Result<()> {
        let _gate = self.write_gate.write();

        let resource_id = resource.id.clone().unwrap_or_default();
        require_id("resource", &resource_id)?;
        if resource.resource_type.trim().is_empty() {
            return Err(AuthzError::Validation(format!(
                "resource '{}' needs a resource type",
                resource_id
            )));
        }

        if let Some(existing) = self.storage.get_resource(&resource_id)? {
            if existing == resource {
                debug!(resource_id = %resource_id, "Resource already exists, nothing to do");
                return Ok(());
            }
            return Err(AuthzError::Validation(format!(
                "resource '{}' already exists with different content",
                resource_id
            )));
        }

        self.storage.persist_resource(resource)?;
        // Earlier id-only decisions were made without these attributes
        self.invalidate_cache();
        self.record_write();

        info!(resource_id = %resource_id, "Resource created");
        Ok(())
    }

    /// Get a registered resource
    pub fn get_resource(&self, resource_id: &str) -> Result<Option<Resource>> {
        let _gate = self.write_gate.read();
        self.storage.get_resource(resource_id)
    }

    /// Register a role
    ///
    /// Granted permissions and the parent must exist. The parent must be
    /// global or live in the role's domain, and linking it must not close a
    /// cycle.
    pub fn create_role(&self, role: Role) -> Result<()> {
        let _gate = self.write_gate.write();

        require_id("role", &role.id)?;

        if let Some(existing) = self.storage.get_role(&role.id)? {
            if existing == role {
                debug!(role_id = %role.id, "Role already exists, nothing to do");
                return Ok(());
            }
            return Err(AuthzError::Validation(format!(
                "role '{}' already exists with different content",
                role.id
            )));
        }

        for permission_id in &role.permissions {
            self.require_permission_exists(permission_id)?;
        }
        if let Some(parent_id) = &role.parent_id {
            self.check_parent(&role, parent_id)?;
        }

        let role_id = role.id.clone();
        self.storage.persist_role(role)?;
        self.hierarchy.invalidate(&role_id);
        self.record_write();

        info!(role_id = %role_id, "Role created");
        Ok(())
    }

    /// Link a role under a new parent, or detach it with `None`
    pub fn set_role_parent(&self, role_id: &str, parent_id: Option<&str>) -> Result<()> {
        let _gate = self.write_gate.write();

        let mut role = self.load_role(role_id)?;
        if role.parent_id.as_deref() == parent_id {
            return Ok(());
        }
        if let Some(parent_id) = parent_id {
            self.check_parent(&role, parent_id)?;
        }

        role.parent_id = parent_id.map(str::to_string);
        self.storage.persist_role(role)?;
        self.after_role_change(role_id);

        info!(role_id = %role_id, parent_id = ?parent_id, "Role parent changed");
        Ok(())
    }

    /// Grant a permission directly to a role
    pub fn grant_permission(&self, role_id: &str, permission_id: &str) -> Result<()> {
        let _gate = self.write_gate.write();

        let mut role = self.load_role(role_id)?;
        self.require_permission_exists(permission_id)?;

        if !role.permissions.insert(permission_id.to_string()) {
            return Ok(());
        }

        self.storage.persist_role(role)?;
        self.after_role_change(role_id);

        info!(role_id = %role_id, permission_id = %permission_id, "Permission granted");
        Ok(())
    }

    /// Revoke a direct grant; returns whether the role held it
    pub fn revoke_permission(&self, role_id: &str, permission_id: &str) -> Result<bool> {
        let _gate = self.write_gate.write();

        let mut role = self.load_role(role_id)?;
        if !role.permissions.remove(permission_id) {
            return Ok(false);
        }

        self.storage.persist_role(role)?;
        self.after_role_change(role_id);

        info!(role_id = %role_id, permission_id = %permission_id, "Permission revoked");
        Ok(true)
    }

    /// Assign a role to a user, optionally in a domain and until an expiry
    ///
    /// Assigning the same `(role, domain)` pair again replaces its expiry.
    pub fn assign_role(
        &self,
        user_id: &str,
        role_id: &str,
        domain: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let _gate = self.write_gate.write();

        let mut user = self.load_user(user_id)?;
        self.check_assignable(role_id, domain)?;

        let mut assignment = RoleAssignment::new(role_id);
        assignment.domain = domain.map(str::to_string);
        assignment.expires_at = expires_at;
        assignment.granted_at = self.clock.now();
        user.upsert_assignment(assignment);

        self.storage.persist_user(user)?;
        self.invalidate_user(user_id);
        self.record_write();

        info!(user_id = %user_id, role_id = %role_id, domain = ?domain, expires_at = ?expires_at, "Role assigned");
        Ok(())
    }

    /// Remove a role assignment; returns whether it existed
    pub fn revoke_role(&self, user_id: &str, role_id: &str, domain: Option<&str>) -> Result<bool> {
        let _gate = self.write_gate.write();

        let mut user = self.load_user(user_id)?;
        if !user.remove_assignment(role_id, domain) {
            return Ok(false);
        }

        self.storage.persist_user(user)?;
        self.invalidate_user(user_id);
        self.record_write();

        info!(user_id = %user_id, role_id = %role_id, domain = ?domain, "Role revoked");
        Ok(true)
    }

    /// Snapshot every role and permission into a matrix bound to this engine
    pub fn permission_matrix(&self, mode: MatrixMode) -> Result<PermissionMatrix> {
        PermissionMatrix::construct(self, mode)
    }

    /// Snapshot the roles and permissions selected by `scope`
    pub fn permission_matrix_scoped(&self, scope: MatrixScope, mode: MatrixMode) -> Result<PermissionMatrix> {
        PermissionMatrix::construct_scoped(self, scope, mode)
    }

    pub(crate) fn matrix_writer(&self) -> Arc<dyn MatrixWriter> {
        Arc::new(EngineMatrixWriter {
            storage: self.storage.clone(),
            hierarchy: self.hierarchy.clone(),
            cache: self.cache.clone(),
            metrics: self.metrics.clone(),
            write_gate: self.write_gate.clone(),
        })
    }

    pub(crate) fn read_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.write_gate.read()
    }

    fn load_user(&self, user_id: &str) -> Result<User> {
        self.storage
            .get_user(user_id)?
            .ok_or_else(|| AuthzError::not_found(EntityKind::User, user_id))
    }

    fn load_role(&self, role_id: &str) -> Result<Role> {
        self.storage
            .get_role(role_id)?
            .ok_or_else(|| AuthzError::not_found(EntityKind::Role, role_id))
    }

    fn require_permission_exists(&self, permission_id: &str) -> Result<()> {
        match self.storage.get_permission(permission_id)? {
            Some(_) => Ok(()),
            None => Err(AuthzError::not_found(EntityKind::Permission, permission_id)),
        }
    }

    /// Domain-scoped roles are assignable only inside their own domain
    fn check_assignable(&self, role_id: &str, domain: Option<&str>) -> Result<()> {
        let role = self.load_role(role_id)?;
        match role.domain.as_deref() {
            Some(role_domain) if Some(role_domain) != domain => Err(AuthzError::Validation(format!(
                "role '{}' belongs to domain '{}' and cannot be assigned in {}",
                role_id,
                role_domain,
                domain.map_or_else(|| "the global scope".to_string(), |d| format!("domain '{}'", d))
            ))),
            _ => Ok(()),
        }
    }

    fn check_parent(&self, role: &Role, parent_id: &str) -> Result<()> {
        let parent = self.load_role(parent_id)?;

        if let Some(parent_domain) = parent.domain.as_deref() {
            if role.domain.as_deref() != Some(parent_domain) {
                return Err(AuthzError::Validation(format!(
                    "role '{}' cannot inherit from '{}' in domain '{}'",
                    role.id, parent_id, parent_domain
                )));
            }
        }

        if !self.hierarchy.validate_no_cycle(&role.id, parent_id)? {
            return Err(AuthzError::Validation(format!(
                "linking '{}' under '{}' would create a cycle",
                role.id, parent_id
            )));
        }
        Ok(())
    }

    /// Roles feed every user's decisions, so the whole cache goes
    fn after_role_change(&self, role_id: &str) {
        self.hierarchy.invalidate(role_id);
        self.invalidate_cache();
        self.record_write();
    }

    fn record_write(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_admin_write();
        }
    }
}

/// Persists matrix changes under the engine gate and drops what they affect
struct EngineMatrixWriter {
    storage: Arc<dyn Storage>,
    hierarchy: Arc<HierarchyResolver>,
    cache: Option<Arc<dyn CacheProvider>>,
    metrics: Option<Arc<MetricsCollector>>,
    write_gate: Arc<RwLock<()>>,
}

impl MatrixWriter for EngineMatrixWriter {
    fn write(&self, changes: &[MatrixChange]) -> Vec<ChangeOutcome> {
        let _gate = self.write_gate.write();

        let outcomes = self.storage.persist_matrix_changes(changes);
        let affected: BTreeSet<&str> = outcomes
            .iter()
            .filter(|o| o.is_success())
            .map(|o| o.change.role_id.as_str())
            .collect();
        if affected.is_empty() {
            return outcomes;
        }

        for role_id in &affected {
            self.hierarchy.invalidate(role_id);
        }
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_admin_write();
        }

        info!(roles = ?affected, "Matrix changes invalidated hierarchy and decision cache");
        outcomes
    }
}

fn require_id(kind: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(AuthzError::Validation(format!("{} id must not be empty", kind)));
    }
    Ok(())
}

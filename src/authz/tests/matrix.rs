//! Permission matrix integration tests

use rbac_authz::matrix::MatrixExport;
use rbac_authz::storage::{ChangeOutcome, MatrixChange};
use rbac_authz::{
    AuthEngine, AuthzError, DecisionReason, EngineConfig, InMemoryStorage, MatrixMode, MatrixScope, Permission,
    PermissionMatrix, Resource, Role, RoleAssignment, Storage, User,
};
use std::sync::Arc;

fn setup() -> (AuthEngine, Arc<InMemoryStorage>) {
    let storage = Arc::new(InMemoryStorage::new());
    let engine = AuthEngine::new(EngineConfig::default(), storage.clone()).unwrap();

    engine
        .create_permission(Permission::new("doc:read", "read", "doc"))
        .unwrap();
    engine
        .create_permission(Permission::new("doc:write", "write", "doc"))
        .unwrap();
    engine
        .create_permission(Permission::new("billing:view", "view", "billing"))
        .unwrap();
    engine
        .create_role(Role::new("viewer", "Viewer").with_permission("doc:read"))
        .unwrap();
    engine
        .create_role(Role::new("editor", "Editor").with_parent("viewer"))
        .unwrap();
    engine
        .create_role(Role::new("acme-finance", "Acme finance").in_domain("acme"))
        .unwrap();

    engine.create_user(User::new("alice")).unwrap();
    engine.assign_role("alice", "editor", None, None).unwrap();

    (engine, storage)
}

// ============================================================================
// STAGING
// ============================================================================

#[test]
fn test_toggle_twice_leaves_nothing_pending() {
    let (engine, _) = setup();
    let mut matrix = PermissionMatrix::construct(&engine, MatrixMode::Editable).unwrap();

    matrix.toggle("editor", "doc:write").unwrap();
    assert!(matrix.has_changes());
    assert!(matrix.is_granted("editor", "doc:write").unwrap());
    assert!(!matrix.is_committed("editor", "doc:write").unwrap());

    matrix.toggle("editor", "doc:write").unwrap();
    assert!(!matrix.has_changes());
}

#[test]
fn test_set_supersedes_pending_change() {
    let (engine, _) = setup();
    let mut matrix = PermissionMatrix::construct(&engine, MatrixMode::Editable).unwrap();

    matrix.set("viewer", "doc:read", false).unwrap();
    assert_eq!(matrix.pending_changes().len(), 1);

    // Setting back to the committed value clears the cell
    matrix.set("viewer", "doc:read", true).unwrap();
    assert!(!matrix.has_changes());
}

#[test]
fn test_read_only_rejects_mutation() {
    let (engine, _) = setup();
    let mut matrix = PermissionMatrix::construct(&engine, MatrixMode::ReadOnly).unwrap();

    assert!(matches!(matrix.toggle("viewer", "doc:write"), Err(AuthzError::Mode(_))));
    assert!(matches!(matrix.set("viewer", "doc:write", true), Err(AuthzError::Mode(_))));
    assert!(matches!(matrix.apply_changes(), Err(AuthzError::Mode(_))));
}

#[test]
fn test_unknown_cells_rejected() {
    let (engine, _) = setup();
    let mut matrix = PermissionMatrix::construct(&engine, MatrixMode::Editable).unwrap();

    assert!(matches!(matrix.toggle("ghost", "doc:read"), Err(AuthzError::NotFound { .. })));
    assert!(matches!(matrix.toggle("viewer", "doc:purge"), Err(AuthzError::NotFound { .. })));
}

// ============================================================================
// APPLY
// ============================================================================

#[test]
fn test_apply_through_engine_changes_decisions() {
    let (engine, storage) = setup();
    let doc = Resource::new("doc:1");
    assert!(!engine.check_permission("alice", "write", &doc, None).allowed);

    let mut matrix = PermissionMatrix::construct(&engine, MatrixMode::Editable).unwrap();
    matrix.set("viewer", "doc:write", true).unwrap();

    let report = matrix.apply_changes().unwrap();
    assert!(report.is_complete());
    assert_eq!(report.applied_count(), 1);
    assert!(!matrix.has_changes());

    // Inherited through editor -> viewer
    assert!(engine.check_permission("alice", "write", &doc, None).allowed);
    assert!(storage.get_role("viewer").unwrap().unwrap().has_permission("doc:write"));
}

#[test]
fn test_revoke_takes_effect_without_cache() {
    let storage = Arc::new(InMemoryStorage::new());
    let engine = AuthEngine::new(EngineConfig::default().without_cache(), storage).unwrap();
    engine
        .create_permission(Permission::new("doc:read", "read", "doc"))
        .unwrap();
    engine
        .create_role(Role::new("viewer", "Viewer").with_permission("doc:read"))
        .unwrap();
    engine.create_user(User::new("u")).unwrap();
    engine.assign_role("u", "viewer", None, None).unwrap();

    let doc = Resource::new("doc:1");
    assert!(engine.check_permission("u", "read", &doc, None).allowed);

    let mut matrix = engine.permission_matrix(MatrixMode::Editable).unwrap();
    matrix.set("viewer", "doc:read", false).unwrap();
    assert!(matrix.apply_changes().unwrap().is_complete());

    let result = engine.check_permission("u", "read", &doc, None);
    assert!(!result.allowed);
    assert_eq!(result.reason, DecisionReason::NoMatchingPermission);
}

#[test]
fn test_revoke_drops_cached_allow_of_descendants() {
    let (engine, _) = setup();
    let doc = Resource::new("doc:1");
    assert!(engine.check_permission("alice", "read", &doc, None).allowed);

    let mut matrix = engine.permission_matrix(MatrixMode::Editable).unwrap();
    matrix.toggle("viewer", "doc:read").unwrap();
    matrix.apply_changes().unwrap();

    // alice holds editor, which inherits from viewer
    assert!(!engine.check_permission("alice", "read", &doc, None).allowed);
    assert!(engine.get_allowed_actions("alice", "doc", None).is_empty());
}

/// Delegates to memory but refuses every matrix change touching one role
struct RejectingStorage {
    inner: InMemoryStorage,
    rejected_role: &'static str,
}

impl Storage for RejectingStorage {
    fn get_user(&self, user_id: &str) -> rbac_authz::Result<Option<User>> {
        self.inner.get_user(user_id)
    }

    fn get_role(&self, role_id: &str) -> rbac_authz::Result<Option<Role>> {
        self.inner.get_role(role_id)
    }

    fn get_permission(&self, permission_id: &str) -> rbac_authz::Result<Option<Permission>> {
        self.inner.get_permission(permission_id)
    }

    fn get_resource(&self, resource_id: &str) -> rbac_authz::Result<Option<Resource>> {
        self.inner.get_resource(resource_id)
    }

    fn list_roles_for_user(&self, user_id: &str, domain: Option<&str>) -> rbac_authz::Result<Vec<RoleAssignment>> {
        self.inner.list_roles_for_user(user_id, domain)
    }

    fn list_roles(&self, domain: Option<&str>) -> rbac_authz::Result<Vec<Role>> {
        self.inner.list_roles(domain)
    }

    fn list_permissions(&self) -> rbac_authz::Result<Vec<Permission>> {
        self.inner.list_permissions()
    }

    fn list_child_roles(&self, role_id: &str) -> rbac_authz::Result<Vec<Role>> {
        self.inner.list_child_roles(role_id)
    }

    fn persist_user(&self, user: User) -> rbac_authz::Result<()> {
        self.inner.persist_user(user)
    }

    fn persist_role(&self, role: Role) -> rbac_authz::Result<()> {
        self.inner.persist_role(role)
    }

    fn persist_permission(&self, permission: Permission) -> rbac_authz::Result<()> {
        self.inner.persist_permission(permission)
    }

    fn persist_resource(&self, resource: Resource) -> rbac_authz::Result<()> {
        self.inner.persist_resource(resource)
    }

    fn persist_matrix_changes(&self, changes: &[MatrixChange]) -> Vec<ChangeOutcome> {
        changes
            .iter()
            .map(|change| {
                if change.role_id == self.rejected_role {
                    ChangeOutcome::failure(change.clone(), "write refused")
                } else {
                    self.inner
                        .persist_matrix_changes(std::slice::from_ref(change))
                        .remove(0)
                }
            })
            .collect()
    }
}

#[test]
fn test_partial_failure_keeps_failed_cells_pending() {
    let (_, storage) = setup();
    let storage = Arc::new(RejectingStorage {
        inner: (*storage).clone(),
        rejected_role: "editor",
    });
    let engine = AuthEngine::new(EngineConfig::default(), storage.clone()).unwrap();
    let mut matrix = PermissionMatrix::construct(&engine, MatrixMode::Editable).unwrap();

    matrix.set("viewer", "doc:write", true).unwrap();
    matrix.set("editor", "billing:view", true).unwrap();

    let report = matrix.apply_changes().unwrap();
    assert!(!report.is_complete());
    assert_eq!(report.applied_count(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].change.role_id, "editor");
    assert_eq!(report.failed[0].error.as_deref(), Some("write refused"));

    // No rollback of the successful cell
    assert!(storage.get_role("viewer").unwrap().unwrap().has_permission("doc:write"));
    assert!(matrix.is_committed("viewer", "doc:write").unwrap());

    let pending = matrix.pending_changes();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].permission_id, "billing:view");
}

#[test]
fn test_export_reflects_applied_state() {
    let (engine, _) = setup();
    let mut matrix = PermissionMatrix::construct(&engine, MatrixMode::Editable).unwrap();

    matrix.set("editor", "doc:write", true).unwrap();
    matrix.set("viewer", "doc:read", false).unwrap();

    let staged = matrix.export();
    assert_eq!(staged.pending_changes.len(), 2);
    assert!(matrix.has_changes());

    matrix.apply_changes().unwrap();

    let reloaded = PermissionMatrix::construct(&engine, MatrixMode::ReadOnly).unwrap();
    let export = reloaded.export();
    assert!(export.pending_changes.is_empty());
    assert_eq!(granted_cells(&export), vec![("editor", "doc:write")]);
    assert_eq!(granted_cells(&matrix.export()), granted_cells(&export));
}

fn granted_cells(export: &MatrixExport) -> Vec<(&str, &str)> {
    export
        .cells
        .iter()
        .filter(|c| c.granted)
        .map(|c| (c.role_id.as_str(), c.permission_id.as_str()))
        .collect()
}

// ============================================================================
// SCOPE AND RENDERING
// ============================================================================

#[test]
fn test_scoped_construction() {
    let (engine, _) = setup();

    let scoped = PermissionMatrix::construct_scoped(
        &engine,
        MatrixScope::new().with_permissions(["doc:read", "doc:write"]),
        MatrixMode::ReadOnly,
    )
    .unwrap();
    assert_eq!(scoped.permissions().len(), 2);
    assert_eq!(scoped.roles().len(), 3);

    let missing = PermissionMatrix::construct_scoped(
        &engine,
        MatrixScope::new().with_roles(["ghost"]),
        MatrixMode::ReadOnly,
    );
    assert!(matches!(missing, Err(AuthzError::NotFound { .. })));

    let globex = PermissionMatrix::construct_scoped(&engine, MatrixScope::new().in_domain("globex"), MatrixMode::ReadOnly)
        .unwrap();
    let ids: Vec<&str> = globex.roles().iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["editor", "viewer"]);
}

#[test]
fn test_inherited_cells_visible() {
    let (engine, _) = setup();
    let matrix = PermissionMatrix::construct_scoped(&engine, MatrixScope::new().show_inherited(true), MatrixMode::ReadOnly)
        .unwrap();

    let export = matrix.export();
    let cell = export
        .cells
        .iter()
        .find(|c| c.role_id == "editor" && c.permission_id == "doc:read")
        .unwrap();
    assert!(cell.inherited);
    assert!(!cell.granted);

    let table = matrix.to_string();
    assert!(table.contains('⇑'));
}

#[test]
fn test_display_marks_pending_cells() {
    let (engine, _) = setup();
    let mut matrix = PermissionMatrix::construct(&engine, MatrixMode::Editable).unwrap();
    matrix.toggle("viewer", "doc:write").unwrap();

    let table = matrix.to_string();
    assert!(table.contains("Permission"));
    assert!(table.contains("✓*"));
    assert!(table.contains("1 pending change(s)"));
    assert!(table.ends_with("Mode: editable"));
}

#[test]
fn test_discard_leaves_storage_untouched() {
    let (engine, storage) = setup();
    let mut matrix = PermissionMatrix::construct(&engine, MatrixMode::Editable).unwrap();

    matrix.toggle("viewer", "doc:read").unwrap();
    matrix.discard_changes();

    assert!(!matrix.has_changes());
    assert!(storage.get_role("viewer").unwrap().unwrap().has_permission("doc:read"));
}

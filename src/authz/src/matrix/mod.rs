//! Role × permission matrix with staged edits
//!
//! A [`PermissionMatrix`] is a snapshot of which roles directly hold which
//! permissions. In [`MatrixMode::Editable`] mode cells can be toggled or set;
//! edits stay pending until [`PermissionMatrix::apply_changes`] writes them
//! through the engine the matrix was built from, which persists them with
//! [`Storage::persist_matrix_changes`] under its write gate and drops the
//! hierarchy memo and cached decisions they affect.
//!
//! ```text
//! Permission   │ viewer │ editor │ admin
//! ─────────────┼────────┼────────┼───────
//! doc:read     │   ✓    │   ⇑    │   ⇑
//! doc:write    │   ✗    │   ✓*   │   ⇑
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::AuthEngine;
use crate::error::{AuthzError, EntityKind, Result};
use crate::storage::{ChangeOutcome, MatrixChange, Storage};
use crate::types::{PermissionId, RoleId};

/// Whether a matrix accepts edits; fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixMode {
    ReadOnly,
    Editable,
}

impl fmt::Display for MatrixMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => write!(f, "read_only"),
            Self::Editable => write!(f, "editable"),
        }
    }
}

/// Restricts which roles and permissions a matrix covers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixScope {
    /// Global roles plus roles of this domain
    pub domain: Option<String>,

    /// Explicit role ids; every id must exist
    pub role_ids: Option<Vec<RoleId>>,

    /// Explicit permission ids; every id must exist
    pub permission_ids: Option<Vec<PermissionId>>,

    /// Mark cells reachable only through a parent role
    pub show_inherited: bool,
}

impl MatrixScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_roles<I, S>(mut self, role_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<RoleId>,
    {
        self.role_ids = Some(role_ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_permissions<I, S>(mut self, permission_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<PermissionId>,
    {
        self.permission_ids = Some(permission_ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn show_inherited(mut self, show: bool) -> Self {
        self.show_inherited = show;
        self
    }
}

/// Column header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleColumn {
    pub id: RoleId,
    pub name: String,
    #[serde(default)]
    pub domain: Option<String>,
}

/// Row header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRow {
    pub id: PermissionId,
    pub action: String,
    pub resource_type: String,
    pub conditional: bool,
}

/// One granted cell in an export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixCell {
    pub role_id: RoleId,
    pub permission_id: PermissionId,
    pub granted: bool,
    /// Held through an ancestor rather than directly
    pub inherited: bool,
    /// Differs from storage because of a staged change
    pub pending: bool,
}

/// Serializable view of committed state overlaid with pending changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixExport {
    pub mode: MatrixMode,
    pub roles: Vec<RoleColumn>,
    pub permissions: Vec<PermissionRow>,
    pub cells: Vec<MatrixCell>,
    pub pending_changes: Vec<MatrixChange>,
}

/// Per-cell result of [`PermissionMatrix::apply_changes`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixApplyReport {
    pub applied: Vec<MatrixChange>,
    pub failed: Vec<ChangeOutcome>,
}

impl MatrixApplyReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    /// Roles whose permission set changed in storage
    pub fn affected_roles(&self) -> BTreeSet<RoleId> {
        self.applied.iter().map(|c| c.role_id.clone()).collect()
    }
}

/// Sink for applied matrix changes
pub trait MatrixWriter: Send + Sync {
    /// Persist each change independently, one outcome per change in order
    fn write(&self, changes: &[MatrixChange]) -> Vec<ChangeOutcome>;
}

type Cell = (RoleId, PermissionId);

/// Permission matrix
pub struct PermissionMatrix {
    writer: Arc<dyn MatrixWriter>,
    mode: MatrixMode,
    show_inherited: bool,
    roles: Vec<RoleColumn>,
    permissions: Vec<PermissionRow>,

    /// Directly granted cells as of construction or the last apply
    committed: BTreeSet<Cell>,

    /// Cells held only through an ancestor
    inherited: BTreeSet<Cell>,

    /// At most one change per cell, in staging order
    pending: Vec<MatrixChange>,
}

impl PermissionMatrix {
    /// Snapshot every role and permission of `engine`
    pub fn construct(engine: &AuthEngine, mode: MatrixMode) -> Result<Self> {
        Self::construct_scoped(engine, MatrixScope::default(), mode)
    }

    /// Snapshot the roles and permissions selected by `scope`
    pub fn construct_scoped(engine: &AuthEngine, scope: MatrixScope, mode: MatrixMode) -> Result<Self> {
        let _gate = engine.read_gate();
        let storage: &Arc<dyn Storage> = engine.storage();

        let mut roles = storage.list_roles(scope.domain.as_deref())?;
        if let Some(ids) = &scope.role_ids {
            for id in ids {
                if !roles.iter().any(|r| &r.id == id) {
                    return Err(AuthzError::not_found(EntityKind::Role, id));
                }
            }
            roles.retain(|r| ids.contains(&r.id));
        }

        let mut permissions = storage.list_permissions()?;
        if let Some(ids) = &scope.permission_ids {
            for id in ids {
                if !permissions.iter().any(|p| &p.id == id) {
                    return Err(AuthzError::not_found(EntityKind::Permission, id));
                }
            }
            permissions.retain(|p| ids.contains(&p.id));
        }

        roles.sort_by(|a, b| a.id.cmp(&b.id));
        permissions.sort_by(|a, b| a.id.cmp(&b.id));

        let permission_ids: BTreeSet<&str> = permissions.iter().map(|p| p.id.as_str()).collect();
        let mut committed: BTreeSet<Cell> = BTreeSet::new();
        for role in &roles {
            for permission_id in &role.permissions {
                if permission_ids.contains(permission_id.as_str()) {
                    committed.insert((role.id.clone(), permission_id.clone()));
                }
            }
        }

        let inherited = if scope.show_inherited {
            let mut inherited = BTreeSet::new();
            for role in &roles {
                let effective = engine.hierarchy().resolve_effective_permissions(&role.id)?;
                for grant in effective.iter().filter(|g| !g.is_direct()) {
                    if permission_ids.contains(grant.permission_id.as_str()) {
                        inherited.insert((role.id.clone(), grant.permission_id.clone()));
                    }
                }
            }
            inherited
        } else {
            BTreeSet::new()
        };

        debug!(
            roles = roles.len(),
            permissions = permissions.len(),
            granted = committed.len(),
            mode = %mode,
            "Constructed permission matrix"
        );

        Ok(Self {
            writer: engine.matrix_writer(),
            mode,
            show_inherited: scope.show_inherited,
            roles: roles
                .into_iter()
                .map(|r| RoleColumn {
                    id: r.id,
                    name: r.name,
                    domain: r.domain,
                })
                .collect(),
            permissions: permissions
                .into_iter()
                .map(|p| PermissionRow {
                    conditional: !p.is_unconditional(),
                    id: p.id,
                    action: p.action,
                    resource_type: p.resource_type,
                })
                .collect(),
            committed,
            inherited,
            pending: Vec::new(),
        })
    }

    pub fn mode(&self) -> MatrixMode {
        self.mode
    }

    pub fn roles(&self) -> &[RoleColumn] {
        &self.roles
    }

    pub fn permissions(&self) -> &[PermissionRow] {
        &self.permissions
    }

    pub fn pending_changes(&self) -> &[MatrixChange] {
        &self.pending
    }

    pub fn has_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Stored state of a cell, ignoring pending changes
    pub fn is_committed(&self, role_id: &str, permission_id: &str) -> Result<bool> {
        self.ensure_cell(role_id, permission_id)?;
        Ok(self.committed_contains(role_id, permission_id))
    }

    /// State of a cell with pending changes applied
    pub fn is_granted(&self, role_id: &str, permission_id: &str) -> Result<bool> {
        self.ensure_cell(role_id, permission_id)?;
        Ok(self.effective_state(role_id, permission_id))
    }

    /// Stage a flip relative to committed state; toggling again cancels it
    pub fn toggle(&mut self, role_id: &str, permission_id: &str) -> Result<()> {
        self.ensure_editable("toggle")?;
        self.ensure_cell(role_id, permission_id)?;

        if let Some(pos) = self.pending_index(role_id, permission_id) {
            self.pending.remove(pos);
        } else {
            let granted = !self.committed_contains(role_id, permission_id);
            self.pending.push(MatrixChange::new(role_id, permission_id, granted));
        }
        Ok(())
    }

    /// Stage an explicit target; a target equal to committed state clears the cell
    pub fn set(&mut self, role_id: &str, permission_id: &str, granted: bool) -> Result<()> {
        self.ensure_editable("set")?;
        self.ensure_cell(role_id, permission_id)?;

        if let Some(pos) = self.pending_index(role_id, permission_id) {
            self.pending.remove(pos);
        }
        if granted != self.committed_contains(role_id, permission_id) {
            self.pending.push(MatrixChange::new(role_id, permission_id, granted));
        }
        Ok(())
    }

    /// Write pending changes as independent storage writes
    ///
    /// Successful cells become committed; failed cells stay pending so the
    /// caller can retry or discard them. Partial failures are not rolled back.
    pub fn apply_changes(&mut self) -> Result<MatrixApplyReport> {
        self.ensure_editable("apply changes to")?;

        if self.pending.is_empty() {
            return Ok(MatrixApplyReport::default());
        }

        let outcomes = self.writer.write(&self.pending);
        let mut report = MatrixApplyReport::default();

        for outcome in outcomes {
            if outcome.is_success() {
                let change = outcome.change;
                let cell = (change.role_id.clone(), change.permission_id.clone());
                if change.granted {
                    self.committed.insert(cell);
                } else {
                    self.committed.remove(&cell);
                }
                if let Some(pos) = self.pending_index(&change.role_id, &change.permission_id) {
                    self.pending.remove(pos);
                }
                report.applied.push(change);
            } else {
                warn!(
                    role_id = %outcome.change.role_id,
                    permission_id = %outcome.change.permission_id,
                    error = ?outcome.error,
                    "Matrix change failed"
                );
                report.failed.push(outcome);
            }
        }

        info!(
            applied = report.applied.len(),
            failed = report.failed.len(),
            "Applied permission matrix changes"
        );
        Ok(report)
    }

    /// Drop every pending change without touching storage
    pub fn discard_changes(&mut self) {
        self.pending.clear();
    }

    /// Committed state overlaid with pending changes
    pub fn export(&self) -> MatrixExport {
        let mut cells = Vec::new();
        for permission in &self.permissions {
            for role in &self.roles {
                let granted = self.effective_state(&role.id, &permission.id);
                let inherited = self.is_inherited(&role.id, &permission.id);
                if granted || inherited {
                    cells.push(MatrixCell {
                        role_id: role.id.clone(),
                        permission_id: permission.id.clone(),
                        granted,
                        inherited: inherited && !granted,
                        pending: self.pending_index(&role.id, &permission.id).is_some(),
                    });
                }
            }
        }

        MatrixExport {
            mode: self.mode,
            roles: self.roles.clone(),
            permissions: self.permissions.clone(),
            cells,
            pending_changes: self.pending.clone(),
        }
    }

    /// Granted permission ids per role, pending changes applied
    pub fn grants_by_role(&self) -> BTreeMap<RoleId, Vec<PermissionId>> {
        self.roles
            .iter()
            .map(|role| {
                let granted = self
                    .permissions
                    .iter()
                    .filter(|p| self.effective_state(&role.id, &p.id))
                    .map(|p| p.id.clone())
                    .collect();
                (role.id.clone(), granted)
            })
            .collect()
    }

    fn ensure_editable(&self, operation: &str) -> Result<()> {
        match self.mode {
            MatrixMode::Editable => Ok(()),
            MatrixMode::ReadOnly => Err(AuthzError::Mode(format!(
                "cannot {} a read-only permission matrix",
                operation
            ))),
        }
    }

    fn ensure_cell(&self, role_id: &str, permission_id: &str) -> Result<()> {
        if !self.roles.iter().any(|r| r.id == role_id) {
            return Err(AuthzError::not_found(EntityKind::Role, role_id));
        }
        if !self.permissions.iter().any(|p| p.id == permission_id) {
            return Err(AuthzError::not_found(EntityKind::Permission, permission_id));
        }
        Ok(())
    }

    fn committed_contains(&self, role_id: &str, permission_id: &str) -> bool {
        self.committed
            .contains(&(role_id.to_string(), permission_id.to_string()))
    }

    fn is_inherited(&self, role_id: &str, permission_id: &str) -> bool {
        self.inherited
            .contains(&(role_id.to_string(), permission_id.to_string()))
    }

    fn pending_index(&self, role_id: &str, permission_id: &str) -> Option<usize> {
        self.pending
            .iter()
            .position(|c| c.role_id == role_id && c.permission_id == permission_id)
    }

    fn effective_state(&self, role_id: &str, permission_id: &str) -> bool {
        match self.pending_index(role_id, permission_id) {
            Some(pos) => self.pending[pos].granted,
            None => self.committed_contains(role_id, permission_id),
        }
    }
}

impl fmt::Display for PermissionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.roles.is_empty() || self.permissions.is_empty() {
            return writeln!(f, "Empty matrix - no permissions or roles found");
        }

        let label_width = self
            .permissions
            .iter()
            .map(|p| p.id.chars().count())
            .chain(std::iter::once("Permission".len()))
            .max()
            .unwrap_or(0);
        let widths: Vec<usize> = self
            .roles
            .iter()
            .map(|r| r.id.chars().count().max(3))
            .collect();

        write!(f, "{:<label_width$}", "Permission")?;
        for (role, width) in self.roles.iter().zip(widths.iter().copied()) {
            write!(f, " │ {:^width$}", role.id)?;
        }
        writeln!(f)?;

        write!(f, "{}", "─".repeat(label_width))?;
        for width in &widths {
            write!(f, "─┼─{}", "─".repeat(*width))?;
        }
        writeln!(f)?;

        for permission in &self.permissions {
            write!(f, "{:<label_width$}", permission.id)?;
            for (role, width) in self.roles.iter().zip(widths.iter().copied()) {
                let symbol = if self.effective_state(&role.id, &permission.id) {
                    "✓"
                } else if self.show_inherited && self.is_inherited(&role.id, &permission.id) {
                    "⇑"
                } else {
                    "✗"
                };
                let marker = if self.pending_index(&role.id, &permission.id).is_some() {
                    "*"
                } else {
                    ""
                };
                write!(f, " │ {:^width$}", format!("{}{}", symbol, marker))?;
            }
            writeln!(f)?;
        }

        if self.has_changes() {
            writeln!(f)?;
            writeln!(f, "{} pending change(s)", self.pending.len())?;
        }
        write!(f, "Mode: {}", self.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::storage::{InMemoryStorage, Storage};
    use crate::types::{Permission, Resource, Role, User};

    fn engine() -> AuthEngine {
        AuthEngine::new(EngineConfig::default(), storage()).unwrap()
    }

    fn storage() -> Arc<InMemoryStorage> {
        let storage = Arc::new(InMemoryStorage::new());
        for (id, action) in [("doc:read", "read"), ("doc:write", "write")] {
            storage
                .persist_permission(Permission::new(id, action, "doc"))
                .unwrap();
        }
        storage
            .persist_role(Role::new("viewer", "Viewer").with_permission("doc:read"))
            .unwrap();
        storage
            .persist_role(Role::new("editor", "Editor").with_parent("viewer"))
            .unwrap();
        storage
    }

    #[test]
    fn test_construct_snapshot() {
        let matrix = PermissionMatrix::construct(&engine(), MatrixMode::ReadOnly).unwrap();

        assert_eq!(matrix.roles().len(), 2);
        assert_eq!(matrix.permissions().len(), 2);
        assert!(matrix.is_granted("viewer", "doc:read").unwrap());
        assert!(!matrix.is_granted("editor", "doc:read").unwrap());
    }

    #[test]
    fn test_read_only_rejects_edits() {
        let mut matrix = PermissionMatrix::construct(&engine(), MatrixMode::ReadOnly).unwrap();

        assert!(matches!(matrix.toggle("viewer", "doc:write"), Err(AuthzError::Mode(_))));
        assert!(matches!(matrix.set("viewer", "doc:write", true), Err(AuthzError::Mode(_))));
        assert!(matches!(matrix.apply_changes(), Err(AuthzError::Mode(_))));
    }

    #[test]
    fn test_toggle_twice_cancels() {
        let mut matrix = PermissionMatrix::construct(&engine(), MatrixMode::Editable).unwrap();

        matrix.toggle("viewer", "doc:write").unwrap();
        assert!(matrix.has_changes());
        assert!(matrix.is_granted("viewer", "doc:write").unwrap());

        matrix.toggle("viewer", "doc:write").unwrap();
        assert!(!matrix.has_changes());
    }

    #[test]
    fn test_set_supersedes_and_clears() {
        let mut matrix = PermissionMatrix::construct(&engine(), MatrixMode::Editable).unwrap();

        matrix.toggle("viewer", "doc:read").unwrap();
        assert!(!matrix.pending_changes()[0].granted);

        matrix.set("viewer", "doc:read", true).unwrap();
        assert!(!matrix.has_changes());

        matrix.set("editor", "doc:write", true).unwrap();
        matrix.set("editor", "doc:write", true).unwrap();
        assert_eq!(matrix.pending_changes().len(), 1);
    }

    #[test]
    fn test_unknown_cell() {
        let mut matrix = PermissionMatrix::construct(&engine(), MatrixMode::Editable).unwrap();

        let err = matrix.toggle("ghost", "doc:read").unwrap_err();
        assert!(matches!(err, AuthzError::NotFound { kind: EntityKind::Role, .. }));

        let err = matrix.set("viewer", "doc:delete", true).unwrap_err();
        assert!(matches!(err, AuthzError::NotFound { kind: EntityKind::Permission, .. }));
    }

    #[test]
    fn test_apply_commits_to_storage() {
        let storage = storage();
        let engine = AuthEngine::new(EngineConfig::default(), storage.clone()).unwrap();
        let mut matrix = PermissionMatrix::construct(&engine, MatrixMode::Editable).unwrap();

        matrix.set("editor", "doc:write", true).unwrap();
        matrix.toggle("viewer", "doc:read").unwrap();

        let report = matrix.apply_changes().unwrap();
        assert!(report.is_complete());
        assert_eq!(report.applied_count(), 2);
        assert_eq!(report.affected_roles().len(), 2);
        assert!(!matrix.has_changes());

        assert!(storage.get_role("editor").unwrap().unwrap().has_permission("doc:write"));
        assert!(!storage.get_role("viewer").unwrap().unwrap().has_permission("doc:read"));
        assert!(matrix.is_committed("editor", "doc:write").unwrap());
    }

    #[test]
    fn test_export_does_not_mutate_pending() {
        let mut matrix = PermissionMatrix::construct(&engine(), MatrixMode::Editable).unwrap();
        matrix.toggle("editor", "doc:write").unwrap();

        let export = matrix.export();
        assert_eq!(export.pending_changes.len(), 1);
        assert!(export
            .cells
            .iter()
            .any(|c| c.role_id == "editor" && c.permission_id == "doc:write" && c.granted && c.pending));
        assert!(matrix.has_changes());

        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["mode"], "editable");
    }

    #[test]
    fn test_scoped_construction() {
        let matrix = PermissionMatrix::construct_scoped(
            &engine(),
            MatrixScope::new().with_roles(["viewer"]).with_permissions(["doc:read"]),
            MatrixMode::ReadOnly,
        )
        .unwrap();
        assert_eq!(matrix.roles().len(), 1);
        assert_eq!(matrix.permissions().len(), 1);

        let missing = PermissionMatrix::construct_scoped(
            &engine(),
            MatrixScope::new().with_roles(["ghost"]),
            MatrixMode::ReadOnly,
        );
        assert!(matches!(missing, Err(AuthzError::NotFound { .. })));
    }

    #[test]
    fn test_inherited_cells() {
        let matrix = PermissionMatrix::construct_scoped(
            &engine(),
            MatrixScope::new().show_inherited(true),
            MatrixMode::ReadOnly,
        )
        .unwrap();

        let export = matrix.export();
        let cell = export
            .cells
            .iter()
            .find(|c| c.role_id == "editor" && c.permission_id == "doc:read")
            .unwrap();
        assert!(cell.inherited);
        assert!(!cell.granted);
        assert!(matrix.to_string().contains('⇑'));
    }

    #[test]
    fn test_display_table() {
        let mut matrix = PermissionMatrix::construct(&engine(), MatrixMode::Editable).unwrap();
        matrix.toggle("editor", "doc:write").unwrap();

        let table = matrix.to_string();
        assert!(table.starts_with("Permission"));
        assert!(table.contains("✓"));
        assert!(table.contains("✗"));
        assert!(table.contains("✓*"));
        assert!(table.contains("1 pending change(s)"));
        assert!(table.ends_with("Mode: editable"));
    }

    #[test]
    fn test_revoke_drops_memo_and_cached_allow() {
        let engine = engine();
        engine.create_user(User::new("u")).unwrap();
        engine.assign_role("u", "editor", None, None).unwrap();

        let doc = Resource::new("doc:1");
        assert!(engine.check_permission("u", "read", &doc, None).allowed);
        assert_eq!(engine.cache_stats().unwrap().entries, 1);

        let mut matrix = PermissionMatrix::construct(&engine, MatrixMode::Editable).unwrap();
        matrix.set("viewer", "doc:read", false).unwrap();
        assert!(matrix.apply_changes().unwrap().is_complete());

        assert_eq!(engine.cache_stats().unwrap().entries, 0);
        assert_eq!(engine.hierarchy().stats().memoized_roles, 0);
        assert!(!engine.check_permission("u", "read", &doc, None).allowed);
    }
}

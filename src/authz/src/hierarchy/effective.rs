//! Resolved permission sets

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::types::{PermissionId, RoleId};

/// One permission reachable from a role, with where it came from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub permission_id: PermissionId,

    /// 0 = granted directly, 1 = by the parent, and so on
    pub depth: usize,

    /// Role that grants the permission directly
    pub source_role: RoleId,
}

impl PermissionGrant {
    pub fn new(permission_id: impl Into<PermissionId>, depth: usize, source_role: impl Into<RoleId>) -> Self {
        Self {
            permission_id: permission_id.into(),
            depth,
            source_role: source_role.into(),
        }
    }

    pub fn is_direct(&self) -> bool {
        self.depth == 0
    }
}

/// De-duplicated permission set ordered by specificity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectivePermissions {
    grants: Vec<PermissionGrant>,
    ids: BTreeSet<PermissionId>,
}

impl EffectivePermissions {
    /// Build from raw grants, keeping each permission at its smallest depth
    pub fn from_grants(mut grants: Vec<PermissionGrant>) -> Self {
        grants.sort_by(|a, b| {
            a.depth
                .cmp(&b.depth)
                .then_with(|| a.permission_id.cmp(&b.permission_id))
                .then_with(|| a.source_role.cmp(&b.source_role))
        });

        let mut ids = BTreeSet::new();
        grants.retain(|grant| ids.insert(grant.permission_id.clone()));

        Self { grants, ids }
    }

    /// Merge several resolved sets
    pub fn union<'a>(sets: impl IntoIterator<Item = &'a EffectivePermissions>) -> Self {
        Self::from_grants(
            sets.into_iter()
                .flat_map(|set| set.grants.iter().cloned())
                .collect(),
        )
    }

    /// Grants in specificity order
    pub fn grants(&self) -> &[PermissionGrant] {
        &self.grants
    }

    pub fn ids(&self) -> &BTreeSet<PermissionId> {
        &self.ids
    }

    pub fn contains(&self, permission_id: &str) -> bool {
        self.ids.contains(permission_id)
    }

    pub fn get(&self, permission_id: &str) -> Option<&PermissionGrant> {
        self.grants.iter().find(|g| g.permission_id == permission_id)
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PermissionGrant> {
        self.grants.iter()
    }
}

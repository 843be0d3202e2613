//! Hierarchy resolver with memoized effective permissions

use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::effective::{EffectivePermissions, PermissionGrant};
use crate::error::{AuthzError, EntityKind, Result};
use crate::storage::Storage;
use crate::types::{Role, RoleId};

/// Hierarchy resolver
///
/// Walks parent chains in storage and memoizes each role's effective set.
/// Callers must invalidate a role after changing it, its permissions or its
/// parent; invalidation also drops every transitive descendant.
///
/// # Thread Safety
///
/// The memo is a `DashMap`, so one resolver is shared by every concurrent
/// check. Consistency with concurrent writes is the engine's concern.
#[derive(Clone)]
pub struct HierarchyResolver {
    storage: Arc<dyn Storage>,

    /// role_id -> resolved effective permissions
    memo: Arc<DashMap<RoleId, Arc<EffectivePermissions>>>,

    memoize: bool,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl HierarchyResolver {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            memo: Arc::new(DashMap::new()),
            memoize: true,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_memoization(mut self, enabled: bool) -> Self {
        self.memoize = enabled;
        self
    }

    /// Resolve the permissions a role holds directly or through ancestors
    ///
    /// # Errors
    ///
    /// - `NotFound` if the role or any ancestor is missing
    /// - `Cycle` if a role recurs while walking upward
    pub fn resolve_effective_permissions(&self, role_id: &str) -> Result<Arc<EffectivePermissions>> {
        if self.memoize {
            if let Some(cached) = self.memo.get(role_id) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(cached.clone());
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
        }

        let mut grants = Vec::new();
        for (depth, role) in self.walk_up(role_id)?.into_iter().enumerate() {
            grants.extend(
                role.permissions
                    .iter()
                    .map(|permission_id| PermissionGrant::new(permission_id.clone(), depth, role.id.clone())),
            );
        }

        let effective = Arc::new(EffectivePermissions::from_grants(grants));
        if self.memoize {
            self.memo.insert(role_id.to_string(), effective.clone());
        }

        debug!(role_id = %role_id, permissions = effective.len(), "Resolved effective permissions");
        Ok(effective)
    }

    /// Merge the effective sets of several roles
    pub fn union(&self, role_ids: &[RoleId]) -> Result<EffectivePermissions> {
        let resolved = role_ids
            .iter()
            .map(|id| self.resolve_effective_permissions(id))
            .collect::<Result<Vec<_>>>()?;

        Ok(EffectivePermissions::union(resolved.iter().map(|e| e.as_ref())))
    }

    /// Ancestor ids, nearest first, excluding the role itself
    pub fn ancestors(&self, role_id: &str) -> Result<Vec<RoleId>> {
        Ok(self
            .walk_up(role_id)?
            .into_iter()
            .skip(1)
            .map(|role| role.id)
            .collect())
    }

    /// Transitive children in breadth-first order, excluding the role itself
    pub fn descendants(&self, role_id: &str) -> Result<Vec<RoleId>> {
        let mut visited: HashSet<RoleId> = HashSet::from([role_id.to_string()]);
        let mut queue = VecDeque::from([role_id.to_string()]);
        let mut result = Vec::new();

        while let Some(current) = queue.pop_front() {
            for child in self.storage.list_child_roles(&current)? {
                if !visited.insert(child.id.clone()) {
                    return Err(AuthzError::Cycle {
                        role_id: role_id.to_string(),
                        path: vec![current, child.id],
                    });
                }
                result.push(child.id.clone());
                queue.push_back(child.id);
            }
        }

        Ok(result)
    }

    /// Whether linking `role_id` under `proposed_parent_id` keeps the hierarchy acyclic
    ///
    /// Simulates the new edge: the link is rejected iff `role_id` appears in
    /// the upward walk starting at `proposed_parent_id`.
    pub fn validate_no_cycle(&self, role_id: &str, proposed_parent_id: &str) -> Result<bool> {
        let mut visited = HashSet::new();
        let mut current = Some(proposed_parent_id.to_string());

        while let Some(id) = current {
            if id == role_id {
                return Ok(false);
            }
            if !visited.insert(id.clone()) {
                let mut path: Vec<RoleId> = visited.into_iter().collect();
                path.sort();
                path.push(id.clone());
                return Err(AuthzError::Cycle { role_id: id, path });
            }
            current = self.storage.get_role(&id)?.and_then(|role| role.parent_id);
        }

        Ok(true)
    }

    /// Drop the memo for a role and all its descendants
    pub fn invalidate(&self, role_id: &str) {
        self.memo.remove(role_id);
        match self.descendants(role_id) {
            Ok(descendants) => {
                for id in descendants {
                    self.memo.remove(&id);
                }
            }
            Err(e) => {
                warn!(role_id = %role_id, error = %e, "Descendant walk failed, clearing hierarchy memo");
                self.memo.clear();
            }
        }
    }

    pub fn clear(&self) {
        self.memo.clear();
    }

    pub fn stats(&self) -> HierarchyStats {
        HierarchyStats {
            memoized_roles: self.memo.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// The role followed by its ancestors, nearest first
    fn walk_up(&self, role_id: &str) -> Result<Vec<Role>> {
        let mut chain: Vec<Role> = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(role_id.to_string());

        while let Some(id) = current {
            if !visited.insert(id.clone()) {
                let mut path: Vec<RoleId> = chain.into_iter().map(|role| role.id).collect();
                path.push(id);
                warn!(role_id = %role_id, path = ?path, "Cycle detected in stored role hierarchy");
                return Err(AuthzError::Cycle {
                    role_id: role_id.to_string(),
                    path,
                });
            }

            let role = self
                .storage
                .get_role(&id)?
                .ok_or_else(|| AuthzError::not_found(EntityKind::Role, &id))?;
            current = role.parent_id.clone();
            chain.push(role);
        }

        Ok(chain)
    }
}

/// Hierarchy memo statistics
#[derive(Debug, Clone, Default)]
pub struct HierarchyStats {
    /// Number of memoized roles
    pub memoized_roles: usize,
    pub hits: u64,
    pub misses: u64,
}

impl HierarchyStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

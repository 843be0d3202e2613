//! Role hierarchy resolution
//!
//! Roles form a forest through their optional single `parent_id`. A role
//! inherits every permission of its ancestors. This module provides:
//!
//! - **HierarchyResolver**: upward walks with a visited-set cycle guard,
//!   memoized per role in a `DashMap`
//! - **EffectivePermissions**: the resolved set plus grants ordered by
//!   specificity (direct before inherited, nearer before farther)

mod effective;
mod resolver;

pub use effective::{EffectivePermissions, PermissionGrant};
pub use resolver::{HierarchyResolver, HierarchyStats};

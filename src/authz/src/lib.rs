//! # RBAC Authorization Engine
//!
//! Embeddable role- and attribute-based authorization decisions.
//!
//! ## Features
//!
//! - **Role hierarchy** with single-parent inheritance and two-layer cycle defense
//! - **ABAC conditions** over `user.*`, `resource.*` and `time.*` with templates
//! - **Multi-tenant domains** for role assignments
//! - **Decision caching** keyed by BLAKE3 request fingerprints
//! - **Audit records** for every decision
//! - **Permission matrix** for staged, bulk role/permission edits
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rbac_authz::{AuthEngine, EngineConfig, InMemoryStorage, Permission, Resource, Role, User};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = AuthEngine::new(EngineConfig::default(), Arc::new(InMemoryStorage::new()))?;
//!
//!     engine.create_permission(Permission::new("doc:read", "read", "document"))?;
//!     engine.create_role(Role::new("viewer", "Viewer").with_permission("doc:read"))?;
//!     engine.create_user(User::new("alice"))?;
//!     engine.assign_role("alice", "viewer", None, None)?;
//!
//!     let result = engine.check_permission("alice", "read", &Resource::new("document:123"), None);
//!
//!     if result.allowed {
//!         println!("Access granted!");
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod cache;
pub mod clock;
pub mod condition;
pub mod engine;
pub mod error;
pub mod hierarchy;
pub mod matrix;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use audit::{AuditError, AuditLogger, AuditRecord, InMemoryAuditLogger, TracingAuditLogger};
pub use cache::{CacheProvider, CacheStats, InMemoryCache};
pub use clock::{Clock, FixedClock, SystemClock};
pub use condition::{Condition, EvalContext, Operator, PolicyEvaluator};
pub use engine::{AuthEngine, CheckRequest, CheckResult, DecisionReason, EngineConfig};
pub use error::{AuthzError, EntityKind, Result};
pub use hierarchy::{EffectivePermissions, HierarchyResolver};
pub use matrix::{MatrixMode, MatrixScope, PermissionMatrix};
pub use storage::{InMemoryStorage, Storage};
pub use types::{AttributeValue, Permission, Resource, Role, RoleAssignment, User, UserStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

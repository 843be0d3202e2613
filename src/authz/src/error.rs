//! Error types for the authorization engine

use std::fmt;
use thiserror::Error;

use crate::condition::{ConditionError, ConditionIssue};

/// Kind of entity referenced by a [`AuthzError::NotFound`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    User,
    Role,
    Permission,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Role => write!(f, "role"),
            Self::Permission => write!(f, "permission"),
        }
    }
}

/// Authorization engine errors
///
/// Decision outcomes (unknown user, suspended user, no matching permission,
/// unmet conditions) are never errors; they are `CheckResult` values.
#[derive(Debug, Error)]
pub enum AuthzError {
    /// Malformed input or a mutation that would break an invariant
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Exhaustive report of every invalid predicate in a condition
    #[error("Invalid conditions: {}", format_issues(.0))]
    InvalidConditions(Vec<ConditionIssue>),

    /// Incomparable values during condition evaluation
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    /// Cycle detected while walking the role hierarchy
    #[error("Cycle detected in role hierarchy: {}", .path.join(" -> "))]
    Cycle { role_id: String, path: Vec<String> },

    /// Mutation attempted on a read-only permission matrix
    #[error("Mode error: {0}")]
    Mode(String),

    /// Referenced entity is absent
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// Raised only by `AuthEngine::require_permission`
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Storage collaborator failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthzError {
    pub(crate) fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<ConditionError> for AuthzError {
    fn from(err: ConditionError) -> Self {
        match err {
            ConditionError::Invalid(issues) => Self::InvalidConditions(issues),
            ConditionError::InvalidPath(msg) => Self::Validation(msg),
            other => Self::Evaluation(other.to_string()),
        }
    }
}

fn format_issues(issues: &[ConditionIssue]) -> String {
    issues
        .iter()
        .map(|issue| issue.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for authorization operations
pub type Result<T> = std::result::Result<T, AuthzError>;

//! Check requests and decision results

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{PermissionId, Resource, UserId};

/// Single authorization question, used by `AuthEngine::batch_check`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub user_id: UserId,

    pub action: String,

    pub resource: Resource,

    /// Tenant to evaluate in; `None` considers global assignments only
    #[serde(default)]
    pub domain: Option<String>,
}

impl CheckRequest {
    pub fn new(user_id: impl Into<UserId>, action: impl Into<String>, resource: Resource) -> Self {
        Self {
            user_id: user_id.into(),
            action: action.into(),
            resource,
            domain: None,
        }
    }

    pub fn in_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

/// Outcome of a single check
///
/// Built fresh for every check and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub allowed: bool,

    pub reason: DecisionReason,

    /// Permission that granted access
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_permission: Option<PermissionId>,

    /// Diagnostic detail for evaluation and internal errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckResult {
    /// Create an allow result
    pub fn allow(reason: DecisionReason, permission_id: impl Into<PermissionId>) -> Self {
        Self {
            allowed: true,
            reason,
            matched_permission: Some(permission_id.into()),
            message: None,
        }
    }

    /// Create a deny result
    pub fn deny(reason: DecisionReason) -> Self {
        Self {
            allowed: false,
            reason,
            matched_permission: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Error outcomes are recomputed on every check
    pub fn is_cacheable(&self) -> bool {
        !self.reason.is_error()
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.allowed { "allow" } else { "deny" };
        match &self.matched_permission {
            Some(permission) => write!(f, "{} ({}, {})", verdict, self.reason, permission),
            None => write!(f, "{} ({})", verdict, self.reason),
        }
    }
}

/// Reason for authorization decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// A reachable permission matched and its conditions held
    PermissionGranted,

    UserNotFound,

    UserSuspended,

    /// No reachable permission covers the action and resource type
    NoMatchingPermission,

    /// Candidates exist but none had its conditions satisfied
    ConditionsNotMet,

    /// Every candidate failed to evaluate
    EvaluationError,

    /// Storage or hierarchy failure during the check
    InternalError,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermissionGranted => "permission_granted",
            Self::UserNotFound => "user_not_found",
            Self::UserSuspended => "user_suspended",
            Self::NoMatchingPermission => "no_matching_permission",
            Self::ConditionsNotMet => "conditions_not_met",
            Self::EvaluationError => "evaluation_error",
            Self::InternalError => "internal_error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::EvaluationError | Self::InternalError)
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_result() {
        let result = CheckResult::allow(DecisionReason::PermissionGranted, "doc:read");

        assert!(result.allowed);
        assert_eq!(result.matched_permission.as_deref(), Some("doc:read"));
        assert!(result.is_cacheable());
        assert_eq!(result.to_string(), "allow (permission_granted, doc:read)");
    }

    #[test]
    fn test_error_results_not_cacheable() {
        let result = CheckResult::deny(DecisionReason::InternalError).with_message("storage offline");

        assert!(!result.allowed);
        assert!(!result.is_cacheable());
        assert!(!CheckResult::deny(DecisionReason::EvaluationError).is_cacheable());
        assert!(CheckResult::deny(DecisionReason::ConditionsNotMet).is_cacheable());
    }

    #[test]
    fn test_request_serialization() {
        let request = CheckRequest::new("alice", "read", Resource::new("doc:1")).in_domain("acme");
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["resource"]["type"], "doc");
        assert_eq!(json["domain"], "acme");

        let back: CheckRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }
}

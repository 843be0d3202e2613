//! Error types for condition parsing and evaluation

use std::fmt;
use thiserror::Error;

/// One structurally invalid predicate found during validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionIssue {
    /// Position of the predicate in the condition list
    pub index: usize,
    /// Field path as written
    pub field: String,
    pub message: String,
}

impl ConditionIssue {
    pub fn new(index: usize, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            index,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConditionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "predicate {} ({}): {}", self.index, self.field, self.message)
    }
}

/// Condition errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("Invalid field path: {0}")]
    InvalidPath(String),

    #[error("{} invalid predicate(s)", .0.len())]
    Invalid(Vec<ConditionIssue>),

    #[error("Cannot apply '{operator}' to {left} and {right}")]
    Incomparable {
        operator: String,
        left: &'static str,
        right: &'static str,
    },

    #[error("Invalid regex '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },
}

/// Result type for condition operations
pub type Result<T> = std::result::Result<T, ConditionError>;

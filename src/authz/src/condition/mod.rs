//! Attribute-based conditions attached to permissions
//!
//! A condition is an AND-list of `{field, operator, operand}` predicates
//! evaluated against the `user.*`, `resource.*` and `time.*` namespaces.

pub mod context;
pub mod error;
pub mod evaluator;
pub mod types;

pub use context::EvalContext;
pub use error::{ConditionError, ConditionIssue, Result};
pub use evaluator::{EvaluatorStats, PolicyEvaluator};
pub use types::{
    Condition, ConditionBuilder, FieldPath, Namespace, Operand, Operator, Predicate, RawCondition,
    RawPredicate, TemplatePart,
};

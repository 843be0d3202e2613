//! Predicate evaluation with compiled regex caching

use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::sync::Arc;

use super::context::EvalContext;
use super::error::{ConditionError, Result};
use super::types::{Condition, Operand, Operator, Predicate, RawPredicate, TemplatePart};
use crate::types::AttributeValue;

/// Evaluates condition trees against an [`EvalContext`]
///
/// Stateless apart from the regex cache, so one instance is shared by every
/// check running in parallel.
pub struct PolicyEvaluator {
    /// Anchored regexes keyed by the pattern as written
    regex_cache: Arc<DashMap<String, Arc<Regex>>>,
}

impl PolicyEvaluator {
    pub fn new() -> Self {
        Self {
            regex_cache: Arc::new(DashMap::new()),
        }
    }

    /// Evaluate every predicate, AND-ed; an empty condition is satisfied
    ///
    /// # Errors
    /// Returns [`ConditionError::Incomparable`] when an operator is applied to
    /// values it cannot compare. A missing field is a plain `false`.
    pub fn evaluate_conditions(&self, condition: &Condition, ctx: &EvalContext) -> Result<bool> {
        for predicate in condition.predicates() {
            if !self.evaluate_predicate(predicate, ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Exhaustively validate raw predicates into a typed condition
    pub fn validate_conditions(&self, raw: &[RawPredicate]) -> Result<Condition> {
        Condition::parse(raw)
    }

    /// Validate a raw condition in either JSON shape
    pub fn validate_json(&self, raw: &Value) -> Result<Condition> {
        Condition::from_json(raw)
    }

    pub fn evaluate_predicate(&self, predicate: &Predicate, ctx: &EvalContext) -> Result<bool> {
        let Some(left) = ctx.resolve(&predicate.field) else {
            return Ok(false);
        };
        let Some(right) = resolve_operand(&predicate.operand, ctx) else {
            return Ok(false);
        };

        self.apply(predicate.operator, left, &right)
    }

    fn apply(&self, operator: Operator, left: &AttributeValue, right: &AttributeValue) -> Result<bool> {
        let incomparable = || ConditionError::Incomparable {
            operator: operator.symbol().to_string(),
            left: left.type_name(),
            right: right.type_name(),
        };

        match operator {
            Operator::Eq => Ok(values_equal(left, right)),
            Operator::Ne => Ok(!values_equal(left, right)),
            Operator::Gt | Operator::Lt | Operator::Ge | Operator::Le => {
                let ordering = compare(left, right).ok_or_else(incomparable)?;
                Ok(match operator {
                    Operator::Gt => ordering == Ordering::Greater,
                    Operator::Lt => ordering == Ordering::Less,
                    Operator::Ge => ordering != Ordering::Less,
                    _ => ordering != Ordering::Greater,
                })
            }
            Operator::In | Operator::NotIn => {
                let found = membership(right, left).ok_or_else(incomparable)?;
                Ok(found == (operator == Operator::In))
            }
            Operator::Contains => membership(left, right).ok_or_else(incomparable),
            Operator::StartsWith | Operator::EndsWith => {
                let (Some(text), Some(affix)) = (scalar_text(left), scalar_text(right)) else {
                    return Err(incomparable());
                };
                Ok(if operator == Operator::StartsWith {
                    text.starts_with(&*affix)
                } else {
                    text.ends_with(&*affix)
                })
            }
            Operator::Matches => {
                let (Some(text), AttributeValue::String(pattern)) = (scalar_text(left), right) else {
                    return Err(incomparable());
                };
                let regex = self.compile(pattern)?;
                Ok(regex.is_match(&text))
            }
        }
    }

    fn compile(&self, pattern: &str) -> Result<Arc<Regex>> {
        if let Some(regex) = self.regex_cache.get(pattern) {
            return Ok(regex.clone());
        }

        // Anchor at the start of the value, leave the end open
        let regex = Regex::new(&format!("^(?:{})", pattern)).map_err(|e| ConditionError::InvalidRegex {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        let regex = Arc::new(regex);
        self.regex_cache.insert(pattern.to_string(), regex.clone());
        Ok(regex)
    }

    pub fn clear_cache(&self) {
        self.regex_cache.clear();
    }

    pub fn cache_stats(&self) -> EvaluatorStats {
        EvaluatorStats {
            regex_cache_size: self.regex_cache.len(),
        }
    }
}

impl Default for PolicyEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluator cache statistics
#[derive(Debug, Clone)]
pub struct EvaluatorStats {
    /// Number of compiled regexes
    pub regex_cache_size: usize,
}

fn resolve_operand<'a>(operand: &'a Operand, ctx: &'a EvalContext) -> Option<Cow<'a, AttributeValue>> {
    match operand {
        Operand::Literal(value) => Some(Cow::Borrowed(value)),
        Operand::Reference(path) => ctx.resolve(path).map(Cow::Borrowed),
        Operand::Template(parts) => {
            let mut text = String::new();
            for part in parts {
                match part {
                    TemplatePart::Text(s) => text.push_str(s),
                    TemplatePart::Reference(path) => text.push_str(&ctx.resolve(path)?.as_text()?),
                }
            }
            Some(Cow::Owned(AttributeValue::String(text)))
        }
    }
}

fn scalar_text(value: &AttributeValue) -> Option<Cow<'_, str>> {
    match value {
        AttributeValue::String(s) => Some(Cow::Borrowed(s.as_str())),
        other => other.as_text().map(Cow::Owned),
    }
}

fn values_equal(left: &AttributeValue, right: &AttributeValue) -> bool {
    use AttributeValue::*;

    match (left, right) {
        (String(a), String(b)) => a == b,
        (List(a), List(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y)),
        (Null, Null) => true,
        (Null, _) | (_, Null) | (List(_), _) | (_, List(_)) => false,
        (Bool(b), String(s)) | (String(s), Bool(b)) => *b == matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"),
        _ => match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => a == b,
            _ => left.as_text() == right.as_text(),
        },
    }
}

fn compare(left: &AttributeValue, right: &AttributeValue) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        return a.partial_cmp(&b);
    }
    match (left, right) {
        (AttributeValue::String(a), AttributeValue::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Whether `haystack` holds `needle`: list membership or substring
fn membership(haystack: &AttributeValue, needle: &AttributeValue) -> Option<bool> {
    match haystack {
        AttributeValue::List(items) => Some(items.iter().any(|item| values_equal(item, needle))),
        AttributeValue::String(s) => scalar_text(needle).map(|n| s.contains(&*n)),
        _ => None,
    }
}

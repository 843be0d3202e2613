//! Typed condition trees and their parsing from raw JSON
//!
//! Conditions arrive as untrusted JSON in one of two shapes:
//!
//! ```text
//! list: [{"field": "user.level", "op": ">", "value": 5}]
//! map:  {"user.level": {">": 5, "<": 10}}
//! ```
//!
//! Both are validated exhaustively into a [`Condition`], a list of predicates
//! that are AND-ed together.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::error::{ConditionError, ConditionIssue, Result};
use crate::types::AttributeValue;

/// Context namespace a field path resolves against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    User,
    Resource,
    Time,
}

impl Namespace {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "resource" => Some(Self::Resource),
            "time" => Some(Self::Time),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Resource => "resource",
            Self::Time => "time",
        }
    }
}

/// Parsed dotted path such as `resource.owner_id` or `user.tags[0]`
///
/// Everything after the namespace is the attribute key, so keys may contain
/// dots (`user.address.city` looks up the key `address.city`). List indices
/// are only allowed at the end.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    raw: String,
    namespace: Namespace,
    key: String,
    indices: Vec<usize>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| ConditionError::InvalidPath(format!("'{}': {}", raw, reason));

        if raw.is_empty() {
            return Err(invalid("empty field path"));
        }

        let (base, index_part) = match raw.find('[') {
            Some(pos) => (&raw[..pos], &raw[pos..]),
            None => (raw, ""),
        };

        let mut parts = base.split('.');
        let namespace_part = parts.next().unwrap_or_default();
        let namespace = Namespace::parse(namespace_part)
            .ok_or_else(|| invalid("namespace must be one of user, resource, time"))?;

        let segments: Vec<&str> = parts.collect();
        if segments.is_empty() {
            return Err(invalid("expected '<namespace>.<key>'"));
        }
        for segment in &segments {
            if segment.is_empty() {
                return Err(invalid("empty path segment"));
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(invalid("segments may only contain letters, digits, '_' and '-'"));
            }
        }

        let indices = parse_indices(index_part).ok_or_else(|| invalid("malformed list index"))?;

        Ok(Self {
            raw: raw.to_string(),
            namespace,
            key: segments.join("."),
            indices,
        })
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn parse_indices(mut rest: &str) -> Option<Vec<usize>> {
    let mut indices = Vec::new();
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        indices.push(inner[..close].parse::<usize>().ok()?);
        rest = &inner[close + 1..];
    }
    Some(indices)
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for FieldPath {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Comparison operator of a predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    In,
    NotIn,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
}

impl Operator {
    pub const ALL: [Operator; 12] = [
        Self::Eq,
        Self::Ne,
        Self::Gt,
        Self::Lt,
        Self::Ge,
        Self::Le,
        Self::In,
        Self::NotIn,
        Self::Contains,
        Self::StartsWith,
        Self::EndsWith,
        Self::Matches,
    ];

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::Contains => "contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::Matches => "matches",
        }
    }

    pub fn is_ordering(&self) -> bool {
        matches!(self, Self::Gt | Self::Lt | Self::Ge | Self::Le)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        let op = match s {
            "==" | "eq" => Self::Eq,
            "!=" | "ne" => Self::Ne,
            ">" | "gt" => Self::Gt,
            "<" | "lt" => Self::Lt,
            ">=" | "ge" | "gte" => Self::Ge,
            "<=" | "le" | "lte" => Self::Le,
            "in" => Self::In,
            "not_in" | "not in" => Self::NotIn,
            "contains" => Self::Contains,
            "starts_with" | "startswith" => Self::StartsWith,
            "ends_with" | "endswith" => Self::EndsWith,
            "matches" | "regex" => Self::Matches,
            other => return Err(format!("unknown operator '{}'", other)),
        };
        Ok(op)
    }
}

impl Serialize for Operator {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.symbol())
    }
}

impl<'de> Deserialize<'de> for Operator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Piece of an interpolated string operand
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Reference(FieldPath),
}

/// Right-hand side of a predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Fixed value
    Literal(AttributeValue),
    /// Whole operand is `{{path}}`; resolves to the referenced value unchanged
    Reference(FieldPath),
    /// String with embedded `{{path}}` references; resolves to text
    Template(Vec<TemplatePart>),
}

impl Operand {
    /// Parse a raw JSON operand, detecting `{{...}}` references in strings
    pub fn parse(value: &Value) -> std::result::Result<Self, String> {
        if let Value::String(s) = value {
            if let Some(parts) = parse_template(s)? {
                if let [TemplatePart::Reference(path)] = parts.as_slice() {
                    return Ok(Self::Reference(path.clone()));
                }
                return Ok(Self::Template(parts));
            }
        }
        json_to_attribute(value).map(Self::Literal)
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Literal(value) => attribute_to_json(value),
            Self::Reference(path) => Value::String(format!("{{{{{}}}}}", path)),
            Self::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Text(text) => out.push_str(text),
                        TemplatePart::Reference(path) => {
                            out.push_str("{{");
                            out.push_str(path.as_str());
                            out.push_str("}}");
                        }
                    }
                }
                Value::String(out)
            }
        }
    }

    /// Field paths this operand reads from the context
    pub fn references(&self) -> Vec<&FieldPath> {
        match self {
            Self::Literal(_) => Vec::new(),
            Self::Reference(path) => vec![path],
            Self::Template(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    TemplatePart::Reference(path) => Some(path),
                    TemplatePart::Text(_) => None,
                })
                .collect(),
        }
    }
}

fn parse_template(s: &str) -> std::result::Result<Option<Vec<TemplatePart>>, String> {
    if !s.contains("{{") {
        return Ok(None);
    }

    let mut parts = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            parts.push(TemplatePart::Text(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| format!("unterminated template in '{}'", s))?;
        let path = FieldPath::parse(after[..end].trim()).map_err(|e| e.to_string())?;
        parts.push(TemplatePart::Reference(path));
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        parts.push(TemplatePart::Text(rest.to_string()));
    }

    Ok(Some(parts))
}

pub(crate) fn json_to_attribute(value: &Value) -> std::result::Result<AttributeValue, String> {
    match value {
        Value::Null => Ok(AttributeValue::Null),
        Value::Bool(b) => Ok(AttributeValue::Bool(*b)),
        Value::Number(n) => n
            .as_f64()
            .map(AttributeValue::Number)
            .ok_or_else(|| format!("number {} is not representable", n)),
        Value::String(s) => Ok(AttributeValue::String(s.clone())),
        Value::Array(items) => items
            .iter()
            .map(json_to_attribute)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(AttributeValue::List),
        Value::Object(_) => Err("objects are not supported as operands".to_string()),
    }
}

fn attribute_to_json(value: &AttributeValue) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Single `{field path, operator, operand}` test
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: FieldPath,
    pub operator: Operator,
    pub operand: Operand,
}

impl Predicate {
    fn reads_namespace(&self, namespace: Namespace) -> bool {
        self.field.namespace() == namespace
            || self
                .operand
                .references()
                .iter()
                .any(|path| path.namespace() == namespace)
    }
}

/// Untrusted predicate as it appears in JSON list form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPredicate {
    pub field: String,

    #[serde(alias = "operator")]
    pub op: String,

    #[serde(default)]
    pub value: Value,
}

impl RawPredicate {
    pub fn new(field: impl Into<String>, op: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: op.into(),
            value: value.into(),
        }
    }
}

/// Either accepted JSON shape of a condition
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawCondition {
    List(Vec<RawPredicate>),
    Map(BTreeMap<String, BTreeMap<String, Value>>),
}

impl RawCondition {
    pub fn into_predicates(self) -> Vec<RawPredicate> {
        match self {
            Self::List(predicates) => predicates,
            Self::Map(fields) => fields
                .into_iter()
                .flat_map(|(field, ops)| {
                    ops.into_iter()
                        .map(move |(op, value)| RawPredicate::new(field.clone(), op, value))
                })
                .collect(),
        }
    }
}

/// AND-list of predicates; empty means "always satisfied"
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Condition {
    predicates: Vec<Predicate>,
}

impl Condition {
    /// Parse raw predicates, reporting every invalid one in a single error
    pub fn parse(raw: &[RawPredicate]) -> Result<Self> {
        let mut predicates = Vec::with_capacity(raw.len());
        let mut issues = Vec::new();

        for (index, raw_predicate) in raw.iter().enumerate() {
            match parse_predicate(raw_predicate) {
                Ok(predicate) => predicates.push(predicate),
                Err(messages) => issues.extend(
                    messages
                        .into_iter()
                        .map(|message| ConditionIssue::new(index, &raw_predicate.field, message)),
                ),
            }
        }

        if issues.is_empty() {
            Ok(Self { predicates })
        } else {
            Err(ConditionError::Invalid(issues))
        }
    }

    /// Parse either JSON shape (list or map form)
    pub fn from_json(value: &Value) -> Result<Self> {
        let raw: RawCondition = serde_json::from_value(value.clone()).map_err(|e| {
            ConditionError::Invalid(vec![ConditionIssue::new(
                0,
                "",
                format!("condition must be a predicate list or field map: {}", e),
            )])
        })?;
        Self::parse(&raw.into_predicates())
    }

    pub fn builder() -> ConditionBuilder {
        ConditionBuilder::default()
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    /// Whether evaluation reads the clock-derived `time` namespace
    pub fn is_time_sensitive(&self) -> bool {
        self.predicates
            .iter()
            .any(|p| p.reads_namespace(Namespace::Time))
    }

    pub fn to_raw(&self) -> Vec<RawPredicate> {
        self.predicates
            .iter()
            .map(|p| RawPredicate {
                field: p.field.to_string(),
                op: p.operator.symbol().to_string(),
                value: p.operand.to_json(),
            })
            .collect()
    }
}

fn parse_predicate(raw: &RawPredicate) -> std::result::Result<Predicate, Vec<String>> {
    let mut messages = Vec::new();

    let field = FieldPath::parse(&raw.field)
        .map_err(|e| messages.push(e.to_string()))
        .ok();
    let operator = raw
        .op
        .parse::<Operator>()
        .map_err(|e| messages.push(e))
        .ok();
    let operand = Operand::parse(&raw.value)
        .map_err(|e| messages.push(e))
        .ok();

    if let (Some(operator), Some(operand)) = (operator, operand.as_ref()) {
        if let Err(message) = check_operand(operator, operand) {
            messages.push(message);
        }
    }

    match (field, operator, operand) {
        (Some(field), Some(operator), Some(operand)) if messages.is_empty() => Ok(Predicate {
            field,
            operator,
            operand,
        }),
        _ => Err(messages),
    }
}

fn check_operand(operator: Operator, operand: &Operand) -> std::result::Result<(), String> {
    let literal = match operand {
        Operand::Literal(value) => value,
        Operand::Reference(_) | Operand::Template(_) => {
            if operator == Operator::Matches {
                return Err("regex patterns must be literal strings".to_string());
            }
            return Ok(());
        }
    };

    match operator {
        Operator::Eq | Operator::Ne => Ok(()),
        Operator::In | Operator::NotIn => match literal {
            AttributeValue::List(_) | AttributeValue::String(_) => Ok(()),
            other => Err(format!("'{}' requires a list operand, got {}", operator, other.type_name())),
        },
        Operator::Gt | Operator::Lt | Operator::Ge | Operator::Le => match literal {
            AttributeValue::Number(_) | AttributeValue::String(_) => Ok(()),
            other => Err(format!("'{}' requires a number or string operand, got {}", operator, other.type_name())),
        },
        Operator::Contains | Operator::StartsWith | Operator::EndsWith => match literal {
            AttributeValue::List(_) | AttributeValue::Null => {
                Err(format!("'{}' requires a scalar operand, got {}", operator, literal.type_name()))
            }
            _ => Ok(()),
        },
        Operator::Matches => match literal {
            AttributeValue::String(pattern) => regex::Regex::new(pattern)
                .map(|_| ())
                .map_err(|e| format!("invalid regex: {}", e)),
            other => Err(format!("'matches' requires a string pattern, got {}", other.type_name())),
        },
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_raw().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = RawCondition::deserialize(deserializer)?;
        Self::parse(&raw.into_predicates()).map_err(|e| match e {
            ConditionError::Invalid(issues) => de::Error::custom(
                issues
                    .iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            other => de::Error::custom(other),
        })
    }
}

/// Fluent construction of a [`Condition`] in code
#[derive(Debug, Default)]
pub struct ConditionBuilder {
    raw: Vec<RawPredicate>,
}

impl ConditionBuilder {
    pub fn when(mut self, field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        self.raw
            .push(RawPredicate::new(field, operator.symbol(), value));
        self
    }

    pub fn build(self) -> Result<Condition> {
        Condition::parse(&self.raw)
    }
}

//! Core authorization types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::condition::Condition;

/// Unique user identifier
pub type UserId = String;

/// Unique role identifier
pub type RoleId = String;

/// Unique permission identifier
pub type PermissionId = String;

/// Wildcard accepted in `Permission::action` and `Permission::resource_type`
pub const WILDCARD: &str = "*";

/// Attribute value used in ABAC contexts
///
/// Serialized untagged, so attribute bags read and write as plain JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<AttributeValue>),
}

impl AttributeValue {
    /// Numeric view of the value, parsing numeric strings
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Scalar rendered as text; `None` for lists and null
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::String(s) => Some(s.clone()),
            Self::Number(n) => Some(format_number(*n)),
            Self::Bool(b) => Some(b.to_string()),
            Self::Null | Self::List(_) => None,
        }
    }

    /// Short type name used in evaluation errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "list",
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            scalar => write!(f, "{}", scalar.as_text().unwrap_or_default()),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl<T: Into<AttributeValue>> From<Vec<T>> for AttributeValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// Open attribute bag, ordered for deterministic fingerprints
pub type Attributes = BTreeMap<String, AttributeValue>;

/// User account status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Suspended,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
        }
    }
}

/// Assignment of a role to a user, optionally scoped to a domain and time-bounded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub role_id: RoleId,

    /// Tenant the assignment applies to; `None` for global assignments
    #[serde(default)]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    pub granted_at: DateTime<Utc>,
}

impl RoleAssignment {
    /// Create a global, non-expiring assignment
    pub fn new(role_id: impl Into<RoleId>) -> Self {
        Self {
            role_id: role_id.into(),
            domain: None,
            expires_at: None,
            granted_at: Utc::now(),
        }
    }

    pub fn in_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Expired assignments are ignored by checks but never deleted eagerly
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }

    /// Whether this assignment applies to the requested domain
    pub fn applies_to(&self, domain: Option<&str>) -> bool {
        self.domain.as_deref() == domain
    }

    /// Same role, domain and expiry; `granted_at` is bookkeeping and ignored
    pub fn same_grant(&self, other: &RoleAssignment) -> bool {
        self.role_id == other.role_id && self.domain == other.domain && self.expires_at == other.expires_at
    }
}

/// Subject of an authorization check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,

    /// ABAC attributes exposed under `user.*`
    #[serde(default)]
    pub attributes: Attributes,

    #[serde(default)]
    pub assignments: Vec<RoleAssignment>,

    #[serde(default)]
    pub domain: Option<String>,

    pub status: UserStatus,
}

impl User {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            attributes: Attributes::new(),
            assignments: Vec::new(),
            domain: None,
            status: UserStatus::Active,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_status(mut self, status: UserStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_suspended(&self) -> bool {
        self.status == UserStatus::Suspended
    }

    /// Equal apart from assignment grant timestamps
    pub fn same_content(&self, other: &User) -> bool {
        self.id == other.id
            && self.attributes == other.attributes
            && self.domain == other.domain
            && self.status == other.status
            && self.assignments.len() == other.assignments.len()
            && self
                .assignments
                .iter()
                .zip(&other.assignments)
                .all(|(a, b)| a.same_grant(b))
    }

    /// Replace or insert the assignment for `(role_id, domain)`
    pub fn upsert_assignment(&mut self, assignment: RoleAssignment) {
        match self
            .assignments
            .iter_mut()
            .find(|a| a.role_id == assignment.role_id && a.domain == assignment.domain)
        {
            Some(existing) => *existing = assignment,
            None => self.assignments.push(assignment),
        }
    }

    /// Remove the assignment for `(role_id, domain)`, returning whether one existed
    pub fn remove_assignment(&mut self, role_id: &str, domain: Option<&str>) -> bool {
        let before = self.assignments.len();
        self.assignments
            .retain(|a| !(a.role_id == role_id && a.domain.as_deref() == domain));
        self.assignments.len() != before
    }
}

/// Named collection of permissions with an optional single parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,

    #[serde(default)]
    pub domain: Option<String>,

    /// Directly granted permission ids
    #[serde(default)]
    pub permissions: BTreeSet<PermissionId>,

    #[serde(default)]
    pub parent_id: Option<RoleId>,
}

impl Role {
    pub fn new(id: impl Into<RoleId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            domain: None,
            permissions: BTreeSet::new(),
            parent_id: None,
        }
    }

    pub fn with_permission(mut self, permission_id: impl Into<PermissionId>) -> Self {
        self.permissions.insert(permission_id.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<RoleId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn in_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn has_permission(&self, permission_id: &str) -> bool {
        self.permissions.contains(permission_id)
    }
}

/// Grant of one action on one resource type, optionally conditioned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub id: PermissionId,
    pub action: String,
    pub resource_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Condition>,
}

impl Permission {
    pub fn new(
        id: impl Into<PermissionId>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            resource_type: resource_type.into(),
            conditions: None,
        }
    }

    pub fn with_conditions(mut self, conditions: Condition) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// Whether this permission covers `action` on `resource_type` (wildcards allowed)
    pub fn matches(&self, action: &str, resource_type: &str) -> bool {
        self.matches_action(action) && self.matches_resource_type(resource_type)
    }

    pub fn matches_action(&self, action: &str) -> bool {
        self.action == WILDCARD || self.action == action
    }

    pub fn matches_resource_type(&self, resource_type: &str) -> bool {
        self.resource_type == WILDCARD || self.resource_type == resource_type
    }

    /// Unconditioned permissions grant as soon as they are reachable
    pub fn is_unconditional(&self) -> bool {
        self.conditions.as_ref().map_or(true, |c| c.is_empty())
    }
}

/// Resource being accessed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource identifier; absent when checking against a bare type
    #[serde(default)]
    pub id: Option<String>,

    #[serde(rename = "type")]
    pub resource_type: String,

    /// ABAC attributes exposed under `resource.*`
    #[serde(default)]
    pub attributes: Attributes,
}

impl Resource {
    /// Create a resource from an id such as `"document:123"`; the type is the prefix
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let resource_type = id.split(':').next().unwrap_or("resource").to_string();

        Self {
            id: Some(id),
            resource_type,
            attributes: Attributes::new(),
        }
    }

    /// Create a resource with an explicit type
    pub fn typed(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            resource_type: resource_type.into(),
            attributes: Attributes::new(),
        }
    }

    /// A resource known only by its type
    pub fn of_type(resource_type: impl Into<String>) -> Self {
        Self {
            id: None,
            resource_type: resource_type.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

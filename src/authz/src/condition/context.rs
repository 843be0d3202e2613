//! Evaluation context for condition predicates

use chrono::{DateTime, Datelike, Timelike, Utc};

use super::types::{FieldPath, Namespace};
use crate::types::{AttributeValue, Attributes, Resource, User};

/// Three-namespace attribute view a condition is evaluated against
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    /// `user.*`: user attributes plus `id`, `domain` and `status`
    pub user: Attributes,

    /// `resource.*`: resource attributes plus `id` and `type`
    pub resource: Attributes,

    /// `time.*`: derived from the engine clock, never caller-supplied
    pub time: Attributes,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble the context for one check
    pub fn for_request(user: &User, resource: &Resource, now: DateTime<Utc>) -> Self {
        Self::new()
            .with_principal(user)
            .with_resource(resource)
            .with_time(now)
    }

    pub fn with_principal(mut self, user: &User) -> Self {
        self.user = user.attributes.clone();
        self.user
            .insert("id".to_string(), AttributeValue::String(user.id.clone()));
        self.user.insert(
            "status".to_string(),
            AttributeValue::String(user.status.as_str().to_string()),
        );
        self.user.insert(
            "domain".to_string(),
            user.domain
                .clone()
                .map_or(AttributeValue::Null, AttributeValue::String),
        );
        self
    }

    pub fn with_resource(mut self, resource: &Resource) -> Self {
        self.resource = resource.attributes.clone();
        if let Some(id) = &resource.id {
            self.resource
                .insert("id".to_string(), AttributeValue::String(id.clone()));
        }
        self.resource.insert(
            "type".to_string(),
            AttributeValue::String(resource.resource_type.clone()),
        );
        self
    }

    pub fn with_time(mut self, now: DateTime<Utc>) -> Self {
        self.time = time_attributes(now);
        self
    }

    pub fn with_user_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.user.insert(key.into(), value.into());
        self
    }

    pub fn with_resource_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.resource.insert(key.into(), value.into());
        self
    }

    pub fn namespace(&self, namespace: Namespace) -> &Attributes {
        match namespace {
            Namespace::User => &self.user,
            Namespace::Resource => &self.resource,
            Namespace::Time => &self.time,
        }
    }

    /// Look up a field path; `None` when any step is missing
    pub fn resolve(&self, path: &FieldPath) -> Option<&AttributeValue> {
        let mut value = self.namespace(path.namespace()).get(path.key())?;
        for &index in path.indices() {
            value = match value {
                AttributeValue::List(items) => items.get(index)?,
                _ => return None,
            };
        }
        Some(value)
    }
}

fn time_attributes(now: DateTime<Utc>) -> Attributes {
    let mut time = Attributes::new();
    time.insert("hour".to_string(), AttributeValue::from(now.hour()));
    time.insert("minute".to_string(), AttributeValue::from(now.minute()));
    time.insert(
        "weekday".to_string(),
        AttributeValue::from(now.weekday().num_days_from_monday()),
    );
    time.insert(
        "day_of_week".to_string(),
        AttributeValue::String(now.format("%A").to_string().to_lowercase()),
    );
    time.insert(
        "date".to_string(),
        AttributeValue::String(now.format("%Y-%m-%d").to_string()),
    );
    time.insert("timestamp".to_string(), AttributeValue::from(now.timestamp()));
    time
}

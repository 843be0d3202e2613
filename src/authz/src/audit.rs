//! Audit logging for authorization decisions
//!
//! Every check emits an [`AuditRecord`] to the configured [`AuditLogger`].
//! Logger failures never change a decision; the engine logs them and moves on.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::engine::{CheckResult, DecisionReason};
use crate::types::Resource;

/// Audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique entry ID
    pub id: String,

    pub timestamp: DateTime<Utc>,

    pub user_id: String,

    pub action: String,

    #[serde(default)]
    pub resource_id: Option<String>,

    pub resource_type: String,

    #[serde(default)]
    pub domain: Option<String>,

    /// Decision result (allow/deny)
    pub allowed: bool,

    pub reason: DecisionReason,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_permission: Option<String>,

    /// Whether the result came from the decision cache
    pub cached: bool,

    /// Check latency in microseconds
    pub latency_us: u64,
}

impl AuditRecord {
    pub fn from_check(
        user_id: &str,
        action: &str,
        resource: &Resource,
        domain: Option<&str>,
        result: &CheckResult,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            user_id: user_id.to_string(),
            action: action.to_string(),
            resource_id: resource.id.clone(),
            resource_type: resource.resource_type.clone(),
            domain: domain.map(str::to_string),
            allowed: result.allowed,
            reason: result.reason,
            matched_permission: result.matched_permission.clone(),
            cached: false,
            latency_us: 0,
        }
    }

    pub fn with_latency_us(mut self, latency_us: u64) -> Self {
        self.latency_us = latency_us;
        self
    }

    pub fn from_cache(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }
}

/// Audit sink errors
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),

    #[error("Audit serialization failed: {0}")]
    Serialization(String),
}

/// Audit logger trait
pub trait AuditLogger: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Buffers records in memory, keeping the most recent `max_entries`
pub struct InMemoryAuditLogger {
    buffer: RwLock<Vec<AuditRecord>>,
    max_entries: usize,
}

impl InMemoryAuditLogger {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            buffer: RwLock::new(Vec::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn entries(&self) -> Vec<AuditRecord> {
        self.buffer.read().clone()
    }

    /// Records for one user, oldest first
    pub fn for_user(&self, user_id: &str) -> Vec<AuditRecord> {
        self.buffer
            .read()
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Denied records, oldest first
    pub fn denials(&self) -> Vec<AuditRecord> {
        self.buffer
            .read()
            .iter()
            .filter(|r| !r.allowed)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.read().is_empty()
    }

    pub fn clear(&self) {
        self.buffer.write().clear();
    }
}

impl Default for InMemoryAuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLogger for InMemoryAuditLogger {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut buffer = self.buffer.write();
        if buffer.len() >= self.max_entries {
            let overflow = buffer.len() + 1 - self.max_entries;
            buffer.drain(..overflow);
        }
        buffer.push(record.clone());
        Ok(())
    }
}

/// Emits records as structured `tracing` events under the `rbac_authz::audit` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        info!(
            target: "rbac_authz::audit",
            audit_id = %record.id,
            user_id = %record.user_id,
            action = %record.action,
            resource_type = %record.resource_type,
            resource_id = ?record.resource_id,
            domain = ?record.domain,
            allowed = record.allowed,
            reason = record.reason.as_str(),
            matched_permission = ?record.matched_permission,
            cached = record.cached,
            latency_us = record.latency_us,
            "Authorization decision"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user_id: &str, allowed: bool) -> AuditRecord {
        let result = if allowed {
            CheckResult::allow(DecisionReason::PermissionGranted, "doc:read")
        } else {
            CheckResult::deny(DecisionReason::NoMatchingPermission)
        };
        AuditRecord::from_check(user_id, "read", &Resource::new("doc:1"), None, &result, Utc::now())
    }

    #[test]
    fn test_in_memory_logger() {
        let logger = InMemoryAuditLogger::new();
        logger.record(&record("alice", true)).unwrap();
        logger.record(&record("bob", false)).unwrap();

        assert_eq!(logger.len(), 2);
        assert_eq!(logger.for_user("alice").len(), 1);
        assert_eq!(logger.denials()[0].user_id, "bob");
    }

    #[test]
    fn test_buffer_is_bounded() {
        let logger = InMemoryAuditLogger::with_capacity(3);
        for i in 0..5 {
            logger.record(&record(&format!("u{}", i), true)).unwrap();
        }

        let users: Vec<_> = logger.entries().into_iter().map(|r| r.user_id).collect();
        assert_eq!(users, vec!["u2", "u3", "u4"]);
    }

    #[test]
    fn test_record_serialization() {
        let entry = record("alice", true).with_latency_us(42);
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["reason"], "permission_granted");
        assert_eq!(json["matched_permission"], "doc:read");
        assert_eq!(json["latency_us"], 42);
    }

    #[test]
    fn test_tracing_logger_never_fails() {
        assert!(TracingAuditLogger.record(&record("alice", false)).is_ok());
    }
}

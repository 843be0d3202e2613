//! Authorization engine
//!
//! Orchestrates user lookup, hierarchy resolution, permission matching and
//! condition evaluation, with decision caching, audit logging and metrics.

pub mod admin;
pub mod cache;
pub mod config;
pub mod decision;
pub mod metrics;

pub use config::{CacheConfig, EngineConfig};
pub use decision::{CheckRequest, CheckResult, DecisionReason};
pub use metrics::{EngineMetrics, MetricsCollector};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rayon::prelude::*;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::{AuditLogger, AuditRecord, TracingAuditLogger};
use crate::cache::{CacheProvider, CacheStats, InMemoryCache};
use crate::clock::{Clock, SystemClock};
use crate::condition::{EvalContext, PolicyEvaluator};
use crate::error::{AuthzError, EntityKind, Result};
use crate::hierarchy::{EffectivePermissions, HierarchyResolver};
use crate::storage::Storage;
use crate::types::{Permission, Resource, User};

/// Result of the uncached pipeline
struct Evaluation {
    result: CheckResult,

    /// The result depends on the clock: a condition read `time.*` or an
    /// assignment carries an expiry
    time_sensitive: bool,
}

impl Evaluation {
    fn new(result: CheckResult) -> Self {
        Self {
            result,
            time_sensitive: false,
        }
    }
}

/// Authorization engine
///
/// # Architecture
///
/// ```text
/// check → Storage(user) → assignments → HierarchyResolver → candidates → PolicyEvaluator → CheckResult
///   ↓                                                                                        ↓
/// [Cache] ───────────────────────────────────────────────────────────────────────────────────┘
///   ↓                                                                                        ↓
/// [Audit]                                                                               [Metrics]
/// ```
///
/// Checks take the read side of an engine-wide gate and administrative
/// writes take the write side, so a check never observes a half-applied
/// change. Share the engine across threads with `Arc`.
pub struct AuthEngine {
    storage: Arc<dyn Storage>,

    hierarchy: Arc<HierarchyResolver>,

    evaluator: PolicyEvaluator,

    cache: Option<Arc<dyn CacheProvider>>,

    audit_logger: Option<Arc<dyn AuditLogger>>,

    metrics: Option<Arc<MetricsCollector>>,

    clock: Arc<dyn Clock>,

    config: EngineConfig,

    /// Serializes administrative writes against checks; shared with the
    /// matrices this engine builds
    write_gate: Arc<RwLock<()>>,
}

impl AuthEngine {
    /// Create an engine over `storage`
    ///
    /// Uses an [`InMemoryCache`] when caching is enabled, a
    /// [`TracingAuditLogger`] when auditing is enabled and the system clock.
    pub fn new(config: EngineConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        config.validate()?;

        let hierarchy = Arc::new(HierarchyResolver::new(storage.clone()).with_memoization(config.memoize_hierarchy));

        let cache: Option<Arc<dyn CacheProvider>> = if config.enable_cache {
            Some(Arc::new(InMemoryCache::new(config.cache.capacity)))
        } else {
            None
        };

        let audit_logger: Option<Arc<dyn AuditLogger>> = if config.enable_audit {
            Some(Arc::new(TracingAuditLogger))
        } else {
            None
        };

        let metrics = if config.enable_metrics {
            Some(Arc::new(MetricsCollector::new()))
        } else {
            None
        };

        info!(
            cache = config.enable_cache,
            audit = config.enable_audit,
            metrics = config.enable_metrics,
            "AuthEngine initialized"
        );

        Ok(Self {
            storage,
            hierarchy,
            evaluator: PolicyEvaluator::new(),
            cache,
            audit_logger,
            metrics,
            clock: Arc::new(SystemClock),
            config,
            write_gate: Arc::new(RwLock::new(())),
        })
    }

    /// Replace the decision cache; ignored when caching is disabled
    pub fn with_cache_provider(mut self, cache: Arc<dyn CacheProvider>) -> Self {
        if self.config.enable_cache {
            self.cache = Some(cache);
        }
        self
    }

    /// Replace the audit sink; ignored when auditing is disabled
    pub fn with_audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        if self.config.enable_audit {
            self.audit_logger = Some(logger);
        }
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn hierarchy(&self) -> &HierarchyResolver {
        &self.hierarchy
    }

    pub fn evaluator(&self) -> &PolicyEvaluator {
        &self.evaluator
    }

    /// Decide whether `user_id` may perform `action` on `resource`
    ///
    /// # Pipeline
    ///
    /// 1. Check cache for a previous decision
    /// 2. Load the user; unknown or suspended users are denied
    /// 3. Collect live role assignments in `domain` (global only when `None`)
    /// 4. Union the effective permissions of those roles
    /// 5. Keep permissions matching the action and resource type
    /// 6. Evaluate conditions in specificity order; the first satisfied one allows
    /// 7. Cache, audit and record metrics
    pub fn check_permission(
        &self,
        user_id: &str,
        action: &str,
        resource: &Resource,
        domain: Option<&str>,
    ) -> CheckResult {
        let _gate = self.write_gate.read();
        self.check_locked(user_id, action, resource, domain)
    }

    /// [`AuthEngine::check_permission`] that returns `PermissionDenied` on deny
    pub fn require_permission(
        &self,
        user_id: &str,
        action: &str,
        resource: &Resource,
        domain: Option<&str>,
    ) -> Result<CheckResult> {
        let result = self.check_permission(user_id, action, resource, domain);
        if result.allowed {
            Ok(result)
        } else {
            Err(AuthzError::PermissionDenied(format!(
                "user '{}' may not {} {} ({})",
                user_id,
                action,
                resource.id.as_deref().unwrap_or(&resource.resource_type),
                result.reason
            )))
        }
    }

    /// Check many requests in parallel; results keep request order
    pub fn batch_check(&self, requests: &[CheckRequest]) -> Vec<CheckResult> {
        debug!(count = requests.len(), "Batch check");
        requests
            .par_iter()
            .map(|r| self.check_permission(&r.user_id, &r.action, &r.resource, r.domain.as_deref()))
            .collect()
    }

    /// Actions the user may perform on resources of `resource_type`
    pub fn get_allowed_actions(&self, user_id: &str, resource_type: &str, domain: Option<&str>) -> Vec<String> {
        self.allowed_actions_on(user_id, &Resource::of_type(resource_type), domain)
    }

    /// Actions the user may perform on a concrete resource, sorted and unique
    pub fn allowed_actions_on(&self, user_id: &str, resource: &Resource, domain: Option<&str>) -> Vec<String> {
        let _gate = self.write_gate.read();
        let now = self.clock.now();

        let (user, effective) = match self.load_subject(user_id, domain, now) {
            Ok(Some(subject)) => subject,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Allowed-actions lookup failed");
                return Vec::new();
            }
        };

        let resource = match self.resolve_resource(resource) {
            Ok(resource) => resource,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Resource lookup failed");
                return Vec::new();
            }
        };
        let ctx = EvalContext::for_request(&user, &resource, now);
        let mut actions = BTreeSet::new();

        for grant in effective.grants() {
            let permission = match self.storage.get_permission(&grant.permission_id) {
                Ok(Some(p)) if p.matches_resource_type(&resource.resource_type) => p,
                Ok(_) => continue,
                Err(e) => {
                    warn!(permission_id = %grant.permission_id, error = %e, "Permission lookup failed");
                    continue;
                }
            };
            if actions.contains(&permission.action) {
                continue;
            }
            if self.permission_satisfied(&permission, &ctx).unwrap_or(false) {
                actions.insert(permission.action);
            }
        }

        actions.into_iter().collect()
    }

    /// Effective permissions of a user in `domain`, ignoring conditions
    pub fn effective_permissions_for(&self, user_id: &str, domain: Option<&str>) -> Result<EffectivePermissions> {
        let _gate = self.write_gate.read();
        let now = self.clock.now();
        let user = self
            .storage
            .get_user(user_id)?
            .ok_or_else(|| AuthzError::not_found(EntityKind::User, user_id))?;
        self.effective_for(&user, domain, now)
    }

    /// Clear the decision cache
    pub fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
            info!("Decision cache invalidated");
        }
    }

    /// Get engine metrics
    pub fn metrics(&self) -> Option<EngineMetrics> {
        self.metrics.as_ref().map(|m| m.snapshot())
    }

    /// Metrics in Prometheus text format
    pub fn export_prometheus(&self) -> Option<String> {
        self.metrics.as_ref().map(|m| m.export_prometheus())
    }

    /// Get cache statistics
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    fn check_locked(&self, user_id: &str, action: &str, resource: &Resource, domain: Option<&str>) -> CheckResult {
        let start = Instant::now();

        debug!(
            user_id = %user_id,
            action = %action,
            resource_type = %resource.resource_type,
            resource_id = ?resource.id,
            domain = ?domain,
            "Authorization check"
        );

        let key = self
            .cache
            .as_ref()
            .map(|_| cache::decision_key(user_id, action, resource, domain));

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(cached) = cache.get(key) {
                debug!("Cache hit for check");
                if let Some(metrics) = &self.metrics {
                    metrics.record_cache_hit();
                }
                self.finalize(user_id, action, resource, domain, &cached, start, true);
                return cached;
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_cache_miss();
            }
        }

        let now = self.clock.now();
        let evaluation = self.evaluate(user_id, action, resource, domain, now);

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if evaluation.result.is_cacheable() && !evaluation.time_sensitive {
                cache.set(key, evaluation.result.clone(), self.config.cache.ttl);
            }
        }

        self.finalize(user_id, action, resource, domain, &evaluation.result, start, false);
        evaluation.result
    }

    fn evaluate(
        &self,
        user_id: &str,
        action: &str,
        resource: &Resource,
        domain: Option<&str>,
        now: DateTime<Utc>,
    ) -> Evaluation {
        let user = match self.storage.get_user(user_id) {
            Ok(Some(user)) => user,
            Ok(None) => {
                debug!(user_id = %user_id, "Unknown user");
                return Evaluation::new(CheckResult::deny(DecisionReason::UserNotFound));
            }
            Err(e) => return internal_error(e),
        };

        if user.is_suspended() {
            debug!(user_id = %user_id, "User suspended");
            return Evaluation::new(CheckResult::deny(DecisionReason::UserSuspended));
        }

        let (role_ids, expiring) = match self.active_roles(&user, domain, now) {
            Ok(active) => active,
            Err(e) => return internal_error(e),
        };
        let effective = match self.hierarchy.union(&role_ids) {
            Ok(effective) => effective,
            Err(e) => return internal_error(e),
        };

        let mut candidates: Vec<Permission> = Vec::new();
        for grant in effective.grants() {
            match self.storage.get_permission(&grant.permission_id) {
                Ok(Some(p)) if p.matches(action, &resource.resource_type) => candidates.push(p),
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!(permission_id = %grant.permission_id, role_id = %grant.source_role, "Role grants unknown permission");
                }
                Err(e) => return internal_error(e),
            }
        }

        if candidates.is_empty() {
            debug!(permissions = effective.len(), "No matching permission");
            return Evaluation::new(CheckResult::deny(DecisionReason::NoMatchingPermission));
        }

        debug!(candidates = candidates.len(), "Evaluating candidate permissions");

        let resource = match self.resolve_resource(resource) {
            Ok(resource) => resource,
            Err(e) => return internal_error(e),
        };
        let ctx = EvalContext::for_request(&user, &resource, now);
        // An expiring assignment can lapse before the cache TTL does
        let mut time_sensitive = expiring;
        let mut errors = Vec::new();

        for permission in &candidates {
            if let Some(conditions) = &permission.conditions {
                time_sensitive |= conditions.is_time_sensitive();
            }

            match self.permission_satisfied(permission, &ctx) {
                Ok(true) => {
                    debug!(permission_id = %permission.id, "Permission granted");
                    return Evaluation {
                        result: CheckResult::allow(DecisionReason::PermissionGranted, permission.id.clone()),
                        time_sensitive,
                    };
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(permission_id = %permission.id, error = %e, "Condition evaluation failed");
                    errors.push(format!("{}: {}", permission.id, e));
                }
            }
        }

        let result = if errors.len() == candidates.len() {
            CheckResult::deny(DecisionReason::EvaluationError).with_message(errors.join("; "))
        } else {
            CheckResult::deny(DecisionReason::ConditionsNotMet)
        };

        Evaluation { result, time_sensitive }
    }

    /// Active user plus effective permissions; `None` for unknown or suspended users
    fn load_subject(
        &self,
        user_id: &str,
        domain: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<(User, EffectivePermissions)>> {
        let Some(user) = self.storage.get_user(user_id)? else {
            return Ok(None);
        };
        if user.is_suspended() {
            return Ok(None);
        }
        let effective = self.effective_for(&user, domain, now)?;
        Ok(Some((user, effective)))
    }

    fn effective_for(&self, user: &User, domain: Option<&str>, now: DateTime<Utc>) -> Result<EffectivePermissions> {
        let (role_ids, _) = self.active_roles(user, domain, now)?;
        self.hierarchy.union(&role_ids)
    }

    /// Live role ids plus whether any of them carries an expiry
    fn active_roles(&self, user: &User, domain: Option<&str>, now: DateTime<Utc>) -> Result<(Vec<String>, bool)> {
        let mut expiring = false;
        let role_ids: Vec<String> = self
            .storage
            .list_roles_for_user(&user.id, domain)?
            .into_iter()
            .filter(|a| !a.is_expired_at(now))
            .map(|a| {
                expiring |= a.expires_at.is_some();
                a.role_id
            })
            .collect();

        debug!(user_id = %user.id, roles = ?role_ids, "Active role assignments");
        Ok((role_ids, expiring))
    }

    /// Registered attributes of the resource with the caller's layered on top
    fn resolve_resource<'a>(&self, resource: &'a Resource) -> Result<Cow<'a, Resource>> {
        let Some(resource_id) = resource.id.as_deref() else {
            return Ok(Cow::Borrowed(resource));
        };
        let Some(stored) = self.storage.get_resource(resource_id)? else {
            return Ok(Cow::Borrowed(resource));
        };

        let mut merged = resource.clone();
        for (key, value) in stored.attributes {
            merged.attributes.entry(key).or_insert(value);
        }
        debug!(resource_id = %resource_id, "Merged registered resource attributes");
        Ok(Cow::Owned(merged))
    }

    fn permission_satisfied(&self, permission: &Permission, ctx: &EvalContext) -> Result<bool> {
        match &permission.conditions {
            None => Ok(true),
            Some(conditions) => Ok(self.evaluator.evaluate_conditions(conditions, ctx)?),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize(
        &self,
        user_id: &str,
        action: &str,
        resource: &Resource,
        domain: Option<&str>,
        result: &CheckResult,
        start: Instant,
        cached: bool,
    ) {
        let latency = start.elapsed();

        if let Some(metrics) = &self.metrics {
            metrics.record_latency(latency);
            metrics.record_decision(result);
        }

        if let Some(audit) = &self.audit_logger {
            let record = AuditRecord::from_check(user_id, action, resource, domain, result, self.clock.now())
                .with_latency_us(latency.as_micros() as u64)
                .from_cache(cached);
            if let Err(e) = audit.record(&record) {
                warn!(error = %e, audit_id = %record.id, "Failed to record audit entry");
                if let Some(metrics) = &self.metrics {
                    metrics.record_audit_failure();
                }
            }
        }
    }

    /// Drop cached decisions of one user
    fn invalidate_user(&self, user_id: &str) {
        if let Some(cache) = &self.cache {
            let removed = cache.invalidate_pattern(&cache::user_pattern(user_id));
            debug!(user_id = %user_id, removed, "Invalidated cached decisions for user");
        }
    }
}

fn internal_error(error: AuthzError) -> Evaluation {
    warn!(error = %error, "Check failed internally");
    Evaluation::new(CheckResult::deny(DecisionReason::InternalError).with_message(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditError, InMemoryAuditLogger};
    use crate::condition::{Condition, Operator};
    use crate::storage::InMemoryStorage;
    use crate::types::{Role, RoleAssignment, User, UserStatus};

    fn engine_with(storage: Arc<InMemoryStorage>) -> AuthEngine {
        AuthEngine::new(EngineConfig::default(), storage).unwrap()
    }

    fn seeded() -> Arc<InMemoryStorage> {
        let storage = Arc::new(InMemoryStorage::new());
        storage
            .persist_permission(Permission::new("doc:read", "read", "doc"))
            .unwrap();
        storage
            .persist_permission(
                Permission::new("doc:edit-own", "write", "doc").with_conditions(
                    Condition::builder()
                        .when("resource.owner_id", Operator::Eq, "{{user.id}}")
                        .build()
                        .unwrap(),
                ),
            )
            .unwrap();
        storage
            .persist_role(
                Role::new("member", "Member")
                    .with_permission("doc:read")
                    .with_permission("doc:edit-own"),
            )
            .unwrap();

        let mut alice = User::new("alice");
        alice.upsert_assignment(RoleAssignment::new("member"));
        storage.persist_user(alice).unwrap();
        storage
    }

    #[test]
    fn test_engine_creation() {
        let engine = engine_with(seeded());
        assert!(engine.cache.is_some());
        assert!(engine.audit_logger.is_some());
        assert!(engine.metrics.is_some());

        let bare = AuthEngine::new(
            EngineConfig {
                enable_cache: false,
                enable_audit: false,
                enable_metrics: false,
                ..EngineConfig::default()
            },
            seeded(),
        )
        .unwrap();
        assert!(bare.cache_stats().is_none());
        assert!(bare.metrics().is_none());
    }

    #[test]
    fn test_pipeline_reasons() {
        let engine = engine_with(seeded());
        let doc = Resource::new("doc:1").with_attribute("owner_id", "bob");

        let read = engine.check_permission("alice", "read", &doc, None);
        assert!(read.allowed);
        assert_eq!(read.matched_permission.as_deref(), Some("doc:read"));

        let write = engine.check_permission("alice", "write", &doc, None);
        assert_eq!(write.reason, DecisionReason::ConditionsNotMet);

        let delete = engine.check_permission("alice", "delete", &doc, None);
        assert_eq!(delete.reason, DecisionReason::NoMatchingPermission);

        let ghost = engine.check_permission("ghost", "read", &doc, None);
        assert_eq!(ghost.reason, DecisionReason::UserNotFound);
    }

    #[test]
    fn test_suspended_user_denied() {
        let storage = seeded();
        let alice = storage.get_user("alice").unwrap().unwrap();
        storage
            .persist_user(alice.with_status(UserStatus::Suspended))
            .unwrap();

        let engine = engine_with(storage);
        let result = engine.check_permission("alice", "read", &Resource::new("doc:1"), None);
        assert!(!result.allowed);
        assert_eq!(result.reason, DecisionReason::UserSuspended);
    }

    #[test]
    fn test_cache_hit_on_repeat() {
        let engine = engine_with(seeded());
        let doc = Resource::new("doc:1");

        engine.check_permission("alice", "read", &doc, None);
        engine.check_permission("alice", "read", &doc, None);

        let metrics = engine.metrics().unwrap();
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 1);
        assert_eq!(metrics.total_checks, 2);
    }

    #[test]
    fn test_runtime_cycle_is_internal_error() {
        let storage = seeded();
        storage
            .persist_role(Role::new("a", "A").with_parent("b"))
            .unwrap();
        storage
            .persist_role(Role::new("b", "B").with_parent("a"))
            .unwrap();
        let mut carol = User::new("carol");
        carol.upsert_assignment(RoleAssignment::new("a"));
        storage.persist_user(carol).unwrap();

        let engine = engine_with(storage);
        let result = engine.check_permission("carol", "read", &Resource::new("doc:1"), None);

        assert!(!result.allowed);
        assert_eq!(result.reason, DecisionReason::InternalError);
        assert!(result.message.unwrap().contains("Cycle"));
        assert_eq!(engine.cache_stats().unwrap().entries, 0);
    }

    #[test]
    fn test_evaluation_error_when_every_candidate_fails() {
        let storage = seeded();
        storage
            .persist_permission(
                Permission::new("doc:level", "approve", "doc").with_conditions(
                    Condition::builder()
                        .when("user.tags", Operator::Gt, 3)
                        .build()
                        .unwrap(),
                ),
            )
            .unwrap();
        storage
            .persist_role(Role::new("approver", "Approver").with_permission("doc:level"))
            .unwrap();
        let mut dave = User::new("dave").with_attribute("tags", vec!["x"]);
        dave.upsert_assignment(RoleAssignment::new("approver"));
        storage.persist_user(dave).unwrap();

        let engine = engine_with(storage);
        let result = engine.check_permission("dave", "approve", &Resource::new("doc:1"), None);
        assert_eq!(result.reason, DecisionReason::EvaluationError);
        assert!(!result.is_cacheable());
    }

    struct FailingAuditLogger;

    impl AuditLogger for FailingAuditLogger {
        fn record(&self, _record: &AuditRecord) -> std::result::Result<(), AuditError> {
            Err(AuditError::Unavailable("sink offline".to_string()))
        }
    }

    #[test]
    fn test_audit_failure_does_not_change_decision() {
        let engine = engine_with(seeded()).with_audit_logger(Arc::new(FailingAuditLogger));
        let result = engine.check_permission("alice", "read", &Resource::new("doc:1"), None);

        assert!(result.allowed);
        assert_eq!(engine.metrics().unwrap().audit_failures, 1);
    }

    #[test]
    fn test_audit_records_cached_flag() {
        let logger = Arc::new(InMemoryAuditLogger::new());
        let engine = engine_with(seeded()).with_audit_logger(logger.clone());
        let doc = Resource::new("doc:1");

        engine.check_permission("alice", "read", &doc, None);
        engine.check_permission("alice", "read", &doc, None);

        let entries = logger.entries();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].cached);
        assert!(entries[1].cached);
        assert_eq!(entries[1].matched_permission.as_deref(), Some("doc:read"));
    }

    #[test]
    fn test_allowed_actions() {
        let engine = engine_with(seeded());

        assert_eq!(engine.get_allowed_actions("alice", "doc", None), vec!["read"]);

        let own = Resource::new("doc:9").with_attribute("owner_id", "alice");
        assert_eq!(engine.allowed_actions_on("alice", &own, None), vec!["read", "write"]);

        assert!(engine.get_allowed_actions("ghost", "doc", None).is_empty());
    }

    #[test]
    fn test_require_permission() {
        let engine = engine_with(seeded());
        let doc = Resource::new("doc:1");

        assert!(engine.require_permission("alice", "read", &doc, None).is_ok());
        let err = engine.require_permission("alice", "delete", &doc, None).unwrap_err();
        assert!(matches!(err, AuthzError::PermissionDenied(_)));
    }

    #[test]
    fn test_prometheus_export() {
        let engine = engine_with(seeded());
        engine.check_permission("alice", "read", &Resource::new("doc:1"), None);

        let text = engine.export_prometheus().unwrap();
        assert!(text.contains("rbac_checks_total 1"));
    }
}

//! Engine configuration

use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AuthzError, Result};

/// Decision cache configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries in the cache
    pub capacity: usize,

    /// Time-to-live for cached decisions
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(30),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cache check results
    pub enable_cache: bool,

    pub cache: CacheConfig,

    /// Emit an audit record per check
    pub enable_audit: bool,

    pub enable_metrics: bool,

    /// Memoize per-role effective permissions
    pub memoize_hierarchy: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_cache: true,
            cache: CacheConfig::default(),
            enable_audit: true,
            enable_metrics: true,
            memoize_hierarchy: true,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `RBAC_*` environment variables
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `RBAC_CACHE_ENABLED` | `enable_cache` |
    /// | `RBAC_CACHE_SIZE` | `cache.capacity` |
    /// | `RBAC_CACHE_TTL_SECS` | `cache.ttl` |
    /// | `RBAC_AUDIT_ENABLED` | `enable_audit` |
    /// | `RBAC_METRICS_ENABLED` | `enable_metrics` |
    /// | `RBAC_MEMOIZE_HIERARCHY` | `memoize_hierarchy` |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an explicit variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "RBAC_CACHE_ENABLED", parse_bool)? {
            config.enable_cache = v;
        }
        if let Some(v) = parse_var(&lookup, "RBAC_CACHE_SIZE", parse_from_str::<usize>)? {
            config.cache.capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "RBAC_CACHE_TTL_SECS", parse_from_str::<u64>)? {
            config.cache.ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&lookup, "RBAC_AUDIT_ENABLED", parse_bool)? {
            config.enable_audit = v;
        }
        if let Some(v) = parse_var(&lookup, "RBAC_METRICS_ENABLED", parse_bool)? {
            config.enable_metrics = v;
        }
        if let Some(v) = parse_var(&lookup, "RBAC_MEMOIZE_HIERARCHY", parse_bool)? {
            config.memoize_hierarchy = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.enable_cache && self.cache.capacity == 0 {
            return Err(AuthzError::Config("cache capacity must be positive".to_string()));
        }
        Ok(())
    }

    pub fn without_cache(mut self) -> Self {
        self.enable_cache = false;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache.ttl = ttl;
        self
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: fn(&str) -> Option<T>,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => parse(raw.trim())
            .map(Some)
            .ok_or_else(|| AuthzError::Config(format!("{} has invalid value '{}'", key, raw))),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_from_str<T: FromStr>(raw: &str) -> Option<T> {
    raw.parse().ok()
}

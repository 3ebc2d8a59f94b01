//! Engine configuration
//!
//! Defaults encode the production timings (2 minute refresh lease, 5 minute
//! build lease, 1s/2s hash retry backoff). Every value can be overridden
//! through `PAPER_*` environment variables, optionally loaded from a `.env`
//! file in the working directory or one of its parents.

use serde::{Deserialize, Serialize};
use shared::{RateLimitAction, SharedError};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{OrchestratorError, OrchestratorResult};

/// Lease timeouts per domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// A refresh lease older than this may be reclaimed
    pub repository_timeout: Duration,
    /// A build lease older than this may be reclaimed
    pub paper_timeout: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            repository_timeout: Duration::from_secs(2 * 60),
            paper_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Sliding window quota for one action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub max_attempts: u32,
    pub window: Duration,
    pub lockout: Duration,
}

impl RateLimitRule {
    pub const fn new(max_attempts: u32, window: Duration, lockout: Duration) -> Self {
        Self {
            max_attempts,
            window,
            lockout,
        }
    }
}

/// Per-action quotas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub refresh_repository: RateLimitRule,
    pub build_paper: RateLimitRule,
    pub refresh_all: RateLimitRule,
    pub background_refresh: RateLimitRule,
    /// CAS retries when two requests update the same record concurrently
    pub max_contention_retries: u32,
}

impl RateLimitConfig {
    pub fn rule(&self, action: RateLimitAction) -> RateLimitRule {
        match action {
            RateLimitAction::RefreshRepository => self.refresh_repository,
            RateLimitAction::BuildPaper => self.build_paper,
            RateLimitAction::RefreshAll => self.refresh_all,
            RateLimitAction::BackgroundRefresh => self.background_refresh,
        }
    }

    fn rule_mut(&mut self, action: RateLimitAction) -> &mut RateLimitRule {
        match action {
            RateLimitAction::RefreshRepository => &mut self.refresh_repository,
            RateLimitAction::BuildPaper => &mut self.build_paper,
            RateLimitAction::RefreshAll => &mut self.refresh_all,
            RateLimitAction::BackgroundRefresh => &mut self.background_refresh,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            refresh_repository: RateLimitRule::new(10, Duration::from_secs(60), Duration::from_secs(60)),
            build_paper: RateLimitRule::new(10, Duration::from_secs(60), Duration::from_secs(2 * 60)),
            refresh_all: RateLimitRule::new(3, Duration::from_secs(60), Duration::from_secs(5 * 60)),
            background_refresh: RateLimitRule::new(2, Duration::from_secs(5 * 60), Duration::from_secs(5 * 60)),
            max_contention_retries: 5,
        }
    }
}

/// Change detection retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeDetectionConfig {
    /// Additional attempts after the first batched hash fetch fails
    pub hash_fetch_retries: u32,
    /// Delay before the first retry, doubled for every following one
    pub hash_retry_base_delay: Duration,
}

impl Default for ChangeDetectionConfig {
    fn default() -> Self {
        Self {
            hash_fetch_retries: 2,
            hash_retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Build orchestration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Wait before the single retry of a compile whose source vanished
    pub source_not_found_retry_delay: Duration,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            source_not_found_retry_delay: Duration::from_secs(3),
        }
    }
}

/// Batch and background refresh settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Repositories refreshed more recently than this are skipped unless forced
    pub min_refresh_interval: Duration,
    /// Period of the background refresh tick
    pub background_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_refresh_interval: Duration::from_secs(5 * 60),
            background_interval: Duration::from_secs(15 * 60),
        }
    }
}

/// Version retention and outbox delivery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Unpinned versions kept per paper
    pub keep_unpinned_versions: usize,
    /// Delay before the cleanup task runs after a build
    pub cleanup_delay: Duration,
    /// How long a claimed outbox task stays invisible to other workers
    pub task_claim_timeout: Duration,
    /// Outbox poll period
    pub outbox_poll_interval: Duration,
    /// Delivery attempts before a task is dropped
    pub max_task_attempts: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_unpinned_versions: 10,
            cleanup_delay: Duration::from_secs(5),
            task_claim_timeout: Duration::from_secs(60),
            outbox_poll_interval: Duration::from_secs(2),
            max_task_attempts: 5,
        }
    }
}

/// Capabilities of the configured source provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// The provider can confirm "unchanged" cheaply when handed the known hash
    pub supports_unchanged_shortcut: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            supports_unchanged_shortcut: true,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub lease: LeaseConfig,
    pub rate_limit: RateLimitConfig,
    pub change_detection: ChangeDetectionConfig,
    pub build: BuildConfig,
    pub batch: BatchConfig,
    pub retention: RetentionConfig,
    pub source: SourceConfig,
}

impl EngineConfig {
    /// Load configuration from `.env` (if present) and the process environment
    pub fn from_env() -> OrchestratorResult<Self> {
        // A missing .env file is fine, variables may come from the environment
        let _ = dotenv::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> OrchestratorResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64, _>(&lookup, "PAPER_REPOSITORY_LEASE_SECS")? {
            config.lease.repository_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "PAPER_BUILD_LEASE_SECS")? {
            config.lease.paper_timeout = Duration::from_secs(secs);
        }

        for (action, prefix) in [
            (RateLimitAction::RefreshRepository, "PAPER_RATE_REFRESH"),
            (RateLimitAction::BuildPaper, "PAPER_RATE_BUILD"),
            (RateLimitAction::RefreshAll, "PAPER_RATE_REFRESH_ALL"),
            (RateLimitAction::BackgroundRefresh, "PAPER_RATE_BACKGROUND"),
        ] {
            let rule = config.rate_limit.rule_mut(action);
            if let Some(max) = parse_var::<u32, _>(&lookup, &format!("{prefix}_MAX"))? {
                if max == 0 {
                    return Err(OrchestratorError::config(format!("{prefix}_MAX must be at least 1")));
                }
                rule.max_attempts = max;
            }
            if let Some(secs) = parse_var::<u64, _>(&lookup, &format!("{prefix}_WINDOW_SECS"))? {
                rule.window = Duration::from_secs(secs);
            }
            if let Some(secs) = parse_var::<u64, _>(&lookup, &format!("{prefix}_LOCKOUT_SECS"))? {
                rule.lockout = Duration::from_secs(secs);
            }
        }

        if let Some(retries) = parse_var::<u32, _>(&lookup, "PAPER_HASH_RETRIES")? {
            config.change_detection.hash_fetch_retries = retries;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PAPER_HASH_RETRY_BASE_MS")? {
            config.change_detection.hash_retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PAPER_SOURCE_NOT_FOUND_RETRY_MS")? {
            config.build.source_not_found_retry_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "PAPER_MIN_REFRESH_INTERVAL_SECS")? {
            config.batch.min_refresh_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "PAPER_BACKGROUND_INTERVAL_SECS")? {
            if secs == 0 {
                return Err(OrchestratorError::config("PAPER_BACKGROUND_INTERVAL_SECS must be positive"));
            }
            config.batch.background_interval = Duration::from_secs(secs);
        }
        if let Some(keep) = parse_var::<usize, _>(&lookup, "PAPER_KEEP_VERSIONS")? {
            config.retention.keep_unpinned_versions = keep;
        }
        if let Some(enabled) = parse_var::<bool, _>(&lookup, "PAPER_SUPPORTS_UNCHANGED_SHORTCUT")? {
            config.source.supports_unchanged_shortcut = enabled;
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> OrchestratorResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| {
                OrchestratorError::from(SharedError::InvalidConfig {
                    field: name.to_string(),
                    value: raw.clone(),
                    reason: e.to_string(),
                })
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_match_production_timings() {
        let config = EngineConfig::default();
        assert_eq!(config.lease.repository_timeout, Duration::from_secs(120));
        assert_eq!(config.lease.paper_timeout, Duration::from_secs(300));
        assert_eq!(config.change_detection.hash_fetch_retries, 2);
        assert_eq!(config.change_detection.hash_retry_base_delay, Duration::from_secs(1));
        assert!(config.source.supports_unchanged_shortcut);
    }

    #[test]
    fn test_overrides_from_lookup() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("PAPER_BUILD_LEASE_SECS", "30"),
            ("PAPER_RATE_BUILD_MAX", "3"),
            ("PAPER_RATE_BUILD_LOCKOUT_SECS", "7"),
            ("PAPER_SUPPORTS_UNCHANGED_SHORTCUT", "false"),
            ("PAPER_KEEP_VERSIONS", "4"),
        ]))
        .unwrap();

        assert_eq!(config.lease.paper_timeout, Duration::from_secs(30));
        assert_eq!(config.rate_limit.build_paper.max_attempts, 3);
        assert_eq!(config.rate_limit.build_paper.lockout, Duration::from_secs(7));
        assert_eq!(config.rate_limit.refresh_repository, RateLimitConfig::default().refresh_repository);
        assert!(!config.source.supports_unchanged_shortcut);
        assert_eq!(config.retention.keep_unpinned_versions, 4);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = EngineConfig::from_lookup(lookup_from(&[("PAPER_REPOSITORY_LEASE_SECS", "soon")])).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::SharedError(SharedError::InvalidConfig { ref field, .. }) if field == "PAPER_REPOSITORY_LEASE_SECS"
        ));

        let err = EngineConfig::from_lookup(lookup_from(&[("PAPER_RATE_REFRESH_MAX", "0")])).unwrap_err();
        assert!(err.to_string().contains("PAPER_RATE_REFRESH_MAX"));
    }
}

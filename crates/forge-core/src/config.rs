use std::{num::NonZeroUsize, time::Duration};

use crate::{
    error::ConfigError,
    reaper::ReapScope,
    workers::{available_workers, resolve_worker_count},
};

/// Worker cap, shared with the container images the evaluation runs in.
pub const ENV_MAX_WORKERS: &str = "GRAND_CHALLENGE_MAX_WORKERS";
/// Reaper grace period in milliseconds.
pub const ENV_REAP_GRACE_MS: &str = "FORGE_REAP_GRACE_MS";
/// Cooperative cancellation grace in milliseconds.
pub const ENV_CANCEL_GRACE_MS: &str = "FORGE_CANCEL_GRACE_MS";

pub const DEFAULT_REAP_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Settings of a [`Batch`](crate::Batch).
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Configured worker cap. Clamped to host parallelism by [`BatchConfig::worker_count`].
    pub max_workers: Option<NonZeroUsize>,
    /// Time descendants get between SIGTERM and SIGKILL.
    pub reap_grace: Duration,
    /// Time a running unit gets to honour cancellation before its future is dropped.
    pub cancel_grace: Duration,
    /// Liveness poll interval while waiting out `reap_grace`.
    pub poll_interval: Duration,
    pub reap_scope: ReapScope,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            reap_grace: DEFAULT_REAP_GRACE,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            reap_scope: ReapScope::default(),
        }
    }
}

impl BatchConfig {
    /// Defaults overridden by the process environment.
    ///
    /// Malformed values are rejected here rather than replaced by defaults. Empty values are
    /// treated as unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut cfg = Self::default();
        if let Some(raw) = get(ENV_MAX_WORKERS) {
            cfg.max_workers = Some(parse_positive(ENV_MAX_WORKERS, &raw)?);
        }
        if let Some(raw) = get(ENV_REAP_GRACE_MS) {
            cfg.reap_grace = parse_ms(ENV_REAP_GRACE_MS, &raw)?;
        }
        if let Some(raw) = get(ENV_CANCEL_GRACE_MS) {
            cfg.cancel_grace = parse_ms(ENV_CANCEL_GRACE_MS, &raw)?;
        }
        Ok(cfg)
    }

    pub fn with_max_workers(mut self, cap: NonZeroUsize) -> Self {
        self.max_workers = Some(cap);
        self
    }

    pub fn with_reap_grace(mut self, grace: Duration) -> Self {
        self.reap_grace = grace;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_poll_interval(mut self, every: Duration) -> Self {
        self.poll_interval = every;
        self
    }

    pub fn with_reap_scope(mut self, scope: ReapScope) -> Self {
        self.reap_scope = scope;
        self
    }

    /// Configured cap resolved against the host.
    pub fn worker_count(&self) -> NonZeroUsize {
        resolve_worker_count(self.max_workers, available_workers())
    }
}

fn parse_positive(key: &'static str, raw: &str) -> Result<NonZeroUsize, ConfigError> {
    raw.trim()
        .parse::<NonZeroUsize>()
        .map_err(|e| ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

fn parse_ms(key: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

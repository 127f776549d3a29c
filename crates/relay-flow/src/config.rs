//! Runtime configuration for the scheduler.
//!
//! Limits are explicit and environment-overridable so deployments can tune
//! tick cadence, worker concurrency, and retention without a rebuild.

use std::time::Duration as StdDuration;

use chrono::Duration;

use crate::error::{Error, Result};

const ENV_TICK_INTERVAL_MS: &str = "RELAY_FLOW_TICK_INTERVAL_MS";
const ENV_WORKER_COUNT: &str = "RELAY_FLOW_WORKER_COUNT";
const ENV_SYNC_REPLY_WINDOW_MS: &str = "RELAY_FLOW_SYNC_REPLY_WINDOW_MS";
const ENV_CACHE_RETENTION_SECS: &str = "RELAY_FLOW_CACHE_RETENTION_SECS";

const DEFAULT_TICK_INTERVAL_MS: u64 = 10;
const DEFAULT_WORKER_COUNT: u64 = 4;
const DEFAULT_SYNC_REPLY_WINDOW_MS: u64 = 2_000;
const DEFAULT_CACHE_RETENTION_SECS: u64 = 300;

/// The node group a scheduler belongs to when none is configured.
pub const DEFAULT_NODE_GROUP: &str = "default";

/// Scheduler runtime limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Node group this scheduler instance serves.
    pub node_group: String,
    /// Interval between ticks.
    pub tick_interval: StdDuration,
    /// Number of worker slots.
    pub worker_count: usize,
    /// How long a synchronous caller waits before falling back to polling.
    pub sync_reply_window: StdDuration,
    /// How long completed transactions stay queryable before eviction.
    pub cache_retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_group: DEFAULT_NODE_GROUP.to_string(),
            tick_interval: StdDuration::from_millis(DEFAULT_TICK_INTERVAL_MS),
            worker_count: usize::try_from(DEFAULT_WORKER_COUNT).unwrap_or(4),
            sync_reply_window: StdDuration::from_millis(DEFAULT_SYNC_REPLY_WINDOW_MS),
            cache_retention: Duration::seconds(
                i64::try_from(DEFAULT_CACHE_RETENTION_SECS).unwrap_or(300),
            ),
        }
    }
}

impl SchedulerConfig {
    /// Loads configuration from the process environment with strict
    /// validation.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when an environment value is not a
    /// positive integer or exceeds the supported range.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// This entry point is test-friendly and accepts a key lookup function.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when an environment value is not a
    /// positive integer or exceeds the supported range.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let tick_interval_ms =
            parse_positive_u64_env(&get_env, ENV_TICK_INTERVAL_MS, DEFAULT_TICK_INTERVAL_MS)?;
        let worker_count =
            parse_positive_u64_env(&get_env, ENV_WORKER_COUNT, DEFAULT_WORKER_COUNT)?;
        let sync_reply_window_ms = parse_positive_u64_env(
            &get_env,
            ENV_SYNC_REPLY_WINDOW_MS,
            DEFAULT_SYNC_REPLY_WINDOW_MS,
        )?;
        let cache_retention_secs = parse_positive_u64_env(
            &get_env,
            ENV_CACHE_RETENTION_SECS,
            DEFAULT_CACHE_RETENTION_SECS,
        )?;

        let worker_count = usize::try_from(worker_count).map_err(|_| {
            Error::configuration(format!(
                "{ENV_WORKER_COUNT} value {worker_count} exceeds supported range"
            ))
        })?;
        let cache_retention =
            Duration::seconds(i64::try_from(cache_retention_secs).map_err(|_| {
                Error::configuration(format!(
                    "{ENV_CACHE_RETENTION_SECS} value {cache_retention_secs} exceeds supported range"
                ))
            })?);

        Ok(Self {
            node_group: DEFAULT_NODE_GROUP.to_string(),
            tick_interval: StdDuration::from_millis(tick_interval_ms),
            worker_count,
            sync_reply_window: StdDuration::from_millis(sync_reply_window_ms),
            cache_retention,
        })
    }

    /// Sets the node group.
    #[must_use]
    pub fn with_node_group(mut self, node_group: impl Into<String>) -> Self {
        self.node_group = node_group.into();
        self
    }

    /// Sets the worker count.
    #[must_use]
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Sets the tick interval.
    #[must_use]
    pub const fn with_tick_interval(mut self, tick_interval: StdDuration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Sets the completed-transaction retention window.
    #[must_use]
    pub const fn with_cache_retention(mut self, cache_retention: Duration) -> Self {
        self.cache_retention = cache_retention;
        self
    }
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}

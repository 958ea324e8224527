//! Runtime configuration shared by brokers and workers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Job retention settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// How long a claimed job record and its result are kept, in
    /// milliseconds. Also the longest a job may stay active.
    pub ttl_ms: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5 * 60 * 1000,
        }
    }
}

/// Reaper settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanUpConfig {
    pub active: bool,
    pub refresh_rate_ms: u64,
}

impl Default for CleanUpConfig {
    fn default() -> Self {
        Self {
            active: true,
            refresh_rate_ms: 5 * 60 * 1000,
        }
    }
}

/// Configuration consumed by the broker and the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scheduler and child-join poll interval, in milliseconds.
    pub refresh_rate_ms: u64,
    pub job: JobConfig,
    pub clean_up: CleanUpConfig,
    /// Upper bound on a single worker→broker call, in milliseconds.
    pub call_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_rate_ms: 1000,
            job: JobConfig::default(),
            clean_up: CleanUpConfig::default(),
            call_timeout_ms: 5000,
        }
    }
}

impl Config {
    pub fn refresh_rate(&self) -> Duration {
        Duration::from_millis(self.refresh_rate_ms)
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_millis(self.job.ttl_ms)
    }

    pub fn clean_up_rate(&self) -> Duration {
        Duration::from_millis(self.clean_up.refresh_rate_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Set the scheduler poll interval.
    pub fn with_refresh_rate(mut self, rate: Duration) -> Self {
        self.refresh_rate_ms = duration_ms(rate);
        self
    }

    /// Set the job retention window.
    pub fn with_job_ttl(mut self, ttl: Duration) -> Self {
        self.job.ttl_ms = duration_ms(ttl);
        self
    }

    /// Enable the reapers with the given interval.
    pub fn with_clean_up(mut self, rate: Duration) -> Self {
        self.clean_up = CleanUpConfig {
            active: true,
            refresh_rate_ms: duration_ms(rate),
        };
        self
    }

    /// Disable both reapers.
    pub fn without_clean_up(mut self) -> Self {
        self.clean_up.active = false;
        self
    }

    /// Build a config from environment variables, falling back to defaults.
    ///
    /// - `QUEUE_REFRESH_RATE_MS`
    /// - `QUEUE_JOB_TTL_MS`
    /// - `QUEUE_CLEANUP_ACTIVE` (`true`/`false`)
    /// - `QUEUE_CLEANUP_REFRESH_RATE_MS`
    /// - `QUEUE_CALL_TIMEOUT_MS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = read_env("QUEUE_REFRESH_RATE_MS")? {
            cfg.refresh_rate_ms = v;
        }
        if let Some(v) = read_env("QUEUE_JOB_TTL_MS")? {
            cfg.job.ttl_ms = v;
        }
        if let Some(v) = read_env("QUEUE_CLEANUP_ACTIVE")? {
            cfg.clean_up.active = v;
        }
        if let Some(v) = read_env("QUEUE_CLEANUP_REFRESH_RATE_MS")? {
            cfg.clean_up.refresh_rate_ms = v;
        }
        if let Some(v) = read_env("QUEUE_CALL_TIMEOUT_MS")? {
            cfg.call_timeout_ms = v;
        }
        Ok(cfg)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn read_env<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_historical_values() {
        let cfg = Config::default();
        assert_eq!(cfg.refresh_rate(), Duration::from_secs(1));
        assert_eq!(cfg.job_ttl(), Duration::from_secs(300));
        assert!(cfg.clean_up.active);
        assert_eq!(cfg.clean_up_rate(), Duration::from_secs(300));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"job": {"ttl_ms": 10}}"#).unwrap();
        assert_eq!(cfg.job.ttl_ms, 10);
        assert_eq!(cfg.refresh_rate_ms, 1000);
        assert!(cfg.clean_up.active);
    }

    #[test]
    fn builders_set_durations() {
        let cfg = Config::default()
            .with_refresh_rate(Duration::from_millis(20))
            .with_job_ttl(Duration::from_millis(150))
            .without_clean_up();
        assert_eq!(cfg.refresh_rate_ms, 20);
        assert_eq!(cfg.job.ttl_ms, 150);
        assert!(!cfg.clean_up.active);
    }
}

//! Application configuration.
//!
//! Load order: defaults -> TOML file -> `SCOUT_*` environment variables -> validate.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "scout.toml";
pub const MAX_CONCURRENCY_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed reading config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed parsing config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub rate_limit: RateLimitConfig,
    pub domains: DomainsConfig,
    pub events: EventsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tasks allowed in `running` at once (1..=10).
    pub max_concurrent_tasks: usize,
    /// Time a cancelled or timed-out task body gets to return before it is dropped.
    pub grace_period_secs: u64,
    /// Upper bound on any task's time budget.
    pub task_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            grace_period_secs: 5,
            task_timeout_secs: 300,
        }
    }
}

impl SchedulerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Requests allowed per host inside one window.
    pub max_requests: usize,
    pub window_secs: u64,
    pub delay_min_secs: u64,
    pub delay_max_secs: u64,
    /// Ceiling for a single overload backoff wait.
    pub backoff_max_secs: u64,
    /// Consecutive overload signals from one host before a task gives up on it.
    pub overload_threshold: u32,
    /// Quiet period after the last overload before the multiplier resets.
    /// Defaults to one window.
    pub backoff_reset_secs: Option<u64>,
    /// Buckets kept before least-recently-used hosts are evicted.
    pub max_hosts: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 5,
            window_secs: 90,
            delay_min_secs: 10,
            delay_max_secs: 20,
            backoff_max_secs: 300,
            overload_threshold: 3,
            backoff_reset_secs: None,
            max_hosts: 1024,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn delay_min(&self) -> Duration {
        Duration::from_secs(self.delay_min_secs)
    }

    pub fn delay_max(&self) -> Duration {
        Duration::from_secs(self.delay_max_secs)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn backoff_reset_after(&self) -> Duration {
        Duration::from_secs(self.backoff_reset_secs.unwrap_or(self.window_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainsConfig {
    pub allowed_file: PathBuf,
    pub disallowed_file: PathBuf,
}

impl Default for DomainsConfig {
    fn default() -> Self {
        Self {
            allowed_file: PathBuf::from("config/allowed-domains.txt"),
            disallowed_file: PathBuf::from("config/disallowed-domains.txt"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events retained per task for subscribers that connect late or reconnect.
    pub backlog: usize,
    /// Buffer of each subscriber; a subscriber that falls this far behind is dropped.
    pub subscriber_capacity: usize,
    /// Buffer between a task and its fan-out.
    pub producer_capacity: usize,
    /// Longest a publish may wait for producer capacity.
    pub publish_timeout_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            backlog: 50,
            subscriber_capacity: 128,
            producer_capacity: 256,
            publish_timeout_ms: 250,
        }
    }
}

impl EventsConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl AppConfig {
    /// Load from `path` (or `SCOUT_CONFIG`, or `scout.toml` when present), then apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| env_string("SCOUT_CONFIG").map(PathBuf::from));

        let mut cfg = match explicit {
            Some(path) => Self::from_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    fn apply_env(&mut self) {
        set_opt(
            &mut self.scheduler.max_concurrent_tasks,
            env_parse("SCOUT_MAX_CONCURRENT_TASKS"),
        );
        set_opt(&mut self.scheduler.task_timeout_secs, env_parse("SCOUT_TASK_TIMEOUT"));
        set_opt(&mut self.scheduler.grace_period_secs, env_parse("SCOUT_GRACE_PERIOD"));

        set_opt(&mut self.rate_limit.enabled, env_bool("SCOUT_ENABLE_RATE_LIMITING"));
        set_opt(&mut self.rate_limit.max_requests, env_parse("SCOUT_RATE_LIMIT_REQUESTS"));
        set_opt(&mut self.rate_limit.window_secs, env_parse("SCOUT_RATE_LIMIT_WINDOW"));
        set_opt(&mut self.rate_limit.delay_min_secs, env_parse("SCOUT_REQUEST_DELAY_MIN"));
        set_opt(&mut self.rate_limit.delay_max_secs, env_parse("SCOUT_REQUEST_DELAY_MAX"));

        set_opt(
            &mut self.domains.allowed_file,
            env_string("SCOUT_ALLOWED_DOMAINS_FILE").map(PathBuf::from),
        );
        set_opt(
            &mut self.domains.disallowed_file,
            env_string("SCOUT_DISALLOWED_DOMAINS_FILE").map(PathBuf::from),
        );

        set_opt(&mut self.logging.level, env_string("SCOUT_LOG_LEVEL"));
        if let Some(format) = env_string("SCOUT_LOG_FORMAT") {
            self.logging.format = if format.eq_ignore_ascii_case("json") {
                LogFormat::Json
            } else {
                LogFormat::Pretty
            };
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        if s.max_concurrent_tasks == 0 || s.max_concurrent_tasks > MAX_CONCURRENCY_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "scheduler.max_concurrent_tasks must be 1..={MAX_CONCURRENCY_LIMIT}, got {}",
                s.max_concurrent_tasks
            )));
        }
        if s.task_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.task_timeout_secs must be positive".to_string(),
            ));
        }

        let r = &self.rate_limit;
        if r.max_requests == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.max_requests must be at least 1".to_string(),
            ));
        }
        if r.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.window_secs must be positive".to_string(),
            ));
        }
        if r.delay_min_secs > r.delay_max_secs {
            return Err(ConfigError::Invalid(format!(
                "rate_limit.delay_min_secs ({}) exceeds delay_max_secs ({})",
                r.delay_min_secs, r.delay_max_secs
            )));
        }
        if r.overload_threshold == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.overload_threshold must be at least 1".to_string(),
            ));
        }

        let e = &self.events;
        if e.backlog == 0 || e.subscriber_capacity == 0 || e.producer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "events buffers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr,
{
    env_string(key).and_then(|v| v.trim().parse::<T>().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn set_opt<T>(dst: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *dst = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.scheduler.max_concurrent_tasks, 5);
        assert_eq!(cfg.rate_limit.max_requests, 5);
        assert_eq!(cfg.rate_limit.window(), Duration::from_secs(90));
        assert_eq!(cfg.rate_limit.delay_min(), Duration::from_secs(10));
        assert_eq!(cfg.rate_limit.delay_max(), Duration::from_secs(20));
        assert_eq!(cfg.rate_limit.backoff_reset_after(), Duration::from_secs(90));
        assert_eq!(cfg.events.backlog, 50);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = AppConfig::from_toml_str(
            r#"
            [scheduler]
            max_concurrent_tasks = 8

            [rate_limit]
            window_secs = 60

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.scheduler.max_concurrent_tasks, 8);
        assert_eq!(cfg.scheduler.grace_period_secs, 5);
        assert_eq!(cfg.rate_limit.window_secs, 60);
        assert_eq!(cfg.rate_limit.max_requests, 5);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn concurrency_above_ten_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.scheduler.max_concurrent_tasks = 11;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
        cfg.scheduler.max_concurrent_tasks = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_delay_range_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.rate_limit.delay_min_secs = 30;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn from_file_reports_parse_errors_with_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler\nmax_concurrent_tasks = ").unwrap();
        let err = AppConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = AppConfig::from_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

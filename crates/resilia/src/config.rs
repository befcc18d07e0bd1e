//! Resilience configuration
//!
//! One [`ResilienceConfig`] describes every knob of a protected operation:
//! bulkhead limits, breaker thresholds and retry backoff. Durations are
//! written in milliseconds (`sleep_window_ms = 2000`).
//!
//! ## Loading Strategy
//! 1. `RESILIA_CONFIG` names a TOML or JSON file: load it
//! 2. Otherwise probe `./resilia.toml` then `./resilia.json`
//! 3. Otherwise build the defaults from `RESILIA_*` environment variables
//!
//! ## Environment Variables
//! - `RESILIA_CONCURRENCY_LIMIT`, `RESILIA_QUEUE_LIMIT`
//! - `RESILIA_ERROR_THRESHOLD`, `RESILIA_SLEEP_WINDOW_MS`, `RESILIA_MIN_REQUESTS`
//! - `RESILIA_MAX_RETRIES`, `RESILIA_BASE_DELAY_MS`, `RESILIA_CAP_DELAY_MS`
//! - `RESILIA_WAIT_TIMEOUT_MS`, `RESILIA_EXCLUSIVE_PROBE`
//!
//! Unset variables keep their defaults; set but unparsable ones are errors.
//!
//! ## Latency caveat
//! Only the bulkhead wait is bounded. There is no deadline spanning retries,
//! so a call can take up to [`ResilienceConfig::worst_case_latency`] plus the
//! task's own run time on every attempt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::resilience::{OperationKey, RetryPolicy};
use crate::utils::serde::duration_millis;

/// Environment variable prefix used by [`ResilienceConfig::from_env`]
pub const ENV_PREFIX: &str = "RESILIA";

/// Environment variable naming an explicit settings file
pub const CONFIG_PATH_ENV: &str = "RESILIA_CONFIG";

/// Full configuration of one protected operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceConfig {
    /// Bulkhead: maximum concurrent executions
    pub concurrency_limit: usize,
    /// Bulkhead: maximum callers waiting for a slot
    pub queue_limit: usize,
    /// Breaker: failure fraction (0, 1] above which the circuit trips
    pub error_threshold: f64,
    /// Breaker: how long to stay open before probing
    #[serde(rename = "sleep_window_ms", with = "duration_millis")]
    pub sleep_window: Duration,
    /// Breaker: samples in the window must exceed this before evaluating
    pub min_requests: u64,
    /// Retry: attempts beyond the first
    pub max_retries: u32,
    /// Retry: backoff base
    #[serde(rename = "base_delay_ms", with = "duration_millis")]
    pub base_delay: Duration,
    /// Retry: backoff ceiling
    #[serde(rename = "cap_delay_ms", with = "duration_millis")]
    pub cap_delay: Duration,
    /// Bulkhead: how long one caller may wait in the queue
    #[serde(rename = "wait_timeout_ms", with = "duration_millis")]
    pub wait_timeout: Duration,
    /// Breaker: admit a single probe at a time while half-open
    pub exclusive_probe: bool,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 10,
            queue_limit: 1000,
            error_threshold: 0.5,
            sleep_window: Duration::from_secs(30),
            min_requests: 10,
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            cap_delay: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(5),
            exclusive_probe: true,
        }
    }
}

impl ResilienceConfig {
    /// Create a configuration builder
    pub fn builder() -> ResilienceConfigBuilder {
        ResilienceConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.concurrency_limit == 0 {
            return Err(ConfigError::invalid("concurrency_limit must be greater than 0"));
        }

        if !(self.error_threshold > 0.0 && self.error_threshold <= 1.0) {
            return Err(ConfigError::invalid(format!(
                "error_threshold must be in (0, 1], got {}",
                self.error_threshold
            )));
        }

        if self.sleep_window.is_zero() {
            return Err(ConfigError::invalid("sleep_window_ms must be greater than 0"));
        }

        if self.cap_delay < self.base_delay {
            return Err(ConfigError::invalid(format!(
                "cap_delay_ms ({:?}) must not be below base_delay_ms ({:?})",
                self.cap_delay, self.base_delay
            )));
        }

        Ok(())
    }

    /// Retry parameters for one call
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.base_delay, self.cap_delay)
    }

    /// Upper bound on time spent waiting in the bulkhead queue and sleeping
    /// between attempts, excluding the task's own run time
    ///
    /// Every attempt may wait up to `wait_timeout` for a slot, and each retry
    /// adds at most `min(cap, base * 2^attempt)` of backoff.
    pub fn worst_case_latency(&self) -> Duration {
        let attempts = self.max_retries.saturating_add(1);
        let queueing = self.wait_timeout.saturating_mul(attempts);
        let policy = self.retry_policy();
        (0..self.max_retries)
            .map(|attempt| policy.max_delay_for(attempt))
            .fold(queueing, Duration::saturating_add)
    }

    /// Load from `RESILIA_*` environment variables, starting from defaults
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_env_with_prefix(ENV_PREFIX)
    }

    /// Load from `{prefix}_*` environment variables, starting from defaults
    pub fn from_env_with_prefix(prefix: &str) -> ConfigResult<Self> {
        Self::from_lookup(prefix, |name| std::env::var(name).ok())
    }

    fn from_lookup<F>(prefix: &str, lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let var = |suffix: &str| {
            let name = format!("{prefix}_{suffix}");
            lookup(&name).map(|value| (name, value))
        };

        if let Some(v) = var("CONCURRENCY_LIMIT") {
            config.concurrency_limit = parse_env(v)?;
        }
        if let Some(v) = var("QUEUE_LIMIT") {
            config.queue_limit = parse_env(v)?;
        }
        if let Some(v) = var("ERROR_THRESHOLD") {
            config.error_threshold = parse_env(v)?;
        }
        if let Some(v) = var("SLEEP_WINDOW_MS") {
            config.sleep_window = Duration::from_millis(parse_env(v)?);
        }
        if let Some(v) = var("MIN_REQUESTS") {
            config.min_requests = parse_env(v)?;
        }
        if let Some(v) = var("MAX_RETRIES") {
            config.max_retries = parse_env(v)?;
        }
        if let Some(v) = var("BASE_DELAY_MS") {
            config.base_delay = Duration::from_millis(parse_env(v)?);
        }
        if let Some(v) = var("CAP_DELAY_MS") {
            config.cap_delay = Duration::from_millis(parse_env(v)?);
        }
        if let Some(v) = var("WAIT_TIMEOUT_MS") {
            config.wait_timeout = Duration::from_millis(parse_env(v)?);
        }
        if let Some(v) = var("EXCLUSIVE_PROBE") {
            config.exclusive_probe = parse_env(v)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_env<T: FromStr>((name, value): (String, String)) -> ConfigResult<T> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnv { name, value })
}

/// Builder for [`ResilienceConfig`]
#[derive(Debug, Default)]
pub struct ResilienceConfigBuilder {
    config: ResilienceConfig,
}

impl ResilienceConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn concurrency_limit(mut self, limit: usize) -> Self {
        self.config.concurrency_limit = limit;
        self
    }

    pub const fn queue_limit(mut self, limit: usize) -> Self {
        self.config.queue_limit = limit;
        self
    }

    pub const fn error_threshold(mut self, threshold: f64) -> Self {
        self.config.error_threshold = threshold;
        self
    }

    pub const fn sleep_window(mut self, window: Duration) -> Self {
        self.config.sleep_window = window;
        self
    }

    pub const fn min_requests(mut self, min: u64) -> Self {
        self.config.min_requests = min;
        self
    }

    pub const fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub const fn cap_delay(mut self, delay: Duration) -> Self {
        self.config.cap_delay = delay;
        self
    }

    pub const fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.wait_timeout = timeout;
        self
    }

    pub const fn exclusive_probe(mut self, exclusive: bool) -> Self {
        self.config.exclusive_probe = exclusive;
        self
    }

    pub fn build(self) -> ConfigResult<ResilienceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Defaults plus per-operation overrides, keyed by operation key
///
/// ```toml
/// [defaults]
/// concurrency_limit = 8
///
/// [operations."UserService::get_user_data"]
/// concurrency_limit = 2
/// queue_limit = 2
/// sleep_window_ms = 2000
/// ```
///
/// Each operation table is a complete config: fields it omits take the
/// built-in defaults, not the `[defaults]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceSettings {
    pub defaults: ResilienceConfig,
    pub operations: HashMap<String, ResilienceConfig>,
}

impl ResilienceSettings {
    /// Parse settings from TOML
    pub fn from_toml_str(input: &str) -> ConfigResult<Self> {
        let settings: Self = toml::from_str(input)
            .map_err(|e| ConfigError::Parse { format: "TOML", message: e.to_string() })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from JSON
    pub fn from_json_str(input: &str) -> ConfigResult<Self> {
        let settings: Self = serde_json::from_str(input)
            .map_err(|e| ConfigError::Parse { format: "JSON", message: e.to_string() })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a file, picking the format by extension
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;

        let settings = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&contents)?,
            Some("json") => Self::from_json_str(&contents)?,
            other => return Err(ConfigError::UnsupportedFormat(other.unwrap_or("").to_string())),
        };

        tracing::info!(
            path = %path.display(),
            operations = settings.operations.len(),
            "Resilience settings loaded from file"
        );
        Ok(settings)
    }

    /// Load using the module-level strategy (explicit file, probed file, env)
    pub fn load() -> ConfigResult<Self> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Self::load_from_file(Path::new(&path));
        }

        if let Some(path) = probe_config_paths().into_iter().find(|p| p.is_file()) {
            return Self::load_from_file(&path);
        }

        tracing::debug!("No resilience settings file found, using environment defaults");
        Ok(Self { defaults: ResilienceConfig::from_env()?, operations: HashMap::new() })
    }

    /// Configuration for `key`: its override if present, otherwise defaults
    pub fn for_operation(&self, key: &OperationKey) -> &ResilienceConfig {
        self.operations.get(key.as_str()).unwrap_or(&self.defaults)
    }

    /// Validate defaults and every override
    pub fn validate(&self) -> ConfigResult<()> {
        self.defaults.validate()?;
        for (name, config) in &self.operations {
            config.validate().map_err(|e| ConfigError::invalid(format!("operation {name}: {e}")))?;
        }
        Ok(())
    }
}

/// Candidate settings files, in probe order
pub fn probe_config_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("resilia.toml"), PathBuf::from("resilia.json")]
}

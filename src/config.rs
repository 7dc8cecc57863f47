// Runtime configuration
// Layered defaults, config files and PORTFLOW__* environment variables

//! # Runtime Configuration
//!
//! [`RuntimeConfig`] carries every tunable the runtime reads: port deadlines,
//! compensation limits, circuit breaker defaults and worker pool sizing.
//!
//! ## Sources
//!
//! Later sources override earlier ones:
//! 1. Hard defaults (the `Default` impls below)
//! 2. `config/default.{toml,yaml,json}` if present
//! 3. `config/{RUN_MODE}.*` if present (`RUN_MODE` defaults to `development`)
//! 4. An explicit file passed to [`RuntimeConfig::load_from`]
//! 5. Environment variables such as `PORTFLOW__PORT__TIMEOUT_MS=5000` or
//!    `PORTFLOW__COMPENSATION__MAX_UNDO_RETRIES=5`

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::engine::thread_pool::PoolOptions;
use crate::models::Threshold;
use crate::Result;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub port: PortDefaults,
    pub compensation: CompensationConfig,
    pub breaker: BreakerDefaults,
    pub pool: PoolConfig,
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: PortDefaults::default(),
            compensation: CompensationConfig::default(),
            breaker: BreakerDefaults::default(),
            pool: PoolConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Defaults applied to ports that do not set their own deadline or retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortDefaults {
    /// Per-attempt deadline. Zero disables the timer.
    pub timeout_ms: u64,
    pub max_retry: u32,
}

impl Default for PortDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: 12_000,
            max_retry: 10,
        }
    }
}

/// Limits for the saga compensator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompensationConfig {
    pub max_undo_retries: u32,
    pub undo_timeout_ms: u64,
    /// Pause between attempts on the same port.
    pub retry_delay_ms: u64,
}

impl CompensationConfig {
    /// Hard limit on one undo attempt.
    pub fn undo_timeout(&self) -> Duration {
        Duration::from_millis(self.undo_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for CompensationConfig {
    fn default() -> Self {
        Self {
            max_undo_retries: 3,
            undo_timeout_ms: 60_000,
            retry_delay_ms: 0,
        }
    }
}

/// The threshold used when neither the port nor the error kind sets one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerDefaults {
    /// Percent of failed calls in the window that trips the breaker.
    pub error_rate: f64,
    /// Minimum successful calls in the window before the rate is considered.
    pub call_volume: usize,
    pub interval_ms: u64,
    pub retry_delay_ms: u64,
    pub max_log_entries: usize,
}

impl Default for BreakerDefaults {
    fn default() -> Self {
        Self {
            error_rate: 20.0,
            call_volume: 5,
            interval_ms: 9_000,
            retry_delay_ms: 10_000,
            max_log_entries: 1_000,
        }
    }
}

impl BreakerDefaults {
    pub fn threshold(&self) -> Threshold {
        Threshold::new(
            self.error_rate,
            self.call_volume,
            Duration::from_millis(self.interval_ms),
            Duration::from_millis(self.retry_delay_ms),
        )
    }
}

/// Worker pool sizing and lifecycle deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Percent of jobs that had to wait before the pool grows past `min_workers`.
    pub queue_tolerance: u32,
    pub drain_timeout_ms: u64,
    pub worker_start_timeout_ms: u64,
    pub worker_stop_timeout_ms: u64,
    pub preload: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 2,
            queue_tolerance: 25,
            drain_timeout_ms: 4_000,
            worker_start_timeout_ms: 10_000,
            worker_stop_timeout_ms: 5_000,
            preload: false,
        }
    }
}

impl PoolConfig {
    pub fn options(&self) -> PoolOptions {
        PoolOptions {
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            queue_tolerance: self.queue_tolerance,
            preload: self.preload,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            worker_start_timeout: Duration::from_millis(self.worker_start_timeout_ms),
            worker_stop_timeout: Duration::from_millis(self.worker_stop_timeout_ms),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RuntimeConfig {
    /// Load configuration from the default file locations and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration, layering `path` on top of the default files.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let mut builder = config::Config::builder()
            .set_default("log_level", default_log_level())?
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false));

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("PORTFLOW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: RuntimeConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_workers == 0 {
            return Err(crate::PortflowError::InvalidInput(
                "pool.max_workers must be at least 1".into(),
            ));
        }
        if self.pool.min_workers > self.pool.max_workers {
            return Err(crate::PortflowError::InvalidInput(format!(
                "pool.min_workers ({}) exceeds pool.max_workers ({})",
                self.pool.min_workers, self.pool.max_workers
            )));
        }
        if !(0.0..=100.0).contains(&self.breaker.error_rate) {
            return Err(crate::PortflowError::InvalidInput(format!(
                "breaker.error_rate must be a percentage, got {}",
                self.breaker.error_rate
            )));
        }
        Ok(())
    }

    pub fn port_timeout(&self) -> Duration {
        Duration::from_millis(self.port.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.port.timeout_ms, 12_000);
        assert_eq!(config.port.max_retry, 10);
        assert_eq!(config.compensation.max_undo_retries, 3);
        assert_eq!(config.compensation.undo_timeout_ms, 60_000);
        assert_eq!(config.breaker.call_volume, 5);
        assert_eq!(config.breaker.interval_ms, 9_000);
        assert_eq!(config.pool.queue_tolerance, 25);
        assert_eq!(config.pool.drain_timeout_ms, 4_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_documents_fall_back_to_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"port": {"timeout_ms": 50}, "pool": {"max_workers": 4}}"#)
                .unwrap();
        assert_eq!(config.port.timeout_ms, 50);
        assert_eq!(config.port.max_retry, 10);
        assert_eq!(config.pool.max_workers, 4);
        assert_eq!(config.pool.min_workers, 1);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn min_workers_above_max_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.pool.min_workers = 3;
        config.pool.max_workers = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn compensation_limits_become_durations() {
        let compensation = CompensationConfig {
            undo_timeout_ms: 250,
            retry_delay_ms: 40,
            ..CompensationConfig::default()
        };
        assert_eq!(compensation.undo_timeout(), Duration::from_millis(250));
        assert_eq!(compensation.retry_delay(), Duration::from_millis(40));
        assert_eq!(
            CompensationConfig::default().undo_timeout(),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn breaker_defaults_become_a_threshold() {
        let threshold = BreakerDefaults::default().threshold();
        assert_eq!(threshold.call_volume, 5);
        assert_eq!(threshold.interval, Duration::from_millis(9_000));
        assert_eq!(threshold.retry_delay, Duration::from_millis(10_000));
    }
}

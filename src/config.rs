//! Runner configuration.
//!
//! Values come from the builder defaults, can be deserialized from any serde format, and
//! can be overridden from the environment with [`RunnerConfig::from_env`].
use std::time::Duration;

use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::error::EngineError;

pub const THREADS_ENV: &str = "VOLLEY_THREADS";
pub const JITTER_WATCHDOG_PERIOD_ENV: &str = "VOLLEY_JITTER_WATCHDOG_PERIOD";
pub const JITTER_WATCHDOG_THRESHOLD_ENV: &str = "VOLLEY_JITTER_WATCHDOG_THRESHOLD";
pub const SHUTDOWN_TIMEOUT_ENV: &str = "VOLLEY_SHUTDOWN_TIMEOUT";

fn default_threads() -> usize {
    num_cpus::get()
}

fn default_jitter_period_ms() -> u64 {
    50
}

fn default_jitter_threshold_ms() -> u64 {
    100
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

/// Knobs for the simulation runner.
///
/// - `threads`: number of single-threaded event loops. Every session, pool slot and
///   statistics bucket is pinned to one of them.
/// - `jitter_watchdog_period_ms` / `jitter_watchdog_threshold_ms`: how often the watchdog
///   wakes up and how late it may wake up before an anomaly is reported.
/// - `shutdown_timeout_ms`: grace period given to the event loops on shutdown.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, TypedBuilder)]
pub struct RunnerConfig {
    #[builder(default = default_threads())]
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[builder(default = default_jitter_period_ms())]
    #[serde(default = "default_jitter_period_ms")]
    pub jitter_watchdog_period_ms: u64,
    #[builder(default = default_jitter_threshold_ms())]
    #[serde(default = "default_jitter_threshold_ms")]
    pub jitter_watchdog_threshold_ms: u64,
    #[builder(default = default_shutdown_timeout_ms())]
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RunnerConfig {
    /// Defaults overridden by any `VOLLEY_*` environment variable that is set.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup. `from_env` uses the process
    /// environment.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, EngineError> {
        let parse = |key: &str| -> Result<Option<u64>, EngineError> {
            lookup(key)
                .map(|raw| {
                    raw.trim().parse::<u64>().map_err(|e| {
                        EngineError::Config(format!("{key}={raw:?} is not a number: {e}"))
                    })
                })
                .transpose()
        };
        if let Some(threads) = parse(THREADS_ENV)? {
            self.threads = threads as usize;
        }
        if let Some(period) = parse(JITTER_WATCHDOG_PERIOD_ENV)? {
            self.jitter_watchdog_period_ms = period;
        }
        if let Some(threshold) = parse(JITTER_WATCHDOG_THRESHOLD_ENV)? {
            self.jitter_watchdog_threshold_ms = threshold;
        }
        if let Some(timeout) = parse(SHUTDOWN_TIMEOUT_ENV)? {
            self.shutdown_timeout_ms = timeout;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.threads == 0 {
            return Err(EngineError::Config("threads must be at least 1".into()));
        }
        if self.jitter_watchdog_period_ms == 0 {
            return Err(EngineError::Config(
                "jitter watchdog period must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn jitter_watchdog_period(&self) -> Duration {
        Duration::from_millis(self.jitter_watchdog_period_ms)
    }

    pub fn jitter_watchdog_threshold(&self) -> Duration {
        Duration::from_millis(self.jitter_watchdog_threshold_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

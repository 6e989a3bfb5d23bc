use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::progress::{ProgressConfig, ProgressPublisher};
use crate::resilience::{BreakerConfig, RetryPolicy};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub progress: ProgressSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub concurrency_limit: usize,
    pub deadline_secs: u64,
    /// How long a timed-out task may take to honour cancellation.
    pub cancel_grace_ms: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            deadline_secs: 600,
            cancel_grace_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub attempt_limit: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            attempt_limit: 3,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            jitter_ratio: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
    pub half_open_max_calls: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout_secs: 30,
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSection {
    pub min_interval_ms: u64,
    pub subscriber_capacity: usize,
}

impl Default for ProgressSection {
    fn default() -> Self {
        Self {
            min_interval_ms: 250,
            subscriber_capacity: 64,
        }
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            tracing::debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        tracing::debug!(
            concurrency_limit = config.scheduler.concurrency_limit,
            attempt_limit = config.retry.attempt_limit,
            failure_threshold = config.breaker.failure_threshold,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                tracing::debug!(dir = %dir.display(), "Creating config directory");
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let jitter = self.retry.jitter_ratio;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(Error::Validation(format!(
                "retry.jitter_ratio must be within [0, 1], got {}",
                jitter
            )));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(Error::Validation(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }
        Ok(())
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.scheduler.deadline_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.scheduler.cancel_grace_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.attempt_limit,
            Duration::from_millis(self.retry.base_delay_ms),
        )
        .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
        .with_jitter(self.retry.jitter_ratio)
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            reset_timeout: Duration::from_secs(self.breaker.reset_timeout_secs),
            half_open_max_calls: self.breaker.half_open_max_calls,
        }
    }

    pub fn progress_config(&self) -> ProgressConfig {
        ProgressConfig {
            min_interval: Duration::from_millis(self.progress.min_interval_ms),
        }
    }

    /// Publisher whose subscribers buffer `[progress] subscriber_capacity` snapshots.
    pub fn progress_publisher(&self) -> ProgressPublisher {
        ProgressPublisher::new(self.progress.subscriber_capacity)
    }
}

//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{GridError, GridResult};

/// Default number of sessions that may be open on the server at once
pub const DEFAULT_TEST_CONCURRENCY: usize = 5;

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Admission limit for simultaneously open remote sessions
    pub test_concurrency: usize,

    /// Sleep between two runner ticks
    pub tick_interval_ms: u64,

    /// Maximum number of not-yet-rendered steps of one test ahead of a dispatched step
    pub parallel_steps_per_test: usize,

    /// Poll interval used while waiting for results
    pub results_poll_interval_ms: u64,

    /// Optional cap on concurrent check operations
    pub check_concurrency: Option<usize>,

    /// Optional cap on concurrent close operations
    pub close_concurrency: Option<usize>,

    /// Retry policy when the server reports its session slots are full
    pub open_retry: OpenRetryConfig,

    /// Render polling
    pub render: RenderConfig,

    /// Resource crawler limits
    pub crawler: CrawlerConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            test_concurrency: DEFAULT_TEST_CONCURRENCY,
            tick_interval_ms: 10,
            parallel_steps_per_test: 1,
            results_poll_interval_ms: 100,
            check_concurrency: None,
            close_concurrency: None,
            open_retry: OpenRetryConfig::default(),
            render: RenderConfig::default(),
            crawler: CrawlerConfig::default(),
        }
    }
}

/// Back-off applied while the server answers "concurrency full"
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenRetryConfig {
    /// Delay used during the first `medium_after_ms` of waiting
    pub initial_delay_ms: u64,

    /// Delay used once `medium_after_ms` have passed
    pub medium_delay_ms: u64,
    pub medium_after_ms: u64,

    /// Delay used once `long_after_ms` have passed
    pub long_delay_ms: u64,
    pub long_after_ms: u64,

    /// Give up and fail the open after this long
    pub open_timeout_ms: u64,
}

impl Default for OpenRetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2_000,
            medium_delay_ms: 5_000,
            medium_after_ms: 10_000,
            long_delay_ms: 10_000,
            long_after_ms: 30_000,
            open_timeout_ms: 60 * 60 * 1000,
        }
    }
}

impl OpenRetryConfig {
    /// Delay before the next attempt, given how long the open has been waiting
    pub fn delay_after(&self, waited: Duration) -> Duration {
        let waited_ms = waited.as_millis() as u64;
        let delay = if waited_ms >= self.long_after_ms {
            self.long_delay_ms
        } else if waited_ms >= self.medium_after_ms {
            self.medium_delay_ms
        } else {
            self.initial_delay_ms
        };
        Duration::from_millis(delay)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    /// Retry immediately on the next tick and never time out quickly; handy for tests
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            medium_delay_ms: 0,
            long_delay_ms: 0,
            ..Self::default()
        }
    }
}

/// Render status polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_500,
            timeout_ms: 60 * 60 * 1000,
        }
    }
}

impl RenderConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Resource crawler limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Hard cap on parse work done in one crawler tick
    pub max_parses_per_tick: usize,

    /// Downloads in flight per crawl
    pub max_concurrent_downloads: usize,

    /// User agent forwarded to the resource fetcher
    pub user_agent: Option<String>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_parses_per_tick: 200,
            max_concurrent_downloads: 50,
            user_agent: None,
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from file, falling back to defaults when it is missing
    pub fn load(path: &Path) -> GridResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> GridResult<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the scheduler cannot make progress with
    pub fn validate(&self) -> GridResult<()> {
        if self.test_concurrency == 0 {
            return Err(GridError::InvalidConfig(
                "test_concurrency must be at least 1".to_string(),
            ));
        }
        if self.parallel_steps_per_test == 0 {
            return Err(GridError::InvalidConfig(
                "parallel_steps_per_test must be at least 1".to_string(),
            ));
        }
        if self.crawler.max_parses_per_tick == 0 || self.crawler.max_concurrent_downloads == 0 {
            return Err(GridError::InvalidConfig(
                "crawler limits must be at least 1".to_string(),
            ));
        }
        if matches!(self.check_concurrency, Some(0)) || matches!(self.close_concurrency, Some(0)) {
            return Err(GridError::InvalidConfig(
                "service concurrency caps must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn results_poll_interval(&self) -> Duration {
        Duration::from_millis(self.results_poll_interval_ms)
    }

    pub fn with_test_concurrency(mut self, concurrency: usize) -> Self {
        self.test_concurrency = concurrency;
        self
    }
}

/// Default configuration file location
pub fn default_config_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".snapgrid")
        .join("config.toml")
}

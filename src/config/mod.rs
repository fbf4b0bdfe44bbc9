//! # Orchestrator Configuration
//!
//! Typed configuration for every component. All sections have working defaults, so an
//! empty configuration directory yields a runnable development setup.
//!
//! ## Layering
//!
//! 1. Built-in defaults ([`OrchestratorConfig::default`])
//! 2. `config/orchestrator.{toml,yaml}`
//! 3. `config/orchestrator.{environment}.toml`
//! 4. Environment variables prefixed `ORCHESTRATOR__`, e.g.
//!    `ORCHESTRATOR__RETRY__MAX_RETRIES=5`
//!
//! ```rust,no_run
//! use script_orchestrator::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let max_retries = manager.config().retry.max_retries;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{self, queues, selector};

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub database: DatabaseConfig,
    pub queues: QueueConfig,
    pub retry: RetryConfig,
    pub locks: LockConfig,
    pub selector: SelectorConfig,
    pub execution: ExecutionConfig,
    pub backend: BackendConfig,
    pub workers: WorkerConfig,
    pub uploads: UploadConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
    /// Apply bundled migrations on startup
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/script_orchestrator_development".to_string(),
            max_connections: 10,
            acquire_timeout_seconds: 5,
            run_migrations: true,
        }
    }
}

impl DatabaseConfig {
    /// `DATABASE_URL` wins over the configured value, matching sqlx tooling.
    pub fn resolved_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| self.url.clone())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub step_dispatch: String,
    pub dead_letter: String,
    pub completions: String,
    /// Seconds a received message stays invisible before redelivery
    pub visibility_timeout_seconds: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            step_dispatch: queues::STEP_DISPATCH.to_string(),
            dead_letter: queues::STEP_DISPATCH_DLQ.to_string(),
            completions: queues::STEP_COMPLETIONS.to_string(),
            visibility_timeout_seconds: 30,
        }
    }
}

/// Retry budget for dispatch messages.
///
/// `max_retries` counts failed deliveries, and the failure that reaches it is
/// dead-lettered instead of republished. Only the first `max_retries - 1` entries of
/// `delays_seconds` are therefore used: with the defaults (3 and `[10, 20, 30]`) the
/// 30s entry is reached only once `max_retries` is raised to 4 or more, and it then
/// repeats for every later retry.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub delays_seconds: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: constants::DEFAULT_MAX_RETRIES,
            delays_seconds: constants::DEFAULT_RETRY_DELAYS_SECONDS.to_vec(),
        }
    }
}

impl RetryConfig {
    /// Delay before republishing a message that has already been retried
    /// `retry_count` times. The last entry repeats past the end of the schedule.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let index = (retry_count as usize).min(self.delays_seconds.len().saturating_sub(1));
        Duration::from_secs(self.delays_seconds.get(index).copied().unwrap_or(0))
    }

    /// Whether the failure that just happened on a message with `retry_count`
    /// prior republishes exhausts the budget.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count + 1 >= self.max_retries
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LockConfig {
    pub expiry_seconds: i64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            expiry_seconds: constants::DEFAULT_LOCK_EXPIRY_SECONDS,
        }
    }
}

impl LockConfig {
    pub fn expiry(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_seconds)
    }
}

/// Load-balancer coefficients
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub running_job_weight: f64,
    pub cpu_divisor: f64,
    pub free_memory_weight: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            running_job_weight: selector::RUNNING_JOB_WEIGHT,
            cpu_divisor: selector::CPU_DIVISOR,
            free_memory_weight: selector::FREE_MEMORY_WEIGHT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub environment: String,
    pub max_concurrent_executions_per_user: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            max_concurrent_executions_per_user:
                constants::DEFAULT_MAX_CONCURRENT_EXECUTIONS_PER_USER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Path appended to the execution's tunnel endpoint
    pub dispatch_path: String,
    pub request_timeout_seconds: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            dispatch_path: "/api/automation/run".to_string(),
            request_timeout_seconds: 120,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub dispatch_workers: usize,
    pub poll_interval_ms: u64,
    /// Fixed backoff before a worker resubscribes after a transport failure
    pub resubscribe_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dispatch_workers: 2,
            poll_interval_ms: 250,
            resubscribe_backoff_ms: 5000,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct UploadConfig {
    pub cache_ttl_seconds: u64,
    /// Lifetime of a stored association before it is ignored
    pub association_ttl_seconds: i64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 300,
            association_ttl_seconds: 24 * 3600,
        }
    }
}

impl UploadConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn association_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.association_ttl_seconds)
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.database.url.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "database.url",
                "database configuration",
            ));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                "0",
                "pool size must be greater than 0",
            ));
        }

        for (field, name) in [
            ("queues.step_dispatch", &self.queues.step_dispatch),
            ("queues.dead_letter", &self.queues.dead_letter),
            ("queues.completions", &self.queues.completions),
        ] {
            if name.is_empty() {
                return Err(ConfigurationError::missing_required_field(
                    field,
                    "queue configuration",
                ));
            }
        }

        if self.retry.max_retries == 0 {
            return Err(ConfigurationError::invalid_value(
                "retry.max_retries",
                "0",
                "at least one delivery attempt is required",
            ));
        }

        if self.retry.delays_seconds.is_empty() {
            return Err(ConfigurationError::invalid_value(
                "retry.delays_seconds",
                "[]",
                "backoff schedule must have at least one entry",
            ));
        }

        if self.retry.delays_seconds.contains(&0) {
            return Err(ConfigurationError::invalid_value(
                "retry.delays_seconds",
                format!("{:?}", self.retry.delays_seconds),
                "backoff delays must be non-zero",
            ));
        }

        if self.locks.expiry_seconds <= 0 {
            return Err(ConfigurationError::invalid_value(
                "locks.expiry_seconds",
                self.locks.expiry_seconds.to_string(),
                "lock expiry must be positive",
            ));
        }

        if self.selector.cpu_divisor <= 0.0 {
            return Err(ConfigurationError::invalid_value(
                "selector.cpu_divisor",
                self.selector.cpu_divisor.to_string(),
                "divisor must be positive",
            ));
        }

        if self.execution.max_concurrent_executions_per_user == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.max_concurrent_executions_per_user",
                "0",
                "concurrency cap must be at least 1",
            ));
        }

        if self.workers.dispatch_workers == 0 {
            return Err(ConfigurationError::invalid_value(
                "workers.dispatch_workers",
                "0",
                "at least one dispatch worker is required",
            ));
        }

        Ok(())
    }

    pub fn is_test_environment(&self) -> bool {
        self.execution.environment == "test"
    }
}

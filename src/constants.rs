//! # System Constants
//!
//! Default values shared by configuration, the messaging layer and the lock manager.

/// Queue names used when configuration does not override them.
pub mod queues {
    pub const STEP_DISPATCH: &str = "script_step_dispatch";
    pub const STEP_DISPATCH_DLQ: &str = "script_step_dispatch_dlq";
    pub const STEP_COMPLETIONS: &str = "script_step_completions";
}

/// A profile lock older than this is considered abandoned.
pub const DEFAULT_LOCK_EXPIRY_SECONDS: i64 = 3600;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Backoff before each republish. With the default budget of 3 the third entry is
/// not reached; it applies once `max_retries` is raised.
pub const DEFAULT_RETRY_DELAYS_SECONDS: [u64; 3] = [10, 20, 30];

pub const DEFAULT_MAX_CONCURRENT_EXECUTIONS_PER_USER: usize = 1;

/// Load-balancer coefficients: `jobs * 10 + cpu / 10 - free_memory_gb * 2`.
pub mod selector {
    pub const RUNNING_JOB_WEIGHT: f64 = 10.0;
    pub const CPU_DIVISOR: f64 = 10.0;
    pub const FREE_MEMORY_WEIGHT: f64 = 2.0;
}

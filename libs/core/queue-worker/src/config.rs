//! Worker configuration
//!
//! `WorkerConfig` bounds a single daemon run. `ConsumerIdentity` describes how the
//! consumer presents itself to the broker.

use std::time::Duration;

use uuid::Uuid;

/// Default resident memory ceiling (128 MiB)
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 128 * 1024 * 1024;

/// Budgets and pacing for one daemon run
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Sleep after an iteration that delivered no job
    pub sleep: Duration,

    /// Resident memory ceiling in bytes (0 disables the check)
    pub memory_limit_bytes: u64,

    /// Wall-clock budget for the whole run
    pub max_time: Option<Duration>,

    /// Number of jobs after which the run stops
    pub max_jobs: Option<u64>,

    /// Stop as soon as an iteration delivers nothing
    pub stop_when_empty: bool,

    /// Keep consuming while the maintenance probe reports down
    pub force: bool,

    /// Upper bound for a single broker wait
    pub wait_timeout: Duration,

    /// Default per-job deadline; a delivery's own timeout overrides it
    pub job_timeout: Option<Duration>,

    /// Sleep between checks while paused
    pub pause_interval: Duration,

    /// Attempts before a failing job is deleted (0 = unlimited)
    pub max_tries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sleep: Duration::from_secs(3),
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            max_time: None,
            max_jobs: None,
            stop_when_empty: false,
            force: false,
            wait_timeout: Duration::from_secs(5),
            job_timeout: Some(Duration::from_secs(60)),
            pause_interval: Duration::from_secs(1),
            max_tries: 1,
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sleep used after an empty iteration
    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    /// Set the memory ceiling in bytes
    pub fn with_memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    /// Set the memory ceiling in mebibytes
    pub fn with_memory_limit_mb(mut self, megabytes: u64) -> Self {
        self.memory_limit_bytes = megabytes.saturating_mul(1024 * 1024);
        self
    }

    /// Set the wall-clock budget (zero means unbounded)
    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = (!max_time.is_zero()).then_some(max_time);
        self
    }

    /// Set the job-count budget (zero means unbounded)
    pub fn with_max_jobs(mut self, max_jobs: u64) -> Self {
        self.max_jobs = (max_jobs > 0).then_some(max_jobs);
        self
    }

    pub fn with_stop_when_empty(mut self, stop_when_empty: bool) -> Self {
        self.stop_when_empty = stop_when_empty;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Set the default per-job deadline (None disables it)
    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn with_pause_interval(mut self, interval: Duration) -> Self {
        self.pause_interval = interval;
        self
    }

    /// Set the attempt budget for failing jobs (0 = unlimited)
    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }
}

/// How the consumer registers itself with the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerIdentity {
    /// Unique consumer tag (auto-generated if not provided)
    pub consumer_tag: String,

    /// Unacknowledged deliveries the broker may push ahead (0 = unbounded)
    pub prefetch_count: u16,

    /// Unacknowledged bytes the broker may push ahead (0 = unbounded)
    pub prefetch_size: u32,

    /// Highest priority honoured by the queue (0 disables priority routing)
    pub max_priority: u8,
}

impl Default for ConsumerIdentity {
    fn default() -> Self {
        Self {
            consumer_tag: format!("worker-{}", Uuid::new_v4()),
            prefetch_count: 1,
            prefetch_size: 0,
            max_priority: 0,
        }
    }
}

impl ConsumerIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the consumer tag
    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    /// Set the prefetch window
    pub fn with_prefetch(mut self, count: u16, size: u32) -> Self {
        self.prefetch_count = count;
        self.prefetch_size = size;
        self
    }

    pub fn with_max_priority(mut self, max_priority: u8) -> Self {
        self.max_priority = max_priority;
        self
    }

    /// Priority argument for the consume call
    pub fn priority_argument(&self) -> Option<u8> {
        (self.max_priority > 0).then_some(self.max_priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.memory_limit_bytes, 128 * 1024 * 1024);
        assert_eq!(config.wait_timeout, Duration::from_secs(5));
        assert_eq!(config.job_timeout, Some(Duration::from_secs(60)));
        assert!(config.max_jobs.is_none());
        assert!(config.max_time.is_none());
        assert!(!config.stop_when_empty);
    }

    #[test]
    fn test_zero_budgets_mean_unbounded() {
        let config = WorkerConfig::new()
            .with_max_jobs(0)
            .with_max_time(Duration::ZERO)
            .with_job_timeout(Some(Duration::ZERO));
        assert!(config.max_jobs.is_none());
        assert!(config.max_time.is_none());
        assert!(config.job_timeout.is_none());

        let config = WorkerConfig::new()
            .with_max_jobs(3)
            .with_memory_limit_mb(64);
        assert_eq!(config.max_jobs, Some(3));
        assert_eq!(config.memory_limit_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn test_consumer_identity() {
        let identity = ConsumerIdentity::new();
        assert!(identity.consumer_tag.starts_with("worker-"));
        assert_eq!(identity.priority_argument(), None);

        let identity = identity
            .with_consumer_tag("billing-1")
            .with_prefetch(10, 0)
            .with_max_priority(5);
        assert_eq!(identity.consumer_tag, "billing-1");
        assert_eq!(identity.prefetch_count, 10);
        assert_eq!(identity.priority_argument(), Some(5));
    }
}

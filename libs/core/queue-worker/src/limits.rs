//! Stop conditions for the consumer loop
//!
//! [`LimitEvaluator`] is a pure function of the run state and a snapshot of the
//! outside world ([`Observations`]). Rules are checked in a fixed order and the
//! first match wins:
//!
//! 1. shutdown requested, or the broker connection was lost
//! 2. memory ceiling reached
//! 3. restart broadcast differing from the one seen at startup
//! 4. queue empty while configured to stop when empty
//! 5. wall-clock budget spent
//! 6. job-count budget spent
//!
//! While paused only rules 1-3 apply.

use std::time::Duration;

use strum::{AsRefStr, Display};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::WorkerConfig;
use crate::job::JobSummary;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_MEMORY_LIMIT: i32 = 12;
pub const EXIT_TIME_LIMIT: i32 = 13;

/// Why a daemon run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    /// The broker stopped delivering, or the connection was lost
    Success,
    MemoryLimitExceeded,
    TimeLimitExceeded,
    MaxJobsReached,
    QueueEmptyAndConfiguredToStop,
    RestartRequested,
    ShutdownSignaled,
}

impl StopReason {
    /// Process exit status for this reason
    pub fn exit_code(&self) -> i32 {
        match self {
            StopReason::MemoryLimitExceeded => EXIT_MEMORY_LIMIT,
            StopReason::TimeLimitExceeded => EXIT_TIME_LIMIT,
            StopReason::Success
            | StopReason::MaxJobsReached
            | StopReason::QueueEmptyAndConfiguredToStop
            | StopReason::RestartRequested
            | StopReason::ShutdownSignaled => EXIT_SUCCESS,
        }
    }
}

/// Synthetic error carried by limit-exceeded events
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LimitDiagnostic {
    #[error("Memory limit exceeded: {used_bytes} bytes in use, limit is {limit_bytes} bytes")]
    Memory { used_bytes: u64, limit_bytes: u64 },

    #[error("Time limit exceeded: ran for {elapsed:?}, limit is {limit:?}")]
    Time { elapsed: Duration, limit: Duration },
}

/// Mutable state of one daemon run
#[derive(Debug, Clone)]
pub struct RunState {
    pub started_at: Instant,
    /// Deliveries handed to the executor; never decreases
    pub jobs_processed: u64,
    /// Restart broadcast observed when the run started
    pub last_restart_signal: Option<i64>,
    /// Job delivered during the current iteration
    pub current_job: Option<JobSummary>,
    pub connection_lost: bool,
    pub consumer_cancelled: bool,
}

impl RunState {
    pub fn new(last_restart_signal: Option<i64>) -> Self {
        Self {
            started_at: Instant::now(),
            jobs_processed: 0,
            last_restart_signal,
            current_job: None,
            connection_lost: false,
            consumer_cancelled: false,
        }
    }

    pub(crate) fn begin_job(&mut self, job: JobSummary) {
        self.current_job = Some(job);
    }

    pub(crate) fn count_job(&mut self) {
        self.jobs_processed += 1;
    }

    pub(crate) fn end_iteration(&mut self) {
        self.current_job = None;
    }
}

/// Snapshot of the outside world taken once per iteration
#[derive(Debug, Clone, PartialEq)]
pub struct Observations {
    pub now: Instant,
    pub memory_bytes: u64,
    pub shutdown_requested: bool,
    pub latest_restart_signal: Option<i64>,
}

/// A stop reason plus the measurement that triggered it
#[derive(Debug, Clone, PartialEq)]
pub struct StopDecision {
    pub reason: StopReason,
    pub diagnostic: Option<LimitDiagnostic>,
}

impl StopDecision {
    fn plain(reason: StopReason) -> Self {
        Self {
            reason,
            diagnostic: None,
        }
    }
}

pub struct LimitEvaluator<'a> {
    config: &'a WorkerConfig,
}

impl<'a> LimitEvaluator<'a> {
    pub fn new(config: &'a WorkerConfig) -> Self {
        Self { config }
    }

    /// Decide whether the loop must stop after an iteration
    pub fn evaluate(&self, state: &RunState, observed: &Observations) -> Option<StopDecision> {
        if let Some(decision) = self.evaluate_paused(state, observed) {
            return Some(decision);
        }

        if self.config.stop_when_empty && state.current_job.is_none() {
            return Some(StopDecision::plain(
                StopReason::QueueEmptyAndConfiguredToStop,
            ));
        }

        if let Some(limit) = self.config.max_time {
            let elapsed = observed.now.saturating_duration_since(state.started_at);
            if elapsed >= limit {
                return Some(StopDecision {
                    reason: StopReason::TimeLimitExceeded,
                    diagnostic: Some(LimitDiagnostic::Time { elapsed, limit }),
                });
            }
        }

        if let Some(max_jobs) = self.config.max_jobs {
            if state.jobs_processed >= max_jobs {
                return Some(StopDecision::plain(StopReason::MaxJobsReached));
            }
        }

        None
    }

    /// Decide whether the loop must stop while paused
    pub fn evaluate_paused(
        &self,
        state: &RunState,
        observed: &Observations,
    ) -> Option<StopDecision> {
        if observed.shutdown_requested {
            return Some(StopDecision::plain(StopReason::ShutdownSignaled));
        }
        if state.connection_lost {
            return Some(StopDecision::plain(StopReason::Success));
        }

        let limit_bytes = self.config.memory_limit_bytes;
        if limit_bytes > 0 && observed.memory_bytes >= limit_bytes {
            return Some(StopDecision {
                reason: StopReason::MemoryLimitExceeded,
                diagnostic: Some(LimitDiagnostic::Memory {
                    used_bytes: observed.memory_bytes,
                    limit_bytes,
                }),
            });
        }

        if observed.latest_restart_signal != state.last_restart_signal {
            return Some(StopDecision::plain(StopReason::RestartRequested));
        }

        None
    }
}

/// Source of the process's memory usage
pub trait MemoryProbe: Send + Sync {
    fn bytes_used(&self) -> u64;
}

/// Resident set size of the current process
///
/// Read from `/proc/self/status` on Linux; reports 0 elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemory;

impl MemoryProbe for ProcessMemory {
    fn bytes_used(&self) -> u64 {
        resident_bytes().unwrap_or(0)
    }
}

#[cfg(target_os = "linux")]
fn resident_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

#[cfg(not(target_os = "linux"))]
fn resident_bytes() -> Option<u64> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let kilobytes = status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))?
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse::<u64>()
        .ok()?;
    Some(kilobytes * 1024)
}

//! Instrumentation hooks
//!
//! Listeners observe the loop without influencing it. Every callback defaults to a
//! no-op, and a panicking listener never reaches the loop.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::job::{JobHandle, JobSummary, Resolution};
use crate::limits::{LimitDiagnostic, StopReason};

/// A job entering, leaving or moving through a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEvent {
    pub connection: String,
    pub queue: String,
    pub job_id: String,
    pub payload_bytes: usize,
}

impl QueueEvent {
    pub fn for_job(job: &JobHandle) -> Self {
        Self {
            connection: job.connection().to_string(),
            queue: job.queue().to_string(),
            job_id: job.id().to_string(),
            payload_bytes: job.raw_body().len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryLimitExceeded {
    pub status: StopReason,
    pub exit_code: i32,
    pub diagnostic: LimitDiagnostic,
    /// Job delivered in the iteration that tripped the limit
    pub job: Option<JobSummary>,
    pub bytes_used: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeLimitExceeded {
    pub status: StopReason,
    pub exit_code: i32,
    pub diagnostic: LimitDiagnostic,
    pub job: Option<JobSummary>,
    pub elapsed_seconds: f64,
}

/// How a job left the executor
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job: JobSummary,
    pub duration: Duration,
    pub resolution: Resolution,
    pub error: Option<String>,
}

pub trait WorkerListener: Send + Sync {
    fn on_memory_limit_exceeded(&self, _event: &MemoryLimitExceeded) {}

    fn on_time_limit_exceeded(&self, _event: &TimeLimitExceeded) {}

    fn on_pushed(&self, _event: &QueueEvent) {}

    fn on_reserved(&self, _event: &QueueEvent) {}

    fn on_deleted(&self, _event: &QueueEvent) {}

    fn on_job_processing(&self, _job: &JobSummary) {}

    fn on_job_processed(&self, _outcome: &JobOutcome) {}

    fn on_job_failed(&self, _outcome: &JobOutcome) {}
}

/// Fan-out to registered listeners
#[derive(Clone, Default)]
pub struct Hooks {
    listeners: Vec<Arc<dyn WorkerListener>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(mut self, listener: impl WorkerListener + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn push(&mut self, listener: Arc<dyn WorkerListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn memory_limit_exceeded(&self, event: &MemoryLimitExceeded) {
        self.dispatch("memory_limit_exceeded", |l| l.on_memory_limit_exceeded(event));
    }

    pub fn time_limit_exceeded(&self, event: &TimeLimitExceeded) {
        self.dispatch("time_limit_exceeded", |l| l.on_time_limit_exceeded(event));
    }

    pub fn pushed(&self, event: &QueueEvent) {
        self.dispatch("pushed", |l| l.on_pushed(event));
    }

    pub fn reserved(&self, event: &QueueEvent) {
        self.dispatch("reserved", |l| l.on_reserved(event));
    }

    pub fn deleted(&self, event: &QueueEvent) {
        self.dispatch("deleted", |l| l.on_deleted(event));
    }

    pub fn job_processing(&self, job: &JobSummary) {
        self.dispatch("job_processing", |l| l.on_job_processing(job));
    }

    pub fn job_processed(&self, outcome: &JobOutcome) {
        self.dispatch("job_processed", |l| l.on_job_processed(outcome));
    }

    pub fn job_failed(&self, outcome: &JobOutcome) {
        self.dispatch("job_failed", |l| l.on_job_failed(outcome));
    }

    fn dispatch(&self, event: &'static str, notify: impl Fn(&dyn WorkerListener)) {
        for listener in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| notify(listener.as_ref()))).is_err() {
                warn!(event, "Worker listener panicked, event skipped for this listener");
            }
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Logs limit events and job failures
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl WorkerListener for TracingListener {
    fn on_memory_limit_exceeded(&self, event: &MemoryLimitExceeded) {
        warn!(
            bytes_used = event.bytes_used,
            job_id = event.job.as_ref().map(|j| j.job_id.as_str()),
            exit_code = event.exit_code,
            "{}",
            event.diagnostic
        );
    }

    fn on_time_limit_exceeded(&self, event: &TimeLimitExceeded) {
        warn!(
            elapsed_seconds = event.elapsed_seconds,
            job_id = event.job.as_ref().map(|j| j.job_id.as_str()),
            exit_code = event.exit_code,
            "{}",
            event.diagnostic
        );
    }

    fn on_job_failed(&self, outcome: &JobOutcome) {
        warn!(
            job_id = %outcome.job.job_id,
            queue = %outcome.job.queue,
            attempts = outcome.job.attempts,
            resolution = %outcome.resolution,
            error = outcome.error.as_deref().unwrap_or("unknown"),
            "Job failed"
        );
    }

    fn on_job_processed(&self, outcome: &JobOutcome) {
        info!(
            job_id = %outcome.job.job_id,
            queue = %outcome.job.queue,
            duration_ms = outcome.duration.as_millis() as u64,
            "Job processed"
        );
    }
}

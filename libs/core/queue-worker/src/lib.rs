//! Queue Worker
//!
//! A single-consumer queue daemon: one consumer, one job at a time, bounded by
//! memory, wall-clock and job-count budgets.
//!
//! ## Features
//!
//! - **Broker flow control**: prefetch window, consumer tags, priority routing
//! - **Budgets**: memory ceiling, max run time, max jobs, stop when empty
//! - **Signals**: graceful shutdown, pause/resume, maintenance mode, restart broadcast
//! - **Per-job deadlines**: cooperative cancellation plus a watchdog thread
//! - **Instrumentation**: pluggable listeners and Prometheus metrics
//! - **Brokers**: Redis Streams and an in-memory broker
//!
//! ## Example
//!
//! ```ignore
//! use queue_worker::{Consumer, ConsumerIdentity, SignalGovernor, WorkerConfig, ProcessTerminator};
//! use queue_worker::redis::{RedisConnector, RedisSettings};
//!
//! let governor = SignalGovernor::new(Arc::new(ProcessTerminator));
//! governor.install()?;
//!
//! let consumer = Consumer::new(RedisConnector::new(settings)?, MyExecutor, ConsumerIdentity::new())
//!     .with_governor(governor);
//! let config = WorkerConfig::new().with_max_jobs(1000).with_memory_limit_mb(256);
//!
//! let code = match consumer.daemon("redis", "emails", &config).await {
//!     Ok(reason) => reason.exit_code(),
//!     Err(e) => e.exit_code(),
//! };
//! std::process::exit(code);
//! ```

mod channel;
mod config;
mod consumer;
mod error;
mod hooks;
mod job;
mod limits;
pub mod memory;
pub mod metrics;
mod producer;
#[cfg(feature = "redis")]
pub mod redis;
mod signals;

// Re-export main types
pub use channel::{ChannelAdapter, Connector, Delivery, DeliveryTag};
pub use config::{ConsumerIdentity, WorkerConfig, DEFAULT_MEMORY_LIMIT_BYTES};
pub use consumer::Consumer;
pub use error::{ChannelError, ConsumerError, ErrorCategory, JobError};
pub use hooks::{
    Hooks, JobOutcome, MemoryLimitExceeded, QueueEvent, TimeLimitExceeded, TracingListener,
    WorkerListener,
};
pub use job::{ErrorReporter, JobExecutor, JobHandle, JobSummary, Resolution, TracingReporter};
pub use limits::{
    LimitDiagnostic, LimitEvaluator, MemoryProbe, Observations, ProcessMemory, RunState,
    StopDecision, StopReason, EXIT_ERROR, EXIT_MEMORY_LIMIT, EXIT_SUCCESS, EXIT_TIME_LIMIT,
};
pub use memory::{MemoryBroker, MemoryChannel};
pub use metrics::{init_metrics, MetricsListener};
pub use producer::{InstrumentedProducer, Producer, PushOptions};
pub use signals::{
    DeadlineGuard, ExpiredDeadline, FileMaintenanceProbe, MaintenanceProbe, NeverDown,
    NoRestartSignal, ProcessTerminator, RestartFlag, RestartSignal, SignalGovernor, Terminator,
    DEFAULT_KILL_GRACE,
};

// Executors receive the cancellation token type directly
pub use tokio_util::sync::CancellationToken;

/// Process exit status for a finished daemon run
pub fn exit_code(result: &Result<StopReason, ConsumerError>) -> i32 {
    match result {
        Ok(reason) => reason.exit_code(),
        Err(error) => error.exit_code(),
    }
}

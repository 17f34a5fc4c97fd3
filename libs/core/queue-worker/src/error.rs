//! Error types and error categorization
//!
//! Broker errors are split by how the consumer loop must react:
//! - **Fatal**: the transport is unusable, the daemon exits with a failure status
//! - **Transient**: reported and survived, unless the connection itself was lost
//!
//! Job errors carry an [`ErrorCategory`] that decides how an unresolved job is settled:
//! - **Transient**: released with exponential backoff (1s-30s)
//! - **Permanent**: deleted immediately
//! - **RateLimited**: released with a longer backoff (5s-120s)

use std::time::Duration;

use thiserror::Error;

use crate::job::Resolution;
use crate::limits::EXIT_ERROR;

/// Category of job error for determining release behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure - release with exponential backoff (1s-30s)
    Transient,
    /// Unrecoverable error - delete without retry
    Permanent,
    /// Rate limit hit - longer backoff (5s-120s)
    RateLimited,
}

impl ErrorCategory {
    /// Whether a job failing with this category may be attempted again
    pub fn should_retry(&self) -> bool {
        *self != ErrorCategory::Permanent
    }

    /// Get the base delay in milliseconds for this error category
    pub fn base_delay_ms(&self) -> u64 {
        match self {
            ErrorCategory::Transient => 1000,   // 1 second
            ErrorCategory::Permanent => 0,      // No retry
            ErrorCategory::RateLimited => 5000, // 5 seconds
        }
    }

    /// Get the maximum delay in milliseconds for this error category
    pub fn max_delay_ms(&self) -> u64 {
        match self {
            ErrorCategory::Transient => 30_000,    // 30 seconds
            ErrorCategory::Permanent => 0,         // No retry
            ErrorCategory::RateLimited => 120_000, // 2 minutes
        }
    }

    /// Exponential backoff before the next attempt, `retry_count` starting at 0
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        if *self == ErrorCategory::Permanent {
            return Duration::ZERO;
        }

        let delay = self
            .base_delay_ms()
            .saturating_mul(2u64.saturating_pow(retry_count));
        Duration::from_millis(delay.min(self.max_delay_ms()))
    }
}

/// Errors raised by a [`ChannelAdapter`](crate::ChannelAdapter) or [`Connector`](crate::Connector)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The transport is unusable; the daemon must exit
    #[error("Broker transport failed: {0}")]
    Fatal(String),

    /// A recoverable broker error
    #[error("Broker error: {message}")]
    Transient {
        message: String,
        /// The underlying connection is gone; the loop stops gracefully
        connection_lost: bool,
    },

    /// An operation that needs a registered consumer was called without one
    #[error("No consumer registered on this channel: {0}")]
    NotConsuming(String),

    /// Settlement for a delivery this channel does not hold
    #[error("Unknown delivery: {0}")]
    UnknownDelivery(String),
}

impl ChannelError {
    pub fn fatal(message: impl Into<String>) -> Self {
        ChannelError::Fatal(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        ChannelError::Transient {
            message: message.into(),
            connection_lost: false,
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        ChannelError::Transient {
            message: message.into(),
            connection_lost: true,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ChannelError::Fatal(_))
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            ChannelError::Transient {
                connection_lost: true,
                ..
            }
        )
    }
}

/// Errors that end a daemon run without a [`StopReason`](crate::StopReason)
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to open channel on connection '{connection}': {source}")]
    Connect {
        connection: String,
        #[source]
        source: ChannelError,
    },

    #[error("Failed to register consumer on queue '{queue}': {source}")]
    Setup {
        queue: String,
        #[source]
        source: ChannelError,
    },

    #[error("Broker transport failed while consuming: {0}")]
    Transport(#[source] ChannelError),

    #[error("Failed to read the restart signal: {0}")]
    RestartSignal(#[source] ChannelError),
}

impl ConsumerError {
    /// Process exit status for this failure
    pub fn exit_code(&self) -> i32 {
        EXIT_ERROR
    }
}

/// Faults raised at the job-execution boundary
#[derive(Error, Debug)]
pub enum JobError {
    /// The executor failed the job
    #[error("Job failed: {message}")]
    Failed {
        message: String,
        category: ErrorCategory,
    },

    /// The job outlived its deadline
    #[error("Job exceeded its timeout of {0:?}")]
    TimedOut(Duration),

    /// The executor panicked
    #[error("Job panicked: {0}")]
    Panicked(String),

    /// Delivered again after using up its tries, typically because an earlier
    /// attempt took the worker down with it
    #[error("Job was delivered after exhausting its {0} tries")]
    TriesExhausted(u32),

    /// The payload could not be decoded
    #[error("Job payload could not be decoded: {0}")]
    Payload(#[from] serde_json::Error),

    /// A second resolution was attempted on the same handle
    #[error("Job was already resolved ({0})")]
    AlreadyResolved(Resolution),
}

impl JobError {
    /// Create a transient job error
    pub fn transient(message: impl Into<String>) -> Self {
        JobError::Failed {
            message: message.into(),
            category: ErrorCategory::Transient,
        }
    }

    /// Create a permanent job error
    pub fn permanent(message: impl Into<String>) -> Self {
        JobError::Failed {
            message: message.into(),
            category: ErrorCategory::Permanent,
        }
    }

    /// Create a rate limited job error
    pub fn rate_limited(message: impl Into<String>) -> Self {
        JobError::Failed {
            message: message.into(),
            category: ErrorCategory::RateLimited,
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            JobError::Failed { category, .. } => *category,
            JobError::TimedOut(_) => ErrorCategory::Transient,
            JobError::Panicked(_) => ErrorCategory::Transient,
            JobError::TriesExhausted(_) => ErrorCategory::Permanent,
            JobError::Payload(_) => ErrorCategory::Permanent,
            JobError::AlreadyResolved(_) => ErrorCategory::Permanent,
        }
    }
}

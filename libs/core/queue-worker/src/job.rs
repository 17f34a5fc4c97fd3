//! Job handles and the job-execution boundary

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::channel::Delivery;
use crate::error::JobError;

/// How a delivered job was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Completed; removed from the queue
    Acknowledged,
    /// Returned to the queue, visible again after `delay`
    Released { delay: Duration },
    /// Removed without completion
    Deleted,
}

impl Resolution {
    /// Whether this resolution takes the job off the queue for good
    pub fn removes_job(&self) -> bool {
        !matches!(self, Resolution::Released { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Acknowledged => "acknowledged",
            Resolution::Released { .. } => "released",
            Resolution::Deleted => "deleted",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Released { delay } if !delay.is_zero() => {
                write!(f, "released after {delay:?}")
            }
            other => f.write_str(other.as_str()),
        }
    }
}

/// Identity of a job, detached from its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub job_id: String,
    pub connection: String,
    pub queue: String,
    pub attempts: u32,
    pub reserved_at: DateTime<Utc>,
}

/// One delivered message and its acknowledgment lifecycle
///
/// A handle records exactly one [`Resolution`]. Any later attempt to resolve it
/// fails with [`JobError::AlreadyResolved`].
#[derive(Debug)]
pub struct JobHandle {
    delivery: Delivery,
    connection: String,
    queue: String,
    reserved_at: DateTime<Utc>,
    resolution: Option<Resolution>,
}

impl JobHandle {
    pub fn new(
        delivery: Delivery,
        connection: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            delivery,
            connection: connection.into(),
            queue: queue.into(),
            reserved_at: Utc::now(),
            resolution: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.delivery.job_id
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn attempts(&self) -> u32 {
        self.delivery.attempts
    }

    pub fn priority(&self) -> u8 {
        self.delivery.priority
    }

    pub fn is_redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    /// Deadline requested by the producer for this job; zero means none
    pub fn timeout(&self) -> Option<Duration> {
        self.delivery.timeout.filter(|t| !t.is_zero())
    }

    pub fn raw_body(&self) -> &str {
        &self.delivery.body
    }

    /// Decode the JSON payload
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        Ok(serde_json::from_str(&self.delivery.body)?)
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Mark the job as completed
    pub fn ack(&mut self) -> Result<(), JobError> {
        self.resolve(Resolution::Acknowledged)
    }

    /// Return the job to the queue after `delay`
    pub fn release(&mut self, delay: Duration) -> Result<(), JobError> {
        self.resolve(Resolution::Released { delay })
    }

    /// Remove the job without completing it
    pub fn delete(&mut self) -> Result<(), JobError> {
        self.resolve(Resolution::Deleted)
    }

    pub fn resolution(&self) -> Option<&Resolution> {
        self.resolution.as_ref()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.delivery.job_id.clone(),
            connection: self.connection.clone(),
            queue: self.queue.clone(),
            attempts: self.delivery.attempts,
            reserved_at: self.reserved_at,
        }
    }

    pub(crate) fn resolve(&mut self, resolution: Resolution) -> Result<(), JobError> {
        if let Some(existing) = &self.resolution {
            return Err(JobError::AlreadyResolved(existing.clone()));
        }
        self.resolution = Some(resolution);
        Ok(())
    }
}

/// Runs job payloads
///
/// An executor may resolve the handle itself; if it leaves it unresolved the
/// consumer settles it from the returned result. The token is cancelled when the
/// job's deadline fires.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &mut JobHandle, cancel: &CancellationToken)
    -> Result<(), JobError>;

    /// Executor name for logging and metrics
    fn name(&self) -> &'static str;
}

/// Receives job faults and transport errors
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &(dyn std::error::Error + 'static));
}

/// Reports errors to the tracing subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &(dyn std::error::Error + 'static)) {
        match error.source() {
            Some(source) => error!(error = %error, source = %source, "Queue worker error"),
            None => error!(error = %error, "Queue worker error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::DeliveryTag;
    use serde::Deserialize;

    fn delivery(body: &str) -> Delivery {
        Delivery {
            tag: DeliveryTag {
                source: "emails".into(),
                id: "1-0".into(),
            },
            job_id: "job-1".into(),
            body: body.into(),
            priority: 0,
            attempts: 2,
            timeout: None,
            redelivered: false,
            published_at: None,
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct SendEmail {
        to: String,
    }

    #[test]
    fn test_payload_decoding() {
        let job = JobHandle::new(delivery(r#"{"to":"a@example.com"}"#), "redis", "emails");
        let payload: SendEmail = job.payload().unwrap();
        assert_eq!(payload.to, "a@example.com");

        let broken = JobHandle::new(delivery("{"), "redis", "emails");
        assert!(matches!(
            broken.payload::<SendEmail>(),
            Err(JobError::Payload(_))
        ));
    }

    #[test]
    fn test_resolves_exactly_once() {
        let mut job = JobHandle::new(delivery("{}"), "redis", "emails");
        assert!(!job.is_resolved());

        job.ack().unwrap();
        assert_eq!(job.resolution(), Some(&Resolution::Acknowledged));

        let err = job.release(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(
            err,
            JobError::AlreadyResolved(Resolution::Acknowledged)
        ));
        assert!(job.delete().is_err());
        assert_eq!(job.resolution(), Some(&Resolution::Acknowledged));
    }

    #[test]
    fn test_summary() {
        let job = JobHandle::new(delivery("{}"), "redis", "emails");
        let summary = job.summary();
        assert_eq!(summary.job_id, "job-1");
        assert_eq!(summary.queue, "emails");
        assert_eq!(summary.connection, "redis");
        assert_eq!(summary.attempts, 2);
    }

    #[test]
    fn test_resolution_display() {
        assert_eq!(Resolution::Acknowledged.to_string(), "acknowledged");
        assert_eq!(
            Resolution::Released {
                delay: Duration::ZERO
            }
            .to_string(),
            "released"
        );
        assert!(!Resolution::Released {
            delay: Duration::ZERO
        }
        .removes_job());
        assert!(Resolution::Deleted.removes_job());
    }
}

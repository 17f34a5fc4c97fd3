use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use queue_worker::{CancellationToken, JobError, JobExecutor, JobHandle};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit status a handler uses to ask for a retry (EX_TEMPFAIL)
pub const EXIT_RETRY: i32 = 75;

/// Runs an external command per job
///
/// The payload is written to the command's stdin and the job metadata is
/// exported as `QUEUE_JOB_ID`, `QUEUE_NAME`, `QUEUE_CONNECTION` and
/// `QUEUE_JOB_ATTEMPTS`. Exit 0 acknowledges the job, [`EXIT_RETRY`] fails it
/// as transient, anything else fails it permanently.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
}

impl ProcessExecutor {
    pub fn new(command: Vec<String>) -> eyre::Result<Self> {
        let mut parts = command.into_iter();
        let program = parts
            .next()
            .ok_or_else(|| eyre::eyre!("a job command is required"))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl JobExecutor for ProcessExecutor {
    async fn execute(
        &self,
        job: &mut JobHandle,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("QUEUE_JOB_ID", job.id())
            .env("QUEUE_NAME", job.queue())
            .env("QUEUE_CONNECTION", job.connection())
            .env("QUEUE_JOB_ATTEMPTS", job.attempts().to_string())
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| JobError::transient(format!("failed to spawn '{}': {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A handler may exit without reading its input
            match stdin.write_all(job.raw_body().as_bytes()).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                Err(e) => return Err(JobError::transient(format!("failed to write payload: {e}"))),
            }
        }

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let status = match waited {
            Some(status) => status.map_err(|e| {
                JobError::transient(format!("failed to wait for '{}': {e}", self.program))
            })?,
            None => {
                warn!(job_id = %job.id(), program = %self.program, "Killing job command");
                if let Err(e) = child.kill().await {
                    warn!(job_id = %job.id(), error = %e, "Failed to kill job command");
                }
                return Err(JobError::transient("job command cancelled"));
            }
        };

        debug!(job_id = %job.id(), status = ?status.code(), "Job command exited");
        match status.code() {
            Some(0) => job.ack(),
            Some(EXIT_RETRY) => Err(JobError::transient(format!(
                "'{}' asked for a retry",
                self.program
            ))),
            Some(code) => Err(JobError::permanent(format!(
                "'{}' exited with status {code}",
                self.program
            ))),
            None => Err(JobError::transient(format!(
                "'{}' was terminated by a signal",
                self.program
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use queue_worker::{Delivery, DeliveryTag, ErrorCategory, Resolution};

    use super::*;

    fn job(body: &str) -> JobHandle {
        let delivery = Delivery {
            tag: DeliveryTag {
                source: "emails".into(),
                id: "1".into(),
            },
            job_id: "job-1".into(),
            body: body.into(),
            priority: 0,
            attempts: 2,
            timeout: None,
            redelivered: false,
            published_at: None,
        };
        JobHandle::new(delivery, "redis", "emails")
    }

    fn sh(script: &str) -> ProcessExecutor {
        ProcessExecutor::new(vec!["sh".into(), "-c".into(), script.into()]).unwrap()
    }

    #[test]
    fn test_requires_program() {
        assert!(ProcessExecutor::new(Vec::new()).is_err());
        assert_eq!(sh("true").program(), "sh");
    }

    #[tokio::test]
    async fn test_success_acknowledges() {
        let mut job = job(r#"{"to":"a@example.com"}"#);
        let executor = sh(concat!(
            "grep -q a@example.com",
            r#" && [ "$QUEUE_JOB_ID" = job-1 ]"#,
            r#" && [ "$QUEUE_JOB_ATTEMPTS" = 2 ]"#,
        ));

        executor.execute(&mut job, &CancellationToken::new()).await.unwrap();
        assert_eq!(job.resolution(), Some(&Resolution::Acknowledged));
    }

    #[tokio::test]
    async fn test_retry_status_is_transient() {
        let mut job = job("{}");
        let err = sh("exit 75")
            .execute(&mut job, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(!job.is_resolved());
    }

    #[tokio::test]
    async fn test_failure_status_is_permanent() {
        let mut job = job("{}");
        let err = sh("exit 3")
            .execute(&mut job, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert!(err.to_string().contains("status 3"));
    }

    #[tokio::test]
    async fn test_cancellation_kills_command() {
        let mut job = job("{}");
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let err = sh("sleep 30").execute(&mut job, &token).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}

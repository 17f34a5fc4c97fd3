//! Prometheus metrics for queue workers
//!
//! [`MetricsListener`] records loop and job activity through the `metrics`
//! facade. [`init_metrics`] installs the Prometheus exporter with its own HTTP
//! listener.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use once_cell::sync::OnceCell;
use tracing::info;

use crate::hooks::{JobOutcome, MemoryLimitExceeded, QueueEvent, TimeLimitExceeded, WorkerListener};
use crate::job::JobSummary;

static EXPORTER_ADDR: OnceCell<SocketAddr> = OnceCell::new();

/// Install the Prometheus exporter serving `/metrics` on `addr`
///
/// Must run inside a tokio runtime. Subsequent calls are no-ops and return the
/// address of the first installation.
pub fn init_metrics(addr: SocketAddr) -> Result<SocketAddr, BuildError> {
    EXPORTER_ADDR
        .get_or_try_init(|| {
            PrometheusBuilder::new().with_http_listener(addr).install()?;
            info!(%addr, "Prometheus metrics exporter listening");
            Ok(addr)
        })
        .copied()
}

/// Records worker activity as Prometheus metrics
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsListener;

impl WorkerListener for MetricsListener {
    fn on_memory_limit_exceeded(&self, event: &MemoryLimitExceeded) {
        counter!("queue_worker_stops_total", "reason" => event.status.as_ref().to_string())
            .increment(1);
        gauge!("queue_worker_memory_bytes").set(event.bytes_used as f64);
    }

    fn on_time_limit_exceeded(&self, event: &TimeLimitExceeded) {
        counter!("queue_worker_stops_total", "reason" => event.status.as_ref().to_string())
            .increment(1);
    }

    fn on_pushed(&self, event: &QueueEvent) {
        counter!("queue_worker_jobs_pushed_total", "queue" => event.queue.clone()).increment(1);
    }

    fn on_reserved(&self, event: &QueueEvent) {
        counter!("queue_worker_jobs_reserved_total", "queue" => event.queue.clone())
            .increment(1);
        histogram!("queue_worker_payload_bytes", "queue" => event.queue.clone())
            .record(event.payload_bytes as f64);
    }

    fn on_deleted(&self, event: &QueueEvent) {
        counter!("queue_worker_jobs_deleted_total", "queue" => event.queue.clone()).increment(1);
    }

    fn on_job_processing(&self, job: &JobSummary) {
        gauge!("queue_worker_job_attempts", "queue" => job.queue.clone())
            .set(f64::from(job.attempts));
    }

    fn on_job_processed(&self, outcome: &JobOutcome) {
        counter!(
            "queue_worker_jobs_processed_total",
            "queue" => outcome.job.queue.clone(),
            "status" => "success"
        )
        .increment(1);

        histogram!(
            "queue_worker_job_duration_seconds",
            "queue" => outcome.job.queue.clone()
        )
        .record(outcome.duration.as_secs_f64());
    }

    fn on_job_failed(&self, outcome: &JobOutcome) {
        counter!(
            "queue_worker_jobs_processed_total",
            "queue" => outcome.job.queue.clone(),
            "status" => "failed"
        )
        .increment(1);

        counter!(
            "queue_worker_job_failures_total",
            "queue" => outcome.job.queue.clone(),
            "resolution" => outcome.resolution.as_str()
        )
        .increment(1);

        histogram!(
            "queue_worker_job_duration_seconds",
            "queue" => outcome.job.queue.clone()
        )
        .record(outcome.duration.as_secs_f64());
    }
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use queue_worker::{ConsumerIdentity, PushOptions, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "queue-daemon")]
#[command(
    about = "Consume jobs from a Redis-backed queue, one at a time, within memory and time budgets"
)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Consume a queue until a limit or signal stops the worker
    Work(WorkArgs),

    /// Ask every running worker to stop after its current job
    Restart,

    /// Push a job onto a queue
    Push(PushArgs),
}

#[derive(Args, Debug, Clone)]
pub struct WorkArgs {
    /// Queue to consume
    #[arg(long, env = "QUEUE_NAME", default_value = "default")]
    pub queue: String,

    /// Connection name reported in events and logs
    #[arg(long, env = "QUEUE_CONNECTION", default_value = "redis")]
    pub connection: String,

    /// Seconds to sleep when no job was delivered
    #[arg(long, env = "WORKER_SLEEP", default_value_t = 3)]
    pub sleep: u64,

    /// Memory ceiling in megabytes (0 disables the check)
    #[arg(long, env = "WORKER_MEMORY", default_value_t = 128)]
    pub memory: u64,

    /// Seconds the worker may run (0 = unbounded)
    #[arg(long, env = "WORKER_MAX_TIME", default_value_t = 0)]
    pub max_time: u64,

    /// Jobs to process before stopping (0 = unbounded)
    #[arg(long, env = "WORKER_MAX_JOBS", default_value_t = 0)]
    pub max_jobs: u64,

    /// Stop once the queue is empty
    #[arg(long, env = "WORKER_STOP_WHEN_EMPTY")]
    pub stop_when_empty: bool,

    /// Keep working while the maintenance marker exists
    #[arg(long)]
    pub force: bool,

    /// Seconds a job may run (0 disables the deadline)
    #[arg(long, env = "WORKER_TIMEOUT", default_value_t = 60)]
    pub timeout: u64,

    /// Attempts before a failing job is dead-lettered (0 = unlimited)
    #[arg(long, env = "WORKER_TRIES", default_value_t = 1)]
    pub tries: u32,

    /// Longest single wait on the broker, in seconds
    #[arg(long, env = "WORKER_WAIT_TIMEOUT", default_value_t = 5)]
    pub wait_timeout: u64,

    /// Consumer tag (generated when omitted)
    #[arg(long, env = "WORKER_CONSUMER_TAG")]
    pub consumer_tag: Option<String>,

    /// Unacknowledged deliveries the broker may push ahead
    #[arg(long, env = "WORKER_PREFETCH_COUNT", default_value_t = 1)]
    pub prefetch_count: u16,

    /// Unacknowledged bytes the broker may push ahead (0 = unbounded)
    #[arg(long, env = "WORKER_PREFETCH_SIZE", default_value_t = 0)]
    pub prefetch_size: u32,

    /// Highest priority to consume (defaults to QUEUE_MAX_PRIORITY)
    #[arg(long)]
    pub max_priority: Option<u8>,

    /// Pause while this file exists
    #[arg(long, env = "WORKER_MAINTENANCE_FILE")]
    pub maintenance_file: Option<PathBuf>,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "WORKER_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Command run per job, receiving the payload on stdin
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

impl WorkArgs {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::new()
            .with_sleep(Duration::from_secs(self.sleep))
            .with_memory_limit_mb(self.memory)
            .with_max_time(Duration::from_secs(self.max_time))
            .with_max_jobs(self.max_jobs)
            .with_stop_when_empty(self.stop_when_empty)
            .with_force(self.force)
            .with_job_timeout(Some(Duration::from_secs(self.timeout)))
            .with_max_tries(self.tries)
            .with_wait_timeout(Duration::from_secs(self.wait_timeout.max(1)))
    }

    pub fn identity(&self, default_max_priority: u8) -> ConsumerIdentity {
        let identity = ConsumerIdentity::new()
            .with_prefetch(self.prefetch_count, self.prefetch_size)
            .with_max_priority(self.max_priority.unwrap_or(default_max_priority));

        match &self.consumer_tag {
            Some(tag) => identity.with_consumer_tag(tag.clone()),
            None => identity,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct PushArgs {
    /// Queue to push onto
    #[arg(long, env = "QUEUE_NAME", default_value = "default")]
    pub queue: String,

    /// Connection name reported in events
    #[arg(long, env = "QUEUE_CONNECTION", default_value = "redis")]
    pub connection: String,

    /// Job priority, clamped to QUEUE_MAX_PRIORITY
    #[arg(long, default_value_t = 0)]
    pub priority: u8,

    /// Seconds before the job becomes available
    #[arg(long, default_value_t = 0)]
    pub delay: u64,

    /// Per-job deadline in seconds, overriding the worker's
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Payload; read from stdin when omitted
    pub payload: Option<String>,
}

impl PushArgs {
    pub fn push_options(&self) -> PushOptions {
        let options = PushOptions::default()
            .with_priority(self.priority)
            .with_delay(Duration::from_secs(self.delay));

        match self.timeout {
            Some(seconds) => options.with_timeout(Duration::from_secs(seconds)),
            None => options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work(args: &[&str]) -> WorkArgs {
        let argv = ["queue-daemon", "work"].iter().chain(args.iter()).copied();
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Work(args) => args,
            other => panic!("expected work, got {other:?}"),
        }
    }

    const WORKER_VARS: [&str; 6] = [
        "QUEUE_NAME",
        "WORKER_SLEEP",
        "WORKER_MEMORY",
        "WORKER_MAX_JOBS",
        "WORKER_TIMEOUT",
        "WORKER_CONSUMER_TAG",
    ];

    #[test]
    fn test_work_defaults() {
        temp_env::with_vars_unset(WORKER_VARS, || {
            let args = work(&["--", "handler"]);
            assert_eq!(args.queue, "default");
            assert_eq!(args.command, vec!["handler"]);

            let config = args.worker_config();
            assert_eq!(config.sleep, Duration::from_secs(3));
            assert_eq!(config.memory_limit_bytes, 128 * 1024 * 1024);
            assert_eq!(config.max_jobs, None);
            assert_eq!(config.max_time, None);
            assert_eq!(config.job_timeout, Some(Duration::from_secs(60)));
            assert_eq!(config.max_tries, 1);
        });
    }

    #[test]
    fn test_work_flags() {
        temp_env::with_vars_unset(WORKER_VARS, || {
            let args = work(&[
                "--queue",
                "emails",
                "--max-jobs",
                "500",
                "--max-time",
                "3600",
                "--memory",
                "256",
                "--timeout",
                "0",
                "--stop-when-empty",
                "--",
                "php",
                "artisan",
                "handle",
            ]);
            assert_eq!(args.queue, "emails");
            assert_eq!(args.command, vec!["php", "artisan", "handle"]);

            let config = args.worker_config();
            assert_eq!(config.max_jobs, Some(500));
            assert_eq!(config.max_time, Some(Duration::from_secs(3600)));
            assert_eq!(config.memory_limit_bytes, 256 * 1024 * 1024);
            assert_eq!(config.job_timeout, None);
            assert!(config.stop_when_empty);
        });
    }

    #[test]
    fn test_work_reads_environment() {
        temp_env::with_vars(
            [
                ("QUEUE_NAME", Some("billing")),
                ("WORKER_MAX_JOBS", Some("10")),
                ("WORKER_CONSUMER_TAG", Some("worker-billing-1")),
            ],
            || {
                let args = work(&["--", "handler"]);
                assert_eq!(args.queue, "billing");
                assert_eq!(args.worker_config().max_jobs, Some(10));
                assert_eq!(args.identity(0).consumer_tag, "worker-billing-1");
            },
        );
    }

    #[test]
    fn test_work_requires_command() {
        temp_env::with_vars_unset(WORKER_VARS, || {
            assert!(Cli::try_parse_from(["queue-daemon", "work"]).is_err());
        });
    }

    #[test]
    fn test_identity_priority_fallback() {
        temp_env::with_vars_unset(WORKER_VARS, || {
            let args = work(&["--prefetch-count", "4", "--", "handler"]);
            let identity = args.identity(5);
            assert_eq!(identity.max_priority, 5);
            assert_eq!(identity.prefetch_count, 4);
            assert!(identity.consumer_tag.starts_with("worker-"));

            let args = work(&["--max-priority", "2", "--", "handler"]);
            assert_eq!(args.identity(5).max_priority, 2);
        });
    }

    #[test]
    fn test_push_options() {
        temp_env::with_var_unset("QUEUE_NAME", || {
            let cli = Cli::try_parse_from([
                "queue-daemon",
                "push",
                "--priority",
                "3",
                "--delay",
                "30",
                "--timeout",
                "10",
                r#"{"to":"a@example.com"}"#,
            ])
            .unwrap();
            let Command::Push(args) = cli.command else {
                panic!("expected push");
            };
            assert_eq!(args.payload.as_deref(), Some(r#"{"to":"a@example.com"}"#));

            let options = args.push_options();
            assert_eq!(options.priority, 3);
            assert_eq!(options.delay, Some(Duration::from_secs(30)));
            assert_eq!(options.timeout, Some(Duration::from_secs(10)));
        });
    }
}

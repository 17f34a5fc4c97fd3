//! Queue Daemon
//!
//! Runs one queue consumer per process and hands each job to an external
//! command.
//!
//! ## Architecture
//!
//! ```text
//! Redis Streams ({prefix}:{queue}, {prefix}:{queue}:p{n})
//!   ↓ (Consumer Group: queue_workers, prefetch 1)
//! Consumer<RedisConnector, ProcessExecutor>
//!   ↓ (payload on stdin, exit status decides ack/retry/dead-letter)
//! Job command
//! ```
//!
//! ## Commands
//!
//! - `work`: consume until a budget, signal or restart broadcast stops the worker
//! - `restart`: broadcast a restart to every running worker
//! - `push`: enqueue a job
//!
//! ## Signals
//!
//! - `SIGTERM`, `SIGINT`, `SIGQUIT`: finish the current job, then exit
//! - `SIGUSR2`: pause, `SIGUSR1`: resume

pub mod cli;
pub mod executor;

use std::sync::Arc;

use clap::Parser;
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use queue_worker::redis::{RedisConnector, RedisProducer, RedisRestartSignal, RedisSettings};
use queue_worker::{
    exit_code, init_metrics, Consumer, FileMaintenanceProbe, Hooks, InstrumentedProducer,
    MetricsListener, ProcessTerminator, Producer, SignalGovernor, TracingListener, EXIT_SUCCESS,
};
use tokio::io::AsyncReadExt;
use tracing::{error, info};

use cli::{Cli, Command, PushArgs, WorkArgs};
use executor::ProcessExecutor;

/// Run the daemon and return its process exit status
///
/// # Errors
///
/// Returns an error if configuration is invalid or Redis cannot be reached
/// before the worker starts. Failures inside the consume loop are reported
/// through the exit status instead.
pub async fn run() -> Result<i32> {
    install_color_eyre();
    let cli = Cli::parse();

    let environment = Environment::from_env();
    init_tracing(&environment);

    let settings = RedisSettings::from_env().wrap_err("Failed to load Redis configuration")?;

    match cli.command {
        Command::Work(args) => work(args, settings).await,
        Command::Restart => restart(settings).await,
        Command::Push(args) => push(args, settings).await,
    }
}

async fn work(args: WorkArgs, settings: RedisSettings) -> Result<i32> {
    if let Some(addr) = args.metrics_addr {
        init_metrics(addr).wrap_err_with(|| format!("Failed to start metrics exporter on {addr}"))?;
    }

    let restart = RedisRestartSignal::connect(&settings)
        .await
        .wrap_err("Failed to connect to Redis")?;
    let identity = args.identity(settings.max_priority);
    let connector = RedisConnector::new(settings).wrap_err("Invalid Redis configuration")?;

    let mut governor = SignalGovernor::new(Arc::new(ProcessTerminator));
    if let Some(marker) = &args.maintenance_file {
        governor = governor.with_maintenance(FileMaintenanceProbe::new(marker));
    }
    governor
        .install()
        .wrap_err("Failed to install signal handlers")?;

    let executor = ProcessExecutor::new(args.command.clone())?;
    let config = args.worker_config();
    info!(
        queue = %args.queue,
        program = executor.program(),
        max_jobs = ?config.max_jobs,
        max_time = ?config.max_time,
        memory_limit_bytes = config.memory_limit_bytes,
        "Worker configuration loaded"
    );

    let consumer = Consumer::new(connector, executor, identity)
        .with_governor(governor)
        .with_hooks(
            Hooks::new()
                .with_listener(TracingListener)
                .with_listener(MetricsListener),
        )
        .with_restart_signal(Arc::new(restart));

    let result = consumer.daemon(&args.connection, &args.queue, &config).await;
    match &result {
        Ok(reason) => info!(reason = %reason, "Worker exiting"),
        Err(e) => error!(error = %e, "Worker failed"),
    }
    Ok(exit_code(&result))
}

async fn restart(settings: RedisSettings) -> Result<i32> {
    let signal = RedisRestartSignal::connect(&settings)
        .await
        .wrap_err("Failed to connect to Redis")?;
    let stamp = signal
        .broadcast()
        .await
        .wrap_err("Failed to broadcast restart")?;

    info!(stamp, "Workers will restart after their current job");
    Ok(EXIT_SUCCESS)
}

async fn push(args: PushArgs, settings: RedisSettings) -> Result<i32> {
    let payload = match &args.payload {
        Some(payload) => payload.clone(),
        None => {
            let mut payload = String::new();
            tokio::io::stdin()
                .read_to_string(&mut payload)
                .await
                .wrap_err("Failed to read payload from stdin")?;
            payload
        }
    };

    let producer = RedisProducer::connect(settings, &args.connection)
        .await
        .wrap_err("Failed to connect to Redis")?;
    let producer = InstrumentedProducer::new(producer, Hooks::new().with_listener(TracingListener));

    let job_id = producer
        .push(&args.queue, &payload, args.push_options())
        .await
        .wrap_err_with(|| format!("Failed to push job onto '{}'", args.queue))?;

    println!("{job_id}");
    Ok(EXIT_SUCCESS)
}

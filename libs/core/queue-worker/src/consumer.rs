//! Consumer daemon loop
//!
//! [`Consumer::daemon`] registers a single consumer on one queue and processes
//! deliveries one at a time until a stop condition fires.
//!
//! ```text
//! open channel -> set_qos -> consume
//!   loop:
//!     paused?       sleep, check shutdown/memory/restart
//!     wait_once     -> reserve -> arm deadline -> execute -> settle
//!     empty?        sleep
//!     limits        -> hooks -> cancel consumer (drain) -> close
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{ChannelAdapter, Connector, Delivery};
use crate::config::{ConsumerIdentity, WorkerConfig};
use crate::error::{ChannelError, ConsumerError, JobError};
use crate::hooks::{Hooks, JobOutcome, MemoryLimitExceeded, QueueEvent, TimeLimitExceeded};
use crate::job::{ErrorReporter, JobExecutor, JobHandle, Resolution, TracingReporter};
use crate::limits::{
    LimitDiagnostic, LimitEvaluator, MemoryProbe, Observations, ProcessMemory, RunState,
    StopDecision, StopReason,
};
use crate::signals::{
    DeadlineGuard, NoRestartSignal, ProcessTerminator, RestartSignal, SignalGovernor,
};

/// One daemon run: the channel and the state it owns
struct Session<'a, Ch> {
    channel: Ch,
    state: RunState,
    connection: &'a str,
    queue: &'a str,
}

/// Queue consumer daemon
///
/// # Example
///
/// ```rust,ignore
/// let consumer = Consumer::new(RedisConnector::new(settings)?, executor, ConsumerIdentity::new())
///     .with_governor(governor)
///     .with_hooks(Hooks::new().with_listener(MetricsListener));
///
/// let reason = consumer.daemon("redis", "emails", &WorkerConfig::new().with_max_jobs(500)).await?;
/// std::process::exit(reason.exit_code());
/// ```
pub struct Consumer<C, E> {
    connector: C,
    executor: E,
    identity: ConsumerIdentity,
    governor: SignalGovernor,
    hooks: Hooks,
    memory: Arc<dyn MemoryProbe>,
    restart: Arc<dyn RestartSignal>,
    reporter: Arc<dyn ErrorReporter>,
}

impl<C, E> Consumer<C, E>
where
    C: Connector,
    E: JobExecutor,
{
    pub fn new(connector: C, executor: E, identity: ConsumerIdentity) -> Self {
        Self {
            connector,
            executor,
            identity,
            governor: SignalGovernor::new(Arc::new(ProcessTerminator)),
            hooks: Hooks::new(),
            memory: Arc::new(ProcessMemory),
            restart: Arc::new(NoRestartSignal),
            reporter: Arc::new(TracingReporter),
        }
    }

    pub fn with_governor(mut self, governor: SignalGovernor) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory = probe;
        self
    }

    pub fn with_restart_signal(mut self, restart: Arc<dyn RestartSignal>) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn identity(&self) -> &ConsumerIdentity {
        &self.identity
    }

    pub fn governor(&self) -> &SignalGovernor {
        &self.governor
    }

    /// Consume `queue` on `connection` until a stop condition fires
    pub async fn daemon(
        &self,
        connection: &str,
        queue: &str,
        config: &WorkerConfig,
    ) -> Result<StopReason, ConsumerError> {
        info!(
            connection,
            queue,
            consumer_tag = %self.identity.consumer_tag,
            executor = self.executor.name(),
            async_signals = self.governor.supports_async_signals(),
            "Starting queue consumer"
        );

        let last_restart = self
            .restart
            .last_restart()
            .await
            .map_err(ConsumerError::RestartSignal)?;
        let channel = self
            .connector
            .open_channel(connection)
            .await
            .map_err(|source| ConsumerError::Connect {
                connection: connection.to_string(),
                source,
            })?;

        let mut session = Session {
            channel,
            state: RunState::new(last_restart),
            connection,
            queue,
        };
        self.subscribe(&mut session).await?;

        let evaluator = LimitEvaluator::new(config);
        loop {
            if !session.channel.is_active() {
                info!(queue, "Broker stopped delivering to this consumer");
                return Ok(self.stop(&mut session, StopReason::Success).await);
            }

            if self.governor.should_pause(config.force) {
                debug!(queue, "Worker paused");
                tokio::time::sleep(config.pause_interval).await;

                let observed = self.observe(&session.state).await;
                if let Some(decision) = evaluator.evaluate_paused(&session.state, &observed) {
                    return Ok(self.conclude(&mut session, decision).await);
                }
                continue;
            }

            match session.channel.wait_once(config.wait_timeout).await {
                Ok(Some(delivery)) => {
                    if let Err(error) = self.process(&mut session, delivery, config).await {
                        self.transport_error(&mut session, error).await?;
                    }
                }
                Ok(None) => {}
                Err(error) => self.transport_error(&mut session, error).await?,
            }

            if session.state.current_job.is_none() && !config.sleep.is_zero() {
                tokio::time::sleep(config.sleep).await;
            }

            let observed = self.observe(&session.state).await;
            if let Some(decision) = evaluator.evaluate(&session.state, &observed) {
                return Ok(self.conclude(&mut session, decision).await);
            }

            session.state.end_iteration();
        }
    }

    async fn subscribe(&self, session: &mut Session<'_, C::Channel>) -> Result<(), ConsumerError> {
        let setup = |source: ChannelError| ConsumerError::Setup {
            queue: session.queue.to_string(),
            source,
        };

        session
            .channel
            .set_qos(self.identity.prefetch_size, self.identity.prefetch_count)
            .await
            .map_err(setup)?;
        session
            .channel
            .consume(
                session.queue,
                &self.identity.consumer_tag,
                self.identity.priority_argument(),
            )
            .await
            .map_err(setup)?;

        info!(
            queue = session.queue,
            consumer_tag = %self.identity.consumer_tag,
            prefetch_count = self.identity.prefetch_count,
            max_priority = self.identity.max_priority,
            "Consumer registered"
        );
        Ok(())
    }

    async fn observe(&self, state: &RunState) -> Observations {
        // An unreadable broadcast leaves the startup value in place
        let latest_restart_signal = match self.restart.last_restart().await {
            Ok(stamp) => stamp,
            Err(error) => {
                self.reporter.report(&error);
                state.last_restart_signal
            }
        };

        Observations {
            now: Instant::now(),
            memory_bytes: self.memory.bytes_used(),
            shutdown_requested: self.governor.shutdown_requested(),
            latest_restart_signal,
        }
    }

    /// Report a broker error; fatal errors end the run
    async fn transport_error(
        &self,
        session: &mut Session<'_, C::Channel>,
        error: ChannelError,
    ) -> Result<(), ConsumerError> {
        self.reporter.report(&error);

        if error.is_fatal() {
            self.cancel(session).await;
            return Err(ConsumerError::Transport(error));
        }
        if error.is_connection_lost() {
            warn!(queue = session.queue, "Broker connection lost, stopping after this iteration");
            session.state.connection_lost = true;
        }
        Ok(())
    }

    /// Emit limit instrumentation, then stop
    async fn conclude(
        &self,
        session: &mut Session<'_, C::Channel>,
        decision: StopDecision,
    ) -> StopReason {
        let reason = decision.reason;
        match decision.diagnostic {
            Some(diagnostic @ LimitDiagnostic::Memory { used_bytes, .. }) => {
                self.hooks.memory_limit_exceeded(&MemoryLimitExceeded {
                    status: reason,
                    exit_code: reason.exit_code(),
                    diagnostic,
                    job: session.state.current_job.clone(),
                    bytes_used: used_bytes,
                });
            }
            Some(diagnostic @ LimitDiagnostic::Time { elapsed, .. }) => {
                self.hooks.time_limit_exceeded(&TimeLimitExceeded {
                    status: reason,
                    exit_code: reason.exit_code(),
                    diagnostic,
                    job: session.state.current_job.clone(),
                    elapsed_seconds: elapsed.as_secs_f64(),
                });
            }
            None => {}
        }
        self.stop(session, reason).await
    }

    /// Cancel the consumer with drain and close the channel; idempotent
    async fn stop(&self, session: &mut Session<'_, C::Channel>, reason: StopReason) -> StopReason {
        if self.cancel(session).await {
            info!(
                queue = session.queue,
                reason = %reason,
                exit_code = reason.exit_code(),
                jobs_processed = session.state.jobs_processed,
                "Queue consumer stopped"
            );
        }
        reason
    }

    /// Returns false when the consumer was already cancelled
    async fn cancel(&self, session: &mut Session<'_, C::Channel>) -> bool {
        if session.state.consumer_cancelled {
            return false;
        }
        session.state.consumer_cancelled = true;

        if let Err(error) = session
            .channel
            .cancel_consumer(&self.identity.consumer_tag, true)
            .await
        {
            self.reporter.report(&error);
        }
        if let Err(error) = session.channel.close().await {
            self.reporter.report(&error);
        }
        true
    }

    async fn process(
        &self,
        session: &mut Session<'_, C::Channel>,
        delivery: Delivery,
        config: &WorkerConfig,
    ) -> Result<(), ChannelError> {
        let mut job = JobHandle::new(delivery, session.connection, session.queue);
        let summary = job.summary();

        session.state.begin_job(summary.clone());
        self.hooks.reserved(&QueueEvent::for_job(&job));

        let exhausted = config.max_tries > 0 && job.attempts() > config.max_tries;
        let timeout = job.timeout().or(config.job_timeout);
        let deadline = timeout
            .filter(|_| !exhausted)
            .map(|timeout| self.governor.arm_deadline(job.id(), timeout));
        session.state.count_job();

        debug!(
            job_id = %summary.job_id,
            queue = %summary.queue,
            attempts = summary.attempts,
            "Processing job"
        );
        self.hooks.job_processing(&summary);

        let started = Instant::now();
        let result = if exhausted {
            warn!(
                job_id = %summary.job_id,
                attempts = summary.attempts,
                max_tries = config.max_tries,
                "Job delivered after exhausting its tries, not running it"
            );
            Err(JobError::TriesExhausted(config.max_tries))
        } else {
            self.execute(&mut job, deadline.as_ref(), timeout).await
        };
        if let Some(guard) = deadline {
            guard.disarm();
        }
        let duration = started.elapsed();

        if let Err(error) = &result {
            self.reporter.report(error);
        }
        let resolution = self.resolve(&mut job, &result, config);
        session.channel.settle(job.delivery(), &resolution).await?;

        let outcome = JobOutcome {
            job: summary,
            duration,
            resolution: resolution.clone(),
            error: result.as_ref().err().map(ToString::to_string),
        };
        match &result {
            Ok(()) => self.hooks.job_processed(&outcome),
            Err(_) => self.hooks.job_failed(&outcome),
        }
        if resolution.removes_job() {
            self.hooks.deleted(&QueueEvent::for_job(&job));
        }
        Ok(())
    }

    /// Run the executor, turning panics and fired deadlines into job errors
    async fn execute(
        &self,
        job: &mut JobHandle,
        deadline: Option<&DeadlineGuard>,
        timeout: Option<Duration>,
    ) -> Result<(), JobError> {
        let token = deadline
            .map(|guard| guard.token().clone())
            .unwrap_or_else(CancellationToken::new);
        let run = AssertUnwindSafe(self.executor.execute(job, &token)).catch_unwind();

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(JobError::TimedOut(timeout.unwrap_or_default())),
            outcome = run => outcome.unwrap_or_else(|panic| {
                Err(JobError::Panicked(panic_message(panic.as_ref())))
            }),
        }
    }

    /// The executor's own resolution, or the failure path's
    fn resolve(
        &self,
        job: &mut JobHandle,
        result: &Result<(), JobError>,
        config: &WorkerConfig,
    ) -> Resolution {
        if let Some(resolution) = job.resolution() {
            return resolution.clone();
        }

        let resolution = match result {
            Ok(()) => Resolution::Acknowledged,
            Err(error) if !error.category().should_retry() => Resolution::Deleted,
            Err(_) if config.max_tries > 0 && job.attempts() >= config.max_tries => {
                warn!(job_id = %job.id(), attempts = job.attempts(), "Job exhausted its tries");
                Resolution::Deleted
            }
            Err(error) => Resolution::Released {
                delay: error
                    .category()
                    .backoff_delay(job.attempts().saturating_sub(1)),
            },
        };

        if let Err(error) = job.resolve(resolution.clone()) {
            self.reporter.report(&error);
        }
        resolution
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

//! Process-level interrupts and per-job deadlines
//!
//! [`SignalGovernor`] turns OS signals into flags the consumer loop polls:
//!
//! | Signal                    | Effect                       |
//! |---------------------------|------------------------------|
//! | SIGTERM, SIGINT, SIGQUIT  | finish current job, then stop|
//! | SIGUSR2                   | pause consuming              |
//! | SIGUSR1                   | resume consuming             |
//!
//! Per-job deadlines are enforced by a dedicated watchdog thread, so a job that
//! blocks the runtime thread still gets terminated. A fired deadline cancels the
//! job's token first. The [`Terminator`] runs once the job has been torn down and
//! its guard disarmed, or after the kill grace if the job never yields.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ChannelError;
use crate::limits::EXIT_ERROR;

/// Time a cancelled job gets to release its resources before the worker is terminated
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(3);

/// Reports whether the application is down for maintenance
pub trait MaintenanceProbe: Send + Sync {
    fn is_down(&self) -> bool;
}

/// Never in maintenance
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverDown;

impl MaintenanceProbe for NeverDown {
    fn is_down(&self) -> bool {
        false
    }
}

/// Maintenance while a marker file exists
#[derive(Debug, Clone)]
pub struct FileMaintenanceProbe {
    marker: PathBuf,
}

impl FileMaintenanceProbe {
    pub fn new(marker: impl Into<PathBuf>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

impl MaintenanceProbe for FileMaintenanceProbe {
    fn is_down(&self) -> bool {
        self.marker.exists()
    }
}

/// Source of the restart broadcast
///
/// The value is an opaque timestamp. A run stops with `RestartRequested` once it
/// observes a value different from the one it started with.
#[async_trait]
pub trait RestartSignal: Send + Sync {
    async fn last_restart(&self) -> Result<Option<i64>, ChannelError>;
}

/// No restart broadcast
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRestartSignal;

#[async_trait]
impl RestartSignal for NoRestartSignal {
    async fn last_restart(&self) -> Result<Option<i64>, ChannelError> {
        Ok(None)
    }
}

/// In-process restart broadcast
#[derive(Debug, Clone, Default)]
pub struct RestartFlag {
    latest: Arc<AtomicI64>,
}

impl RestartFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broadcast a restart newer than any seen so far
    pub fn request_restart(&self) {
        let stamp = chrono::Utc::now().timestamp_millis();
        self.latest.fetch_max(stamp, Ordering::SeqCst);
        self.latest.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RestartSignal for RestartFlag {
    async fn last_restart(&self) -> Result<Option<i64>, ChannelError> {
        Ok(match self.latest.load(Ordering::SeqCst) {
            0 => None,
            stamp => Some(stamp),
        })
    }
}

/// A job deadline that fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredDeadline {
    pub job_id: String,
    pub timeout: Duration,
}

/// Invoked on the watchdog thread when a job deadline fires
pub trait Terminator: Send + Sync {
    fn terminate(&self, expired: &ExpiredDeadline);
}

/// Exits the process with status 1
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn terminate(&self, expired: &ExpiredDeadline) {
        error!(
            job_id = %expired.job_id,
            timeout_secs = expired.timeout.as_secs_f64(),
            "Job exceeded its deadline, terminating worker process"
        );
        std::process::exit(EXIT_ERROR);
    }
}

#[derive(Debug, Default)]
struct Flags {
    shutdown: AtomicBool,
    paused: AtomicBool,
}

/// Shutdown, pause and maintenance state plus per-job deadlines
///
/// Cloning shares the same flags and watchdog.
#[derive(Clone)]
pub struct SignalGovernor {
    flags: Arc<Flags>,
    maintenance: Arc<dyn MaintenanceProbe>,
    watchdog: Option<Arc<Watchdog>>,
}

impl SignalGovernor {
    /// Governor with async signal support; fired deadlines go to `terminator`
    pub fn new(terminator: Arc<dyn Terminator>) -> Self {
        Self::new_with_kill_grace(terminator, DEFAULT_KILL_GRACE)
    }

    /// Like [`SignalGovernor::new`], with a custom kill grace
    pub fn new_with_kill_grace(terminator: Arc<dyn Terminator>, grace: Duration) -> Self {
        Self {
            flags: Arc::new(Flags::default()),
            maintenance: Arc::new(NeverDown),
            watchdog: Some(Arc::new(Watchdog::new(terminator, grace))),
        }
    }

    /// Governor for hosts without async signal support
    ///
    /// Deadlines are not enforced and OS signals are not observed; shutdown and
    /// pause can still be driven programmatically.
    pub fn without_async_signals() -> Self {
        Self {
            flags: Arc::new(Flags::default()),
            maintenance: Arc::new(NeverDown),
            watchdog: None,
        }
    }

    pub fn with_maintenance(mut self, probe: impl MaintenanceProbe + 'static) -> Self {
        self.maintenance = Arc::new(probe);
        self
    }

    pub fn supports_async_signals(&self) -> bool {
        self.watchdog.is_some()
    }

    /// Install OS signal listeners on the current tokio runtime
    ///
    /// A no-op without async signal support.
    pub fn install(&self) -> std::io::Result<()> {
        if !self.supports_async_signals() {
            debug!("Async signals unsupported, skipping signal handler installation");
            return Ok(());
        }
        self.install_listeners()
    }

    #[cfg(unix)]
    fn install_listeners(&self) -> std::io::Result<()> {
        use tokio::signal::unix::SignalKind;

        for (kind, name) in [
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::interrupt(), "SIGINT"),
            (SignalKind::quit(), "SIGQUIT"),
        ] {
            listen(kind, name, Arc::clone(&self.flags), |flags| {
                flags.shutdown.store(true, Ordering::SeqCst);
                info!("Shutdown requested, finishing current job before stopping");
            })?;
        }

        listen(
            SignalKind::user_defined2(),
            "SIGUSR2",
            Arc::clone(&self.flags),
            |flags| {
                flags.paused.store(true, Ordering::SeqCst);
                info!("Worker paused");
            },
        )?;

        listen(
            SignalKind::user_defined1(),
            "SIGUSR1",
            Arc::clone(&self.flags),
            |flags| {
                flags.paused.store(false, Ordering::SeqCst);
                info!("Worker resumed");
            },
        )?;

        info!("Signal handlers installed");
        Ok(())
    }

    #[cfg(not(unix))]
    fn install_listeners(&self) -> std::io::Result<()> {
        let flags = Arc::clone(&self.flags);
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                flags.shutdown.store(true, Ordering::SeqCst);
                info!("Shutdown requested, finishing current job before stopping");
            }
        });
        Ok(())
    }

    /// Whether a shutdown was requested; never cleared once set
    pub fn shutdown_requested(&self) -> bool {
        self.flags.shutdown.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.flags.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.flags.paused.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.flags.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.flags.paused.store(false, Ordering::SeqCst);
    }

    /// Maintenance mode holds the worker unless `force` is set
    pub fn is_maintenance_paused(&self, force: bool) -> bool {
        !force && self.maintenance.is_down()
    }

    /// Whether the loop should skip consuming this iteration
    pub fn should_pause(&self, force: bool) -> bool {
        self.is_paused() || self.is_maintenance_paused(force)
    }

    /// Arm a deadline for `job_id`
    ///
    /// When it fires, the guard's token is cancelled and the terminator is called
    /// on disarm, or once the kill grace has passed. Without async signal support
    /// the deadline is not enforced.
    pub fn arm_deadline(&self, job_id: &str, timeout: Duration) -> DeadlineGuard {
        let token = CancellationToken::new();
        let armed = match &self.watchdog {
            Some(watchdog) => {
                let generation = watchdog.arm(job_id, timeout, token.clone());
                Some((Arc::clone(watchdog), generation))
            }
            None => {
                debug!(job_id, "Async signals unsupported, job deadline not enforced");
                None
            }
        };
        DeadlineGuard { token, armed }
    }
}

impl std::fmt::Debug for SignalGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalGovernor")
            .field("shutdown", &self.shutdown_requested())
            .field("paused", &self.is_paused())
            .field("async_signals", &self.supports_async_signals())
            .finish()
    }
}

#[cfg(unix)]
fn listen(
    kind: tokio::signal::unix::SignalKind,
    name: &'static str,
    flags: Arc<Flags>,
    on_signal: fn(&Flags),
) -> std::io::Result<()> {
    let mut stream = tokio::signal::unix::signal(kind)?;
    tokio::spawn(async move {
        while stream.recv().await.is_some() {
            debug!(signal = name, "Received signal");
            on_signal(&flags);
        }
    });
    Ok(())
}

/// An armed job deadline; disarmed on drop
pub struct DeadlineGuard {
    token: CancellationToken,
    armed: Option<(Arc<Watchdog>, u64)>,
}

impl DeadlineGuard {
    /// Cancelled when the deadline fires
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_enforced(&self) -> bool {
        self.armed.is_some()
    }

    /// Calls the terminator if the deadline already fired
    pub fn disarm(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some((watchdog, generation)) = self.armed.take() {
            watchdog.disarm(generation);
        }
    }
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.release();
    }
}

struct Armed {
    generation: u64,
    job_id: String,
    timeout: Duration,
    deadline: Instant,
    token: CancellationToken,
    fired: bool,
}

impl Armed {
    fn expired(&self) -> ExpiredDeadline {
        ExpiredDeadline {
            job_id: self.job_id.clone(),
            timeout: self.timeout,
        }
    }
}

#[derive(Default)]
struct WatchState {
    armed: Option<Armed>,
    next_generation: u64,
    stopped: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<WatchState>,
    wake: Condvar,
}

/// Single-deadline watchdog running on its own OS thread
struct Watchdog {
    shared: Arc<Shared>,
    terminator: Arc<dyn Terminator>,
    grace: Duration,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    fn new(terminator: Arc<dyn Terminator>, grace: Duration) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            terminator,
            grace,
            thread: Mutex::new(None),
        }
    }

    fn arm(&self, job_id: &str, timeout: Duration, token: CancellationToken) -> u64 {
        self.ensure_thread();

        let mut state = lock(&self.shared.state);
        state.next_generation += 1;
        let generation = state.next_generation;
        state.armed = Some(Armed {
            generation,
            job_id: job_id.to_string(),
            timeout,
            deadline: Instant::now() + timeout,
            token,
            fired: false,
        });
        self.shared.wake.notify_all();
        generation
    }

    /// Clear the slot; a deadline that already fired terminates here
    fn disarm(&self, generation: u64) {
        let mut state = lock(&self.shared.state);
        if !state
            .armed
            .as_ref()
            .is_some_and(|armed| armed.generation == generation)
        {
            return;
        }

        let released = state.armed.take();
        self.shared.wake.notify_all();
        drop(state);

        if let Some(armed) = released.filter(|armed| armed.fired) {
            self.terminator.terminate(&armed.expired());
        }
    }

    fn ensure_thread(&self) {
        let mut slot = lock(&self.thread);
        if slot.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let terminator = Arc::clone(&self.terminator);
        let grace = self.grace;
        match std::thread::Builder::new()
            .name("job-watchdog".into())
            .spawn(move || watch(&shared, terminator.as_ref(), grace))
        {
            Ok(handle) => *slot = Some(handle),
            Err(e) => warn!(error = %e, "Failed to start job watchdog, deadlines not enforced"),
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        lock(&self.shared.state).stopped = true;
        self.shared.wake.notify_all();
        if let Some(handle) = lock(&self.thread).take() {
            let _ = handle.join();
        }
    }
}

fn watch(shared: &Shared, terminator: &dyn Terminator, grace: Duration) {
    let mut state = lock(&shared.state);
    loop {
        if state.stopped {
            return;
        }

        let now = Instant::now();
        let next = state.armed.as_ref().map(|armed| (armed.deadline, armed.fired));
        state = match next {
            None => shared
                .wake
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner),
            Some((deadline, _)) if now < deadline => {
                shared
                    .wake
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            // Grace elapsed without a disarm: the job never yielded
            Some((_, true)) => {
                let expired = state.armed.take();
                drop(state);
                if let Some(armed) = expired {
                    terminator.terminate(&armed.expired());
                }
                lock(&shared.state)
            }
            Some((_, false)) => {
                let token = match state.armed.as_mut() {
                    Some(armed) => {
                        armed.fired = true;
                        armed.deadline = now + grace;
                        warn!(
                            job_id = %armed.job_id,
                            timeout_secs = armed.timeout.as_secs_f64(),
                            "Job deadline fired, cancelling job"
                        );
                        Some(armed.token.clone())
                    }
                    None => None,
                };
                drop(state);
                if let Some(token) = token {
                    token.cancel();
                }
                lock(&shared.state)
            }
        };
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

//! The supervisor state machine.
//!
//! ```text
//! idle ──▶ starting ──▶ running ──▶ stopping ──▶ stopped
//!   ▲          │            │                       │
//!   │          └────────────┴──▶ failed             │
//!   └──────── start again from stopped or failed ───┘
//! ```
//!
//! Every state change goes through a compare-and-set on the state channel,
//! so `start`, `stop` and the exit watcher can race without double
//! reporting: whichever wins a transition queues the matching report.
//! Reports are delivered in order by a background task and never hold up
//! signals or spawning.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use arena_core::{HealthKind, HeartbeatReport, StatusReport};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::error::{SupervisorError, SupervisorResult};
use crate::health::{self, HealthTracker, ProbeResult};
use crate::heartbeat::{CpuSampler, resident_memory_mb};
use crate::process::{ExitInfo, ManagedProcess, ProcessState};
use crate::reporter::Reporter;

/// Upper bound on delivering one status report, retries included.
pub const REPORT_DEADLINE: Duration = Duration::from_secs(10);

/// Invoked once each time the running process turns unhealthy.
pub type UnhealthyCallback = Arc<dyn Fn(String) -> BoxFuture + Send + Sync>;

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// JSON body of the `/status` endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusSnapshot {
    pub status: String,
    pub pid: Option<u32>,
    pub uptime_secs: u64,
    pub healthy: bool,
}

/// How [`Supervisor::start_or_interrupt`] ended.
#[derive(Debug)]
pub enum StartOutcome {
    Started,
    Failed(SupervisorError),
    /// The interrupt won; the process was stopped gracefully.
    Interrupted,
}

enum ReportJob {
    Status(StatusReport),
    Flush(oneshot::Sender<()>),
}

pub struct Supervisor {
    config: SupervisorConfig,
    reporter: Arc<dyn Reporter>,
    reports: mpsc::UnboundedSender<ReportJob>,
    state: watch::Sender<ProcessState>,
    process: Mutex<Option<Arc<ManagedProcess>>>,
    started_at: Mutex<Option<Instant>>,
    healthy: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Supervisor {
    /// Must be called inside a Tokio runtime; the report delivery task is
    /// spawned here.
    pub fn new(config: SupervisorConfig, reporter: Arc<dyn Reporter>) -> Arc<Self> {
        let (state, _) = watch::channel(ProcessState::Idle);
        let (reports, queue) = mpsc::unbounded_channel();
        tokio::spawn(deliver_reports(Arc::clone(&reporter), queue));
        Arc::new(Self {
            config,
            reporter,
            reports,
            state,
            process: Mutex::new(None),
            started_at: Mutex::new(None),
            healthy: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    fn process(&self) -> Option<Arc<ManagedProcess>> {
        lock(&self.process).clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process().map(|p| p.pid())
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Running and passing health checks.
    pub fn is_ready(&self) -> bool {
        self.state() == ProcessState::Running && self.is_healthy()
    }

    pub fn uptime(&self) -> Option<Duration> {
        lock(&self.started_at).map(|at| at.elapsed())
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.state();
        let live = matches!(state, ProcessState::Starting | ProcessState::Running);
        StatusSnapshot {
            status: state.as_str().to_string(),
            pid: self.pid(),
            uptime_secs: if live {
                self.uptime().map_or(0, |d| d.as_secs())
            } else {
                0
            },
            healthy: self.is_healthy(),
        }
    }

    /// Move to `to` only if the current state is one of `from`.
    fn transition(&self, from: &[ProcessState], to: ProcessState) -> bool {
        self.swap_state(from, to, None)
    }

    /// Like [`transition`](Self::transition), queueing a report for `to`
    /// in the same step. Anyone who observes the new state will find its
    /// report already queued.
    fn advance(
        &self,
        from: &[ProcessState],
        to: ProcessState,
        message: Option<String>,
        pid: Option<u32>,
    ) -> bool {
        self.swap_state(from, to, Some(status_report(to, message, pid)))
    }

    fn swap_state(
        &self,
        from: &[ProcessState],
        to: ProcessState,
        mut report: Option<StatusReport>,
    ) -> bool {
        let mut previous = None;
        let applied = self.state.send_if_modified(|state| {
            if !from.contains(state) {
                return false;
            }
            previous = Some(*state);
            *state = to;
            if let Some(report) = report.take() {
                self.enqueue(report);
            }
            true
        });
        if let Some(from) = previous {
            debug!(%from, %to, "supervisor state changed");
        }
        applied
    }

    /// Queue a status report without waiting for delivery.
    fn report(&self, status: ProcessState, message: Option<String>, pid: Option<u32>) {
        self.enqueue(status_report(status, message, pid));
    }

    fn enqueue(&self, report: StatusReport) {
        if self.reports.send(ReportJob::Status(report)).is_err() {
            warn!("report queue closed, status report dropped");
        }
    }

    /// Wait until every report queued so far has been delivered or given
    /// up on. Returns false if `deadline` passes first.
    pub async fn flush_reports(&self, deadline: Duration) -> bool {
        let (done, flushed) = oneshot::channel();
        if self.reports.send(ReportJob::Flush(done)).is_err() {
            return true;
        }
        matches!(tokio::time::timeout(deadline, flushed).await, Ok(Ok(())))
    }

    /// Spawn the process and block until it passes its startup health check.
    ///
    /// Allowed from `idle`, `stopped` and `failed`. On failure the process
    /// is killed, `failed` is reported and the error returned.
    pub async fn start(self: &Arc<Self>) -> SupervisorResult<()> {
        {
            let mut current = lock(&self.process);
            if !self.advance(
                &[ProcessState::Idle, ProcessState::Stopped, ProcessState::Failed],
                ProcessState::Starting,
                None,
                None,
            ) {
                return Err(SupervisorError::InvalidState {
                    action: "start",
                    state: self.state(),
                });
            }
            // Late exit notifications from a previous run no longer match.
            *current = None;
        }
        self.healthy.store(false, Ordering::SeqCst);
        *lock(&self.started_at) = None;

        let process =
            match ManagedProcess::spawn(&self.config.command, self.config.workdir.as_deref()) {
                Ok(process) => Arc::new(process),
                Err(e) => {
                    error!(error = %e, "failed to spawn process");
                    self.advance(
                        &[ProcessState::Starting],
                        ProcessState::Failed,
                        Some(e.to_string()),
                        None,
                    );
                    return Err(e);
                }
            };
        let pid = process.pid();
        let mut lines = process.stdout_lines();
        *lock(&self.process) = Some(Arc::clone(&process));
        *lock(&self.started_at) = Some(Instant::now());

        let this = Arc::clone(self);
        let watched = Arc::clone(&process);
        tokio::spawn(async move {
            let exit = watched.wait().await;
            this.on_exit(&watched, exit);
        });

        let outcome = tokio::select! {
            result = health::wait_until_healthy(&self.config.health, &mut lines) => result,
            exit = process.wait() => Err(SupervisorError::StartupExit(exit.to_string())),
        };

        match outcome {
            Ok(()) => {
                self.healthy.store(true, Ordering::SeqCst);
                if !self.advance(
                    &[ProcessState::Starting],
                    ProcessState::Running,
                    Some("health check passed".to_string()),
                    Some(pid),
                ) {
                    self.healthy.store(false, Ordering::SeqCst);
                    return Err(SupervisorError::InvalidState {
                        action: "finish startup",
                        state: self.state(),
                    });
                }
                info!(pid, health = self.config.health.kind.as_str(), "process running");
                Ok(())
            }
            Err(e) => {
                if self.advance(
                    &[ProcessState::Starting],
                    ProcessState::Failed,
                    Some(e.to_string()),
                    Some(pid),
                ) {
                    error!(pid, error = %e, "startup failed");
                    if let Err(kill) = process.kill() {
                        warn!(pid, error = %kill, "failed to kill process after startup failure");
                    }
                }
                Err(e)
            }
        }
    }

    /// [`start`](Self::start), unless `interrupt` resolves first. A start
    /// cut short is followed by a graceful [`stop`](Self::stop).
    pub async fn start_or_interrupt<F>(self: &Arc<Self>, interrupt: F) -> StartOutcome
    where
        F: Future<Output = ()>,
    {
        let started = tokio::select! {
            result = self.start() => Some(result),
            _ = interrupt => None,
        };
        match started {
            Some(Ok(())) => StartOutcome::Started,
            Some(Err(e)) => StartOutcome::Failed(e),
            None => {
                info!(state = %self.state(), "interrupted during startup, stopping process");
                if let Err(e) = self.stop(true).await {
                    warn!(error = %e, "stop after interrupted startup failed");
                }
                StartOutcome::Interrupted
            }
        }
    }

    /// Exit handling for exits the supervisor did not ask for.
    fn on_exit(&self, process: &Arc<ManagedProcess>, exit: ExitInfo) {
        let current = lock(&self.process);
        if !current.as_ref().is_some_and(|p| Arc::ptr_eq(p, process)) {
            debug!(pid = process.pid(), %exit, "exit of a previous run ignored");
            return;
        }
        self.healthy.store(false, Ordering::SeqCst);
        let pid = Some(process.pid());
        if exit.success()
            && self.advance(
                &[ProcessState::Running],
                ProcessState::Stopped,
                Some("process exited cleanly".to_string()),
                pid,
            )
        {
            info!(?pid, "process exited cleanly");
        } else if self.advance(
            &[ProcessState::Running],
            ProcessState::Failed,
            Some(format!("process crashed: {exit}")),
            pid,
        ) {
            error!(?pid, %exit, "process crashed");
        } else if self.advance(
            &[ProcessState::Starting],
            ProcessState::Failed,
            Some(SupervisorError::StartupExit(exit.to_string()).to_string()),
            pid,
        ) {
            error!(?pid, %exit, "process exited during startup");
        } else {
            debug!(?pid, %exit, state = %self.state(), "process exit already handled");
        }
    }

    /// Stop the process.
    ///
    /// Graceful stops send SIGTERM to the process group and escalate to
    /// SIGKILL after the grace period; otherwise SIGKILL is sent at once.
    /// Returns only after the process has exited. Dropping the returned
    /// future mid-way also escalates to SIGKILL.
    pub async fn stop(&self, graceful: bool) -> SupervisorResult<()> {
        let Some(process) = self.process() else {
            self.transition(&[ProcessState::Idle], ProcessState::Stopped);
            return Ok(());
        };
        if !self.transition(
            &[ProcessState::Starting, ProcessState::Running],
            ProcessState::Stopping,
        ) {
            if self.state() == ProcessState::Stopping {
                process.wait().await;
            }
            return Ok(());
        }
        self.healthy.store(false, Ordering::SeqCst);
        let pid = process.pid();
        info!(pid, graceful, "stopping process");

        let mut escalation = KillOnDrop::new(&process);
        let signalled = if graceful {
            process.terminate()
        } else {
            process.kill()
        };
        self.report(ProcessState::Stopping, None, Some(pid));

        let exit = if graceful {
            if let Err(e) = signalled {
                warn!(pid, error = %e, "SIGTERM failed");
            }
            match tokio::time::timeout(self.config.grace_period, process.wait()).await {
                Ok(exit) => exit,
                Err(_) => {
                    warn!(
                        pid,
                        grace_secs = self.config.grace_period.as_secs_f64(),
                        "grace period elapsed, killing process group"
                    );
                    process.kill()?;
                    process.wait().await
                }
            }
        } else {
            signalled?;
            process.wait().await
        };
        escalation.disarm();

        self.advance(
            &[ProcessState::Stopping],
            ProcessState::Stopped,
            Some(format!("process exited: {exit}")),
            Some(pid),
        );
        info!(pid, %exit, "process stopped");
        Ok(())
    }

    /// Wait until the supervisor reaches `stopped` or `failed`.
    pub async fn wait_final(&self) -> ProcessState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(ProcessState::is_final).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// A callback that reports `failed` upstream without touching the
    /// process.
    pub fn unhealthy_reporter(self: &Arc<Self>) -> UnhealthyCallback {
        let this = Arc::clone(self);
        Arc::new(move |reason: String| -> BoxFuture {
            this.report(ProcessState::Failed, Some(reason), this.pid());
            Box::pin(async {})
        })
    }

    /// Re-check health every interval while running. After three
    /// consecutive failures the process is marked unhealthy and
    /// `on_unhealthy` is invoked; the process keeps running.
    pub async fn run_health_monitor(
        self: Arc<Self>,
        on_unhealthy: UnhealthyCallback,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let interval = self.config.health.interval;
        let mut tracker = HealthTracker::default();
        info!(interval_ms = interval.as_millis() as u64, "health monitor started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("health monitor shutting down");
                    return;
                }
            }

            match self.state() {
                ProcessState::Running => {}
                state if state.is_final() => {
                    debug!(%state, "health monitor exiting");
                    return;
                }
                _ => continue,
            }

            let result = match (self.config.health.kind, self.config.health.port) {
                (HealthKind::Port, Some(port)) => {
                    health::probe_port(port, self.config.health.protocol, interval).await
                }
                _ => ProbeResult::Healthy,
            };
            if tracker.record(result) {
                self.healthy.store(false, Ordering::SeqCst);
                let reason = format!(
                    "health check failed {} times in a row",
                    tracker.consecutive_failures()
                );
                on_unhealthy(reason).await;
            } else if tracker.is_healthy() {
                self.healthy.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Report pid, resident memory and CPU percent every heartbeat interval
    /// while running. Failures are logged and not retried.
    pub async fn run_heartbeat(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.heartbeat_interval;
        let mut sampler: Option<CpuSampler> = None;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("heartbeat loop shutting down");
                    return;
                }
            }

            match self.state() {
                ProcessState::Running => {}
                state if state.is_final() => return,
                _ => continue,
            }
            let Some(pid) = self.pid() else { continue };

            let sampler = sampler.get_or_insert_with(|| CpuSampler::new(pid));
            let heartbeat = HeartbeatReport {
                process_pid: pid,
                memory_mb: resident_memory_mb(pid),
                cpu_percent: Some(sampler.sample()),
            };
            match self.reporter.heartbeat(&heartbeat).await {
                Ok(()) => debug!(pid, memory_mb = ?heartbeat.memory_mb, "heartbeat sent"),
                Err(e) => warn!(pid, error = %e, "heartbeat failed"),
            }
        }
    }
}

fn status_report(status: ProcessState, message: Option<String>, pid: Option<u32>) -> StatusReport {
    StatusReport {
        status: status.as_str().to_string(),
        message,
        process_pid: pid,
    }
}

/// Delivers queued reports one at a time, in queue order, each under
/// [`REPORT_DEADLINE`]. Exits once the supervisor is dropped and the
/// queue drained.
async fn deliver_reports(reporter: Arc<dyn Reporter>, mut jobs: mpsc::UnboundedReceiver<ReportJob>) {
    while let Some(job) = jobs.recv().await {
        match job {
            ReportJob::Status(report) => {
                let delivery =
                    tokio::time::timeout(REPORT_DEADLINE, reporter.report_status(&report)).await;
                match delivery {
                    Ok(Ok(())) => debug!(status = %report.status, "status reported"),
                    Ok(Err(e)) => warn!(status = %report.status, error = %e, "status report failed"),
                    Err(_) => warn!(status = %report.status, "status report deadline exceeded"),
                }
            }
            ReportJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// SIGKILLs the process group if dropped while armed.
struct KillOnDrop<'a> {
    process: &'a ManagedProcess,
    armed: bool,
}

impl<'a> KillOnDrop<'a> {
    fn new(process: &'a ManagedProcess) -> Self {
        Self {
            process,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for KillOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(pid = self.process.pid(), "stop abandoned, killing process group");
            let _ = self.process.kill();
        }
    }
}

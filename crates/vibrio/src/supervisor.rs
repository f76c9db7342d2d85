//! Engine process supervision.
//!
//! The [`Supervisor`] owns at most one live engine. Lifecycle transitions
//! (start, stop, close, recovery) are serialized through an async mutex while
//! the current [`EngineStatus`] is published on a watch channel, so dispatches
//! can read the state without taking the lock.
//!
//! Once an engine is ready it is handed to a reaper task that waits for either
//! the process to exit (the engine crashed: mark the session degraded) or a
//! shutdown request (SIGTERM, bounded grace, then SIGKILL). A separate
//! [`HealthChecker`] probes the status endpoint and degrades the session after
//! repeated failures.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::StatusCode;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vibrio_common::protocol::error::{Result, VibrioError};
use vibrio_common::transport::{HttpTransport, RetryConfig, TransportConfig};

use crate::config::SupervisorConfig;
use crate::health_checker::HealthChecker;
use crate::launcher::{is_clean_exit, EngineLauncher, EngineProcess};

/// Extra time allowed for a SIGKILLed engine to be reaped.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No engine has been started, or it was stopped.
    Unstarted,
    /// An engine is being spawned and polled for readiness.
    Starting,
    /// The engine answered its status endpoint and accepts calls.
    Ready,
    /// The engine exited or stopped answering; the next dispatch restarts it.
    Degraded,
    /// Terminal. No further engine will be started.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unstarted => "unstarted",
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Snapshot of a running engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineHandle {
    /// Increments with every launch; stale failure reports are ignored by generation.
    pub generation: u64,
    pub pid: u32,
    pub port: u16,
    pub base_url: String,
    pub started_at: std::time::Instant,
    pub last_healthy_at: std::time::Instant,
}

/// State plus the live engine, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub state: SessionState,
    pub handle: Option<EngineHandle>,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Unstarted,
            handle: None,
        }
    }
}

/// Shared publisher of [`EngineStatus`].
#[derive(Clone)]
pub(crate) struct StatusCell(Arc<watch::Sender<EngineStatus>>);

impl StatusCell {
    fn new() -> Self {
        let (sender, _) = watch::channel(EngineStatus::default());
        Self(Arc::new(sender))
    }

    pub(crate) fn snapshot(&self) -> EngineStatus {
        self.0.borrow().clone()
    }

    pub(crate) fn state(&self) -> SessionState {
        self.0.borrow().state
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.0.subscribe()
    }

    /// `true` while `generation` is the published `Ready` engine.
    pub(crate) fn is_live(&self, generation: u64) -> bool {
        let status = self.0.borrow();
        status.state == SessionState::Ready
            && status.handle.as_ref().is_some_and(|h| h.generation == generation)
    }

    /// Moves a live `generation` to `Degraded`. Returns whether anything changed.
    pub(crate) fn mark_degraded(&self, generation: u64) -> bool {
        self.0.send_if_modified(|status| {
            let current = status.state == SessionState::Ready
                && status.handle.as_ref().is_some_and(|h| h.generation == generation);
            if current {
                status.state = SessionState::Degraded;
            }
            current
        })
    }

    pub(crate) fn record_healthy(&self, generation: u64) {
        // Timestamp only; not worth waking subscribers.
        self.0.send_if_modified(|status| {
            if let Some(handle) = status.handle.as_mut() {
                if handle.generation == generation {
                    handle.last_healthy_at = std::time::Instant::now();
                }
            }
            false
        });
    }

    /// Sets `state` unless the session is closed.
    fn transition(&self, state: SessionState) -> bool {
        self.0.send_if_modified(|status| {
            if status.state == SessionState::Closed || status.state == state {
                return false;
            }
            status.state = state;
            true
        })
    }
}

/// Restores the pre-launch state if a launch fails or is cancelled.
struct StartingGuard<'a> {
    status: &'a StatusCell,
    restore: SessionState,
    armed: bool,
}

impl<'a> StartingGuard<'a> {
    fn enter(status: &'a StatusCell, restore: SessionState) -> Self {
        status.transition(SessionState::Starting);
        Self {
            status,
            restore,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let restore = self.restore;
        self.status.0.send_if_modified(|status| {
            if status.state != SessionState::Starting {
                return false;
            }
            status.state = restore;
            true
        });
    }
}

struct RunningEngine {
    handle: EngineHandle,
    shutdown: Option<oneshot::Sender<()>>,
    reaper: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

impl Drop for RunningEngine {
    fn drop(&mut self) {
        // Dropping `shutdown` without sending makes the reaper kill the engine.
        self.monitor.abort();
    }
}

struct Lifecycle {
    engine: Option<RunningEngine>,
    next_generation: u64,
}

/// Owns the engine process and its lifecycle.
pub struct Supervisor<L: EngineLauncher> {
    launcher: L,
    config: SupervisorConfig,
    transport: HttpTransport,
    status: StatusCell,
    lifecycle: Mutex<Lifecycle>,
    restarts: AtomicU32,
}

impl<L: EngineLauncher> Supervisor<L> {
    pub fn new(launcher: L, config: SupervisorConfig) -> Self {
        let transport = HttpTransport::new(TransportConfig {
            request_timeout: config.readiness.probe_timeout,
            retry: RetryConfig::none(),
        });
        Self {
            launcher,
            config,
            transport,
            status: StatusCell::new(),
            lifecycle: Mutex::new(Lifecycle {
                engine: None,
                next_generation: 1,
            }),
            restarts: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn state(&self) -> SessionState {
        self.status.state()
    }

    pub fn status(&self) -> EngineStatus {
        self.status.snapshot()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }

    /// The live engine, if the session is `Ready`.
    pub fn handle(&self) -> Option<EngineHandle> {
        let status = self.status.0.borrow();
        match status.state {
            SessionState::Ready => status.handle.clone(),
            _ => None,
        }
    }

    /// Successful automatic restarts so far.
    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Starts the engine if none is live.
    ///
    /// From `Degraded` the old engine is torn down first. A started session
    /// returns its current handle.
    ///
    /// # Errors
    ///
    /// `EngineStartup` if the engine cannot be spawned, exits early or misses
    /// the startup timeout; `EngineUnavailable` once closed.
    pub async fn start(&self) -> Result<EngineHandle> {
        let mut lifecycle = self.lifecycle.lock().await;
        let status = self.status.snapshot();
        match (status.state, status.handle) {
            (SessionState::Closed, _) => Err(closed_error()),
            (SessionState::Ready, Some(handle)) => Ok(handle),
            (SessionState::Degraded, _) => {
                self.teardown(&mut lifecycle).await;
                self.launch(&mut lifecycle).await
            }
            _ => self.launch(&mut lifecycle).await,
        }
    }

    /// Returns a ready engine, starting or recovering one as needed.
    ///
    /// # Errors
    ///
    /// `EngineStartup` when a lazy first start fails. `EngineUnavailable`
    /// when the session is closed or recovery of a degraded engine ran out of
    /// attempts; the state then stays `Degraded`.
    pub async fn ensure_ready(&self) -> Result<EngineHandle> {
        if let Some(handle) = self.ready_handle()? {
            return Ok(handle);
        }

        let mut lifecycle = self.lifecycle.lock().await;
        let status = self.status.snapshot();
        match (status.state, status.handle) {
            (SessionState::Closed, _) => Err(closed_error()),
            (SessionState::Ready, Some(handle)) => Ok(handle),
            (SessionState::Degraded, _) => self.recover(&mut lifecycle).await,
            _ => self.launch(&mut lifecycle).await,
        }
    }

    /// Records that `generation` failed outside the reaper and monitor.
    ///
    /// Returns whether the session moved to `Degraded`.
    pub fn report_failure(&self, generation: u64) -> bool {
        let degraded = self.status.mark_degraded(generation);
        if degraded {
            warn!("Engine generation {} reported unreachable, marking degraded", generation);
        }
        degraded
    }

    /// Stops the engine and returns to `Unstarted`. Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        self.teardown(&mut lifecycle).await;
        self.status.0.send_if_modified(|status| {
            if status.state == SessionState::Closed {
                return false;
            }
            let changed = status.state != SessionState::Unstarted || status.handle.is_some();
            status.state = SessionState::Unstarted;
            status.handle = None;
            changed
        });
    }

    /// Closes the session for good.
    ///
    /// `Closed` is published before teardown so in-flight calls observe it.
    pub async fn close(&self) {
        let newly_closed = self.status.0.send_if_modified(|status| {
            if status.state == SessionState::Closed {
                return false;
            }
            status.state = SessionState::Closed;
            true
        });

        let mut lifecycle = self.lifecycle.lock().await;
        self.teardown(&mut lifecycle).await;
        self.status.0.send_if_modified(|status| status.handle.take().is_some());

        if newly_closed {
            info!("Session closed");
        }
    }

    fn ready_handle(&self) -> Result<Option<EngineHandle>> {
        let status = self.status.0.borrow();
        match (status.state, &status.handle) {
            (SessionState::Closed, _) => Err(closed_error()),
            (SessionState::Ready, Some(handle)) => Ok(Some(handle.clone())),
            _ => Ok(None),
        }
    }

    async fn recover(&self, lifecycle: &mut Lifecycle) -> Result<EngineHandle> {
        let attempts = self.config.max_restart_attempts;
        if attempts == 0 {
            return Err(VibrioError::EngineUnavailable(
                "engine is degraded and automatic restart is disabled".to_string(),
            ));
        }

        self.teardown(lifecycle).await;

        let mut last_error = None;
        for attempt in 1..=attempts {
            info!("Restarting engine (attempt {}/{})", attempt, attempts);
            match self.launch(lifecycle).await {
                Ok(handle) => {
                    self.restarts.fetch_add(1, Ordering::SeqCst);
                    return Ok(handle);
                }
                Err(err @ VibrioError::EngineUnavailable(_)) => return Err(err),
                Err(err) => {
                    warn!("Engine restart attempt {}/{} failed: {}", attempt, attempts, err);
                    last_error = Some(err);
                }
            }
        }

        let cause = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(VibrioError::EngineUnavailable(format!(
            "engine restart failed after {} attempt(s): {}",
            attempts, cause
        )))
    }

    async fn launch(&self, lifecycle: &mut Lifecycle) -> Result<EngineHandle> {
        let previous = self.status.state();
        if previous == SessionState::Closed {
            return Err(closed_error());
        }
        let guard = StartingGuard::enter(&self.status, previous);

        let generation = lifecycle.next_generation;
        lifecycle.next_generation += 1;

        let port = match self.config.port {
            Some(port) => port,
            None => free_port()?,
        };
        let base_url = format!("http://127.0.0.1:{}", port);

        let mut process = self.launcher.launch(port)?;
        let pid = process.id().unwrap_or_default();
        info!(
            "Launched engine generation {} (pid {}) on {}",
            generation, pid, base_url
        );

        let started = Instant::now();
        if let Err(err) = self.wait_until_ready(&mut process, &base_url).await {
            if let Err(kill_err) = process.kill().await {
                warn!("Failed to kill engine pid {} after failed startup: {}", pid, kill_err);
            }
            return Err(err);
        }

        let now = std::time::Instant::now();
        let handle = EngineHandle {
            generation,
            pid,
            port,
            base_url,
            started_at: now,
            last_healthy_at: now,
        };

        let published = self.status.0.send_if_modified(|status| {
            if status.state == SessionState::Closed {
                return false;
            }
            status.state = SessionState::Ready;
            status.handle = Some(handle.clone());
            true
        });
        guard.disarm();

        if !published {
            if let Err(kill_err) = process.kill().await {
                warn!("Failed to kill engine pid {} after close: {}", pid, kill_err);
            }
            return Err(closed_error());
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let reaper = tokio::spawn(reap(
            process,
            shutdown_rx,
            self.status.clone(),
            generation,
            self.config.shutdown_grace,
        ));
        let monitor = HealthChecker::new(
            self.status.clone(),
            self.transport.clone(),
            handle.clone(),
            self.config.health.clone(),
        )
        .spawn();

        lifecycle.engine = Some(RunningEngine {
            handle: handle.clone(),
            shutdown: Some(shutdown_tx),
            reaper,
            monitor,
        });

        info!(
            "Engine generation {} ready on {} after {}ms",
            generation,
            handle.base_url,
            started.elapsed().as_millis()
        );
        Ok(handle)
    }

    async fn wait_until_ready(
        &self,
        process: &mut L::Process,
        base_url: &str,
    ) -> Result<()> {
        let readiness = &self.config.readiness;
        let timeout = self.config.startup_timeout;
        let deadline = Instant::now() + timeout;
        let mut delay = readiness.initial_interval;
        let timed_out = || {
            VibrioError::EngineStartup(format!(
                "engine did not become ready within {}ms",
                timeout.as_millis()
            ))
        };

        loop {
            let exited = process.try_wait().map_err(|e| {
                VibrioError::EngineStartup(format!("failed to poll engine process: {}", e))
            })?;
            if let Some(status) = exited {
                return Err(VibrioError::EngineStartup(format!(
                    "engine exited during startup ({})",
                    status
                )));
            }
            if self.status.state() == SessionState::Closed {
                return Err(closed_error());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out());
            }
            let probe_timeout = readiness.probe_timeout.min(deadline - now);
            match self.transport.probe(base_url, probe_timeout).await {
                Ok(response) if response.status == StatusCode::OK => return Ok(()),
                Ok(response) => debug!("Engine at {} not ready: status {}", base_url, response.status),
                Err(e) => debug!("Engine at {} not ready: {}", base_url, e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out());
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = readiness.next_interval(delay);
        }
    }

    async fn teardown(&self, lifecycle: &mut Lifecycle) {
        let Some(mut engine) = lifecycle.engine.take() else {
            return;
        };
        let generation = engine.handle.generation;
        let pid = engine.handle.pid;

        engine.monitor.abort();
        if let Some(shutdown) = engine.shutdown.take() {
            let _ = shutdown.send(());
        }

        let bound = self.config.shutdown_grace + KILL_WAIT;
        match tokio::time::timeout(bound, &mut engine.reaper).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Reaper for engine pid {} failed: {}", pid, e),
            Err(_) => {
                warn!(
                    "Engine pid {} was not reaped within {}ms, abandoning it",
                    pid,
                    bound.as_millis()
                );
                engine.reaper.abort();
            }
        }

        self.status.0.send_if_modified(|status| {
            let current = status
                .handle
                .as_ref()
                .is_some_and(|h| h.generation == generation);
            if current {
                status.handle = None;
            }
            current
        });
        info!("Engine generation {} (pid {}) stopped", generation, pid);
    }
}

fn closed_error() -> VibrioError {
    VibrioError::EngineUnavailable("session closed".to_string())
}

/// Asks the OS for an unused loopback port.
fn free_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(|e| {
        VibrioError::EngineStartup(format!("failed to allocate a loopback port: {}", e))
    })?;
    let addr = listener.local_addr().map_err(|e| {
        VibrioError::EngineStartup(format!("failed to read allocated port: {}", e))
    })?;
    Ok(addr.port())
}

enum ReaperEvent {
    Exited(io::Result<ExitStatus>),
    Shutdown,
    Abandoned,
}

/// Owns a ready engine until it exits or is told to stop.
async fn reap<P: EngineProcess>(
    mut process: P,
    shutdown: oneshot::Receiver<()>,
    status: StatusCell,
    generation: u64,
    grace: Duration,
) {
    let pid = process.id().unwrap_or_default();

    let event = tokio::select! {
        exit = process.wait() => ReaperEvent::Exited(exit),
        requested = shutdown => match requested {
            Ok(()) => ReaperEvent::Shutdown,
            Err(_) => ReaperEvent::Abandoned,
        },
    };

    match event {
        ReaperEvent::Exited(exit) => {
            log_exit(generation, pid, &exit);
            // Anything the engine left running in its group goes with it.
            if let Err(e) = process.kill().await {
                warn!("Failed to kill process group of engine pid {}: {}", pid, e);
            }
            if status.mark_degraded(generation) {
                warn!(
                    "Engine generation {} (pid {}) exited unexpectedly, marking degraded",
                    generation, pid
                );
            }
        }
        ReaperEvent::Abandoned => {
            warn!("Engine pid {} abandoned without shutdown, killing", pid);
            if let Err(e) = process.kill().await {
                warn!("Failed to kill engine pid {}: {}", pid, e);
            }
        }
        ReaperEvent::Shutdown => {
            if let Err(e) = process.terminate() {
                warn!("Failed to signal engine pid {}: {}", pid, e);
            }
            match tokio::time::timeout(grace, process.wait()).await {
                Ok(exit) => log_exit(generation, pid, &exit),
                Err(_) => {
                    warn!(
                        "Engine pid {} still running {}ms after SIGTERM, killing",
                        pid,
                        grace.as_millis()
                    );
                    if let Err(e) = process.kill().await {
                        warn!("Failed to kill engine pid {}: {}", pid, e);
                    }
                }
            }
        }
    }
}

fn log_exit(generation: u64, pid: u32, exit: &io::Result<ExitStatus>) {
    match exit {
        Ok(status) if is_clean_exit(status) => {
            info!("Engine generation {} (pid {}) exited ({})", generation, pid, status)
        }
        Ok(status) => warn!(
            "Engine generation {} (pid {}) did not shut down cleanly ({})",
            generation, pid, status
        ),
        Err(e) => warn!("Failed to wait for engine pid {}: {}", pid, e),
    }
}

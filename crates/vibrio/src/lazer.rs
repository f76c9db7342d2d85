//! Session facades.
//!
//! [`LazerAsync`] is the non-blocking session: cheap to clone, safe to share
//! across tasks, with any number of calls in flight against one engine.
//! [`Lazer`] wraps it behind a private current-thread runtime for callers
//! without one of their own.

use std::sync::Arc;

use hyper::body::Bytes;
use tokio::runtime::{Builder, Runtime};
use tracing::{info, warn};
use vibrio_common::protocol::error::{Result, VibrioError};
use vibrio_common::protocol::{
    BeatmapRef, CalculationKind, CalculationRequest, CalculationResult, DifficultyAttributes,
    ModSet, PerformanceAttributes,
};
use vibrio_common::transport::HttpTransport;

use crate::client::EngineClient;
use crate::config::LazerConfig;
use crate::launcher::ProcessLauncher;
use crate::supervisor::{EngineHandle, EngineStatus, SessionState, Supervisor};

/// Async session over a supervised engine.
///
/// The engine starts lazily on the first call (or explicitly through
/// [`start`](Self::start)) and lives until [`close`](Self::close). Dropping
/// the last clone without closing kills the engine.
///
/// # Example
///
/// ```no_run
/// use vibrio::{CalculationRequest, HitStatistics, LazerAsync, LazerConfig, OsuMod};
///
/// # async fn run() -> vibrio::Result<()> {
/// let lazer = LazerAsync::new(LazerConfig::from_env()?)?;
/// let request = CalculationRequest::by_id(1001682)
///     .with_mods([OsuMod::Hidden, OsuMod::DoubleTime])
///     .with_hit_stats(HitStatistics::new(2019, 104, 0, 3, 3141));
/// let performance = lazer.calculate_performance(&request).await?;
/// println!("{:.2}pp", performance.total);
/// lazer.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LazerAsync {
    client: Arc<EngineClient<ProcessLauncher>>,
}

impl LazerAsync {
    /// Creates a session. The engine is not started.
    ///
    /// # Errors
    ///
    /// `Validation` for an invalid config, `EngineStartup` if the engine
    /// executable cannot be found.
    pub fn new(config: LazerConfig) -> Result<Self> {
        config.validate()?;
        let executable = config.resolve_executable()?;
        let launcher = ProcessLauncher::new(executable)
            .with_args(config.engine_args.iter().cloned())
            .with_env(config.engine_env.iter().cloned())
            .with_output_logged(config.log_engine_output);
        let supervisor = Supervisor::new(launcher, config.supervisor_config());
        let transport = HttpTransport::new(config.transport_config());
        Ok(Self {
            client: Arc::new(EngineClient::new(supervisor, transport)),
        })
    }

    /// Starts the engine now instead of on first use.
    pub async fn start(&self) -> Result<EngineHandle> {
        self.client.supervisor().start().await
    }

    /// Stops the engine; the next call starts a fresh one.
    pub async fn stop(&self) {
        self.client.supervisor().stop().await
    }

    /// Closes the session and shuts the engine down. Idempotent.
    ///
    /// Calls still in flight resolve to `EngineUnavailable("session closed")`.
    pub async fn close(&self) {
        self.client.supervisor().close().await
    }

    /// Current lifecycle state of the session.
    pub fn state(&self) -> SessionState {
        self.client.supervisor().state()
    }

    /// State and live engine handle, read together from one snapshot.
    pub fn status(&self) -> EngineStatus {
        self.client.supervisor().status()
    }

    /// The live engine, if the session is ready.
    pub fn handle(&self) -> Option<EngineHandle> {
        self.client.supervisor().handle()
    }

    /// Automatic restarts performed after the engine was lost.
    pub fn restart_count(&self) -> u32 {
        self.client.supervisor().restart_count()
    }

    /// Runs one calculation, starting or recovering the engine as needed.
    ///
    /// # Arguments
    /// * `request` - What to calculate; validated before anything is sent
    ///
    /// # Returns
    /// Performance attributes when the request carries hit statistics or a
    /// replay, difficulty attributes otherwise.
    ///
    /// # Errors
    ///
    /// `Validation` for a rejected request, `BeatmapNotFound` when the engine
    /// has no such beatmap, `Transport`/`Protocol` for a failed exchange and
    /// `EngineUnavailable` once the engine cannot be recovered or the session
    /// is closed.
    pub async fn calculate(&self, request: &CalculationRequest) -> Result<CalculationResult> {
        self.client.calculate(request).await
    }

    /// Difficulty attributes of a beatmap under `mods`.
    ///
    /// # Arguments
    /// * `beatmap` - A beatmap id or `.osu` content
    /// * `mods` - Mods to apply; an empty set means no mod
    pub async fn calculate_difficulty(
        &self,
        beatmap: impl Into<BeatmapRef>,
        mods: impl Into<ModSet>,
    ) -> Result<DifficultyAttributes> {
        let request = CalculationRequest::new(beatmap.into()).with_mods(mods);
        let result = self.client.calculate(&request).await?;
        result.into_difficulty().ok_or_else(|| mismatched_result("difficulty"))
    }

    /// Performance attributes of a play.
    ///
    /// # Errors
    ///
    /// `Validation` if the request carries neither hit statistics nor a replay.
    pub async fn calculate_performance(
        &self,
        request: &CalculationRequest,
    ) -> Result<PerformanceAttributes> {
        if request.kind() != CalculationKind::Performance {
            return Err(VibrioError::Validation(
                "performance calculation needs hit statistics or a replay".to_string(),
            ));
        }
        let result = self.client.calculate(request).await?;
        result.into_performance().ok_or_else(|| mismatched_result("performance"))
    }

    /// Whether the engine has the beatmap cached.
    pub async fn has_beatmap(&self, beatmap_id: u32) -> Result<bool> {
        self.client.has_beatmap(beatmap_id).await
    }

    /// Raw `.osu` content of a beatmap, fetched through the engine.
    pub async fn get_beatmap(&self, beatmap_id: u32) -> Result<Bytes> {
        self.client.get_beatmap(beatmap_id).await
    }

    /// Drops every beatmap the engine has cached.
    pub async fn clear_cache(&self) -> Result<()> {
        self.client.clear_cache().await
    }
}

fn mismatched_result(expected: &str) -> VibrioError {
    VibrioError::Protocol(format!("engine returned a non-{} result", expected))
}

/// Blocking session.
///
/// Every call runs to completion on a private current-thread runtime, so
/// background supervision only makes progress while a call is running; a
/// crash between calls is noticed and recovered by the next one. Meant for
/// use from one thread at a time.
///
/// Dropping an unclosed session closes it. Dropped from inside an async
/// context, where it cannot block, it abandons its runtime instead and the
/// engine is killed without the graceful shutdown.
///
/// # Example
///
/// ```no_run
/// use vibrio::{Lazer, LazerConfig, OsuMod};
///
/// let lazer = Lazer::new(LazerConfig::from_env()?)?;
/// let difficulty = lazer.calculate_difficulty(1001682u32, [OsuMod::Hidden])?;
/// println!("{:.2} stars", difficulty.star_rating);
/// lazer.close();
/// # Ok::<(), vibrio::VibrioError>(())
/// ```
pub struct Lazer {
    /// Only `None` while the session is being dropped
    runtime: Option<Runtime>,
    inner: LazerAsync,
}

impl Lazer {
    /// Creates a session. The engine is not started.
    ///
    /// # Arguments
    /// * `config` - Session configuration, validated here
    ///
    /// # Errors
    ///
    /// `Validation` for an invalid config, `EngineStartup` if the engine
    /// executable cannot be found or the runtime cannot be built.
    pub fn new(config: LazerConfig) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| VibrioError::EngineStartup(format!("failed to build runtime: {}", e)))?;
        let inner = {
            let _guard = runtime.enter();
            LazerAsync::new(config)?
        };
        Ok(Self {
            runtime: Some(runtime),
            inner,
        })
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime
            .as_ref()
            .ok_or_else(|| VibrioError::EngineUnavailable("session closed".to_string()))
    }

    /// Starts the engine now instead of on first use.
    ///
    /// # Returns
    /// The live engine, or the current one if the session is already ready.
    pub fn start(&self) -> Result<EngineHandle> {
        self.runtime()?.block_on(self.inner.start())
    }

    /// Stops the engine; the next call starts a fresh one.
    pub fn stop(&self) {
        if let Some(runtime) = &self.runtime {
            runtime.block_on(self.inner.stop())
        }
    }

    /// Closes the session and shuts the engine down. Idempotent.
    pub fn close(&self) {
        if let Some(runtime) = &self.runtime {
            runtime.block_on(self.inner.close())
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn status(&self) -> EngineStatus {
        self.inner.status()
    }

    /// The live engine, if the session is ready.
    pub fn handle(&self) -> Option<EngineHandle> {
        self.inner.handle()
    }

    pub fn restart_count(&self) -> u32 {
        self.inner.restart_count()
    }

    /// Blocking [`LazerAsync::calculate`].
    pub fn calculate(&self, request: &CalculationRequest) -> Result<CalculationResult> {
        self.runtime()?.block_on(self.inner.calculate(request))
    }

    /// Blocking [`LazerAsync::calculate_difficulty`].
    pub fn calculate_difficulty(
        &self,
        beatmap: impl Into<BeatmapRef>,
        mods: impl Into<ModSet>,
    ) -> Result<DifficultyAttributes> {
        self.runtime()?
            .block_on(self.inner.calculate_difficulty(beatmap, mods))
    }

    /// Blocking [`LazerAsync::calculate_performance`].
    ///
    /// # Errors
    ///
    /// `Validation` if the request carries neither hit statistics nor a replay.
    pub fn calculate_performance(
        &self,
        request: &CalculationRequest,
    ) -> Result<PerformanceAttributes> {
        self.runtime()?.block_on(self.inner.calculate_performance(request))
    }

    /// Whether the engine has the beatmap cached.
    pub fn has_beatmap(&self, beatmap_id: u32) -> Result<bool> {
        self.runtime()?.block_on(self.inner.has_beatmap(beatmap_id))
    }

    /// Raw `.osu` content of a beatmap, fetched through the engine.
    ///
    /// # Errors
    ///
    /// `BeatmapNotFound` if the engine cannot find the beatmap.
    pub fn get_beatmap(&self, beatmap_id: u32) -> Result<Bytes> {
        self.runtime()?.block_on(self.inner.get_beatmap(beatmap_id))
    }

    pub fn clear_cache(&self) -> Result<()> {
        self.runtime()?.block_on(self.inner.clear_cache())
    }
}

impl Drop for Lazer {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        let closed = self.inner.state() == SessionState::Closed;
        if tokio::runtime::Handle::try_current().is_ok() {
            // No blocking allowed here. Dropping the runtime's tasks drops the
            // reaper's child, which is killed on drop.
            if !closed {
                warn!("Lazer dropped inside an async context without close(), killing engine");
            }
            runtime.shutdown_background();
            return;
        }
        if !closed {
            info!("Lazer dropped without close(), shutting engine down");
            runtime.block_on(self.inner.close());
        }
    }
}

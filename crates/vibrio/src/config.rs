//! Session configuration.
//!
//! [`LazerConfig`] carries every knob of a session: where the engine binary
//! lives, how long startup and individual calls may take, how aggressively
//! failures are retried and how the engine is shut down. All fields are public
//! and every field has a `with_*` builder method.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use vibrio_common::protocol::error::{Result, VibrioError};
use vibrio_common::transport::{RetryConfig, TransportConfig};

use crate::health_checker::HealthCheckConfig;

/// Overrides the engine executable path.
pub const ENGINE_PATH_ENV: &str = "VIBRIO_ENGINE_PATH";
/// Startup timeout in milliseconds.
pub const STARTUP_TIMEOUT_ENV: &str = "VIBRIO_STARTUP_TIMEOUT_MS";
/// Per-attempt request timeout in milliseconds.
pub const REQUEST_TIMEOUT_ENV: &str = "VIBRIO_REQUEST_TIMEOUT_MS";
/// Automatic restart attempts after the engine is lost.
pub const MAX_RESTARTS_ENV: &str = "VIBRIO_MAX_RESTARTS";

/// Executable name of the engine, without platform suffix.
pub const ENGINE_EXECUTABLE: &str = "Vibrio";

/// Polling schedule used while waiting for a fresh engine to answer `/api/status`.
///
/// The first probe is sent immediately; subsequent probes wait
/// `initial_interval`, multiplied by `multiplier` each time and capped at
/// `max_interval`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Bound on a single readiness probe
    pub probe_timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            multiplier: 2.0,
            probe_timeout: Duration::from_secs(1),
        }
    }
}

impl ReadinessConfig {
    /// Delay that follows `current`.
    pub fn next_interval(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier.max(1.0))
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }

    fn validate(&self) -> Result<()> {
        if self.initial_interval.is_zero() {
            return Err(VibrioError::Validation(
                "readiness initial interval must be greater than zero".to_string(),
            ));
        }
        if self.max_interval < self.initial_interval {
            return Err(VibrioError::Validation(format!(
                "readiness max interval ({}ms) is below the initial interval ({}ms)",
                self.max_interval.as_millis(),
                self.initial_interval.as_millis()
            )));
        }
        check_multiplier("readiness backoff multiplier", self.multiplier)
    }
}

/// Backoff factors must be finite and must not shrink the wait.
fn check_multiplier(name: &str, multiplier: f64) -> Result<()> {
    if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(VibrioError::Validation(format!(
            "{} must be a finite number of at least 1, got {}",
            name, multiplier
        )));
    }
    Ok(())
}

/// Supervisor settings derived from a [`LazerConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Fixed loopback port; a free one is picked per launch when `None`
    pub port: Option<u16>,
    pub startup_timeout: Duration,
    pub readiness: ReadinessConfig,
    pub health: HealthCheckConfig,
    /// Time between SIGTERM and SIGKILL on shutdown
    pub shutdown_grace: Duration,
    pub max_restart_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        LazerConfig::default().supervisor_config()
    }
}

/// Configuration for a [`Lazer`](crate::Lazer) or [`LazerAsync`](crate::LazerAsync) session.
///
/// # Example
///
/// ```
/// use vibrio::LazerConfig;
/// use std::time::Duration;
///
/// let config = LazerConfig::new()
///     .with_executable("/opt/vibrio/Vibrio")
///     .with_startup_timeout(Duration::from_secs(10))
///     .with_max_restart_attempts(2);
/// assert_eq!(config.max_restart_attempts, 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct LazerConfig {
    /// Engine binary; resolved from the environment or the install layout when `None`
    pub executable: Option<PathBuf>,
    pub port: Option<u16>,
    pub startup_timeout: Duration,
    /// Bound on one HTTP attempt, including the body read
    pub request_timeout: Duration,
    /// Restart cycles tried when a dispatch finds the engine gone
    pub max_restart_attempts: u32,
    pub retry: RetryConfig,
    pub readiness: ReadinessConfig,
    pub health: HealthCheckConfig,
    pub shutdown_grace: Duration,
    /// Extra arguments appended after `--urls`
    pub engine_args: Vec<String>,
    pub engine_env: Vec<(String, String)>,
    /// Forward engine stdout/stderr to tracing under target `vibrio::engine`
    pub log_engine_output: bool,
}

impl Default for LazerConfig {
    fn default() -> Self {
        Self {
            executable: None,
            port: None,
            startup_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            max_restart_attempts: 1,
            retry: RetryConfig::default(),
            readiness: ReadinessConfig::default(),
            health: HealthCheckConfig::default(),
            shutdown_grace: Duration::from_secs(5),
            engine_args: Vec::new(),
            engine_env: Vec::new(),
            log_engine_output: false,
        }
    }
}

impl LazerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with the `VIBRIO_*` environment variables.
    ///
    /// # Errors
    ///
    /// `Validation` if a numeric variable does not parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = env::var_os(ENGINE_PATH_ENV) {
            config.executable = Some(PathBuf::from(path));
        }
        if let Some(ms) = env_number(STARTUP_TIMEOUT_ENV)? {
            config.startup_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number(REQUEST_TIMEOUT_ENV)? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_number(MAX_RESTARTS_ENV)? {
            config.max_restart_attempts = u32::try_from(n).map_err(|_| {
                VibrioError::Validation(format!("{} is out of range: {}", MAX_RESTARTS_ENV, n))
            })?;
        }
        Ok(config)
    }

    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_restart_attempts(mut self, attempts: u32) -> Self {
        self.max_restart_attempts = attempts;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessConfig) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_health(mut self, health: HealthCheckConfig) -> Self {
        self.health = health;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_engine_arg(mut self, arg: impl Into<String>) -> Self {
        self.engine_args.push(arg.into());
        self
    }

    pub fn with_engine_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.engine_env.push((key.into(), value.into()));
        self
    }

    pub fn with_engine_output_logged(mut self, enabled: bool) -> Self {
        self.log_engine_output = enabled;
        self
    }

    /// Checks the timing fields.
    ///
    /// # Errors
    ///
    /// `Validation` if a timeout or the health interval is zero, the health
    /// failure threshold is zero, or a backoff schedule is malformed (zero or
    /// inverted readiness intervals, a multiplier below 1 or not finite).
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("startup timeout", self.startup_timeout),
            ("request timeout", self.request_timeout),
            ("readiness probe timeout", self.readiness.probe_timeout),
            ("health check interval", self.health.interval),
            ("health check timeout", self.health.timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(VibrioError::Validation(format!("{} must be greater than zero", name)));
            }
        }
        if self.health.failure_threshold == 0 {
            return Err(VibrioError::Validation(
                "health check failure threshold must be at least 1".to_string(),
            ));
        }
        self.readiness.validate()?;
        check_multiplier("retry backoff multiplier", self.retry.backoff_multiplier)
    }

    /// Locates the engine binary.
    ///
    /// Order: the configured path, then `VIBRIO_ENGINE_PATH`, then
    /// `lib/Vibrio` next to the running executable.
    ///
    /// # Errors
    ///
    /// `EngineStartup` if the resolved path does not exist.
    pub fn resolve_executable(&self) -> Result<PathBuf> {
        let path = match &self.executable {
            Some(path) => path.clone(),
            None => match env::var_os(ENGINE_PATH_ENV) {
                Some(path) => PathBuf::from(path),
                None => default_executable()?,
            },
        };
        if !path.is_file() {
            return Err(VibrioError::EngineStartup(format!(
                "engine executable not found at {}",
                path.display()
            )));
        }
        Ok(path)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            request_timeout: self.request_timeout,
            retry: self.retry.clone(),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            port: self.port,
            startup_timeout: self.startup_timeout,
            readiness: self.readiness.clone(),
            health: self.health.clone(),
            shutdown_grace: self.shutdown_grace,
            max_restart_attempts: self.max_restart_attempts,
        }
    }
}

fn default_executable() -> Result<PathBuf> {
    let current = env::current_exe().map_err(|e| {
        VibrioError::EngineStartup(format!("cannot determine current executable: {}", e))
    })?;
    let dir = current.parent().ok_or_else(|| {
        VibrioError::EngineStartup(format!("{} has no parent directory", current.display()))
    })?;
    Ok(dir
        .join("lib")
        .join(format!("{}{}", ENGINE_EXECUTABLE, env::consts::EXE_SUFFIX)))
}

fn env_number(key: &str) -> Result<Option<u64>> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| VibrioError::Validation(format!("{}={:?} is not a number: {}", key, value, e))),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(VibrioError::Validation(format!(
            "{} is not valid unicode",
            key
        ))),
    }
}

//! Vibrio
//!
//! osu! difficulty and performance calculations backed by a supervised local
//! engine process.
//!
//! The engine is an external executable speaking HTTP on a loopback port. This
//! crate launches it on demand, waits for it to become ready, routes typed
//! calculation requests to it and keeps it alive: a crashed or unresponsive
//! engine is detected and restarted transparently on the next call.
//!
//! # Components
//!
//! - [`LazerAsync`] / [`Lazer`] - async and blocking sessions
//! - [`LazerConfig`] - timeouts, retry and restart policy, engine location
//! - [`Supervisor`] - engine lifecycle and crash recovery
//! - [`HealthChecker`] - periodic liveness probe
//! - [`launcher`] - the seam between the supervisor and the OS process

mod client;
pub mod config;
pub mod health_checker;
pub mod launcher;
pub mod lazer;
pub mod supervisor;

pub use config::{LazerConfig, ReadinessConfig, SupervisorConfig};
pub use health_checker::{HealthCheckConfig, HealthChecker};
pub use launcher::{ChildProcess, EngineLauncher, EngineProcess, ProcessLauncher};
pub use lazer::{Lazer, LazerAsync};
pub use supervisor::{EngineHandle, EngineStatus, SessionState, Supervisor};

pub use vibrio_common::protocol::{
    BeatmapRef, CalculationKind, CalculationRequest, CalculationResult, DifficultyAttributes,
    HitStatistics, ModSet, OsuMod, PerformanceAttributes, Result, VibrioError,
};
pub use vibrio_common::transport::RetryConfig;

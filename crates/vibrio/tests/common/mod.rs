//! Shared helpers for the integration tests.
//!
//! Every test drives the `vibrio-stub-engine` binary built alongside these
//! tests, configured through `STUB_*` environment variables.

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use vibrio::{
    CalculationRequest, HitStatistics, LazerAsync, LazerConfig, OsuMod, ReadinessConfig,
    RetryConfig, SessionState,
};

pub fn stub_engine() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_vibrio-stub-engine"))
}

/// Stub-backed config with short timeouts.
pub fn test_config() -> LazerConfig {
    LazerConfig::new()
        .with_executable(stub_engine())
        .with_startup_timeout(Duration::from_secs(10))
        .with_request_timeout(Duration::from_secs(5))
        .with_shutdown_grace(Duration::from_secs(2))
        .with_retry(RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 20,
            max_backoff_ms: 200,
            backoff_multiplier: 2.0,
        })
        .with_readiness(ReadinessConfig {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(200),
            multiplier: 2.0,
            probe_timeout: Duration::from_millis(500),
        })
}

/// The 1001682 HD+DT play used throughout the tests.
pub fn example_request() -> CalculationRequest {
    CalculationRequest::by_id(1001682)
        .with_mods([OsuMod::Hidden, OsuMod::DoubleTime])
        .with_hit_stats(HitStatistics::new(2019, 104, 0, 3, 3141))
}

#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(unix)]
pub fn send_signal(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), signal).unwrap();
}

pub fn port_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

pub fn free_port() -> u16 {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Polls `check` every 10ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub async fn wait_for_state(lazer: &LazerAsync, state: SessionState, timeout: Duration) -> bool {
    eventually(timeout, || lazer.state() == state).await
}

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};
use vibrio_common::transport::HttpTransport;

use crate::supervisor::{EngineHandle, StatusCell};

/// Health check configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_millis(2000),
            failure_threshold: 3,
        }
    }
}

/// Periodic liveness probe for one engine generation.
///
/// Exits as soon as that generation stops being the live `Ready` engine,
/// either because it was degraded here, by the reaper, or replaced.
pub struct HealthChecker {
    status: StatusCell,
    transport: HttpTransport,
    handle: EngineHandle,
    config: HealthCheckConfig,
}

impl HealthChecker {
    pub(crate) fn new(
        status: StatusCell,
        transport: HttpTransport,
        handle: EngineHandle,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            status,
            transport,
            handle,
            config,
        }
    }

    /// Starts the health checker task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Main health check loop
    async fn run(self) {
        let generation = self.handle.generation;
        let mut interval =
            tokio::time::interval_at(Instant::now() + self.config.interval, self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            interval.tick().await;
            if !self.status.is_live(generation) {
                break;
            }

            match self.check().await {
                Ok(()) => {
                    if failures > 0 {
                        debug!(
                            "Engine generation {} healthy again after {} failed probe(s)",
                            generation, failures
                        );
                    }
                    failures = 0;
                    self.status.record_healthy(generation);
                }
                Err(reason) => {
                    failures += 1;
                    debug!(
                        "Health probe {}/{} for engine generation {} failed: {}",
                        failures, self.config.failure_threshold, generation, reason
                    );
                    if failures >= self.config.failure_threshold {
                        if self.status.mark_degraded(generation) {
                            warn!(
                                "Engine generation {} (pid {}) failed {} consecutive health checks, marking degraded",
                                generation, self.handle.pid, failures
                            );
                        }
                        break;
                    }
                }
            }
        }
    }

    async fn check(&self) -> Result<(), String> {
        let response = self
            .transport
            .probe(&self.handle.base_url, self.config.timeout)
            .await
            .map_err(|e| e.to_string())?;
        if response.status.is_success() {
            Ok(())
        } else {
            Err(format!("status endpoint answered {}", response.status))
        }
    }
}

//! Dispatch core shared by the blocking and async facades.

use hyper::body::Bytes;
use tokio::sync::watch;
use tracing::{debug, warn};
use vibrio_common::protocol::error::{Result, VibrioError};
use vibrio_common::protocol::{
    CalculationRequest, CalculationResult, EngineCall, EngineCodec, RawResponse,
};
use vibrio_common::transport::HttpTransport;

use crate::launcher::EngineLauncher;
use crate::supervisor::{EngineStatus, SessionState, Supervisor};

/// Encodes requests, routes them to a ready engine and decodes the replies.
pub(crate) struct EngineClient<L: EngineLauncher> {
    supervisor: Supervisor<L>,
    transport: HttpTransport,
}

impl<L: EngineLauncher> EngineClient<L> {
    pub(crate) fn new(supervisor: Supervisor<L>, transport: HttpTransport) -> Self {
        Self {
            supervisor,
            transport,
        }
    }

    pub(crate) fn supervisor(&self) -> &Supervisor<L> {
        &self.supervisor
    }

    pub(crate) async fn calculate(&self, request: &CalculationRequest) -> Result<CalculationResult> {
        let call = EngineCodec::encode(request)?;
        let response = self.dispatch(&call).await?;
        EngineCodec::decode(request.kind(), &call, &response)
    }

    pub(crate) async fn has_beatmap(&self, beatmap_id: u32) -> Result<bool> {
        check_beatmap_id(beatmap_id)?;
        let call = EngineCall::beatmap_status(beatmap_id);
        let response = self.dispatch(&call).await?;
        EngineCodec::decode_beatmap_status(&call, &response)
    }

    pub(crate) async fn get_beatmap(&self, beatmap_id: u32) -> Result<Bytes> {
        check_beatmap_id(beatmap_id)?;
        let call = EngineCall::beatmap(beatmap_id);
        let response = self.dispatch(&call).await?;
        EngineCodec::decode_beatmap(&call, &response)
    }

    pub(crate) async fn clear_cache(&self) -> Result<()> {
        let call = EngineCall::clear_cache();
        let response = self.dispatch(&call).await?;
        EngineCodec::decode_empty(&call, &response)
    }

    /// Sends `call`, resolving to `EngineUnavailable` if the session closes first.
    async fn dispatch(&self, call: &EngineCall) -> Result<RawResponse> {
        let closed = wait_closed(self.supervisor.subscribe());
        tokio::select! {
            result = self.dispatch_with_recovery(call) => result,
            _ = closed => Err(VibrioError::EngineUnavailable("session closed".to_string())),
        }
    }

    /// One send, and on a transport failure against a dead engine, one
    /// recovery followed by one resend.
    async fn dispatch_with_recovery(&self, call: &EngineCall) -> Result<RawResponse> {
        let handle = self.supervisor.ensure_ready().await?;
        let err = match self.transport.send(&handle.base_url, call).await {
            Err(err @ VibrioError::Transport { .. }) => err,
            other => return other,
        };

        let probe_timeout = self.supervisor.config().health.timeout;
        let alive = match self.transport.probe(&handle.base_url, probe_timeout).await {
            Ok(response) => response.status.is_success(),
            Err(_) => false,
        };
        if alive {
            debug!(
                "{} {} failed but engine generation {} still answers: {}",
                call.method, call.path, handle.generation, err
            );
            return Err(err);
        }

        warn!(
            "{} {} failed and engine generation {} is unreachable, recovering: {}",
            call.method, call.path, handle.generation, err
        );
        self.supervisor.report_failure(handle.generation);
        let handle = self.supervisor.ensure_ready().await?;
        self.transport.send(&handle.base_url, call).await
    }
}

fn check_beatmap_id(beatmap_id: u32) -> Result<()> {
    if beatmap_id == 0 {
        return Err(VibrioError::Validation("beatmap id must be positive".to_string()));
    }
    Ok(())
}

async fn wait_closed(mut status: watch::Receiver<EngineStatus>) {
    let closed = status
        .wait_for(|s| s.state == SessionState::Closed)
        .await
        .is_ok();
    if !closed {
        // Sender gone: the supervisor is being dropped, never resolve here.
        std::future::pending::<()>().await;
    }
}

use thiserror::Error;

/// Every failure a Vibrio session can surface.
///
/// The variants map one-to-one onto the stage that produced them, so callers
/// can tell bad input apart from a dead engine and from an engine that
/// answered with something unreadable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VibrioError {
    /// The request was rejected before (or by) the engine because the input
    /// itself is invalid. Never retried.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The engine process could not be spawned or never became ready.
    #[error("Engine failed to start: {0}")]
    EngineStartup(String),

    /// The engine is gone and recovery was exhausted, or the session is closed.
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The network call failed after all retry attempts.
    #[error("Transport error after {attempts} attempt(s): {cause}")]
    Transport { attempts: u32, cause: String },

    /// The engine answered, but the answer does not match the expected protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The engine could not find the requested beatmap.
    #[error("No beatmap found for id {0}")]
    BeatmapNotFound(u32),
}

impl VibrioError {
    /// Only transport failures may succeed when the same call is repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VibrioError::Transport { .. })
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        VibrioError::Protocol(format!(
            "{} (engine protocol v{})",
            message.into(),
            super::ENGINE_PROTOCOL_VERSION
        ))
    }
}

impl From<serde_json::Error> for VibrioError {
    fn from(err: serde_json::Error) -> Self {
        VibrioError::protocol(format!("malformed JSON response: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, VibrioError>;

pub mod codec;
pub mod error;
pub mod mods;
pub mod requests;
pub mod responses;
pub mod wire;

#[cfg(test)]
mod tests;

/// Engine wire-protocol version this crate encodes and decodes.
pub const ENGINE_PROTOCOL_VERSION: u32 = 1;

pub use codec::EngineCodec;
pub use error::{Result, VibrioError};
pub use mods::{ModSet, OsuMod};
pub use requests::{BeatmapRef, CalculationKind, CalculationRequest, HitStatistics, RequestSource};
pub use responses::{CalculationResult, DifficultyAttributes, PerformanceAttributes};
pub use wire::{CallBody, EngineCall, Multipart, RawResponse, STATUS_PATH};

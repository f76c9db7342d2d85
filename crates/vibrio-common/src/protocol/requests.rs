//! Calculation requests as built by callers.

use hyper::body::Bytes;
use serde::{Deserialize, Serialize};

use super::error::{Result, VibrioError};
use super::mods::ModSet;
use super::responses::DifficultyAttributes;

/// Identifies the beatmap a calculation runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeatmapRef {
    /// Online beatmap id, resolved by the engine's beatmap source.
    Id(u32),
    /// Raw `.osu` file content, uploaded with the request.
    Content(Bytes),
}

impl BeatmapRef {
    pub fn id(&self) -> Option<u32> {
        match self {
            BeatmapRef::Id(id) => Some(*id),
            BeatmapRef::Content(_) => None,
        }
    }
}

impl From<u32> for BeatmapRef {
    fn from(id: u32) -> Self {
        BeatmapRef::Id(id)
    }
}

/// Judgement counts and max combo of a play.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HitStatistics {
    pub count_300: u32,
    pub count_100: u32,
    pub count_50: u32,
    pub count_miss: u32,
    pub combo: u32,
}

impl HitStatistics {
    pub fn new(count_300: u32, count_100: u32, count_50: u32, count_miss: u32, combo: u32) -> Self {
        Self {
            count_300,
            count_100,
            count_50,
            count_miss,
            combo,
        }
    }

    /// Total number of judged hit objects.
    pub fn judgements(&self) -> u64 {
        self.count_300 as u64 + self.count_100 as u64 + self.count_50 as u64 + self.count_miss as u64
    }

    /// osu! standard accuracy in `[0, 1]`, or `None` when nothing was judged.
    pub fn accuracy(&self) -> Option<f64> {
        let total = self.judgements();
        if total == 0 {
            return None;
        }
        let points = 300 * self.count_300 as u64 + 100 * self.count_100 as u64 + 50 * self.count_50 as u64;
        Some(points as f64 / (300 * total) as f64)
    }

    /// Parses a JSON object such as `{"count_300": 2019, ..., "combo": 3141}`.
    ///
    /// Negative or non-integer counts are rejected as [`VibrioError::Validation`].
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|err| VibrioError::Validation(format!("invalid hit statistics: {}", err)))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.judgements() == 0 {
            return Err(VibrioError::Validation(
                "hit statistics must contain at least one judgement".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where the beatmap side of a calculation comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestSource {
    Beatmap(BeatmapRef),
    /// Previously computed difficulty attributes; skips beatmap processing.
    Difficulty(DifficultyAttributes),
}

/// What kind of result a request produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalculationKind {
    Difficulty,
    Performance,
}

/// An immutable calculation request.
///
/// Without hit statistics or a replay the request yields difficulty
/// attributes; with either it yields performance attributes.
///
/// # Example
///
/// ```
/// use vibrio_common::protocol::{CalculationRequest, HitStatistics, OsuMod};
///
/// let request = CalculationRequest::by_id(1001682)
///     .with_mods([OsuMod::Hidden, OsuMod::DoubleTime])
///     .with_hit_stats(HitStatistics::new(2019, 104, 0, 3, 3141));
/// assert!(request.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CalculationRequest {
    source: RequestSource,
    mods: ModSet,
    hit_stats: Option<HitStatistics>,
    replay: Option<Bytes>,
}

impl CalculationRequest {
    pub fn new(beatmap: BeatmapRef) -> Self {
        Self {
            source: RequestSource::Beatmap(beatmap),
            mods: ModSet::new(),
            hit_stats: None,
            replay: None,
        }
    }

    pub fn by_id(beatmap_id: u32) -> Self {
        Self::new(BeatmapRef::Id(beatmap_id))
    }

    pub fn by_content(content: impl Into<Bytes>) -> Self {
        Self::new(BeatmapRef::Content(content.into()))
    }

    /// Performance from difficulty attributes. Mods are taken from `difficulty`.
    pub fn from_difficulty(difficulty: DifficultyAttributes) -> Self {
        Self {
            source: RequestSource::Difficulty(difficulty),
            mods: ModSet::new(),
            hit_stats: None,
            replay: None,
        }
    }

    pub fn with_mods(mut self, mods: impl Into<ModSet>) -> Self {
        self.mods = mods.into();
        self
    }

    pub fn with_hit_stats(mut self, hit_stats: HitStatistics) -> Self {
        self.hit_stats = Some(hit_stats);
        self
    }

    /// Score the play recorded in an `.osr` replay instead of explicit statistics.
    pub fn with_replay(mut self, replay: impl Into<Bytes>) -> Self {
        self.replay = Some(replay.into());
        self
    }

    pub fn source(&self) -> &RequestSource {
        &self.source
    }

    pub fn beatmap(&self) -> Option<&BeatmapRef> {
        match &self.source {
            RequestSource::Beatmap(beatmap) => Some(beatmap),
            RequestSource::Difficulty(_) => None,
        }
    }

    pub fn mods(&self) -> &ModSet {
        &self.mods
    }

    pub fn hit_stats(&self) -> Option<&HitStatistics> {
        self.hit_stats.as_ref()
    }

    pub fn replay(&self) -> Option<&Bytes> {
        self.replay.as_ref()
    }

    pub fn kind(&self) -> CalculationKind {
        if self.hit_stats.is_some() || self.replay.is_some() {
            CalculationKind::Performance
        } else {
            CalculationKind::Difficulty
        }
    }

    /// Checks everything that can be checked without contacting the engine.
    pub fn validate(&self) -> Result<()> {
        self.mods.validate()?;

        match &self.source {
            RequestSource::Beatmap(BeatmapRef::Id(0)) => {
                return Err(VibrioError::Validation("beatmap id must be positive".to_string()));
            }
            RequestSource::Beatmap(BeatmapRef::Content(content)) if content.is_empty() => {
                return Err(VibrioError::Validation("beatmap content is empty".to_string()));
            }
            RequestSource::Beatmap(_) => {}
            RequestSource::Difficulty(difficulty) => {
                difficulty.mods.validate()?;
                if self.hit_stats.is_none() {
                    return Err(VibrioError::Validation(
                        "performance from difficulty attributes requires hit statistics".to_string(),
                    ));
                }
                if !self.mods.is_empty() {
                    return Err(VibrioError::Validation(
                        "mods are taken from the difficulty attributes".to_string(),
                    ));
                }
                if self.replay.is_some() {
                    return Err(VibrioError::Validation(
                        "a replay cannot be scored against difficulty attributes".to_string(),
                    ));
                }
            }
        }

        if let Some(replay) = &self.replay {
            if replay.is_empty() {
                return Err(VibrioError::Validation("replay content is empty".to_string()));
            }
            if self.hit_stats.is_some() {
                return Err(VibrioError::Validation(
                    "a replay and hit statistics are mutually exclusive".to_string(),
                ));
            }
            if !self.mods.is_empty() {
                return Err(VibrioError::Validation(
                    "replays carry their own mods".to_string(),
                ));
            }
        }

        if let Some(hit_stats) = &self.hit_stats {
            hit_stats.validate()?;
        }

        Ok(())
    }
}

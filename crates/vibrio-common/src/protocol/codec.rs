//! Encoding of calculation requests into engine calls and decoding of replies.
//!
//! The engine speaks plain HTTP: inputs go in the path and query string (or a
//! multipart upload for file content) and results come back as a flat JSON
//! object. Response keys are matched case-insensitively with underscores
//! ignored, so `starRating`, `star_rating` and `StarRating` all resolve to the
//! same field. Every field is required; anything missing is reported as a
//! protocol mismatch instead of being defaulted.

use hyper::body::Bytes;
use hyper::StatusCode;
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::error::{Result, VibrioError};
use super::mods::{ModSet, OsuMod};
use super::requests::{BeatmapRef, CalculationKind, CalculationRequest, HitStatistics, RequestSource};
use super::responses::{CalculationResult, DifficultyAttributes, PerformanceAttributes};
use super::wire::{EngineCall, Multipart, RawResponse};

/// Stateless codec for the engine's HTTP API.
pub struct EngineCodec;

impl EngineCodec {
    /// Validates `request` and encodes it into an engine call.
    ///
    /// Validation failures are returned before anything is built, so an
    /// invalid request never costs a round trip.
    pub fn encode(request: &CalculationRequest) -> Result<EngineCall> {
        request.validate()?;

        let call = match (request.source(), request.kind()) {
            (RequestSource::Beatmap(BeatmapRef::Id(id)), CalculationKind::Difficulty) => {
                EngineCall::get(format!("/api/difficulty/{}", id)).for_beatmap(*id)
            }
            (RequestSource::Beatmap(BeatmapRef::Content(content)), CalculationKind::Difficulty) => {
                EngineCall::post("/api/difficulty").with_body(
                    Multipart::new()
                        .file("beatmap", "beatmap.osu", content.clone())
                        .into_body(),
                )
            }
            (RequestSource::Beatmap(BeatmapRef::Id(id)), CalculationKind::Performance) => {
                match request.replay() {
                    Some(replay) => EngineCall::post(format!("/api/performance/replay/{}", id))
                        .for_beatmap(*id)
                        .with_body(
                            Multipart::new()
                                .file("replay", "replay.osr", replay.clone())
                                .into_body(),
                        ),
                    None => EngineCall::get(format!("/api/performance/{}", id)).for_beatmap(*id),
                }
            }
            (RequestSource::Beatmap(BeatmapRef::Content(content)), CalculationKind::Performance) => {
                match request.replay() {
                    Some(replay) => EngineCall::post("/api/performance/replay").with_body(
                        Multipart::new()
                            .file("beatmap", "beatmap.osu", content.clone())
                            .file("replay", "replay.osr", replay.clone())
                            .into_body(),
                    ),
                    None => EngineCall::post("/api/performance").with_body(
                        Multipart::new()
                            .file("beatmap", "beatmap.osu", content.clone())
                            .into_body(),
                    ),
                }
            }
            (RequestSource::Difficulty(difficulty), _) => {
                encode_difficulty(EngineCall::get("/api/performance"), difficulty)
            }
        };

        let call = encode_mods(call, request.mods());
        Ok(match request.hit_stats() {
            Some(hit_stats) => encode_hit_stats(call, hit_stats),
            None => call,
        })
    }

    /// Decodes the engine's reply to a call produced by [`encode`](Self::encode).
    pub fn decode(
        kind: CalculationKind,
        call: &EngineCall,
        response: &RawResponse,
    ) -> Result<CalculationResult> {
        Self::check_status(call, response)?;
        let fields = Fields::parse(&response.body)?;
        Ok(match kind {
            CalculationKind::Difficulty => CalculationResult::Difficulty(fields.difficulty()?),
            CalculationKind::Performance => CalculationResult::Performance(fields.performance()?),
        })
    }

    /// Maps non-success statuses onto the error taxonomy.
    ///
    /// A 404 on an id-addressed call means the beatmap source had nothing for
    /// that id; any other 4xx is the engine rejecting our input; everything
    /// else is an engine-side failure.
    pub fn check_status(call: &EngineCall, response: &RawResponse) -> Result<()> {
        let status = response.status;
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND {
            if let Some(id) = call.beatmap_id {
                return Err(VibrioError::BeatmapNotFound(id));
            }
        }
        let text = response.text();
        let detail = if text.is_empty() {
            format!("status {}", status.as_u16())
        } else {
            format!("status {}: {}", status.as_u16(), text)
        };
        if status.is_client_error() {
            Err(VibrioError::Validation(format!("engine rejected request with {}", detail)))
        } else {
            Err(VibrioError::protocol(format!("unexpected engine response with {}", detail)))
        }
    }

    /// `true` when the beatmap is cached by the engine.
    pub fn decode_beatmap_status(call: &EngineCall, response: &RawResponse) -> Result<bool> {
        match response.status {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Self::check_status(call, response).map(|_| true),
        }
    }

    pub fn decode_beatmap(call: &EngineCall, response: &RawResponse) -> Result<Bytes> {
        Self::check_status(call, response)?;
        Ok(response.body.clone())
    }

    pub fn decode_empty(call: &EngineCall, response: &RawResponse) -> Result<()> {
        Self::check_status(call, response)
    }
}

fn encode_mods(call: EngineCall, mods: &ModSet) -> EngineCall {
    mods.iter().fold(call, |call, m| call.with_query("mods", m.acronym()))
}

fn encode_hit_stats(call: EngineCall, hit_stats: &HitStatistics) -> EngineCall {
    call.with_query("count300", hit_stats.count_300)
        .with_query("count100", hit_stats.count_100)
        .with_query("count50", hit_stats.count_50)
        .with_query("countmiss", hit_stats.count_miss)
        .with_query("combo", hit_stats.combo)
}

fn encode_difficulty(call: EngineCall, d: &DifficultyAttributes) -> EngineCall {
    encode_mods(call, &d.mods)
        .with_query("starrating", d.star_rating)
        .with_query("maxcombo", d.max_combo)
        .with_query("aimdifficulty", d.aim_difficulty)
        .with_query("speeddifficulty", d.speed_difficulty)
        .with_query("speednotecount", d.speed_note_count)
        .with_query("flashlightdifficulty", d.flashlight_difficulty)
        .with_query("sliderfactor", d.slider_factor)
        .with_query("approachrate", d.approach_rate)
        .with_query("overalldifficulty", d.overall_difficulty)
        .with_query("drainrate", d.drain_rate)
        .with_query("hitcirclecount", d.hit_circle_count)
        .with_query("slidercount", d.slider_count)
        .with_query("spinnercount", d.spinner_count)
}

/// Response object with normalised keys.
struct Fields(HashMap<String, Value>);

fn normalize(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

impl Fields {
    fn parse(body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)?;
        let object: Map<String, Value> = match value {
            Value::Object(object) => object,
            other => {
                return Err(VibrioError::protocol(format!(
                    "expected a JSON object, got {}",
                    json_type(&other)
                )))
            }
        };
        Ok(Fields(
            object.into_iter().map(|(k, v)| (normalize(&k), v)).collect(),
        ))
    }

    fn get(&self, name: &str) -> Result<&Value> {
        self.0
            .get(&normalize(name))
            .ok_or_else(|| VibrioError::protocol(format!("missing field `{}`", name)))
    }

    fn f64(&self, name: &str) -> Result<f64> {
        let value = self.get(name)?;
        value.as_f64().ok_or_else(|| {
            VibrioError::protocol(format!("field `{}` is {}, expected a number", name, json_type(value)))
        })
    }

    fn u32(&self, name: &str) -> Result<u32> {
        let value = self.get(name)?;
        value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| {
                VibrioError::protocol(format!(
                    "field `{}` is {}, expected a non-negative integer",
                    name, value
                ))
            })
    }

    fn mods(&self, name: &str) -> Result<ModSet> {
        let value = self.get(name)?;
        let items = value.as_array().ok_or_else(|| {
            VibrioError::protocol(format!("field `{}` is {}, expected an array", name, json_type(value)))
        })?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .and_then(|s| s.parse::<OsuMod>().ok())
                    .ok_or_else(|| VibrioError::protocol(format!("unknown mod {} in `{}`", item, name)))
            })
            .collect()
    }

    fn difficulty(&self) -> Result<DifficultyAttributes> {
        Ok(DifficultyAttributes {
            mods: self.mods("mods")?,
            star_rating: self.f64("star_rating")?,
            max_combo: self.u32("max_combo")?,
            aim_difficulty: self.f64("aim_difficulty")?,
            speed_difficulty: self.f64("speed_difficulty")?,
            speed_note_count: self.f64("speed_note_count")?,
            flashlight_difficulty: self.f64("flashlight_difficulty")?,
            slider_factor: self.f64("slider_factor")?,
            approach_rate: self.f64("approach_rate")?,
            overall_difficulty: self.f64("overall_difficulty")?,
            drain_rate: self.f64("drain_rate")?,
            hit_circle_count: self.u32("hit_circle_count")?,
            slider_count: self.u32("slider_count")?,
            spinner_count: self.u32("spinner_count")?,
        })
    }

    fn performance(&self) -> Result<PerformanceAttributes> {
        Ok(PerformanceAttributes {
            total: self.f64("total")?,
            aim: self.f64("aim")?,
            speed: self.f64("speed")?,
            accuracy: self.f64("accuracy")?,
            flashlight: self.f64("flashlight")?,
            effective_miss_count: self.f64("effective_miss_count")?,
        })
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

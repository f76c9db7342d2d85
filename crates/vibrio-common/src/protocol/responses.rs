//! Calculation results returned by the engine.

use serde::{Deserialize, Serialize};

use super::mods::ModSet;

/// Difficulty attributes of a beatmap under a set of mods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifficultyAttributes {
    pub mods: ModSet,
    pub star_rating: f64,
    pub max_combo: u32,
    pub aim_difficulty: f64,
    pub speed_difficulty: f64,
    pub speed_note_count: f64,
    pub flashlight_difficulty: f64,
    pub slider_factor: f64,
    pub approach_rate: f64,
    pub overall_difficulty: f64,
    pub drain_rate: f64,
    pub hit_circle_count: u32,
    pub slider_count: u32,
    pub spinner_count: u32,
}

/// Performance point breakdown of a play.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAttributes {
    pub total: f64,
    pub aim: f64,
    pub speed: f64,
    pub accuracy: f64,
    pub flashlight: f64,
    pub effective_miss_count: f64,
}

/// Result of a [`CalculationRequest`](super::CalculationRequest).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CalculationResult {
    Difficulty(DifficultyAttributes),
    Performance(PerformanceAttributes),
}

impl CalculationResult {
    pub fn difficulty(&self) -> Option<&DifficultyAttributes> {
        match self {
            CalculationResult::Difficulty(attributes) => Some(attributes),
            CalculationResult::Performance(_) => None,
        }
    }

    pub fn performance(&self) -> Option<&PerformanceAttributes> {
        match self {
            CalculationResult::Performance(attributes) => Some(attributes),
            CalculationResult::Difficulty(_) => None,
        }
    }

    pub fn into_difficulty(self) -> Option<DifficultyAttributes> {
        match self {
            CalculationResult::Difficulty(attributes) => Some(attributes),
            CalculationResult::Performance(_) => None,
        }
    }

    pub fn into_performance(self) -> Option<PerformanceAttributes> {
        match self {
            CalculationResult::Performance(attributes) => Some(attributes),
            CalculationResult::Difficulty(_) => None,
        }
    }
}

//! Gameplay modifiers and the deduplicated set sent with a calculation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use super::error::VibrioError;

/// An osu! standard gameplay modifier, identified on the wire by its acronym.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OsuMod {
    #[serde(rename = "NF")]
    NoFail,
    #[serde(rename = "EZ")]
    Easy,
    #[serde(rename = "TD")]
    TouchDevice,
    #[serde(rename = "HD")]
    Hidden,
    #[serde(rename = "HR")]
    HardRock,
    #[serde(rename = "SD")]
    SuddenDeath,
    #[serde(rename = "DT")]
    DoubleTime,
    #[serde(rename = "RX")]
    Relax,
    #[serde(rename = "HT")]
    HalfTime,
    #[serde(rename = "NC")]
    Nightcore,
    #[serde(rename = "FL")]
    Flashlight,
    #[serde(rename = "AT")]
    Autoplay,
    #[serde(rename = "SO")]
    SpunOut,
    #[serde(rename = "AP")]
    Autopilot,
    #[serde(rename = "PF")]
    Perfect,
}

/// Pairs of mods the engine refuses to combine.
const INCOMPATIBLE: &[(OsuMod, OsuMod)] = &[
    (OsuMod::Easy, OsuMod::HardRock),
    (OsuMod::HalfTime, OsuMod::DoubleTime),
    (OsuMod::HalfTime, OsuMod::Nightcore),
    (OsuMod::DoubleTime, OsuMod::Nightcore),
    (OsuMod::NoFail, OsuMod::SuddenDeath),
    (OsuMod::NoFail, OsuMod::Perfect),
    (OsuMod::SuddenDeath, OsuMod::Perfect),
    (OsuMod::Relax, OsuMod::Autopilot),
    (OsuMod::Autoplay, OsuMod::Relax),
    (OsuMod::Autoplay, OsuMod::Autopilot),
    (OsuMod::Autoplay, OsuMod::SuddenDeath),
    (OsuMod::Autoplay, OsuMod::Perfect),
    (OsuMod::SpunOut, OsuMod::Autopilot),
];

impl OsuMod {
    pub const ALL: [OsuMod; 15] = [
        OsuMod::NoFail,
        OsuMod::Easy,
        OsuMod::TouchDevice,
        OsuMod::Hidden,
        OsuMod::HardRock,
        OsuMod::SuddenDeath,
        OsuMod::DoubleTime,
        OsuMod::Relax,
        OsuMod::HalfTime,
        OsuMod::Nightcore,
        OsuMod::Flashlight,
        OsuMod::Autoplay,
        OsuMod::SpunOut,
        OsuMod::Autopilot,
        OsuMod::Perfect,
    ];

    /// Two-letter acronym used by the engine.
    pub fn acronym(self) -> &'static str {
        match self {
            OsuMod::NoFail => "NF",
            OsuMod::Easy => "EZ",
            OsuMod::TouchDevice => "TD",
            OsuMod::Hidden => "HD",
            OsuMod::HardRock => "HR",
            OsuMod::SuddenDeath => "SD",
            OsuMod::DoubleTime => "DT",
            OsuMod::Relax => "RX",
            OsuMod::HalfTime => "HT",
            OsuMod::Nightcore => "NC",
            OsuMod::Flashlight => "FL",
            OsuMod::Autoplay => "AT",
            OsuMod::SpunOut => "SO",
            OsuMod::Autopilot => "AP",
            OsuMod::Perfect => "PF",
        }
    }

    pub fn is_compatible_with(self, other: OsuMod) -> bool {
        !INCOMPATIBLE
            .iter()
            .any(|&(a, b)| (a == self && b == other) || (a == other && b == self))
    }
}

impl fmt::Display for OsuMod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.acronym())
    }
}

impl FromStr for OsuMod {
    type Err = VibrioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OsuMod::ALL
            .into_iter()
            .find(|m| m.acronym().eq_ignore_ascii_case(s))
            .ok_or_else(|| VibrioError::Validation(format!("unknown mod acronym '{}'", s)))
    }
}

/// An order-insensitive, deduplicated set of mods.
///
/// Iteration follows the engine's canonical mod order, so two sets built from
/// the same mods in a different order encode identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModSet(BTreeSet<OsuMod>);

impl ModSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, m: OsuMod) -> bool {
        self.0.insert(m)
    }

    pub fn contains(&self, m: OsuMod) -> bool {
        self.0.contains(&m)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = OsuMod> + '_ {
        self.0.iter().copied()
    }

    /// Acronyms in canonical order.
    pub fn acronyms(&self) -> Vec<&'static str> {
        self.iter().map(OsuMod::acronym).collect()
    }

    /// Rejects sets containing a mutually exclusive pair.
    pub fn validate(&self) -> Result<(), VibrioError> {
        let mods: Vec<OsuMod> = self.iter().collect();
        for (i, &a) in mods.iter().enumerate() {
            for &b in &mods[i + 1..] {
                if !a.is_compatible_with(b) {
                    return Err(VibrioError::Validation(format!(
                        "mods {} and {} cannot be combined",
                        a, b
                    )));
                }
            }
        }
        Ok(())
    }
}

impl FromIterator<OsuMod> for ModSet {
    fn from_iter<I: IntoIterator<Item = OsuMod>>(iter: I) -> Self {
        ModSet(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[OsuMod; N]> for ModSet {
    fn from(mods: [OsuMod; N]) -> Self {
        mods.into_iter().collect()
    }
}

impl From<Vec<OsuMod>> for ModSet {
    fn from(mods: Vec<OsuMod>) -> Self {
        mods.into_iter().collect()
    }
}

impl fmt::Display for ModSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NM");
        }
        for m in self.iter() {
            f.write_str(m.acronym())?;
        }
        Ok(())
    }
}

//! Nutrient unit normalization
//!
//! Values arrive in whatever unit the label used (kJ, Cal, mg, µg, ...)
//! and are converted to the canonical unit of the nutrient they describe:
//! energy in kcal, macros in g, minerals in mg, vitamin A in µg.
//! Normalization is idempotent: feeding a canonical measurement back in
//! returns it unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

/// kJ to kcal conversion factor
const KJ_TO_KCAL: f64 = 0.239;

/// Canonical unit set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "kcal")]
    Kcal,
    #[serde(rename = "g")]
    Gram,
    #[serde(rename = "mg")]
    Milligram,
    #[serde(rename = "µg")]
    Microgram,
}

impl Unit {
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Kcal => "kcal",
            Unit::Gram => "g",
            Unit::Milligram => "mg",
            Unit::Microgram => "µg",
        }
    }

    /// Mass in micrograms, for cross-unit scaling. Energy has no mass
    /// scale and returns `None`.
    fn micrograms(&self) -> Option<f64> {
        match self {
            Unit::Kcal => None,
            Unit::Gram => Some(1_000_000.0),
            Unit::Milligram => Some(1_000.0),
            Unit::Microgram => Some(1.0),
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// A normalized `{value, unit}` pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    pub unit: Unit,
}

impl Measurement {
    pub fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }
}

/// Source units recognized on labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawUnit {
    Kj,
    Kcal,
    Gram,
    Milligram,
    Microgram,
}

fn parse_unit(s: &str) -> Option<RawUnit> {
    match s.trim().to_lowercase().as_str() {
        "kj" | "千焦" => Some(RawUnit::Kj),
        "kcal" | "cal" | "calories" | "大卡" | "千卡" => Some(RawUnit::Kcal),
        "g" | "gram" | "grams" | "克" => Some(RawUnit::Gram),
        "mg" | "毫克" => Some(RawUnit::Milligram),
        "µg" | "μg" | "ug" | "mcg" | "微克" => Some(RawUnit::Microgram),
        _ => None,
    }
}

/// Convert `value` expressed in `unit` to the canonical `target` unit.
///
/// Returns `None` when the unit is unknown or dimensionally incompatible
/// with the target (mass vs energy).
pub fn normalize(value: f64, unit: &str, target: Unit) -> Option<Measurement> {
    let raw = parse_unit(unit)?;
    let converted = match (raw, target) {
        (RawUnit::Kj, Unit::Kcal) => value * KJ_TO_KCAL,
        (RawUnit::Kcal, Unit::Kcal) => value,
        (RawUnit::Gram, _) | (RawUnit::Milligram, _) | (RawUnit::Microgram, _) => {
            let source_ug = match raw {
                RawUnit::Gram => Unit::Gram.micrograms(),
                RawUnit::Milligram => Unit::Milligram.micrograms(),
                RawUnit::Microgram => Unit::Microgram.micrograms(),
                _ => None,
            }?;
            let target_ug = target.micrograms()?;
            value * source_ug / target_ug
        }
        _ => return None,
    };
    Some(Measurement::new(round2(converted), target))
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

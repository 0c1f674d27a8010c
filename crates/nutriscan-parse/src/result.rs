//! Structured parse results
//!
//! The tagged union every extractor produces. The server serializes these
//! verbatim into the job record's `result` field.

use crate::units::{Measurement, Unit};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Fixed nutrient vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Nutrient {
    Calories,
    Protein,
    Fat,
    Carbohydrates,
    Fiber,
    Sugar,
    Sodium,
    Calcium,
    Iron,
    VitaminC,
    VitaminA,
}

impl Nutrient {
    pub const ALL: [Nutrient; 11] = [
        Nutrient::Calories,
        Nutrient::Protein,
        Nutrient::Fat,
        Nutrient::Carbohydrates,
        Nutrient::Fiber,
        Nutrient::Sugar,
        Nutrient::Sodium,
        Nutrient::Calcium,
        Nutrient::Iron,
        Nutrient::VitaminC,
        Nutrient::VitaminA,
    ];

    /// Canonical unit each nutrient normalizes to.
    pub fn canonical_unit(&self) -> Unit {
        match self {
            Nutrient::Calories => Unit::Kcal,
            Nutrient::Protein
            | Nutrient::Fat
            | Nutrient::Carbohydrates
            | Nutrient::Fiber
            | Nutrient::Sugar => Unit::Gram,
            Nutrient::Sodium | Nutrient::Calcium | Nutrient::Iron | Nutrient::VitaminC => {
                Unit::Milligram
            }
            Nutrient::VitaminA => Unit::Microgram,
        }
    }

    /// Plausible range per 100 g in the canonical unit; values outside
    /// are rejected as extraction noise.
    pub fn plausible_range(&self) -> (f64, f64) {
        match self {
            Nutrient::Calories => (0.0, 900.0),
            Nutrient::Protein => (0.0, 100.0),
            Nutrient::Fat => (0.0, 100.0),
            Nutrient::Carbohydrates => (0.0, 100.0),
            Nutrient::Fiber => (0.0, 50.0),
            Nutrient::Sugar => (0.0, 100.0),
            Nutrient::Sodium => (0.0, 40_000.0),
            Nutrient::Calcium => (0.0, 2_000.0),
            Nutrient::Iron => (0.0, 100.0),
            Nutrient::VitaminC => (0.0, 2_000.0),
            Nutrient::VitaminA => (0.0, 10_000.0),
        }
    }
}

impl fmt::Display for Nutrient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Nutrient::Calories => "calories",
            Nutrient::Protein => "protein",
            Nutrient::Fat => "fat",
            Nutrient::Carbohydrates => "carbohydrates",
            Nutrient::Fiber => "fiber",
            Nutrient::Sugar => "sugar",
            Nutrient::Sodium => "sodium",
            Nutrient::Calcium => "calcium",
            Nutrient::Iron => "iron",
            Nutrient::VitaminC => "vitamin_c",
            Nutrient::VitaminA => "vitamin_a",
        };
        write!(f, "{}", s)
    }
}

/// Product-level facts pulled off a nutrition label
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FoodInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serving_size: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NutritionLabel {
    pub food_info: FoodInfo,
    pub nutrition: BTreeMap<Nutrient, Measurement>,
    pub raw_text: String,
    pub quality_score: f64,
}

/// One tokenized recipe ingredient
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ingredient {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preparation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recipe {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub ingredients: Vec<Ingredient>,
    pub instructions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prep_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cook_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub servings: Option<u32>,
    pub difficulty: Difficulty,
    pub quality_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuideSection {
    pub heading: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DietGuide {
    pub sections: Vec<GuideSection>,
    pub raw_text: String,
    pub quality_score: f64,
}

/// The tagged result union
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParsedDocument {
    NutritionLabel(NutritionLabel),
    Recipe(Recipe),
    DietGuide(DietGuide),
    Unknown { raw_text: String, quality_score: f64 },
}

impl ParsedDocument {
    pub fn quality_score(&self) -> f64 {
        match self {
            ParsedDocument::NutritionLabel(d) => d.quality_score,
            ParsedDocument::Recipe(d) => d.quality_score,
            ParsedDocument::DietGuide(d) => d.quality_score,
            ParsedDocument::Unknown { quality_score, .. } => *quality_score,
        }
    }

    pub(crate) fn set_quality_score(&mut self, score: f64) {
        match self {
            ParsedDocument::NutritionLabel(d) => d.quality_score = score,
            ParsedDocument::Recipe(d) => d.quality_score = score,
            ParsedDocument::DietGuide(d) => d.quality_score = score,
            ParsedDocument::Unknown { quality_score, .. } => *quality_score = score,
        }
    }

    /// Tag string as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ParsedDocument::NutritionLabel(_) => "nutrition_label",
            ParsedDocument::Recipe(_) => "recipe",
            ParsedDocument::DietGuide(_) => "diet_guide",
            ParsedDocument::Unknown { .. } => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_serialization() {
        let doc = ParsedDocument::Unknown {
            raw_text: "hello".to_string(),
            quality_score: 0.25,
        };
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["type"], "unknown");
        assert_eq!(value["raw_text"], "hello");
    }

    #[test]
    fn test_nutrient_serde_names() {
        let v = serde_json::to_value(Nutrient::VitaminC).unwrap();
        assert_eq!(v, "vitamin_c");
        assert_eq!(Nutrient::VitaminC.to_string(), "vitamin_c");
    }

    #[test]
    fn test_canonical_units() {
        assert_eq!(Nutrient::Calories.canonical_unit(), Unit::Kcal);
        assert_eq!(Nutrient::Protein.canonical_unit(), Unit::Gram);
        assert_eq!(Nutrient::Sodium.canonical_unit(), Unit::Milligram);
        assert_eq!(Nutrient::VitaminA.canonical_unit(), Unit::Microgram);
    }

    #[test]
    fn test_nutrition_label_roundtrip() {
        let mut nutrition = BTreeMap::new();
        nutrition.insert(
            Nutrient::Calories,
            Measurement::new(250.0, Unit::Kcal),
        );
        let doc = ParsedDocument::NutritionLabel(NutritionLabel {
            food_info: FoodInfo {
                name: Some("Oat Bar".to_string()),
                serving_size: Some("40 g".to_string()),
            },
            nutrition,
            raw_text: "Nutrition Facts".to_string(),
            quality_score: 0.8,
        });

        let json = serde_json::to_string(&doc).unwrap();
        let back: ParsedDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(doc, back);
        assert_eq!(doc.kind(), "nutrition_label");
    }
}

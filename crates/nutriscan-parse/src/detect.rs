//! Document type detection
//!
//! Keyword heuristics over the harvested text layer, English and Chinese.
//! Only consulted when the caller asked for `auto`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the caller asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParsingType {
    #[default]
    Auto,
    NutritionLabel,
    Recipe,
    DietGuide,
}

impl fmt::Display for ParsingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParsingType::Auto => "auto",
            ParsingType::NutritionLabel => "nutrition_label",
            ParsingType::Recipe => "recipe",
            ParsingType::DietGuide => "diet_guide",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ParsingType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(ParsingType::Auto),
            "nutrition_label" => Ok(ParsingType::NutritionLabel),
            "recipe" => Ok(ParsingType::Recipe),
            "diet_guide" => Ok(ParsingType::DietGuide),
            _ => Err(anyhow::anyhow!("invalid parsing type: {}", s)),
        }
    }
}

/// The resolved, closed set extraction dispatches over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    NutritionLabel,
    Recipe,
    DietGuide,
    Unknown,
}

impl ParsingType {
    /// Resolve the requested type against the detected one.
    pub fn resolve(&self, text: &str) -> DocumentKind {
        match self {
            ParsingType::NutritionLabel => DocumentKind::NutritionLabel,
            ParsingType::Recipe => DocumentKind::Recipe,
            ParsingType::DietGuide => DocumentKind::DietGuide,
            ParsingType::Auto => detect(text),
        }
    }
}

static NUMBERED_STEP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*\d+\s*[\.\):、]\s*\S").expect("static regex"));

/// Classify a text layer by keyword presence.
pub fn detect(text: &str) -> DocumentKind {
    if text.trim().is_empty() {
        return DocumentKind::Unknown;
    }
    let lower = text.to_lowercase();

    if lower.contains("nutrition facts") || text.contains("营养成分") {
        return DocumentKind::NutritionLabel;
    }

    let has_ingredients = lower.contains("ingredients") || text.contains("配料");
    if has_ingredients && NUMBERED_STEP.is_match(text) {
        return DocumentKind::Recipe;
    }

    DocumentKind::DietGuide
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_detect_nutrition_label() {
        assert_eq!(
            detect("Nutrition Facts\nCalories 250"),
            DocumentKind::NutritionLabel
        );
        assert_eq!(detect("营养成分表\n蛋白质 12g"), DocumentKind::NutritionLabel);
    }

    #[test]
    fn test_detect_recipe_needs_steps() {
        let recipe = "Pancakes\nIngredients\n2 cups flour\nInstructions\n1. Mix\n2. Fry";
        assert_eq!(detect(recipe), DocumentKind::Recipe);
        // Ingredient list without numbered steps reads as a guide.
        assert_eq!(
            detect("Ingredients are the soul of cooking"),
            DocumentKind::DietGuide
        );
    }

    #[test]
    fn test_detect_defaults_to_guide() {
        assert_eq!(
            detect("Eat more vegetables.\nDrink water."),
            DocumentKind::DietGuide
        );
        assert_eq!(detect("   "), DocumentKind::Unknown);
    }

    #[test]
    fn test_explicit_type_skips_detection() {
        assert_eq!(
            ParsingType::Recipe.resolve("Nutrition Facts"),
            DocumentKind::Recipe
        );
        assert_eq!(
            ParsingType::Auto.resolve("Nutrition Facts"),
            DocumentKind::NutritionLabel
        );
    }

    #[test]
    fn test_parsing_type_roundtrip() {
        for pt in [
            ParsingType::Auto,
            ParsingType::NutritionLabel,
            ParsingType::Recipe,
            ParsingType::DietGuide,
        ] {
            assert_eq!(ParsingType::from_str(&pt.to_string()).unwrap(), pt);
        }
        assert!(ParsingType::from_str("spreadsheet").is_err());
    }
}

//! Nutrition label extraction
//!
//! Per-nutrient regex rules over the text layer, English and Chinese,
//! with unit normalization and plausibility clamps. A matched value whose
//! unit fails to normalize or falls outside the plausible range is
//! dropped rather than stored wrong.

use crate::quality::QualityInputs;
use crate::result::{FoodInfo, Nutrient, NutritionLabel};
use crate::units;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

const NUMBER: &str = r"(\d+(?:\.\d+)?)";
const MASS_UNIT: &str = r"(g|mg|µg|μg|ug|mcg|克|毫克|微克)";

/// Expected fields for the coverage fraction
const EXPECTED: [Nutrient; 6] = [
    Nutrient::Calories,
    Nutrient::Protein,
    Nutrient::Fat,
    Nutrient::Carbohydrates,
    Nutrient::Sugar,
    Nutrient::Sodium,
];

struct Rule {
    nutrient: Nutrient,
    pattern: Regex,
    /// Unit assumed when the label omits one (energy only)
    default_unit: Option<&'static str>,
}

fn rule(nutrient: Nutrient, names: &str, unit: &str, default_unit: Option<&'static str>) -> Rule {
    let pattern = format!(r"(?i)(?:{})[：:\s]*{}\s*{}?", names, NUMBER, unit);
    Rule {
        nutrient,
        pattern: Regex::new(&pattern).expect("static nutrient rule"),
        default_unit,
    }
}

static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule(
            Nutrient::Calories,
            "calories|energy|热量|能量",
            r"(kj|kcal|cal|千焦|大卡|千卡)",
            Some("kcal"),
        ),
        rule(Nutrient::Protein, "protein|蛋白质", MASS_UNIT, None),
        rule(
            Nutrient::Fat,
            r"total fat|fat|脂肪",
            MASS_UNIT,
            None,
        ),
        rule(
            Nutrient::Carbohydrates,
            r"total carbohydrates?|carbohydrates?|carbs|碳水化合物",
            MASS_UNIT,
            None,
        ),
        rule(
            Nutrient::Fiber,
            r"dietary fib(?:er|re)|fib(?:er|re)|膳食纤维",
            MASS_UNIT,
            None,
        ),
        rule(Nutrient::Sugar, r"sugars?|糖", MASS_UNIT, None),
        rule(Nutrient::Sodium, r"sodium|钠", MASS_UNIT, None),
        rule(Nutrient::Calcium, r"calcium|钙", MASS_UNIT, None),
        rule(Nutrient::Iron, r"iron|铁", MASS_UNIT, None),
        rule(
            Nutrient::VitaminC,
            r"vitamin\s*c|维生素\s*c",
            MASS_UNIT,
            None,
        ),
        rule(
            Nutrient::VitaminA,
            r"vitamin\s*a|维生素\s*a",
            MASS_UNIT,
            None,
        ),
    ]
});

static SERVING_SIZE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:serving size|per serving|每份)[：:\s]*([^\n]+)").expect("static regex")
});

/// Extract a nutrition label from the text layer.
pub fn extract(text: &str) -> (NutritionLabel, QualityInputs) {
    let mut nutrition: BTreeMap<Nutrient, units::Measurement> = BTreeMap::new();
    let mut matched = 0u32;
    let mut normalized = 0u32;

    for rule in RULES.iter() {
        let Some(caps) = rule.pattern.captures(text) else {
            continue;
        };
        matched += 1;

        let Some(value) = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) else {
            continue;
        };
        let unit = caps
            .get(2)
            .map(|m| m.as_str())
            .or(rule.default_unit)
            .unwrap_or("");

        let target = rule.nutrient.canonical_unit();
        let Some(measurement) = units::normalize(value, unit, target) else {
            continue;
        };

        let (min, max) = rule.nutrient.plausible_range();
        if measurement.value < min || measurement.value > max {
            tracing::debug!(
                nutrient = %rule.nutrient,
                value = measurement.value,
                "rejecting implausible nutrient value"
            );
            continue;
        }

        normalized += 1;
        nutrition.insert(rule.nutrient, measurement);
    }

    let food_info = FoodInfo {
        name: product_name(text),
        serving_size: SERVING_SIZE
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string()),
    };

    let coverage = EXPECTED
        .iter()
        .filter(|n| nutrition.contains_key(n))
        .count() as f64
        / EXPECTED.len() as f64;
    let unit_success = if matched == 0 {
        0.0
    } else {
        normalized as f64 / matched as f64
    };

    (
        NutritionLabel {
            food_info,
            nutrition,
            raw_text: text.to_string(),
            quality_score: 0.0,
        },
        QualityInputs::new(coverage, unit_success),
    )
}

/// First non-empty line that is not the table header.
fn product_name(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| {
            !line.is_empty()
                && !line.to_lowercase().contains("nutrition facts")
                && !line.contains("营养成分")
        })
        .map(|s| s.to_string())
}

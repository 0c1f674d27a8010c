//! Recipe extraction
//!
//! Splits the text by known section headers, parses numbered
//! instructions, and tokenizes ingredient lines into
//! `{quantity, unit, name, preparation}`.

use crate::quality::QualityInputs;
use crate::result::{Difficulty, Ingredient, Recipe};
use once_cell::sync::Lazy;
use regex::Regex;

static INGREDIENTS_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:ingredients|配料|材料)\b.*$").expect("static regex")
});
static INSTRUCTIONS_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:instructions|directions|method|steps|做法|步骤)\b.*$")
        .expect("static regex")
});
static NUMBERED_STEP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\d+\s*[\.\):、]\s*(.+)$").expect("static regex"));

static INGREDIENT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)^\s*
          (\d+(?:[./]\d+)?)?\s*                                  # quantity
          (cups?|tbsp|tablespoons?|tsp|teaspoons?|g|kg|ml|l|oz|lbs?|pounds?|克|毫升|杯|勺)?\b\s*
          (.+?)                                                  # name
          (?:,\s*(.+))?                                          # preparation
          \s*$",
    )
    .expect("static regex")
});

static PREP_TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)prep(?:aration)?\s*time[：:\s]*([^\n]+)").expect("static regex")
});
static COOK_TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)cook(?:ing)?\s*time[：:\s]*([^\n]+)").expect("static regex")
});
static SERVINGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:serves|servings|份量)[：:\s]*(\d+)").expect("static regex")
});

#[derive(PartialEq)]
enum Section {
    Preamble,
    Ingredients,
    Instructions,
}

/// Extract a recipe from the text layer.
pub fn extract(text: &str) -> (Recipe, QualityInputs) {
    let mut title: Option<String> = None;
    let mut ingredients = Vec::new();
    let mut instructions = Vec::new();
    let mut section = Section::Preamble;
    let mut parsed_quantities = 0usize;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if INGREDIENTS_HEADER.is_match(trimmed) {
            section = Section::Ingredients;
            continue;
        }
        if INSTRUCTIONS_HEADER.is_match(trimmed) {
            section = Section::Instructions;
            continue;
        }

        match section {
            Section::Preamble => {
                if title.is_none() && !looks_like_metadata(trimmed) {
                    title = Some(trimmed.to_string());
                }
            }
            Section::Ingredients => {
                let ingredient = parse_ingredient(trimmed);
                if ingredient.quantity.is_some() {
                    parsed_quantities += 1;
                }
                ingredients.push(ingredient);
            }
            Section::Instructions => {
                if let Some(caps) = NUMBERED_STEP.captures(trimmed) {
                    instructions.push(caps[1].trim().to_string());
                } else if let Some(last) = instructions.last_mut() {
                    // Continuation of the previous step.
                    last.push(' ');
                    last.push_str(trimmed);
                }
            }
        }
    }

    let prep_time = first_capture(&PREP_TIME, text);
    let cook_time = first_capture(&COOK_TIME, text);
    let servings = SERVINGS
        .captures(text)
        .and_then(|c| c[1].parse::<u32>().ok());

    let difficulty = match instructions.len() {
        0..=5 => Difficulty::Easy,
        6..=10 => Difficulty::Medium,
        _ => Difficulty::Hard,
    };

    let coverage = [
        title.is_some(),
        !ingredients.is_empty(),
        !instructions.is_empty(),
        prep_time.is_some(),
        cook_time.is_some(),
        servings.is_some(),
    ]
    .iter()
    .filter(|present| **present)
    .count() as f64
        / 6.0;

    let unit_success = if ingredients.is_empty() {
        1.0
    } else {
        parsed_quantities as f64 / ingredients.len() as f64
    };

    (
        Recipe {
            title,
            ingredients,
            instructions,
            prep_time,
            cook_time,
            servings,
            difficulty,
            quality_score: 0.0,
        },
        QualityInputs::new(coverage, unit_success),
    )
}

fn first_capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Time/serving lines should not be mistaken for the title.
fn looks_like_metadata(line: &str) -> bool {
    PREP_TIME.is_match(line) || COOK_TIME.is_match(line) || SERVINGS.is_match(line)
}

/// Tokenize one ingredient line.
pub fn parse_ingredient(line: &str) -> Ingredient {
    // Leading bullet markers are noise.
    let line = line.trim_start_matches(['-', '*', '•']).trim();

    if let Some(caps) = INGREDIENT_LINE.captures(line) {
        let quantity = caps.get(1).and_then(|m| parse_quantity(m.as_str()));
        let unit = caps.get(2).map(|m| m.as_str().to_lowercase());
        let name = caps
            .get(3)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        let preparation = caps.get(4).map(|m| m.as_str().trim().to_string());

        if !name.is_empty() {
            return Ingredient {
                quantity,
                unit,
                name,
                preparation,
            };
        }
    }

    Ingredient {
        quantity: None,
        unit: None,
        name: line.to_string(),
        preparation: None,
    }
}

/// Parse "2", "1.5", or "1/2".
fn parse_quantity(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.trim().parse().ok()?;
        let den: f64 = den.trim().parse().ok()?;
        (den != 0.0).then(|| num / den)
    } else {
        s.trim().parse().ok()
    }
}

//! Diet guide extraction
//!
//! Guides are loosely structured prose; we sectionize by heading
//! heuristics and keep the full raw text alongside.

use crate::quality::QualityInputs;
use crate::result::{DietGuide, GuideSection};
use once_cell::sync::Lazy;
use regex::Regex;

const MAX_HEADING_LEN: usize = 80;

static NUMBERED_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:\d+(?:\.\d+)*[\.\)]?|第[一二三四五六七八九十\d]+[章节部])\s+\S").expect("static regex"));

/// A line reads as a heading when it is short and either all-caps,
/// colon-terminated, or numbered like an outline.
fn is_heading(line: &str) -> bool {
    if line.len() > MAX_HEADING_LEN || line.is_empty() {
        return false;
    }
    if line.ends_with(':') || line.ends_with('：') {
        return true;
    }
    if NUMBERED_HEADING.is_match(line) {
        return true;
    }
    let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
    !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
}

/// Extract a diet guide from the text layer.
pub fn extract(text: &str) -> (DietGuide, QualityInputs) {
    let mut sections: Vec<GuideSection> = Vec::new();
    let mut current: Option<GuideSection> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if is_heading(trimmed) {
            if let Some(section) = current.take() {
                sections.push(section);
            }
            current = Some(GuideSection {
                heading: trimmed
                    .trim_end_matches([':', '：'])
                    .trim()
                    .to_string(),
                body: String::new(),
            });
        } else if let Some(section) = current.as_mut() {
            if !section.body.is_empty() {
                section.body.push('\n');
            }
            section.body.push_str(trimmed);
        } else {
            // Prose before any heading becomes an untitled preamble.
            current = Some(GuideSection {
                heading: String::new(),
                body: trimmed.to_string(),
            });
        }
    }
    if let Some(section) = current.take() {
        sections.push(section);
    }

    // Three or more recognizable sections reads as a fully structured
    // guide; nothing to normalize, so unit success is vacuous.
    let coverage = (sections.len().min(3)) as f64 / 3.0;

    (
        DietGuide {
            sections,
            raw_text: text.to_string(),
            quality_score: 0.0,
        },
        QualityInputs::new(coverage, 1.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sectionizes_by_headings() {
        let text = "GETTING STARTED\nEat breakfast daily.\n\
                    Hydration:\nDrink eight glasses of water.\n\
                    1. Portion control\nUse smaller plates.";
        let (guide, inputs) = extract(text);

        assert_eq!(guide.sections.len(), 3);
        assert_eq!(guide.sections[0].heading, "GETTING STARTED");
        assert_eq!(guide.sections[0].body, "Eat breakfast daily.");
        assert_eq!(guide.sections[1].heading, "Hydration");
        assert_eq!(guide.sections[2].heading, "1. Portion control");
        assert_eq!(inputs.field_coverage, 1.0);
    }

    #[test]
    fn test_preamble_without_heading() {
        let (guide, inputs) = extract("Just some advice.\nMore advice.");
        assert_eq!(guide.sections.len(), 1);
        assert_eq!(guide.sections[0].heading, "");
        assert!(guide.sections[0].body.contains("More advice."));
        assert!(inputs.field_coverage < 1.0);
    }

    #[test]
    fn test_long_shouty_line_is_not_heading() {
        let shout = "A".repeat(120);
        assert!(!is_heading(&shout));
        assert!(is_heading("SUMMARY"));
        assert!(!is_heading("Mixed Case Line"));
    }

    #[test]
    fn test_raw_text_is_preserved() {
        let text = "TIPS\nchew slowly";
        let (guide, _) = extract(text);
        assert_eq!(guide.raw_text, text);
    }
}

//! Structured extraction, dispatched over the closed document-kind set
//!
//! Each extractor is a plain function from text to its result variant
//! plus the quality inputs it observed. Adding a document kind means
//! adding a case here, not a new trait object.

use crate::detect::DocumentKind;
use crate::quality::QualityInputs;
use crate::result::ParsedDocument;

pub mod guide;
pub mod nutrition;
pub mod recipe;

/// Run the extractor for `kind` over the text layer.
pub fn extract(kind: DocumentKind, text: &str) -> (ParsedDocument, QualityInputs) {
    match kind {
        DocumentKind::NutritionLabel => {
            let (label, inputs) = nutrition::extract(text);
            (ParsedDocument::NutritionLabel(label), inputs)
        }
        DocumentKind::Recipe => {
            let (recipe, inputs) = recipe::extract(text);
            (ParsedDocument::Recipe(recipe), inputs)
        }
        DocumentKind::DietGuide => {
            let (guide, inputs) = guide::extract(text);
            (ParsedDocument::DietGuide(guide), inputs)
        }
        DocumentKind::Unknown => {
            // Nothing structured to recover; unit success is vacuous.
            let coverage = 0.0;
            (
                ParsedDocument::Unknown {
                    raw_text: text.to_string(),
                    quality_score: 0.0,
                },
                QualityInputs::new(coverage, 1.0),
            )
        }
    }
}

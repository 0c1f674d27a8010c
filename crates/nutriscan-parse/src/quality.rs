//! Deterministic extraction quality scoring
//!
//! The score summarizes how much of the expected structure was recovered:
//! fraction of expected fields present, unit-normalization success rate,
//! and OCR confidence when the text came from the OCR fallback. Weighted
//! sum, clamped to [0, 1], rounded to two decimals so repeated runs over
//! the same bytes always agree.

/// Inputs each extractor reports
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityInputs {
    /// Fraction of expected fields that were found, 0..=1
    pub field_coverage: f64,
    /// Fraction of raw values whose units normalized cleanly, 0..=1
    pub unit_success: f64,
    /// Mean OCR confidence, only when the OCR fallback produced the text
    pub ocr_confidence: Option<f64>,
}

impl QualityInputs {
    pub fn new(field_coverage: f64, unit_success: f64) -> Self {
        Self {
            field_coverage,
            unit_success,
            ocr_confidence: None,
        }
    }

    pub fn with_ocr(mut self, confidence: f64) -> Self {
        self.ocr_confidence = Some(confidence);
        self
    }
}

/// Weighted 0..1 score.
///
/// With OCR: `0.5·coverage + 0.3·units + 0.2·confidence`.
/// Without: the OCR weight folds into the other two
/// (`0.6·coverage + 0.4·units`).
pub fn score(inputs: QualityInputs) -> f64 {
    let coverage = inputs.field_coverage.clamp(0.0, 1.0);
    let units = inputs.unit_success.clamp(0.0, 1.0);

    let raw = match inputs.ocr_confidence {
        Some(confidence) => {
            0.5 * coverage + 0.3 * units + 0.2 * confidence.clamp(0.0, 1.0)
        }
        None => 0.6 * coverage + 0.4 * units,
    };

    (raw.clamp(0.0, 1.0) * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_extraction_scores_one() {
        assert_eq!(score(QualityInputs::new(1.0, 1.0)), 1.0);
    }

    #[test]
    fn test_weights_without_ocr() {
        assert_eq!(score(QualityInputs::new(0.5, 1.0)), 0.7);
        assert_eq!(score(QualityInputs::new(1.0, 0.0)), 0.6);
    }

    #[test]
    fn test_ocr_confidence_caps_score() {
        let s = score(QualityInputs::new(1.0, 1.0).with_ocr(0.5));
        assert_eq!(s, 0.9);
        let sparse = score(QualityInputs::new(0.2, 0.5).with_ocr(0.5));
        assert_eq!(sparse, 0.35);
    }

    #[test]
    fn test_inputs_are_clamped() {
        assert_eq!(score(QualityInputs::new(7.0, -2.0)), 0.6);
    }

    #[test]
    fn test_deterministic() {
        let inputs = QualityInputs::new(0.73, 0.41).with_ocr(0.66);
        assert_eq!(score(inputs), score(inputs));
    }
}

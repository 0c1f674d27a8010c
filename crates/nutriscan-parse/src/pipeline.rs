//! Staged parsing pipeline
//!
//! Ordered stages with fixed progress milestones; every boundary checks
//! the cancellation token and reports progress through a caller-supplied
//! sink. CPU-heavy work (text harvesting, OCR, structured extraction)
//! runs under `spawn_blocking` so a large document cannot starve the
//! async runtime.

use crate::detect::{self, ParsingType};
use crate::extract;
use crate::pdf;
use crate::quality;
use crate::result::ParsedDocument;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Stage labels as persisted on the job record
pub mod stage {
    pub const EXTRACT_BASIC_INFO: &str = "extract_basic_info";
    pub const DETECT_TYPE: &str = "detect_type";
    pub const EXTRACT_TEXT: &str = "extract_text";
    pub const OCR_FALLBACK: &str = "ocr_fallback";
    pub const EXTRACT_STRUCTURED: &str = "extract_structured";
    pub const QUALITY_SCORE: &str = "quality_score";
    pub const COMMIT: &str = "commit";
}

/// Receives `(stage, percent)` notifications from the pipeline.
pub trait ProgressSink: Send + Sync {
    fn update(&self, stage: &str, percent: u8);
}

/// Sink that drops every update
pub struct NullSink;

impl ProgressSink for NullSink {
    fn update(&self, _stage: &str, _percent: u8) {}
}

/// Pipeline tuning knobs
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Permit the OCR fallback stage
    pub ocr_enabled: bool,
    /// OCR language hints
    pub languages: Vec<String>,
    /// Direct extraction below this average density triggers OCR
    pub min_chars_per_page: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            ocr_enabled: false,
            languages: vec!["eng".to_string()],
            min_chars_per_page: 40,
        }
    }
}

/// Recognized text plus the engine's confidence in it
#[derive(Debug, Clone)]
pub struct OcrOutcome {
    pub text: String,
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR is disabled")]
    Disabled,
    #[error("transient OCR failure: {0}")]
    Transient(String),
    #[error("OCR failed: {0}")]
    Failed(String),
}

/// Rasterize-and-recognize engine; real implementations are external
/// collaborators, wired in by the embedding process.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, bytes: &[u8], languages: &[String]) -> Result<OcrOutcome, OcrError>;
}

/// Default engine: always reports OCR as unavailable.
pub struct DisabledOcr;

impl OcrEngine for DisabledOcr {
    fn recognize(&self, _bytes: &[u8], _languages: &[String]) -> Result<OcrOutcome, OcrError> {
        Err(OcrError::Disabled)
    }
}

/// How a pipeline run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseFailKind {
    Unparseable,
    UnsupportedPdfVariant,
    ExtractorBug,
    OcrTransient,
}

impl ParseFailKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseFailKind::Unparseable => "unparseable",
            ParseFailKind::UnsupportedPdfVariant => "unsupported_pdf_variant",
            ParseFailKind::ExtractorBug => "extractor_bug",
            ParseFailKind::OcrTransient => "ocr_transient",
        }
    }

    /// Transient failures are worth a retry; the rest are permanent.
    pub fn is_transient(&self) -> bool {
        matches!(self, ParseFailKind::OcrTransient)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cancelled at stage {0}")]
    Cancelled(&'static str),

    #[error("{message}")]
    Stage {
        stage: &'static str,
        kind: ParseFailKind,
        message: String,
    },
}

/// The parsing pipeline: stateless aside from its config and engines,
/// shared across workers via `Arc`.
pub struct Pipeline {
    config: ParserConfig,
    ocr: Arc<dyn OcrEngine>,
}

impl Pipeline {
    pub fn new(config: ParserConfig) -> Self {
        Self {
            config,
            ocr: Arc::new(DisabledOcr),
        }
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = ocr;
        self
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Run all stages over the document bytes.
    pub async fn run(
        &self,
        bytes: Arc<Vec<u8>>,
        requested: ParsingType,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ParsedDocument, PipelineError> {
        // Stage 1: cheap facts.
        boundary(stage::EXTRACT_BASIC_INFO, cancel)?;
        progress.update(stage::EXTRACT_BASIC_INFO, 5);
        if pdf::is_encrypted(&bytes) {
            return Err(PipelineError::Stage {
                stage: stage::EXTRACT_BASIC_INFO,
                kind: ParseFailKind::UnsupportedPdfVariant,
                message: "encrypted documents are not supported".to_string(),
            });
        }
        let pages = pdf::page_count(&bytes).unwrap_or(1).max(1) as usize;

        // Stage 2: resolve the document kind. Auto needs the text layer,
        // which stage 3 then reuses.
        boundary(stage::DETECT_TYPE, cancel)?;
        progress.update(stage::DETECT_TYPE, 10);
        let mut text_cache: Option<String> = None;
        let mut kind = if requested == ParsingType::Auto {
            let text = self.harvest_text(Arc::clone(&bytes)).await?;
            let detected = detect::detect(&text);
            debug!(?detected, "auto-detected document kind");
            text_cache = Some(text);
            detected
        } else {
            requested.resolve("")
        };

        // Stage 3: text layer.
        boundary(stage::EXTRACT_TEXT, cancel)?;
        progress.update(stage::EXTRACT_TEXT, 40);
        let mut text = match text_cache.take() {
            Some(text) => text,
            None => self.harvest_text(Arc::clone(&bytes)).await?,
        };

        // Stage 4: OCR fallback when the direct text layer is too thin.
        let mut ocr_confidence = None;
        let density = text.chars().count() / pages;
        if density < self.config.min_chars_per_page {
            boundary(stage::OCR_FALLBACK, cancel)?;
            progress.update(stage::OCR_FALLBACK, 40);
            match self.run_ocr(Arc::clone(&bytes)).await {
                Ok(outcome) if !outcome.text.trim().is_empty() => {
                    debug!(confidence = outcome.confidence, "OCR fallback produced text");
                    text = outcome.text;
                    ocr_confidence = Some(outcome.confidence);
                    if requested == ParsingType::Auto {
                        kind = detect::detect(&text);
                    }
                }
                Ok(_) => {}
                Err(OcrError::Disabled) => {
                    debug!("text layer is thin and OCR is disabled");
                }
                Err(e) => {
                    if text.trim().is_empty() {
                        let kind = match e {
                            OcrError::Transient(_) => ParseFailKind::OcrTransient,
                            _ => ParseFailKind::Unparseable,
                        };
                        return Err(PipelineError::Stage {
                            stage: stage::OCR_FALLBACK,
                            kind,
                            message: e.to_string(),
                        });
                    }
                    // Direct extraction produced something usable.
                    warn!(error = %e, "OCR failed; continuing with direct text layer");
                }
            }
        }

        if text.trim().is_empty() {
            return Err(PipelineError::Stage {
                stage: stage::EXTRACT_TEXT,
                kind: ParseFailKind::Unparseable,
                message: "document has no recoverable text layer".to_string(),
            });
        }

        // Stage 5: structured extraction.
        boundary(stage::EXTRACT_STRUCTURED, cancel)?;
        progress.update(stage::EXTRACT_STRUCTURED, 80);
        let (mut doc, inputs) = {
            let text = text.clone();
            tokio::task::spawn_blocking(move || extract::extract(kind, &text))
                .await
                .map_err(|e| PipelineError::Stage {
                    stage: stage::EXTRACT_STRUCTURED,
                    kind: ParseFailKind::ExtractorBug,
                    message: format!("extractor task failed: {}", e),
                })?
        };

        // Stage 6: score.
        boundary(stage::QUALITY_SCORE, cancel)?;
        progress.update(stage::QUALITY_SCORE, 90);
        let inputs = match ocr_confidence {
            Some(confidence) => inputs.with_ocr(confidence),
            None => inputs,
        };
        doc.set_quality_score(quality::score(inputs));

        Ok(doc)
    }

    async fn harvest_text(&self, bytes: Arc<Vec<u8>>) -> Result<String, PipelineError> {
        tokio::task::spawn_blocking(move || pdf::extract_text(&bytes))
            .await
            .map_err(|e| PipelineError::Stage {
                stage: stage::EXTRACT_TEXT,
                kind: ParseFailKind::ExtractorBug,
                message: format!("text extraction task failed: {}", e),
            })
    }

    async fn run_ocr(&self, bytes: Arc<Vec<u8>>) -> Result<OcrOutcome, OcrError> {
        if !self.config.ocr_enabled {
            return Err(OcrError::Disabled);
        }
        let engine = Arc::clone(&self.ocr);
        let languages = self.config.languages.clone();
        tokio::task::spawn_blocking(move || engine.recognize(&bytes, &languages))
            .await
            .map_err(|e| OcrError::Failed(format!("OCR task failed: {}", e)))?
    }
}

fn boundary(stage: &'static str, cancel: &CancellationToken) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled(stage));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::test_pdf;
    use crate::result::Nutrient;
    use std::sync::Mutex;

    struct RecordingSink(Mutex<Vec<(String, u8)>>);

    impl RecordingSink {
        fn new() -> Self {
            Self(Mutex::new(Vec::new()))
        }
    }

    impl ProgressSink for RecordingSink {
        fn update(&self, stage: &str, percent: u8) {
            self.0.lock().unwrap().push((stage.to_string(), percent));
        }
    }

    struct FakeOcr {
        text: String,
        confidence: f64,
    }

    impl OcrEngine for FakeOcr {
        fn recognize(&self, _bytes: &[u8], _languages: &[String]) -> Result<OcrOutcome, OcrError> {
            Ok(OcrOutcome {
                text: self.text.clone(),
                confidence: self.confidence,
            })
        }
    }

    struct FlakyOcr;

    impl OcrEngine for FlakyOcr {
        fn recognize(&self, _bytes: &[u8], _languages: &[String]) -> Result<OcrOutcome, OcrError> {
            Err(OcrError::Transient("rasterizer busy".to_string()))
        }
    }

    fn big_label_text() -> String {
        // Dense enough to stay above the OCR threshold on one page.
        let mut text = String::from("Oat Crunch Bar\nNutrition Facts\n");
        text.push_str("Calories 250\nTotal Fat 10 g\nProtein 6 g\nSodium 120 mg\n");
        text.push_str("Total Carbohydrates 32 g\nSugars 12 g\n");
        text
    }

    #[tokio::test]
    async fn test_auto_detects_and_extracts_nutrition_label() {
        let pdf = Arc::new(test_pdf(&[&big_label_text()]));
        let pipeline = Pipeline::new(ParserConfig::default());
        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();

        let doc = pipeline
            .run(pdf, ParsingType::Auto, &sink, &cancel)
            .await
            .unwrap();

        let ParsedDocument::NutritionLabel(label) = doc else {
            panic!("expected a nutrition label");
        };
        assert_eq!(label.nutrition[&Nutrient::Calories].value, 250.0);
        assert!(label.quality_score > 0.5);

        // Milestones arrive in order and never decrease.
        let updates = sink.0.lock().unwrap();
        let percents: Vec<u8> = updates.iter().map(|(_, p)| *p).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(updates[0].0, stage::EXTRACT_BASIC_INFO);
        assert!(updates.iter().any(|(s, _)| s == stage::EXTRACT_STRUCTURED));
    }

    #[tokio::test]
    async fn test_explicit_type_bypasses_detection() {
        let pdf = Arc::new(test_pdf(&[
            "Pancakes\nIngredients\n2 cups flour\nInstructions\n1. Mix well and rest the batter\n2. Fry in butter until golden brown",
        ]));
        let pipeline = Pipeline::new(ParserConfig::default());
        let doc = pipeline
            .run(pdf, ParsingType::Recipe, &NullSink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(doc.kind(), "recipe");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let pdf = Arc::new(test_pdf(&["text"]));
        let pipeline = Pipeline::new(ParserConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline
            .run(pdf, ParsingType::Auto, &NullSink, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_ocr_fallback_fires_on_thin_text() {
        // One page, no text layer at all.
        let pdf = Arc::new(test_pdf(&[""]));
        let config = ParserConfig {
            ocr_enabled: true,
            ..Default::default()
        };
        let pipeline = Pipeline::new(config).with_ocr(Arc::new(FakeOcr {
            text: "Nutrition Facts\nCalories 250".to_string(),
            confidence: 0.5,
        }));
        let sink = RecordingSink::new();

        let doc = pipeline
            .run(pdf, ParsingType::Auto, &sink, &CancellationToken::new())
            .await
            .unwrap();

        let ParsedDocument::NutritionLabel(label) = doc else {
            panic!("expected nutrition label from OCR text");
        };
        assert!(!label.raw_text.is_empty());
        // OCR-derived results cannot score highly.
        assert!(label.quality_score <= 0.7);
        assert!(sink
            .0
            .lock()
            .unwrap()
            .iter()
            .any(|(s, _)| s == stage::OCR_FALLBACK));
    }

    #[tokio::test]
    async fn test_encrypted_pdf_is_unsupported() {
        let mut pdf = test_pdf(&["text"]);
        pdf.extend_from_slice(b"trailer\n<< /Encrypt 9 0 R >>\n");
        let pipeline = Pipeline::new(ParserConfig::default());

        let err = pipeline
            .run(
                Arc::new(pdf),
                ParsingType::Auto,
                &NullSink,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            PipelineError::Stage { kind, .. } => {
                assert_eq!(kind, ParseFailKind::UnsupportedPdfVariant);
                assert!(!kind.is_transient());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_text_and_no_ocr_is_unparseable() {
        let pdf = Arc::new(test_pdf(&[""]));
        let pipeline = Pipeline::new(ParserConfig::default());

        let err = pipeline
            .run(pdf, ParsingType::Auto, &NullSink, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            PipelineError::Stage { kind, .. } => assert_eq!(kind, ParseFailKind::Unparseable),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ocr_error_demoted_when_text_exists() {
        // Thin but non-empty text layer; flaky OCR must not fail the run.
        let pdf = Arc::new(test_pdf(&["Eat well"]));
        let config = ParserConfig {
            ocr_enabled: true,
            ..Default::default()
        };
        let pipeline = Pipeline::new(config).with_ocr(Arc::new(FlakyOcr));

        let doc = pipeline
            .run(pdf, ParsingType::Auto, &NullSink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(doc.kind(), "diet_guide");
    }

    #[tokio::test]
    async fn test_ocr_transient_error_with_no_text_is_transient() {
        let pdf = Arc::new(test_pdf(&[""]));
        let config = ParserConfig {
            ocr_enabled: true,
            ..Default::default()
        };
        let pipeline = Pipeline::new(config).with_ocr(Arc::new(FlakyOcr));

        let err = pipeline
            .run(pdf, ParsingType::Auto, &NullSink, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            PipelineError::Stage { kind, stage, .. } => {
                assert_eq!(kind, ParseFailKind::OcrTransient);
                assert!(kind.is_transient());
                assert_eq!(stage, super::stage::OCR_FALLBACK);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}

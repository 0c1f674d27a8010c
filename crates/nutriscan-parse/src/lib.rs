//! Nutriscan parsing: validation, text harvesting, structured extraction
//!
//! # Overview
//!
//! Everything between raw upload bytes and a structured result lives
//! here:
//!
//! - [`validate`]: size/extension/magic checks and a conservative
//!   malicious-content scan
//! - [`detect`]: keyword classification for `auto` submissions
//! - [`pipeline`]: the staged run with progress milestones and
//!   cooperative cancellation
//! - [`extract`]: per-kind rule extractors over the text layer
//! - [`units`]: normalization to the canonical nutrient units
//!
//! The crate is deliberately free of storage and HTTP concerns; the
//! job engine drives it through [`pipeline::Pipeline::run`].

pub mod detect;
pub mod extract;
pub mod pdf;
pub mod pipeline;
pub mod quality;
pub mod result;
pub mod units;
pub mod validate;

pub use detect::{DocumentKind, ParsingType};
pub use pipeline::{
    OcrEngine, OcrError, OcrOutcome, ParseFailKind, ParserConfig, Pipeline, PipelineError,
    ProgressSink,
};
pub use result::{Nutrient, ParsedDocument};
pub use units::{Measurement, Unit};
pub use validate::{validate, UploadInfo, ValidationError, ValidationErrorKind};

//! Upload validation
//!
//! Fail-fast checks, cheapest first: size, extension, magic bytes,
//! structural signature, then a conservative malicious-content scan over
//! the decoded object streams. Rejecting a benign-but-weird PDF is
//! preferred over accepting an actively hostile one.

use crate::pdf;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Bytes inspected at each end of the file for the magic and trailer.
const HEADER_WINDOW: usize = 1024;
const TRAILER_WINDOW: usize = 1024;

/// Tokens that mark active content we refuse to process.
const REJECT_TOKENS: [&[u8]; 3] = [b"/JS", b"/JavaScript", b"/Launch"];

/// `/EmbeddedFile` is only rejected when paired with an executable MIME.
const EXECUTABLE_MIMES: [&[u8]; 4] = [
    b"application/x-msdownload",
    b"application/x-msdos-program",
    b"application/x-sh",
    b"application/x-executable",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    TooLarge,
    Empty,
    WrongExtension,
    NotPdf,
    CorruptSignature,
    SuspectedMalicious,
    InvalidFilename,
}

impl ValidationErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationErrorKind::TooLarge => "too_large",
            ValidationErrorKind::Empty => "empty",
            ValidationErrorKind::WrongExtension => "wrong_extension",
            ValidationErrorKind::NotPdf => "not_pdf",
            ValidationErrorKind::CorruptSignature => "corrupt_signature",
            ValidationErrorKind::SuspectedMalicious => "suspected_malicious",
            ValidationErrorKind::InvalidFilename => "invalid_filename",
        }
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub message: String,
}

impl ValidationError {
    fn new(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// What validation learned about an accepted upload
#[derive(Debug, Clone, PartialEq)]
pub struct UploadInfo {
    pub size: u64,
    pub mime: &'static str,
    pub page_count_hint: Option<u32>,
    /// Hex SHA-256 of the bytes
    pub hash: String,
    pub sanitized_name: String,
    /// Non-fatal observations (e.g. missing trailer)
    pub warnings: Vec<String>,
}

/// Run every check in order and describe the upload.
pub fn validate(
    bytes: &[u8],
    filename: &str,
    max_size: u64,
) -> Result<UploadInfo, ValidationError> {
    if bytes.is_empty() {
        return Err(ValidationError::new(
            ValidationErrorKind::Empty,
            "uploaded file is empty",
        ));
    }
    if bytes.len() as u64 > max_size {
        return Err(ValidationError::new(
            ValidationErrorKind::TooLarge,
            format!(
                "file is {} bytes, limit is {} bytes",
                bytes.len(),
                max_size
            ),
        ));
    }

    if filename.contains('\0') {
        return Err(ValidationError::new(
            ValidationErrorKind::InvalidFilename,
            "filename contains a NUL byte",
        ));
    }

    let extension = filename.rsplit('.').next().unwrap_or("");
    if filename.rfind('.').is_none() || !extension.eq_ignore_ascii_case("pdf") {
        return Err(ValidationError::new(
            ValidationErrorKind::WrongExtension,
            format!("expected a .pdf file, got {:?}", filename),
        ));
    }

    let header = &bytes[..bytes.len().min(HEADER_WINDOW)];
    if !contains(header, b"%PDF-") {
        return Err(ValidationError::new(
            ValidationErrorKind::NotPdf,
            "missing %PDF- magic in the first 1024 bytes",
        ));
    }

    let mut warnings = Vec::new();
    let trailer = &bytes[bytes.len().saturating_sub(TRAILER_WINDOW)..];
    if !contains(trailer, b"%%EOF") {
        // Tolerant parsers accept truncated PDFs; record, don't reject.
        warnings.push("missing %%EOF trailer; file may be truncated".to_string());
    }

    scan_for_active_content(bytes)?;

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let hash = hex::encode(hasher.finalize());

    let sanitized_name = sanitize_filename(filename, &hash);

    Ok(UploadInfo {
        size: bytes.len() as u64,
        mime: "application/pdf",
        page_count_hint: pdf::page_count(bytes),
        hash,
        sanitized_name,
        warnings,
    })
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Reject documents carrying script, launch actions, or executable
/// attachments. Both the raw bytes and the inflated streams are scanned
/// so a `/JS` inside a FlateDecode object does not slip through.
fn scan_for_active_content(bytes: &[u8]) -> Result<(), ValidationError> {
    let mut scopes: Vec<&[u8]> = vec![bytes];
    let decoded = pdf::decode_streams(bytes);
    scopes.extend(decoded.iter().map(|s| s.as_slice()));

    for scope in &scopes {
        for token in REJECT_TOKENS {
            if contains(scope, token) {
                return Err(ValidationError::new(
                    ValidationErrorKind::SuspectedMalicious,
                    format!(
                        "active content token {:?} present",
                        String::from_utf8_lossy(token)
                    ),
                ));
            }
        }
        if contains(scope, b"/EmbeddedFile")
            && EXECUTABLE_MIMES.iter().any(|mime| contains(scope, mime))
        {
            return Err(ValidationError::new(
                ValidationErrorKind::SuspectedMalicious,
                "embedded file with executable MIME type",
            ));
        }
    }
    Ok(())
}

/// Strip path separators and control characters. An empty survivor gets
/// a name synthesized from the content hash, so sanitization never
/// fails and is closed under itself.
pub fn sanitize_filename(filename: &str, content_hash: &str) -> String {
    let cleaned: String = filename
        .chars()
        .filter(|c| !matches!(c, '/' | '\\') && !c.is_control())
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();

    if cleaned.is_empty() || cleaned.eq_ignore_ascii_case("pdf") {
        let prefix: String = content_hash.chars().take(12).collect();
        format!("{}.pdf", prefix)
    } else {
        cleaned
    }
}

//! Low-level PDF helpers
//!
//! Nutriscan treats real PDF rendering as an external concern; what it
//! needs from a file is modest: the content streams (for the malicious
//! token scan), a text layer harvested from show-text operators, and a
//! page-count hint. Streams marked `/FlateDecode` are inflated with
//! `flate2`; anything that fails to inflate is skipped rather than
//! failing the document.

use flate2::read::ZlibDecoder;
use std::io::Read;

/// Largest single stream we are willing to inflate (guards against
/// decompression bombs).
const MAX_STREAM_SIZE: usize = 32 * 1024 * 1024;

/// Find `needle` in `haystack` starting at `from`.
fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// A content stream with its dictionary prefix.
struct RawStream<'a> {
    dict: &'a [u8],
    body: &'a [u8],
}

fn raw_streams(bytes: &[u8]) -> Vec<RawStream<'_>> {
    let mut out = Vec::new();
    let mut cursor = 0;

    while let Some(kw) = find(bytes, b"stream", cursor) {
        // Skip `endstream` matches.
        if kw >= 3 && &bytes[kw - 3..kw] == b"end" {
            cursor = kw + 6;
            continue;
        }

        // The stream dictionary sits just before the keyword; a bounded
        // backward window is enough for the filters we care about.
        let dict_start = bytes[..kw]
            .windows(2)
            .rposition(|w| w == b"<<")
            .unwrap_or(kw.saturating_sub(1));
        let dict = &bytes[dict_start..kw];

        // Body starts after the keyword's EOL.
        let mut body_start = kw + b"stream".len();
        if bytes.get(body_start) == Some(&b'\r') {
            body_start += 1;
        }
        if bytes.get(body_start) == Some(&b'\n') {
            body_start += 1;
        }

        let Some(end) = find(bytes, b"endstream", body_start) else {
            break;
        };
        let mut body_end = end;
        while body_end > body_start && matches!(bytes[body_end - 1], b'\r' | b'\n') {
            body_end -= 1;
        }

        out.push(RawStream {
            dict,
            body: &bytes[body_start..body_end],
        });
        cursor = end + b"endstream".len();
    }

    out
}

/// All stream bodies, inflated where the dictionary names `/FlateDecode`.
pub fn decode_streams(bytes: &[u8]) -> Vec<Vec<u8>> {
    raw_streams(bytes)
        .into_iter()
        .filter_map(|s| {
            if find(s.dict, b"/FlateDecode", 0).is_some() {
                inflate(s.body)
            } else {
                Some(s.body.to_vec())
            }
        })
        .collect()
}

fn inflate(body: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(body).take(MAX_STREAM_SIZE as u64);
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out) {
        Ok(_) => Some(out),
        Err(_) => None,
    }
}

/// Whether the trailer declares an `/Encrypt` dictionary. Encrypted
/// documents need keys we do not have.
pub fn is_encrypted(bytes: &[u8]) -> bool {
    find(bytes, b"/Encrypt", 0).is_some()
}

/// Count of `/Type /Page` object markers; `None` when the file carries no
/// recognizable page objects.
pub fn page_count(bytes: &[u8]) -> Option<u32> {
    let mut count = 0u32;
    let mut cursor = 0;
    while let Some(pos) = find(bytes, b"/Type", cursor) {
        let mut p = pos + b"/Type".len();
        while bytes.get(p).map(|b| b.is_ascii_whitespace()).unwrap_or(false) {
            p += 1;
        }
        if bytes[p..].starts_with(b"/Page") && bytes.get(p + 5) != Some(&b's') {
            count += 1;
        }
        cursor = pos + 1;
    }
    (count > 0).then_some(count)
}

/// Harvest the text layer from show-text operators (`Tj`, `TJ`, `'`).
///
/// Each `BT` block starts a new line in the output. This is a heuristic
/// text layer, not a renderer: kerning, fonts, and positioning are
/// ignored.
pub fn extract_text(bytes: &[u8]) -> String {
    let mut out = String::new();
    for stream in decode_streams(bytes) {
        harvest_stream(&stream, &mut out);
    }
    // Literal streams outside object wrappers (rare, but cheap to cover
    // for files with no stream markers at all).
    if out.is_empty() {
        harvest_stream(bytes, &mut out);
    }
    out.trim().to_string()
}

fn harvest_stream(stream: &[u8], out: &mut String) {
    let mut i = 0;
    while i < stream.len() {
        match stream[i] {
            b'B' if stream[i..].starts_with(b"BT") => {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                i += 2;
            }
            b'(' => {
                let (literal, next) = parse_literal(stream, i);
                if shown_as_text(stream, next) {
                    if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                        out.push(' ');
                    }
                    out.push_str(&literal);
                }
                i = next;
            }
            _ => i += 1,
        }
    }
}

/// Parse a `(...)` string literal starting at `open`, handling escapes
/// and balanced nesting. Returns the decoded text and the index after
/// the closing paren.
fn parse_literal(stream: &[u8], open: usize) -> (String, usize) {
    let mut depth = 1;
    let mut text = String::new();
    let mut i = open + 1;

    while i < stream.len() && depth > 0 {
        match stream[i] {
            b'\\' if i + 1 < stream.len() => {
                let escaped = stream[i + 1];
                match escaped {
                    b'n' => text.push('\n'),
                    b'r' => text.push('\r'),
                    b't' => text.push('\t'),
                    b'(' | b')' | b'\\' => text.push(escaped as char),
                    b'0'..=b'7' => {
                        // Up to three octal digits.
                        let mut value = 0u32;
                        let mut len = 0;
                        while len < 3 {
                            match stream.get(i + 1 + len) {
                                Some(d @ b'0'..=b'7') => {
                                    value = value * 8 + (d - b'0') as u32;
                                    len += 1;
                                }
                                _ => break,
                            }
                        }
                        if let Some(c) = char::from_u32(value) {
                            text.push(c);
                        }
                        i += len + 1;
                        continue;
                    }
                    _ => {}
                }
                i += 2;
                continue;
            }
            b'(' => {
                depth += 1;
                text.push('(');
            }
            b')' => {
                depth -= 1;
                if depth > 0 {
                    text.push(')');
                }
            }
            other => {
                // Content streams are effectively Latin-1 at this level.
                text.push(other as char);
            }
        }
        i += 1;
    }

    (text, i)
}

/// Look ahead for a show-text operator after the literal (skipping the
/// numbers and brackets TJ arrays interleave).
fn shown_as_text(stream: &[u8], from: usize) -> bool {
    let mut i = from;
    let limit = (from + 24).min(stream.len());
    while i < limit {
        match stream[i] {
            b' ' | b'\t' | b'\r' | b'\n' | b']' | b'-' | b'.' | b'0'..=b'9' => i += 1,
            b'T' => return matches!(stream.get(i + 1), Some(b'j') | Some(b'J')),
            b'\'' | b'"' => return true,
            b'(' => return true, // adjacent literal within a TJ array
            _ => return false,
        }
    }
    false
}

#[cfg(test)]
pub(crate) fn test_pdf(text_per_page: &[&str]) -> Vec<u8> {
    use std::fmt::Write as _;

    let mut body = String::from("%PDF-1.4\n");
    body.push_str("1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n");
    let kids: Vec<String> = (0..text_per_page.len())
        .map(|i| format!("{} 0 R", 3 + i * 2))
        .collect();
    let _ = write!(
        body,
        "2 0 obj\n<< /Type /Pages /Kids [{}] /Count {} >>\nendobj\n",
        kids.join(" "),
        text_per_page.len()
    );
    for (i, text) in text_per_page.iter().enumerate() {
        let page_obj = 3 + i * 2;
        let content_obj = page_obj + 1;
        let _ = write!(
            body,
            "{} 0 obj\n<< /Type /Page /Parent 2 0 R /Contents {} 0 R >>\nendobj\n",
            page_obj, content_obj
        );
        let mut content = String::new();
        for line in text.lines() {
            let escaped = line.replace('\\', "\\\\").replace('(', "\\(").replace(')', "\\)");
            let _ = write!(content, "BT /F1 12 Tf ({}) Tj ET\n", escaped);
        }
        let _ = write!(
            body,
            "{} 0 obj\n<< /Length {} >>\nstream\n{}endstream\nendobj\n",
            content_obj,
            content.len(),
            content
        );
    }
    body.push_str("%%EOF\n");
    body.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_extract_text_from_literal_stream() {
        let pdf = test_pdf(&["Nutrition Facts\nCalories 250"]);
        let text = extract_text(&pdf);
        assert!(text.contains("Nutrition Facts"));
        assert!(text.contains("Calories 250"));
    }

    #[test]
    fn test_extract_text_multiline_keeps_line_breaks() {
        let pdf = test_pdf(&["Ingredients\n1. Mix flour\n2. Bake"]);
        let text = extract_text(&pdf);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Ingredients");
        assert!(lines.iter().any(|l| l.starts_with("1. Mix")));
    }

    #[test]
    fn test_extract_text_escaped_parens() {
        let pdf = test_pdf(&["Fat (total) 10 g"]);
        assert!(extract_text(&pdf).contains("Fat (total) 10 g"));
    }

    #[test]
    fn test_flate_stream_roundtrip() {
        let content = b"BT (Sodium 120 mg) Tj ET";
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut pdf = Vec::new();
        pdf.extend_from_slice(b"%PDF-1.4\n");
        pdf.extend_from_slice(
            format!(
                "4 0 obj\n<< /Length {} /Filter /FlateDecode >>\nstream\n",
                compressed.len()
            )
            .as_bytes(),
        );
        pdf.extend_from_slice(&compressed);
        pdf.extend_from_slice(b"\nendstream\nendobj\n%%EOF");

        let streams = decode_streams(&pdf);
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0], content);
        assert!(extract_text(&pdf).contains("Sodium 120 mg"));
    }

    #[test]
    fn test_corrupt_flate_stream_is_skipped() {
        let pdf = b"%PDF-1.4\n<< /Filter /FlateDecode >>\nstream\nnot deflate\nendstream\n%%EOF";
        assert!(decode_streams(pdf).is_empty());
    }

    #[test]
    fn test_page_count() {
        assert_eq!(page_count(&test_pdf(&["a"])), Some(1));
        assert_eq!(page_count(&test_pdf(&["a", "b", "c"])), Some(3));
        assert_eq!(page_count(b"%PDF-1.4 no pages"), None);
    }

    #[test]
    fn test_literal_without_operator_is_ignored() {
        let stream = b"<< /Title (not shown) >>\nstream\n(not text either)\nendstream";
        let text = extract_text(stream);
        assert!(!text.contains("not shown"));
    }
}

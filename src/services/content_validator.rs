//! Content type sniffing and the image allow-list.
//!
//! Sniffing looks at the leading bytes of a payload the way browsers do
//! (magic-number signatures first, then a binary/text heuristic). The result
//! is checked against a table of [`ContentTypeRule`]s; nothing here fails,
//! callers turn a rejection into `InvalidContentType`.

use crate::models::content_type::{ContentTypeRule, IMAGE_RULES};

/// Number of leading bytes consulted when sniffing.
pub const SNIFF_LEN: usize = 512;

const OCTET_STREAM: &str = "application/octet-stream";
const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Leading-byte signatures, checked in order.
const SIGNATURES: &[(&[u8], &str)] = &[
    (&[0x00, 0x00, 0x01, 0x00], "image/x-icon"),
    (&[0x00, 0x00, 0x02, 0x00], "image/x-icon"),
    (b"BM", "image/bmp"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A], "image/png"),
    (&[0xFF, 0xD8, 0xFF], "image/jpeg"),
    (b"%PDF-", "application/pdf"),
    (b"PK\x03\x04", "application/zip"),
];

/// Validates MIME types against a data-driven allow-list.
#[derive(Debug, Clone)]
pub struct ContentValidator {
    rules: Vec<ContentTypeRule>,
}

impl Default for ContentValidator {
    fn default() -> Self {
        Self::new(IMAGE_RULES)
    }
}

impl ContentValidator {
    pub fn new(rules: impl Into<Vec<ContentTypeRule>>) -> Self {
        Self {
            rules: rules.into(),
        }
    }

    /// True when `mime_type` (parameters and case ignored) is accepted.
    pub fn is_allowed_type(&self, mime_type: &str) -> bool {
        self.extension_for(mime_type).is_some()
    }

    /// Extension (with leading dot) registered for `mime_type`.
    pub fn extension_for(&self, mime_type: &str) -> Option<&'static str> {
        let essence = essence(mime_type);
        self.rules
            .iter()
            .find(|rule| rule.mime_type == essence)
            .map(|rule| rule.extension)
    }
}

/// Lowercase MIME type with any `;` parameters removed.
pub fn essence(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Infer a MIME type from at most the first [`SNIFF_LEN`] bytes of `data`.
///
/// Always returns something; unknown binary data is `application/octet-stream`.
pub fn sniff_content_type(data: &[u8]) -> &'static str {
    let head = &data[..data.len().min(SNIFF_LEN)];

    if let Some(&(_, mime)) = SIGNATURES.iter().find(|(sig, _)| head.starts_with(sig)) {
        return mime;
    }

    // RIFF container with a WebP VP8/VP8L/VP8X chunk.
    if head.len() >= 14 && &head[0..4] == b"RIFF" && &head[8..14] == b"WEBPVP" {
        return "image/webp";
    }

    if head.iter().any(|&b| is_binary_byte(b)) {
        OCTET_STREAM
    } else {
        TEXT_PLAIN
    }
}

fn is_binary_byte(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}

//! Accepted image MIME types and the file extension each one maps to.

/// A single accepted content type together with the extension used when a
/// key has to be named from the type alone.
///
/// Acceptance and extension lookup read the same table, so a type can never be
/// accepted without also having an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentTypeRule {
    /// Lowercase MIME essence (no parameters), e.g. `image/png`.
    pub mime_type: &'static str,

    /// Extension including the leading dot, e.g. `.png`.
    pub extension: &'static str,
}

impl ContentTypeRule {
    pub const fn new(mime_type: &'static str, extension: &'static str) -> Self {
        Self {
            mime_type,
            extension,
        }
    }
}

/// Raster image types accepted by default.
pub const IMAGE_RULES: [ContentTypeRule; 5] = [
    ContentTypeRule::new("image/jpeg", ".jpg"),
    ContentTypeRule::new("image/png", ".png"),
    ContentTypeRule::new("image/gif", ".gif"),
    ContentTypeRule::new("image/webp", ".webp"),
    ContentTypeRule::new("image/bmp", ".bmp"),
];

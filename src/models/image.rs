//! Represents a stored image and the locator handed out for it.

use serde::Serialize;
use std::fmt;

/// Metadata for an image held in the object store.
///
/// The payload itself is owned by the remote store and is only ever streamed
/// through the gateway, never kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageObject {
    /// Storage key, unique within the bucket and immutable once assigned.
    pub key: String,

    /// Validated MIME type (one of the accepted image types).
    pub content_type: String,

    /// Size in bytes, when the store reports it.
    pub size_bytes: Option<u64>,
}

/// Externally visible reference to a stored image.
///
/// Either the bare key or `<base>/<bucket>/<key>`, depending on how the
/// gateway is deployed. Handlers only ever see locators, never raw keys.
#[derive(Serialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Locator(String);

impl Locator {
    pub(crate) fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Locator {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

//! Storage key generation.
//!
//! Keys are a random v4 UUID followed by the extension of the uploaded file's
//! original name. The caller's name is never used as the key itself, so two
//! uploads of `photo.jpg` never overwrite each other.

use uuid::Uuid;

/// Longest extension (dot included) carried over into a key.
const MAX_EXTENSION_LEN: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct KeyGenerator;

impl KeyGenerator {
    /// New key keeping `original_name`'s extension, falling back to
    /// `fallback_extension` when the name carries no usable one.
    pub fn generate_key(&self, original_name: &str, fallback_extension: Option<&str>) -> String {
        self.with_extension(extension_of(original_name).or(fallback_extension))
    }

    /// New key with exactly the given extension (leading dot included).
    pub fn with_extension(&self, extension: Option<&str>) -> String {
        let id = Uuid::new_v4();
        match extension {
            Some(ext) => format!("{}{}", id, ext),
            None => id.to_string(),
        }
    }
}

/// Extension of the last path component of `name`, dot included.
///
/// Dotfiles (`.bashrc`) have no extension, and extensions containing anything
/// other than ASCII alphanumerics are dropped rather than copied into a key.
pub fn extension_of(name: &str) -> Option<&str> {
    let file = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let dot = file.rfind('.')?;
    if dot == 0 {
        return None;
    }

    let ext = &file[dot..];
    let valid = ext.len() > 1
        && ext.len() <= MAX_EXTENSION_LEN
        && ext[1..].bytes().all(|b| b.is_ascii_alphanumeric());
    valid.then_some(ext)
}

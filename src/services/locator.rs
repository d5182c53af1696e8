//! Conversion between storage keys and the locators handed to callers.

use super::object_store::validate_key;
use crate::models::image::Locator;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid locator `{locator}`: {reason}")]
pub struct InvalidLocator {
    pub locator: String,
    pub reason: &'static str,
}

/// Renders keys as locators and recovers the exact key from a locator.
///
/// With a public base URL, locators are `<base>/<bucket>/<key>`; otherwise the
/// locator is the bare key. Bare keys are accepted in both modes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocatorCodec {
    /// `<base>/<bucket>/`, when locators are URLs.
    prefix: Option<String>,
}

impl LocatorCodec {
    pub fn bare() -> Self {
        Self::default()
    }

    pub fn public(base_url: &str, bucket: &str) -> Self {
        Self {
            prefix: Some(format!("{}/{}/", base_url.trim_end_matches('/'), bucket)),
        }
    }

    pub fn locator_for(&self, key: &str) -> Locator {
        match &self.prefix {
            Some(prefix) => Locator::new(format!("{}{}", prefix, key)),
            None => Locator::new(key),
        }
    }

    pub fn key_for(&self, locator: &str) -> Result<String, InvalidLocator> {
        let invalid = |reason| InvalidLocator {
            locator: locator.to_string(),
            reason,
        };

        let locator = locator.trim();
        if locator.is_empty() {
            return Err(invalid("locator is empty"));
        }

        let key = match self.prefix.as_deref().and_then(|p| locator.strip_prefix(p)) {
            Some(key) => key,
            None if locator.contains("://") => {
                return Err(invalid("URL does not belong to this gateway"));
            }
            None => locator,
        };

        validate_key(key).map_err(|_| invalid("not a valid storage key"))?;
        Ok(key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_locators_are_keys() {
        let codec = LocatorCodec::bare();
        let locator = codec.locator_for("abc.png");
        assert_eq!(locator.as_str(), "abc.png");
        assert_eq!(codec.key_for(locator.as_str()).unwrap(), "abc.png");
    }

    #[test]
    fn public_locators_round_trip() {
        let codec = LocatorCodec::public("https://cdn.example.com/", "images");
        let locator = codec.locator_for("nested/abc.png");
        assert_eq!(
            locator.as_str(),
            "https://cdn.example.com/images/nested/abc.png"
        );
        assert_eq!(codec.key_for(locator.as_str()).unwrap(), "nested/abc.png");
        assert_eq!(codec.key_for("abc.png").unwrap(), "abc.png");
    }

    #[test]
    fn rejects_foreign_and_malformed_locators() {
        let codec = LocatorCodec::public("https://cdn.example.com", "images");
        for bad in [
            "",
            "   ",
            "https://elsewhere.example.com/images/abc.png",
            "https://cdn.example.com/images/",
            "../etc/passwd",
        ] {
            assert!(codec.key_for(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}

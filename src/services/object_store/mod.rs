//! Capability interface over the remote blob store.
//!
//! The image repository only ever talks to an [`ObjectStore`]: put, get,
//! delete and paginated list over a flat key space. One adapter is selected
//! per deployment by [`build_store`].

pub mod filesystem;
pub mod memory;
pub mod s3;

#[cfg(test)]
pub mod testing;

use crate::config::{Backend, StoreConfig};
use anyhow::Context;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use futures::Stream;
use std::{fmt, io, pin::Pin, sync::Arc};
use thiserror::Error;

pub use filesystem::FileSystemStore;
pub use memory::InMemoryStore;
pub use s3::S3Store;

/// Streaming object body, used for both uploads and downloads.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

const MAX_OBJECT_KEY_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("object store unavailable: {0}")]
    Unavailable(String),
    #[error("object store rejected the request: {0}")]
    Rejected(String),
    #[error("operation cancelled: {0}")]
    Cancelled(String),
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Failures that may clear up if the call is repeated later.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// An object fetched from the store.
pub struct StoredObject {
    pub key: String,

    /// Content type recorded at write time; `None` when the store has none.
    pub content_type: Option<String>,

    pub size_bytes: Option<u64>,

    pub body: ByteStream,
}

impl fmt::Debug for StoredObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredObject")
            .field("key", &self.key)
            .field("content_type", &self.content_type)
            .field("size_bytes", &self.size_bytes)
            .finish_non_exhaustive()
    }
}

/// One page of a listing. An absent `next_token` ends the walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub next_token: Option<String>,
}

/// Remote blob store operations.
///
/// Implementations hold no per-request state and must be safe to call from
/// many requests at once.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stream `body` to the store under `key`, recording `content_type`.
    ///
    /// The body must be streamed, never collected whole.
    async fn put(&self, key: &str, body: ByteStream, content_type: &str) -> StoreResult<()>;

    /// Fetch `key`. Fails with [`StoreError::NotFound`] when it is absent.
    async fn get(&self, key: &str) -> StoreResult<StoredObject>;

    /// Remove `key`. Adapters report [`StoreError::NotFound`] when they can
    /// tell the key was absent; callers decide whether that matters.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// One page of keys starting with `prefix`, resuming after `continuation_token`.
    async fn list(
        &self,
        prefix: Option<&str>,
        continuation_token: Option<&str>,
    ) -> StoreResult<ListPage>;

    /// Short backend name used in logs and readiness output.
    fn backend(&self) -> &'static str;
}

/// Build the configured adapter.
///
/// Only the S3 adapter talks to a network; it retries failed requests itself
/// using `max_attempts` and `retry_base_delay`.
pub fn build_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config.backend {
        Backend::S3 => {
            Arc::new(S3Store::from_config(config).context("building S3 object store")?)
        }
        Backend::FileSystem => Arc::new(
            FileSystemStore::new(&config.storage_dir, &config.bucket)
                .with_page_size(config.list_page_size),
        ),
        Backend::Memory => {
            Arc::new(InMemoryStore::new().with_page_size(config.list_page_size))
        }
    };
    Ok(store)
}

/// Basic key validation shared by every adapter.
///
/// Rejects empty or oversized keys, leading `/`, `..` segments and control
/// characters.
pub fn validate_key(key: &str) -> StoreResult<()> {
    let invalid = key.is_empty()
        || key.len() > MAX_OBJECT_KEY_LEN
        || key.starts_with('/')
        || key.split('/').any(|segment| segment == ".." || segment == ".")
        || key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\');
    if invalid {
        Err(StoreError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

/// Slice one page out of an ascending key sequence.
///
/// Tokens are the base64 form of the last key on the previous page.
pub(crate) fn paginate<I>(
    sorted_keys: I,
    prefix: Option<&str>,
    continuation_token: Option<&str>,
    page_size: usize,
) -> ListPage
where
    I: IntoIterator<Item = String>,
{
    let start_after = continuation_token.map(decode_continuation_token);
    let fetch_limit = page_size.max(1) + 1;

    let mut keys: Vec<String> = sorted_keys
        .into_iter()
        .filter(|key| prefix.is_none_or(|p| key.starts_with(p)))
        .filter(|key| {
            start_after
                .as_deref()
                .is_none_or(|after| key.as_str() > after)
        })
        .take(fetch_limit)
        .collect();

    let mut next_token = None;
    if keys.len() == fetch_limit {
        keys.pop();
        next_token = keys.last().map(|last| encode_continuation_token(last));
    }

    ListPage { keys, next_token }
}

pub(crate) fn encode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD.encode(token)
}

pub(crate) fn decode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("k{:03}", i)).collect()
    }

    #[test]
    fn rejects_unsafe_keys() {
        assert!(validate_key("ok.png").is_ok());
        assert!(validate_key("nested/ok.png").is_ok());
        for bad in ["", "/abs", "a/../b", "..", "tab\tkey", "back\\slash"] {
            assert!(
                matches!(validate_key(bad), Err(StoreError::InvalidKey(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_key(&"a".repeat(MAX_OBJECT_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn pagination_walks_every_key_once() {
        let all = keys(7);
        let mut seen = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = paginate(all.clone(), None, token.as_deref(), 3);
            assert!(page.keys.len() <= 3);
            seen.extend(page.keys);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, all);
    }

    #[test]
    fn exact_multiple_of_page_size_has_no_empty_trailing_page() {
        let all = keys(4);
        let first = paginate(all.clone(), None, None, 2);
        let second = paginate(all.clone(), None, first.next_token.as_deref(), 2);
        assert_eq!(second.keys, vec!["k002", "k003"]);
        assert_eq!(second.next_token, None);
    }

    #[test]
    fn pagination_honours_prefix() {
        let all = vec!["a1".to_string(), "b1".into(), "b2".into(), "c1".into()];
        let page = paginate(all, Some("b"), None, 10);
        assert_eq!(page.keys, vec!["b1", "b2"]);
        assert_eq!(page.next_token, None);
    }

    #[test]
    fn undecodable_tokens_are_used_verbatim() {
        assert_eq!(decode_continuation_token("not base64!"), "not base64!");
        let token = encode_continuation_token("k001");
        assert_eq!(decode_continuation_token(&token), "k001");
    }
}

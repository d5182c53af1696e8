//! Image operations on top of an [`ObjectStore`].
//!
//! The repository is the only place that combines validation, key generation
//! and the store. Callers hand it bodies and locators; storage keys never leave
//! this module except rendered as [`Locator`]s.

use super::{
    content_validator::{ContentValidator, SNIFF_LEN, essence, sniff_content_type},
    key_generator::KeyGenerator,
    locator::{InvalidLocator, LocatorCodec},
    object_store::{ByteStream, ObjectStore, StoreError, StoredObject, validate_key},
    scope::RequestScope,
};
use crate::models::image::{ImageObject, Locator};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt, future, stream};
use std::{fmt, io, str::FromStr, sync::Arc};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// Step of an operation a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationPhase {
    Validate,
    GenerateKey,
    Put,
    Get,
    Delete,
    List,
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationPhase::Validate => "validate",
            OperationPhase::GenerateKey => "generate-key",
            OperationPhase::Put => "put",
            OperationPhase::Get => "get",
            OperationPhase::Delete => "delete",
            OperationPhase::List => "list",
        })
    }
}

/// How [`ImageRepository::update`] replaces an image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Write the new image under a fresh key, then delete the old one. The
    /// locator changes; a failed write leaves the old image untouched.
    #[default]
    Replace,
    /// Delete the old image, then write the new one under the same key. The
    /// locator is stable, but a failed write loses the image.
    InPlace,
}

impl FromStr for UpdateStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(UpdateStrategy::Replace),
            "in-place" | "in_place" | "inplace" => Ok(UpdateStrategy::InPlace),
            other => Err(format!(
                "unknown update strategy `{}` (expected `replace` or `in-place`)",
                other
            )),
        }
    }
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdateStrategy::Replace => "replace",
            UpdateStrategy::InPlace => "in-place",
        })
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("content type `{content_type}` is not an accepted image type")]
    InvalidContentType { content_type: String },

    #[error("image `{key}` not found")]
    NotFound { key: String },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("storage unavailable during {phase}: {source}")]
    StorageUnavailable {
        phase: OperationPhase,
        source: StoreError,
    },

    /// The old image was deleted but its replacement could not be written.
    #[error("update of `{key}` deleted the original image but failed to write the new one: {source}")]
    PartialUpdateFailure {
        key: String,
        source: Box<ImageError>,
    },

    #[error("storage error during {phase}: {source}")]
    Storage {
        phase: OperationPhase,
        source: StoreError,
    },

    #[error("{phase} cancelled: {reason}")]
    Cancelled {
        phase: OperationPhase,
        reason: String,
    },
}

impl ImageError {
    /// Tag a store failure with the phase it happened in.
    pub fn from_store(phase: OperationPhase, err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => ImageError::NotFound { key },
            StoreError::Cancelled(reason) => ImageError::Cancelled { phase, reason },
            StoreError::InvalidKey(key) => {
                ImageError::BadRequest(format!("invalid storage key `{}`", key))
            }
            err if err.is_transient() => ImageError::StorageUnavailable { phase, source: err },
            err => ImageError::Storage { phase, source: err },
        }
    }
}

impl From<InvalidLocator> for ImageError {
    fn from(err: InvalidLocator) -> Self {
        ImageError::BadRequest(err.to_string())
    }
}

pub type ImageResult<T> = Result<T, ImageError>;

/// A validated image being streamed out of the store.
pub struct ImageDownload {
    pub object: ImageObject,
    pub body: ByteStream,
}

impl fmt::Debug for ImageDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageDownload")
            .field("object", &self.object)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct ImageRepository {
    store: Arc<dyn ObjectStore>,
    validator: ContentValidator,
    keys: KeyGenerator,
    locators: LocatorCodec,
    update_strategy: UpdateStrategy,
}

impl fmt::Debug for ImageRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRepository")
            .field("backend", &self.store.backend())
            .field("validator", &self.validator)
            .field("locators", &self.locators)
            .field("update_strategy", &self.update_strategy)
            .finish()
    }
}

impl ImageRepository {
    pub fn new(store: Arc<dyn ObjectStore>, locators: LocatorCodec) -> Self {
        Self {
            store,
            validator: ContentValidator::default(),
            keys: KeyGenerator,
            locators,
            update_strategy: UpdateStrategy::default(),
        }
    }

    pub fn with_update_strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.update_strategy = strategy;
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Store a new image and return its locator.
    ///
    /// The body is sniffed before anything is written; non-images never reach
    /// the store.
    #[instrument(skip(self, body, scope), fields(backend = self.store.backend()))]
    pub async fn create(
        &self,
        body: ByteStream,
        original_name: &str,
        scope: &RequestScope,
    ) -> ImageResult<Locator> {
        let (content_type, body) = self.validated_upload(body, scope).await?;

        let fallback = self.validator.extension_for(content_type);
        let key = self.keys.generate_key(original_name, fallback);
        validate_key(&key).map_err(|err| ImageError::from_store(OperationPhase::GenerateKey, err))?;

        self.put(&key, body, content_type, scope).await?;
        info!(key = %key, content_type, "image stored");
        Ok(self.locators.locator_for(&key))
    }

    /// Fetch an image, re-validating what the store holds.
    ///
    /// The recorded content type must be present and accepted, and the leading
    /// bytes must sniff to that same type.
    #[instrument(skip(self, scope), fields(backend = self.store.backend()))]
    pub async fn read(&self, locator: &str, scope: &RequestScope) -> ImageResult<ImageDownload> {
        let key = self.locators.key_for(locator)?;

        let (declared, size_bytes, head, body) = scope
            .run(async {
                let StoredObject {
                    content_type,
                    size_bytes,
                    body,
                    ..
                } = self.store.get(&key).await?;
                let (head, body) = peek_head(body).await?;
                Ok((content_type, size_bytes, head, body))
            })
            .await
            .map_err(|err| ImageError::from_store(OperationPhase::Get, err))?;

        let Some(declared) = declared.filter(|ct| !ct.trim().is_empty()) else {
            warn!(key = %key, "stored object has no content type");
            return Err(ImageError::InvalidContentType {
                content_type: "(none)".into(),
            });
        };
        if !self.validator.is_allowed_type(&declared) {
            warn!(key = %key, content_type = %declared, "stored object is not an accepted image");
            return Err(ImageError::InvalidContentType {
                content_type: declared,
            });
        }

        let content_type = essence(&declared);
        let sniffed = sniff_content_type(&head);
        if sniffed != content_type {
            warn!(key = %key, declared = %content_type, sniffed, "stored bytes do not match their content type");
            return Err(ImageError::InvalidContentType {
                content_type: sniffed.to_string(),
            });
        }

        Ok(ImageDownload {
            object: ImageObject {
                key,
                content_type,
                size_bytes,
            },
            body,
        })
    }

    /// [`read`](Self::read), collecting the whole body.
    pub async fn read_bytes(
        &self,
        locator: &str,
        scope: &RequestScope,
    ) -> ImageResult<(Bytes, ImageObject)> {
        let ImageDownload { object, body } = self.read(locator, scope).await?;
        let chunks: Vec<Bytes> = scope
            .run(async { body.try_collect().await.map_err(StoreError::from) })
            .await
            .map_err(|err| ImageError::from_store(OperationPhase::Get, err))?;
        Ok((Bytes::from(chunks.concat()), object))
    }

    /// Replace the image behind `locator` with `body`, following the configured
    /// [`UpdateStrategy`]. Returns the locator to use from now on.
    ///
    /// Concurrent updates of the same locator are not serialised; with
    /// [`UpdateStrategy::InPlace`] they can observe a transient `NotFound`.
    #[instrument(skip(self, body, scope), fields(backend = self.store.backend(), strategy = %self.update_strategy))]
    pub async fn update(
        &self,
        locator: &str,
        body: ByteStream,
        scope: &RequestScope,
    ) -> ImageResult<Locator> {
        let old_key = self.locators.key_for(locator)?;
        match self.update_strategy {
            UpdateStrategy::Replace => self.replace(old_key, body, scope).await,
            UpdateStrategy::InPlace => self.overwrite(old_key, body, scope).await,
        }
    }

    async fn replace(
        &self,
        old_key: String,
        body: ByteStream,
        scope: &RequestScope,
    ) -> ImageResult<Locator> {
        let (content_type, body) = self.validated_upload(body, scope).await?;

        let new_key = self
            .keys
            .with_extension(self.validator.extension_for(content_type));
        validate_key(&new_key)
            .map_err(|err| ImageError::from_store(OperationPhase::GenerateKey, err))?;
        self.put(&new_key, body, content_type, scope).await?;

        match scope.run(self.store.delete(&old_key)).await {
            Ok(()) => {
                info!(old_key = %old_key, new_key = %new_key, "image replaced");
            }
            Err(StoreError::NotFound(_)) => {
                if let Err(err) = self.store.delete(&new_key).await {
                    warn!(key = %new_key, error = %err, "failed to roll back replacement; object is orphaned");
                }
                return Err(ImageError::NotFound { key: old_key });
            }
            Err(err) => {
                warn!(
                    old_key = %old_key,
                    new_key = %new_key,
                    error = %err,
                    "image replaced but the old object could not be deleted; it is orphaned"
                );
            }
        }

        Ok(self.locators.locator_for(&new_key))
    }

    async fn overwrite(
        &self,
        key: String,
        body: ByteStream,
        scope: &RequestScope,
    ) -> ImageResult<Locator> {
        let (content_type, body) = self.validated_upload(body, scope).await?;

        scope
            .run(self.store.delete(&key))
            .await
            .map_err(|err| ImageError::from_store(OperationPhase::Delete, err))?;

        if let Err(err) = self.put(&key, body, content_type, scope).await {
            error!(key = %key, error = %err, "original image deleted but the replacement was not written");
            return Err(ImageError::PartialUpdateFailure {
                key,
                source: Box::new(err),
            });
        }

        info!(key = %key, content_type, "image overwritten");
        Ok(self.locators.locator_for(&key))
    }

    /// Remove an image. Removing an absent image succeeds.
    #[instrument(skip(self, scope), fields(backend = self.store.backend()))]
    pub async fn delete(&self, locator: &str, scope: &RequestScope) -> ImageResult<()> {
        let key = self.locators.key_for(locator)?;
        match scope.run(self.store.delete(&key)).await {
            Ok(()) => {
                info!(key = %key, "image deleted");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => {
                info!(key = %key, "image already absent");
                Ok(())
            }
            Err(err) => Err(ImageError::from_store(OperationPhase::Delete, err)),
        }
    }

    /// Lazily walk every stored image under `prefix`, following continuation
    /// tokens. Each call starts a fresh walk.
    pub fn enumerate<'a>(
        &'a self,
        prefix: Option<&'a str>,
        scope: &'a RequestScope,
    ) -> impl Stream<Item = ImageResult<Locator>> + Send + 'a {
        enum Cursor {
            Start,
            Next(String),
            Done,
        }

        stream::try_unfold(Cursor::Start, move |cursor| async move {
            let token = match cursor {
                Cursor::Start => None,
                Cursor::Next(token) => Some(token),
                Cursor::Done => return Ok::<_, ImageError>(None),
            };

            let page = scope
                .run(self.store.list(prefix, token.as_deref()))
                .await
                .map_err(|err| ImageError::from_store(OperationPhase::List, err))?;

            let next = match page.next_token {
                Some(next) if Some(&next) == token.as_ref() => {
                    warn!(token = %next, "store returned the same continuation token twice; stopping");
                    Cursor::Done
                }
                Some(next) => Cursor::Next(next),
                None => Cursor::Done,
            };
            Ok(Some((page.keys, next)))
        })
        .map_ok(|keys| stream::iter(keys.into_iter().map(Ok::<_, ImageError>)))
        .try_flatten()
        .map_ok(move |key| self.locators.locator_for(&key))
    }

    /// Sniff an upload and check it against the allow-list.
    async fn validated_upload(
        &self,
        body: ByteStream,
        scope: &RequestScope,
    ) -> ImageResult<(&'static str, ByteStream)> {
        let (head, body) = scope
            .run(async { peek_head(body).await.map_err(StoreError::from) })
            .await
            .map_err(|err| match err {
                StoreError::Io(err) => {
                    ImageError::BadRequest(format!("failed to read image body: {}", err))
                }
                other => ImageError::from_store(OperationPhase::Validate, other),
            })?;

        if head.is_empty() {
            return Err(ImageError::BadRequest("image body is empty".into()));
        }

        let content_type = sniff_content_type(&head);
        if !self.validator.is_allowed_type(content_type) {
            info!(content_type, "rejected upload that is not an accepted image");
            return Err(ImageError::InvalidContentType {
                content_type: content_type.to_string(),
            });
        }
        Ok((content_type, body))
    }

    async fn put(
        &self,
        key: &str,
        body: ByteStream,
        content_type: &str,
        scope: &RequestScope,
    ) -> ImageResult<()> {
        scope
            .run(self.store.put(key, body, content_type))
            .await
            .map_err(|err| ImageError::from_store(OperationPhase::Put, err))
    }
}

/// Buffer up to [`SNIFF_LEN`] leading bytes of `body`.
///
/// Returns those bytes and a stream that yields the complete body again.
async fn peek_head(mut body: ByteStream) -> io::Result<(Bytes, ByteStream)> {
    let mut head = BytesMut::new();
    let mut exhausted = false;
    while head.len() < SNIFF_LEN {
        match body.next().await {
            Some(chunk) => head.extend_from_slice(&chunk?),
            None => {
                exhausted = true;
                break;
            }
        }
    }

    let head = head.freeze();
    let rest: ByteStream = if exhausted {
        Box::pin(stream::empty())
    } else {
        body
    };
    let replay = stream::once(future::ready(Ok(head.clone()))).chain(rest);
    Ok((head, Box::pin(replay)))
}

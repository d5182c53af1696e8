//! S3-compatible adapter built on the `object_store` crate.
//!
//! Works against AWS, Cloudflare R2, MinIO and other S3-like stores. Request
//! signing, credential discovery and retries of failed requests come from
//! `object_store`; this module maps its model onto [`ObjectStore`]. Uploads are
//! streamed: bodies up to `part_size` go out as a single PUT, anything larger
//! as a multipart upload that buffers one part at a time.

use super::{
    ByteStream, ListPage, ObjectStore, StoreError, StoreResult, StoredObject,
    decode_continuation_token, encode_continuation_token, validate_key,
};
use crate::config::{CredentialSource, StoreConfig};
use ::object_store::{
    Attribute, Attributes, BackoffConfig, ClientOptions, ObjectStore as RemoteStore,
    PutMultipartOpts, PutOptions, PutPayload, RetryConfig, WriteMultipart,
    aws::AmazonS3Builder, path::Path,
};
use anyhow::{Context, bail};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use std::{env, io, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

const DEFAULT_PAGE_SIZE: usize = 1000;
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;
/// Parts uploaded concurrently during a multipart upload.
const MAX_CONCURRENT_PARTS: usize = 2;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Variables the `object_store` credential chain can pick up on its own.
const ENV_CREDENTIAL_HINTS: [&str; 2] = [
    "AWS_WEB_IDENTITY_TOKEN_FILE",
    "AWS_CONTAINER_CREDENTIALS_RELATIVE_URI",
];

#[derive(Debug, Clone)]
pub struct S3Store {
    client: Arc<dyn RemoteStore>,
    page_size: usize,
    part_size: usize,
}

impl S3Store {
    /// Adapter over an already configured `object_store` client.
    pub fn new(client: Arc<dyn RemoteStore>) -> Self {
        Self {
            client,
            page_size: DEFAULT_PAGE_SIZE,
            part_size: DEFAULT_PART_SIZE,
        }
    }

    pub fn from_config(config: &StoreConfig) -> anyhow::Result<Self> {
        if config.bucket.is_empty() {
            bail!("a bucket name is required");
        }

        let builder = match config.credentials {
            CredentialSource::Env => {
                if !env_credentials_present(|name| env::var(name).ok()) {
                    warn!(
                        "no AWS credentials found in the environment; requests will use \
                         instance metadata credentials and fail if none are available"
                    );
                }
                AmazonS3Builder::from_env()
            }
            CredentialSource::Static => {
                let (Some(access_key_id), Some(secret_access_key)) =
                    (&config.access_key_id, &config.secret_access_key)
                else {
                    bail!("static credentials need both an access key id and a secret access key");
                };
                AmazonS3Builder::new()
                    .with_access_key_id(access_key_id)
                    .with_secret_access_key(secret_access_key)
            }
            CredentialSource::Anonymous => AmazonS3Builder::new().with_skip_signature(true),
        };

        let mut builder = builder
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_retry(retry_config(config))
            .with_client_options(ClientOptions::new().with_timeout(config.request_timeout));
        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint.trim_end_matches('/'))
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let client = builder
            .build()
            .with_context(|| format!("configuring S3 bucket `{}`", config.bucket))?;
        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = ?config.endpoint,
            credentials = ?config.credentials,
            "S3 client configured"
        );

        Ok(Self::new(Arc::new(client))
            .with_page_size(config.list_page_size)
            .with_part_size(config.multipart_part_size))
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, 1000);
        self
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    async fn put_multipart(
        &self,
        key: &str,
        path: &Path,
        first_part: Bytes,
        mut body: ByteStream,
        attributes: Attributes,
    ) -> StoreResult<()> {
        let mut opts = PutMultipartOpts::default();
        opts.attributes = attributes;
        let upload = self
            .client
            .put_multipart_opts(path, opts)
            .await
            .map_err(|err| store_error(key, err))?;
        debug!(key, part_size = self.part_size, "started multipart upload");

        let mut writer = WriteMultipart::new_with_chunk_size(upload, self.part_size);
        let streamed = async {
            writer.write(&first_part);
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                writer
                    .wait_for_capacity(MAX_CONCURRENT_PARTS)
                    .await
                    .map_err(|err| store_error(key, err))?;
                writer.write(&chunk);
            }
            Ok::<_, StoreError>(())
        }
        .await;

        match streamed {
            Ok(()) => {
                writer.finish().await.map_err(|err| store_error(key, err))?;
                Ok(())
            }
            Err(err) => {
                if let Err(abort_err) = writer.abort().await {
                    warn!(key, error = %abort_err, "failed to abort multipart upload");
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, mut body: ByteStream, content_type: &str) -> StoreResult<()> {
        let path = object_path(key)?;
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, content_type.to_string().into());

        let (first, exhausted) = read_part(&mut body, self.part_size).await?;
        if !exhausted {
            return self
                .put_multipart(key, &path, first, body, attributes)
                .await;
        }

        let mut opts = PutOptions::default();
        opts.attributes = attributes;
        self.client
            .put_opts(&path, PutPayload::from(first), opts)
            .await
            .map_err(|err| store_error(key, err))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<StoredObject> {
        let path = object_path(key)?;
        let result = self
            .client
            .get(&path)
            .await
            .map_err(|err| store_error(key, err))?;

        let content_type = result
            .attributes
            .get(&Attribute::ContentType)
            .map(|value| AsRef::<str>::as_ref(value).to_string());
        let size_bytes = u64::try_from(result.meta.size).ok();
        let body = result.into_stream().map_err(io::Error::other);

        Ok(StoredObject {
            key: key.to_string(),
            content_type,
            size_bytes,
            body: Box::pin(body),
        })
    }

    /// S3 reports success for absent keys, so this never yields `NotFound`.
    async fn delete(&self, key: &str) -> StoreResult<()> {
        let path = object_path(key)?;
        self.client
            .delete(&path)
            .await
            .map_err(|err| store_error(key, err))
    }

    async fn list(
        &self,
        prefix: Option<&str>,
        continuation_token: Option<&str>,
    ) -> StoreResult<ListPage> {
        let prefix = prefix.filter(|p| !p.is_empty());
        // Listing prefixes are whole path segments; narrow by string afterwards.
        let parent = prefix
            .and_then(|p| p.rfind('/').map(|slash| &p[..slash]))
            .filter(|dir| !dir.is_empty())
            .map(Path::from);
        let start_after = continuation_token.map(decode_continuation_token);

        let mut listing = match &start_after {
            Some(after) => self
                .client
                .list_with_offset(parent.as_ref(), &Path::from(after.as_str())),
            None => self.client.list(parent.as_ref()),
        };

        let mut keys = Vec::new();
        while let Some(meta) = listing
            .try_next()
            .await
            .map_err(|err| store_error(prefix.unwrap_or_default(), err))?
        {
            let key = meta.location.to_string();
            if let Some(p) = prefix {
                if !key.starts_with(p) {
                    // Keys arrive sorted, so nothing after this can match.
                    if key.as_str() > p {
                        break;
                    }
                    continue;
                }
            }
            keys.push(key);
            if keys.len() > self.page_size {
                break;
            }
        }

        let mut next_token = None;
        if keys.len() > self.page_size {
            keys.pop();
            next_token = keys.last().map(|last| encode_continuation_token(last));
        }
        Ok(ListPage { keys, next_token })
    }

    fn backend(&self) -> &'static str {
        "s3"
    }
}

fn object_path(key: &str) -> StoreResult<Path> {
    validate_key(key)?;
    Path::parse(key).map_err(|_| StoreError::InvalidKey(key.to_string()))
}

/// Read from `body` until at least `part_size` bytes are buffered or the
/// stream ends. The flag is true when the stream is exhausted.
async fn read_part(body: &mut ByteStream, part_size: usize) -> StoreResult<(Bytes, bool)> {
    let mut buf = BytesMut::new();
    while buf.len() < part_size {
        match body.next().await {
            Some(chunk) => buf.extend_from_slice(&chunk?),
            None => return Ok((buf.freeze(), true)),
        }
    }
    Ok((buf.freeze(), false))
}

fn retry_config(config: &StoreConfig) -> RetryConfig {
    let mut backoff = BackoffConfig::default();
    backoff.init_backoff = config.retry_base_delay;
    backoff.max_backoff = MAX_RETRY_DELAY;
    backoff.base = 2.0;

    let mut retry = RetryConfig::default();
    retry.backoff = backoff;
    retry.max_retries = config.max_attempts.saturating_sub(1) as usize;
    retry.retry_timeout = config.request_timeout;
    retry
}

/// True when the environment carries static keys or a web identity /
/// container credential source.
fn env_credentials_present<F>(lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let set = |name: &str| lookup(name).is_some_and(|value| !value.trim().is_empty());
    (set("AWS_ACCESS_KEY_ID") && set("AWS_SECRET_ACCESS_KEY"))
        || ENV_CREDENTIAL_HINTS.iter().any(|name| set(name))
}

/// Map an `object_store` failure onto the store error taxonomy.
///
/// `object_store` has already retried transient failures by the time one
/// surfaces here; what remains as `Generic` is an exhausted retry or a
/// transport fault.
fn store_error(key: &str, err: ::object_store::Error) -> StoreError {
    use ::object_store::Error;
    match err {
        Error::NotFound { .. } => StoreError::NotFound(key.to_string()),
        Error::InvalidPath { .. } => StoreError::InvalidKey(key.to_string()),
        Error::Generic { store, source } => {
            StoreError::Unavailable(format!("{}: {}", store, source))
        }
        other => StoreError::Rejected(other.to_string()),
    }
}

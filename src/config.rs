use crate::services::{image_repository::UpdateStrategy, object_store::s3::DEFAULT_PART_SIZE};
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, fmt, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "IMAGE_GATEWAY_";

/// S3 rejects non-final parts below 5 MiB.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
    /// When set, locators are `<public_base_url>/<bucket>/<key>` instead of bare keys.
    pub public_base_url: Option<String>,
    pub update_strategy: UpdateStrategy,
    pub store: StoreConfig,
}

/// Everything needed to build the object store adapter.
#[derive(Clone)]
pub struct StoreConfig {
    pub backend: Backend,
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub credentials: CredentialSource,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub list_page_size: usize,
    /// Bodies larger than this are uploaded to S3 in parts of this size.
    pub multipart_part_size: usize,
    /// Root directory for the filesystem backend.
    pub storage_dir: String,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("backend", &self.backend)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("credentials", &self.credentials)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("request_timeout", &self.request_timeout)
            .field("max_attempts", &self.max_attempts)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("list_page_size", &self.list_page_size)
            .field("multipart_part_size", &self.multipart_part_size)
            .field("storage_dir", &self.storage_dir)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    S3,
    #[default]
    FileSystem,
    Memory,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "s3" => Ok(Backend::S3),
            "filesystem" | "fs" | "local" => Ok(Backend::FileSystem),
            "memory" | "mem" => Ok(Backend::Memory),
            other => Err(format!(
                "unknown backend `{}` (expected `s3`, `filesystem` or `memory`)",
                other
            )),
        }
    }
}

/// Where the S3 adapter gets its credentials from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`.
    Env,
    /// The configured access key id and secret.
    Static,
    /// Unsigned requests.
    Anonymous,
}

impl FromStr for CredentialSource {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "env" => Ok(CredentialSource::Env),
            "static" => Ok(CredentialSource::Static),
            "anonymous" | "none" => Ok(CredentialSource::Anonymous),
            other => Err(format!(
                "unknown credential source `{}` (expected `env`, `static` or `anonymous`)",
                other
            )),
        }
    }
}

/// Command-line + environment configuration.
///
/// Every flag falls back to `IMAGE_GATEWAY_<FLAG>` in the environment, then to
/// a built-in default.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Image gateway over S3-compatible object storage")]
pub struct Args {
    /// Host to bind to (overrides IMAGE_GATEWAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides IMAGE_GATEWAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Largest accepted request body in bytes (overrides IMAGE_GATEWAY_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Base URL used to build public locators (overrides IMAGE_GATEWAY_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// `replace` or `in-place` (overrides IMAGE_GATEWAY_UPDATE_STRATEGY)
    #[arg(long)]
    pub update_strategy: Option<UpdateStrategy>,

    /// `s3`, `filesystem` or `memory` (overrides IMAGE_GATEWAY_BACKEND)
    #[arg(long)]
    pub backend: Option<Backend>,

    /// S3 endpoint URL (overrides IMAGE_GATEWAY_ENDPOINT)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// S3 signing region (overrides IMAGE_GATEWAY_REGION)
    #[arg(long)]
    pub region: Option<String>,

    /// Bucket holding the images (overrides IMAGE_GATEWAY_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// `env`, `static` or `anonymous` (overrides IMAGE_GATEWAY_CREDENTIALS)
    #[arg(long)]
    pub credentials: Option<CredentialSource>,

    /// Static access key id (overrides IMAGE_GATEWAY_ACCESS_KEY_ID)
    #[arg(long)]
    pub access_key_id: Option<String>,

    /// Static secret access key (overrides IMAGE_GATEWAY_SECRET_ACCESS_KEY)
    #[arg(long)]
    pub secret_access_key: Option<String>,

    /// Per-request timeout in seconds (overrides IMAGE_GATEWAY_REQUEST_TIMEOUT)
    #[arg(long)]
    pub request_timeout: Option<u64>,

    /// Attempts per retried store call (overrides IMAGE_GATEWAY_MAX_ATTEMPTS)
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// First retry delay in milliseconds (overrides IMAGE_GATEWAY_RETRY_BASE_DELAY_MS)
    #[arg(long)]
    pub retry_base_delay_ms: Option<u64>,

    /// Keys per list page (overrides IMAGE_GATEWAY_LIST_PAGE_SIZE)
    #[arg(long)]
    pub list_page_size: Option<usize>,

    /// S3 multipart part size in bytes (overrides IMAGE_GATEWAY_MULTIPART_PART_SIZE)
    #[arg(long)]
    pub multipart_part_size: Option<usize>,

    /// Root directory of the filesystem backend (overrides IMAGE_GATEWAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::resolve(Args::parse(), |name| env::var(name))
    }

    /// Merge `args` over the variables returned by `lookup`, over defaults.
    pub fn resolve<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let env = EnvSource { lookup };

        let access_key_id = args.access_key_id.or(env.string("ACCESS_KEY_ID")?);
        let secret_access_key = args.secret_access_key.or(env.string("SECRET_ACCESS_KEY")?);
        let default_credentials = if access_key_id.is_some() && secret_access_key.is_some() {
            CredentialSource::Static
        } else {
            CredentialSource::Env
        };

        let store = StoreConfig {
            backend: args.backend.or(env.parse("BACKEND")?).unwrap_or_default(),
            endpoint: args.endpoint.or(env.string("ENDPOINT")?),
            region: args
                .region
                .or(env.string("REGION")?)
                .unwrap_or_else(|| "auto".into()),
            bucket: args
                .bucket
                .or(env.string("BUCKET")?)
                .unwrap_or_else(|| "images".into()),
            credentials: args
                .credentials
                .or(env.parse("CREDENTIALS")?)
                .unwrap_or(default_credentials),
            access_key_id,
            secret_access_key,
            request_timeout: Duration::from_secs(
                args.request_timeout
                    .or(env.parse("REQUEST_TIMEOUT")?)
                    .unwrap_or(30),
            ),
            max_attempts: args
                .max_attempts
                .or(env.parse("MAX_ATTEMPTS")?)
                .unwrap_or(3),
            retry_base_delay: Duration::from_millis(
                args.retry_base_delay_ms
                    .or(env.parse("RETRY_BASE_DELAY_MS")?)
                    .unwrap_or(100),
            ),
            list_page_size: args
                .list_page_size
                .or(env.parse("LIST_PAGE_SIZE")?)
                .unwrap_or(1000),
            multipart_part_size: args
                .multipart_part_size
                .or(env.parse("MULTIPART_PART_SIZE")?)
                .unwrap_or(DEFAULT_PART_SIZE),
            storage_dir: args
                .storage_dir
                .or(env.string("STORAGE_DIR")?)
                .unwrap_or_else(|| "./data/objects".into()),
        };

        let cfg = Self {
            host: args
                .host
                .or(env.string("HOST")?)
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: args.port.or(env.parse("PORT")?).unwrap_or(8080),
            max_upload_bytes: args
                .max_upload_bytes
                .or(env.parse("MAX_UPLOAD_BYTES")?)
                .unwrap_or(10 * 1024 * 1024),
            public_base_url: args.public_base_url.or(env.string("PUBLIC_BASE_URL")?),
            update_strategy: args
                .update_strategy
                .or(env.parse("UPDATE_STRATEGY")?)
                .unwrap_or_default(),
            store,
        };

        if cfg.max_upload_bytes == 0 {
            anyhow::bail!("max upload bytes must be greater than zero");
        }
        if cfg.store.list_page_size == 0 {
            anyhow::bail!("list page size must be greater than zero");
        }
        if cfg.store.multipart_part_size < MIN_PART_SIZE {
            anyhow::bail!(
                "multipart part size must be at least {} bytes",
                MIN_PART_SIZE
            );
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Prefixed environment lookups.
struct EnvSource<F> {
    lookup: F,
}

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Result<String, env::VarError>,
{
    fn string(&self, name: &str) -> Result<Option<String>> {
        let var = format!("{}{}", ENV_PREFIX, name);
        match (self.lookup)(&var) {
            Ok(value) if value.trim().is_empty() => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(env::VarError::NotPresent) => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", var)),
        }
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let Some(value) = self.string(name)? else {
            return Ok(None);
        };
        value.trim().parse::<T>().map(Some).map_err(|err| {
            anyhow::anyhow!(
                "parsing {}{} value `{}`: {}",
                ENV_PREFIX,
                name,
                value,
                err
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(cli: &[&str], vars: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("{}{}", ENV_PREFIX, k), v.to_string()))
            .collect();
        let args = Args::parse_from(std::iter::once("image-gateway").chain(cli.iter().copied()));
        AppConfig::resolve(args, |name| {
            vars.get(name).cloned().ok_or(env::VarError::NotPresent)
        })
    }

    #[test]
    fn defaults_apply_without_input() {
        let cfg = resolve(&[], &[]).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:8080");
        assert_eq!(cfg.max_upload_bytes, 10 * 1024 * 1024);
        assert_eq!(cfg.update_strategy, UpdateStrategy::Replace);
        assert_eq!(cfg.public_base_url, None);
        assert_eq!(cfg.store.backend, Backend::FileSystem);
        assert_eq!(cfg.store.bucket, "images");
        assert_eq!(cfg.store.region, "auto");
        assert_eq!(cfg.store.credentials, CredentialSource::Env);
        assert_eq!(cfg.store.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.store.max_attempts, 3);
        assert_eq!(cfg.store.list_page_size, 1000);
        assert_eq!(cfg.store.multipart_part_size, 8 * 1024 * 1024);
    }

    #[test]
    fn cli_flags_override_environment() {
        let cfg = resolve(
            &["--port", "9000", "--backend", "memory", "--update-strategy", "in-place"],
            &[("PORT", "7000"), ("BACKEND", "s3"), ("BUCKET", "photos")],
        )
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.store.backend, Backend::Memory);
        assert_eq!(cfg.update_strategy, UpdateStrategy::InPlace);
        assert_eq!(cfg.store.bucket, "photos");
    }

    #[test]
    fn static_keys_select_static_credentials() {
        let cfg = resolve(
            &[],
            &[("ACCESS_KEY_ID", "AKID"), ("SECRET_ACCESS_KEY", "shh")],
        )
        .unwrap();
        assert_eq!(cfg.store.credentials, CredentialSource::Static);

        let cfg = resolve(
            &["--credentials", "anonymous"],
            &[("ACCESS_KEY_ID", "AKID"), ("SECRET_ACCESS_KEY", "shh")],
        )
        .unwrap();
        assert_eq!(cfg.store.credentials, CredentialSource::Anonymous);
    }

    #[test]
    fn bad_environment_values_are_reported() {
        let err = resolve(&[], &[("PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("IMAGE_GATEWAY_PORT"), "{err}");

        let err = resolve(&[], &[("BACKEND", "floppy")]).unwrap_err();
        assert!(err.to_string().contains("floppy"), "{err}");

        assert!(resolve(&[], &[("LIST_PAGE_SIZE", "0")]).is_err());
        assert!(resolve(&["--multipart-part-size", "1024"], &[]).is_err());
    }

    #[test]
    fn debug_output_hides_the_secret_key() {
        let cfg = resolve(&["--secret-access-key", "hunter2"], &[]).unwrap();
        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("hunter2"));
    }
}

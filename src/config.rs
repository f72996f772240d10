use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{MirrorError, Result};
use crate::relay::DEFAULT_CHUNK_SIZE;
use crate::retry::RetryPolicy;

/// Public GraphQL endpoint of the OpenNeuro metadata API.
pub const DEFAULT_MANIFEST_ENDPOINT: &str = "https://openneuro.org/crn/graphql";

/// Default number of files transferred at once.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub manifest: ManifestConfig,
    pub source: SourceConfig,
    pub transfer: TransferConfig,
    pub store: StoreConfig,
}

/// Metadata API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    pub endpoint: String,
    /// Overall deadline for one query, in seconds.
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_MANIFEST_ENDPOINT.into(),
            timeout_secs: 60,
            retry: RetryPolicy::default(),
        }
    }
}

/// Download settings for file sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Path-style HTTPS gateway used to fetch `s3://` locations.
    pub s3_gateway: String,
    pub connect_timeout_secs: u64,
    /// Overall deadline for one file download. Sized for multi-gigabyte images.
    pub download_timeout_secs: u64,
    /// A download that yields no bytes for this long is treated as failed.
    pub inactivity_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            s3_gateway: "https://s3.amazonaws.com".into(),
            connect_timeout_secs: 10,
            download_timeout_secs: 6 * 60 * 60,
            inactivity_timeout_secs: 120,
        }
    }
}

/// Smallest non-final part AWS S3 accepts in a multipart upload.
pub const S3_MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Fan-out and chunking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per read and per uploaded part.
    ///
    /// AWS S3 rejects completion (`EntityTooSmall`) when any part but the last is smaller than
    /// [`S3_MIN_PART_SIZE`], and most S3-compatible servers copy that rule. The 1 MiB default
    /// only suits stores without the floor; raise it to at least 5 MiB for AWS.
    pub chunk_size: usize,
    pub concurrency_limit: usize,
    /// Prepended to every destination key, e.g. the dataset id.
    pub key_prefix: Option<String>,
    pub part_retry: RetryPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            key_prefix: None,
            part_retry: RetryPolicy::default(),
        }
    }
}

/// S3-compatible destination settings. Credentials are the caller's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub endpoint: String,
    /// Value of `x-amz-server-side-encryption`; `None` disables the header.
    pub server_side_encryption: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://s3.amazonaws.com".into(),
            server_side_encryption: Some("AES256".into()),
            connect_timeout_secs: 10,
            request_timeout_secs: 300,
        }
    }
}

impl MirrorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.manifest.endpoint.trim().is_empty() {
            return Err(MirrorError::config("manifest.endpoint must not be empty"));
        }
        if self.store.endpoint.trim().is_empty() {
            return Err(MirrorError::config("store.endpoint must not be empty"));
        }
        if self.transfer.chunk_size == 0 {
            return Err(MirrorError::config("transfer.chunk_size must be positive"));
        }
        if self.transfer.chunk_size < S3_MIN_PART_SIZE {
            warn!(
                chunk_size = self.transfer.chunk_size,
                min_part_size = S3_MIN_PART_SIZE,
                "transfer.chunk_size is below the AWS S3 minimum part size; multi-part files will fail to complete on AWS"
            );
        }
        if self.transfer.concurrency_limit == 0 {
            return Err(MirrorError::config(
                "transfer.concurrency_limit must be at least 1",
            ));
        }
        for (name, secs) in [
            ("manifest.timeout_secs", self.manifest.timeout_secs),
            ("source.download_timeout_secs", self.source.download_timeout_secs),
            ("source.inactivity_timeout_secs", self.source.inactivity_timeout_secs),
            ("store.request_timeout_secs", self.store.request_timeout_secs),
        ] {
            if secs == 0 {
                return Err(MirrorError::config(format!("{name} must be positive")));
            }
        }
        self.manifest.retry.backoff()?;
        self.transfer.part_retry.backoff()?;
        Ok(())
    }

    pub fn trace_loaded(&self) {
        info!(
            manifest_endpoint = %self.manifest.endpoint,
            store_endpoint = %self.store.endpoint,
            chunk_size = self.transfer.chunk_size,
            concurrency_limit = self.transfer.concurrency_limit,
            "Loaded MirrorConfig"
        );
        debug!(?self, "MirrorConfig loaded (full debug)");
    }
}

//! Remote file sources.
//!
//! [`StreamSource`] turns any byte stream into a [`ChunkSource`] that yields full chunks of the
//! requested size (only the last chunk may be shorter), so part sizes do not depend on how the
//! network happens to frame the body. [`HttpSourceOpener`] streams files over HTTP(S).

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use reqwest::Client;
use tracing::debug;

use crate::config::SourceConfig;
use crate::contract::{ChunkSource, SourceOpener};
use crate::error::{MirrorError, Result};

/// Scheme of locations that point straight at object storage.
pub const DIRECT_STORAGE_SCHEME: &str = "s3://";

/// Pick the location to download from.
///
/// The first location with the `s3://` scheme wins; otherwise the first location in manifest
/// order. Returns `None` for an empty list.
pub fn select_source_location(locations: &[String]) -> Option<&str> {
    locations
        .iter()
        .find(|loc| is_direct_storage(loc))
        .or_else(|| locations.first())
        .map(String::as_str)
}

fn is_direct_storage(location: &str) -> bool {
    location
        .get(..DIRECT_STORAGE_SCHEME.len())
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case(DIRECT_STORAGE_SCHEME))
}

/// Map a location onto an HTTP(S) URL. `s3://bucket/key` goes through the path-style gateway.
pub fn resolve_fetch_url(location: &str, s3_gateway: &str) -> Result<String> {
    if !is_direct_storage(location) {
        return Ok(location.to_string());
    }
    let path = &location[DIRECT_STORAGE_SCHEME.len()..];
    match path.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok(format!(
            "{}/{}/{}",
            s3_gateway.trim_end_matches('/'),
            bucket,
            key
        )),
        _ => Err(MirrorError::source_read(
            location,
            "direct-storage location must look like s3://bucket/key",
        )),
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, String>> + Send>>;

/// Chunked reader over a byte stream with an inactivity deadline per network read.
pub struct StreamSource {
    location: String,
    stream: ByteStream,
    pending: BytesMut,
    inactivity_timeout: Duration,
    finished: bool,
}

impl StreamSource {
    pub fn new<S, E>(location: impl Into<String>, stream: S, inactivity_timeout: Duration) -> Self
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
        E: std::fmt::Display,
    {
        Self {
            location: location.into(),
            stream: Box::pin(stream.map(|item| item.map_err(|e| e.to_string()))),
            pending: BytesMut::new(),
            inactivity_timeout,
            finished: false,
        }
    }
}

#[async_trait]
impl ChunkSource for StreamSource {
    async fn read_chunk(&mut self, max_len: usize) -> Result<Bytes> {
        while !self.finished && self.pending.len() < max_len {
            match tokio::time::timeout(self.inactivity_timeout, self.stream.next()).await {
                Err(_) => {
                    return Err(MirrorError::source_read(
                        &self.location,
                        format!("no data received for {:?}", self.inactivity_timeout),
                    ))
                }
                Ok(None) => self.finished = true,
                Ok(Some(Err(e))) => return Err(MirrorError::source_read(&self.location, e)),
                Ok(Some(Ok(bytes))) => self.pending.extend_from_slice(&bytes),
            }
        }
        let take = self.pending.len().min(max_len);
        Ok(self.pending.split_to(take).freeze())
    }

    fn location(&self) -> &str {
        &self.location
    }
}

/// Opens sources with HTTP GET.
pub struct HttpSourceOpener {
    client: Client,
    config: SourceConfig,
}

impl HttpSourceOpener {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| MirrorError::config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: SourceConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl SourceOpener for HttpSourceOpener {
    async fn open(&self, location: &str) -> Result<Box<dyn ChunkSource>> {
        let url = resolve_fetch_url(location, &self.config.s3_gateway)?;
        debug!(location, url = %url, "Opening source");

        let resp = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(self.config.download_timeout_secs))
            .send()
            .await
            .map_err(|e| MirrorError::source_read(location, e.to_string()))?;

        if !resp.status().is_success() {
            return Err(MirrorError::source_read(
                location,
                format!("HTTP {}", resp.status()),
            ));
        }

        Ok(Box::new(StreamSource::new(
            location,
            resp.bytes_stream(),
            Duration::from_secs(self.config.inactivity_timeout_secs),
        )))
    }
}

//! # contract: the seams of the mirroring pipeline
//!
//! Every external system the pipeline touches sits behind one of the traits below so the
//! orchestration logic can be driven by real clients or by test doubles:
//!
//! - [`ManifestTransport`]: executes a metadata query and returns the decoded JSON body.
//! - [`SourceOpener`] / [`ChunkSource`]: open a remote file and read it back in bounded chunks.
//! - [`ChunkSink`]: accepts relayed chunks in order.
//! - [`ObjectStore`]: the multipart subset of an S3-compatible API.
//!
//! The async traits are annotated for `mockall` so consumers can generate deterministic mocks.
//! All errors are [`MirrorError`]s; implementors map transport failures onto the variant that
//! matches their role (`ManifestUnavailable`, `SourceRead`, `Storage`).

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A part accepted by the object store, as submitted on completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Executes one metadata query.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ManifestTransport: Send + Sync {
    /// Send `request` and return the full response body.
    ///
    /// A non-success status must be reported as `ManifestUnavailable`; interpreting the
    /// payload (including a GraphQL `errors` list) is left to the caller.
    async fn execute(
        &self,
        dataset_id: &str,
        request: &serde_json::Value,
    ) -> Result<serde_json::Value>;
}

/// A readable byte stream, consumed front to back.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ChunkSource: Send {
    /// Read at most `max_len` bytes. An empty chunk means end of stream.
    async fn read_chunk(&mut self, max_len: usize) -> Result<Bytes>;

    /// Where the bytes come from, for error messages.
    fn location(&self) -> &str;
}

/// Opens remote files for reading.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait SourceOpener: Send + Sync {
    /// Start reading `location`. A non-success response fails with `SourceRead`.
    async fn open(&self, location: &str) -> Result<Box<dyn ChunkSource>>;
}

/// Receives relayed chunks in order.
#[async_trait]
pub trait ChunkSink: Send {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()>;
}

/// Multipart subset of an S3-compatible object store.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Check that `bucket` exists and is writable with the configured client.
    async fn head_bucket(&self, bucket: &str) -> Result<()>;

    /// Returns the upload id.
    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String>;

    /// Returns the part's ETag.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String>;

    /// Returns the object location.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String>;

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str)
        -> Result<()>;
}

//! S3-compatible object store client
//!
//! Speaks the multipart subset of the S3 REST API with path-style addressing
//! (`{endpoint}/{bucket}/{key}`). Request signing is not done here: pass a `reqwest::Client`
//! that already carries whatever authentication the endpoint expects (default headers, a signing
//! proxy, pre-authorised gateway, ...).
//!
//! Parts are uploaded exactly as the relay hands them over. AWS S3 fails completion with
//! `EntityTooSmall` when a non-final part is under
//! [`S3_MIN_PART_SIZE`](crate::config::S3_MIN_PART_SIZE), so size `transfer.chunk_size` accordingly.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use tracing::debug;

use crate::config::StoreConfig;
use crate::contract::{CompletedPart, ObjectStore};
use crate::error::{MirrorError, Result};

const SSE_HEADER: &str = "x-amz-server-side-encryption";

pub struct S3Store {
    client: Client,
    endpoint: Url,
    server_side_encryption: Option<String>,
}

impl S3Store {
    /// Build a store with a fresh, unauthenticated client.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| MirrorError::config(format!("Failed to create HTTP client: {e}")))?;
        Self::with_client(client, config)
    }

    /// Build a store on top of a pre-configured client.
    pub fn with_client(client: Client, config: &StoreConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            MirrorError::config(format!("invalid store endpoint {}: {e}", config.endpoint))
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(MirrorError::config(format!(
                "store endpoint {} cannot carry a path",
                config.endpoint
            )));
        }
        Ok(Self {
            client,
            endpoint,
            server_side_encryption: config.server_side_encryption.clone(),
        })
    }

    fn bucket_url(&self, bucket: &str) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(bucket);
        }
        url
    }

    /// Object URL with every key segment percent-encoded.
    fn object_url(&self, bucket: &str, key: &str) -> Url {
        let mut url = self.bucket_url(bucket);
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.extend(key.split('/'));
        }
        url
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let resp = request
            .send()
            .await
            .map_err(|e| MirrorError::storage(format!("{what} failed: {e}")))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(MirrorError::storage(format!(
            "{what} failed: status {status}{}",
            error_code(&body)
                .map(|code| format!(" ({code})"))
                .unwrap_or_default()
        )))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn head_bucket(&self, bucket: &str) -> Result<()> {
        let url = self.bucket_url(bucket);
        self.send(self.client.head(url), &format!("HeadBucket {bucket}"))
            .await?;
        Ok(())
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String> {
        let mut url = self.object_url(bucket, key);
        url.set_query(Some("uploads"));

        let mut request = self.client.post(url);
        if let Some(sse) = &self.server_side_encryption {
            request = request.header(SSE_HEADER, sse);
        }
        let resp = self
            .send(request, &format!("CreateMultipartUpload {key}"))
            .await?;
        let body = resp
            .text()
            .await
            .map_err(|e| MirrorError::storage(format!("Failed to read response for {key}: {e}")))?;

        let upload_id = extract_tag(&body, "UploadId").ok_or_else(|| {
            MirrorError::storage(format!("CreateMultipartUpload {key}: response has no UploadId"))
        })?;
        debug!(bucket, key, upload_id = %upload_id, "Created multipart upload");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String> {
        let mut url = self.object_url(bucket, key);
        url.query_pairs_mut()
            .append_pair("partNumber", &part_number.to_string())
            .append_pair("uploadId", upload_id);

        let len = body.len();
        let resp = self
            .send(
                self.client.put(url).body(body),
                &format!("UploadPart {part_number} of {key}"),
            )
            .await?;

        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                MirrorError::storage(format!("UploadPart {part_number} of {key}: no ETag header"))
            })?;
        debug!(key, part_number, bytes = len, etag = %etag, "Uploaded part");
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String> {
        let mut url = self.object_url(bucket, key);
        url.query_pairs_mut().append_pair("uploadId", upload_id);
        let fallback_location = url.as_str().split('?').next().unwrap_or_default().to_string();

        let resp = self
            .send(
                self.client
                    .post(url)
                    .header(reqwest::header::CONTENT_TYPE, "application/xml")
                    .body(complete_request_body(parts)),
                &format!("CompleteMultipartUpload {key}"),
            )
            .await?;
        let body = resp
            .text()
            .await
            .map_err(|e| MirrorError::storage(format!("Failed to read response for {key}: {e}")))?;

        // S3 can report a failed completion inside a 200 response.
        if let Some(code) = error_code(&body) {
            return Err(MirrorError::storage(format!(
                "CompleteMultipartUpload {key} failed: {code}"
            )));
        }
        Ok(extract_tag(&body, "Location").unwrap_or(fallback_location))
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        let mut url = self.object_url(bucket, key);
        url.query_pairs_mut().append_pair("uploadId", upload_id);

        let resp = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| MirrorError::storage(format!("AbortMultipartUpload {key} failed: {e}")))?;

        // NoSuchUpload means there is nothing left to release.
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            debug!(key, upload_id, "Aborted multipart upload");
            return Ok(());
        }
        Err(MirrorError::storage(format!(
            "AbortMultipartUpload {key} failed: status {}",
            resp.status()
        )))
    }
}

/// XML body for CompleteMultipartUpload.
pub fn complete_request_body(parts: &[CompletedPart]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for part in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number,
            xml_escape(&part.etag)
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

/// Text of the first `<tag>` element, unescaped.
pub fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = start + xml[start..].find(&close)?;
    Some(xml_unescape(&xml[start..end]))
}

fn error_code(xml: &str) -> Option<String> {
    if !xml.contains("<Error>") {
        return None;
    }
    extract_tag(xml, "Code").or_else(|| Some("unknown error".into()))
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn xml_unescape(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

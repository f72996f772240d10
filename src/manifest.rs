//! Dataset manifest retrieval.
//!
//! One GraphQL query asks for the draft revision's file list. The response is decoded into flat
//! [`FileRecord`]s; anything short of a complete `data.dataset.draft.files` array fails the
//! attempt with `ManifestUnavailable`, and the whole fetch is retried with backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error};

use crate::config::ManifestConfig;
use crate::contract::ManifestTransport;
use crate::error::{MirrorError, Result};
use crate::observer::TransferObserver;
use crate::retry::Backoff;

const DATASET_FILES_QUERY: &str = r#"
query Dataset($datasetId: ID!) {
    dataset(id: $datasetId) {
        draft {
            files {
                filename
                size
                urls
                directory
            }
        }
    }
}
"#;

/// One manifest entry. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Relative, slash-separated path inside the dataset.
    pub path: String,
    /// Size reported by the API; informational only.
    pub size: u64,
    /// Candidate download locations in preference order.
    pub source_locations: Vec<String>,
    pub is_directory: bool,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<DatasetData>,
    #[serde(default)]
    errors: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct DatasetData {
    dataset: Option<DatasetNode>,
}

#[derive(Debug, Deserialize)]
struct DatasetNode {
    draft: Option<DraftNode>,
}

#[derive(Debug, Deserialize)]
struct DraftNode {
    files: Vec<RawFile>,
}

// Directories come back without size or urls.
#[derive(Debug, Deserialize)]
struct RawFile {
    filename: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    urls: Option<Vec<String>>,
    #[serde(default)]
    directory: bool,
}

impl From<RawFile> for FileRecord {
    fn from(raw: RawFile) -> Self {
        FileRecord {
            path: raw.filename,
            size: raw.size.unwrap_or(0),
            source_locations: raw.urls.unwrap_or_default(),
            is_directory: raw.directory,
        }
    }
}

/// The GraphQL request body for `dataset_id`.
pub fn manifest_request(dataset_id: &str) -> serde_json::Value {
    json!({
        "query": DATASET_FILES_QUERY,
        "variables": { "datasetId": dataset_id },
    })
}

/// Decode a full GraphQL response body into file records.
pub fn decode_manifest(dataset_id: &str, body: serde_json::Value) -> Result<Vec<FileRecord>> {
    let response: GraphQlResponse = serde_json::from_value(body)
        .map_err(|e| MirrorError::manifest(dataset_id, format!("malformed response: {e}")))?;

    if let Some(errors) = response.errors.filter(|errors| !errors.is_empty()) {
        let messages: Vec<String> = errors
            .iter()
            .map(|e| {
                e.get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| e.to_string())
            })
            .collect();
        return Err(MirrorError::manifest(
            dataset_id,
            format!("GraphQL errors: {}", messages.join("; ")),
        ));
    }

    let draft = response
        .data
        .and_then(|d| d.dataset)
        .ok_or_else(|| MirrorError::manifest(dataset_id, "dataset not found"))?
        .draft
        .ok_or_else(|| MirrorError::manifest(dataset_id, "dataset has no draft revision"))?;

    Ok(draft.files.into_iter().map(FileRecord::from).collect())
}

/// Fetches manifests through a [`ManifestTransport`] with retries.
pub struct ManifestClient {
    transport: Arc<dyn ManifestTransport>,
    backoff: Backoff,
}

impl ManifestClient {
    pub fn new(transport: Arc<dyn ManifestTransport>, backoff: Backoff) -> Self {
        Self { transport, backoff }
    }

    /// HTTP client for the configured GraphQL endpoint.
    pub fn from_config(config: &ManifestConfig) -> Result<Self> {
        let transport = GraphQlTransport::new(config)?;
        Ok(Self::new(Arc::new(transport), config.retry.backoff()?))
    }

    pub async fn fetch_manifest(
        &self,
        dataset_id: &str,
        observer: &dyn TransferObserver,
    ) -> Result<Vec<FileRecord>> {
        let request = manifest_request(dataset_id);
        let operation = format!("fetch manifest for {dataset_id}");

        let records = self
            .backoff
            .retry(&operation, observer, || {
                let transport = &self.transport;
                let request = &request;
                async move {
                    let body = transport.execute(dataset_id, request).await?;
                    decode_manifest(dataset_id, body)
                }
            })
            .await?;

        let directories = records.iter().filter(|r| r.is_directory).count();
        observer.manifest_fetched(dataset_id, records.len() - directories, directories);
        Ok(records)
    }
}

/// Posts GraphQL queries with `reqwest`.
pub struct GraphQlTransport {
    client: Client,
    endpoint: String,
}

impl GraphQlTransport {
    pub fn new(config: &ManifestConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MirrorError::config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }
}

#[async_trait]
impl ManifestTransport for GraphQlTransport {
    async fn execute(
        &self,
        dataset_id: &str,
        request: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        debug!(dataset_id, endpoint = %self.endpoint, "Querying dataset manifest");
        let resp = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| MirrorError::manifest(dataset_id, format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!(dataset_id, %status, body = %text, "GraphQL request failed");
            return Err(MirrorError::manifest(
                dataset_id,
                format!("GraphQL request failed with status {status}"),
            ));
        }

        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| MirrorError::manifest(dataset_id, format!("invalid JSON body: {e}")))
    }
}

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::json;
use uuid::Uuid;

use dataset_mirror::config::TransferConfig;
use dataset_mirror::contract::{
    ChunkSource, CompletedPart, ManifestTransport, ObjectStore, SourceOpener,
};
use dataset_mirror::manifest::ManifestClient;
use dataset_mirror::retry::{Backoff, RetryPolicy};
use dataset_mirror::source::StreamSource;
use dataset_mirror::{DatasetMirror, MirrorError, Result};

pub const MIB: usize = 1024 * 1024;

/// Deterministic file contents.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Open,
    Completed,
    Aborted,
}

#[derive(Debug)]
pub struct UploadRecord {
    pub key: String,
    pub parts: BTreeMap<u32, (String, Bytes)>,
    pub state: UploadState,
    pub completed_with: Vec<u32>,
}

#[derive(Default)]
pub struct StoreState {
    uploads: HashMap<String, UploadRecord>,
    objects: HashMap<String, Vec<u8>>,
    active: usize,
    max_active: usize,
}

/// In-memory multipart store with failure injection and an active-upload gauge.
#[derive(Default)]
pub struct InMemoryStore {
    pub state: Mutex<StoreState>,
    pub fail_head_bucket: bool,
    /// Keys whose given part number always fails.
    pub failing_parts: HashMap<String, u32>,
    pub failing_completions: HashSet<String>,
    pub failing_aborts: bool,
    pub part_delay: Option<Duration>,
    pub create_calls: AtomicUsize,
}

impl InMemoryStore {
    pub fn uploads_for(&self, key: &str) -> Vec<(UploadState, Vec<u32>)> {
        let state = self.state.lock().unwrap();
        state
            .uploads
            .values()
            .filter(|u| u.key == key)
            .map(|u| (u.state, u.completed_with.clone()))
            .collect()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub fn open_uploads(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .uploads
            .values()
            .filter(|u| u.state == UploadState::Open)
            .count()
    }

    pub fn max_active(&self) -> usize {
        self.state.lock().unwrap().max_active
    }

    pub fn created(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn head_bucket(&self, bucket: &str) -> Result<()> {
        if self.fail_head_bucket {
            return Err(MirrorError::storage(format!("HeadBucket {bucket} failed: status 403")));
        }
        Ok(())
    }

    async fn create_multipart_upload(&self, _bucket: &str, key: &str) -> Result<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let upload_id = Uuid::new_v4().to_string();
        let mut state = self.state.lock().unwrap();
        state.uploads.insert(
            upload_id.clone(),
            UploadRecord {
                key: key.to_string(),
                parts: BTreeMap::new(),
                state: UploadState::Open,
                completed_with: Vec::new(),
            },
        );
        state.active += 1;
        state.max_active = state.max_active.max(state.active);
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String> {
        if let Some(delay) = self.part_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_parts.get(key) == Some(&part_number) {
            return Err(MirrorError::storage("status 500 (InternalError)"));
        }
        let mut state = self.state.lock().unwrap();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| MirrorError::storage("NoSuchUpload"))?;
        assert_eq!(upload.state, UploadState::Open, "part uploaded to a closed upload");
        let etag = format!("\"{key}-{part_number}-{}\"", body.len());
        upload.parts.insert(part_number, (etag.clone(), body));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String> {
        if self.failing_completions.contains(key) {
            return Err(MirrorError::storage("InvalidPart"));
        }
        let mut state = self.state.lock().unwrap();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| MirrorError::storage("NoSuchUpload"))?;

        let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
        let expected: Vec<u32> = (1..=parts.len() as u32).collect();
        if numbers != expected {
            return Err(MirrorError::storage("InvalidPartOrder"));
        }
        let mut object = Vec::new();
        for part in parts {
            let (etag, body) = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| MirrorError::storage("InvalidPart"))?;
            if *etag != part.etag {
                return Err(MirrorError::storage("InvalidPart"));
            }
            object.extend_from_slice(body);
        }
        upload.state = UploadState::Completed;
        upload.completed_with = numbers;
        state.objects.insert(key.to_string(), object);
        state.active -= 1;
        Ok(format!("memory://{key}"))
    }

    async fn abort_multipart_upload(&self, _bucket: &str, _key: &str, upload_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let was_open = match state.uploads.get_mut(upload_id) {
            Some(upload) if upload.state == UploadState::Open => {
                upload.state = UploadState::Aborted;
                true
            }
            _ => false,
        };
        if was_open {
            state.active -= 1;
        }
        if self.failing_aborts {
            return Err(MirrorError::storage("AbortMultipartUpload failed: status 503"));
        }
        Ok(())
    }
}

/// How a fake source behaves.
#[derive(Clone)]
pub enum FakeFile {
    Data(Vec<u8>),
    /// Yields the given bytes, then fails.
    FailAfter(Vec<u8>),
    /// Yields nothing and never ends.
    Stall,
    /// GET answers with a non-success status.
    NotFound,
}

/// Serves [`FakeFile`]s through the crate's [`StreamSource`] in small network frames.
#[derive(Default)]
pub struct MemorySources {
    files: HashMap<String, FakeFile>,
    pub opened: Mutex<Vec<String>>,
    /// Inactivity window of every opened source; one hour when unset.
    pub inactivity_timeout: Option<Duration>,
}

impl MemorySources {
    pub fn with_inactivity_timeout(timeout: Duration) -> Self {
        Self {
            inactivity_timeout: Some(timeout),
            ..Default::default()
        }
    }

    pub fn insert(&mut self, location: impl Into<String>, file: FakeFile) {
        self.files.insert(location.into(), file);
    }
}

const FRAME: usize = 64 * 1024 + 7;

fn frames(data: Vec<u8>) -> Vec<std::result::Result<Bytes, String>> {
    data.chunks(FRAME)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect()
}

#[async_trait]
impl SourceOpener for MemorySources {
    async fn open(&self, location: &str) -> Result<Box<dyn ChunkSource>> {
        self.opened.lock().unwrap().push(location.to_string());
        let file = self
            .files
            .get(location)
            .cloned()
            .unwrap_or(FakeFile::NotFound);
        let inactivity = self
            .inactivity_timeout
            .unwrap_or(Duration::from_secs(3600));
        let source: Box<dyn ChunkSource> = match file {
            FakeFile::Data(data) => {
                Box::new(StreamSource::new(location, stream::iter(frames(data)), inactivity))
            }
            FakeFile::FailAfter(data) => {
                let failing = stream::iter(frames(data))
                    .chain(stream::iter(vec![Err("connection reset by peer".to_string())]));
                Box::new(StreamSource::new(location, failing, inactivity))
            }
            FakeFile::Stall => Box::new(StreamSource::new(
                location,
                stream::pending::<std::result::Result<Bytes, String>>(),
                inactivity,
            )),
            FakeFile::NotFound => {
                return Err(MirrorError::source_read(location, "HTTP 404 Not Found"))
            }
        };
        Ok(source)
    }
}

/// Manifest transport answering from a script, then repeating the last answer.
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<serde_json::Value>>,
    pub calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<serde_json::Value>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ManifestTransport for ScriptedTransport {
    async fn execute(
        &self,
        _dataset_id: &str,
        _request: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        let next = if responses.len() > 1 {
            responses.pop_front()
        } else {
            responses.front().cloned()
        };
        Ok(next.unwrap_or_else(|| json!({ "data": null })))
    }
}

pub fn file_entry(path: &str, size: usize, urls: &[&str]) -> serde_json::Value {
    json!({ "filename": path, "size": size, "urls": urls, "directory": false })
}

pub fn dir_entry(path: &str) -> serde_json::Value {
    json!({ "filename": path, "size": 0, "urls": [], "directory": true })
}

pub fn manifest_body(files: Vec<serde_json::Value>) -> serde_json::Value {
    json!({ "data": { "dataset": { "draft": { "files": files } } } })
}

pub fn error_body(message: &str) -> serde_json::Value {
    json!({ "data": null, "errors": [{ "message": message }] })
}

pub fn transfer_config(chunk_size: usize) -> TransferConfig {
    TransferConfig {
        chunk_size,
        part_retry: RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 1,
        },
        ..TransferConfig::default()
    }
}

pub fn mirror(
    transport: Arc<ScriptedTransport>,
    sources: MemorySources,
    store: Arc<InMemoryStore>,
    config: TransferConfig,
) -> DatasetMirror {
    let manifest = ManifestClient::new(
        transport,
        Backoff::new(3, Duration::from_millis(1)).unwrap(),
    );
    DatasetMirror::new(manifest, Arc::new(sources), store, config).unwrap()
}

//! Dataset-level orchestration: manifest → bounded fan-out → per-file relay into multipart
//! uploads → aggregated result.
//!
//! # Responsibilities
//! - Fetch the manifest (fatal on failure) and check the bucket is reachable (fatal on failure).
//! - Drop directory records, build one [`TransferTask`] per destination key. Keys claimed by
//!   several distinct manifest paths are recorded as failed and never uploaded.
//! - Run tasks under a semaphore of `concurrency_limit` slots. A failed file never cancels its
//!   siblings; every task reaches success or failure before the result is returned.
//! - Guarantee that every multipart upload opened for a task is completed or aborted.
//!
//! # Cancellation
//! Each run takes its own [`CancellationToken`] ([`DatasetMirror::transfer_dataset_cancellable`]).
//! A token raised before the run starts fails it with `Cancelled` before any network call. Raised
//! mid-run, tasks waiting for a slot are skipped and in-flight relays stop at their next
//! suspension point and abort their upload. Files that were already completed stay in the bucket.
//! A cancelled token never affects later runs on the same mirror.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{MirrorConfig, TransferConfig};
use crate::contract::{ObjectStore, SourceOpener};
use crate::error::{MirrorError, Result};
use crate::manifest::{FileRecord, ManifestClient};
use crate::multipart::{AbortOutcome, PartWriter, UploadSession};
use crate::observer::{TracingObserver, TransferObserver};
use crate::relay::relay;
use crate::retry::Backoff;
use crate::source::{select_source_location, HttpSourceOpener};

/// One file scheduled for transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTask {
    pub record: FileRecord,
    pub destination_key: String,
}

impl TransferTask {
    pub fn new(record: FileRecord, prefix: Option<&str>) -> Self {
        let destination_key = destination_key(prefix, &record.path);
        Self {
            record,
            destination_key,
        }
    }
}

/// `{prefix}/{path}` with redundant slashes removed; no prefix means the bare path.
pub fn destination_key(prefix: Option<&str>, path: &str) -> String {
    let path = path.trim_start_matches('/');
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}/{path}"),
        None => path.to_string(),
    }
}

/// Tasks to run for one dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferPlan {
    /// One task per destination key, in manifest order.
    pub tasks: Vec<TransferTask>,
    /// Keys claimed by more than one distinct manifest path, with the claiming paths. None of
    /// them is scheduled.
    pub conflicts: BTreeMap<String, Vec<String>>,
}

/// Turn non-directory records into transfer tasks.
///
/// A path listed twice is transferred once. Distinct paths that normalise onto the same key
/// (`a.tsv` and `/a.tsv`) are a conflict: the key is left out of `tasks` so no two uploads ever
/// race on one object.
pub fn plan_tasks(records: Vec<FileRecord>, prefix: Option<&str>) -> TransferPlan {
    let mut tasks: Vec<TransferTask> = Vec::new();
    let mut claimed: HashMap<String, usize> = HashMap::new();
    let mut conflicts: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for record in records.into_iter().filter(|r| !r.is_directory) {
        let task = TransferTask::new(record, prefix);
        let Some(&index) = claimed.get(&task.destination_key) else {
            claimed.insert(task.destination_key.clone(), tasks.len());
            tasks.push(task);
            continue;
        };
        let first = &tasks[index].record.path;
        if *first == task.record.path {
            warn!(path = %first, "Manifest lists the same file twice; transferring it once");
            continue;
        }
        conflicts
            .entry(task.destination_key)
            .or_insert_with(|| vec![first.clone()])
            .push(task.record.path);
    }

    tasks.retain(|t| !conflicts.contains_key(&t.destination_key));
    TransferPlan { tasks, conflicts }
}

/// Outcome of one dataset: every scheduled file is either succeeded or failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatasetTransferResult {
    pub dataset_id: String,
    pub succeeded: BTreeSet<String>,
    pub failed: BTreeMap<String, String>,
}

impl DatasetTransferResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

pub struct DatasetMirror {
    manifest: ManifestClient,
    sources: Arc<dyn SourceOpener>,
    store: Arc<dyn ObjectStore>,
    observer: Arc<dyn TransferObserver>,
    config: TransferConfig,
    part_backoff: Backoff,
}

impl DatasetMirror {
    pub fn new(
        manifest: ManifestClient,
        sources: Arc<dyn SourceOpener>,
        store: Arc<dyn ObjectStore>,
        config: TransferConfig,
    ) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(MirrorError::config("chunk_size must be positive"));
        }
        let part_backoff = config.part_retry.backoff()?;
        Ok(Self {
            manifest,
            sources,
            store,
            observer: Arc::new(TracingObserver),
            config,
            part_backoff,
        })
    }

    /// HTTP manifest and source clients from `config`, writing into `store`.
    pub fn from_config(config: &MirrorConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        config.validate()?;
        let manifest = ManifestClient::from_config(&config.manifest)?;
        let sources = Arc::new(HttpSourceOpener::new(config.source.clone())?);
        Self::new(manifest, sources, store, config.transfer.clone())
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Transfer every file of `dataset_id` into `bucket`, at most `concurrency_limit` at a time.
    ///
    /// Errors only when nothing can be attempted (manifest, bucket, or arguments); per-file
    /// failures are reported in the result.
    pub async fn transfer_dataset(
        &self,
        dataset_id: &str,
        bucket: &str,
        concurrency_limit: usize,
    ) -> Result<DatasetTransferResult> {
        self.transfer_dataset_cancellable(
            dataset_id,
            bucket,
            concurrency_limit,
            &CancellationToken::new(),
        )
        .await
    }

    /// [`transfer_dataset`](Self::transfer_dataset) that stops once `cancel` is raised.
    pub async fn transfer_dataset_cancellable(
        &self,
        dataset_id: &str,
        bucket: &str,
        concurrency_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<DatasetTransferResult> {
        if concurrency_limit == 0 {
            return Err(MirrorError::config("concurrency_limit must be at least 1"));
        }
        if cancel.is_cancelled() {
            return Err(MirrorError::Cancelled);
        }
        let span = info_span!("transfer_dataset", run_id = %Uuid::new_v4(), dataset_id, bucket);
        self.run_dataset(dataset_id, bucket, concurrency_limit, cancel)
            .instrument(span)
            .await
    }

    /// [`transfer_dataset`](Self::transfer_dataset) with the configured concurrency limit.
    pub async fn transfer_dataset_default(
        &self,
        dataset_id: &str,
        bucket: &str,
    ) -> Result<DatasetTransferResult> {
        self.transfer_dataset(dataset_id, bucket, self.config.concurrency_limit)
            .await
    }

    /// Transfer several datasets one after another. A failing dataset does not stop the rest;
    /// raising `cancel` fails the current and every remaining dataset with `Cancelled`.
    pub async fn transfer_datasets(
        &self,
        dataset_ids: &[String],
        bucket: &str,
        concurrency_limit: usize,
        cancel: &CancellationToken,
    ) -> Vec<(String, Result<DatasetTransferResult>)> {
        let mut outcomes = Vec::with_capacity(dataset_ids.len());
        for dataset_id in dataset_ids {
            let outcome = self
                .transfer_dataset_cancellable(dataset_id, bucket, concurrency_limit, cancel)
                .await;
            match &outcome {
                Ok(result) if result.is_success() => {
                    info!(dataset_id = %dataset_id, files = result.total(), "Successfully mirrored dataset")
                }
                Ok(result) => {
                    warn!(dataset_id = %dataset_id, failed = result.failed.len(), "Dataset mirrored with failures")
                }
                Err(e) => warn!(dataset_id = %dataset_id, error = %e, "Failed to process dataset"),
            }
            outcomes.push((dataset_id.clone(), outcome));
        }
        outcomes
    }

    async fn run_dataset(
        &self,
        dataset_id: &str,
        bucket: &str,
        concurrency_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<DatasetTransferResult> {
        let records = tokio::select! {
            records = self.manifest.fetch_manifest(dataset_id, self.observer.as_ref()) => records?,
            _ = cancel.cancelled() => return Err(MirrorError::Cancelled),
        };

        let bucket_check = tokio::select! {
            checked = self.store.head_bucket(bucket) => checked,
            _ = cancel.cancelled() => return Err(MirrorError::Cancelled),
        };
        bucket_check.map_err(|e| MirrorError::BucketUnavailable {
            bucket: bucket.to_string(),
            reason: e.to_string(),
        })?;

        let plan = plan_tasks(records, self.config.key_prefix.as_deref());
        let mut result = DatasetTransferResult {
            dataset_id: dataset_id.to_string(),
            ..Default::default()
        };
        for (key, paths) in plan.conflicts {
            let e = MirrorError::DestinationConflict {
                key: key.clone(),
                paths,
            };
            self.observer.file_failed(&key, &e);
            result.failed.insert(key, e.to_string());
        }

        // Never more slots than tasks; tokio caps a semaphore at MAX_PERMITS.
        let slots = concurrency_limit
            .min(plan.tasks.len().max(1))
            .min(Semaphore::MAX_PERMITS);
        info!(files = plan.tasks.len(), concurrency_limit = slots, "Starting file transfers");

        let semaphore = Arc::new(Semaphore::new(slots));
        let transfers = plan.tasks.iter().map(|task| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) if cancel.is_cancelled() => Err(MirrorError::Cancelled),
                    Ok(_permit) => self.transfer_file(bucket, task, cancel).await,
                    Err(_) => Err(MirrorError::Cancelled),
                };
                (task, outcome)
            }
        });
        let outcomes = join_all(transfers).await;

        for (task, outcome) in outcomes {
            match outcome {
                Ok(_) => {
                    result.succeeded.insert(task.destination_key.clone());
                }
                Err(e) => {
                    self.observer.file_failed(&task.destination_key, &e);
                    result
                        .failed
                        .insert(task.destination_key.clone(), e.to_string());
                }
            }
        }

        self.observer.dataset_finished(&result);
        Ok(result)
    }

    /// Stream one file into a new multipart upload. Returns the number of bytes transferred.
    async fn transfer_file(
        &self,
        bucket: &str,
        task: &TransferTask,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let key = task.destination_key.as_str();
        let location = select_source_location(&task.record.source_locations).ok_or_else(|| {
            MirrorError::source_read(&task.record.path, "manifest lists no source locations")
        })?;
        self.observer.file_started(key, location);

        let mut session = UploadSession::open(Arc::clone(&self.store), bucket, key).await?;

        let relayed = {
            let mut writer = PartWriter::new(
                &mut session,
                self.part_backoff,
                self.observer.as_ref(),
                task.record.size,
            );
            let pipeline = async {
                let mut source = self.sources.open(location).await?;
                let bytes = relay(source.as_mut(), &mut writer, self.config.chunk_size).await?;
                writer.finish_empty().await?;
                Ok::<_, MirrorError>(bytes)
            };
            tokio::select! {
                outcome = pipeline => outcome,
                _ = cancel.cancelled() => Err(MirrorError::Cancelled),
            }
        };

        let outcome = match relayed {
            Ok(bytes) => session.complete().await.map(|_| bytes),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(bytes) => {
                self.observer
                    .file_succeeded(key, bytes, session.parts().len());
                Ok(bytes)
            }
            Err(e) => {
                if let AbortOutcome::Failed(abort_err) = session.abort().await {
                    self.observer.abort_failed(key, &abort_err);
                }
                Err(e)
            }
        }
    }
}

//! Lifecycle events emitted by the pipeline.
//!
//! The orchestrator, retrier and manifest client report what they do through a caller-supplied
//! [`TransferObserver`] instead of process-wide logging state. [`TracingObserver`] is the default
//! and forwards every event to `tracing`; tests plug in recording observers.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::MirrorError;
use crate::orchestrator::DatasetTransferResult;

/// One failed attempt inside the backoff retrier.
#[derive(Debug)]
pub struct RetryEvent<'a> {
    pub operation: &'a str,
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Delay before the next attempt, `None` when the budget is spent.
    pub next_delay: Option<Duration>,
    pub error: &'a MirrorError,
}

/// Receives structured pipeline events. All methods default to no-ops.
pub trait TransferObserver: Send + Sync {
    fn attempt_failed(&self, _event: &RetryEvent<'_>) {}

    fn manifest_fetched(&self, _dataset_id: &str, _files: usize, _directories: usize) {}

    fn file_started(&self, _destination_key: &str, _source: &str) {}

    /// Progress after each uploaded part. `expected_bytes` is the manifest size and may be stale.
    fn part_uploaded(
        &self,
        _destination_key: &str,
        _part_number: u32,
        _bytes_so_far: u64,
        _expected_bytes: u64,
    ) {
    }

    fn file_succeeded(&self, _destination_key: &str, _bytes: u64, _parts: usize) {}

    fn file_failed(&self, _destination_key: &str, _error: &MirrorError) {}

    fn abort_failed(&self, _destination_key: &str, _error: &MirrorError) {}

    fn dataset_finished(&self, _result: &DatasetTransferResult) {}
}

/// Observer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TransferObserver for NoopObserver {}

/// Default observer: writes every event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TransferObserver for TracingObserver {
    fn attempt_failed(&self, event: &RetryEvent<'_>) {
        warn!(
            operation = event.operation,
            attempt = event.attempt,
            max_attempts = event.max_attempts,
            next_delay_ms = event.next_delay.map(|d| d.as_millis() as u64),
            error = %event.error,
            "Attempt failed"
        );
    }

    fn manifest_fetched(&self, dataset_id: &str, files: usize, directories: usize) {
        info!(dataset_id, files, directories, "Fetched dataset manifest");
    }

    fn file_started(&self, destination_key: &str, source: &str) {
        debug!(key = destination_key, source, "Streaming file");
    }

    fn part_uploaded(
        &self,
        destination_key: &str,
        part_number: u32,
        bytes_so_far: u64,
        expected_bytes: u64,
    ) {
        let percent = if expected_bytes == 0 {
            100.0
        } else {
            (bytes_so_far as f64 / expected_bytes as f64 * 100.0).min(100.0)
        };
        debug!(
            key = destination_key,
            part_number,
            bytes_so_far,
            percent,
            "Uploaded part"
        );
    }

    fn file_succeeded(&self, destination_key: &str, bytes: u64, parts: usize) {
        info!(key = destination_key, bytes, parts, "Successfully uploaded file");
    }

    fn file_failed(&self, destination_key: &str, error: &MirrorError) {
        error!(key = destination_key, error = %error, "Failed to upload file");
    }

    fn abort_failed(&self, destination_key: &str, error: &MirrorError) {
        error!(key = destination_key, error = %error, "Failed to abort multipart upload");
    }

    fn dataset_finished(&self, result: &DatasetTransferResult) {
        if result.is_success() {
            info!(
                dataset_id = %result.dataset_id,
                succeeded = result.succeeded.len(),
                "Dataset transfer complete"
            );
        } else {
            error!(
                dataset_id = %result.dataset_id,
                succeeded = result.succeeded.len(),
                failed = result.failed.len(),
                "Dataset transfer finished with failures"
            );
        }
    }
}

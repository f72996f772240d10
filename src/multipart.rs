//! Multipart upload session state machine.
//!
//! ```text
//! open ──> Open ──upload_part*──> Open ──complete──> Completing ──> Completed
//!           │                                          │
//!           └───────────────abort──────────────────────┴──> Aborted
//! ```
//!
//! A session must reach `Completed` or `Aborted` before its owner lets go of it. Dropping a
//! session that is still `Open` or `Completing` (for example when the owning future is
//! cancelled) schedules a best-effort abort on the current tokio runtime.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::contract::{ChunkSink, CompletedPart, ObjectStore};
use crate::error::{MirrorError, Result};
use crate::observer::TransferObserver;
use crate::retry::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Completing,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Open => "open",
            SessionState::Completing => "completing",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Result of [`UploadSession::abort`]. Abort failures are reported, never raised.
#[derive(Debug)]
pub enum AbortOutcome {
    Aborted,
    /// The session was already terminal; nothing was sent.
    AlreadyTerminal(SessionState),
    /// The store rejected the abort. The session is still marked aborted locally; the stray
    /// upload is left to the bucket's lifecycle rules.
    Failed(MirrorError),
}

pub struct UploadSession {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
    state: SessionState,
}

impl fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadSession")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("upload_id", &self.upload_id)
            .field("parts", &self.parts.len())
            .field("state", &self.state)
            .finish()
    }
}

impl UploadSession {
    /// Start a multipart upload for `key`.
    pub async fn open(store: Arc<dyn ObjectStore>, bucket: &str, key: &str) -> Result<Self> {
        let upload_id = store
            .create_multipart_upload(bucket, key)
            .await
            .map_err(|e| MirrorError::SessionOpen {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        debug!(bucket, key, upload_id = %upload_id, "Opened multipart upload");

        Ok(Self {
            store,
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id,
            parts: Vec::new(),
            state: SessionState::Open,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn parts(&self) -> &[CompletedPart] {
        &self.parts
    }

    pub fn next_part_number(&self) -> u32 {
        self.parts.len() as u32 + 1
    }

    /// Upload `body` as `part_number` and record it.
    ///
    /// `part_number` must be [`next_part_number`](Self::next_part_number). On failure the
    /// session stays open and the same part number may be retried.
    pub async fn upload_part(&mut self, part_number: u32, body: Bytes) -> Result<String> {
        let etag = self.send_part(part_number, body).await?;
        self.record_part(part_number, etag.clone());
        Ok(etag)
    }

    /// Single network attempt for a part, without recording it.
    async fn send_part(&self, part_number: u32, body: Bytes) -> Result<String> {
        self.ensure_state(SessionState::Open, "upload a part to")?;
        let expected = self.next_part_number();
        if part_number != expected {
            return Err(MirrorError::PartOutOfOrder {
                key: self.key.clone(),
                expected,
                actual: part_number,
            });
        }

        self.store
            .upload_part(&self.bucket, &self.key, &self.upload_id, part_number, body)
            .await
            .map_err(|e| MirrorError::PartUpload {
                key: self.key.clone(),
                part_number,
                reason: e.to_string(),
            })
    }

    fn record_part(&mut self, part_number: u32, etag: String) {
        self.parts.push(CompletedPart { part_number, etag });
    }

    /// Submit the ordered part list. On failure the session is left `Completing` and must be
    /// aborted by the caller.
    pub async fn complete(&mut self) -> Result<String> {
        self.ensure_state(SessionState::Open, "complete")?;
        if self.parts.is_empty() {
            return Err(MirrorError::Completion {
                key: self.key.clone(),
                reason: "no parts uploaded".into(),
            });
        }

        self.state = SessionState::Completing;
        let location = self
            .store
            .complete_multipart_upload(&self.bucket, &self.key, &self.upload_id, &self.parts)
            .await
            .map_err(|e| MirrorError::Completion {
                key: self.key.clone(),
                reason: e.to_string(),
            })?;

        self.state = SessionState::Completed;
        debug!(key = %self.key, parts = self.parts.len(), location = %location, "Completed multipart upload");
        Ok(location)
    }

    /// Release the upload and its parts. Idempotent.
    pub async fn abort(&mut self) -> AbortOutcome {
        if self.state.is_terminal() {
            return AbortOutcome::AlreadyTerminal(self.state);
        }

        let previous = self.state;
        self.state = SessionState::Aborted;
        match self
            .store
            .abort_multipart_upload(&self.bucket, &self.key, &self.upload_id)
            .await
        {
            Ok(()) => {
                debug!(key = %self.key, upload_id = %self.upload_id, from = %previous, "Aborted multipart upload");
                AbortOutcome::Aborted
            }
            Err(e) => {
                error!(key = %self.key, upload_id = %self.upload_id, error = %e, "Failed to abort multipart upload");
                AbortOutcome::Failed(e)
            }
        }
    }

    fn ensure_state(&self, expected: SessionState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(MirrorError::InvalidSessionState {
                key: self.key.clone(),
                operation,
                state: self.state,
            })
        }
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!(key = %self.key, upload_id = %self.upload_id, "Multipart upload dropped outside a runtime; left open");
            return;
        };

        warn!(key = %self.key, upload_id = %self.upload_id, state = %self.state, "Multipart upload dropped before finishing; aborting");
        self.state = SessionState::Aborted;
        let store = Arc::clone(&self.store);
        let bucket = std::mem::take(&mut self.bucket);
        let key = std::mem::take(&mut self.key);
        let upload_id = std::mem::take(&mut self.upload_id);
        handle.spawn(async move {
            if let Err(e) = store.abort_multipart_upload(&bucket, &key, &upload_id).await {
                error!(key = %key, upload_id = %upload_id, error = %e, "Failed to abort dropped multipart upload");
            }
        });
    }
}

/// [`ChunkSink`] that uploads every chunk as the session's next part, retrying each part with
/// backoff.
pub struct PartWriter<'a> {
    session: &'a mut UploadSession,
    backoff: Backoff,
    observer: &'a dyn TransferObserver,
    expected_bytes: u64,
    bytes_written: u64,
}

impl<'a> PartWriter<'a> {
    pub fn new(
        session: &'a mut UploadSession,
        backoff: Backoff,
        observer: &'a dyn TransferObserver,
        expected_bytes: u64,
    ) -> Self {
        Self {
            session,
            backoff,
            observer,
            expected_bytes,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    async fn upload(&mut self, chunk: Bytes) -> Result<()> {
        let part_number = self.session.next_part_number();
        let len = chunk.len() as u64;
        let operation = format!("upload part {part_number} of {}", self.session.key);

        let session = &*self.session;
        let etag = self
            .backoff
            .retry(&operation, self.observer, move || {
                session.send_part(part_number, chunk.clone())
            })
            .await?;

        self.session.record_part(part_number, etag);
        self.bytes_written += len;
        self.observer.part_uploaded(
            &self.session.key,
            part_number,
            self.bytes_written,
            self.expected_bytes,
        );
        Ok(())
    }

    /// Upload a single empty part if nothing has been written, so a zero-byte object can be
    /// completed.
    pub async fn finish_empty(&mut self) -> Result<()> {
        if self.session.parts.is_empty() {
            self.upload(Bytes::new()).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChunkSink for PartWriter<'_> {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.upload(chunk).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::MockObjectStore;
    use crate::observer::NoopObserver;
    use std::time::Duration;

    fn store_with_upload() -> MockObjectStore {
        let mut store = MockObjectStore::new();
        store
            .expect_create_multipart_upload()
            .returning(|_, _| Ok("upload-1".to_string()));
        store
    }

    #[tokio::test]
    async fn open_failure_is_session_open_error() {
        let mut store = MockObjectStore::new();
        store
            .expect_create_multipart_upload()
            .returning(|_, _| Err(MirrorError::storage("403 Forbidden")));

        let err = UploadSession::open(Arc::new(store), "bucket", "ds1/a.tsv")
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::SessionOpen { ref key, .. } if key == "ds1/a.tsv"));
    }

    #[tokio::test]
    async fn parts_must_be_contiguous() {
        let mut store = store_with_upload();
        store
            .expect_upload_part()
            .times(1)
            .returning(|_, _, _, n, _| Ok(format!("\"etag-{n}\"")));
        store.expect_abort_multipart_upload().returning(|_, _, _| Ok(()));

        let mut session = UploadSession::open(Arc::new(store), "b", "k").await.unwrap();
        session.upload_part(1, Bytes::from_static(b"a")).await.unwrap();

        let err = session
            .upload_part(3, Bytes::from_static(b"c"))
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::PartOutOfOrder { expected: 2, actual: 3, .. }));
        let err = session
            .upload_part(1, Bytes::from_static(b"a"))
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::PartOutOfOrder { expected: 2, actual: 1, .. }));

        assert!(matches!(session.abort().await, AbortOutcome::Aborted));
    }

    #[tokio::test]
    async fn failed_part_keeps_session_open_for_retry() {
        let mut store = store_with_upload();
        let mut seq = mockall::Sequence::new();
        store
            .expect_upload_part()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _, _| Err(MirrorError::storage("503 SlowDown")));
        store
            .expect_upload_part()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, n, _| Ok(format!("etag-{n}")));
        store
            .expect_complete_multipart_upload()
            .withf(|_, _, _, parts| parts.len() == 1 && parts[0].part_number == 1)
            .returning(|_, key, _, _| Ok(format!("https://store/{key}")));

        let mut session = UploadSession::open(Arc::new(store), "b", "k").await.unwrap();
        let err = session
            .upload_part(1, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::PartUpload { part_number: 1, .. }));
        assert_eq!(session.state(), SessionState::Open);

        session.upload_part(1, Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(session.complete().await.unwrap(), "https://store/k");
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn complete_requires_a_part() {
        let mut store = store_with_upload();
        store.expect_abort_multipart_upload().returning(|_, _, _| Ok(()));

        let mut session = UploadSession::open(Arc::new(store), "b", "k").await.unwrap();
        assert!(matches!(
            session.complete().await,
            Err(MirrorError::Completion { .. })
        ));
        assert_eq!(session.state(), SessionState::Open);
        session.abort().await;
    }

    #[tokio::test]
    async fn completion_failure_leaves_completing_then_abort() {
        let mut store = store_with_upload();
        store
            .expect_upload_part()
            .returning(|_, _, _, n, _| Ok(format!("etag-{n}")));
        store
            .expect_complete_multipart_upload()
            .returning(|_, _, _, _| Err(MirrorError::storage("InvalidPart")));
        store
            .expect_abort_multipart_upload()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut session = UploadSession::open(Arc::new(store), "b", "k").await.unwrap();
        session.upload_part(1, Bytes::from_static(b"x")).await.unwrap();

        assert!(matches!(
            session.complete().await,
            Err(MirrorError::Completion { .. })
        ));
        assert_eq!(session.state(), SessionState::Completing);

        assert!(matches!(session.abort().await, AbortOutcome::Aborted));
        assert_eq!(session.state(), SessionState::Aborted);
        assert!(matches!(
            session.abort().await,
            AbortOutcome::AlreadyTerminal(SessionState::Aborted)
        ));
    }

    #[tokio::test]
    async fn abort_failure_is_reported_not_raised() {
        let mut store = store_with_upload();
        store
            .expect_abort_multipart_upload()
            .times(1)
            .returning(|_, _, _| Err(MirrorError::storage("connection refused")));

        let mut session = UploadSession::open(Arc::new(store), "b", "k").await.unwrap();
        assert!(matches!(session.abort().await, AbortOutcome::Failed(_)));
        assert_eq!(session.state(), SessionState::Aborted);
        // No second network call: the mock allows exactly one.
        assert!(matches!(session.abort().await, AbortOutcome::AlreadyTerminal(_)));
    }

    #[tokio::test]
    async fn dropping_an_open_session_aborts_it() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let mut store = store_with_upload();
        store
            .expect_abort_multipart_upload()
            .times(1)
            .returning(move |_, key, id| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(format!("{key}:{id}"));
                }
                Ok(())
            });

        let session = UploadSession::open(Arc::new(store), "b", "k").await.unwrap();
        drop(session);

        assert_eq!(rx.await.unwrap(), "k:upload-1");
    }

    #[tokio::test(start_paused = true)]
    async fn part_writer_retries_and_numbers_parts() {
        let mut store = store_with_upload();
        let mut seq = mockall::Sequence::new();
        store
            .expect_upload_part()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, n, _| Ok(format!("etag-{n}")));
        store
            .expect_upload_part()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _, _| Err(MirrorError::storage("500")));
        store
            .expect_upload_part()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, _, _, n, body| *n == 2 && &body[..] == b"second")
            .returning(|_, _, _, n, _| Ok(format!("etag-{n}")));

        let mut session = UploadSession::open(Arc::new(store), "b", "k").await.unwrap();
        {
            let backoff = Backoff::new(3, Duration::from_millis(50)).unwrap();
            let mut writer = PartWriter::new(&mut session, backoff, &NoopObserver, 11);
            writer.write_chunk(Bytes::from_static(b"first")).await.unwrap();
            writer.write_chunk(Bytes::from_static(b"second")).await.unwrap();
            writer.finish_empty().await.unwrap();
            assert_eq!(writer.bytes_written(), 11);
        }

        let numbers: Vec<u32> = session.parts().iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2]);
        // Marked terminal so the drop guard stays quiet.
        session.state = SessionState::Completed;
    }

    #[tokio::test]
    async fn finish_empty_uploads_one_empty_part() {
        let mut store = store_with_upload();
        store
            .expect_upload_part()
            .times(1)
            .withf(|_, _, _, n, body| *n == 1 && body.is_empty())
            .returning(|_, _, _, _, _| Ok("etag-empty".to_string()));
        store.expect_abort_multipart_upload().returning(|_, _, _| Ok(()));

        let mut session = UploadSession::open(Arc::new(store), "b", "empty.txt").await.unwrap();
        {
            let backoff = Backoff::new(1, Duration::from_millis(1)).unwrap();
            let mut writer = PartWriter::new(&mut session, backoff, &NoopObserver, 0);
            writer.finish_empty().await.unwrap();
        }
        assert_eq!(session.parts().len(), 1);
        session.abort().await;
    }
}

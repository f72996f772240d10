#![doc = "dataset-mirror: stream remote datasets into an object-storage bucket."]

//! Given a dataset identifier, the pipeline fetches the dataset's file manifest from a GraphQL
//! metadata API and copies every file straight into an S3-compatible bucket, keeping the
//! dataset's relative layout. Files are relayed chunk by chunk into multipart uploads, so no
//! file is ever held whole in memory or on disk.
//!
//! # Layout
//! - [`retry`]: exponential backoff shared by the manifest fetch and part uploads
//! - [`manifest`]: GraphQL query and [`FileRecord`](manifest::FileRecord) decoding
//! - [`source`] and [`relay`]: chunked reads from HTTP(S) sources into a sink
//! - [`multipart`] and [`store`]: multipart session state machine over the S3 REST API
//! - [`orchestrator`]: bounded fan-out across a dataset and result aggregation
//! - [`contract`]: the traits at each seam, mockable for tests
//!
//! # Usage
//! ```no_run
//! # async fn run() -> dataset_mirror::Result<()> {
//! use std::sync::Arc;
//! use dataset_mirror::{load_config, DatasetMirror, S3Store};
//!
//! let config = load_config("mirror.yaml")?;
//! let store = Arc::new(S3Store::new(&config.store)?);
//! let mirror = DatasetMirror::from_config(&config, store)?;
//! let result = mirror.transfer_dataset("ds000001", "my-bucket", 10).await?;
//! println!("{} files copied, {} failed", result.succeeded.len(), result.failed.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod contract;
pub mod error;
pub mod load_config;
pub mod manifest;
pub mod multipart;
pub mod observer;
pub mod orchestrator;
pub mod relay;
pub mod retry;
pub mod source;
pub mod store;

pub use config::MirrorConfig;
pub use error::{MirrorError, Result};
pub use load_config::load_config;
pub use manifest::{FileRecord, ManifestClient};
pub use observer::{TracingObserver, TransferObserver};
pub use orchestrator::{DatasetMirror, DatasetTransferResult, TransferTask};
pub use store::S3Store;

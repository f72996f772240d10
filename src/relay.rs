//! Chunked relay from a [`ChunkSource`] into a [`ChunkSink`].
//!
//! Strictly sequential: a chunk is handed to the sink and acknowledged before the next read, so
//! at most one chunk is held in memory regardless of file size.

use crate::contract::{ChunkSink, ChunkSource};
use crate::error::{MirrorError, Result};

/// Default read size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Relay `source` into `sink` in chunks of at most `chunk_size` bytes.
///
/// Returns the number of bytes forwarded. Source failures surface as `SourceRead`; sink
/// rejections are wrapped in `SinkWrite`. Nothing is read or written after a failure.
pub async fn relay(
    source: &mut dyn ChunkSource,
    sink: &mut dyn ChunkSink,
    chunk_size: usize,
) -> Result<u64> {
    if chunk_size == 0 {
        return Err(MirrorError::config("chunk size must be positive"));
    }

    let mut total: u64 = 0;
    loop {
        let chunk = match source.read_chunk(chunk_size).await {
            Ok(chunk) => chunk,
            Err(err @ MirrorError::SourceRead { .. }) => return Err(err),
            Err(err) => return Err(MirrorError::source_read(source.location(), err.to_string())),
        };
        if chunk.is_empty() {
            return Ok(total);
        }
        if chunk.len() > chunk_size {
            return Err(MirrorError::source_read(
                source.location(),
                format!("read returned {} bytes, limit is {chunk_size}", chunk.len()),
            ));
        }

        let len = chunk.len() as u64;
        sink.write_chunk(chunk)
            .await
            .map_err(|err| MirrorError::SinkWrite {
                offset: total,
                source: Box::new(err),
            })?;
        total += len;
    }
}

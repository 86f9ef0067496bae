//! Weft Artifact
//!
//! Binary blobs (large task outputs, files written by plugins) live outside the
//! execution record. The execution only carries a `weft://blob/<id>` URI.
//!
//! [`Store`] is the backend layer and works on opaque keys; [`BlobStore`]
//! allocates keys and translates between keys and URIs.

mod blobs;
mod fs;
mod memory;

pub use blobs::{BLOB_URI_PREFIX, BlobStore, is_blob_uri};
pub use fs::FsStore;
pub use memory::MemoryStore;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};

/// A boxed stream of bytes for blob data.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// Error type for blob storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// No blob is stored under the key.
  #[error("blob not found: {0}")]
  NotFound(String),

  /// The key or URI is malformed.
  #[error("invalid blob reference: {0}")]
  InvalidKey(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Blob storage backend.
#[async_trait]
pub trait Store: Send + Sync {
  /// Open a blob for reading.
  async fn get(&self, key: &str) -> Result<ByteStream, Error>;

  /// Store a blob, replacing any previous content under `key`.
  async fn put(&self, key: &str, data: ByteStream, content_type: &str) -> Result<(), Error>;

  async fn delete(&self, key: &str) -> Result<(), Error>;
}

/// Wrap an in-memory buffer as a single-chunk stream.
pub fn stream_bytes(data: Bytes) -> ByteStream {
  Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Drain a stream into one buffer.
pub async fn collect(mut stream: ByteStream) -> Result<Bytes, Error> {
  let mut buf = BytesMut::new();
  while let Some(chunk) = stream.next().await {
    buf.extend_from_slice(&chunk?);
  }
  Ok(buf.freeze())
}

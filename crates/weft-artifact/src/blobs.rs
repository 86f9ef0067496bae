use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::{Error, Store, collect, stream_bytes};

/// Scheme and authority of every blob URI.
pub const BLOB_URI_PREFIX: &str = "weft://blob/";

/// Whether `value` looks like a blob reference.
pub fn is_blob_uri(value: &str) -> bool {
  value
    .strip_prefix(BLOB_URI_PREFIX)
    .is_some_and(|id| Uuid::parse_str(id).is_ok())
}

/// URI-addressed view over a [`Store`].
#[derive(Clone)]
pub struct BlobStore {
  inner: Arc<dyn Store>,
}

impl BlobStore {
  pub fn new(inner: Arc<dyn Store>) -> Self {
    Self { inner }
  }

  /// Store `data` under a fresh id and return its URI.
  pub async fn put(&self, data: Bytes, content_type: &str) -> Result<String, Error> {
    let id = Uuid::new_v4();
    self
      .inner
      .put(&key_for(&id), stream_bytes(data), content_type)
      .await?;
    Ok(format!("{BLOB_URI_PREFIX}{id}"))
  }

  /// Read an entire blob into memory.
  pub async fn get(&self, uri: &str) -> Result<Bytes, Error> {
    let key = parse_uri(uri)?;
    collect(self.inner.get(&key).await?).await
  }

  pub async fn delete(&self, uri: &str) -> Result<(), Error> {
    let key = parse_uri(uri)?;
    self.inner.delete(&key).await
  }
}

// Two-character fan-out keeps directories small on filesystem backends.
fn key_for(id: &Uuid) -> String {
  let simple = id.simple().to_string();
  format!("blob/{}/{}", &simple[..2], id)
}

fn parse_uri(uri: &str) -> Result<String, Error> {
  uri
    .strip_prefix(BLOB_URI_PREFIX)
    .and_then(|id| Uuid::parse_str(id).ok())
    .map(|id| key_for(&id))
    .ok_or_else(|| Error::InvalidKey(uri.to_string()))
}

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::{ByteStream, Error, Store, collect, stream_bytes};

/// Blob store held in process memory. Content is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
  blobs: RwLock<HashMap<String, (Bytes, String)>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Content type recorded for `key`.
  pub async fn content_type(&self, key: &str) -> Option<String> {
    self.blobs.read().await.get(key).map(|(_, ct)| ct.clone())
  }

  pub async fn len(&self) -> usize {
    self.blobs.read().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.blobs.read().await.is_empty()
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn get(&self, key: &str) -> Result<ByteStream, Error> {
    let blobs = self.blobs.read().await;
    let (data, _) = blobs
      .get(key)
      .ok_or_else(|| Error::NotFound(key.to_string()))?;
    Ok(stream_bytes(data.clone()))
  }

  async fn put(&self, key: &str, data: ByteStream, content_type: &str) -> Result<(), Error> {
    let data = collect(data).await?;
    self
      .blobs
      .write()
      .await
      .insert(key.to_string(), (data, content_type.to_string()));
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<(), Error> {
    self
      .blobs
      .write()
      .await
      .remove(key)
      .map(|_| ())
      .ok_or_else(|| Error::NotFound(key.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_put_get_delete() {
    let store = MemoryStore::new();
    store
      .put("a", stream_bytes(Bytes::from_static(b"hello")), "text/plain")
      .await
      .unwrap();

    let data = collect(store.get("a").await.unwrap()).await.unwrap();
    assert_eq!(&data[..], b"hello");
    assert_eq!(store.content_type("a").await.as_deref(), Some("text/plain"));

    store.delete("a").await.unwrap();
    assert!(matches!(store.get("a").await, Err(Error::NotFound(_))));
    assert!(store.is_empty().await);
  }

  #[tokio::test]
  async fn test_delete_missing() {
    let store = MemoryStore::new();
    assert!(matches!(store.delete("nope").await, Err(Error::NotFound(_))));
  }
}

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::{ByteStream, Error, Store};

/// Blob store backed by a directory.
///
/// Each blob lives at `{root}/{key}`. Writes go to a `.partial` sibling first
/// and are renamed into place, so readers never observe half-written blobs.
pub struct FsStore {
  root: PathBuf,
}

impl FsStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn path_for(&self, key: &str) -> Result<PathBuf, Error> {
    let relative = Path::new(key);
    let clean = !key.is_empty()
      && relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !clean {
      return Err(Error::InvalidKey(key.to_string()));
    }
    Ok(self.root.join(relative))
  }
}

fn not_found_or_io(key: &str, err: std::io::Error) -> Error {
  if err.kind() == std::io::ErrorKind::NotFound {
    Error::NotFound(key.to_string())
  } else {
    Error::Io(err)
  }
}

#[async_trait]
impl Store for FsStore {
  async fn get(&self, key: &str) -> Result<ByteStream, Error> {
    let path = self.path_for(key)?;
    let file = File::open(&path)
      .await
      .map_err(|e| not_found_or_io(key, e))?;
    Ok(Box::pin(ReaderStream::new(file).map(|r| r.map_err(Error::Io))))
  }

  async fn put(&self, key: &str, mut data: ByteStream, _content_type: &str) -> Result<(), Error> {
    let path = self.path_for(key)?;
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }

    let partial = path.with_extension("partial");
    let mut file = File::create(&partial).await?;
    while let Some(chunk) = data.next().await {
      match chunk {
        Ok(bytes) => file.write_all(&bytes).await?,
        Err(e) => {
          drop(file);
          let _ = fs::remove_file(&partial).await;
          return Err(e);
        }
      }
    }
    file.sync_all().await?;
    fs::rename(&partial, &path).await?;
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<(), Error> {
    let path = self.path_for(key)?;
    fs::remove_file(&path)
      .await
      .map_err(|e| not_found_or_io(key, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{collect, stream_bytes};
  use bytes::Bytes;

  #[tokio::test]
  async fn test_roundtrip_nested_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path());

    store
      .put(
        "blob/ab/cd",
        stream_bytes(Bytes::from_static(b"payload")),
        "application/octet-stream",
      )
      .await
      .unwrap();

    let data = collect(store.get("blob/ab/cd").await.unwrap()).await.unwrap();
    assert_eq!(&data[..], b"payload");
    assert!(!dir.path().join("blob/ab/cd.partial").exists());
  }

  #[tokio::test]
  async fn test_missing_blob() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path());
    assert!(matches!(store.get("nope").await, Err(Error::NotFound(_))));
    assert!(matches!(store.delete("nope").await, Err(Error::NotFound(_))));
  }

  #[tokio::test]
  async fn test_rejects_escaping_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path());
    assert!(matches!(
      store.get("../etc/passwd").await,
      Err(Error::InvalidKey(_))
    ));
    assert!(matches!(store.get("/abs").await, Err(Error::InvalidKey(_))));
    assert!(matches!(store.get("").await, Err(Error::InvalidKey(_))));
  }
}

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::{check_size, generate_object_key, ByteStream, ObjectStorage, ObjectType};
use crate::error::{Error, Result};

/// Stores objects as files below a root directory, one directory per key prefix.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub async fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a key to a path, refusing anything that could escape the root.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let is_plain = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !is_plain {
            return Err(Error::NotFound(format!("object {key}")));
        }
        Ok(self.root.join(relative))
    }

}

/// Removes the file on drop unless the upload was kept, including when the
/// upload future unwinds or is cancelled mid-write.
struct PartialFile {
    path: PathBuf,
    keep: bool,
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed partial upload"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "Failed to remove partial upload")
            }
        }
    }
}

async fn write_stream(file: &mut File, mut stream: ByteStream) -> io::Result<u64> {
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

fn not_found(key: &str, err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        Error::NotFound(format!("object {key}"))
    } else {
        Error::storage_with_source(format!("cannot access object {key}"), err)
    }
}

#[async_trait]
impl ObjectStorage for FsStorage {
    async fn upload_file(
        &self,
        stream: ByteStream,
        object_type: ObjectType,
        expected_size: Option<u64>,
    ) -> Result<String> {
        let key = generate_object_key(object_type);
        let path = self.resolve(&key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut partial = PartialFile {
            path: path.clone(),
            keep: false,
        };
        let mut file = File::create(&path).await?;
        let written = write_stream(&mut file, stream).await;
        drop(file);
        let written = written?;
        check_size(expected_size, written)?;
        partial.keep = true;

        debug!(%key, size = written, "Stored object");
        Ok(key)
    }

    async fn create_download_stream(&self, key: &str) -> Result<ByteStream> {
        let path = self.resolve(key)?;
        let file = File::open(&path).await.map_err(|e| not_found(key, e))?;
        Ok(ReaderStream::new(file).boxed())
    }

    async fn delete_file(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        fs::remove_file(&path).await.map_err(|e| not_found(key, e))
    }

    async fn get_file_size(&self, key: &str) -> Result<u64> {
        let path = self.resolve(key)?;
        let meta = fs::metadata(&path).await.map_err(|e| not_found(key, e))?;
        Ok(meta.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{stream, FutureExt};
    use std::panic::AssertUnwindSafe;

    const SAMPLE: &str = "id,address\n1,8 bd du port\n2,20 avenue de Ségur\n";

    fn chunks(parts: Vec<&'static str>) -> ByteStream {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p.as_bytes())))).boxed()
    }

    async fn read_all(storage: &FsStorage, key: &str) -> Vec<u8> {
        let mut stream = storage.create_download_stream(key).await.unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    async fn assert_no_objects(root: &Path) {
        let mut entries = fs::read_dir(root).await.unwrap();
        while let Some(day_dir) = entries.next_entry().await.unwrap() {
            let mut files = fs::read_dir(day_dir.path()).await.unwrap();
            assert!(files.next_entry().await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn upload_then_download_returns_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path()).await.unwrap();

        let key = storage
            .upload_file(
                chunks(vec!["id,address\n", "1,8 bd du port\n2,20 avenue de Ségur\n"]),
                ObjectType::Input,
                Some(SAMPLE.len() as u64),
            )
            .await
            .unwrap();

        assert!(key.starts_with("input-"));
        assert_eq!(read_all(&storage, &key).await, SAMPLE.as_bytes());
        assert_eq!(storage.get_file_size(&key).await.unwrap(), SAMPLE.len() as u64);
    }

    #[tokio::test]
    async fn size_mismatch_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path()).await.unwrap();

        let err = storage
            .upload_file(chunks(vec![SAMPLE]), ObjectType::Input, Some(3))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity { expected: 3, .. }));
        assert_no_objects(dir.path()).await;
    }

    #[tokio::test]
    async fn failing_input_stream_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path()).await.unwrap();
        let input = stream::iter(vec![
            Ok(Bytes::from_static(b"id,address\n")),
            Err(io::Error::other("connection reset")),
        ])
        .boxed();

        let err = storage
            .upload_file(input, ObjectType::Input, None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "connection reset");
        assert_no_objects(dir.path()).await;
    }

    #[tokio::test]
    async fn panicking_input_stream_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path()).await.unwrap();
        let input = stream::iter(0..2)
            .map(|i| {
                if i == 1 {
                    panic!("input exploded");
                }
                Ok::<_, io::Error>(Bytes::from_static(b"id,address\n"))
            })
            .boxed();

        let outcome = AssertUnwindSafe(storage.upload_file(input, ObjectType::Output, None))
            .catch_unwind()
            .await;
        assert!(outcome.is_err());
        assert_no_objects(dir.path()).await;
    }

    #[tokio::test]
    async fn unknown_and_escaping_keys_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path()).await.unwrap();

        for key in ["test/12345", "../etc/passwd", "/etc/passwd", ""] {
            assert!(matches!(
                storage.create_download_stream(key).await,
                Err(Error::NotFound(_))
            ));
        }
        assert!(matches!(
            storage.delete_file("test/12345").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_removes_object() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path()).await.unwrap();
        let key = storage
            .upload_file(chunks(vec![SAMPLE]), ObjectType::Output, None)
            .await
            .unwrap();

        storage.delete_file(&key).await.unwrap();
        assert!(matches!(
            storage.get_file_size(&key).await,
            Err(Error::NotFound(_))
        ));
    }
}

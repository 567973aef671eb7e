use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{check_size, generate_object_key, ByteStream, ObjectStorage, ObjectType};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

/// S3-compatible object storage. Uploads are streamed through a multipart
/// writer, so inputs are never buffered in full.
pub struct S3Storage {
    store: Arc<dyn ObjectStore>,
}

impl S3Storage {
    pub fn new(config: &S3Config) -> Result<Self> {
        let mut builder = AmazonS3Builder::new().with_bucket_name(&config.bucket);
        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        if let Some(access_key) = &config.access_key {
            builder = builder.with_access_key_id(access_key);
        }
        if let Some(secret_key) = &config.secret_key {
            builder = builder.with_secret_access_key(secret_key);
        }

        Ok(Self::with_store(Arc::new(builder.build()?)))
    }

    pub fn with_store(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

fn object_path(key: &str) -> Result<ObjectPath> {
    ObjectPath::parse(key).map_err(|_| Error::NotFound(format!("object {key}")))
}

async fn write_stream(writer: &mut BufWriter, mut stream: ByteStream) -> io::Result<u64> {
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    writer.shutdown().await?;
    Ok(written)
}

/// An upload that cleans up after itself unless settled: an unfinished
/// multipart upload is aborted, a finished but rejected object deleted.
/// Dropping it unsettled (on panic or cancellation) spawns that cleanup.
struct PendingUpload {
    store: Arc<dyn ObjectStore>,
    key: String,
    path: ObjectPath,
    writer: Option<BufWriter>,
    settled: bool,
}

impl PendingUpload {
    fn new(store: Arc<dyn ObjectStore>, key: &str, path: ObjectPath) -> Self {
        let writer = BufWriter::new(Arc::clone(&store), path.clone());
        Self {
            store,
            key: key.to_string(),
            path,
            writer: Some(writer),
            settled: false,
        }
    }

    async fn write(&mut self, stream: ByteStream) -> io::Result<u64> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(io::Error::other("upload already finished"));
        };
        let written = write_stream(writer, stream).await?;
        self.writer = None;
        Ok(written)
    }

    async fn abort(&mut self) {
        self.settled = true;
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.abort().await {
                warn!(key = %self.key, error = %err, "Failed to abort upload");
            }
        }
    }

    async fn delete(&mut self) {
        self.settled = true;
        if let Err(err) = self.store.delete(&self.path).await {
            warn!(key = %self.key, error = %err, "Failed to delete rejected upload");
        }
    }

    fn keep(&mut self) {
        self.settled = true;
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "No runtime left to clean up abandoned upload");
            return;
        };
        let writer = self.writer.take();
        let store = Arc::clone(&self.store);
        let path = self.path.clone();
        let key = std::mem::take(&mut self.key);
        handle.spawn(async move {
            let result = match writer {
                Some(mut writer) => writer.abort().await,
                None => store.delete(&path).await,
            };
            match result {
                Ok(()) => debug!(%key, "Cleaned up abandoned upload"),
                Err(err) => warn!(%key, error = %err, "Failed to clean up abandoned upload"),
            }
        });
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn upload_file(
        &self,
        stream: ByteStream,
        object_type: ObjectType,
        expected_size: Option<u64>,
    ) -> Result<String> {
        let key = generate_object_key(object_type);
        let path = object_path(&key)?;

        let mut upload = PendingUpload::new(Arc::clone(&self.store), &key, path);
        let written = match upload.write(stream).await {
            Ok(written) => written,
            Err(err) => {
                upload.abort().await;
                return Err(err.into());
            }
        };

        if let Err(err) = check_size(expected_size, written) {
            upload.delete().await;
            return Err(err);
        }
        upload.keep();

        debug!(%key, size = written, "Stored object");
        Ok(key)
    }

    async fn create_download_stream(&self, key: &str) -> Result<ByteStream> {
        let result = self.store.get(&object_path(key)?).await?;
        Ok(result.into_stream().map_err(io::Error::other).boxed())
    }

    async fn delete_file(&self, key: &str) -> Result<()> {
        self.store.delete(&object_path(key)?).await?;
        Ok(())
    }

    async fn get_file_size(&self, key: &str) -> Result<u64> {
        let meta = self.store.head(&object_path(key)?).await?;
        Ok(meta.size as u64)
    }
}

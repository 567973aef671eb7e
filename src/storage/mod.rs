//! Object storage for uploaded inputs and generated outputs.
//!
//! Two backends implement the same contract: a local directory and an
//! S3-compatible bucket. The backend is picked once from configuration and
//! wrapped in [`Storage`]; the two are never mixed within a running instance.
//!
//! Contract:
//! - `upload_file` writes to a fresh key `"{type}-{YYYY-MM-DD}/{random id}"`.
//!   With an expected size, a mismatch deletes the object and fails with
//!   [`Error::Integrity`]. A failure of the input stream also removes the
//!   partial object.
//! - `create_download_stream` fails with [`Error::NotFound`] for unknown keys.

use std::fmt;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::{Error, Result};

mod fs;
mod s3;

pub use fs::FsStorage;
pub use s3::{S3Config, S3Storage};

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Input,
    Output,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn generate_object_key(object_type: ObjectType) -> String {
    format!(
        "{}-{}/{}",
        object_type,
        Utc::now().format("%Y-%m-%d"),
        Uuid::new_v4().simple()
    )
}

pub(crate) fn check_size(expected: Option<u64>, actual: u64) -> Result<()> {
    match expected {
        Some(expected) if expected != actual => Err(Error::Integrity { expected, actual }),
        _ => Ok(()),
    }
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload_file(
        &self,
        stream: ByteStream,
        object_type: ObjectType,
        expected_size: Option<u64>,
    ) -> Result<String>;

    async fn create_download_stream(&self, key: &str) -> Result<ByteStream>;

    async fn delete_file(&self, key: &str) -> Result<()>;

    async fn get_file_size(&self, key: &str) -> Result<u64>;
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    Fs { dir: PathBuf },
    S3(S3Config),
}

pub enum Storage {
    Fs(FsStorage),
    S3(S3Storage),
}

impl Storage {
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        Ok(match config {
            StorageConfig::Fs { dir } => Self::Fs(FsStorage::new(dir).await?),
            StorageConfig::S3(s3) => Self::S3(S3Storage::new(s3)?),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Fs(_) => "fs",
            Self::S3(_) => "s3",
        }
    }

    fn inner(&self) -> &dyn ObjectStorage {
        match self {
            Self::Fs(fs) => fs,
            Self::S3(s3) => s3,
        }
    }
}

#[async_trait]
impl ObjectStorage for Storage {
    async fn upload_file(
        &self,
        stream: ByteStream,
        object_type: ObjectType,
        expected_size: Option<u64>,
    ) -> Result<String> {
        self.inner()
            .upload_file(stream, object_type, expected_size)
            .await
    }

    async fn create_download_stream(&self, key: &str) -> Result<ByteStream> {
        self.inner().create_download_stream(key).await
    }

    async fn delete_file(&self, key: &str) -> Result<()> {
        self.inner().delete_file(key).await
    }

    async fn get_file_size(&self, key: &str) -> Result<u64> {
        self.inner().get_file_size(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_are_typed_dated_and_unique() {
        let a = generate_object_key(ObjectType::Input);
        let b = generate_object_key(ObjectType::Input);
        let today = Utc::now().format("%Y-%m-%d").to_string();

        assert!(a.starts_with(&format!("input-{today}/")));
        assert!(generate_object_key(ObjectType::Output).starts_with("output-"));
        assert_ne!(a, b);
    }

    #[test]
    fn size_check_only_applies_when_declared() {
        assert!(check_size(None, 12).is_ok());
        assert!(check_size(Some(12), 12).is_ok());
        assert!(matches!(
            check_size(Some(12), 10),
            Err(Error::Integrity {
                expected: 12,
                actual: 10
            })
        ));
    }
}

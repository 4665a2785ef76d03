//! S3 record storage via OpenDAL.
//!
//! Credentials and region come from the standard AWS environment.

use std::time::Duration;

use async_trait::async_trait;
use opendal::services::S3;
use opendal::{ErrorKind, Operator};

use super::{ArtifactStore, StorageError};

pub struct S3ArtifactStore {
    op: Operator,
    bucket: String,
}

impl S3ArtifactStore {
    pub fn new(bucket: &str) -> Result<Self, StorageError> {
        if bucket.is_empty() {
            return Err(StorageError::MissingBucket);
        }

        let builder = S3::default().bucket(bucket);
        let op = Operator::new(builder)
            .map_err(map_err)?
            .finish();

        tracing::info!(bucket, "Record storage ready");

        Ok(Self {
            op,
            bucket: bucket.to_string(),
        })
    }
}

fn map_err(e: opendal::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn map_key_err(key: &str, e: opendal::Error) -> StorageError {
    if e.kind() == ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        map_err(e)
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn upload(&self, key: &str, contents: Vec<u8>) -> Result<String, StorageError> {
        let size = contents.len();
        self.op.write(key, contents).await.map_err(map_err)?;
        tracing::debug!(key, size, "Uploaded record");
        Ok(format!("s3://{}/{}", self.bucket, key))
    }

    async fn download_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let buffer = self.op.read(key).await.map_err(|e| map_key_err(key, e))?;
        Ok(buffer.to_vec())
    }

    async fn public_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let request = self
            .op
            .presign_read(key, ttl)
            .await
            .map_err(|e| map_key_err(key, e))?;
        Ok(request.uri().to_string())
    }
}

//! Record storage: durable object storage for build record files.
//!
//! [`ArtifactStore`] keeps the executor and API independent of the backend;
//! production uses S3 through [`S3ArtifactStore`].

pub mod s3;

pub use s3::S3ArtifactStore;

use std::time::Duration;

use async_trait::async_trait;

/// Lifetime of presigned record URLs.
pub const PUBLIC_URL_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("a bucket is required to create record storage")]
    MissingBucket,

    #[error("object '{0}' not found")]
    NotFound(String),

    #[error("storage backend: {0}")]
    Backend(String),
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Upload `contents` under `key`, returning the object's location.
    async fn upload(&self, key: &str, contents: Vec<u8>) -> Result<String, StorageError>;

    async fn download_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Presigned URL granting temporary read access to `key`.
    async fn public_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;
}

#[cfg(test)]
pub mod memory {
    //! In-process object store with per-key upload failure injection.

    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemoryArtifactStore {
        objects: Mutex<HashMap<String, Vec<u8>>>,
        failing_keys: Mutex<HashSet<String>>,
    }

    impl MemoryArtifactStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every upload to `key` fail.
        pub fn fail_uploads_to(&self, key: &str) {
            self.failing_keys.lock().unwrap().insert(key.to_string());
        }

        pub fn object(&self, key: &str) -> Option<Vec<u8>> {
            self.objects.lock().unwrap().get(key).cloned()
        }

        pub fn keys(&self) -> Vec<String> {
            let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
            keys.sort();
            keys
        }
    }

    #[async_trait]
    impl ArtifactStore for MemoryArtifactStore {
        async fn upload(&self, key: &str, contents: Vec<u8>) -> Result<String, StorageError> {
            if self.failing_keys.lock().unwrap().contains(key) {
                return Err(StorageError::Backend(format!("injected failure for {key}")));
            }
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), contents);
            Ok(format!("memory://{key}"))
        }

        async fn download_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
            self.object(key)
                .ok_or_else(|| StorageError::NotFound(key.to_string()))
        }

        async fn public_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
            if self.object(key).is_none() {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Ok(format!("https://records.example/{key}?expires={}", ttl.as_secs()))
        }
    }
}

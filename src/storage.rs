use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use thiserror::Error;

pub const DEFAULT_BUCKET: &str = "ons-data-raw";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("invalid object path {path}: {message}")]
    InvalidPath { path: String, message: String },
}

/// Destination for transcoded files. Writes overwrite any existing object.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Uploads `data` to `path` in `bucket` (or the default bucket) and returns its location.
    async fn upload(
        &self,
        data: Bytes,
        path: &str,
        bucket: Option<&str>,
    ) -> Result<String, StorageError>;
}

type StoreFactory =
    Box<dyn Fn(&str) -> Result<Arc<dyn ObjectStore>, object_store::Error> + Send + Sync>;

/// [`BlobStore`] over `object_store`, one store per bucket built on first use.
pub struct ObjectStoreWriter {
    default_bucket: String,
    factory: StoreFactory,
    stores: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl ObjectStoreWriter {
    pub fn new(default_bucket: impl Into<String>, factory: StoreFactory) -> Self {
        Self {
            default_bucket: default_bucket.into(),
            factory,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Google Cloud Storage, credentials taken from the environment.
    pub fn gcs(default_bucket: impl Into<String>) -> Self {
        Self::new(
            default_bucket,
            Box::new(|bucket| {
                let store = GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(bucket)
                    .build()?;
                Ok(Arc::new(store) as Arc<dyn ObjectStore>)
            }),
        )
    }

    pub fn in_memory(default_bucket: impl Into<String>) -> Self {
        Self::new(
            default_bucket,
            Box::new(|_| Ok(Arc::new(InMemory::new()) as Arc<dyn ObjectStore>)),
        )
    }

    pub fn default_bucket(&self) -> &str {
        &self.default_bucket
    }

    fn resolve_bucket<'a>(&'a self, bucket: Option<&'a str>) -> &'a str {
        bucket
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(&self.default_bucket)
    }

    /// Store handle for `bucket`, built and cached on first use.
    pub fn store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, StorageError> {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(store) = stores.get(bucket) {
            return Ok(Arc::clone(store));
        }
        debug!("Creating object store for bucket {}", bucket);
        let store = (self.factory)(bucket)?;
        stores.insert(bucket.to_string(), Arc::clone(&store));
        Ok(store)
    }
}

#[async_trait]
impl BlobStore for ObjectStoreWriter {
    async fn upload(
        &self,
        data: Bytes,
        path: &str,
        bucket: Option<&str>,
    ) -> Result<String, StorageError> {
        let bucket = self.resolve_bucket(bucket);
        let location = ObjectPath::parse(path).map_err(|e| StorageError::InvalidPath {
            path: path.to_string(),
            message: e.to_string(),
        })?;

        let size = data.len();
        let store = self.store(bucket)?;
        store.put(&location, PutPayload::from_bytes(data)).await?;

        let url = format!("gs://{bucket}/{location}");
        info!("Uploaded {} bytes to {}", size, url);
        Ok(url)
    }
}

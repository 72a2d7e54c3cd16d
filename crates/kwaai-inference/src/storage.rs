//! Storage backend external collaborator (spec §6) + an in-memory
//! reference implementation used by tests and by hosts that hand the
//! loader a fully materialized archive instead of a filesystem/network
//! store.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::error::{LoaderError, LoaderResult};

/// Result of `verifyIntegrity()` (spec §6).
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub valid: bool,
    pub missing_shards: Vec<usize>,
    pub corrupt_shards: Vec<usize>,
}

/// External collaborator: the untyped blob-storage backend. Production
/// hosts implement this over OPFS/IndexedDB/a local filesystem/a network
/// fetcher; the loader only ever calls through this trait.
#[async_trait]
pub trait ShardStorageBackend: Send + Sync {
    async fn init_storage(&self) -> LoaderResult<()>;
    async fn open_model_store(&self, model_id: &str) -> LoaderResult<()>;
    async fn load_manifest_from_store(&self) -> LoaderResult<String>;
    async fn load_tensors_from_store(&self) -> LoaderResult<String>;
    /// Fetch a tensor map from an explicit URL, bypassing the model store
    /// (spec §6 `setTensorsJsonUrl`). Backends that have no notion of a
    /// network fetch (e.g. the in-memory test backend) return a
    /// `BackendError`.
    async fn load_tensors_from_url(&self, url: &str) -> LoaderResult<String> {
        Err(LoaderError::BackendError(anyhow::anyhow!(
            "backend {} does not support fetching a tensor map by URL ({url})",
            self.backend_type()
        )))
    }
    async fn load_shard(&self, index: usize) -> LoaderResult<Bytes>;
    async fn load_shard_range(
        &self,
        index: usize,
        offset: u64,
        length: Option<u64>,
    ) -> LoaderResult<Bytes>;
    /// `true` if this backend can serve `load_shard_range` without
    /// populating the shard cache (spec §4.1 `loadRange`).
    fn supports_ranged_reads(&self) -> bool;
    async fn verify_integrity(&self) -> LoaderResult<IntegrityReport>;
    fn compute_hash(&self, bytes: &[u8], algorithm: &str) -> LoaderResult<String>;
    fn backend_type(&self) -> &'static str;
}

/// Reference in-memory backend: shards, manifest, and tensor-map JSON are
/// pre-populated by the caller (typically a test fixture). Digest
/// computation only supports `sha256`, matching the one algorithm this
/// crate's dependency graph already carries.
#[derive(Default)]
pub struct InMemoryStorageBackend {
    manifest_json: Mutex<Option<String>>,
    tensors_json: Mutex<Option<String>>,
    shards: Mutex<HashMap<usize, Bytes>>,
}

impl InMemoryStorageBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_manifest(self, json: impl Into<String>) -> Self {
        *self.manifest_json.lock().unwrap() = Some(json.into());
        self
    }

    pub fn with_tensors(self, json: impl Into<String>) -> Self {
        *self.tensors_json.lock().unwrap() = Some(json.into());
        self
    }

    pub fn with_shard(self, index: usize, data: impl Into<Bytes>) -> Self {
        self.shards.lock().unwrap().insert(index, data.into());
        self
    }

    pub fn put_shard(&self, index: usize, data: impl Into<Bytes>) {
        self.shards.lock().unwrap().insert(index, data.into());
    }
}

#[async_trait]
impl ShardStorageBackend for InMemoryStorageBackend {
    async fn init_storage(&self) -> LoaderResult<()> {
        Ok(())
    }

    async fn open_model_store(&self, _model_id: &str) -> LoaderResult<()> {
        Ok(())
    }

    async fn load_manifest_from_store(&self) -> LoaderResult<String> {
        self.manifest_json
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| LoaderError::ConfigMissing("no manifest in store".into()))
    }

    async fn load_tensors_from_store(&self) -> LoaderResult<String> {
        self.tensors_json
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| LoaderError::ConfigMissing("no tensors file in store".into()))
    }

    async fn load_shard(&self, index: usize) -> LoaderResult<Bytes> {
        self.shards
            .lock()
            .unwrap()
            .get(&index)
            .cloned()
            .ok_or_else(|| LoaderError::IntegrityError(format!("shard {index} missing")))
    }

    async fn load_shard_range(
        &self,
        index: usize,
        offset: u64,
        length: Option<u64>,
    ) -> LoaderResult<Bytes> {
        let full = self.load_shard(index).await?;
        let offset = offset as usize;
        let end = match length {
            Some(len) => offset + len as usize,
            None => full.len(),
        };
        if end > full.len() {
            return Err(LoaderError::ShardTooSmall {
                shard: index,
                needed: end,
                have: full.len(),
            });
        }
        Ok(full.slice(offset..end))
    }

    fn supports_ranged_reads(&self) -> bool {
        true
    }

    async fn verify_integrity(&self) -> LoaderResult<IntegrityReport> {
        Ok(IntegrityReport {
            valid: true,
            missing_shards: Vec::new(),
            corrupt_shards: Vec::new(),
        })
    }

    fn compute_hash(&self, bytes: &[u8], algorithm: &str) -> LoaderResult<String> {
        match algorithm {
            "sha256" => {
                let mut hasher = Sha256::new();
                hasher.update(bytes);
                Ok(hex::encode(hasher.finalize()))
            }
            other => Err(LoaderError::IntegrityError(format!(
                "unsupported hash algorithm: {other}"
            ))),
        }
    }

    fn backend_type(&self) -> &'static str {
        "in-memory"
    }
}

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use thiserror::Error;

mod entry;
pub mod flush;
pub mod generation;
mod index;
mod key;
mod memory;
mod payload;
mod persistent;
pub mod snapshot;
mod store;

pub use entry::{BodyRef, CacheEntry, ResponseMeta};
pub use flush::{DefaultFlushPolicy, FlushPolicy};
pub use index::{LruIndex, NoopListener, RemovalListener, RemovalReason};
pub use key::CacheKey;
pub use memory::MemoryCacheStorage;
pub use payload::{BytesPayload, FilePayload, Payload, ReaderPayload};
pub use persistent::{
    DEFAULT_CAPACITY, DEFAULT_GENERATION_SIZE, DEFAULT_GENERATIONS, DEFAULT_SNAPSHOT_NAME,
    PersistentCacheStorage, StorageConfig,
};
pub use store::GenerationalFileStore;

/// Configuration problems and setup failures that prevent a storage from
/// being constructed.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cache capacity must be greater than zero")]
    InvalidCapacity,
    #[error("generation retention count must be greater than zero")]
    InvalidRetention,
    #[error("generation size must be greater than zero")]
    InvalidRotationThreshold,
    #[error("snapshot name {0:?} must be a plain, non-numeric file name")]
    InvalidSnapshotName(String),
    #[error("failed to create cache dir {}", .path.display())]
    CreateBaseDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Storage operations consumed by the HTTP layer above the cache.
///
/// Implementations never surface persistence I/O failures: a body that cannot
/// be written is simply not cached, and a body that went missing is a miss.
pub trait CacheStorage: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<CachedResponse>;

    /// Stores `payload` under `key`, replacing any previous variant. Returns
    /// the stored response, or `None` if the payload could not be captured.
    fn put(
        &self,
        key: CacheKey,
        meta: ResponseMeta,
        payload: &mut dyn Payload,
    ) -> Option<CachedResponse>;

    fn remove(&self, key: &CacheKey);

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub enum CachedBody {
    File(PathBuf),
    Memory(Bytes),
}

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub key: CacheKey,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub captured_at: SystemTime,
    pub content_type: Option<String>,
    pub content_length: u64,
    pub body: CachedBody,
}

impl CachedResponse {
    pub fn body_path(&self) -> Option<&Path> {
        match &self.body {
            CachedBody::File(path) => Some(path),
            CachedBody::Memory(_) => None,
        }
    }

    pub fn read_body(&self) -> io::Result<Bytes> {
        match &self.body {
            CachedBody::File(path) => fs::read(path).map(Bytes::from),
            CachedBody::Memory(bytes) => Ok(bytes.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    pub entries: usize,
    pub capacity: usize,
    pub active_generation: u64,
    pub generations: Vec<u64>,
}

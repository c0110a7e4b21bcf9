use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tracing::warn;

use super::{
    CacheKey, CacheStorage, CachedBody, CachedResponse, LruIndex, Payload, RemovalListener,
    RemovalReason, ResponseMeta, StorageError,
};

#[derive(Debug, Clone)]
struct MemoryEntry {
    meta: ResponseMeta,
    content_type: Option<String>,
    body: Bytes,
}

#[derive(Debug, Default)]
struct LogRemovals;

impl RemovalListener for LogRemovals {
    fn on_removed(&self, key: &CacheKey, reason: RemovalReason) {
        crate::logging::log_removal(key, reason);
    }
}

/// Response storage that keeps bodies in memory; nothing survives the process.
#[derive(Debug)]
pub struct MemoryCacheStorage {
    index: LruIndex<MemoryEntry>,
}

impl MemoryCacheStorage {
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_listener(capacity, Arc::new(LogRemovals))
    }

    /// Builds a storage whose removals are also reported to `listener`.
    pub fn with_listener(capacity: usize, listener: Arc<dyn RemovalListener>) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or(StorageError::InvalidCapacity)?;
        Ok(Self {
            index: LruIndex::new(capacity, listener),
        })
    }

    pub fn capacity(&self) -> usize {
        self.index.capacity()
    }
}

impl CacheStorage for MemoryCacheStorage {
    fn get(&self, key: &CacheKey) -> Option<CachedResponse> {
        let Some(entry) = self.index.get(key) else {
            crate::metrics::record_cache_lookup("miss");
            return None;
        };
        crate::metrics::record_cache_lookup("hit");
        Some(to_response(key, entry))
    }

    fn put(
        &self,
        key: CacheKey,
        meta: ResponseMeta,
        payload: &mut dyn Payload,
    ) -> Option<CachedResponse> {
        let mut buffer = Vec::new();
        if let Err(err) = payload.write_to(&mut buffer) {
            warn!(error = %err, key = %key, "failed to read payload; response not cached");
            return None;
        }
        let entry = MemoryEntry {
            meta,
            content_type: payload.content_type().map(str::to_string),
            body: Bytes::from(buffer),
        };
        let response = to_response(&key, entry.clone());
        self.index.put(key, entry);
        crate::metrics::record_cache_store();
        Some(response)
    }

    fn remove(&self, key: &CacheKey) {
        self.index.remove(key);
    }

    fn clear(&self) {
        self.index.clear();
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

fn to_response(key: &CacheKey, entry: MemoryEntry) -> CachedResponse {
    CachedResponse {
        key: key.clone(),
        status: entry.meta.status,
        headers: entry.meta.headers,
        captured_at: entry.meta.captured_at,
        content_type: entry.content_type,
        content_length: entry.body.len() as u64,
        body: CachedBody::Memory(entry.body),
    }
}

#![allow(dead_code)]

mod dirs;

use std::time::Duration;

use anyhow::Result;
use http::{HeaderMap, Method, StatusCode, Uri};

use httpcache_store::cache::{
    BytesPayload, CacheKey, CachedResponse, FlushPolicy, PersistentCacheStorage, ResponseMeta,
    StorageConfig,
};

pub use dirs::{TestDirs, generation_dirs, payload_file_count};

/// Flush policy that never fires, leaving snapshot timing to the test.
pub struct ManualFlush;

impl FlushPolicy for ManualFlush {
    fn should_flush(&self, _mutation_count: u64, _elapsed: Duration) -> bool {
        false
    }
}

pub fn key(path: &str) -> CacheKey {
    let uri: Uri = format!("http://origin.test{path}")
        .parse()
        .expect("valid test uri");
    CacheKey::new(&Method::GET, &uri)
}

pub fn meta() -> ResponseMeta {
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        "application/octet-stream".parse().expect("valid header"),
    );
    ResponseMeta::new(StatusCode::OK, headers)
}

pub fn open(
    dirs: &TestDirs,
    capacity: usize,
    generation_size: usize,
    generations: usize,
) -> Result<PersistentCacheStorage> {
    let config = StorageConfig::new(&dirs.cache_dir)
        .capacity(capacity)
        .generation_size(generation_size)
        .generations(generations);
    PersistentCacheStorage::open_with_policy(config, Box::new(ManualFlush))
}

pub fn store(storage: &PersistentCacheStorage, path: &str, body: &[u8]) -> Result<CachedResponse> {
    let mut payload = BytesPayload::new(body.to_vec(), Some("application/octet-stream"));
    storage
        .put(key(path), meta(), &mut payload)
        .ok_or_else(|| anyhow::anyhow!("failed to store {path}"))
}

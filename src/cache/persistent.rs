use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::flush::{DefaultFlushPolicy, FlushPolicy, FlushState};
use super::generation::TEMP_FILE_PREFIX;
use super::snapshot::{self, SnapshotFile, SnapshotRecord};
use super::{
    BodyRef, CacheEntry, CacheKey, CacheStorage, CachedBody, CachedResponse,
    GenerationalFileStore, LruIndex, Payload, RemovalListener, RemovalReason, ResponseMeta,
    StorageError, StorageStats,
};

pub const DEFAULT_SNAPSHOT_NAME: &str = "persistent.json";
pub const DEFAULT_CAPACITY: usize = 1000;
pub const DEFAULT_GENERATIONS: usize = 5;
pub const DEFAULT_GENERATION_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub base_dir: PathBuf,
    /// Maximum number of indexed responses.
    pub capacity: usize,
    /// Generations kept on disk.
    pub generations: usize,
    /// Files a generation may hold before the next one is opened.
    pub generation_size: usize,
    pub snapshot_name: String,
}

impl StorageConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            capacity: DEFAULT_CAPACITY,
            generations: DEFAULT_GENERATIONS,
            generation_size: DEFAULT_GENERATION_SIZE,
            snapshot_name: DEFAULT_SNAPSHOT_NAME.to_string(),
        }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn generations(mut self, generations: usize) -> Self {
        self.generations = generations;
        self
    }

    pub fn generation_size(mut self, generation_size: usize) -> Self {
        self.generation_size = generation_size;
        self
    }

    pub fn snapshot_name(mut self, name: impl Into<String>) -> Self {
        self.snapshot_name = name.into();
        self
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.base_dir.join(&self.snapshot_name)
    }
}

/// Deletes payload files as entries leave the index; a clear wipes the whole
/// generation tree and the snapshot in one step instead of file by file.
#[derive(Debug)]
struct FileRemovalListener {
    store: Arc<GenerationalFileStore>,
    snapshot_path: PathBuf,
}

impl RemovalListener for FileRemovalListener {
    fn on_removed(&self, key: &CacheKey, reason: RemovalReason) {
        crate::logging::log_removal(key, reason);
        if reason != RemovalReason::Clear {
            self.store.remove(key);
        }
    }

    fn after_clear(&self) {
        self.store.clear();
        match fs::remove_file(&self.snapshot_path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!(
                    error = %err,
                    path = %self.snapshot_path.display(),
                    "failed to delete cache snapshot"
                );
            }
        }
    }
}

/// Disk-backed response storage: an LRU index whose bodies live in a
/// [`GenerationalFileStore`], recovered from a snapshot on open.
///
/// Lock order is `snapshot_lock`, `write_lock`, index, store.
pub struct PersistentCacheStorage {
    index: LruIndex<CacheEntry>,
    store: Arc<GenerationalFileStore>,
    snapshot_path: PathBuf,
    policy: Box<dyn FlushPolicy>,
    flush: Mutex<FlushState>,
    snapshot_lock: Mutex<()>,
    /// Held while a body is moved into place and its entry indexed, so the
    /// index never describes another writer's bytes.
    write_lock: Mutex<()>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for PersistentCacheStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentCacheStorage")
            .field("index", &self.index)
            .field("store", &self.store)
            .field("snapshot_path", &self.snapshot_path)
            .finish()
    }
}

impl PersistentCacheStorage {
    pub fn open(config: StorageConfig) -> Result<Self> {
        Self::open_with_policy(config, Box::new(DefaultFlushPolicy::default()))
    }

    pub fn open_with_policy(config: StorageConfig, policy: Box<dyn FlushPolicy>) -> Result<Self> {
        let capacity = NonZeroUsize::new(config.capacity).ok_or(StorageError::InvalidCapacity)?;
        if !is_plain_file_name(&config.snapshot_name) {
            return Err(StorageError::InvalidSnapshotName(config.snapshot_name).into());
        }
        let store = Arc::new(GenerationalFileStore::new(
            &config.base_dir,
            config.generations,
            config.generation_size,
        )?);
        let snapshot_path = config.snapshot_path();
        if config.generations.saturating_mul(config.generation_size) <= config.capacity {
            warn!(
                capacity = config.capacity,
                generations = config.generations,
                generation_size = config.generation_size,
                "generation budget does not exceed index capacity; entries will outlive their bodies"
            );
        }

        let listener = Arc::new(FileRemovalListener {
            store: store.clone(),
            snapshot_path: snapshot_path.clone(),
        });
        let storage = Self {
            index: LruIndex::new(capacity, listener),
            store,
            snapshot_path,
            policy,
            flush: Mutex::new(FlushState::new()),
            snapshot_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
        };
        storage.load();
        Ok(storage)
    }

    pub fn store(&self) -> &GenerationalFileStore {
        &self.store
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn capacity(&self) -> usize {
        self.index.capacity()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index.contains(key)
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            entries: self.index.len(),
            capacity: self.index.capacity(),
            active_generation: self.store.active_sequence(),
            generations: self.store.sequences(),
        }
    }

    /// Entries currently indexed, least recently used first.
    pub fn entries(&self) -> Vec<(CacheKey, CacheEntry)> {
        self.index.snapshot()
    }

    /// Looks `key` up, marking it most recently used. An entry whose body is
    /// gone from disk is dropped and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<CachedResponse> {
        let Some(entry) = self.index.get(key) else {
            crate::metrics::record_cache_lookup("miss");
            return None;
        };

        let Some(body_path) = self.store.resolve_path_for_read(key) else {
            warn!(key = %key, "cached body missing on disk; dropping entry");
            self.index.remove_if(key, |current| current.id == entry.id);
            crate::metrics::record_cache_lookup("stale");
            return None;
        };

        crate::metrics::record_cache_lookup("hit");
        Some(to_response(key, &entry, body_path))
    }

    pub fn put(
        &self,
        key: CacheKey,
        meta: ResponseMeta,
        payload: &mut dyn Payload,
    ) -> Option<CachedResponse> {
        let staging_dir = self.store.staging_dir();
        let staged = match stage_payload(&staging_dir, payload) {
            Ok(staged) => staged,
            Err(err) => {
                warn!(
                    error = %err,
                    key = %key,
                    path = %staging_dir.display(),
                    "failed to write cached body; response not cached"
                );
                return None;
            }
        };

        let response = {
            let _write = self.write_lock.lock();
            let body_path = self.store.resolve_path_for_write(&key);
            if let Err(err) = fs::rename(&staged.path, &body_path) {
                fs::remove_file(&staged.path).ok();
                warn!(
                    error = %err,
                    key = %key,
                    path = %body_path.display(),
                    "failed to move cached body into place; response not cached"
                );
                return None;
            }

            let entry = CacheEntry {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                meta,
                body: BodyRef {
                    file_name: key.file_name(),
                    content_type: payload.content_type().map(str::to_string),
                    content_length: staged.content_length,
                },
            };
            let response = to_response(&key, &entry, body_path);
            trace!(key = %key, content_length = staged.content_length, "stored cache entry");
            self.index.put(key, entry);
            response
        };
        crate::metrics::record_cache_store();
        self.record_mutation();
        Some(response)
    }

    pub fn remove(&self, key: &CacheKey) {
        let _write = self.write_lock.lock();
        self.index.remove(key);
    }

    /// Empties the index and the disk. Holding the snapshot lock keeps a save
    /// that copied the index earlier from rewriting the snapshot afterwards.
    pub fn clear(&self) {
        let _snapshot = self.snapshot_lock.lock();
        let _write = self.write_lock.lock();
        self.index.clear();
        self.flush.lock().reset();
    }

    /// Counts a mutation and writes a snapshot when the flush policy asks for one.
    pub fn record_mutation(&self) {
        let due = self.flush.lock().record(self.policy.as_ref());
        if due {
            self.save();
        }
    }

    /// Writes a point-in-time snapshot of the index. Failures are logged and
    /// reported through the return value only.
    pub fn save(&self) -> bool {
        let _guard = self.snapshot_lock.lock();
        let entries = self.index.snapshot();
        let records = entries
            .iter()
            .map(|(key, entry)| {
                let generation = self.store.locate(key).map(|(sequence, _)| sequence);
                SnapshotRecord::from_entry(key, entry, generation)
            })
            .collect::<Vec<_>>();
        let count = records.len();

        match snapshot::write_atomic(&self.snapshot_path, &SnapshotFile::new(records)) {
            Ok(()) => {
                self.flush.lock().reset();
                crate::metrics::record_snapshot_save(true);
                debug!(entries = count, path = %self.snapshot_path.display(), "saved cache snapshot");
                true
            }
            Err(err) => {
                crate::metrics::record_snapshot_save(false);
                warn!(
                    error = %err,
                    path = %self.snapshot_path.display(),
                    "failed to save cache snapshot"
                );
                false
            }
        }
    }

    /// Final snapshot for a graceful stop.
    pub fn shutdown(&self) {
        info!(entries = self.index.len(), "saving cache snapshot before shutdown");
        self.save();
    }

    fn load(&self) {
        let snapshot = match snapshot::read(&self.snapshot_path) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                crate::metrics::record_snapshot_load("empty");
                return;
            }
            Err(err) => {
                warn!(
                    error = %err,
                    path = %self.snapshot_path.display(),
                    "discarding unreadable cache snapshot"
                );
                fs::remove_file(&self.snapshot_path).ok();
                crate::metrics::record_snapshot_load("discarded");
                return;
            }
        };

        let mut dropped = 0usize;
        for record in snapshot.entries {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let Some((key, entry)) = record.into_entry(id) else {
                dropped += 1;
                continue;
            };
            if self.store.locate(&key).is_none() {
                trace!(key = %key, "snapshot entry has no body on disk");
                dropped += 1;
                continue;
            }
            self.index.put(key, entry);
        }
        crate::metrics::record_snapshot_load("restored");
        info!(
            restored = self.index.len(),
            dropped,
            path = %self.snapshot_path.display(),
            "restored cache index from snapshot"
        );
    }
}

impl CacheStorage for PersistentCacheStorage {
    fn get(&self, key: &CacheKey) -> Option<CachedResponse> {
        PersistentCacheStorage::get(self, key)
    }

    fn put(
        &self,
        key: CacheKey,
        meta: ResponseMeta,
        payload: &mut dyn Payload,
    ) -> Option<CachedResponse> {
        PersistentCacheStorage::put(self, key, meta, payload)
    }

    fn remove(&self, key: &CacheKey) {
        PersistentCacheStorage::remove(self, key)
    }

    fn clear(&self) {
        PersistentCacheStorage::clear(self)
    }

    fn len(&self) -> usize {
        PersistentCacheStorage::len(self)
    }
}

fn to_response(key: &CacheKey, entry: &CacheEntry, body_path: PathBuf) -> CachedResponse {
    CachedResponse {
        key: key.clone(),
        status: entry.meta.status,
        headers: entry.meta.headers.clone(),
        captured_at: entry.meta.captured_at,
        content_type: entry.body.content_type.clone(),
        content_length: entry.body.content_length,
        body: CachedBody::File(body_path),
    }
}

/// A fully written body waiting to be renamed into its generation.
struct StagedPayload {
    path: PathBuf,
    content_length: u64,
}

/// Streams the payload into a temp file in `dir`. Readers never see it until
/// it is renamed to its final path.
fn stage_payload(dir: &Path, payload: &mut dyn Payload) -> io::Result<StagedPayload> {
    let temp_path = dir.join(format!("{TEMP_FILE_PREFIX}{}", uuid::Uuid::new_v4()));

    let result = (|| -> io::Result<u64> {
        let mut options = OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&temp_path)?;
        let mut writer = BufWriter::new(file);
        let written = payload.write_to(&mut writer)?;
        writer.flush()?;
        Ok(written)
    })();

    match result {
        Ok(content_length) => Ok(StagedPayload {
            path: temp_path,
            content_length,
        }),
        Err(err) => {
            fs::remove_file(&temp_path).ok();
            Err(err)
        }
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && super::generation::parse_sequence(name).is_none()
}

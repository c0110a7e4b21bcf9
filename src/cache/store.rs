use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{info, trace, warn};

use super::generation::{Generation, parse_sequence};
use super::{CacheKey, StorageError};

const FIRST_SEQUENCE: u64 = 1;

/// Payload files spread over numbered generation directories.
///
/// The generation with the highest sequence is active and receives every new
/// file. Once it holds more than `rotation_threshold` files a successor is
/// opened, and generations beyond `retention` are deleted oldest first. Files
/// read or rewritten from an older generation are moved into the active one,
/// so anything accessed within the retention window survives it.
#[derive(Debug)]
pub struct GenerationalFileStore {
    base_dir: PathBuf,
    retention: usize,
    rotation_threshold: usize,
    /// Ascending by sequence; never empty after construction.
    generations: Mutex<Vec<Generation>>,
}

impl GenerationalFileStore {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        retention: usize,
        rotation_threshold: usize,
    ) -> Result<Self> {
        if retention == 0 {
            return Err(StorageError::InvalidRetention.into());
        }
        if rotation_threshold == 0 {
            return Err(StorageError::InvalidRotationThreshold.into());
        }
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).map_err(|source| StorageError::CreateBaseDir {
            path: base_dir.clone(),
            source,
        })?;

        let generations = scan_generations(&base_dir)?;
        let store = Self {
            base_dir,
            retention,
            rotation_threshold,
            generations: Mutex::new(generations),
        };
        {
            let mut generations = store.generations.lock();
            store.maintain(&mut generations);
            info!(
                path = %store.base_dir.display(),
                generations = generations.len(),
                active = generations.last().map(Generation::sequence).unwrap_or(FIRST_SEQUENCE),
                "generational file store opened"
            );
        }
        Ok(store)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn rotation_threshold(&self) -> usize {
        self.rotation_threshold
    }

    pub fn active_sequence(&self) -> u64 {
        self.generations
            .lock()
            .last()
            .map(Generation::sequence)
            .unwrap_or(FIRST_SEQUENCE)
    }

    /// Sequences of all tracked generations, oldest first.
    pub fn sequences(&self) -> Vec<u64> {
        self.generations
            .lock()
            .iter()
            .map(Generation::sequence)
            .collect()
    }

    /// Directory of the active generation, where payloads are staged before
    /// being renamed to the path [`Self::resolve_path_for_write`] returns.
    pub fn staging_dir(&self) -> PathBuf {
        self.generations
            .lock()
            .last()
            .map(|active| active.dir().to_path_buf())
            .unwrap_or_else(|| self.base_dir.join(FIRST_SEQUENCE.to_string()))
    }

    /// Path the caller should write `key`'s payload to. An existing file in an
    /// older generation is promoted first and its new location returned; if the
    /// move fails the old location is returned instead.
    pub fn resolve_path_for_write(&self, key: &CacheKey) -> PathBuf {
        let file_name = key.file_name();
        let mut generations = self.generations.lock();
        self.maintain(&mut generations);
        if let Some(path) = promote(&mut generations, &file_name) {
            return path;
        }
        match generations.last_mut() {
            Some(active) => {
                // Counted on reservation; a write that never lands only brings
                // the next rotation forward by one file.
                active.note_added();
                active.file_path(&file_name)
            }
            None => self.fallback_path(&file_name),
        }
    }

    /// Current location of `key`'s payload, promoting it into the active
    /// generation when found in an older one.
    pub fn resolve_path_for_read(&self, key: &CacheKey) -> Option<PathBuf> {
        let file_name = key.file_name();
        let mut generations = self.generations.lock();
        self.maintain(&mut generations);
        promote(&mut generations, &file_name)
    }

    /// Generation and path holding `key`'s payload, without promoting it.
    pub fn locate(&self, key: &CacheKey) -> Option<(u64, PathBuf)> {
        let file_name = key.file_name();
        let generations = self.generations.lock();
        generations
            .iter()
            .rev()
            .find(|generation| generation.holds(&file_name))
            .map(|generation| (generation.sequence(), generation.file_path(&file_name)))
    }

    pub fn remove(&self, key: &CacheKey) {
        let file_name = key.file_name();
        let mut generations = self.generations.lock();
        for generation in generations.iter_mut().rev() {
            remove_copy(generation, &file_name);
        }
    }

    /// Deletes every generation and starts over with a single empty one.
    /// Generations that cannot be fully deleted stay tracked so a later prune
    /// or clear retries them; the new active generation is numbered past them.
    pub fn clear(&self) {
        let mut generations = self.generations.lock();
        let mut kept = Vec::new();
        for generation in generations.drain(..) {
            let undeletable = generation.delete();
            if undeletable.is_empty() {
                continue;
            }
            crate::metrics::record_generation_prune_failure();
            warn!(
                sequence = generation.sequence(),
                undeletable = ?undeletable,
                "generation could not be fully deleted during clear; will retry"
            );
            kept.push(generation);
        }
        let next = kept
            .last()
            .map(|generation| generation.sequence() + 1)
            .unwrap_or(FIRST_SEQUENCE);
        *generations = kept;
        match Generation::open(&self.base_dir, next) {
            Ok(active) => generations.push(active),
            Err(err) => warn!(error = %err, sequence = next, "failed to recreate active generation"),
        }
        info!(
            path = %self.base_dir.display(),
            retained = generations.len().saturating_sub(1),
            "generational file store cleared"
        );
    }

    fn maintain(&self, generations: &mut Vec<Generation>) {
        if generations.is_empty() {
            match Generation::open(&self.base_dir, FIRST_SEQUENCE) {
                Ok(first) => generations.push(first),
                Err(err) => {
                    warn!(error = %err, "failed to open first generation");
                    return;
                }
            }
        }
        self.rotate_if_full(generations);
        self.prune(generations);
    }

    fn rotate_if_full(&self, generations: &mut Vec<Generation>) {
        let Some(active) = generations.last() else {
            return;
        };
        if active.file_count() <= self.rotation_threshold {
            return;
        }
        let next = active.sequence() + 1;
        match Generation::open(&self.base_dir, next) {
            Ok(generation) => {
                crate::metrics::record_generation_rotation();
                info!(
                    previous = active.sequence(),
                    sequence = next,
                    files = active.file_count(),
                    "rotated to new generation"
                );
                generations.push(generation);
            }
            Err(err) => {
                warn!(error = %err, sequence = next, "failed to open new generation");
            }
        }
    }

    fn prune(&self, generations: &mut Vec<Generation>) {
        while generations.len() > self.retention {
            let oldest = &generations[0];
            let undeletable = oldest.delete();
            if !undeletable.is_empty() {
                crate::metrics::record_generation_prune_failure();
                warn!(
                    sequence = oldest.sequence(),
                    undeletable = ?undeletable,
                    "unable to delete expired generation; will retry"
                );
                return;
            }
            crate::metrics::record_generation_pruned();
            info!(
                sequence = oldest.sequence(),
                files = oldest.file_count(),
                "deleted expired generation"
            );
            generations.remove(0);
        }
    }

    fn fallback_path(&self, file_name: &str) -> PathBuf {
        self.base_dir
            .join(FIRST_SEQUENCE.to_string())
            .join(file_name)
    }
}

/// Finds `file_name` newest generation first and moves it into the active one.
/// Once moved, stale copies left in generations older than the source are
/// deleted.
fn promote(generations: &mut [Generation], file_name: &str) -> Option<PathBuf> {
    let active_pos = generations.len().checked_sub(1)?;
    let found = (0..generations.len())
        .rev()
        .find(|&pos| generations[pos].holds(file_name))?;
    let source = generations[found].file_path(file_name);
    if found == active_pos {
        return Some(source);
    }

    let target = generations[active_pos].file_path(file_name);
    match fs::rename(&source, &target) {
        Ok(()) => {
            generations[found].note_removed();
            generations[active_pos].note_added();
            crate::metrics::record_promotion();
            trace!(
                from = generations[found].sequence(),
                to = generations[active_pos].sequence(),
                file = file_name,
                "promoted cached payload"
            );
            for stale in &mut generations[..found] {
                remove_copy(stale, file_name);
            }
            Some(target)
        }
        Err(err) => {
            warn!(
                error = %err,
                path = %source.display(),
                "failed to promote cached payload; serving from older generation"
            );
            Some(source)
        }
    }
}

fn remove_copy(generation: &mut Generation, file_name: &str) {
    let path = generation.file_path(file_name);
    match fs::remove_file(&path) {
        Ok(()) => {
            generation.note_removed();
            trace!(path = %path.display(), "removed cached payload");
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            warn!(error = %err, path = %path.display(), "failed to remove cached payload");
        }
    }
}

fn scan_generations(base_dir: &Path) -> Result<Vec<Generation>> {
    let mut generations = Vec::new();
    for entry in fs::read_dir(base_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(sequence) = parse_sequence(&name.to_string_lossy()) else {
            continue;
        };
        generations.push(Generation::open(base_dir, sequence)?);
    }
    generations.sort_by_key(Generation::sequence);
    if generations.is_empty() {
        generations.push(Generation::open(base_dir, FIRST_SEQUENCE)?);
    }
    Ok(generations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Uri};
    use tempfile::TempDir;

    fn key(path: &str) -> CacheKey {
        let uri: Uri = format!("http://example.com{path}").parse().unwrap();
        CacheKey::new(&Method::GET, &uri)
    }

    fn write(store: &GenerationalFileStore, key: &CacheKey, body: &[u8]) -> Result<PathBuf> {
        let path = store.resolve_path_for_write(key);
        fs::write(&path, body)?;
        Ok(path)
    }

    fn dir_names(base: &Path) -> Result<Vec<u64>> {
        let mut names = fs::read_dir(base)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
            .filter_map(|entry| parse_sequence(&entry.file_name().to_string_lossy()))
            .collect::<Vec<_>>();
        names.sort_unstable();
        Ok(names)
    }

    #[test]
    fn seeds_first_generation_in_new_dir() -> Result<()> {
        let dir = TempDir::new()?;
        let base = dir.path().join("nested").join("cache");
        let store = GenerationalFileStore::new(&base, 3, 10)?;
        assert_eq!(store.sequences(), vec![1]);
        assert!(base.join("1").is_dir());
        Ok(())
    }

    #[test]
    fn rejects_zero_retention_and_threshold() -> Result<()> {
        let dir = TempDir::new()?;
        let err = GenerationalFileStore::new(dir.path(), 0, 10).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::InvalidRetention)
        ));
        let err = GenerationalFileStore::new(dir.path(), 2, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::InvalidRotationThreshold)
        ));
        Ok(())
    }

    #[test]
    fn fails_when_base_dir_cannot_be_created() -> Result<()> {
        let dir = TempDir::new()?;
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"not a dir")?;
        let err = GenerationalFileStore::new(blocker.join("cache"), 2, 2).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::CreateBaseDir { .. })
        ));
        Ok(())
    }

    #[test]
    fn reconstructs_generations_from_existing_dirs() -> Result<()> {
        let dir = TempDir::new()?;
        for seq in ["2", "7", "5"] {
            fs::create_dir_all(dir.path().join(seq))?;
        }
        fs::create_dir_all(dir.path().join("not-a-generation"))?;
        fs::write(dir.path().join("persistent.json"), b"{}")?;

        let store = GenerationalFileStore::new(dir.path(), 5, 10)?;
        assert_eq!(store.sequences(), vec![2, 5, 7]);
        assert_eq!(store.active_sequence(), 7);
        assert!(dir.path().join("not-a-generation").exists());
        Ok(())
    }

    #[test]
    fn rotates_when_active_exceeds_threshold() -> Result<()> {
        let dir = TempDir::new()?;
        let store = GenerationalFileStore::new(dir.path(), 5, 2)?;
        let a = write(&store, &key("/a"), b"a")?;
        let b = write(&store, &key("/b"), b"b")?;
        let c = write(&store, &key("/c"), b"c")?;
        assert!(a.starts_with(dir.path().join("1")));
        assert!(b.starts_with(dir.path().join("1")));
        assert!(c.starts_with(dir.path().join("1")));
        assert_eq!(store.active_sequence(), 1);

        let d = write(&store, &key("/d"), b"d")?;
        assert_eq!(store.active_sequence(), 2);
        assert!(d.starts_with(dir.path().join("2")));
        Ok(())
    }

    #[test]
    fn promotes_file_from_older_generation_on_read() -> Result<()> {
        let dir = TempDir::new()?;
        let store = GenerationalFileStore::new(dir.path(), 5, 1)?;
        // Fill generations 1 and 2 so the next write opens generation 3.
        for path in ["/f1", "/f2", "/f3", "/f4"] {
            write(&store, &key(path), b"filler")?;
        }
        let target = key("/k");
        let original = write(&store, &target, b"payload")?;
        assert_eq!(store.active_sequence(), 3);
        assert!(original.starts_with(dir.path().join("3")));

        for path in ["/g1", "/g2", "/g3", "/g4"] {
            write(&store, &key(path), b"filler")?;
        }
        assert_eq!(store.active_sequence(), 5);

        let promoted = store
            .resolve_path_for_read(&target)
            .expect("payload should still be found");
        assert!(promoted.starts_with(dir.path().join("5")));
        assert!(!original.exists());
        assert_eq!(fs::read(&promoted)?, b"payload");
        assert_eq!(store.locate(&target).map(|(seq, _)| seq), Some(5));
        Ok(())
    }

    #[test]
    fn write_path_for_existing_key_promotes_instead_of_duplicating() -> Result<()> {
        let dir = TempDir::new()?;
        let store = GenerationalFileStore::new(dir.path(), 5, 1)?;
        let target = key("/k");
        let first = write(&store, &target, b"v1")?;
        write(&store, &key("/x"), b"x")?;
        write(&store, &key("/y"), b"y")?;
        assert_eq!(store.active_sequence(), 2);

        let second = store.resolve_path_for_write(&target);
        assert!(second.starts_with(dir.path().join("2")));
        assert!(!first.exists());
        assert_eq!(fs::read(&second)?, b"v1");
        Ok(())
    }

    #[test]
    fn retention_keeps_only_newest_generations() -> Result<()> {
        let dir = TempDir::new()?;
        let store = GenerationalFileStore::new(dir.path(), 3, 1)?;
        for i in 0..20 {
            write(&store, &key(&format!("/{i}")), b"x")?;
            assert!(dir_names(dir.path())?.len() <= 3);
        }
        let sequences = store.sequences();
        assert_eq!(sequences.len(), 3);
        assert_eq!(dir_names(dir.path())?, sequences);
        let active = store.active_sequence();
        assert_eq!(sequences, vec![active - 2, active - 1, active]);
        Ok(())
    }

    #[test]
    fn read_of_missing_key_returns_none() -> Result<()> {
        let dir = TempDir::new()?;
        let store = GenerationalFileStore::new(dir.path(), 2, 2)?;
        assert!(store.resolve_path_for_read(&key("/missing")).is_none());
        Ok(())
    }

    #[test]
    fn remove_is_idempotent() -> Result<()> {
        let dir = TempDir::new()?;
        let store = GenerationalFileStore::new(dir.path(), 2, 2)?;
        let path = write(&store, &key("/a"), b"a")?;
        store.remove(&key("/a"));
        assert!(!path.exists());
        store.remove(&key("/a"));
        store.remove(&key("/never"));
        Ok(())
    }

    #[test]
    fn clear_resets_to_single_fresh_generation() -> Result<()> {
        let dir = TempDir::new()?;
        let store = GenerationalFileStore::new(dir.path(), 4, 1)?;
        for i in 0..6 {
            write(&store, &key(&format!("/{i}")), b"x")?;
        }
        assert!(store.active_sequence() > 1);

        for _ in 0..2 {
            store.clear();
            assert_eq!(store.sequences(), vec![1]);
            assert_eq!(dir_names(dir.path())?, vec![1]);
            assert_eq!(fs::read_dir(dir.path().join("1"))?.count(), 0);
        }
        Ok(())
    }

    #[test]
    fn reopening_counts_existing_files_toward_rotation() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let store = GenerationalFileStore::new(dir.path(), 3, 2)?;
            for path in ["/a", "/b", "/c"] {
                write(&store, &key(path), b"x")?;
            }
            assert_eq!(store.active_sequence(), 1);
        }
        let reopened = GenerationalFileStore::new(dir.path(), 3, 2)?;
        assert_eq!(reopened.active_sequence(), 2);
        Ok(())
    }

    /// Replaces a generation directory with a plain file so listing it fails.
    fn block_generation(base: &Path, sequence: u64) -> Result<PathBuf> {
        let path = base.join(sequence.to_string());
        fs::remove_dir_all(&path)?;
        fs::write(&path, b"blocked")?;
        Ok(path)
    }

    #[test]
    fn failed_promotion_serves_from_older_generation() -> Result<()> {
        let dir = TempDir::new()?;
        let store = GenerationalFileStore::new(dir.path(), 5, 1)?;
        let target = key("/k");
        let original = write(&store, &target, b"payload")?;
        write(&store, &key("/x"), b"x")?;
        write(&store, &key("/y"), b"y")?;
        assert_eq!(store.active_sequence(), 2);

        // A directory squatting on the target name makes the rename fail.
        fs::create_dir_all(dir.path().join("2").join(target.file_name()))?;

        let served = store
            .resolve_path_for_read(&target)
            .expect("payload should still be found");
        assert_eq!(served, original);
        assert_eq!(fs::read(&served)?, b"payload");
        assert_eq!(store.locate(&target).map(|(seq, _)| seq), Some(1));
        Ok(())
    }

    #[test]
    fn undeletable_generation_stays_tracked_until_prune_succeeds() -> Result<()> {
        let dir = TempDir::new()?;
        let store = GenerationalFileStore::new(dir.path(), 2, 1)?;
        for path in ["/0", "/1", "/2", "/3"] {
            write(&store, &key(path), b"x")?;
        }
        assert_eq!(store.sequences(), vec![1, 2]);

        let blocked = block_generation(dir.path(), 1)?;
        write(&store, &key("/4"), b"x")?;
        write(&store, &key("/5"), b"x")?;
        assert_eq!(store.sequences(), vec![1, 2, 3]);
        assert!(dir.path().join("2").join(key("/2").file_name()).exists());

        fs::remove_file(&blocked)?;
        store.resolve_path_for_read(&key("/missing"));
        assert_eq!(store.sequences(), vec![3, 4]);
        assert_eq!(dir_names(dir.path())?, vec![3, 4]);
        Ok(())
    }

    #[test]
    fn clear_keeps_generations_it_could_not_delete() -> Result<()> {
        let dir = TempDir::new()?;
        let store = GenerationalFileStore::new(dir.path(), 4, 1)?;
        for path in ["/0", "/1", "/2"] {
            write(&store, &key(path), b"x")?;
        }
        assert_eq!(store.sequences(), vec![1, 2]);

        let blocked = block_generation(dir.path(), 1)?;
        store.clear();
        assert_eq!(store.sequences(), vec![1, 2]);
        assert_eq!(store.active_sequence(), 2);
        assert_eq!(fs::read_dir(dir.path().join("2"))?.count(), 0);

        fs::remove_file(&blocked)?;
        store.clear();
        assert_eq!(store.sequences(), vec![1]);
        assert_eq!(dir_names(dir.path())?, vec![1]);
        Ok(())
    }

    #[test]
    fn promotion_removes_older_duplicates() -> Result<()> {
        let dir = TempDir::new()?;
        let store = GenerationalFileStore::new(dir.path(), 5, 1)?;
        write(&store, &key("/x"), b"x")?;
        write(&store, &key("/y"), b"y")?;
        write(&store, &key("/z"), b"z")?;
        assert_eq!(store.active_sequence(), 2);

        let target = key("/k");
        let stale = dir.path().join("1").join(target.file_name());
        let newer = dir.path().join("2").join(target.file_name());
        fs::write(&stale, b"older")?;
        fs::write(&newer, b"newer")?;
        write(&store, &key("/w"), b"w")?;

        let promoted = store
            .resolve_path_for_read(&target)
            .expect("payload should be found");
        assert!(promoted.starts_with(dir.path().join("3")));
        assert_eq!(fs::read(&promoted)?, b"newer");
        assert!(!stale.exists());
        assert!(!newer.exists());
        Ok(())
    }
}

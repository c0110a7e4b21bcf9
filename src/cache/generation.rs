use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{trace, warn};

pub(crate) const TEMP_FILE_PREFIX: &str = "tmp_";

/// One numbered directory of payload files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    sequence: u64,
    dir: PathBuf,
    file_count: usize,
}

impl Generation {
    /// Opens `<base>/<sequence>`, creating it if needed, and counts the payload
    /// files already inside. Leftover temp files from interrupted writes are
    /// removed.
    pub(crate) fn open(base_dir: &Path, sequence: u64) -> Result<Self> {
        let dir = base_dir.join(sequence.to_string());
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create generation dir {}", dir.display()))?;

        let mut file_count = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if is_temp_file(&entry.path()) {
                trace!(path = %entry.path().display(), "removing stale temp file");
                fs::remove_file(entry.path()).ok();
                continue;
            }
            file_count += 1;
        }

        Ok(Self {
            sequence,
            dir,
            file_count,
        })
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_count(&self) -> usize {
        self.file_count
    }

    pub(crate) fn file_path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    pub(crate) fn holds(&self, file_name: &str) -> bool {
        self.file_path(file_name).is_file()
    }

    pub(crate) fn note_added(&mut self) {
        self.file_count += 1;
    }

    pub(crate) fn note_removed(&mut self) {
        self.file_count = self.file_count.saturating_sub(1);
    }

    /// Deletes every file and then the directory itself. Returns the paths
    /// that could not be removed; the directory stays in place when any did.
    pub(crate) fn delete(&self) -> Vec<PathBuf> {
        let mut undeletable = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return undeletable,
            Err(err) => {
                warn!(error = %err, path = %self.dir.display(), "failed to list generation dir");
                undeletable.push(self.dir.clone());
                return undeletable;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let removed = match entry.file_type() {
                Ok(ft) if ft.is_dir() => fs::remove_dir_all(&path),
                _ => fs::remove_file(&path),
            };
            match removed {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "failed to delete cached file");
                    undeletable.push(path);
                }
            }
        }

        if undeletable.is_empty()
            && let Err(err) = fs::remove_dir(&self.dir)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(error = %err, path = %self.dir.display(), "failed to remove generation dir");
            undeletable.push(self.dir.clone());
        }
        undeletable
    }
}

pub(crate) fn parse_sequence(name: &str) -> Option<u64> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok().filter(|seq| *seq > 0)
}

pub(crate) fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|name| name.starts_with(TEMP_FILE_PREFIX))
        .unwrap_or(false)
}

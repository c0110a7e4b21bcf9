use std::path::{Path, PathBuf};

use anyhow::Result;
use tempfile::TempDir;

pub struct TestDirs {
    _temp: TempDir,
    pub cache_dir: PathBuf,
    pub input_dir: PathBuf,
}

impl TestDirs {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let workspace = temp.path();
        let cache_dir = workspace.join("http_cache");
        let input_dir = workspace.join("input");
        std::fs::create_dir_all(&input_dir)?;

        Ok(Self {
            _temp: temp,
            cache_dir,
            input_dir,
        })
    }

    pub fn generation_dir(&self, sequence: u64) -> PathBuf {
        self.cache_dir.join(sequence.to_string())
    }

    /// Writes `body` to a file under the input dir and returns its path.
    pub fn input_file(&self, name: &str, body: &[u8]) -> Result<PathBuf> {
        let path = self.input_dir.join(name);
        std::fs::write(&path, body)?;
        Ok(path)
    }
}

/// Numbered generation dirs currently present under `base`, ascending.
pub fn generation_dirs(base: &Path) -> Result<Vec<u64>> {
    let mut sequences = Vec::new();
    for entry in std::fs::read_dir(base)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Ok(sequence) = entry.file_name().to_string_lossy().parse::<u64>() {
            sequences.push(sequence);
        }
    }
    sequences.sort_unstable();
    Ok(sequences)
}

/// Payload files across every generation under `base`.
pub fn payload_file_count(base: &Path) -> Result<usize> {
    let mut count = 0;
    for sequence in generation_dirs(base)? {
        count += std::fs::read_dir(base.join(sequence.to_string()))?.count();
    }
    Ok(count)
}

//! Versioned on-disk record of the index.
//!
//! The snapshot is a JSON document listing every entry least recently used
//! first, so replaying it in order restores recency. Files are written next to
//! their destination under a temporary name and renamed into place.

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::entry::{headermap_to_vec, to_headermap};
use super::{BodyRef, CacheEntry, CacheKey, ResponseMeta};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot is not valid: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub version: u32,
    pub entries: Vec<SnapshotRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub key: CacheKey,
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub captured_at_ms: u64,
    /// Generation that held the body when the snapshot was taken. Bodies are
    /// re-located by file name on load, so this is informational.
    #[serde(default)]
    pub generation: Option<u64>,
    pub file_name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    pub content_length: u64,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

impl SnapshotFile {
    pub fn new(entries: Vec<SnapshotRecord>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            entries,
        }
    }
}

impl SnapshotRecord {
    pub(crate) fn from_entry(key: &CacheKey, entry: &CacheEntry, generation: Option<u64>) -> Self {
        Self {
            key: key.clone(),
            status: entry.meta.status.as_u16(),
            headers: headermap_to_vec(&entry.meta.headers),
            captured_at_ms: entry.meta.captured_at_millis(),
            generation,
            file_name: entry.body.file_name.clone(),
            content_type: entry.body.content_type.clone(),
            content_length: entry.body.content_length,
        }
    }

    /// Rebuilds the index entry. Records whose status is invalid or whose file
    /// name does not belong to their key are rejected.
    pub(crate) fn into_entry(self, id: u64) -> Option<(CacheKey, CacheEntry)> {
        let status = StatusCode::from_u16(self.status).ok()?;
        if self.file_name != self.key.file_name() {
            return None;
        }
        let meta = ResponseMeta {
            status,
            headers: to_headermap(&self.headers),
            captured_at: ResponseMeta::captured_at_from_millis(self.captured_at_ms),
        };
        let body = BodyRef {
            file_name: self.file_name,
            content_type: self.content_type,
            content_length: self.content_length,
        };
        Some((self.key, CacheEntry { id, meta, body }))
    }
}

pub fn decode(bytes: &[u8]) -> Result<SnapshotFile, SnapshotError> {
    let probe: VersionProbe = serde_json::from_slice(bytes)?;
    if probe.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(probe.version));
    }
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode(snapshot: &SnapshotFile) -> Result<Vec<u8>, SnapshotError> {
    Ok(serde_json::to_vec(snapshot)?)
}

/// Reads the snapshot at `path`; `Ok(None)` when there is none.
pub fn read(path: &Path) -> Result<Option<SnapshotFile>, SnapshotError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    decode(&bytes).map(Some)
}

/// Replaces the snapshot at `path` atomically.
pub fn write_atomic(path: &Path, snapshot: &SnapshotFile) -> Result<(), SnapshotError> {
    let data = encode(snapshot)?;
    let temp_path = temp_path_for(path);
    let result = write_file(&temp_path, &data).and_then(|()| fs::rename(&temp_path, path));
    if let Err(err) = result {
        fs::remove_file(&temp_path).ok();
        return Err(err.into());
    }
    Ok(())
}

fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.create(true).truncate(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_name = format!(".{name}.tmp-{}", uuid::Uuid::new_v4());
    match path.parent() {
        Some(parent) => parent.join(temp_name),
        None => PathBuf::from(temp_name),
    }
}

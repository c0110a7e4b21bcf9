use std::time::{Duration, SystemTime};

use http::{HeaderMap, StatusCode};

/// Response metadata shared by every storage backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMeta {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub captured_at: SystemTime,
}

impl ResponseMeta {
    pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            status,
            headers,
            captured_at: SystemTime::now(),
        }
    }

    pub(crate) fn captured_at_millis(&self) -> u64 {
        self.captured_at
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    pub(crate) fn captured_at_from_millis(millis: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_millis(millis)
    }
}

/// Where an entry's body lives. Holds the derived file name rather than a
/// path, since the file moves between generations independently of the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyRef {
    pub file_name: String,
    pub content_type: Option<String>,
    pub content_length: u64,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub(crate) id: u64,
    pub meta: ResponseMeta,
    pub body: BodyRef,
}

pub(crate) fn to_headermap(items: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in items {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name.as_str()),
            http::HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}

pub(crate) fn headermap_to_vec(map: &HeaderMap) -> Vec<(String, String)> {
    let mut items = Vec::new();
    for (name, value) in map.iter() {
        if let Ok(value_str) = value.to_str() {
            items.push((name.as_str().to_string(), value_str.to_string()));
        }
    }
    items
}

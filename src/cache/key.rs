use std::fmt;

use http::{HeaderMap, HeaderName, Method, Uri};
use serde::{Deserialize, Serialize};

pub(crate) const MAX_VARIANT_HEADERS: usize = 8;
pub(crate) const MAX_VARIANT_BYTES: usize = 8 * 1024;

/// Identity of one cached variant of a resource.
///
/// Two requests map to the same key when they share method and URI and agree
/// on every header value the stored response varies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    method: String,
    uri: String,
    #[serde(default)]
    variant: Vec<(String, String)>,
}

impl CacheKey {
    pub fn new(method: &Method, uri: &Uri) -> Self {
        Self {
            method: method.as_str().to_string(),
            uri: uri.to_string(),
            variant: Vec::new(),
        }
    }

    /// Adds a header value to the key's variant. Names are lowercased and kept
    /// sorted so the order headers were named in does not matter.
    pub fn with_variant(mut self, name: &str, value: &str) -> Self {
        let name = name.trim().to_ascii_lowercase();
        match self.variant.binary_search_by(|(existing, _)| existing.cmp(&name)) {
            Ok(pos) => self.variant[pos].1 = value.to_string(),
            Err(pos) => self.variant.insert(pos, (name, value.to_string())),
        }
        self
    }

    /// Builds the key for `method`/`uri`, selecting the request header values
    /// named by `vary`. Returns `None` when the variant cannot be represented:
    /// `Vary: *`, a named header missing from the request, or limits exceeded.
    pub fn for_request(
        method: &Method,
        uri: &Uri,
        req_headers: &HeaderMap,
        vary: &[HeaderName],
    ) -> Option<Self> {
        let mut key = Self::new(method, uri);
        let mut variant_bytes = 0usize;
        for name in vary {
            if name.as_str() == "*" {
                return None;
            }
            let value = req_headers.get(name)?.to_str().ok()?;
            if key.variant.len() + 1 > MAX_VARIANT_HEADERS {
                return None;
            }
            variant_bytes = variant_bytes.saturating_add(name.as_str().len() + value.len());
            if variant_bytes > MAX_VARIANT_BYTES {
                return None;
            }
            key = key.with_variant(name.as_str(), value);
        }
        Some(key)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn variant(&self) -> &[(String, String)] {
        &self.variant
    }

    /// Deterministic on-disk file name for this key.
    ///
    /// Every field is hashed with a length prefix; the `Display` form is not
    /// used because header values may contain its separators.
    pub fn file_name(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hash_field(&mut hasher, self.method.as_bytes());
        hash_field(&mut hasher, self.uri.as_bytes());
        for (name, value) in &self.variant {
            hash_field(&mut hasher, name.as_bytes());
            hash_field(&mut hasher, value.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

fn hash_field(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.method, self.uri)?;
        for (name, value) in &self.variant {
            write!(f, "|{name}={value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(path: &str) -> Uri {
        Uri::builder()
            .scheme("http")
            .authority("example.com")
            .path_and_query(path)
            .build()
            .expect("build test uri")
    }

    #[test]
    fn file_name_is_stable_hex() {
        let key = CacheKey::new(&Method::GET, &uri("/a"));
        let name = key.file_name();
        assert_eq!(name.len(), 64);
        assert!(name.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(name, CacheKey::new(&Method::GET, &uri("/a")).file_name());
    }

    #[test]
    fn method_and_variant_change_identity() {
        let get = CacheKey::new(&Method::GET, &uri("/a"));
        let head = CacheKey::new(&Method::HEAD, &uri("/a"));
        let mobile = get.clone().with_variant("User-Agent", "mobile");
        assert_ne!(get, head);
        assert_ne!(get, mobile);
        assert_ne!(get.file_name(), mobile.file_name());
    }

    #[test]
    fn variant_order_does_not_matter() {
        let base = CacheKey::new(&Method::GET, &uri("/a"));
        let a = base
            .clone()
            .with_variant("accept", "text/html")
            .with_variant("Accept-Language", "fi");
        let b = base
            .with_variant("accept-language", "fi")
            .with_variant("Accept", "text/html");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET::http://example.com/a|accept=text/html|accept-language=fi");
    }

    #[test]
    fn separators_inside_values_do_not_merge_variants() {
        let base = CacheKey::new(&Method::GET, &uri("/page"));
        let packed = base.clone().with_variant("a", "1|b=2");
        let split = base.with_variant("a", "1").with_variant("b", "2");
        assert_eq!(packed.to_string(), split.to_string());
        assert_ne!(packed, split);
        assert_ne!(packed.file_name(), split.file_name());
    }

    #[test]
    fn for_request_rejects_unrepresentable_variants() {
        let mut req = HeaderMap::new();
        req.insert("user-agent", "mobile".parse().unwrap());

        let ua = HeaderName::from_static("user-agent");
        let lang = HeaderName::from_static("accept-language");
        let star = HeaderName::from_static("*");

        let key = CacheKey::for_request(&Method::GET, &uri("/v"), &req, &[ua.clone()])
            .expect("variant key");
        assert_eq!(key.variant(), &[("user-agent".to_string(), "mobile".to_string())]);

        assert!(CacheKey::for_request(&Method::GET, &uri("/v"), &req, &[lang]).is_none());
        assert!(CacheKey::for_request(&Method::GET, &uri("/v"), &req, &[star]).is_none());

        let mut too_many = HeaderMap::new();
        let mut names = Vec::new();
        for name in ["a", "b", "c", "d", "e", "f", "g", "h", "i"] {
            too_many.insert(name, "v".parse().unwrap());
            names.push(HeaderName::from_static(name));
        }
        assert!(CacheKey::for_request(&Method::GET, &uri("/v"), &too_many, &names).is_none());

        let mut large = HeaderMap::new();
        large.insert("user-agent", "x".repeat(MAX_VARIANT_BYTES + 1).parse().unwrap());
        assert!(CacheKey::for_request(&Method::GET, &uri("/v"), &large, &[ua]).is_none());
    }
}

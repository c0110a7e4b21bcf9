//! Read-through access: consult a storage first and fall back to a
//! [`Resolver`] on a miss, storing what it returns.

use anyhow::Result;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, VARY};
use http::{Request, Response};
use tracing::debug;

use crate::cache::{BytesPayload, CacheKey, CacheStorage, CachedResponse, ResponseMeta};

/// Produces a response for a request the cache could not answer.
pub trait Resolver {
    fn resolve(&self, request: &Request<()>) -> Result<Response<Bytes>>;
}

impl<F> Resolver for F
where
    F: Fn(&Request<()>) -> Result<Response<Bytes>>,
{
    fn resolve(&self, request: &Request<()>) -> Result<Response<Bytes>> {
        self(request)
    }
}

#[derive(Debug)]
pub enum FetchOutcome {
    /// Served from storage without calling the resolver.
    Hit(CachedResponse),
    /// Fetched and stored.
    Stored(CachedResponse),
    /// Fetched but not storable (unrepresentable variant or `Vary: *`), or the
    /// store failed.
    Uncached(Response<Bytes>),
}

impl FetchOutcome {
    pub fn is_hit(&self) -> bool {
        matches!(self, FetchOutcome::Hit(_))
    }
}

/// Looks `request` up in `storage` under the variant selected by
/// `variant_headers`; on a miss fetches it with `resolver` and stores it.
pub fn fetch_through(
    storage: &dyn CacheStorage,
    request: &Request<()>,
    variant_headers: &[HeaderName],
    resolver: &dyn Resolver,
) -> Result<FetchOutcome> {
    let key = CacheKey::for_request(
        request.method(),
        request.uri(),
        request.headers(),
        variant_headers,
    );
    let Some(key) = key else {
        debug!(uri = %request.uri(), "request variant not cacheable; bypassing storage");
        return resolver.resolve(request).map(FetchOutcome::Uncached);
    };

    if let Some(cached) = storage.get(&key) {
        return Ok(FetchOutcome::Hit(cached));
    }

    let response = resolver.resolve(request)?;
    if varies_on_everything(&response) {
        debug!(key = %key, "response varies on every header; not storing");
        return Ok(FetchOutcome::Uncached(response));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let meta = ResponseMeta::new(response.status(), response.headers().clone());
    let mut payload = BytesPayload::new(response.body().clone(), content_type.as_deref());
    match storage.put(key, meta, &mut payload) {
        Some(stored) => Ok(FetchOutcome::Stored(stored)),
        None => Ok(FetchOutcome::Uncached(response)),
    }
}

fn varies_on_everything(response: &Response<Bytes>) -> bool {
    response
        .headers()
        .get_all(VARY)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|name| name.trim() == "*")
}

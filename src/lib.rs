pub mod cache;
pub mod cli;
pub mod logging;
pub mod metrics;
pub mod resolver;
pub mod settings;

use std::io::Write;

use anyhow::{Context, Result, bail};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use tracing::info;

use crate::cache::{CacheKey, FilePayload, PersistentCacheStorage, ResponseMeta};
use crate::cli::Command;
use crate::settings::Settings;

/// Opens the storage described by `settings`, runs `command` against it and
/// saves a final snapshot, whether or not the command succeeded.
pub fn run(settings: Settings, command: Command) -> Result<()> {
    let config = settings.storage_config()?;
    let storage =
        PersistentCacheStorage::open_with_policy(config, Box::new(settings.flush_policy()))?;
    let stdout = std::io::stdout();
    let result = execute(&storage, command, &mut stdout.lock());
    storage.shutdown();
    result
}

pub fn execute(storage: &PersistentCacheStorage, command: Command, out: &mut dyn Write) -> Result<()> {
    match command {
        Command::Stats => {
            let stats = storage.stats();
            writeln!(out, "entries: {}", stats.entries)?;
            writeln!(out, "capacity: {}", stats.capacity)?;
            writeln!(out, "active generation: {}", stats.active_generation)?;
            let generations = stats
                .generations
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(out, "generations: {generations}")?;
        }
        Command::Get {
            uri,
            method,
            output,
        } => {
            let key = parse_key(&method, &uri)?;
            let Some(cached) = storage.get(&key) else {
                bail!("no cached response for {key}");
            };
            writeln!(out, "status: {}", cached.status.as_u16())?;
            for (name, value) in cached.headers.iter() {
                writeln!(out, "{}: {}", name, value.to_str().unwrap_or("<binary>"))?;
            }
            writeln!(out, "content-length: {}", cached.content_length)?;
            if let Some(path) = cached.body_path() {
                writeln!(out, "body: {}", path.display())?;
            }
            if let Some(output) = output {
                let body = cached
                    .read_body()
                    .with_context(|| format!("failed to read cached body for {key}"))?;
                std::fs::write(&output, &body)
                    .with_context(|| format!("failed to write {}", output.display()))?;
            }
        }
        Command::Put {
            uri,
            file,
            method,
            status,
            content_type,
            headers,
        } => {
            let key = parse_key(&method, &uri)?;
            let status = StatusCode::from_u16(status)
                .with_context(|| format!("invalid status code {status}"))?;
            let mut header_map = parse_headers(&headers)?;
            if let Some(content_type) = &content_type
                && !header_map.contains_key(http::header::CONTENT_TYPE)
            {
                let value = HeaderValue::from_str(content_type)
                    .with_context(|| format!("invalid content type {content_type:?}"))?;
                header_map.insert(http::header::CONTENT_TYPE, value);
            }
            ensure_readable(&file)?;
            let mut payload = FilePayload::new(&file, content_type.as_deref());
            let meta = ResponseMeta::new(status, header_map);
            let Some(stored) = storage.put(key.clone(), meta, &mut payload) else {
                bail!("failed to store {} as {key}", file.display());
            };
            info!(key = %key, bytes = stored.content_length, "stored response");
            writeln!(out, "stored {} bytes for {key}", stored.content_length)?;
        }
        Command::Remove { uri, method } => {
            let key = parse_key(&method, &uri)?;
            storage.remove(&key);
            writeln!(out, "removed {key}")?;
        }
        Command::Clear => {
            storage.clear();
            writeln!(out, "cache cleared")?;
        }
        Command::Metrics => {
            out.write_all(crate::metrics::render()?.as_bytes())?;
        }
    }
    Ok(())
}

fn parse_key(method: &str, uri: &str) -> Result<CacheKey> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid method {method:?}"))?;
    let uri: Uri = uri.parse().with_context(|| format!("invalid uri {uri:?}"))?;
    Ok(CacheKey::new(&method, &uri))
}

fn parse_headers(raw: &[String]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for item in raw {
        let Some((name, value)) = item.split_once(':') else {
            bail!("header {item:?} must be NAME:VALUE");
        };
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .with_context(|| format!("invalid header name in {item:?}"))?;
        let value = HeaderValue::from_str(value.trim())
            .with_context(|| format!("invalid header value in {item:?}"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn ensure_readable(path: &std::path::Path) -> Result<()> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if !metadata.is_file() {
        bail!("{} is not a regular file", path.display());
    }
    Ok(())
}

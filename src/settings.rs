use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cache::flush::{DEFAULT_FLUSH_AFTER_MUTATIONS, DEFAULT_FLUSH_INTERVAL};
use crate::cache::{
    DEFAULT_CAPACITY, DEFAULT_GENERATION_SIZE, DEFAULT_GENERATIONS, DEFAULT_SNAPSHOT_NAME,
    DefaultFlushPolicy, StorageConfig,
};
use crate::cli::{Cli, LogFormat};

const DEFAULT_CONFIG_FILE: &str = "httpcache.toml";

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_generations() -> usize {
    DEFAULT_GENERATIONS
}

fn default_generation_size() -> usize {
    DEFAULT_GENERATION_SIZE
}

fn default_snapshot_name() -> String {
    DEFAULT_SNAPSHOT_NAME.to_string()
}

fn default_flush_after_mutations() -> u64 {
    DEFAULT_FLUSH_AFTER_MUTATIONS
}

fn default_flush_interval() -> u64 {
    DEFAULT_FLUSH_INTERVAL.as_secs()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_generations")]
    pub generations: usize,
    #[serde(default = "default_generation_size")]
    pub generation_size: usize,
    #[serde(default = "default_snapshot_name")]
    pub snapshot_name: String,
    #[serde(default = "default_flush_after_mutations")]
    pub flush_after_mutations: u64,
    /// Seconds between snapshot flushes while mutations keep arriving.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
}

impl Settings {
    /// Layers the configuration file, `HTTPCACHE__*` environment variables and
    /// command line overrides, in that order.
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = resolve_config_path(cli)?;
        let mut builder = Config::builder();
        if let Some(path) = &config_path {
            builder = builder.add_source(File::from(path.clone()).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("HTTPCACHE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        if let Some(path) = &config_path {
            settings.apply_base_dir(path);
        }
        settings.apply_cli(cli);
        settings.validate()?;
        Ok(settings)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval)
    }

    pub fn flush_policy(&self) -> DefaultFlushPolicy {
        DefaultFlushPolicy::new(self.flush_after_mutations, self.flush_interval())
    }

    pub fn storage_config(&self) -> Result<StorageConfig> {
        let cache_dir = self
            .cache_dir
            .clone()
            .context("cache_dir is not configured")?;
        Ok(StorageConfig::new(cache_dir)
            .capacity(self.capacity)
            .generations(self.generations)
            .generation_size(self.generation_size)
            .snapshot_name(self.snapshot_name.clone()))
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if let Some(cache_dir) = self.cache_dir.clone() {
            self.cache_dir = Some(absolutize(&cache_dir, base_dir));
        }
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(cache_dir) = &cli.cache_dir {
            self.cache_dir = Some(cache_dir.clone());
        }
        if let Some(log) = cli.log {
            self.log = log;
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.cache_dir.is_some(),
            "cache_dir must be set in the configuration, as HTTPCACHE__CACHE_DIR or with --cache-dir"
        );
        ensure!(
            self.capacity > 0,
            "capacity must be greater than 0 (got {})",
            self.capacity
        );
        ensure!(
            self.generations > 0,
            "generations must be greater than 0 (got {})",
            self.generations
        );
        ensure!(
            self.generation_size > 0,
            "generation_size must be greater than 0 (got {})",
            self.generation_size
        );
        ensure!(
            !self.snapshot_name.trim().is_empty(),
            "snapshot_name must not be empty"
        );
        ensure!(
            self.flush_after_mutations > 0,
            "flush_after_mutations must be greater than 0 (got {})",
            self.flush_after_mutations
        );
        ensure!(
            self.flush_interval > 0,
            "flush_interval must be greater than 0 seconds (got {})",
            self.flush_interval
        );
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Result<Option<PathBuf>> {
    if let Some(path) = &cli.config {
        if !path.exists() {
            bail!("configuration file {} does not exist", path.display());
        }
        return Ok(Some(path.clone()));
    }
    let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);
    Ok(candidate.exists().then_some(candidate))
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(name = "httpcache", about = "Inspect and maintain a persistent HTTP response cache")]
pub struct Cli {
    /// Path to the configuration file (defaults to ./httpcache.toml if present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Cache directory; overrides `cache_dir` from the configuration.
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Log output format; overrides `log` from the configuration.
    #[arg(long, global = true, value_enum)]
    pub log: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Show entry count, capacity and generation layout.
    Stats,
    /// Look up a cached response and print its metadata.
    Get {
        uri: String,
        #[arg(long, default_value = "GET")]
        method: String,
        /// Copy the cached body to this file.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Store a file as the cached response for a URI.
    Put {
        uri: String,
        file: PathBuf,
        #[arg(long, default_value = "GET")]
        method: String,
        #[arg(long, default_value_t = 200)]
        status: u16,
        #[arg(long)]
        content_type: Option<String>,
        /// Response header as NAME:VALUE; may be repeated.
        #[arg(long = "header", value_name = "NAME:VALUE")]
        headers: Vec<String>,
    },
    /// Drop the cached response for a URI.
    Remove {
        uri: String,
        #[arg(long, default_value = "GET")]
        method: String,
    },
    /// Drop every cached response and all payload files.
    Clear,
    /// Print cache metrics in the Prometheus text format.
    Metrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

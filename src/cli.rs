use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "pixcache",
    about = "Read-through disk cache proxy for a status-code image origin"
)]
pub struct Cli {
    /// Address of the server.
    #[arg(short = 'H', long)]
    pub host: String,

    /// Port of the server.
    #[arg(short, long)]
    pub port: u16,

    /// Path to the cache directory (must already exist).
    #[arg(short, long)]
    pub cache: PathBuf,

    /// Base URL of the image origin.
    #[arg(long, default_value = "https://http.cat")]
    pub origin: String,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text")]
    pub log: LogFormat,

    /// Deadline, in seconds, for each client-side read or write.
    #[arg(long)]
    pub client_timeout: Option<u64>,

    /// Overall budget, in seconds, for one origin fetch.
    #[arg(long)]
    pub origin_timeout: Option<u64>,

    /// Upper bound, in bytes, on a client PUT body and on an origin response body.
    #[arg(long)]
    pub max_body_size: Option<usize>,

    /// Address to expose Prometheus metrics on (disabled when absent).
    #[arg(long)]
    pub metrics_listen: Option<std::net::SocketAddr>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, ensure};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};
use crate::origin::OriginEndpoint;

fn default_client_timeout() -> u64 {
    30
}

fn default_origin_connect_timeout() -> u64 {
    5
}

fn default_origin_timeout() -> u64 {
    10
}

fn default_max_header_size() -> usize {
    16 * 1024
}

fn default_max_body_size() -> usize {
    16 * 1024 * 1024
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub cache_dir: PathBuf,
    pub origin: String,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    /// Deadline, in seconds, for each client-side read or write.
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_origin_connect_timeout")]
    pub origin_connect_timeout: u64,
    /// Overall budget, in seconds, for one origin fetch.
    #[serde(default = "default_origin_timeout")]
    pub origin_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    /// Upper bound on a client PUT body and on an origin response body.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default)]
    pub metrics_listen: Option<std::net::SocketAddr>,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let settings = Self {
            host: cli.host.clone(),
            port: cli.port,
            cache_dir: cli.cache.clone(),
            origin: cli.origin.clone(),
            log: cli.log,
            client_timeout: cli.client_timeout.unwrap_or_else(default_client_timeout),
            origin_connect_timeout: default_origin_connect_timeout(),
            origin_timeout: cli.origin_timeout.unwrap_or_else(default_origin_timeout),
            max_header_size: default_max_header_size(),
            max_body_size: cli.max_body_size.unwrap_or_else(default_max_body_size),
            metrics_listen: cli.metrics_listen,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.host.is_empty(), "host must not be empty");
        ensure!(
            self.cache_dir.is_dir(),
            "cache directory \"{}\" does not exist",
            self.cache_dir.display()
        );
        OriginEndpoint::parse(&self.origin)?;
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.origin_connect_timeout > 0,
            "origin_connect_timeout must be greater than 0 seconds (got {})",
            self.origin_connect_timeout
        );
        ensure!(
            self.origin_timeout > 0,
            "origin_timeout must be greater than 0 seconds (got {})",
            self.origin_timeout
        );
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.max_body_size > 0,
            "max_body_size must be greater than 0 (got {})",
            self.max_body_size
        );
        Ok(())
    }

    pub fn origin_endpoint(&self) -> Result<OriginEndpoint> {
        OriginEndpoint::parse(&self.origin)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn origin_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_connect_timeout)
    }

    pub fn origin_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn base_settings(cache_dir: PathBuf) -> Settings {
        Settings {
            host: "127.0.0.1".to_string(),
            port: 0,
            cache_dir,
            origin: "https://http.cat".to_string(),
            log: LogFormat::Text,
            client_timeout: 30,
            origin_connect_timeout: 5,
            origin_timeout: 10,
            max_header_size: 16 * 1024,
            max_body_size: 16 * 1024 * 1024,
            metrics_listen: None,
        }
    }

    #[test]
    fn validation_accepts_existing_cache_dir() {
        let dir = TempDir::new().unwrap();
        let settings = base_settings(dir.path().to_path_buf());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn validation_rejects_missing_cache_dir() {
        let dir = TempDir::new().unwrap();
        let settings = base_settings(dir.path().join("missing"));
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn validation_rejects_bad_origin_url() {
        let dir = TempDir::new().unwrap();
        let mut settings = base_settings(dir.path().to_path_buf());
        settings.origin = "ftp://http.cat".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_timeouts() {
        let dir = TempDir::new().unwrap();
        let mut settings = base_settings(dir.path().to_path_buf());
        settings.origin_timeout = 0;
        assert!(settings.validate().is_err());
    }
}

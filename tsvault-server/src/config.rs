//! Server configuration loaded from the environment

use anyhow::{bail, Context as _};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tsvault_core::StorageConfig;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9090";
const DEFAULT_STORAGE_PATH: &str = "./data";
const DEFAULT_RETENTION_DAYS: u64 = 30;
const SECONDS_PER_DAY: u64 = 24 * 3600;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address
    pub listen_addr: SocketAddr,
    /// Storage stack settings
    pub storage: StorageConfig,
    /// Deadline applied to every storage call made for a request
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            storage: StorageConfig {
                retention: Duration::from_secs(DEFAULT_RETENTION_DAYS * SECONDS_PER_DAY),
                ..StorageConfig::with_path(DEFAULT_STORAGE_PATH)
            },
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Read configuration from process environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup; unset keys keep defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        let addr = lookup("LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        config.listen_addr = parse_listen_addr(&addr)?;

        if let Some(path) = lookup("STORAGE_PATH") {
            config.storage.path = PathBuf::from(path);
        }
        if let Some(days) = parse_var::<u64>(&lookup, "RETENTION_DAYS")? {
            let secs = days
                .checked_mul(SECONDS_PER_DAY)
                .with_context(|| format!("RETENTION_DAYS out of range: {}", days))?;
            config.storage.retention = Duration::from_secs(secs);
        }
        if let Some(level) = parse_var::<i32>(&lookup, "COMPRESSION_LEVEL")? {
            config.storage.compression_level = level;
        }
        if let Some(value) = lookup("ENABLE_WAL") {
            config.storage.enable_wal = parse_bool(&value)
                .with_context(|| format!("invalid ENABLE_WAL: {:?}", value))?;
        }
        if let Some(size) = parse_var::<usize>(&lookup, "BATCH_SIZE")? {
            config.storage.batch_size = size;
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, "CACHE_CAPACITY")? {
            config.storage.cache_capacity = capacity;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CACHE_TTL_SECS")? {
            config.storage.cache_ttl = Duration::from_secs(secs);
        }

        config.storage.validate()?;
        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid {}: {:?}", key, raw)),
        None => Ok(None),
    }
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => bail!("expected true, false, 1 or 0, got {:?}", other),
    }
}

/// Accepts `host:port` or the bare `:port` form, which binds all interfaces
fn parse_listen_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    full.parse()
        .with_context(|| format!("invalid LISTEN_ADDR: {:?}", addr))
}

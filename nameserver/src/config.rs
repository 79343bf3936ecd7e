use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{NamespaceError, NsResult};

pub const DEFAULT_STORAGE_UNIT: u64 = 512;
pub const DEFAULT_MIN_FREE_BYTES: u64 = 64 * 1024 * 1024;

/// Name server settings. Every field can be overridden with a `JUNKNAS_*`
/// environment variable, see [`NameServerConfig::from_env`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct NameServerConfig {
    /// Holds the image, its checksum and the edit log segments.
    pub image_dir: PathBuf,
    pub listen_addr: SocketAddr,
    /// Block sizes must be a multiple of this.
    pub storage_unit_size: u64,
    /// Servers with less free space get no new replicas.
    pub min_free_bytes: u64,
    /// Allow the first replica on the writer's own server.
    pub use_local_replica: bool,
    /// fsync every edit record before acknowledging it.
    pub sync_edits: bool,
    pub log_level: String,
}

impl Default for NameServerConfig {
    fn default() -> Self {
        let image_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".junknas")
            .join("nameserver");

        NameServerConfig {
            image_dir,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            storage_unit_size: DEFAULT_STORAGE_UNIT,
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
            use_local_replica: true,
            sync_edits: true,
            log_level: "info".to_string(),
        }
    }
}

impl NameServerConfig {
    /// Defaults overlaid with any `JUNKNAS_*` variables that are set.
    pub fn from_env() -> NsResult<Self> {
        let mut cfg = NameServerConfig::default();

        if let Ok(dir) = env::var("JUNKNAS_IMAGE_DIR") {
            cfg.image_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_var("JUNKNAS_LISTEN_ADDR")? {
            cfg.listen_addr = v;
        }
        if let Some(v) = parse_var("JUNKNAS_STORAGE_UNIT")? {
            cfg.storage_unit_size = v;
        }
        if let Some(v) = parse_var("JUNKNAS_MIN_FREE_BYTES")? {
            cfg.min_free_bytes = v;
        }
        if let Some(v) = parse_var("JUNKNAS_USE_LOCAL_REPLICA")? {
            cfg.use_local_replica = v;
        }
        if let Some(v) = parse_var("JUNKNAS_SYNC_EDITS")? {
            cfg.sync_edits = v;
        }
        if let Ok(level) = env::var("JUNKNAS_LOG_LEVEL") {
            cfg.log_level = level;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> NsResult<()> {
        if self.storage_unit_size == 0 {
            return Err(NamespaceError::InvalidArgument(
                "storage unit size must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str) -> NsResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| NamespaceError::InvalidArgument(format!("{name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}

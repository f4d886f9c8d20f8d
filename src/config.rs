//! Process configuration, deserialized from a JSON config file.
//!
//! Mirrors the fields the core actually reads; options owned by
//! non-core subsystems (auth secrets, websocket, http preview) are kept
//! as opaque passthrough values so a shared config file round-trips
//! without the core needing to understand them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::VaultResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuseConfig {
    pub root_mount_path: String,
    #[serde(default)]
    pub allow_other: bool,
    #[serde(default = "default_entry_timeout_secs")]
    pub entry_timeout_secs: u64,
}

fn default_entry_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    pub name: String,
    pub user: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_db_port() -> u16 {
    5432
}

fn default_pool_size() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachingConfig {
    pub path: String,
    pub max_size_mb: u64,
    #[serde(default)]
    pub expiry_days: HashMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubsystemLogLevels {
    #[serde(flatten)]
    pub levels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub levels: SubsystemLogLevels,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub fuse: FuseConfig,
    pub database: DatabaseConfig,
    pub caching: CachingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub dev: DevConfig,
    /// Fields belonging to non-core subsystems (auth, websocket, http
    /// preview, sharing). The core never interprets these.
    #[serde(flatten)]
    pub passthrough: HashMap<String, Value>,
}

impl Config {
    pub fn load(path: &Path) -> VaultResult<Config> {
        let raw = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| crate::error::VaultError::InvalidArgument(e.to_string()))?;
        Ok(config)
    }

    pub fn backing_root(&self) -> &str {
        &self.caching.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_core_fields_and_ignores_unknown_ones() {
        let raw = r#"{
            "fuse": {"root_mount_path": "/mnt/vaulthalla"},
            "database": {"host": "localhost", "name": "vaulthalla", "user": "vaulthalla"},
            "caching": {"path": "/var/lib/vaulthalla/cache", "max_size_mb": 4096},
            "auth": {"jwt_secret": "shh"},
            "dev": {"enabled": true}
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.fuse.root_mount_path, "/mnt/vaulthalla");
        assert_eq!(config.fuse.entry_timeout_secs, 60);
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.database.pool_size, 10);
        assert!(config.dev.enabled);
        assert!(config.passthrough.contains_key("auth"));
    }
}

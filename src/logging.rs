//! Logging setup. Uses `RUST_LOG`-style filters as the substitute for a
//! per-subsystem level struct; subsystems log against stable target
//! strings so operators can filter with `env_logger`'s module syntax,
//! e.g. `RUST_LOG=vaulthalla::sync=debug`.

use crate::config::LoggingConfig;

pub const TARGET_FUSE: &str = "vaulthalla::fuse";
pub const TARGET_SYNC: &str = "vaulthalla::sync";
pub const TARGET_S3: &str = "vaulthalla::s3";
pub const TARGET_DB: &str = "vaulthalla::db";
pub const TARGET_CRYPTO: &str = "vaulthalla::crypto";
pub const TARGET_REGISTRY: &str = "vaulthalla::registry";

/// Builds the `RUST_LOG` filter string from the configured per-subsystem
/// levels, falling back to `info` for anything unlisted.
pub fn build_filter(logging: &LoggingConfig) -> String {
    if logging.levels.levels.is_empty() {
        return "info".to_string();
    }
    let mut parts: Vec<String> = logging
        .levels
        .levels
        .iter()
        .map(|(subsystem, level)| format!("vaulthalla::{}={}", subsystem, level))
        .collect();
    parts.sort();
    parts.join(",")
}

pub fn init(logging: &LoggingConfig) {
    let filter = build_filter(logging);
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_config_falls_back_to_info() {
        let cfg = LoggingConfig::default();
        assert_eq!(build_filter(&cfg), "info");
    }

    #[test]
    fn per_subsystem_levels_become_module_filters() {
        let mut levels = HashMap::new();
        levels.insert("sync".to_string(), "debug".to_string());
        levels.insert("fuse".to_string(), "warn".to_string());
        let cfg = LoggingConfig {
            levels: crate::config::SubsystemLogLevels { levels },
        };
        let filter = build_filter(&cfg);
        assert_eq!(filter, "vaulthalla::fuse=warn,vaulthalla::sync=debug");
    }
}

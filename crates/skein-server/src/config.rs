//! Configuration loading from TOML files

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::transport::TransportMode;

/// Global configuration for skeind
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub graph: GraphConfig,
    pub transport: TransportConfig,
    pub persist: PersistConfig,
    pub ids: IdsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub name: String,
    pub capacity: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            name: "skein-default".to_string(),
            capacity: 1 << 16,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub mode: TransportMode,
    pub ingest_port: u16,
    pub serve_port: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Tcp,
            ingest_port: 10102,
            serve_port: 10103,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Serialize the graph to the output directory during shutdown.
    pub on_shutdown: bool,
    /// Record detaching workers' result regions under the output directory.
    pub history: bool,
    pub output_dir: PathBuf,
    /// History records kept per worker (0 = unlimited).
    pub history_cap: usize,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            on_shutdown: false,
            history: false,
            output_dir: PathBuf::from("./skein-data"),
            history_cap: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(default)]
pub struct IdsConfig {
    /// Numeric vertex identifiers on the wire instead of names.
    pub numeric: bool,
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./skein.toml (current directory)
    /// 2. ~/.config/skein/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("skein.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "skein") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.graph.name, "skein-default");
        assert_eq!(config.graph.capacity, 1 << 16);
        assert_eq!(config.transport.mode, TransportMode::Tcp);
        assert_eq!(config.transport.ingest_port, 10102);
        assert_eq!(config.transport.serve_port, 10103);
        assert!(!config.persist.on_shutdown);
        assert!(!config.ids.numeric);
    }

    #[test]
    fn parse_config_toml() {
        let toml = r#"
[graph]
name = "g1"
capacity = 1024

[transport]
mode = "unix"
ingest_port = 20102
serve_port = 20103

[persist]
on_shutdown = true
output_dir = "/var/lib/skein"
history_cap = 3

[ids]
numeric = true
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.graph.name, "g1");
        assert_eq!(config.graph.capacity, 1024);
        assert_eq!(config.transport.mode, TransportMode::Unix);
        assert_eq!(config.transport.ingest_port, 20102);
        assert!(config.persist.on_shutdown);
        assert_eq!(config.persist.output_dir, PathBuf::from("/var/lib/skein"));
        assert_eq!(config.persist.history_cap, 3);
        assert!(config.ids.numeric);
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: Config = toml::from_str("[graph]\nname = \"g2\"\n").unwrap();
        assert_eq!(config.graph.name, "g2");
        assert_eq!(config.graph.capacity, 1 << 16);
        assert_eq!(config.transport.ingest_port, 10102);
    }
}

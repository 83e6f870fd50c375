//! Configuration Loader
//!
//! Finds the config file, applies environment overrides and validates the
//! result. The loader remembers where the config came from so it can be
//! reloaded later.

use crate::config::settings::GatewayConfig;
use crate::error::{RelayError, Result};
use std::path::{Path, PathBuf};

/// Environment variable pointing at a config file
pub const CONFIG_PATH_ENV: &str = "KEYRELAY_CONFIG";

/// Environment override for `server.caller_secret`
pub const CALLER_SECRET_ENV: &str = "KEYRELAY_CALLER_SECRET";

/// Environment override for `upstream.base_url`
pub const BASE_URL_ENV: &str = "KEYRELAY_BASE_URL";

/// Configuration loader with support for multiple sources
#[derive(Debug)]
pub struct ConfigLoader {
    config: GatewayConfig,
    source: Option<PathBuf>,
}

impl ConfigLoader {
    /// Load from the first config file found in the default locations,
    /// or from defaults + environment when none exists.
    pub fn new() -> Result<Self> {
        let source = Self::get_config_paths().into_iter().find(|p| p.exists());

        let config = match &source {
            Some(path) => Self::read_file(path)?,
            None => {
                tracing::warn!("no config file found, using defaults and environment");
                GatewayConfig::default()
            }
        };

        Self::finish(config, source)
    }

    /// Create a loader with a specific config file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = Self::read_file(&path)?;
        Self::finish(config, Some(path))
    }

    /// Build a loader around an in-memory config (still validated)
    pub fn from_config(config: GatewayConfig) -> Result<Self> {
        Self::finish(config, None)
    }

    fn finish(mut config: GatewayConfig, source: Option<PathBuf>) -> Result<Self> {
        Self::apply_env_overrides(&mut config);
        config.validate()?;

        if let Some(path) = &source {
            tracing::info!(path = %path.display(), groups = config.key_groups.len(), "configuration loaded");
        }

        Ok(Self { config, source })
    }

    /// Get list of config paths to check
    fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // 1. Environment variable
        if let Ok(custom_path) = std::env::var(CONFIG_PATH_ENV) {
            paths.push(PathBuf::from(custom_path));
        }

        // 2. Current directory
        paths.push(PathBuf::from("keyrelay.json"));

        // 3. User config directory
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("keyrelay").join("config.json"));
        }

        // 4. Home directory
        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".keyrelay").join("config.json"));
        }

        paths
    }

    fn read_file(path: &Path) -> Result<GatewayConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            RelayError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    fn apply_env_overrides(config: &mut GatewayConfig) {
        if let Ok(secret) = std::env::var(CALLER_SECRET_ENV) {
            if !secret.trim().is_empty() {
                config.server.caller_secret = secret;
            }
        }

        if let Ok(url) = std::env::var(BASE_URL_ENV) {
            if !url.trim().is_empty() {
                config.upstream.base_url = url;
            }
        }
    }

    /// Re-read the source file. On failure the previous config is kept.
    pub fn reload(&mut self) -> Result<&GatewayConfig> {
        let Some(path) = self.source.clone() else {
            return Err(RelayError::Config(
                "configuration was not loaded from a file, nothing to reload".to_string(),
            ));
        };

        let fresh = Self::from_path(&path)?;
        self.config = fresh.config;
        Ok(&self.config)
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Path the configuration was read from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(file: &mut NamedTempFile, port: u16) {
        file.as_file().set_len(0).unwrap();
        let mut handle = file.reopen().unwrap();
        writeln!(
            handle,
            r#"{{
                "server": {{ "port": {port}, "caller_secret": "test-secret" }},
                "upstream": {{ "base_url": "http://127.0.0.1:9/v1beta" }},
                "key_groups": [
                    {{ "name": "group1", "keys": ["AIzaSy-test-key-0001", "AIzaSy-test-key-0002"] }}
                ]
            }}"#
        )
        .unwrap();
    }

    #[test]
    fn test_load_from_custom_file() {
        let mut file = NamedTempFile::new().unwrap();
        write_config(&mut file, 6100);

        let loader = ConfigLoader::from_path(file.path()).unwrap();
        assert_eq!(loader.config().server.port, 6100);
        assert_eq!(loader.config().key_groups[0].keys.len(), 2);
        assert_eq!(loader.source(), Some(file.path()));
    }

    #[test]
    fn test_reload_picks_up_changes() {
        let mut file = NamedTempFile::new().unwrap();
        write_config(&mut file, 6100);
        let mut loader = ConfigLoader::from_path(file.path()).unwrap();

        write_config(&mut file, 6200);
        let reloaded = loader.reload().unwrap();
        assert_eq!(reloaded.server.port, 6200);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{ not json").unwrap();

        let err = ConfigLoader::from_path(file.path()).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_reload_without_source_fails() {
        let mut config = GatewayConfig::default();
        config.server.caller_secret = "test-secret".to_string();
        config.key_groups.push(crate::config::KeyGroupConfig {
            name: "group1".to_string(),
            keys: vec!["AIzaSy-test-key-0001".to_string()],
            keys_env: vec![],
        });

        let mut loader = ConfigLoader::from_config(config).unwrap();
        assert!(loader.reload().is_err());
    }
}

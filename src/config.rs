//! Application configuration persisted as TOML under the user's config
//! directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::mqtt::config::MqttConfig;
use crate::mqtt::types::QoS;

const CONFIG_DIR: &str = "mqttstreams";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("No config directory available on this platform")]
    NoConfigDir,
}

/// Topic the demo binary subscribes and publishes to.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DemoConfig {
    pub topic: String,
    pub qos: QoS,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            topic: "fooBar".to_string(),
            qos: QoS::AtLeastOnce,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub demo: DemoConfig,
}

impl AppConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// `<config dir>/mqttstreams/config.toml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        Ok(path)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(path, self.to_toml_string()?)
            .await
            .map_err(io_err)?;
        info!("Config written to {}", path.display());
        Ok(())
    }

    /// Writes the default config to `path` when no file exists there, then
    /// loads it.
    pub async fn ensure_default(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        if !exists {
            info!("No config at {}, creating default", path.display());
            Self::default().save(path).await?;
        }
        Self::load(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::Protocol;
    use crate::mqtt::registry::ResubscribePolicy;

    #[test]
    fn parses_partial_config_with_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [mqtt]
            host = "broker.hivemq.com"
            protocol = "ws"
            port = 8000
            path = "/mqtt"
            keepalive = 5
            resubscribe_policy = "replace"
            "#,
        )
        .unwrap();

        assert_eq!(config.mqtt.host, "broker.hivemq.com");
        assert_eq!(config.mqtt.protocol, Protocol::Ws);
        assert_eq!(config.mqtt.keepalive, 5);
        assert_eq!(config.mqtt.resubscribe_policy, ResubscribePolicy::Replace);
        assert!(!config.mqtt.manage_connection_manually);
        assert_eq!(config.demo, DemoConfig::default());
    }

    #[test]
    fn rejects_invalid_qos() {
        let result = AppConfig::from_toml_str("[demo]\nqos = 3\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[tokio::test]
    async fn ensure_default_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let config = AppConfig::ensure_default(&path).await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());

        let mut changed = config.clone();
        changed.mqtt.manage_connection_manually = true;
        changed.save(&path).await.unwrap();
        let reloaded = AppConfig::ensure_default(&path).await.unwrap();
        assert!(reloaded.mqtt.manage_connection_manually);
    }
}

// Конфигурация модуля звонков
// Логирование по умолчанию подробное только в режиме разработки

use crate::error::{Result, SessionError};
use crate::media::{DevicesConfig, MediaPreference};
use crate::peer::ice::{default_ice_servers, validate_ice_servers};
use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "debug";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Сколько ждём answer/кандидатов на свой offer
pub const OFFER_TIMEOUT: Duration = Duration::from_secs(5);

/// Топик шины, по которому ходит сигнализация
pub const SIGNALING_TOPIC: &str = "broadcast";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BroadcastConfig {
    pub offer_timeout_ms: u64,
    pub topic: String,
    pub ice_servers: Vec<ServerConfig>,
    pub local_media: MediaPreference,
    pub devices: DevicesConfig,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            offer_timeout_ms: OFFER_TIMEOUT.as_millis() as u64,
            topic: SIGNALING_TOPIC.to_string(),
            ice_servers: default_ice_servers(),
            local_media: MediaPreference::default(),
            devices: DevicesConfig::default(),
        }
    }
}

impl BroadcastConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: BroadcastConfig =
            serde_json::from_str(json).map_err(|e| SessionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.offer_timeout_ms == 0 {
            return Err(SessionError::Config("offer_timeout_ms must be positive".into()));
        }
        if self.topic.is_empty() {
            return Err(SessionError::Config("topic must not be empty".into()));
        }
        validate_ice_servers(&self.ice_servers)
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }
}

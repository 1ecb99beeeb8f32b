pub mod pipeline_config;
pub mod radio_config;
pub mod service_config;

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::config::pipeline_config::PipelineConfig;
use crate::config::radio_config::RadioConfig;
use crate::config::service_config::ServiceConfig;
use crate::utils::ensure_directory_exists;

const APP_DIR_NAME: &str = "glimpse-companion";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub radio: RadioConfig,
    pub services: ServiceConfig,
    pub pipeline: PipelineConfig,
}

/// Directory holding the config file and the saved peripheral identity.
pub fn app_config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or_else(|| anyhow!("No configuration directory available on this platform"))
}

impl AppConfig {
    /// Loads the config from the platform config directory.
    pub async fn load() -> Result<Self> {
        Self::load_from(&app_config_dir()?.join(CONFIG_FILE_NAME)).await
    }

    pub async fn load_from(file_path: &Path) -> Result<Self> {
        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Config loaded from {:?}", file_path);
        Ok(config)
    }

    /// Saves the current config to the platform config directory.
    pub async fn save(&self) -> Result<()> {
        self.save_to(&app_config_dir()?.join(CONFIG_FILE_NAME)).await
    }

    pub async fn save_to(&self, file_path: &Path) -> Result<()> {
        if let Some(dir) = file_path.parent() {
            ensure_directory_exists(dir).await?;
        }

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;

        info!("Config saved to {:?}.", file_path);
        Ok(())
    }
}

use std::path::Path;

use thiserror::Error;

mod versions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Config = versions::v2::Config;

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "log_level must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Will always return config, trying old schemas or eventually returning default
pub async fn load_config_from_file(config_path: &Path) -> Config {
    match tokio::fs::read_to_string(config_path).await {
        Ok(raw_config) => {
            let config = Config::from(raw_config);
            match config.validate() {
                Ok(()) => config,
                Err(e) => {
                    tracing::warn!("{e}, using default config");
                    Config::default()
                }
            }
        }
        Err(_) => {
            tracing::info!("No config file found, using defaults");
            Config::default()
        }
    }
}

/// Saves the config to the given path, creating its directory if needed
pub async fn save_config_to_file(config: &Config, config_path: &Path) -> Result<(), ConfigError> {
    config.validate()?;
    if let Some(parent) = config_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let raw_config = serde_json::to_string_pretty(config)?;
    tokio::fs::write(config_path, raw_config).await?;
    Ok(())
}

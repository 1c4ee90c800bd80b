use anyhow::Error;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::services::{config::versions::v1, remote_operation::FlightPolicy};

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize, TS, PartialEq, Eq)]
pub struct Config {
    pub config_version: String,
    /// Offer to keep secrets entered at the credential prompt.
    pub remember_credentials: bool,
    pub progress_bar: bool,
    #[serde(default)]
    pub flight_policy: FlightPolicy,
    /// Read every path back from the engine after a transition.
    #[serde(default)]
    pub rescan_after_transition: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Config {
    fn from_v1_config(old_config: v1::Config) -> Self {
        Self {
            config_version: "v2".to_string(),
            remember_credentials: old_config.remember_credentials,
            progress_bar: old_config.progress_bar,
            flight_policy: FlightPolicy::default(),
            rescan_after_transition: false,
            log_level: default_log_level(),
        }
    }

    pub fn from_previous_version(raw_config: &str) -> Result<Self, Error> {
        let old_config = serde_json::from_str::<v1::Config>(raw_config)?;
        Ok(Self::from_v1_config(old_config))
    }
}

impl From<String> for Config {
    fn from(raw_config: String) -> Self {
        if let Ok(config) = serde_json::from_str::<Config>(&raw_config)
            && config.config_version == "v2"
        {
            return config;
        }

        match Self::from_previous_version(&raw_config) {
            Ok(config) => {
                tracing::info!("Config upgraded to v2");
                config
            }
            Err(e) => {
                tracing::warn!("Config migration failed: {}, using default", e);
                Self::default()
            }
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_v1_config(v1::Config::default())
    }
}

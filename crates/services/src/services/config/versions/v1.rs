use serde::{Deserialize, Serialize};
use ts_rs::TS;

#[derive(Clone, Debug, Serialize, Deserialize, TS)]
pub struct Config {
    pub config_version: String,
    pub remember_credentials: bool,
    pub progress_bar: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: "v1".to_string(),
            remember_credentials: false,
            progress_bar: true,
        }
    }
}

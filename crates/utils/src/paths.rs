use std::path::PathBuf;

/// Overrides the directory holding settings and saved credentials.
pub const CONFIG_DIR_ENV: &str = "STAGEHAND_CONFIG_DIR";

const APP_DIR_NAME: &str = "stagehand";

/// Directory for the settings file and credential records
/// (`~/.config/stagehand` on Linux unless overridden).
pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}

pub fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

pub fn credentials_path() -> PathBuf {
    config_dir().join("credentials.json")
}

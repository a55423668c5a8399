//! User configuration loading.
//!
//! User config location: `$XDG_CONFIG_HOME/oracle-ls/oracle-ls.toml`, falling
//! back to the platform config directory (`~/.config` on Linux).

use std::path::{Path, PathBuf};

use super::ConfigError;
use super::settings::Settings;

const CONFIG_DIR_NAME: &str = "oracle-ls";
const CONFIG_FILE_NAME: &str = "oracle-ls.toml";

/// Returns the path to the user configuration file, if a config directory
/// can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME")
        && !xdg_config.is_empty()
    {
        return Some(
            PathBuf::from(xdg_config)
                .join(CONFIG_DIR_NAME)
                .join(CONFIG_FILE_NAME),
        );
    }

    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Load the user configuration. A missing file is `Ok(None)`.
pub fn load_user_config() -> Result<Option<Settings>, ConfigError> {
    match user_config_path() {
        Some(path) if path.exists() => load_settings_file(&path).map(Some),
        _ => Ok(None),
    }
}

/// Read and parse a settings file.
pub fn load_settings_file(path: &Path) -> Result<Settings, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

// Settings loader
// Loads launcher settings from an explicit TOML file, ~/.lisa-launch/config.toml,
// or built-in defaults (in that order)

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::settings::Settings;
use crate::errors;

/// Load settings, preferring `explicit` when given
///
/// An explicit path that does not exist is an error; a missing default file
/// is not.
pub fn load_settings(explicit: Option<&Path>) -> Result<Settings> {
    if let Some(path) = explicit {
        if !path.exists() {
            bail!(errors::file_not_found_error(
                &path.display().to_string(),
                "Settings file"
            ));
        }
        return load_settings_from(path);
    }

    match default_settings_path() {
        Some(path) if path.exists() => load_settings_from(&path),
        _ => {
            tracing::debug!("No settings file found, using defaults");
            Ok(Settings::default())
        }
    }
}

/// Parse a settings file; fields it omits keep their defaults
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let settings: Settings = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!(errors::config_parse_error(path, &e.to_string())))?;

    settings
        .validate()
        .with_context(|| format!("Invalid settings in {}", path.display()))?;

    tracing::debug!(path = %path.display(), "Loaded launcher settings");
    Ok(settings)
}

fn default_settings_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".lisa-launch").join("config.toml"))
}

// src/core/paths.rs

use crate::constants::{APP_DIR_NAME, CONFIG_FILENAME, FRAGMENTS_DIR_NAME, MANIFEST_CACHE_FILENAME};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PathError {
    #[error("Could not find system config directory.")]
    ConfigDirNotFound,
    #[error("Could not find system cache directory.")]
    CacheDirNotFound,
    #[error("Could not create directory at '{path}': {source}")]
    DirCreation {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to expand path template '{template}': {message}")]
    Expansion { template: String, message: String },
}

/// Returns `~/.config/psprofile` (or the platform equivalent). Does not create it.
pub fn config_dir() -> Result<PathBuf, PathError> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or(PathError::ConfigDirNotFound)
}

/// Returns `~/.cache/psprofile` (or the platform equivalent). Does not create it.
pub fn cache_dir() -> Result<PathBuf, PathError> {
    dirs::cache_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or(PathError::CacheDirNotFound)
}

/// Default location of the optional `config.toml`.
pub fn config_file_path() -> Result<PathBuf, PathError> {
    config_dir().map(|dir| dir.join(CONFIG_FILENAME))
}

/// Default fragments directory: `<config dir>/profile.d`.
pub fn default_profile_dir() -> Result<PathBuf, PathError> {
    config_dir().map(|dir| dir.join(FRAGMENTS_DIR_NAME))
}

/// Location of the compiled manifest cache inside `cache_dir`.
pub fn manifest_cache_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join(MANIFEST_CACHE_FILENAME)
}

/// Creates `dir` (and its parents) if it does not exist yet.
pub fn ensure_dir(dir: &Path) -> Result<(), PathError> {
    if dir.exists() {
        return Ok(());
    }
    fs::create_dir_all(dir).map_err(|e| PathError::DirCreation {
        path: dir.display().to_string(),
        source: e,
    })
}

/// Expands `~` and environment variables (`$VAR`, `${VAR}`) in a user-supplied path.
///
/// # Errors
/// Returns an error if the template references an undefined variable.
pub fn expand_path(template: &str) -> Result<PathBuf, PathError> {
    let expanded = shellexpand::full(template).map_err(|e| PathError::Expansion {
        template: template.to_string(),
        message: e.to_string(),
    })?;
    Ok(PathBuf::from(expanded.into_owned()))
}

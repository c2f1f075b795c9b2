//! # Configuration
//!
//! Settings come from two layers: an optional `config.toml` in the app config
//! directory, then environment variables on top. The environment is read
//! through [`EnvSource`] so the dispatcher can re-check its gate on every call
//! and tests can supply a fixed map instead of mutating the process
//! environment.

use crate::{
    constants::{
        DEFAULT_AUTO_LOAD_TIMEOUT_SECS, DEFAULT_SAMPLE_RATE, DEFAULT_SERVICE_NAME, DEFAULT_SHELL,
        DEFAULT_SLOW_THRESHOLD_MS, ENV_AUTO_LOAD, ENV_AUTO_LOAD_TIMEOUT, ENV_DEBUG,
        ENV_PROFILE_DIR, ENV_SAMPLE_RATE, ENV_SHELL, ENV_SLOW_THRESHOLD_MS,
    },
    core::paths::{self, PathError},
    models::ConfigFile,
};
use std::{collections::HashMap, fs, path::Path, path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {source}")]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Path(#[from] PathError),
}

/// Read access to environment variables.
pub trait EnvSource: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// A fixed set of variables.
#[derive(Debug, Clone, Default)]
pub struct StaticEnv {
    vars: HashMap<String, String>,
}

impl StaticEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }
}

impl EnvSource for StaticEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

fn trimmed_var(env: &dyn EnvSource, key: &str) -> Option<String> {
    env.var(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Auto-loading is on unless the flag is explicitly `0`, `false`, `no` or `off`.
pub fn auto_load_enabled(env: &dyn EnvSource) -> bool {
    match trimmed_var(env, ENV_AUTO_LOAD) {
        Some(v) => !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"),
        None => true,
    }
}

/// The dispatch timeout. Non-numeric or zero values fall back to the default.
pub fn auto_load_timeout(env: &dyn EnvSource) -> Duration {
    auto_load_timeout_or(env, Duration::from_secs(DEFAULT_AUTO_LOAD_TIMEOUT_SECS))
}

/// Like [`auto_load_timeout`], with an explicit fallback.
pub fn auto_load_timeout_or(env: &dyn EnvSource, fallback: Duration) -> Duration {
    trimmed_var(env, ENV_AUTO_LOAD_TIMEOUT)
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&s| s > 0)
        .map_or(fallback, Duration::from_secs)
}

pub fn slow_threshold_ms(env: &dyn EnvSource) -> Option<u64> {
    trimmed_var(env, ENV_SLOW_THRESHOLD_MS).and_then(|v| v.parse::<u64>().ok())
}

/// A sample rate in `[0, 1]`; anything else is ignored.
pub fn sample_rate(env: &dyn EnvSource) -> Option<f64> {
    trimmed_var(env, ENV_SAMPLE_RATE)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|r| (0.0..=1.0).contains(r))
}

/// `PS_PROFILE_DEBUG` as a level from 0 to 3. Non-numeric truthy values mean 1.
pub fn debug_level(env: &dyn EnvSource) -> u8 {
    match trimmed_var(env, ENV_DEBUG) {
        None => 0,
        Some(v) => match v.parse::<u8>() {
            Ok(n) => n.min(3),
            Err(_) if matches!(v.to_ascii_lowercase().as_str(), "true" | "yes" | "on") => 1,
            Err(_) => 0,
        },
    }
}

/// The log filter implied by a debug level.
pub fn log_filter_for(level: u8) -> log::LevelFilter {
    match level {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

/// Fully resolved settings for a profile session.
#[derive(Debug, Clone)]
pub struct ProfileConfig {
    pub profile_dir: PathBuf,
    /// Where the compiled manifest is cached. `None` disables the cache.
    pub cache_dir: Option<PathBuf>,
    /// Interpreter command line used to run loaded commands.
    pub shell: String,
    pub service_name: String,
    pub sample_rate: f64,
    pub slow_threshold_ms: u64,
    pub auto_load_timeout: Duration,
    pub debug_level: u8,
}

impl ProfileConfig {
    /// Defaults rooted at an explicit fragments directory, without caching.
    pub fn for_profile_dir(profile_dir: impl Into<PathBuf>) -> Self {
        Self {
            profile_dir: profile_dir.into(),
            cache_dir: None,
            shell: DEFAULT_SHELL.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            slow_threshold_ms: DEFAULT_SLOW_THRESHOLD_MS,
            auto_load_timeout: Duration::from_secs(DEFAULT_AUTO_LOAD_TIMEOUT_SECS),
            debug_level: 0,
        }
    }

    /// Loads the default config file (if present) and applies the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file_path = paths::config_file_path()?;
        Self::load_from(Some(&file_path), &ProcessEnv)
    }

    /// Loads `config_file` (if given and present) and applies `env` on top.
    pub fn load_from(config_file: Option<&Path>, env: &dyn EnvSource) -> Result<Self, ConfigError> {
        let file = match config_file {
            Some(path) if path.is_file() => read_config_file(path)?,
            _ => ConfigFile::default(),
        };

        let profile_dir = match trimmed_var(env, ENV_PROFILE_DIR).or(file.profile_dir.clone()) {
            Some(template) => paths::expand_path(&template)?,
            None => paths::default_profile_dir()?,
        };
        let cache_dir = match &file.cache_dir {
            Some(template) => Some(paths::expand_path(template)?),
            None => paths::cache_dir().ok(),
        };

        let mut config = Self::for_profile_dir(profile_dir);
        config.cache_dir = cache_dir;
        config.shell = trimmed_var(env, ENV_SHELL)
            .or(file.shell)
            .unwrap_or(config.shell);
        config.service_name = file.service_name.unwrap_or(config.service_name);
        config.sample_rate = sample_rate(env)
            .or(file.sample_rate.filter(|r| (0.0..=1.0).contains(r)))
            .unwrap_or(config.sample_rate);
        config.slow_threshold_ms = slow_threshold_ms(env)
            .or(file.slow_threshold_ms)
            .unwrap_or(config.slow_threshold_ms);
        config.auto_load_timeout = match trimmed_var(env, ENV_AUTO_LOAD_TIMEOUT) {
            Some(_) => auto_load_timeout(env),
            None => file
                .auto_load_timeout_secs
                .filter(|&s| s > 0)
                .map(Duration::from_secs)
                .unwrap_or(config.auto_load_timeout),
        };
        config.debug_level = debug_level(env);

        log::debug!("Resolved profile config: {:?}", config);
        Ok(config)
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::TomlParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Shared handle to an environment source.
pub type SharedEnv = Arc<dyn EnvSource>;

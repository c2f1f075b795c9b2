// src/constants.rs

/// The name of the application directory under the system config and cache dirs.
pub const APP_DIR_NAME: &str = "psprofile";

/// The name of the optional configuration file (inside the app config dir).
pub const CONFIG_FILENAME: &str = "config.toml";

/// The name of the directory holding fragment scripts, relative to the config dir.
pub const FRAGMENTS_DIR_NAME: &str = "profile.d";

/// File extension of fragment scripts, without the dot.
pub const FRAGMENT_EXTENSION: &str = "ps1";

/// The name of the declarative manifest file (inside the fragments directory).
pub const MANIFEST_FILENAME: &str = "fragments.toml";

/// The name of the compiled manifest cache (inside the app cache dir).
pub const MANIFEST_CACHE_FILENAME: &str = "manifest.cache.bin";

// --- Environment variables ---

/// `1`/`0`: enables or disables command auto-loading.
pub const ENV_AUTO_LOAD: &str = "PS_PROFILE_AUTO_LOAD_FRAGMENTS";
/// Seconds the dispatcher waits for an on-demand load.
pub const ENV_AUTO_LOAD_TIMEOUT: &str = "PS_PROFILE_AUTO_LOAD_TIMEOUT";
/// Duration in milliseconds at which an event counts as slow.
pub const ENV_SLOW_THRESHOLD_MS: &str = "PS_PROFILE_SLOW_THRESHOLD_MS";
/// Diagnostic verbosity, `0` to `3`.
pub const ENV_DEBUG: &str = "PS_PROFILE_DEBUG";
/// Retention probability for uninteresting events.
pub const ENV_SAMPLE_RATE: &str = "PS_PROFILE_SAMPLE_RATE";
/// Overrides the fragments directory.
pub const ENV_PROFILE_DIR: &str = "PS_PROFILE_DIR";
/// Interpreter command line used to invoke loaded commands.
pub const ENV_SHELL: &str = "PS_PROFILE_SHELL";

// --- Defaults ---

pub const DEFAULT_AUTO_LOAD_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SLOW_THRESHOLD_MS: u64 = 100;
pub const DEFAULT_SAMPLE_RATE: f64 = 0.1;
pub const DEFAULT_SERVICE_NAME: &str = "psprofile";
pub const DEFAULT_SHELL: &str = "pwsh -NoProfile -NonInteractive -File";

/// How long a fragment-existence probe stays cached.
pub const FRAGMENT_EXISTS_TTL_SECS: u64 = 60;

/// How long a command-availability probe stays cached.
pub const COMMAND_PROBE_TTL_SECS: u64 = 300;

/// Default number of concurrent workers for batch operations.
pub const DEFAULT_THROTTLE: usize = 4;

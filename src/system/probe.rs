// src/system/probe.rs

use crate::{
    constants::COMMAND_PROBE_TTL_SECS,
    core::{
        batch::{self, BatchError},
        cache::TtlCache,
    },
};
use std::{
    convert::Infallible,
    env,
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

/// Answers "is this tool installed?" by searching a `PATH`-style list of
/// directories. Answers are cached, so repeated checks from wrapper
/// functions do not hit the filesystem every time.
pub struct CommandProbe {
    search_path: Option<OsString>,
    cache: TtlCache<Option<PathBuf>>,
    ttl: Duration,
}

impl fmt::Debug for CommandProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandProbe")
            .field("cached", &self.cache.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Default for CommandProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandProbe {
    /// A probe over the process `PATH`.
    pub fn new() -> Self {
        Self {
            search_path: env::var_os("PATH"),
            cache: TtlCache::new(),
            ttl: Duration::from_secs(COMMAND_PROBE_TTL_SECS),
        }
    }

    /// A probe over an explicit directory list, in `PATH` syntax.
    pub fn with_search_path(search_path: impl Into<OsString>) -> Self {
        Self {
            search_path: Some(search_path.into()),
            ..Self::new()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// The full path of `name`, if found.
    pub fn locate(&self, name: &str) -> Option<PathBuf> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        self.cache
            .get_or_insert_with(name, self.ttl, || find_executable(self.search_path.as_deref(), name))
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.locate(name).is_some()
    }

    /// Probes several names concurrently, at most `throttle` at a time.
    pub fn probe_many(&self, names: Vec<String>, throttle: usize) -> Vec<(String, Option<PathBuf>)> {
        batch::run_batch(names, throttle, |name| Ok::<_, Infallible>(self.locate(name)))
            .into_iter()
            .map(|item| {
                let found = item.result.unwrap_or_else(|e: BatchError| {
                    log::warn!("Probing '{}' failed: {}", item.input, e);
                    None
                });
                (item.input, found)
            })
            .collect()
    }

    /// Forgets a cached answer, e.g. after installing a tool.
    pub fn forget(&self, name: &str) -> bool {
        self.cache.clear(name.trim())
    }
}

fn find_executable(search_path: Option<&std::ffi::OsStr>, name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let search_path = search_path?;
    for dir in env::split_paths(search_path) {
        for file_name in candidate_names(name) {
            let full = dir.join(&file_name);
            if is_executable(&full) {
                log::trace!("Found '{}' at '{}'.", name, full.display());
                return Some(dunce::simplified(&full).to_path_buf());
            }
        }
    }
    None
}

#[cfg(windows)]
fn candidate_names(name: &str) -> Vec<String> {
    if Path::new(name).extension().is_some() {
        return vec![name.to_string()];
    }
    let pathext = env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".to_string());
    std::iter::once(name.to_string())
        .chain(pathext.split(';').filter(|e| !e.is_empty()).map(|ext| format!("{}{}", name, ext)))
        .collect()
}

#[cfg(not(windows))]
fn candidate_names(name: &str) -> Vec<String> {
    vec![name.to_string()]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

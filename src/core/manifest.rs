//! # Fragment manifest
//!
//! A declarative table of fragments: name -> {file, dependencies, exported
//! commands}. It is read from `fragments.toml` in the profile directory when
//! that file exists. Otherwise every `*.ps1` in the directory is scanned and
//! the result is cached as an lz4-compressed bincode blob, keyed by a digest
//! of the directory listing, so the next session skips the scan.
//!
//! Loading the manifest only registers commands. Fragment bodies still run
//! lazily, on first use.

use crate::{
    constants::{FRAGMENT_EXTENSION, MANIFEST_FILENAME},
    core::{
        fingerprint::hash_bytes,
        fragment::{self, Statement},
        paths,
        registry::CommandRegistry,
    },
    models::{CommandDecl, ExportedCommand, ManifestEntry, ManifestFile},
};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to read manifest '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse manifest '{path}': {source}")]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Manifest '{path}' declares an invalid fragment name '{name}'.")]
    InvalidName { path: PathBuf, name: String },
}

/// Where the manifest's entries came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestSource {
    /// No profile directory, or nothing in it.
    Empty,
    /// Parsed from `fragments.toml`.
    File,
    /// Scanned from the directory during this call.
    Discovered,
    /// Read back from the compiled cache.
    Cached,
}

impl fmt::Display for ManifestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Empty => "empty",
            Self::File => MANIFEST_FILENAME,
            Self::Discovered => "discovered",
            Self::Cached => "cache",
        };
        f.write_str(s)
    }
}

/// The on-disk shape of the compiled cache.
#[derive(Serialize, Deserialize, Debug)]
struct CachedManifest {
    version: String,
    digest: String,
    entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone)]
pub struct FragmentManifest {
    entries: BTreeMap<String, ManifestEntry>,
    source: ManifestSource,
}

impl Default for FragmentManifest {
    fn default() -> Self {
        Self::empty()
    }
}

impl FragmentManifest {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
            source: ManifestSource::Empty,
        }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = ManifestEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.name.clone(), e)).collect(),
            source: ManifestSource::Discovered,
        }
    }

    /// Loads the manifest for `profile_dir`, using `cache_dir` for the
    /// compiled cache of a discovered manifest when given.
    ///
    /// A missing profile directory yields an empty manifest. A broken
    /// `fragments.toml` is an error. Cache problems never are: they only cost
    /// a rescan.
    pub fn load(profile_dir: &Path, cache_dir: Option<&Path>) -> Result<Self, ManifestError> {
        let manifest_path = profile_dir.join(MANIFEST_FILENAME);
        if manifest_path.is_file() {
            let content = fs::read_to_string(&manifest_path).map_err(|source| ManifestError::Io {
                path: manifest_path.clone(),
                source,
            })?;
            return Self::parse(&content, &manifest_path);
        }
        if !profile_dir.is_dir() {
            log::debug!(
                "Profile directory '{}' does not exist; using an empty manifest.",
                profile_dir.display()
            );
            return Ok(Self::empty());
        }

        let Some(cache_dir) = cache_dir else {
            return Ok(Self::discover(profile_dir));
        };
        let cache_path = paths::manifest_cache_path(cache_dir);
        let digest = listing_digest(profile_dir);

        match read_cached_manifest(&cache_path) {
            Ok(cached) if cached.digest == digest && cached.version == env!("CARGO_PKG_VERSION") => {
                log::debug!("Manifest cache HIT for '{}'.", profile_dir.display());
                let mut manifest = Self::from_entries(cached.entries);
                manifest.source = ManifestSource::Cached;
                return Ok(manifest);
            }
            Ok(_) => log::debug!("Manifest cache STALE for '{}'.", profile_dir.display()),
            Err(e) => log::debug!("Manifest cache MISS: {:#}", e),
        }

        let manifest = Self::discover(profile_dir);
        let cached = CachedManifest {
            version: env!("CARGO_PKG_VERSION").to_string(),
            digest,
            entries: manifest.entries.values().cloned().collect(),
        };
        if let Err(e) = write_cached_manifest(&cache_path, &cached) {
            log::warn!("Could not write manifest cache: {:#}", e);
        }
        Ok(manifest)
    }

    /// Parses the content of a `fragments.toml` located at `path`.
    /// Relative `file` entries are resolved against the manifest's directory.
    pub fn parse(content: &str, path: &Path) -> Result<Self, ManifestError> {
        let file: ManifestFile = toml::from_str(content).map_err(|source| ManifestError::TomlParse {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new(""));

        let mut entries = BTreeMap::new();
        for (name, raw) in file.fragments {
            if !fragment::is_valid_fragment_name(&name) {
                return Err(ManifestError::InvalidName {
                    path: path.to_path_buf(),
                    name,
                });
            }
            let mut requires: Vec<String> = Vec::new();
            for dep in raw.requires {
                let dep = dep.trim().to_string();
                if !dep.is_empty()
                    && !dep.eq_ignore_ascii_case(&name)
                    && !requires.iter().any(|d| d.eq_ignore_ascii_case(&dep))
                {
                    requires.push(dep);
                }
            }
            let entry = ManifestEntry {
                file: raw.file.map(|f| if f.is_absolute() { f } else { base_dir.join(f) }),
                requires,
                commands: raw.commands.into_iter().map(CommandDecl::into_exported).collect(),
                name: name.clone(),
            };
            entries.insert(name, entry);
        }

        Ok(Self {
            entries,
            source: ManifestSource::File,
        })
    }

    /// Scans every fragment script directly inside `profile_dir`.
    ///
    /// A script the scanner cannot make sense of still gets an entry (with its
    /// `# Requires:` line) but exports nothing. Registrations a script makes on
    /// behalf of another fragment are credited to that fragment.
    pub fn discover(profile_dir: &Path) -> Self {
        let mut entries: BTreeMap<String, ManifestEntry> = BTreeMap::new();
        let mut delegated: Vec<(String, ExportedCommand)> = Vec::new();

        for path in fragment_files(profile_dir) {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("Skipping unreadable fragment '{}': {}", path.display(), e);
                    continue;
                }
            };

            let mut requires = fragment::parse_requires(&content);
            requires.retain(|d| !d.eq_ignore_ascii_case(&name));
            let commands = match fragment::scan_script(&content) {
                Ok(statements) => {
                    delegated.extend(delegated_registrations(&statements, &name));
                    fragment::exported_commands(&statements)
                }
                Err(e) => {
                    log::warn!("Could not scan fragment '{}': {}", name, e);
                    Vec::new()
                }
            };

            entries.insert(
                name.clone(),
                ManifestEntry {
                    name,
                    file: None,
                    requires,
                    commands,
                },
            );
        }

        for (owner, command) in delegated {
            if let Some(entry) = entries.get_mut(&owner) {
                if !entry.commands.iter().any(|c| c.name.eq_ignore_ascii_case(&command.name)) {
                    entry.commands.push(command);
                }
            }
        }

        let source = if entries.is_empty() {
            ManifestSource::Empty
        } else {
            ManifestSource::Discovered
        };
        Self { entries, source }
    }

    pub fn source(&self) -> ManifestSource {
        self.source
    }

    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.entries.get(name)
    }

    /// Declared dependencies of `name`, empty when the fragment is unknown.
    pub fn requires(&self, name: &str) -> &[String] {
        self.entries.get(name).map_or(&[], |e| e.requires.as_slice())
    }

    /// The explicit file of `name`, if the manifest overrides the default path.
    pub fn file_for(&self, name: &str) -> Option<&Path> {
        self.entries.get(name).and_then(|e| e.file.as_deref())
    }

    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers every exported command. Returns how many were registered.
    pub fn register_all(&self, registry: &CommandRegistry) -> usize {
        let mut count = 0;
        for entry in self.entries.values() {
            for command in &entry.commands {
                registry.register(&command.name, &entry.name, command.command_type);
                count += 1;
            }
        }
        log::debug!("Registered {} command(s) from the {} manifest.", count, self.source);
        count
    }
}

/// Deletes the compiled manifest cache. Returns `false` if there was none.
pub fn clear_cache(cache_dir: &Path) -> Result<bool, ManifestError> {
    let path = paths::manifest_cache_path(cache_dir);
    match fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(ManifestError::Io { path, source }),
    }
}

fn fragment_files(profile_dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(profile_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(FRAGMENT_EXTENSION))
        })
        .collect()
}

fn delegated_registrations(statements: &[Statement], current: &str) -> Vec<(String, ExportedCommand)> {
    statements
        .iter()
        .filter_map(|s| match s {
            Statement::Register {
                commands,
                fragment: Some(owner),
                command_type,
            } if !owner.eq_ignore_ascii_case(current) => Some(commands.iter().map(|c| {
                (
                    owner.clone(),
                    ExportedCommand {
                        name: c.clone(),
                        command_type: *command_type,
                    },
                )
            })),
            _ => None,
        })
        .flatten()
        .collect()
}

/// Digest of the directory path plus each fragment's name, size and mtime.
fn listing_digest(profile_dir: &Path) -> String {
    let mut listing = format!("{}\n", profile_dir.display());
    for path in fragment_files(profile_dir) {
        let (len, modified) = fs::metadata(&path)
            .map(|m| {
                let modified = m
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_nanos());
                (m.len(), modified)
            })
            .unwrap_or((0, 0));
        listing.push_str(&format!("{}|{}|{}\n", path.display(), len, modified));
    }
    hash_bytes(listing.as_bytes())
}

fn read_cached_manifest(path: &Path) -> Result<CachedManifest> {
    let compressed_bytes = fs::read(path)
        .with_context(|| format!("Failed to read manifest cache at '{}'", path.display()))?;
    if compressed_bytes.is_empty() {
        return Err(anyhow!("Manifest cache is empty."));
    }

    let decompressed_bytes = lz4_flex::decompress_size_prepended(&compressed_bytes)
        .map_err(|e| anyhow!("Failed to decompress manifest cache: {}. It might be corrupt.", e))?;

    let (cached, _): (CachedManifest, usize) =
        bincode::serde::decode_from_slice(&decompressed_bytes, bincode::config::standard())
            .context("Failed to deserialize manifest cache.")?;
    Ok(cached)
}

fn write_cached_manifest(path: &Path, manifest: &CachedManifest) -> Result<()> {
    if let Some(parent_dir) = path.parent() {
        paths::ensure_dir(parent_dir)?;
    }
    let raw_bytes = bincode::serde::encode_to_vec(manifest, bincode::config::standard())
        .context("Failed to serialize manifest cache.")?;
    let compressed_bytes = lz4_flex::compress_prepend_size(&raw_bytes);
    log::trace!(
        "Writing manifest cache: {} bytes ({} uncompressed).",
        compressed_bytes.len(),
        raw_bytes.len()
    );
    fs::write(path, &compressed_bytes)
        .with_context(|| format!("Failed to write manifest cache to '{}'", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CommandType;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_parse_manifest_file() {
        let manifest = FragmentManifest::parse(
            r#"
            [fragments.git]
            requires = ["bootstrap", "git", "Bootstrap"]
            commands = ["Invoke-Git", { name = "gst", type = "alias" }]

            [fragments.bootstrap]
            file = "core/bootstrap.ps1"
            "#,
            Path::new("/profile/fragments.toml"),
        )
        .unwrap();

        assert_eq!(manifest.source(), ManifestSource::File);
        assert_eq!(manifest.requires("git"), ["bootstrap".to_string()]);
        assert_eq!(
            manifest.file_for("bootstrap"),
            Some(Path::new("/profile/core/bootstrap.ps1"))
        );
        let git = manifest.get("git").unwrap();
        assert_eq!(git.commands[1].command_type, CommandType::Alias);
        assert!(manifest.requires("unknown").is_empty());
    }

    #[test]
    fn test_parse_rejects_path_like_names() {
        let result = FragmentManifest::parse(
            "[fragments.\"../evil\"]\n",
            Path::new("/profile/fragments.toml"),
        );
        assert!(matches!(result, Err(ManifestError::InvalidName { .. })));
    }

    #[test]
    fn test_discover_scans_scripts() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "git.ps1",
            "# Requires: bootstrap\nfunction Invoke-Git { git @args }\nSet-Alias gst Invoke-Git\n",
        );
        write(
            dir.path(),
            "bootstrap.ps1",
            "Register-FragmentCommand Invoke-Aws cloud\n",
        );
        write(dir.path(), "cloud.ps1", "function Invoke-Aws { aws @args }\n");
        write(dir.path(), "notes.txt", "function Not-A-Fragment {}\n");

        let manifest = FragmentManifest::discover(dir.path());
        assert_eq!(manifest.len(), 3);
        assert_eq!(manifest.requires("git"), ["bootstrap".to_string()]);
        let names: Vec<_> = manifest.get("git").unwrap().commands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Invoke-Git", "gst"]);
        assert_eq!(manifest.get("cloud").unwrap().commands.len(), 1);
    }

    #[test]
    fn test_register_all_fills_registry() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "git.ps1", "function Invoke-Git {}\nfunction Get-GitRoot {}\n");
        let manifest = FragmentManifest::discover(dir.path());
        let registry = CommandRegistry::new();

        assert_eq!(manifest.register_all(&registry), 2);
        assert_eq!(registry.fragment_for("Get-GitRoot").as_deref(), Some("git"));
    }

    #[test]
    fn test_manifest_file_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "git.ps1", "function Invoke-Git {}\n");
        write(dir.path(), MANIFEST_FILENAME, "[fragments.other]\ncommands = [\"X\"]\n");

        let manifest = FragmentManifest::load(dir.path(), None).unwrap();
        assert_eq!(manifest.source(), ManifestSource::File);
        assert!(manifest.get("git").is_none());
    }

    #[test]
    fn test_missing_profile_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = FragmentManifest::load(&dir.path().join("nope"), None).unwrap();
        assert!(manifest.is_empty());
        assert_eq!(manifest.source(), ManifestSource::Empty);
    }

    #[test]
    fn test_discovered_manifest_is_cached() {
        let profile = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write(profile.path(), "git.ps1", "function Invoke-Git {}\n");

        let first = FragmentManifest::load(profile.path(), Some(cache.path())).unwrap();
        assert_eq!(first.source(), ManifestSource::Discovered);
        assert!(paths::manifest_cache_path(cache.path()).is_file());

        let second = FragmentManifest::load(profile.path(), Some(cache.path())).unwrap();
        assert_eq!(second.source(), ManifestSource::Cached);
        assert_eq!(second.get("git"), first.get("git"));

        write(profile.path(), "docker.ps1", "function Invoke-Docker {}\n");
        let third = FragmentManifest::load(profile.path(), Some(cache.path())).unwrap();
        assert_eq!(third.source(), ManifestSource::Discovered);
        assert_eq!(third.len(), 2);
    }

    #[test]
    fn test_corrupt_cache_falls_back_to_scan() {
        let profile = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write(profile.path(), "git.ps1", "function Invoke-Git {}\n");
        fs::write(paths::manifest_cache_path(cache.path()), b"garbage").unwrap();

        let manifest = FragmentManifest::load(profile.path(), Some(cache.path())).unwrap();
        assert_eq!(manifest.source(), ManifestSource::Discovered);
        assert_eq!(manifest.len(), 1);
    }

    #[test]
    fn test_clear_cache() {
        let cache = tempfile::tempdir().unwrap();
        assert!(!clear_cache(cache.path()).unwrap());
        fs::write(paths::manifest_cache_path(cache.path()), b"x").unwrap();
        assert!(clear_cache(cache.path()).unwrap());
    }
}

// src/core/fingerprint.rs

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::SystemTime};

const HASH_TRUNCATE_LENGTH: usize = 16; // 16 bytes = 32 hex characters

/// Identity of a fragment file at the moment it was loaded.
///
/// Timestamp and size are cheap to compare; the content hash settles the
/// cases where an editor rewrote the file without changing it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub modified: SystemTime,
    pub file_size: u64,
    pub content_hash: String,
}

impl Fingerprint {
    /// Reads the file and computes its fingerprint.
    ///
    /// # Errors
    /// Returns an I/O error if the file cannot be read or its metadata cannot be accessed.
    pub fn of_file(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path)
            .with_context(|| format!("Failed to read metadata for file '{}'", path.display()))?;
        let content = fs::read(path)
            .with_context(|| format!("Failed to read content of file '{}'", path.display()))?;
        Ok(Self {
            modified: metadata.modified()?,
            file_size: metadata.len(),
            content_hash: hash_bytes(&content),
        })
    }

    /// Builds a fingerprint from content already in memory.
    pub fn of_content(path: &Path, content: &[u8]) -> Result<Self> {
        let metadata = fs::metadata(path)
            .with_context(|| format!("Failed to read metadata for file '{}'", path.display()))?;
        Ok(Self {
            modified: metadata.modified()?,
            file_size: content.len() as u64,
            content_hash: hash_bytes(content),
        })
    }

    /// True when the file on disk no longer matches this fingerprint.
    /// A file that cannot be read counts as changed.
    pub fn is_stale(&self, path: &Path) -> bool {
        let Ok(metadata) = fs::metadata(path) else {
            return true;
        };
        let same_meta =
            metadata.len() == self.file_size && metadata.modified().ok() == Some(self.modified);
        if same_meta {
            return false;
        }
        match Self::of_file(path) {
            Ok(current) => {
                debug!(
                    "Fragment '{}' metadata changed; hash {} -> {}",
                    path.display(),
                    self.content_hash,
                    current.content_hash
                );
                current.content_hash != self.content_hash
            }
            Err(_) => true,
        }
    }
}

/// Truncated, hex-encoded blake3 digest.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let hash = blake3::hash(bytes);
    let truncated = hash
        .as_bytes()
        .get(..HASH_TRUNCATE_LENGTH)
        .unwrap_or(hash.as_bytes());
    hex::encode(truncated)
}

// src/core/registry.rs

use crate::models::{CommandType, RegistryEntry};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Maps command names to the fragment that defines them.
///
/// Fragments register their exported commands here (directly or through the
/// manifest); the dispatcher consults it on every command-not-found event.
/// Registration is an upsert: the last fragment to claim a name owns it.
///
/// Names match case-insensitively, like shell command lookup; each entry
/// keeps the spelling it was last registered with.
///
/// A poisoned lock makes the registry "unavailable": lookups answer `false`
/// or `None` and registrations are dropped with a warning. Nothing here panics.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Option<MutexGuard<'_, HashMap<String, RegistryEntry>>> {
        self.entries.lock().ok()
    }

    /// Registers `command_name` as owned by `fragment_name`, replacing any
    /// previous owner. Blank names are ignored.
    pub fn register(&self, command_name: &str, fragment_name: &str, command_type: CommandType) {
        let command_name = command_name.trim();
        if command_name.is_empty() {
            return;
        }
        let Some(mut entries) = self.lock() else {
            log::warn!(
                "Command registry unavailable; '{}' was not registered.",
                command_name
            );
            return;
        };
        let entry = RegistryEntry {
            command_name: command_name.to_string(),
            fragment_name: fragment_name.to_string(),
            command_type,
            registered_at: Utc::now(),
        };
        if let Some(previous) = entries.insert(registry_key(command_name), entry) {
            if previous.fragment_name != fragment_name {
                log::debug!(
                    "Command '{}' re-registered: '{}' -> '{}'",
                    command_name,
                    previous.fragment_name,
                    fragment_name
                );
            }
        }
    }

    /// True if `command_name` is registered. Blank names and an unavailable
    /// registry both answer `false`.
    pub fn contains(&self, command_name: &str) -> bool {
        let command_name = command_name.trim();
        if command_name.is_empty() {
            return false;
        }
        self.lock()
            .map(|entries| entries.contains_key(&registry_key(command_name)))
            .unwrap_or(false)
    }

    pub fn get(&self, command_name: &str) -> Option<RegistryEntry> {
        self.lock()?.get(&registry_key(command_name)).cloned()
    }

    /// The fragment owning `command_name`, if any.
    pub fn fragment_for(&self, command_name: &str) -> Option<String> {
        self.get(command_name).map(|e| e.fragment_name)
    }

    /// Every command owned by `fragment_name`, sorted by name.
    pub fn commands_for(&self, fragment_name: &str) -> Vec<String> {
        let Some(entries) = self.lock() else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .values()
            .filter(|e| e.fragment_name == fragment_name)
            .map(|e| e.command_name.clone())
            .collect();
        names.sort();
        names
    }

    /// A snapshot of all entries, sorted by command name.
    pub fn entries(&self) -> Vec<RegistryEntry> {
        let Some(entries) = self.lock() else {
            return Vec::new();
        };
        let mut all: Vec<RegistryEntry> = entries.values().cloned().collect();
        all.sort_by(|a, b| a.command_name.cmp(&b.command_name));
        all
    }

    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the registry. Used by reset flows and tests.
    pub fn clear(&self) {
        if let Some(mut entries) = self.lock() {
            entries.clear();
        }
    }

    /// False once the backing store has been poisoned by a panicking writer.
    pub fn is_available(&self) -> bool {
        !self.entries.is_poisoned()
    }
}

fn registry_key(command_name: &str) -> String {
    command_name.trim().to_ascii_lowercase()
}

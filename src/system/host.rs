// src/system/host.rs

use crate::{
    core::fragment::{self, ScanError, Statement},
    models::{CommandType, ExportedCommand},
};
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Fragment '{fragment}' could not be parsed: {source}")]
    Parse {
        fragment: String,
        #[source]
        source: ScanError,
    },
    #[error("Fragment '{fragment}' threw: {message}")]
    Threw { fragment: String, message: String },
    #[error("The session scope is unavailable.")]
    ScopeUnavailable,
}

/// A command registration requested by a fragment while it was being sourced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub command_name: String,
    pub fragment_name: String,
    pub command_type: CommandType,
}

/// What sourcing a fragment changed in the scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceReport {
    pub defined: Vec<ExportedCommand>,
    pub registrations: Vec<Registration>,
}

/// The scope fragments are sourced into: the equivalent of the interactive
/// shell session that called the loader.
pub trait FragmentHost: Send + Sync {
    /// Executes `script` (the content of the fragment at `path`) in this scope.
    fn source(&self, fragment: &str, path: &Path, script: &str) -> Result<SourceReport, HostError>;

    /// True if `name` resolves to a function or alias in this scope.
    fn has_command(&self, name: &str) -> bool;
}

/// A function or alias defined in the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinedCommand {
    pub name: String,
    pub command_type: CommandType,
    pub fragment: String,
    /// The function source, or the alias target.
    pub body: String,
}

#[derive(Debug, Default)]
struct ScopeState {
    /// Keyed by lowercased name: command lookup is case-insensitive.
    commands: HashMap<String, DefinedCommand>,
    globals: BTreeMap<String, String>,
    /// Fragment names in the order their bodies started executing.
    execution_log: Vec<String>,
    /// Sourced files, most recent source last, without duplicates.
    scripts: Vec<(String, PathBuf)>,
}

/// The in-process session scope.
///
/// Sourcing walks the fragment's top-level statements in order, defining
/// functions, aliases and `$global:` markers as it goes. A top-level `throw`
/// stops execution: whatever was defined before it stays defined, and the
/// error is returned to the loader.
#[derive(Debug, Default)]
pub struct SessionScope {
    state: Mutex<ScopeState>,
}

impl SessionScope {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Option<MutexGuard<'_, ScopeState>> {
        self.state.lock().ok()
    }

    /// Looks up a defined function or alias, following aliases to their target.
    pub fn command(&self, name: &str) -> Option<DefinedCommand> {
        let state = self.lock()?;
        state.commands.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Resolves aliases until a function (or an undefined target) is reached.
    pub fn resolve_alias(&self, name: &str) -> Option<DefinedCommand> {
        let state = self.lock()?;
        let mut current = state.commands.get(&name.to_ascii_lowercase())?;
        // Bounded to break alias cycles.
        for _ in 0..16 {
            if current.command_type != CommandType::Alias {
                return Some(current.clone());
            }
            match state.commands.get(&current.body.to_ascii_lowercase()) {
                Some(next) => current = next,
                None => return Some(current.clone()),
            }
        }
        None
    }

    /// All defined commands, sorted by name.
    pub fn commands(&self) -> Vec<DefinedCommand> {
        let Some(state) = self.lock() else {
            return Vec::new();
        };
        let mut all: Vec<DefinedCommand> = state.commands.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// The value of a `$global:` marker set by a fragment.
    pub fn global(&self, name: &str) -> Option<String> {
        self.lock()?.globals.get(name).cloned()
    }

    /// Fragment names in the order their bodies were executed.
    pub fn execution_order(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.execution_log.clone())
            .unwrap_or_default()
    }

    /// How many times `fragment`'s body has been executed.
    pub fn times_sourced(&self, fragment: &str) -> usize {
        self.lock()
            .map(|s| s.execution_log.iter().filter(|f| *f == fragment).count())
            .unwrap_or(0)
    }

    /// Paths of every sourced fragment, in the order they should be replayed.
    pub fn sourced_scripts(&self) -> Vec<PathBuf> {
        self.lock()
            .map(|s| s.scripts.iter().map(|(_, p)| p.clone()).collect())
            .unwrap_or_default()
    }
}

impl FragmentHost for SessionScope {
    fn source(&self, fragment: &str, path: &Path, script: &str) -> Result<SourceReport, HostError> {
        let statements = fragment::scan_script(script).map_err(|source| HostError::Parse {
            fragment: fragment.to_string(),
            source,
        })?;

        let mut state = self.lock().ok_or(HostError::ScopeUnavailable)?;
        state.execution_log.push(fragment.to_string());
        state.scripts.retain(|(name, _)| name != fragment);
        state.scripts.push((fragment.to_string(), path.to_path_buf()));

        let mut report = SourceReport::default();
        for statement in statements {
            match statement {
                Statement::Function { name, body } => {
                    define(&mut state, &mut report, fragment, name, CommandType::Function, body);
                }
                Statement::Alias { name, target } => {
                    define(&mut state, &mut report, fragment, name, CommandType::Alias, target);
                }
                Statement::Register {
                    commands,
                    fragment: owner,
                    command_type,
                } => {
                    let owner = owner.unwrap_or_else(|| fragment.to_string());
                    report
                        .registrations
                        .extend(commands.into_iter().map(|command_name| Registration {
                            command_name,
                            fragment_name: owner.clone(),
                            command_type,
                        }));
                }
                Statement::Global { name, value } => {
                    state.globals.insert(name, value);
                }
                Statement::Throw { message } => {
                    return Err(HostError::Threw {
                        fragment: fragment.to_string(),
                        message,
                    });
                }
            }
        }
        Ok(report)
    }

    fn has_command(&self, name: &str) -> bool {
        self.lock()
            .map(|s| s.commands.contains_key(&name.to_ascii_lowercase()))
            .unwrap_or(false)
    }
}

fn define(
    state: &mut ScopeState,
    report: &mut SourceReport,
    fragment: &str,
    name: String,
    command_type: CommandType,
    body: String,
) {
    report.defined.push(ExportedCommand {
        name: name.clone(),
        command_type,
    });
    state.commands.insert(
        name.to_ascii_lowercase(),
        DefinedCommand {
            name,
            command_type,
            fragment: fragment.to_string(),
            body,
        },
    );
}

// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

// --- REGISTRY MODELS ---

/// The kind of symbol a fragment exports under a command name.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    #[default]
    Function,
    Alias,
    Cmdlet,
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Function => "Function",
            Self::Alias => "Alias",
            Self::Cmdlet => "Cmdlet",
        };
        f.write_str(s)
    }
}

/// One row of the command registry: which fragment owns a command.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub command_name: String,
    pub fragment_name: String,
    pub command_type: CommandType,
    pub registered_at: DateTime<Utc>,
}

// --- LOADER MODELS ---

/// Per-fragment position in the load lifecycle.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    NotLoaded,
    Loading,
    Loaded,
    Failed,
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotLoaded => "not loaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The non-error results of asking the loader for a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The fragment body was executed by this call.
    Loaded,
    /// The fragment was already loaded; nothing was executed.
    AlreadyLoaded,
    /// Another caller is loading this fragment right now.
    InProgress,
    /// The fragment file does not exist.
    Missing,
    /// The command has no owning fragment in the registry.
    NotRegistered,
}

impl LoadOutcome {
    /// True when the fragment's body has run at some point in this process.
    pub fn is_loaded(self) -> bool {
        matches!(self, Self::Loaded | Self::AlreadyLoaded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loaded => "loaded",
            Self::AlreadyLoaded => "already_loaded",
            Self::InProgress => "in_progress",
            Self::Missing => "missing",
            Self::NotRegistered => "not_registered",
        }
    }
}

// --- WIDE EVENT MODELS ---

/// Open key/value context attached to an event.
pub type EventContext = BTreeMap<String, serde_json::Value>;

/// OpenTelemetry-style severity.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Severity {
    /// The OpenTelemetry severity number for the level.
    pub fn number(self) -> u8 {
        match self {
            Self::Debug => 5,
            Self::Info => 9,
            Self::Warn => 13,
            Self::Error => 17,
            Self::Fatal => 21,
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, Self::Error | Self::Fatal)
    }

    /// The `log` level a retained event is mirrored at.
    pub fn log_level(self) -> log::Level {
        match self {
            Self::Debug => log::Level::Debug,
            Self::Info => log::Level::Info,
            Self::Warn => log::Level::Warn,
            Self::Error | Self::Fatal => log::Level::Error,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusCode {
    Ok,
    Error,
}

/// Why the sampler kept (or would have dropped) an event.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetentionReason {
    Error,
    Slow,
    Explicit,
    Sampled,
    Dropped,
}

/// The `{type, message}` pair recorded for a failed operation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Builds the detail from any displayable error, naming it after its Rust type.
    pub fn from_error<E: fmt::Display + ?Sized>(error: &E) -> Self {
        Self::new(short_type_name::<E>(), error.to_string())
    }

    /// Builds the detail from an `anyhow::Error`, using the full context chain as message.
    pub fn from_anyhow(error: &anyhow::Error) -> Self {
        Self::new("anyhow::Error", format!("{:#}", error))
    }
}

/// Strips module paths from a type name, keeping generic arguments readable.
fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Where and by what an event was written.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// `file:line` of the code that wrote the event.
    pub caller: String,
    pub runtime_version: String,
    pub session_id: String,
    pub pid: u32,
}

/// A single structured record describing one operation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WideEvent {
    pub timestamp: DateTime<Utc>,
    pub event_name: String,
    pub service_name: String,
    pub severity_text: Severity,
    pub severity_number: u8,
    pub status_code: StatusCode,
    pub duration_ms: Option<f64>,
    pub retention_reason: RetentionReason,
    pub error: Option<ErrorDetail>,
    pub invocation: Invocation,
    pub context: EventContext,
}

// --- MANIFEST MODELS ---

/// A command declaration as written in `fragments.toml`. Uses `untagged` so
/// both `"Invoke-Git"` and `{ name = "gst", type = "alias" }` are accepted.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(untagged)]
pub enum CommandDecl {
    Name(String),
    Typed {
        name: String,
        #[serde(rename = "type", default)]
        command_type: CommandType,
    },
}

impl CommandDecl {
    pub fn into_exported(self) -> ExportedCommand {
        match self {
            Self::Name(name) => ExportedCommand {
                name,
                command_type: CommandType::Function,
            },
            Self::Typed { name, command_type } => ExportedCommand { name, command_type },
        }
    }
}

/// One `[fragments.<name>]` table of `fragments.toml`.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ManifestFileEntry {
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub commands: Vec<CommandDecl>,
}

/// The deserialized structure of a `fragments.toml` file.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ManifestFile {
    #[serde(default)]
    pub fragments: BTreeMap<String, ManifestFileEntry>,
}

/// A command a fragment makes available once loaded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExportedCommand {
    pub name: String,
    pub command_type: CommandType,
}

/// The normalized manifest row for one fragment. Plain data only, so it
/// round-trips through the binary manifest cache.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ManifestEntry {
    pub name: String,
    pub file: Option<PathBuf>,
    pub requires: Vec<String>,
    pub commands: Vec<ExportedCommand>,
}

// --- CONFIG FILE MODEL ---

/// The deserialized structure of `config.toml`. Every field is optional and
/// environment variables take precedence.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ConfigFile {
    pub profile_dir: Option<String>,
    pub cache_dir: Option<String>,
    pub shell: Option<String>,
    pub service_name: Option<String>,
    pub sample_rate: Option<f64>,
    pub slow_threshold_ms: Option<u64>,
    pub auto_load_timeout_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_numbers_follow_otel() {
        assert_eq!(Severity::Debug.number(), 5);
        assert_eq!(Severity::Info.number(), 9);
        assert_eq!(Severity::Warn.number(), 13);
        assert_eq!(Severity::Error.number(), 17);
        assert_eq!(Severity::Fatal.number(), 21);
        assert!(Severity::Fatal.is_error());
        assert!(!Severity::Warn.is_error());
    }

    #[test]
    fn test_command_decl_accepts_both_forms() {
        let file: ManifestFile = toml::from_str(
            r#"
            [fragments.git]
            requires = ["bootstrap"]
            commands = ["Invoke-Git", { name = "gst", type = "alias" }]
            "#,
        )
        .unwrap();

        let entry = file.fragments.get("git").unwrap();
        assert_eq!(entry.requires, vec!["bootstrap"]);
        let exported: Vec<_> = entry
            .commands
            .iter()
            .cloned()
            .map(CommandDecl::into_exported)
            .collect();
        assert_eq!(exported[0].command_type, CommandType::Function);
        assert_eq!(exported[1].name, "gst");
        assert_eq!(exported[1].command_type, CommandType::Alias);
    }

    #[test]
    fn test_error_detail_uses_short_type_name() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let detail = ErrorDetail::from_error(&err);
        assert_eq!(detail.kind, "Error");
        assert_eq!(detail.message, "gone");
    }

    #[test]
    fn test_wide_event_serializes_otel_field_names() {
        let event = WideEvent {
            timestamp: Utc::now(),
            event_name: "op.test".into(),
            service_name: "psprofile".into(),
            severity_text: Severity::Error,
            severity_number: 17,
            status_code: StatusCode::Error,
            duration_ms: None,
            retention_reason: RetentionReason::Error,
            error: Some(ErrorDetail::new("IoError", "boom")),
            invocation: Invocation {
                caller: "src/x.rs:1".into(),
                runtime_version: "0.0.0".into(),
                session_id: "s".into(),
                pid: 1,
            },
            context: EventContext::new(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["severity_text"], "ERROR");
        assert_eq!(json["status_code"], "ERROR");
        assert_eq!(json["retention_reason"], "error");
        assert_eq!(json["error"]["type"], "IoError");
    }
}

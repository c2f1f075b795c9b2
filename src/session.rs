//! # Profile session
//!
//! Owns one instance of every shared structure (registry, scope, event log,
//! loader, dispatcher, handler chain) and wires them together the way an
//! interactive shell would: commands come from the manifest, lookups that miss
//! go through the handler chain, and the dispatcher loads fragments on demand.

use crate::{
    core::{
        config::{ProcessEnv, ProfileConfig, SharedEnv},
        dispatcher::Dispatcher,
        events::{EventLog, EventLogConfig},
        loader::FragmentLoader,
        manifest::{FragmentManifest, ManifestError},
        registry::CommandRegistry,
    },
    event_context,
    system::{
        executor::{self, ExecutionError, ShellSpec},
        hook::HandlerChain,
        host::{DefinedCommand, SessionScope},
        probe::CommandProbe,
    },
};
use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("Command '{0}' could not be resolved.")]
    CommandNotFound(String),
}

/// How a command name was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Already defined in the session scope.
    Defined(DefinedCommand),
    /// Defined after the handler chain loaded `fragment`.
    Loaded {
        command: DefinedCommand,
        fragment: Option<String>,
    },
    /// An executable found on `PATH`.
    External(PathBuf),
    NotFound,
}

impl Resolution {
    pub fn is_found(&self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

#[derive(Debug)]
pub struct ProfileSession {
    config: ProfileConfig,
    registry: Arc<CommandRegistry>,
    scope: Arc<SessionScope>,
    events: Arc<EventLog>,
    loader: Arc<FragmentLoader>,
    dispatcher: Arc<Dispatcher>,
    chain: HandlerChain,
    probe: CommandProbe,
}

impl ProfileSession {
    /// Opens a session against the process environment.
    pub fn open(config: ProfileConfig) -> Result<Self, SessionError> {
        Self::open_with(config, Arc::new(ProcessEnv), CommandProbe::new())
    }

    /// Opens a session with an explicit environment source and command probe.
    pub fn open_with(config: ProfileConfig, env: SharedEnv, probe: CommandProbe) -> Result<Self, SessionError> {
        let manifest = FragmentManifest::load(&config.profile_dir, config.cache_dir.as_deref())?;
        let events = Arc::new(EventLog::new(EventLogConfig::from_profile(&config)));
        Ok(Self::assemble(config, env, probe, manifest, events))
    }

    fn assemble(
        config: ProfileConfig,
        env: SharedEnv,
        probe: CommandProbe,
        manifest: FragmentManifest,
        events: Arc<EventLog>,
    ) -> Self {
        let registry = Arc::new(CommandRegistry::new());
        let registered = manifest.register_all(&registry);
        let scope = Arc::new(SessionScope::new());

        let loader = Arc::new(
            FragmentLoader::new(&config.profile_dir, registry.clone(), scope.clone())
                .with_events(events.clone())
                .with_manifest(manifest),
        );
        let dispatcher = Arc::new(Dispatcher::new(loader.clone(), env).with_timeout(config.auto_load_timeout));
        let chain = HandlerChain::new();
        if !dispatcher.register(&chain, false) {
            log::info!("Command auto-loading is off for this session.");
        }
        log::debug!(
            "Session opened on '{}' with {} registered command(s).",
            config.profile_dir.display(),
            registered
        );

        Self {
            config,
            registry,
            scope,
            events,
            loader,
            dispatcher,
            chain,
            probe,
        }
    }

    pub fn config(&self) -> &ProfileConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn scope(&self) -> &Arc<SessionScope> {
        &self.scope
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn loader(&self) -> &Arc<FragmentLoader> {
        &self.loader
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn chain(&self) -> &HandlerChain {
        &self.chain
    }

    pub fn probe(&self) -> &CommandProbe {
        &self.probe
    }

    /// Resolves `name` the way the shell does: session scope, then `PATH`,
    /// then the not-found handlers followed by one retry.
    pub fn resolve(&self, name: &str) -> Resolution {
        let name = name.trim();
        if name.is_empty() {
            return Resolution::NotFound;
        }
        if let Some(command) = self.scope.resolve_alias(name) {
            return Resolution::Defined(command);
        }
        if let Some(path) = self.probe.locate(name) {
            return Resolution::External(path);
        }

        let args = self.chain.resolve(name);
        if !args.stop_search {
            return Resolution::NotFound;
        }
        match self.scope.resolve_alias(name) {
            Some(command) => Resolution::Loaded {
                command,
                fragment: self.registry.fragment_for(name),
            },
            None => {
                log::warn!("'{}' was dispatched but its fragment did not define it.", name);
                Resolution::NotFound
            }
        }
    }

    /// Resolves `command`, loading its fragment if needed, and runs it with
    /// `args` through the configured shell.
    pub fn invoke(&self, command: &str, args: &[String]) -> Result<(), SessionError> {
        let (shell, script) = self.prepare_invocation(command, args)?;
        let cwd = working_dir(&self.config.profile_dir);
        self.events
            .run_with_event(
                "command.invoke",
                event_context! { "command" => command, "args" => args.len() },
                || executor::run_script(&shell, &script, &cwd),
            )
            .map_err(SessionError::from)
    }

    /// Like [`ProfileSession::invoke`], but captures the command's output.
    pub fn invoke_capture(&self, command: &str, args: &[String]) -> Result<String, SessionError> {
        let (shell, script) = self.prepare_invocation(command, args)?;
        let cwd = working_dir(&self.config.profile_dir);
        self.events
            .run_with_event(
                "command.invoke",
                event_context! { "command" => command, "args" => args.len(), "captured" => true },
                || executor::capture_script(&shell, &script, &cwd),
            )
            .map_err(SessionError::from)
    }

    fn prepare_invocation(&self, command: &str, args: &[String]) -> Result<(ShellSpec, String), SessionError> {
        let fragments = match self.resolve(command) {
            Resolution::NotFound => return Err(SessionError::CommandNotFound(command.to_string())),
            Resolution::External(_) => Vec::new(),
            Resolution::Defined(_) | Resolution::Loaded { .. } => self.scope.sourced_scripts(),
        };
        let shell = ShellSpec::parse(&self.config.shell)?;
        let script = executor::render_invocation_script(&fragments, command.trim(), args);
        Ok((shell, script))
    }
}

fn working_dir(fallback: &Path) -> PathBuf {
    env::current_dir().unwrap_or_else(|_| fallback.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{constants::ENV_AUTO_LOAD, core::config::StaticEnv};
    use std::fs;

    fn session_for(dir: &Path, env: StaticEnv) -> ProfileSession {
        let config = ProfileConfig::for_profile_dir(dir);
        let empty_path = tempfile::tempdir().unwrap();
        let probe = CommandProbe::with_search_path(empty_path.path().as_os_str());
        ProfileSession::open_with(config, Arc::new(env), probe).unwrap()
    }

    #[test]
    fn test_resolve_loads_fragment_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("git.ps1"),
            "# Requires: bootstrap\nfunction Invoke-Git { git @args }\nSet-Alias g Invoke-Git\n",
        )
        .unwrap();
        fs::write(dir.path().join("bootstrap.ps1"), "$global:Booted = '1'\n").unwrap();
        let session = session_for(dir.path(), StaticEnv::new());

        assert_eq!(session.registry().fragment_for("g").as_deref(), Some("git"));
        match session.resolve("g") {
            Resolution::Loaded { command, fragment } => {
                assert_eq!(command.name, "Invoke-Git");
                assert_eq!(fragment.as_deref(), Some("git"));
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
        assert_eq!(session.scope().execution_order(), vec!["bootstrap", "git"]);
        assert!(matches!(session.resolve("Invoke-Git"), Resolution::Defined(_)));
        assert_eq!(session.scope().times_sourced("git"), 1);
    }

    #[test]
    fn test_resolve_ignores_case_of_registered_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("git.ps1"), "function Invoke-Git { git @args }\n").unwrap();
        let session = session_for(dir.path(), StaticEnv::new());

        match session.resolve("invoke-git") {
            Resolution::Loaded { command, fragment } => {
                assert_eq!(command.name, "Invoke-Git");
                assert_eq!(fragment.as_deref(), Some("git"));
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
        assert_eq!(session.scope().times_sourced("git"), 1);
    }

    #[test]
    fn test_resolve_unknown_command() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_for(dir.path(), StaticEnv::new());
        assert_eq!(session.resolve("Invoke-Nothing"), Resolution::NotFound);
        assert_eq!(session.resolve(""), Resolution::NotFound);
    }

    #[test]
    fn test_disabled_auto_load_leaves_chain_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("git.ps1"), "function Invoke-Git {}\n").unwrap();
        let session = session_for(dir.path(), StaticEnv::new().with(ENV_AUTO_LOAD, "0"));

        assert!(session.chain().is_empty());
        assert!(!session.dispatcher().is_registered());
        assert_eq!(session.resolve("Invoke-Git"), Resolution::NotFound);
        assert!(session.registry().contains("Invoke-Git"));
    }

    #[test]
    fn test_invoke_unknown_command_fails() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_for(dir.path(), StaticEnv::new());
        let result = session.invoke("Invoke-Nothing", &[]);
        assert!(matches!(result, Err(SessionError::CommandNotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_invoke_replays_loaded_fragments() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("git.ps1"), "function Invoke-Git {}\n").unwrap();
        let mut config = ProfileConfig::for_profile_dir(dir.path());
        // `cat` echoes the generated script back instead of running it.
        config.shell = "cat".to_string();
        let empty_path = tempfile::tempdir().unwrap();
        let probe = CommandProbe::with_search_path(empty_path.path().as_os_str());
        let session = ProfileSession::open_with(config, Arc::new(StaticEnv::new()), probe).unwrap();

        let output = session
            .invoke_capture("Invoke-Git", &["status".to_string()])
            .unwrap();
        let expected_source = format!(". '{}'", dir.path().join("git.ps1").display());
        assert!(output.contains(&expected_source));
        assert!(output.trim_end().ends_with("& 'Invoke-Git' 'status'"));
    }
}

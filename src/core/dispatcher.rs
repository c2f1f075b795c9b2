//! # Command dispatcher
//!
//! The command-not-found handler. On a lookup miss it asks the registry who
//! owns the command, loads that fragment on a worker thread and, once the
//! fragment is loaded, tells the host to retry resolution.
//!
//! Nothing here returns an error or panics into the caller: every failure,
//! including a timed-out or panicking load, reads as "not handled".

use crate::{
    constants::DEFAULT_AUTO_LOAD_TIMEOUT_SECS,
    core::{
        config::{self, SharedEnv},
        loader::{FragmentLoader, LoadError},
    },
    event_context,
    models::{EventContext, LoadOutcome},
    system::hook::{CommandNotFoundHandler, HandlerChain, HandlerId, LookupEventArgs},
};
use std::{
    fmt,
    sync::{Arc, Mutex, mpsc},
    thread,
    time::Duration,
};

const DISPATCH_EVENT: &str = "command.dispatch";

pub struct Dispatcher {
    loader: Arc<FragmentLoader>,
    env: SharedEnv,
    fallback_timeout: Duration,
    installation: Mutex<Option<HandlerId>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registered", &self.is_registered())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(loader: Arc<FragmentLoader>, env: SharedEnv) -> Self {
        Self {
            loader,
            env,
            fallback_timeout: Duration::from_secs(DEFAULT_AUTO_LOAD_TIMEOUT_SECS),
            installation: Mutex::new(None),
        }
    }

    /// Timeout used when the environment does not set one.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.fallback_timeout = timeout;
        self
    }

    pub fn loader(&self) -> &Arc<FragmentLoader> {
        &self.loader
    }

    /// Installs the dispatcher at the front of `chain`.
    ///
    /// Returns `false` when auto-loading is disabled, the registry is
    /// unavailable or the chain cannot be modified. Already registered is a
    /// success; `force` removes the old installation and installs again.
    pub fn register(self: &Arc<Self>, chain: &HandlerChain, force: bool) -> bool {
        if !config::auto_load_enabled(self.env.as_ref()) {
            log::debug!("Auto-loading disabled; dispatcher not registered.");
            return false;
        }
        if !self.loader.registry().is_available() {
            log::warn!("Command registry unavailable; dispatcher not registered.");
            return false;
        }

        let Ok(mut installation) = self.installation.lock() else {
            return false;
        };
        if let Some(id) = *installation {
            if !force && chain.contains(id) {
                log::trace!("Dispatcher already registered as handler #{}.", id);
                return true;
            }
            chain.remove(id);
        }

        let handler: Arc<dyn CommandNotFoundHandler> = self.clone();
        match chain.prepend(handler) {
            Some(id) => {
                log::debug!("Dispatcher registered as handler #{}.", id);
                *installation = Some(id);
                true
            }
            None => {
                log::warn!("Could not install the dispatcher in the handler chain.");
                *installation = None;
                false
            }
        }
    }

    /// Removes the installed handler. `false` if nothing was registered.
    pub fn unregister(&self, chain: &HandlerChain) -> bool {
        let Ok(mut installation) = self.installation.lock() else {
            return false;
        };
        match installation.take() {
            Some(id) => {
                chain.remove(id);
                log::debug!("Dispatcher handler #{} unregistered.", id);
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.installation
            .lock()
            .map(|i| i.is_some())
            .unwrap_or(false)
    }

    /// Handles a failed lookup of `command_name`. Returns whether the owning
    /// fragment is now loaded, in which case `args.stop_search` is set.
    pub fn dispatch(&self, command_name: &str, args: &mut LookupEventArgs) -> bool {
        let name = command_name.trim();
        if name.is_empty() || !config::auto_load_enabled(self.env.as_ref()) {
            return false;
        }
        if !self.loader.registry().contains(name) {
            log::trace!("'{}' is not a registered command.", name);
            return false;
        }

        match self.load_with_timeout(name) {
            Some(Ok(outcome)) if outcome.is_loaded() => {
                log::debug!("Dispatched '{}' ({:?}).", name, outcome);
                args.stop_search = true;
                true
            }
            Some(Ok(outcome)) => {
                log::debug!("Dispatch of '{}' did not load its fragment: {:?}", name, outcome);
                false
            }
            Some(Err(e)) => {
                log::debug!("Dispatch of '{}' failed: {}", name, e);
                false
            }
            None => false,
        }
    }

    /// Runs the load on a worker thread and waits at most the configured
    /// timeout. A timed-out load keeps running; its result is discarded.
    fn load_with_timeout(&self, command_name: &str) -> Option<Result<LoadOutcome, LoadError>> {
        let timeout = config::auto_load_timeout_or(self.env.as_ref(), self.fallback_timeout);
        let loader = Arc::clone(&self.loader);
        let name = command_name.to_string();
        let (tx, rx) = mpsc::channel();

        let spawned = thread::Builder::new()
            .name("psprofile-dispatch".into())
            .spawn(move || {
                let result = match loader.events() {
                    Some(events) => events.run_with_event_annotated(
                        DISPATCH_EVENT,
                        event_context! { "command" => name.as_str() },
                        || loader.load_for_command(&name),
                        annotate_outcome,
                    ),
                    None => loader.load_for_command(&name),
                };
                let _ = tx.send(result);
            });
        if let Err(e) = spawned {
            log::warn!("Could not start the dispatch worker: {}", e);
            return None;
        }

        match rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::warn!(
                    "Loading the fragment for '{}' timed out after {:?}.",
                    command_name,
                    timeout
                );
                None
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                log::warn!("The dispatch worker for '{}' stopped without a result.", command_name);
                None
            }
        }
    }
}

/// A load that returns without loading the fragment is not a success for the
/// lookup that triggered it.
fn annotate_outcome(outcome: &LoadOutcome, context: &mut EventContext) {
    context.insert("load_outcome".into(), outcome.as_str().into());
    if !outcome.is_loaded() {
        context.insert("outcome".into(), "not_loaded".into());
    }
}

impl CommandNotFoundHandler for Dispatcher {
    fn handle(&self, command_name: &str, args: &mut LookupEventArgs) -> bool {
        self.dispatch(command_name, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::{ENV_AUTO_LOAD, ENV_AUTO_LOAD_TIMEOUT},
        core::{
            config::StaticEnv,
            events::{EventLog, EventLogConfig},
            registry::CommandRegistry,
        },
        models::{CommandType, Severity},
        system::host::{FragmentHost, HostError, SessionScope, SourceReport},
    };
    use std::{fs, path::Path};

    struct Fixture {
        dir: tempfile::TempDir,
        scope: Arc<SessionScope>,
        registry: Arc<CommandRegistry>,
        events: Arc<EventLog>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                scope: Arc::new(SessionScope::new()),
                registry: Arc::new(CommandRegistry::new()),
                events: Arc::new(EventLog::with_seed(
                    EventLogConfig {
                        default_sample_rate: 1.0,
                        ..EventLogConfig::default()
                    },
                    7,
                )),
            }
        }

        fn dispatcher(&self, env: StaticEnv) -> Arc<Dispatcher> {
            let loader = FragmentLoader::new(self.dir.path(), self.registry.clone(), self.scope.clone())
                .with_events(self.events.clone());
            Arc::new(Dispatcher::new(Arc::new(loader), Arc::new(env)))
        }
    }

    #[test]
    fn test_register_is_idempotent() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(StaticEnv::new());
        let chain = HandlerChain::new();

        assert!(dispatcher.register(&chain, false));
        let first = chain.ids();
        assert!(dispatcher.register(&chain, false));
        assert_eq!(chain.ids(), first);
        assert!(dispatcher.is_registered());
    }

    #[test]
    fn test_force_reinstalls_without_duplicating() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(StaticEnv::new());
        let chain = HandlerChain::new();

        dispatcher.register(&chain, false);
        let first = chain.ids();
        assert!(dispatcher.register(&chain, true));
        assert_eq!(chain.len(), 1);
        assert_ne!(chain.ids(), first);
    }

    #[test]
    fn test_register_keeps_existing_handlers_behind_it() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(StaticEnv::new());
        let chain = HandlerChain::new();
        let existing = chain
            .append(Arc::new(|_: &str, _: &mut LookupEventArgs| false))
            .unwrap();

        dispatcher.register(&chain, false);
        let ids = chain.ids();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[1], existing);
    }

    #[test]
    fn test_unregister() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(StaticEnv::new());
        let chain = HandlerChain::new();

        assert!(!dispatcher.unregister(&chain));
        dispatcher.register(&chain, false);
        assert!(dispatcher.unregister(&chain));
        assert!(!dispatcher.is_registered());
        assert!(chain.is_empty());
    }

    #[test]
    fn test_register_fails_when_disabled() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(StaticEnv::new().with(ENV_AUTO_LOAD, "0"));
        let chain = HandlerChain::new();
        assert!(!dispatcher.register(&chain, false));
        assert!(chain.is_empty());
    }

    #[test]
    fn test_unknown_command_is_not_handled() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(StaticEnv::new());
        let mut args = LookupEventArgs::new("foo");

        assert!(!fx.registry.contains("foo"));
        assert!(!dispatcher.dispatch("foo", &mut args));
        assert!(!args.stop_search);
    }

    #[test]
    fn test_registered_command_loads_its_fragment() {
        let fx = Fixture::new();
        fs::write(fx.dir.path().join("FragmentX.ps1"), "function foo { 'hi' }\n").unwrap();
        fx.registry.register("foo", "FragmentX", CommandType::Function);
        let dispatcher = fx.dispatcher(StaticEnv::new());
        let mut args = LookupEventArgs::new("foo");

        assert!(dispatcher.dispatch("foo", &mut args));
        assert!(args.stop_search);
        assert!(dispatcher.loader().is_loaded("FragmentX"));
        assert!(fx.scope.has_command("foo"));

        let events = fx.events.events();
        let event = events.iter().find(|e| e.event_name == DISPATCH_EVENT).unwrap();
        assert_eq!(event.context["command"], "foo");
        assert_eq!(event.context["outcome"], "success");
        assert_eq!(event.context["load_outcome"], "loaded");
    }

    #[test]
    fn test_chain_resolve_runs_dispatcher() {
        let fx = Fixture::new();
        fs::write(fx.dir.path().join("git.ps1"), "function Invoke-Git {}\n").unwrap();
        fx.registry.register("Invoke-Git", "git", CommandType::Function);
        let dispatcher = fx.dispatcher(StaticEnv::new());
        let chain = HandlerChain::new();
        dispatcher.register(&chain, false);

        let args = chain.resolve("Invoke-Git");
        assert!(args.stop_search);
        assert!(fx.scope.has_command("Invoke-Git"));
    }

    #[test]
    fn test_disabled_flag_short_circuits() {
        let fx = Fixture::new();
        fs::write(fx.dir.path().join("git.ps1"), "function Invoke-Git {}\n").unwrap();
        fx.registry.register("Invoke-Git", "git", CommandType::Function);
        let dispatcher = fx.dispatcher(StaticEnv::new().with(ENV_AUTO_LOAD, "0"));
        let mut args = LookupEventArgs::new("Invoke-Git");

        assert!(!dispatcher.dispatch("Invoke-Git", &mut args));
        assert!(!args.stop_search);
        assert_eq!(fx.scope.times_sourced("git"), 0);
    }

    #[test]
    fn test_empty_name_and_missing_fragment() {
        let fx = Fixture::new();
        fx.registry.register("ghost", "nowhere", CommandType::Function);
        let dispatcher = fx.dispatcher(StaticEnv::new());
        let mut args = LookupEventArgs::new("");

        assert!(!dispatcher.dispatch("  ", &mut args));
        assert!(!dispatcher.dispatch("ghost", &mut args));
        assert!(!args.stop_search);
    }

    #[test]
    fn test_unloaded_dispatch_is_not_recorded_as_success() {
        let fx = Fixture::new();
        fx.registry.register("ghost", "nowhere", CommandType::Function);
        let dispatcher = fx.dispatcher(StaticEnv::new());
        let mut args = LookupEventArgs::new("ghost");

        assert!(!dispatcher.dispatch("ghost", &mut args));

        let events = fx.events.events();
        let event = events.iter().find(|e| e.event_name == DISPATCH_EVENT).unwrap();
        assert_eq!(event.context["outcome"], "not_loaded");
        assert_eq!(event.context["load_outcome"], "missing");
        assert_eq!(event.severity_text, Severity::Info);
    }

    #[test]
    fn test_failing_fragment_is_not_handled() {
        let fx = Fixture::new();
        fs::write(fx.dir.path().join("broken.ps1"), "throw 'nope'\n").unwrap();
        fx.registry.register("Invoke-Broken", "broken", CommandType::Function);
        let dispatcher = fx.dispatcher(StaticEnv::new());
        let mut args = LookupEventArgs::new("Invoke-Broken");

        assert!(!dispatcher.dispatch("Invoke-Broken", &mut args));
        assert!(!args.stop_search);
        assert_eq!(fx.events.sampling_stats().error_retention_rate, 1.0);
        assert!(fx.events.sampling_stats().error_count >= 1);
    }

    struct SlowHost;

    impl FragmentHost for SlowHost {
        fn source(&self, _: &str, _: &Path, _: &str) -> Result<SourceReport, HostError> {
            thread::sleep(Duration::from_secs(3));
            Ok(SourceReport::default())
        }

        fn has_command(&self, _: &str) -> bool {
            false
        }
    }

    #[test]
    fn test_timeout_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("slow.ps1"), "function Slow {}\n").unwrap();
        let registry = Arc::new(CommandRegistry::new());
        registry.register("Slow", "slow", CommandType::Function);
        let loader = Arc::new(FragmentLoader::new(dir.path(), registry, Arc::new(SlowHost)));
        let env = StaticEnv::new().with(ENV_AUTO_LOAD_TIMEOUT, "1");
        let dispatcher = Dispatcher::new(loader, Arc::new(env));
        let mut args = LookupEventArgs::new("Slow");

        assert!(!dispatcher.dispatch("Slow", &mut args));
        assert!(!args.stop_search);
    }

    #[test]
    fn test_configured_timeout_applies_without_env() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("slow.ps1"), "function Slow {}\n").unwrap();
        let registry = Arc::new(CommandRegistry::new());
        registry.register("Slow", "slow", CommandType::Function);
        let loader = Arc::new(FragmentLoader::new(dir.path(), registry, Arc::new(SlowHost)));
        let dispatcher = Dispatcher::new(loader, Arc::new(StaticEnv::new()))
            .with_timeout(Duration::from_millis(200));
        let mut args = LookupEventArgs::new("Slow");

        assert!(!dispatcher.dispatch("Slow", &mut args));
    }
}

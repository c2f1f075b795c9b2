//! # Fragment loader
//!
//! Loads fragments into the session scope at most once each, dependencies
//! first. Loading is best effort: every failure comes back as a value, the
//! fragment is marked `Failed` and an ERROR event is written, but nothing on
//! this path panics into the caller.
//!
//! Per-fragment state lives in a mutex-guarded map. A caller that finds a
//! fragment `Loading` does not wait and does not execute it again; it gets
//! [`LoadOutcome::InProgress`]. The same rule breaks dependency cycles.

use crate::{
    constants::FRAGMENT_EXISTS_TTL_SECS,
    core::{
        cache::TtlCache,
        events::{EventLog, EventOptions},
        fingerprint::Fingerprint,
        fragment,
        manifest::FragmentManifest,
        registry::CommandRegistry,
    },
    event_context,
    models::{ErrorDetail, LoadOutcome, LoadState, Severity},
    system::host::{FragmentHost, HostError},
};
use std::{
    collections::HashMap,
    fmt, fs,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use thiserror::Error;

const LOAD_EVENT: &str = "fragment.load";

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("'{0}' is not a valid fragment name.")]
    InvalidName(String),
    #[error("Failed to read fragment '{fragment}' at '{path}': {source}")]
    Read {
        fragment: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("Fragment '{0}' panicked while loading.")]
    Panicked(String),
    #[error("The fragment load-state store is unavailable.")]
    StateUnavailable,
}

#[derive(Debug, Clone, Default)]
struct FragmentRecord {
    state: LoadState,
    fingerprint: Option<Fingerprint>,
}

enum Claim {
    Acquired(LoadState),
    AlreadyLoaded,
    InProgress,
}

pub struct FragmentLoader {
    profile_dir: PathBuf,
    registry: Arc<CommandRegistry>,
    host: Arc<dyn FragmentHost>,
    events: Option<Arc<EventLog>>,
    manifest: FragmentManifest,
    exists_cache: TtlCache<bool>,
    records: Mutex<HashMap<String, FragmentRecord>>,
}

impl fmt::Debug for FragmentLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentLoader")
            .field("profile_dir", &self.profile_dir)
            .field("manifest_entries", &self.manifest.len())
            .field("events", &self.events.is_some())
            .finish()
    }
}

impl FragmentLoader {
    pub fn new(
        profile_dir: impl Into<PathBuf>,
        registry: Arc<CommandRegistry>,
        host: Arc<dyn FragmentHost>,
    ) -> Self {
        Self {
            profile_dir: profile_dir.into(),
            registry,
            host,
            events: None,
            manifest: FragmentManifest::empty(),
            exists_cache: TtlCache::new(),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_events(mut self, events: Arc<EventLog>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_manifest(mut self, manifest: FragmentManifest) -> Self {
        self.manifest = manifest;
        self
    }

    pub fn profile_dir(&self) -> &Path {
        &self.profile_dir
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn events(&self) -> Option<&Arc<EventLog>> {
        self.events.as_ref()
    }

    pub fn manifest(&self) -> &FragmentManifest {
        &self.manifest
    }

    /// Where the fragment's script lives. A manifest `file` wins over the
    /// `<profile dir>/<name>.ps1` convention. Existence is not checked.
    pub fn fragment_path(&self, fragment_name: &str) -> PathBuf {
        let name = fragment_name.trim();
        match self.manifest.file_for(name) {
            Some(file) => file.to_path_buf(),
            None => fragment::fragment_path(&self.profile_dir, name),
        }
    }

    /// Manifest-declared dependencies followed by the script's `# Requires:`
    /// line, de-duplicated in order. Never fails.
    pub fn fragment_dependencies(&self, fragment_name: &str, path: Option<&Path>) -> Vec<String> {
        let name = fragment_name.trim();
        let mut deps: Vec<String> = Vec::new();
        let declared = self
            .manifest
            .requires(name)
            .iter()
            .cloned()
            .chain(fragment::fragment_dependencies(name, path));
        for dep in declared {
            if !dep.eq_ignore_ascii_case(name) && !deps.iter().any(|d| d.eq_ignore_ascii_case(&dep)) {
                deps.push(dep);
            }
        }
        deps
    }

    /// Loads `fragment_name` unless it is already loaded, optionally loading
    /// its dependencies first.
    pub fn load(&self, fragment_name: &str, load_dependencies: bool) -> Result<LoadOutcome, LoadError> {
        self.load_inner(fragment_name, load_dependencies, false)
    }

    /// Executes the fragment body again even if it is already loaded.
    pub fn reload(&self, fragment_name: &str) -> Result<LoadOutcome, LoadError> {
        self.load_inner(fragment_name, true, true)
    }

    /// Loads the fragment that owns `command_name`.
    pub fn load_for_command(&self, command_name: &str) -> Result<LoadOutcome, LoadError> {
        if !self.registry.is_available() {
            log::debug!("Registry unavailable; cannot resolve '{}'.", command_name);
            return Ok(LoadOutcome::NotRegistered);
        }
        match self.registry.fragment_for(command_name) {
            Some(fragment_name) => {
                log::debug!("Command '{}' belongs to fragment '{}'.", command_name, fragment_name);
                self.load(&fragment_name, true)
            }
            None => Ok(LoadOutcome::NotRegistered),
        }
    }

    fn load_inner(&self, fragment_name: &str, load_dependencies: bool, force: bool) -> Result<LoadOutcome, LoadError> {
        let name = fragment_name.trim();
        if !fragment::is_valid_fragment_name(name) {
            return Err(LoadError::InvalidName(fragment_name.to_string()));
        }

        let previous = match self.claim(name, force)? {
            Claim::Acquired(previous) => previous,
            Claim::AlreadyLoaded => {
                log::trace!("Fragment '{}' already loaded.", name);
                return Ok(LoadOutcome::AlreadyLoaded);
            }
            Claim::InProgress => {
                log::debug!("Fragment '{}' is already loading; not executing it again.", name);
                return Ok(LoadOutcome::InProgress);
            }
        };

        // Whatever happens below, the fragment must not stay `Loading`.
        let mut settle = scopeguard::guard(LoadState::Failed, |state| self.set_state(name, state, None));

        let path = self.fragment_path(name);
        if load_dependencies {
            for dep in self.fragment_dependencies(name, Some(&path)) {
                match self.load_inner(&dep, true, false) {
                    Ok(LoadOutcome::Missing) => {
                        log::warn!("Dependency '{}' of fragment '{}' was not found.", dep, name);
                    }
                    Ok(outcome) => log::trace!("Dependency '{}' of '{}': {:?}", dep, name, outcome),
                    Err(e) => log::warn!("Dependency '{}' of fragment '{}' failed: {}", dep, name, e),
                }
            }
        }

        if !self.fragment_exists(&path) {
            log::warn!("Fragment '{}' not found at '{}'.", name, path.display());
            *settle = previous;
            return Ok(LoadOutcome::Missing);
        }

        let start = Instant::now();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(source) => {
                self.exists_cache.clear(&cache_key(&path));
                let error = LoadError::Read {
                    fragment: name.to_string(),
                    path: path.clone(),
                    source,
                };
                self.record_failure(name, &path, &error, start.elapsed());
                return Err(error);
            }
        };

        let sourced = panic::catch_unwind(AssertUnwindSafe(|| self.host.source(name, &path, &content)));
        let report = match sourced {
            Ok(Ok(report)) => report,
            Ok(Err(host_error)) => {
                let error = LoadError::Host(host_error);
                self.record_failure(name, &path, &error, start.elapsed());
                return Err(error);
            }
            Err(_) => {
                let error = LoadError::Panicked(name.to_string());
                self.record_failure(name, &path, &error, start.elapsed());
                return Err(error);
            }
        };

        for registration in &report.registrations {
            self.registry.register(
                &registration.command_name,
                &registration.fragment_name,
                registration.command_type,
            );
        }

        scopeguard::ScopeGuard::into_inner(settle);
        let fingerprint = Fingerprint::of_content(&path, content.as_bytes()).ok();
        self.set_state(name, LoadState::Loaded, fingerprint);

        let elapsed = start.elapsed();
        log::info!("Loaded fragment '{}' in {:?}.", name, elapsed);
        if let Some(events) = &self.events {
            events.write_event(
                LOAD_EVENT,
                Severity::Info,
                event_context! {
                    "fragment" => name,
                    "path" => path.display().to_string(),
                    "defined" => report.defined.len(),
                    "registered" => report.registrations.len(),
                    "forced" => force,
                },
                EventOptions::new().duration(elapsed),
            );
        }
        Ok(LoadOutcome::Loaded)
    }

    fn claim(&self, name: &str, force: bool) -> Result<Claim, LoadError> {
        let mut records = self.records.lock().map_err(|_| LoadError::StateUnavailable)?;
        let record = records.entry(name.to_string()).or_default();
        match record.state {
            LoadState::Loading => Ok(Claim::InProgress),
            LoadState::Loaded if !force => Ok(Claim::AlreadyLoaded),
            previous => {
                record.state = LoadState::Loading;
                Ok(Claim::Acquired(previous))
            }
        }
    }

    fn set_state(&self, name: &str, state: LoadState, fingerprint: Option<Fingerprint>) {
        let Ok(mut records) = self.records.lock() else {
            log::warn!("Load-state store unavailable; '{}' not marked {}.", name, state);
            return;
        };
        let record = records.entry(name.to_string()).or_default();
        record.state = state;
        if state == LoadState::Loaded {
            record.fingerprint = fingerprint;
        }
    }

    fn fragment_exists(&self, path: &Path) -> bool {
        self.exists_cache.get_or_insert_with(
            &cache_key(path),
            Duration::from_secs(FRAGMENT_EXISTS_TTL_SECS),
            || path.is_file(),
        )
    }

    fn record_failure(&self, name: &str, path: &Path, error: &LoadError, elapsed: Duration) {
        log::error!("Failed to load fragment '{}': {}", name, error);
        if let Some(events) = &self.events {
            let mut context = event_context! {
                "fragment" => name,
                "path" => path.display().to_string(),
            };
            context.insert("duration_ms".into(), (elapsed.as_secs_f64() * 1000.0).into());
            events.write_structured_error(ErrorDetail::from_error(error), LOAD_EVENT, context, None, false);
        }
    }

    /// True if the fragment has been loaded. When the state store is
    /// unavailable, asks the host whether every command registered for the
    /// fragment is defined instead.
    pub fn is_loaded(&self, fragment_name: &str) -> bool {
        let name = fragment_name.trim();
        match self.records.lock() {
            Ok(records) => records.get(name).is_some_and(|r| r.state == LoadState::Loaded),
            Err(_) => {
                let commands = self.registry.commands_for(name);
                !commands.is_empty() && commands.iter().all(|c| self.host.has_command(c))
            }
        }
    }

    pub fn state(&self, fragment_name: &str) -> LoadState {
        self.records
            .lock()
            .ok()
            .and_then(|r| r.get(fragment_name.trim()).map(|rec| rec.state))
            .unwrap_or_default()
    }

    /// Every fragment the loader has seen, with its state, sorted by name.
    pub fn states(&self) -> Vec<(String, LoadState)> {
        let Ok(records) = self.records.lock() else {
            return Vec::new();
        };
        let mut all: Vec<(String, LoadState)> = records.iter().map(|(n, r)| (n.clone(), r.state)).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn loaded_fragments(&self) -> Vec<String> {
        self.states()
            .into_iter()
            .filter(|(_, state)| *state == LoadState::Loaded)
            .map(|(name, _)| name)
            .collect()
    }

    /// Re-sources every loaded fragment whose file changed since it was loaded.
    pub fn reload_changed(&self) -> Vec<(String, Result<LoadOutcome, LoadError>)> {
        let changed: Vec<String> = match self.records.lock() {
            Ok(records) => {
                let mut changed: Vec<String> = records
                    .iter()
                    .filter(|(_, r)| r.state == LoadState::Loaded)
                    .filter(|(name, r)| {
                        r.fingerprint
                            .as_ref()
                            .is_some_and(|fp| fp.is_stale(&self.fragment_path(name)))
                    })
                    .map(|(name, _)| name.clone())
                    .collect();
                changed.sort();
                changed
            }
            Err(_) => return Vec::new(),
        };

        changed
            .into_iter()
            .map(|name| {
                log::info!("Fragment '{}' changed on disk; reloading.", name);
                let result = self.load_inner(&name, false, true);
                (name, result)
            })
            .collect()
    }

    /// Forgets cached file-existence checks.
    pub fn invalidate_cache(&self) {
        self.exists_cache.clear_all();
    }
}

fn cache_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::events::EventLogConfig,
        models::{CommandType, RetentionReason},
        system::host::{SessionScope, SourceReport},
    };

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
                events: Arc::new(EventLog::with_seed(EventLogConfig::default(), 1)),
            }
        }

        fn write(&self, name: &str, content: &str) {
            fs::write(self.dir.path().join(format!("{}.ps1", name)), content).unwrap();
        }

        fn loader(&self) -> FragmentLoader {
            FragmentLoader::new(self.dir.path(), self.registry.clone(), self.scope.clone())
                .with_events(self.events.clone())
        }
    }

    #[test]
    fn test_fragment_path_is_deterministic() {
        let fx = Fixture::new();
        let loader = fx.loader();
        assert_eq!(loader.fragment_path("git"), fx.dir.path().join("git.ps1"));
        assert_eq!(loader.fragment_path(" git "), fx.dir.path().join("git.ps1"));
    }

    #[test]
    fn test_load_round_trip_does_not_re_execute() {
        let fx = Fixture::new();
        fx.write("git", "function Invoke-Git { git @args }\n");
        let loader = fx.loader();

        assert_eq!(loader.load("git", true).unwrap(), LoadOutcome::Loaded);
        assert!(loader.is_loaded("git"));
        assert_eq!(loader.load("git", true).unwrap(), LoadOutcome::AlreadyLoaded);
        assert_eq!(fx.scope.times_sourced("git"), 1);
        assert!(fx.scope.has_command("Invoke-Git"));
    }

    #[test]
    fn test_dependencies_load_first_in_declaration_order() {
        let fx = Fixture::new();
        fx.write("a", "# Requires: b, c\nfunction A {}\n");
        fx.write("b", "function B {}\n");
        fx.write("c", "# Requires: b\nfunction C {}\n");
        let loader = fx.loader();

        assert_eq!(loader.load("a", true).unwrap(), LoadOutcome::Loaded);
        assert_eq!(fx.scope.execution_order(), vec!["b", "c", "a"]);
        assert_eq!(loader.loaded_fragments(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_without_dependencies_only_target_runs() {
        let fx = Fixture::new();
        fx.write("a", "# Requires: b\nfunction A {}\n");
        fx.write("b", "function B {}\n");
        let loader = fx.loader();

        loader.load("a", false).unwrap();
        assert_eq!(fx.scope.execution_order(), vec!["a"]);
    }

    #[test]
    fn test_dependency_cycle_terminates() {
        let fx = Fixture::new();
        fx.write("a", "# Requires: b\n");
        fx.write("b", "# Requires: a\n");
        let loader = fx.loader();

        assert_eq!(loader.load("a", true).unwrap(), LoadOutcome::Loaded);
        assert_eq!(fx.scope.execution_order(), vec!["b", "a"]);
    }

    #[test]
    fn test_missing_fragment_stays_not_loaded() {
        let fx = Fixture::new();
        let loader = fx.loader();

        assert_eq!(loader.load("nope", true).unwrap(), LoadOutcome::Missing);
        assert_eq!(loader.state("nope"), LoadState::NotLoaded);
        assert!(!loader.is_loaded("nope"));
    }

    #[test]
    fn test_failing_fragment_is_marked_failed_with_event() {
        let fx = Fixture::new();
        fx.write("broken", "function Half {}\nthrow 'boom'\n");
        let loader = fx.loader();

        let result = loader.load("broken", true);
        assert!(matches!(result, Err(LoadError::Host(HostError::Threw { .. }))));
        assert_eq!(loader.state("broken"), LoadState::Failed);

        let events = fx.events.events();
        let event = events.iter().find(|e| e.event_name == LOAD_EVENT).unwrap();
        assert_eq!(event.retention_reason, RetentionReason::Error);
        assert_eq!(event.context["fragment"], "broken");
    }

    #[test]
    fn test_failed_fragment_can_be_retried() {
        let fx = Fixture::new();
        fx.write("flaky", "throw 'first'\n");
        let loader = fx.loader();
        assert!(loader.load("flaky", true).is_err());

        fx.write("flaky", "function Flaky {}\n");
        assert_eq!(loader.load("flaky", true).unwrap(), LoadOutcome::Loaded);
    }

    #[test]
    fn test_failed_dependency_does_not_block_target() {
        let fx = Fixture::new();
        fx.write("app", "# Requires: broken\nfunction App {}\n");
        fx.write("broken", "throw 'no'\n");
        let loader = fx.loader();

        assert_eq!(loader.load("app", true).unwrap(), LoadOutcome::Loaded);
        assert_eq!(loader.state("broken"), LoadState::Failed);
    }

    #[test]
    fn test_invalid_name_is_rejected() {
        let fx = Fixture::new();
        let loader = fx.loader();
        assert!(matches!(loader.load("../etc/passwd", true), Err(LoadError::InvalidName(_))));
    }

    #[test]
    fn test_load_for_command_uses_registry() {
        let fx = Fixture::new();
        fx.write("git", "function Invoke-Git {}\n");
        let loader = fx.loader();

        assert_eq!(loader.load_for_command("Invoke-Git").unwrap(), LoadOutcome::NotRegistered);
        fx.registry.register("Invoke-Git", "git", CommandType::Function);
        assert_eq!(loader.load_for_command("Invoke-Git").unwrap(), LoadOutcome::Loaded);
    }

    #[test]
    fn test_fragment_registrations_reach_registry() {
        let fx = Fixture::new();
        fx.write("bootstrap", "Register-FragmentCommand Invoke-Aws cloud\n");
        let loader = fx.loader();

        loader.load("bootstrap", true).unwrap();
        assert_eq!(fx.registry.fragment_for("Invoke-Aws").as_deref(), Some("cloud"));
    }

    #[test]
    fn test_reload_re_executes() {
        let fx = Fixture::new();
        fx.write("git", "function Invoke-Git {}\n");
        let loader = fx.loader();

        loader.load("git", true).unwrap();
        assert_eq!(loader.reload("git").unwrap(), LoadOutcome::Loaded);
        assert_eq!(fx.scope.times_sourced("git"), 2);
    }

    #[test]
    fn test_reload_changed_only_touches_changed_files() {
        let fx = Fixture::new();
        fx.write("git", "function Invoke-Git {}\n");
        fx.write("docker", "function Invoke-Docker {}\n");
        let loader = fx.loader();
        loader.load("git", true).unwrap();
        loader.load("docker", true).unwrap();

        fx.write("git", "function Invoke-Git {}\nfunction Get-GitRoot {}\n");
        let reloaded = loader.reload_changed();

        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].0, "git");
        assert!(fx.scope.has_command("Get-GitRoot"));
        assert_eq!(fx.scope.times_sourced("docker"), 1);
    }

    #[test]
    fn test_manifest_file_and_dependencies_are_honored() {
        let fx = Fixture::new();
        fs::create_dir(fx.dir.path().join("core")).unwrap();
        fs::write(fx.dir.path().join("core").join("base.ps1"), "function Base {}\n").unwrap();
        fx.write("git", "function Invoke-Git {}\n");
        let manifest = FragmentManifest::parse(
            "[fragments.base]\nfile = \"core/base.ps1\"\n[fragments.git]\nrequires = [\"base\"]\n",
            &fx.dir.path().join("fragments.toml"),
        )
        .unwrap();
        let loader = fx.loader().with_manifest(manifest);

        assert_eq!(loader.fragment_dependencies("git", None), vec!["base"]);
        loader.load("git", true).unwrap();
        assert_eq!(fx.scope.execution_order(), vec!["base", "git"]);
    }

    struct PanickingHost;

    impl FragmentHost for PanickingHost {
        fn source(&self, _: &str, _: &Path, _: &str) -> Result<SourceReport, HostError> {
            panic!("host exploded");
        }

        fn has_command(&self, _: &str) -> bool {
            false
        }
    }

    #[test]
    fn test_host_panic_marks_failed() {
        let fx = Fixture::new();
        fx.write("boom", "function Boom {}\n");
        let loader = FragmentLoader::new(fx.dir.path(), fx.registry.clone(), Arc::new(PanickingHost));

        assert!(matches!(loader.load("boom", true), Err(LoadError::Panicked(_))));
        assert_eq!(loader.state("boom"), LoadState::Failed);
    }

    #[test]
    fn test_is_loaded_falls_back_to_host_when_state_is_poisoned() {
        let fx = Fixture::new();
        fx.write("git", "function Invoke-Git {}\n");
        fx.registry.register("Invoke-Git", "git", CommandType::Function);
        let loader = Arc::new(fx.loader());
        loader.load("git", true).unwrap();

        let poisoner = loader.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.records.lock().unwrap();
            panic!("poison the load-state store");
        })
        .join();

        assert!(loader.is_loaded("git"));
        assert!(!loader.is_loaded("docker"));
        assert!(matches!(loader.load("git", true), Err(LoadError::StateUnavailable)));
    }

    #[derive(Default)]
    struct CountingHost {
        sourced: std::sync::atomic::AtomicUsize,
    }

    impl FragmentHost for CountingHost {
        fn source(&self, _: &str, _: &Path, _: &str) -> Result<SourceReport, HostError> {
            self.sourced.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
            Ok(SourceReport::default())
        }

        fn has_command(&self, _: &str) -> bool {
            false
        }
    }

    #[test]
    fn test_concurrent_loads_execute_fragment_once() {
        let fx = Fixture::new();
        fx.write("shared", "function Invoke-Shared {}\n");
        let host = Arc::new(CountingHost::default());
        let loader = Arc::new(FragmentLoader::new(fx.dir.path(), fx.registry.clone(), host.clone()));
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let loader = loader.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    loader.load("shared", false).unwrap()
                })
            })
            .collect();
        let outcomes: Vec<LoadOutcome> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        let loaded = outcomes.iter().filter(|o| **o == LoadOutcome::Loaded).count();
        assert_eq!(loaded, 1, "outcomes: {:?}", outcomes);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, LoadOutcome::Loaded | LoadOutcome::InProgress | LoadOutcome::AlreadyLoaded)));
        assert_eq!(host.sourced.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(loader.state("shared"), LoadState::Loaded);
    }
}

//! # Wide events
//!
//! A process-wide, ordered collection of structured event records with
//! OpenTelemetry-style fields, filtered by tail-based sampling:
//!
//! 1. Events carrying an error, or written at `ERROR`/`FATAL`, are always kept.
//! 2. Events flagged `always_keep` are kept (reason `explicit`).
//! 3. Events whose duration reaches the slow threshold are always kept.
//! 4. Everything else is kept with probability `sample_rate`.
//!
//! Dropped events are counted but never stored. Failures inside the log
//! itself (a poisoned lock) are swallowed: writing an event must never break
//! the operation being observed. [`EventLog::run_with_event`] is the one
//! place that propagates an error, and it is always the wrapped body's own.

use crate::{
    constants::{DEFAULT_SAMPLE_RATE, DEFAULT_SERVICE_NAME, DEFAULT_SLOW_THRESHOLD_MS},
    core::config::ProfileConfig,
    models::{
        ErrorDetail, EventContext, Invocation, RetentionReason, Severity, StatusCode, WideEvent,
    },
};
use chrono::Utc;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Serialize;
use std::{
    fmt,
    panic::Location,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use uuid::Uuid;

const LOG_TARGET: &str = "psprofile::events";

/// Sampling parameters for an [`EventLog`].
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    pub service_name: String,
    /// Events at or above this duration are always kept.
    pub slow_threshold_ms: u64,
    /// Retention probability used when a call does not pass its own rate.
    pub default_sample_rate: f64,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            slow_threshold_ms: DEFAULT_SLOW_THRESHOLD_MS,
            default_sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

impl EventLogConfig {
    pub fn from_profile(config: &ProfileConfig) -> Self {
        Self {
            service_name: config.service_name.clone(),
            slow_threshold_ms: config.slow_threshold_ms,
            default_sample_rate: config.sample_rate,
        }
    }
}

/// Optional inputs to [`EventLog::write_event`].
#[derive(Debug, Clone, Default)]
pub struct EventOptions {
    pub duration_ms: Option<f64>,
    pub error: Option<ErrorDetail>,
    /// Overrides the log's default sample rate for this event.
    pub sample_rate: Option<f64>,
    pub always_keep: bool,
}

impl EventOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn duration(mut self, elapsed: Duration) -> Self {
        self.duration_ms = Some(elapsed.as_secs_f64() * 1000.0);
        self
    }

    pub fn duration_ms(mut self, ms: f64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn error(mut self, error: ErrorDetail) -> Self {
        self.error = Some(error);
        self
    }

    pub fn sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = Some(rate);
        self
    }

    pub fn keep(mut self) -> Self {
        self.always_keep = true;
        self
    }
}

/// Aggregate counters for diagnostics.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SamplingStats {
    pub total_events: u64,
    pub kept_events: u64,
    pub dropped_events: u64,
    pub error_count: u64,
    pub errors_kept: u64,
    pub slow_events: u64,
    /// Events that were not sampled out but could not be stored.
    pub store_failures: u64,
    /// Events currently held in the collection.
    pub stored_events: usize,
    /// `errors_kept / error_count`; 1.0 when no error was written.
    pub error_retention_rate: f64,
    /// `kept_events / total_events`; 0.0 when nothing was written.
    pub kept_ratio: f64,
    pub sample_rate: f64,
    pub slow_threshold_ms: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    kept: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    errors_kept: AtomicU64,
    slow: AtomicU64,
    store_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// The wide-event collection.
pub struct EventLog {
    config: EventLogConfig,
    session_id: Uuid,
    events: Mutex<Vec<WideEvent>>,
    rng: Mutex<StdRng>,
    counters: Counters,
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("config", &self.config)
            .field("session_id", &self.session_id)
            .field("counters", &self.counters)
            .finish()
    }
}

impl EventLog {
    pub fn new(config: EventLogConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// A log whose sampling draws are reproducible.
    pub fn with_seed(config: EventLogConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: EventLogConfig, rng: StdRng) -> Self {
        Self {
            config,
            session_id: Uuid::new_v4(),
            events: Mutex::new(Vec::new()),
            rng: Mutex::new(rng),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &EventLogConfig {
        &self.config
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Records an event, subject to tail sampling. Returns whether it was kept.
    #[track_caller]
    pub fn write_event(
        &self,
        event_name: &str,
        severity: Severity,
        context: EventContext,
        options: EventOptions,
    ) -> bool {
        self.write_at(event_name, severity, context, options, Location::caller())
    }

    /// Records an `ERROR` event for a failed operation. Always kept.
    #[track_caller]
    pub fn write_structured_error(
        &self,
        error: ErrorDetail,
        operation_name: &str,
        mut context: EventContext,
        status_code: Option<i64>,
        retriable: bool,
    ) -> bool {
        context.insert("operation_name".into(), operation_name.into());
        context.insert(
            "status_code".into(),
            status_code.map_or(serde_json::Value::Null, Into::into),
        );
        context.insert("retriable".into(), retriable.into());
        self.write_at(
            operation_name,
            Severity::Error,
            context,
            EventOptions::new().error(error),
            Location::caller(),
        )
    }

    /// Records a `WARN` event. Sampled like any other non-error event.
    #[track_caller]
    pub fn write_structured_warning(
        &self,
        message: &str,
        operation_name: &str,
        mut context: EventContext,
        code: Option<&str>,
    ) -> bool {
        context.insert("operation_name".into(), operation_name.into());
        context.insert("message".into(), message.into());
        if let Some(code) = code {
            context.insert("code".into(), code.into());
        }
        self.write_at(
            operation_name,
            Severity::Warn,
            context,
            EventOptions::new(),
            Location::caller(),
        )
    }

    /// Runs `body`, records its outcome and duration, and returns its result
    /// unchanged. A failing body is recorded as an error and its error is
    /// handed back to the caller as-is.
    #[track_caller]
    pub fn run_with_event<T, E, F>(
        &self,
        operation_name: &str,
        context: EventContext,
        body: F,
    ) -> Result<T, E>
    where
        E: fmt::Display,
        F: FnOnce() -> Result<T, E>,
    {
        self.run_with_event_annotated(operation_name, context, body, |_, _| {})
    }

    /// Like [`EventLog::run_with_event`], but lets `annotate` add to the
    /// context of a successful run before it is written. Keys it sets,
    /// `outcome` included, override the defaults.
    #[track_caller]
    pub fn run_with_event_annotated<T, E, F, A>(
        &self,
        operation_name: &str,
        mut context: EventContext,
        body: F,
        annotate: A,
    ) -> Result<T, E>
    where
        E: fmt::Display,
        F: FnOnce() -> Result<T, E>,
        A: FnOnce(&T, &mut EventContext),
    {
        let caller = Location::caller();
        let start = Instant::now();
        let result = body();
        let options = EventOptions::new().duration(start.elapsed());

        match &result {
            Ok(value) => {
                context.insert("outcome".into(), "success".into());
                annotate(value, &mut context);
                self.write_at(operation_name, Severity::Info, context, options, caller);
            }
            Err(e) => {
                context.insert("outcome".into(), "error".into());
                let options = options.error(ErrorDetail::from_error(e));
                self.write_at(operation_name, Severity::Error, context, options, caller);
            }
        }
        result
    }

    fn write_at(
        &self,
        event_name: &str,
        severity: Severity,
        context: EventContext,
        options: EventOptions,
        caller: &Location<'_>,
    ) -> bool {
        Counters::bump(&self.counters.total);

        let is_error = options.error.is_some() || severity.is_error();
        let reason = self.retention_reason(is_error, &options);

        if reason == RetentionReason::Dropped {
            Counters::bump(&self.counters.dropped);
            log::trace!(target: LOG_TARGET, "Dropped event '{}' by sampling.", event_name);
            return false;
        }

        let event = WideEvent {
            timestamp: Utc::now(),
            event_name: event_name.to_string(),
            service_name: self.config.service_name.clone(),
            severity_text: severity,
            severity_number: severity.number(),
            status_code: if is_error {
                StatusCode::Error
            } else {
                StatusCode::Ok
            },
            duration_ms: options.duration_ms,
            retention_reason: reason,
            error: options.error,
            invocation: Invocation {
                caller: format!("{}:{}", caller.file(), caller.line()),
                runtime_version: format!("psprofile {}", env!("CARGO_PKG_VERSION")),
                session_id: self.session_id.to_string(),
                pid: std::process::id(),
            },
            context,
        };
        mirror_to_log(&event);

        let Ok(mut events) = self.events.lock() else {
            Counters::bump(&self.counters.store_failures);
            log::warn!(target: LOG_TARGET, "Event store unavailable; '{}' was not kept.", event_name);
            return false;
        };
        events.push(event);
        drop(events);

        Counters::bump(&self.counters.kept);
        if is_error {
            // Only stored errors are counted.
            Counters::bump(&self.counters.errors);
            Counters::bump(&self.counters.errors_kept);
        }
        if reason == RetentionReason::Slow {
            Counters::bump(&self.counters.slow);
        }
        true
    }

    fn retention_reason(&self, is_error: bool, options: &EventOptions) -> RetentionReason {
        if is_error {
            return RetentionReason::Error;
        }
        if options.always_keep {
            return RetentionReason::Explicit;
        }
        let threshold = self.config.slow_threshold_ms as f64;
        if options.duration_ms.is_some_and(|d| d >= threshold) {
            return RetentionReason::Slow;
        }

        let rate = sanitize_rate(
            options.sample_rate.unwrap_or(self.config.default_sample_rate),
            self.config.default_sample_rate,
        );
        let draw: f64 = match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0.0..1.0),
            Err(_) => 0.0,
        };
        if draw < rate {
            RetentionReason::Sampled
        } else {
            RetentionReason::Dropped
        }
    }

    /// A snapshot of the retained events, oldest first.
    pub fn events(&self) -> Vec<WideEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the collection and returns how many events were removed.
    pub fn clear_events(&self) -> usize {
        self.events
            .lock()
            .map(|mut e| {
                let count = e.len();
                e.clear();
                count
            })
            .unwrap_or(0)
    }

    pub fn sampling_stats(&self) -> SamplingStats {
        let total = Counters::get(&self.counters.total);
        let kept = Counters::get(&self.counters.kept);
        let errors = Counters::get(&self.counters.errors);
        let errors_kept = Counters::get(&self.counters.errors_kept);
        SamplingStats {
            total_events: total,
            kept_events: kept,
            dropped_events: Counters::get(&self.counters.dropped),
            error_count: errors,
            errors_kept,
            slow_events: Counters::get(&self.counters.slow),
            store_failures: Counters::get(&self.counters.store_failures),
            stored_events: self.len(),
            error_retention_rate: if errors == 0 {
                1.0
            } else {
                errors_kept as f64 / errors as f64
            },
            kept_ratio: if total == 0 {
                0.0
            } else {
                kept as f64 / total as f64
            },
            sample_rate: self.config.default_sample_rate,
            slow_threshold_ms: self.config.slow_threshold_ms,
        }
    }
}

/// NaN falls back to the default; everything else is clamped into `[0, 1]`.
fn sanitize_rate(rate: f64, default: f64) -> f64 {
    let rate = if rate.is_nan() { default } else { rate };
    rate.clamp(0.0, 1.0)
}

fn mirror_to_log(event: &WideEvent) {
    let level = event.severity_text.log_level();
    if !log::log_enabled!(target: LOG_TARGET, level) {
        return;
    }
    let context = serde_json::to_string(&event.context).unwrap_or_default();
    match (&event.error, event.duration_ms) {
        (Some(err), _) => log::log!(
            target: LOG_TARGET,
            level,
            "{} [{:?}] {}: {} {}",
            event.event_name,
            event.retention_reason,
            err.kind,
            err.message,
            context
        ),
        (None, Some(ms)) => log::log!(
            target: LOG_TARGET,
            level,
            "{} [{:?}] {:.1}ms {}",
            event.event_name,
            event.retention_reason,
            ms,
            context
        ),
        (None, None) => log::log!(
            target: LOG_TARGET,
            level,
            "{} [{:?}] {}",
            event.event_name,
            event.retention_reason,
            context
        ),
    }
}

/// Builds an [`EventContext`] from `key => value` pairs.
#[macro_export]
macro_rules! event_context {
    () => { $crate::models::EventContext::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut context = $crate::models::EventContext::new();
        $( context.insert(($key).to_string(), ::serde_json::json!($value)); )+
        context
    }};
}

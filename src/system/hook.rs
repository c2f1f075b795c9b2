// src/system/hook.rs

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

/// Per-lookup state handed to every handler in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupEventArgs {
    pub command_name: String,
    /// Set by a handler to tell the host to retry resolution and stop asking
    /// the remaining handlers.
    pub stop_search: bool,
}

impl LookupEventArgs {
    pub fn new(command_name: impl Into<String>) -> Self {
        Self {
            command_name: command_name.into(),
            stop_search: false,
        }
    }
}

/// A fallback resolver consulted when a command lookup fails.
///
/// Returns whether it handled the lookup. Implementations must not panic.
pub trait CommandNotFoundHandler: Send + Sync {
    fn handle(&self, command_name: &str, args: &mut LookupEventArgs) -> bool;
}

impl<F> CommandNotFoundHandler for F
where
    F: Fn(&str, &mut LookupEventArgs) -> bool + Send + Sync,
{
    fn handle(&self, command_name: &str, args: &mut LookupEventArgs) -> bool {
        self(command_name, args)
    }
}

/// Identifies one installation of a handler in a [`HandlerChain`].
pub type HandlerId = u64;

/// The command-not-found extension point: an ordered list of handlers tried
/// front to back until one sets `stop_search`.
#[derive(Default)]
pub struct HandlerChain {
    handlers: Mutex<Vec<(HandlerId, Arc<dyn CommandNotFoundHandler>)>>,
    next_id: AtomicU64,
}

impl fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerChain")
            .field("len", &self.len())
            .finish()
    }
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, handler: Arc<dyn CommandNotFoundHandler>, front: bool) -> Option<HandlerId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut handlers = self.handlers.lock().ok()?;
        if front {
            handlers.insert(0, (id, handler));
        } else {
            handlers.push((id, handler));
        }
        Some(id)
    }

    /// Installs `handler` ahead of every existing one. `None` if the chain is unavailable.
    pub fn prepend(&self, handler: Arc<dyn CommandNotFoundHandler>) -> Option<HandlerId> {
        self.insert(handler, true)
    }

    /// Installs `handler` after every existing one. `None` if the chain is unavailable.
    pub fn append(&self, handler: Arc<dyn CommandNotFoundHandler>) -> Option<HandlerId> {
        self.insert(handler, false)
    }

    /// Removes one installation. Returns `false` if it was not in the chain.
    pub fn remove(&self, id: HandlerId) -> bool {
        let Ok(mut handlers) = self.handlers.lock() else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn contains(&self, id: HandlerId) -> bool {
        self.handlers
            .lock()
            .map(|h| h.iter().any(|(existing, _)| *existing == id))
            .unwrap_or(false)
    }

    /// Installation ids, front first.
    pub fn ids(&self) -> Vec<HandlerId> {
        self.handlers
            .lock()
            .map(|h| h.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the chain for a failed lookup of `command_name`.
    ///
    /// The handler list is snapshotted first, so a handler may modify the
    /// chain (or trigger a nested lookup) without deadlocking.
    pub fn resolve(&self, command_name: &str) -> LookupEventArgs {
        let mut args = LookupEventArgs::new(command_name);
        let snapshot: Vec<(HandlerId, Arc<dyn CommandNotFoundHandler>)> = match self.handlers.lock() {
            Ok(handlers) => handlers.clone(),
            Err(_) => return args,
        };

        for (id, handler) in snapshot {
            let handled = handler.handle(command_name, &mut args);
            log::trace!(
                "Not-found handler #{} for '{}': handled={}, stop_search={}",
                id,
                command_name,
                handled,
                args.stop_search
            );
            if args.stop_search {
                break;
            }
        }
        args
    }
}

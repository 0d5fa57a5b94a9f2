//! Per-instance event emitter.
//!
//! Listeners are fallible; a failing listener is logged and never prevents
//! the remaining listeners from running.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::error::BrokerError;
use crate::value::PropValue;

/// Lifecycle and activity events observable on an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Render,
    Rendered,
    Prerender,
    Prerendered,
    Display,
    Close,
    Destroy,
    Error,
    Resize,
    Focus,
    Props,
    Show,
    Hide,
}

/// A registered listener.
pub type EventListener = Arc<dyn Fn(&PropValue) -> Result<(), BrokerError> + Send + Sync>;

/// Token returned by `on`/`once`, accepted by `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSubscription {
    kind: EventKind,
    id: u64,
}

struct Entry {
    id: u64,
    once: bool,
    listener: EventListener,
}

#[derive(Default)]
struct EmitterState {
    next_id: u64,
    listeners: HashMap<EventKind, Vec<Entry>>,
}

/// Shared event fan-out; clones observe the same listener set.
#[derive(Clone, Default)]
pub struct EventEmitter {
    state: Arc<Mutex<EmitterState>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> EventSubscription
    where
        F: Fn(&PropValue) -> Result<(), BrokerError> + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(listener), false)
    }

    pub fn once<F>(&self, kind: EventKind, listener: F) -> EventSubscription
    where
        F: Fn(&PropValue) -> Result<(), BrokerError> + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(listener), true)
    }

    fn subscribe(&self, kind: EventKind, listener: EventListener, once: bool) -> EventSubscription {
        let mut state = self.state.lock().expect("emitter lock");
        state.next_id += 1;
        let id = state.next_id;
        state
            .listeners
            .entry(kind)
            .or_default()
            .push(Entry { id, once, listener });
        EventSubscription { kind, id }
    }

    pub fn off(&self, sub: EventSubscription) {
        let mut state = self.state.lock().expect("emitter lock");
        if let Some(entries) = state.listeners.get_mut(&sub.kind) {
            entries.retain(|e| e.id != sub.id);
        }
    }

    /// Invoke every listener for `kind` with `payload`. Listener failures
    /// are routed to the log sink, never to the caller.
    pub fn emit(&self, kind: EventKind, payload: &PropValue) {
        let to_run: Vec<EventListener> = {
            let mut state = self.state.lock().expect("emitter lock");
            match state.listeners.get_mut(&kind) {
                Some(entries) => {
                    let run = entries.iter().map(|e| e.listener.clone()).collect();
                    entries.retain(|e| !e.once);
                    run
                }
                None => Vec::new(),
            }
        };
        // Listeners run outside the lock; they may re-subscribe.
        for listener in to_run {
            if let Err(e) = listener(payload) {
                error!(event = ?kind, error = %e, "event listener failed");
            }
        }
    }

    pub fn remove_all_listeners(&self, kind: Option<EventKind>) {
        let mut state = self.state.lock().expect("emitter lock");
        match kind {
            Some(kind) => {
                state.listeners.remove(&kind);
            }
            None => state.listeners.clear(),
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.state
            .lock()
            .expect("emitter lock")
            .listeners
            .get(&kind)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

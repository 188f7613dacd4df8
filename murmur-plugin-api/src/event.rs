//! Event and handler types shared between plugins and the host bus

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PluginError;

/// Dispatch priority for event handlers. Higher priorities run first;
/// ties preserve subscription order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
}

/// A single event flowing through the bus.
///
/// The cancelled flag is shared between clones, so a handler that receives
/// its own copy of the event can still stop delivery to later handlers.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event name, e.g. `plugin.loaded`
    pub name: String,
    /// Opaque payload
    pub payload: Value,
    /// Identifier of the emitter, if known
    pub source: Option<String>,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Free-form metadata, matched by handler conditions
    pub metadata: HashMap<String, Value>,
    cancelled: Arc<AtomicBool>,
}

impl Event {
    /// Create an event with the given name and payload.
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            source: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Builder: set the emitting source identifier.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Builder: set the metadata map.
    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Stop delivery of this event to the remaining handlers.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether a handler has cancelled this event.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Result produced by a single handler invocation
pub type HandlerResult = Result<Value, PluginError>;

/// Boxed future returned by a handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// An event handler callback. Receives its own clone of the event
/// (sharing the cancelled flag) and produces a result asynchronously.
pub type HandlerFn = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into a [`HandlerFn`].
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// A handler registration a plugin declares to the host.
///
/// Returned from `Plugin::declare_handlers` and registered with the bus
/// by the manager after `initialize`. The `event` name `"*"` subscribes
/// to every event.
#[derive(Clone)]
pub struct HandlerSpec {
    /// Event name to subscribe to, or `"*"` for all events
    pub event: String,
    /// Dispatch priority
    pub priority: EventPriority,
    /// Deregister after the first invocation
    pub once: bool,
    /// Delivery conditions matched against the event's source and
    /// metadata. A failing condition skips the handler silently.
    pub conditions: HashMap<String, Value>,
    /// The callback itself
    pub handler: HandlerFn,
}

impl HandlerSpec {
    /// Create a spec with default priority and no conditions.
    pub fn new<F, Fut>(event: impl Into<String>, f: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            event: event.into(),
            priority: EventPriority::Normal,
            once: false,
            conditions: HashMap::new(),
            handler: handler(f),
        }
    }

    /// Builder: set the priority.
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: deregister after the first invocation.
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    /// Builder: add a delivery condition. The key `"source"` matches the
    /// event source; any other key matches the event metadata.
    pub fn with_condition(mut self, key: impl Into<String>, value: Value) -> Self {
        self.conditions.insert(key.into(), value);
        self
    }

    /// Evaluate this spec's conditions against an event.
    pub fn matches(&self, event: &Event) -> bool {
        for (key, expected) in &self.conditions {
            if key == "source" {
                let matched = event
                    .source
                    .as_ref()
                    .is_some_and(|s| Value::String(s.clone()) == *expected);
                if !matched {
                    return false;
                }
            } else {
                match event.metadata.get(key) {
                    Some(actual) if actual == expected => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

impl std::fmt::Debug for HandlerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSpec")
            .field("event", &self.event)
            .field("priority", &self.priority)
            .field("once", &self.once)
            .field("conditions", &self.conditions)
            .finish_non_exhaustive()
    }
}

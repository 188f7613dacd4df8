//! Local, per-instance event handlers
//!
//! Plugins can keep their own handler table and dispatch to it with
//! [`LocalHandlers::dispatch`], independent of the host bus. This makes a
//! plugin unit-testable without a running manager.

use std::collections::HashMap;
use std::future::Future;

use serde_json::Value;

use crate::event::{Event, HandlerFn, HandlerResult, handler};

/// Identifier returned by [`LocalHandlers::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalHandlerId(u64);

/// Event-name → handler-list table private to one plugin instance.
#[derive(Default)]
pub struct LocalHandlers {
    next_id: u64,
    handlers: HashMap<String, Vec<(LocalHandlerId, HandlerFn)>>,
}

impl LocalHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event name.
    pub fn register<F, Fut>(&mut self, event: impl Into<String>, f: F) -> LocalHandlerId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let id = LocalHandlerId(self.next_id);
        self.next_id += 1;
        self.handlers
            .entry(event.into())
            .or_default()
            .push((id, handler(f)));
        id
    }

    /// Unregister a handler. Returns false if it was not registered.
    pub fn unregister(&mut self, event: &str, id: LocalHandlerId) -> bool {
        let Some(list) = self.handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(hid, _)| *hid != id);
        list.len() != before
    }

    /// Remove every registered handler.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// Number of handlers registered per event name.
    pub fn counts(&self) -> HashMap<String, usize> {
        self.handlers
            .iter()
            .map(|(name, list)| (name.clone(), list.len()))
            .collect()
    }

    /// Dispatch an event to the local handlers for `name`, in registration
    /// order. A handler that fails contributes `None`; the rest still run.
    pub async fn dispatch(&self, name: &str, data: Value) -> Vec<Option<Value>> {
        let Some(list) = self.handlers.get(name) else {
            return Vec::new();
        };

        let mut results = Vec::with_capacity(list.len());
        for (_, callback) in list {
            let event = Event::new(name, data.clone());
            match callback(event).await {
                Ok(value) => results.push(Some(value)),
                Err(e) => {
                    tracing::warn!(event = %name, error = %e, "Local event handler failed");
                    results.push(None);
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PluginError;
    use serde_json::json;

    #[tokio::test]
    async fn test_dispatch_runs_handlers_in_registration_order() {
        let mut handlers = LocalHandlers::new();
        handlers.register("ping", |_| async { Ok(json!(1)) });
        handlers.register("ping", |_| async { Ok(json!(2)) });

        let results = handlers.dispatch("ping", json!({})).await;
        assert_eq!(results, vec![Some(json!(1)), Some(json!(2))]);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_event_is_empty() {
        let handlers = LocalHandlers::new();
        assert!(handlers.dispatch("nope", json!({})).await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_handler_contributes_none() {
        let mut handlers = LocalHandlers::new();
        handlers.register("ping", |_| async { Err(PluginError::custom("boom")) });
        handlers.register("ping", |_| async { Ok(json!("ok")) });

        let results = handlers.dispatch("ping", json!({})).await;
        assert_eq!(results, vec![None, Some(json!("ok"))]);
    }

    #[tokio::test]
    async fn test_unregister_removes_handler() {
        let mut handlers = LocalHandlers::new();
        let id = handlers.register("ping", |_| async { Ok(json!(1)) });

        assert!(handlers.unregister("ping", id));
        assert!(!handlers.unregister("ping", id));
        assert!(handlers.dispatch("ping", json!({})).await.is_empty());
    }

    #[test]
    fn test_clear_and_counts() {
        let mut handlers = LocalHandlers::new();
        handlers.register("a", |_| async { Ok(json!(null)) });
        handlers.register("a", |_| async { Ok(json!(null)) });
        handlers.register("b", |_| async { Ok(json!(null)) });

        let counts = handlers.counts();
        assert_eq!(counts.get("a"), Some(&2));
        assert_eq!(counts.get("b"), Some(&1));

        handlers.clear();
        assert!(handlers.counts().is_empty());
    }
}

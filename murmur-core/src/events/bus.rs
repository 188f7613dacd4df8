//! Priority event bus with queued and inline dispatch
//!
//! Handlers are registered as [`HandlerSpec`]s, optionally tagged with the
//! owning plugin's name so the manager can bulk-remove them at unload.
//! Exact-name handlers run before wildcard (`"*"`) handlers; within each
//! group, higher priority first, subscription order breaking ties. A
//! handler can cancel the event to skip the remaining handlers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use murmur_plugin_api::{Event, HandlerSpec};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Number of past events retained for diagnostics
pub const HISTORY_CAPACITY: usize = 1000;

/// Capacity of the queued-dispatch channel
const QUEUE_CAPACITY: usize = 256;

/// Identifier for one subscription, scoped to its event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Per-event-name dispatch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct EventCounters {
    /// Times this event was emitted
    pub emitted: u64,
    /// Handler invocations that returned Ok
    pub handled: u64,
    /// Handler invocations that returned Err
    pub errors: u64,
}

/// Aggregate bus statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BusStats {
    pub total_emitted: u64,
    pub total_handled: u64,
    pub total_errors: u64,
    pub per_event: HashMap<String, EventCounters>,
}

struct Subscription {
    id: SubscriptionId,
    plugin: Option<String>,
    spec: HandlerSpec,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    // Keyed by event name; "*" holds the wildcard subscriptions
    handlers: HashMap<String, Vec<Subscription>>,
    history: VecDeque<Event>,
    history_capacity: usize,
    stats: BusStats,
}

impl BusState {
    fn record_emit(&mut self, event: &Event) {
        self.stats.total_emitted += 1;
        self.stats
            .per_event
            .entry(event.name.clone())
            .or_default()
            .emitted += 1;

        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(event.clone());
    }

    fn record_result(&mut self, event_name: &str, ok: bool) {
        let counters = self.stats.per_event.entry(event_name.to_string()).or_default();
        if ok {
            self.stats.total_handled += 1;
            counters.handled += 1;
        } else {
            self.stats.total_errors += 1;
            counters.errors += 1;
        }
    }
}

/// The host event bus.
///
/// Cheap to clone via internal `Arc`s; the manager and plugins' contexts
/// can share one instance.
pub struct EventBus {
    state: Arc<RwLock<BusState>>,
    queue_tx: RwLock<Option<mpsc::Sender<Event>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history_capacity(HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(capacity: usize) -> Self {
        let state = BusState {
            history_capacity: capacity,
            ..Default::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
            queue_tx: RwLock::new(None),
            worker: Mutex::new(None),
            cancel: Mutex::new(None),
        }
    }

    // ─── Subscriptions ───────────────────────────────────────────────

    /// Register a handler. `plugin` tags the subscription for bulk removal
    /// via [`unsubscribe_plugin`](Self::unsubscribe_plugin).
    pub async fn subscribe(&self, plugin: Option<&str>, spec: HandlerSpec) -> SubscriptionId {
        let mut state = self.state.write().await;
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;

        tracing::debug!(
            event = %spec.event,
            plugin = plugin.unwrap_or("<host>"),
            priority = ?spec.priority,
            "Handler subscribed"
        );

        state
            .handlers
            .entry(spec.event.clone())
            .or_default()
            .push(Subscription {
                id,
                plugin: plugin.map(str::to_string),
                spec,
            });
        id
    }

    /// Remove one subscription. Returns false if it was not registered.
    pub async fn unsubscribe(&self, event: &str, id: SubscriptionId) -> bool {
        let mut state = self.state.write().await;
        let Some(list) = state.handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            state.handlers.remove(event);
        }
        removed
    }

    /// Remove every subscription tagged with the given plugin name.
    /// Returns the number removed.
    pub async fn unsubscribe_plugin(&self, plugin: &str) -> usize {
        let mut state = self.state.write().await;
        let mut removed = 0;
        state.handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|s| s.plugin.as_deref() != Some(plugin));
            removed += before - list.len();
            !list.is_empty()
        });
        if removed > 0 {
            tracing::debug!(plugin = %plugin, count = removed, "Handlers unsubscribed");
        }
        removed
    }

    /// Number of subscriptions per event name.
    pub async fn handler_counts(&self) -> HashMap<String, usize> {
        self.state
            .read()
            .await
            .handlers
            .iter()
            .map(|(name, list)| (name.clone(), list.len()))
            .collect()
    }

    // ─── Emission ────────────────────────────────────────────────────

    /// Emit an event and wait for all handlers, returning their results in
    /// dispatch order. An errored handler contributes `None`.
    pub async fn emit_wait(&self, event: Event) -> Vec<Option<Value>> {
        dispatch(&self.state, event).await
    }

    /// Emit an event without waiting for handlers. If the bus is running
    /// the event is queued to the dispatch task; otherwise it is delivered
    /// inline so no event is ever dropped.
    pub async fn emit(&self, event: Event) {
        let tx = self.queue_tx.read().await.clone();
        if let Some(tx) = tx {
            match tx.send(event).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => {
                    // Worker is gone; fall through to inline delivery
                    dispatch(&self.state, event).await;
                    return;
                }
            }
        }
        dispatch(&self.state, event).await;
    }

    // ─── Lifecycle ───────────────────────────────────────────────────

    /// Start the background dispatch task. Idempotent.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::channel::<Event>(QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let state = Arc::clone(&self.state);
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        // Drain whatever was queued before the stop
                        while let Ok(event) = rx.try_recv() {
                            dispatch(&state, event).await;
                        }
                        break;
                    }
                    next = rx.recv() => match next {
                        Some(event) => {
                            dispatch(&state, event).await;
                        }
                        None => break,
                    },
                }
            }
        });

        *self.queue_tx.write().await = Some(tx);
        *self.cancel.lock().await = Some(cancel);
        *worker = Some(handle);
        tracing::debug!("Event bus started");
    }

    /// Stop the dispatch task, draining queued events first. Idempotent.
    pub async fn stop(&self) {
        // Close the sender first so emits fall back to inline delivery
        *self.queue_tx.write().await = None;

        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Event bus worker task failed");
            }
        }
        tracing::debug!("Event bus stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.worker.lock().await.is_some()
    }

    // ─── Diagnostics ─────────────────────────────────────────────────

    /// Most recent events, newest last, capped at `limit`.
    pub async fn history(&self, limit: usize) -> Vec<Event> {
        let state = self.state.read().await;
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub async fn clear_history(&self) {
        self.state.write().await.history.clear();
    }

    pub async fn stats(&self) -> BusStats {
        self.state.read().await.stats.clone()
    }
}

/// Deliver one event: exact-name handlers by descending priority, then
/// wildcard handlers by descending priority. Cancellation skips the
/// remainder; `once` handlers are removed after their first run.
async fn dispatch(state: &Arc<RwLock<BusState>>, event: Event) -> Vec<Option<Value>> {
    // Snapshot the matching specs so handlers run without the lock held;
    // a handler may itself emit or subscribe.
    let snapshot: Vec<(String, SubscriptionId, HandlerSpec)> = {
        let mut state = state.write().await;
        state.record_emit(&event);

        // An event literally named "*" must not visit the wildcard key twice
        let mut keys = vec![event.name.as_str()];
        if event.name != "*" {
            keys.push("*");
        }

        let mut snapshot = Vec::new();
        for key in keys {
            if let Some(list) = state.handlers.get(key) {
                let mut group: Vec<_> = list
                    .iter()
                    .map(|s| (key.to_string(), s.id, s.spec.clone()))
                    .collect();
                // Stable sort keeps subscription order within a priority
                group.sort_by(|a, b| b.2.priority.cmp(&a.2.priority));
                snapshot.extend(group);
            }
        }
        snapshot
    };

    let mut results = Vec::new();
    let mut spent = Vec::new();

    for (key, id, spec) in snapshot {
        if event.is_cancelled() {
            tracing::debug!(event = %event.name, "Event cancelled, skipping remaining handlers");
            break;
        }
        if !spec.matches(&event) {
            continue;
        }

        if spec.once {
            spent.push((key, id));
        }

        let outcome = (spec.handler)(event.clone()).await;
        let ok = outcome.is_ok();
        state.write().await.record_result(&event.name, ok);

        match outcome {
            Ok(value) => results.push(Some(value)),
            Err(e) => {
                tracing::warn!(event = %event.name, error = %e, "Event handler failed");
                results.push(None);
            }
        }
    }

    if !spent.is_empty() {
        let mut state = state.write().await;
        for (key, id) in spent {
            if let Some(list) = state.handlers.get_mut(&key) {
                list.retain(|s| s.id != id);
                if list.is_empty() {
                    state.handlers.remove(&key);
                }
            }
        }
    }

    results
}

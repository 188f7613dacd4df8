//! Host event bus
//!
//! Event and handler types live in `murmur_plugin_api::event`; this module
//! provides the host-side dispatcher.

mod bus;

pub use bus::{BusStats, EventBus, EventCounters, SubscriptionId, HISTORY_CAPACITY};

//! murmur-core - host-side runtime for murmur plugins
//!
//! Everything the host needs to run plugins: manifest-driven discovery
//! and loading (`loader`), persistent metadata with search (`registry`),
//! the priority event bus (`events`), resource-bounded execution
//! (`sandbox`), and the lifecycle orchestrator tying them together
//! (`manager`).

pub mod error;
pub mod events;
pub mod loader;
pub mod manager;
pub mod registry;
pub mod sandbox;

pub use error::HostError;
pub use events::{BusStats, EventBus, EventCounters, SubscriptionId};
pub use loader::{DylibModuleLoader, ModuleLoader, PluginLoader, StaticModuleLoader};
pub use manager::{ManagerConfig, ManagerStatistics, PluginManager, PluginSnapshot};
pub use registry::{PluginRegistry, RegistryStatistics, SearchFilter};
pub use sandbox::{ExecutionStats, NoopGuard, ResourceGuard, Sandbox, SandboxLimits};

#[cfg(unix)]
pub use sandbox::RlimitGuard;

//! PluginManager - orchestrates the full plugin lifecycle
//!
//! The manager ties the loader, registry, event bus, and sandbox together:
//! discovery feeds the registry, loads resolve dependencies recursively,
//! lifecycle transitions run sandboxed, and every transition is announced
//! on the bus (`plugin.loaded`, `plugin.started`, `plugin.stopped`,
//! `plugin.unloaded`).

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use murmur_plugin_api::{Event, Plugin, PluginContext, PluginInfo, PluginState, PluginType};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::HostError;
use crate::events::{BusStats, EventBus};
use crate::loader::{ModuleLoader, PluginLoader};
use crate::registry::PluginRegistry;
use crate::sandbox::Sandbox;

const CONFIG_FORMAT_VERSION: u32 = 1;

/// Filesystem layout and search paths for a manager instance.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directories scanned for plugins, in precedence order
    pub plugin_dirs: Vec<PathBuf>,
    /// Root for per-plugin durable data directories
    pub data_dir: PathBuf,
    /// Root for per-plugin scratch directories, removed at shutdown
    pub temp_dir: PathBuf,
    /// Registry document path
    pub registry_path: PathBuf,
    /// Plugin configuration store path
    pub config_path: PathBuf,
}

impl ManagerConfig {
    /// Conventional layout under a single root directory.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let data_dir = root.join("data");
        Self {
            plugin_dirs: vec![root.join("plugins")],
            registry_path: data_dir.join("registry.json"),
            config_path: data_dir.join("configs.json"),
            data_dir,
            temp_dir: root.join("tmp"),
        }
    }
}

/// One loaded plugin with its runtime state.
struct PluginHandle {
    instance: Box<dyn Plugin>,
    context: PluginContext,
    state: PluginState,
    started_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

/// Read-only view of a loaded plugin.
#[derive(Debug, Clone)]
pub struct PluginSnapshot {
    pub info: PluginInfo,
    pub state: PluginState,
    pub started_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Aggregate manager statistics
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatistics {
    pub loaded: usize,
    pub active: usize,
    pub errored: usize,
    pub active_by_type: HashMap<String, usize>,
    pub error_messages: HashMap<String, String>,
    pub failure_counts: HashMap<String, u64>,
    pub bus: BusStats,
}

#[derive(Serialize, Deserialize)]
struct ConfigDocument {
    version: u32,
    updated_at: DateTime<Utc>,
    configs: HashMap<String, HashMap<String, Value>>,
}

/// Dependency-aware plugin lifecycle orchestrator.
pub struct PluginManager {
    config: ManagerConfig,
    loader: PluginLoader,
    registry: PluginRegistry,
    bus: Arc<EventBus>,
    sandbox: Sandbox,
    plugins: HashMap<String, PluginHandle>,
    load_order: Vec<String>,
    // Guards recursive dependency loading against cycles
    loading: HashSet<String>,
    configs: HashMap<String, HashMap<String, Value>>,
    failures: HashMap<String, u64>,
}

impl PluginManager {
    /// Create a manager with the real dynamic-library loader and the
    /// platform sandbox.
    pub fn new(config: ManagerConfig) -> Self {
        let loader = PluginLoader::new(config.plugin_dirs.clone());
        Self::assemble(config, loader, Sandbox::new())
    }

    /// Create a manager with an explicit module loader and sandbox.
    /// Tests pass a `StaticModuleLoader` and a `NoopGuard` sandbox.
    pub fn with_module_loader(
        config: ManagerConfig,
        modules: Arc<dyn ModuleLoader>,
        sandbox: Sandbox,
    ) -> Self {
        let loader = PluginLoader::with_module_loader(config.plugin_dirs.clone(), modules);
        Self::assemble(config, loader, sandbox)
    }

    fn assemble(config: ManagerConfig, loader: PluginLoader, sandbox: Sandbox) -> Self {
        let registry = PluginRegistry::open(&config.registry_path);
        Self {
            config,
            loader,
            registry,
            bus: Arc::new(EventBus::new()),
            sandbox,
            plugins: HashMap::new(),
            load_order: Vec::new(),
            loading: HashSet::new(),
            configs: HashMap::new(),
            failures: HashMap::new(),
        }
    }

    /// Provision directories, start the bus, run discovery, and load the
    /// plugin configuration store.
    pub async fn initialize(&mut self) -> Result<(), HostError> {
        std::fs::create_dir_all(&self.config.data_dir)?;
        std::fs::create_dir_all(&self.config.temp_dir)?;

        self.bus.start().await;

        for info in self.loader.discover() {
            if let Err(e) = self.registry.register(info.clone()) {
                tracing::warn!(plugin = %info.name, error = %e, "Failed to register discovered plugin");
            }
        }

        self.load_configs();
        tracing::info!(
            discovered = self.registry.len(),
            "Plugin manager initialized"
        );
        Ok(())
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    // ─── Loading ─────────────────────────────────────────────────────

    /// Load a plugin and, recursively, its dependencies. Returns `true`
    /// once the plugin is loaded; loading an already loaded plugin is a
    /// no-op success. A failing dependency fails the whole load and the
    /// dependent plugin is never partially registered.
    pub async fn load_plugin(
        &mut self,
        name: &str,
        config: Option<HashMap<String, Value>>,
    ) -> Result<bool, HostError> {
        self.load_recursive(name.to_string(), config).await
    }

    fn load_recursive(
        &mut self,
        name: String,
        config: Option<HashMap<String, Value>>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, HostError>> + Send + '_>> {
        Box::pin(async move {
            if self.plugins.contains_key(&name) {
                return Ok(true);
            }
            if !self.loading.insert(name.clone()) {
                return Err(HostError::DependencyCycle {
                    plugin: name.clone(),
                });
            }

            let result = self.load_single(&name, config).await;
            self.loading.remove(&name);
            result
        })
    }

    async fn load_single(
        &mut self,
        name: &str,
        config: Option<HashMap<String, Value>>,
    ) -> Result<bool, HostError> {
        let info = self
            .registry
            .get(name)
            .or_else(|| self.loader.get_discovered(name))
            .cloned()
            .ok_or_else(|| HostError::NotFound(name.to_string()))?;

        self.sandbox.screen(&info).await?;

        for dep in info.dependencies.clone() {
            tracing::debug!(plugin = %name, dependency = %dep, "Loading dependency");
            self.load_recursive(dep, None).await?;
        }

        let config = config
            .or_else(|| self.configs.get(name).cloned())
            .unwrap_or_default();
        let data_dir = self.config.data_dir.join(name);
        let temp_dir = self.config.temp_dir.join(name);
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(&temp_dir)?;

        let (mut instance, mut context) =
            self.loader
                .load(&info, config.clone(), data_dir, temp_dir)?;

        if let Err(e) = self
            .sandbox
            .run(name, instance.initialize(&mut context))
            .await
        {
            tracing::error!(plugin = %name, error = %e, "Plugin initialization failed");
            drop(instance);
            self.loader.unload(name);
            *self.failures.entry(name.to_string()).or_insert(0) += 1;
            return Err(e);
        }

        for spec in instance.declare_handlers() {
            self.bus.subscribe(Some(name), spec).await;
        }

        self.configs.insert(name.to_string(), config);
        self.plugins.insert(
            name.to_string(),
            PluginHandle {
                instance,
                context,
                state: PluginState::Initialized,
                started_at: None,
                error_message: None,
            },
        );
        self.load_order.push(name.to_string());

        tracing::info!(plugin = %name, version = %info.version, "Plugin loaded");
        self.announce("plugin.loaded", name).await;
        Ok(true)
    }

    // ─── Lifecycle transitions ───────────────────────────────────────

    /// Start a plugin. Starting an already started plugin is a no-op; a
    /// plugin in `Error` or `Disabled` state must be reloaded first.
    pub async fn start_plugin(&mut self, name: &str) -> Result<(), HostError> {
        let handle = self
            .plugins
            .get_mut(name)
            .ok_or_else(|| HostError::NotFound(name.to_string()))?;
        if handle.state == PluginState::Started {
            return Ok(());
        }
        if matches!(handle.state, PluginState::Error | PluginState::Disabled) {
            return Err(HostError::InvalidState {
                plugin: name.to_string(),
                state: handle.state.clone(),
            });
        }

        let result = self
            .sandbox
            .run(name, handle.instance.start(&mut handle.context))
            .await;

        match result {
            Ok(()) => {
                handle.state = PluginState::Started;
                handle.started_at = Some(Utc::now());
                handle.error_message = None;
                tracing::info!(plugin = %name, "Plugin started");
                self.announce("plugin.started", name).await;
                Ok(())
            }
            Err(e) => {
                handle.state = PluginState::Error;
                handle.error_message = Some(e.to_string());
                *self.failures.entry(name.to_string()).or_insert(0) += 1;
                tracing::error!(plugin = %name, error = %e, "Plugin start failed");
                Err(e)
            }
        }
    }

    /// Stop a plugin. Stopping a plugin that is not started is a no-op.
    pub async fn stop_plugin(&mut self, name: &str) -> Result<(), HostError> {
        let handle = self
            .plugins
            .get_mut(name)
            .ok_or_else(|| HostError::NotFound(name.to_string()))?;
        if handle.state != PluginState::Started {
            return Ok(());
        }

        let result = self
            .sandbox
            .run(name, handle.instance.stop(&mut handle.context))
            .await;

        match result {
            Ok(()) => {
                handle.state = PluginState::Stopped;
                handle.started_at = None;
                tracing::info!(plugin = %name, "Plugin stopped");
                self.announce("plugin.stopped", name).await;
                Ok(())
            }
            Err(e) => {
                handle.state = PluginState::Error;
                handle.error_message = Some(e.to_string());
                *self.failures.entry(name.to_string()).or_insert(0) += 1;
                tracing::error!(plugin = %name, error = %e, "Plugin stop failed");
                Err(e)
            }
        }
    }

    pub async fn restart_plugin(&mut self, name: &str) -> Result<(), HostError> {
        self.stop_plugin(name).await?;
        self.start_plugin(name).await
    }

    /// Unload and load again, keeping the plugin's active configuration.
    pub async fn reload_plugin(&mut self, name: &str) -> Result<(), HostError> {
        let config = self.configs.get(name).cloned();
        self.unload_plugin(name).await?;
        self.load_plugin(name, config).await?;
        Ok(())
    }

    /// Apply a new configuration. The plugin is notified once via
    /// `on_config_changed`; if it rejects the change, the previous
    /// configuration is restored without a second notification.
    pub async fn reload_config(
        &mut self,
        name: &str,
        new_config: HashMap<String, Value>,
    ) -> Result<(), HostError> {
        let handle = self
            .plugins
            .get_mut(name)
            .ok_or_else(|| HostError::NotFound(name.to_string()))?;

        let old = handle.context.replace_config(new_config.clone());
        let result = handle
            .instance
            .on_config_changed(&old, &new_config, &mut handle.context)
            .await;

        if let Err(e) = result {
            handle.context.replace_config(old);
            tracing::warn!(plugin = %name, error = %e, "Configuration rejected, rolled back");
            return Err(HostError::Plugin(e));
        }

        self.configs.insert(name.to_string(), new_config);
        self.save_configs();
        tracing::info!(plugin = %name, "Configuration reloaded");
        Ok(())
    }

    /// Unload a plugin: stop if started, run `cleanup` (always), remove
    /// its bus subscriptions, and drop the instance before its library.
    pub async fn unload_plugin(&mut self, name: &str) -> Result<(), HostError> {
        if !self.plugins.contains_key(name) {
            return Err(HostError::NotFound(name.to_string()));
        }

        if let Err(e) = self.stop_plugin(name).await {
            tracing::warn!(plugin = %name, error = %e, "Stop during unload failed, continuing");
        }

        if let Some(mut handle) = self.plugins.remove(name) {
            if let Err(e) = handle.instance.cleanup(&mut handle.context).await {
                tracing::warn!(plugin = %name, error = %e, "Plugin cleanup returned error");
            }
            // Instance drops here, before the loader releases its library
        }

        self.bus.unsubscribe_plugin(name).await;
        self.loader.unload(name);
        self.load_order.retain(|n| n != name);

        tracing::info!(plugin = %name, "Plugin unloaded");
        self.announce("plugin.unloaded", name).await;
        Ok(())
    }

    // ─── Ordering ────────────────────────────────────────────────────

    /// Dependency-ordered startup sequence over the loaded plugins:
    /// every plugin appears after all of its loaded dependencies.
    pub fn startup_order(&self) -> Result<Vec<String>, HostError> {
        let mut order = Vec::with_capacity(self.plugins.len());
        let mut permanent = HashSet::new();
        let mut in_progress = HashSet::new();

        let mut names: Vec<&String> = self.plugins.keys().collect();
        names.sort();

        for name in names {
            self.visit(name, &mut permanent, &mut in_progress, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        name: &str,
        permanent: &mut HashSet<String>,
        in_progress: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<(), HostError> {
        if permanent.contains(name) {
            return Ok(());
        }
        if !in_progress.insert(name.to_string()) {
            return Err(HostError::DependencyCycle {
                plugin: name.to_string(),
            });
        }

        if let Some(handle) = self.plugins.get(name) {
            let mut deps = handle.context.info().dependencies.clone();
            deps.sort();
            for dep in deps {
                if self.plugins.contains_key(&dep) {
                    self.visit(&dep, permanent, in_progress, order)?;
                }
            }
        }

        in_progress.remove(name);
        permanent.insert(name.to_string());
        order.push(name.to_string());
        Ok(())
    }

    /// Start every loaded plugin in dependency order. Per-plugin failures
    /// are recorded, not propagated; a dependency cycle is fatal.
    pub async fn start_all(&mut self) -> Result<(usize, usize), HostError> {
        let order = self.startup_order()?;
        let total = order.len();
        let mut succeeded = 0;

        for name in order {
            if self.start_plugin(&name).await.is_ok() {
                succeeded += 1;
            }
        }
        tracing::info!(succeeded, total, "Started plugins");
        Ok((succeeded, total))
    }

    /// Stop every plugin in exact reverse startup order.
    pub async fn stop_all(&mut self) -> Result<(usize, usize), HostError> {
        let mut order = self.startup_order()?;
        order.reverse();
        let total = order.len();
        let mut succeeded = 0;

        for name in order {
            if self.stop_plugin(&name).await.is_ok() {
                succeeded += 1;
            }
        }
        tracing::info!(succeeded, total, "Stopped plugins");
        Ok((succeeded, total))
    }

    /// Stop everything, unload everything in reverse load order, stop the
    /// bus, and remove the scratch root.
    pub async fn shutdown(&mut self) -> Result<(), HostError> {
        if let Err(e) = self.stop_all().await {
            tracing::warn!(error = %e, "stop_all failed during shutdown, continuing");
        }

        let mut names = self.load_order.clone();
        names.reverse();
        for name in names {
            if let Err(e) = self.unload_plugin(&name).await {
                tracing::warn!(plugin = %name, error = %e, "Unload during shutdown failed");
            }
        }

        self.bus.stop().await;

        if self.config.temp_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.config.temp_dir) {
                tracing::warn!(error = %e, "Failed to remove scratch directory");
            }
        }

        tracing::info!("Plugin manager shut down");
        Ok(())
    }

    // ─── Read surface ────────────────────────────────────────────────

    pub fn get_plugin(&self, name: &str) -> Option<PluginSnapshot> {
        self.plugins.get(name).map(|h| PluginSnapshot {
            info: h.context.info().clone(),
            state: h.state.clone(),
            started_at: h.started_at,
            error_message: h.error_message.clone(),
        })
    }

    pub fn get_plugin_info(&self, name: &str) -> Option<&PluginInfo> {
        self.plugins.get(name).map(|h| h.context.info())
    }

    pub fn list_plugins(&self) -> Vec<PluginSnapshot> {
        let mut snapshots: Vec<_> = self
            .plugins
            .keys()
            .filter_map(|name| self.get_plugin(name))
            .collect();
        snapshots.sort_by(|a, b| a.info.name.cmp(&b.info.name));
        snapshots
    }

    pub fn list_by_type(&self, plugin_type: PluginType) -> Vec<PluginSnapshot> {
        self.list_plugins()
            .into_iter()
            .filter(|s| s.info.plugin_type == plugin_type)
            .collect()
    }

    pub fn plugin_states(&self) -> HashMap<String, PluginState> {
        self.plugins
            .iter()
            .map(|(name, h)| (name.clone(), h.state.clone()))
            .collect()
    }

    pub async fn statistics(&self) -> ManagerStatistics {
        let mut active_by_type = HashMap::new();
        let mut error_messages = HashMap::new();
        let mut active = 0;
        let mut errored = 0;

        for (name, handle) in &self.plugins {
            match handle.state {
                PluginState::Started => {
                    active += 1;
                    *active_by_type
                        .entry(handle.context.info().plugin_type.to_string())
                        .or_insert(0) += 1;
                }
                PluginState::Error => {
                    errored += 1;
                    if let Some(ref message) = handle.error_message {
                        error_messages.insert(name.clone(), message.clone());
                    }
                }
                _ => {}
            }
        }

        ManagerStatistics {
            loaded: self.plugins.len(),
            active,
            errored,
            active_by_type,
            error_messages,
            failure_counts: self.failures.clone(),
            bus: self.bus.stats().await,
        }
    }

    // ─── Configuration store ─────────────────────────────────────────

    pub fn get_plugin_config(&self, name: &str) -> Option<&HashMap<String, Value>> {
        self.configs.get(name)
    }

    /// Store a configuration for a plugin. Takes effect at the next load;
    /// use [`reload_config`](Self::reload_config) for a live plugin.
    pub fn set_plugin_config(&mut self, name: &str, config: HashMap<String, Value>) {
        self.configs.insert(name.to_string(), config);
        self.save_configs();
    }

    /// Flush the configuration store to disk on demand. Mutating calls
    /// persist automatically; this covers configs handed directly to
    /// [`load_plugin`](Self::load_plugin).
    pub fn save_plugin_configs(&self) {
        self.save_configs();
    }

    fn load_configs(&mut self) {
        match std::fs::read_to_string(&self.config.config_path) {
            Ok(content) => match serde_json::from_str::<ConfigDocument>(&content) {
                Ok(doc) => {
                    self.configs = doc.configs;
                    tracing::debug!(count = self.configs.len(), "Loaded plugin configurations");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Corrupt plugin configuration store, starting empty");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read plugin configuration store");
            }
        }
    }

    fn save_configs(&self) {
        let doc = ConfigDocument {
            version: CONFIG_FORMAT_VERSION,
            updated_at: Utc::now(),
            configs: self.configs.clone(),
        };

        let result = (|| -> Result<(), HostError> {
            if let Some(parent) = self.config.config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = self.config.config_path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_string_pretty(&doc)?)?;
            std::fs::rename(&tmp, &self.config.config_path)?;
            Ok(())
        })();

        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to persist plugin configurations");
        }
    }

    async fn announce(&self, event: &str, plugin: &str) {
        self.bus
            .emit(Event::new(event, json!({ "plugin": plugin })).with_source("manager"))
            .await;
    }
}

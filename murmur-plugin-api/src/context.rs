//! PluginContext - the read-mostly execution environment handed to a plugin

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::PluginError;
use crate::types::PluginInfo;

/// Per-instance execution context created at load time.
///
/// Holds the owning [`PluginInfo`], the plugin's configuration map, its
/// private data and temp directories, and the set of permissions the host
/// granted it. Owned by the plugin instance (via its host-side handle) for
/// the instance's whole lifetime.
#[derive(Debug)]
pub struct PluginContext {
    info: PluginInfo,
    config: HashMap<String, Value>,
    data_dir: PathBuf,
    temp_dir: PathBuf,
    log_level: String,
    permissions: HashSet<String>,
}

impl PluginContext {
    /// Create a context. `permissions` is the granted set, normally the
    /// plugin's declared permissions unless the host narrowed them.
    pub fn new(
        info: PluginInfo,
        config: HashMap<String, Value>,
        data_dir: PathBuf,
        temp_dir: PathBuf,
        permissions: HashSet<String>,
    ) -> Self {
        Self {
            info,
            config,
            data_dir,
            temp_dir,
            log_level: "info".to_string(),
            permissions,
        }
    }

    /// The owning plugin's metadata
    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    /// The plugin's name (shorthand for `info().name`)
    pub fn plugin_name(&self) -> &str {
        &self.info.name
    }

    /// Private data directory for durable plugin state
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Private scratch directory, deleted at host shutdown
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Log level requested for this plugin
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Set the plugin's log level
    pub fn set_log_level(&mut self, level: impl Into<String>) {
        self.log_level = level.into();
    }

    // ─── Configuration ───────────────────────────────────────────────

    /// Read a configuration value
    pub fn config_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Write a configuration value
    pub fn config_set<T: Serialize>(&mut self, key: &str, value: T) -> Result<(), PluginError> {
        let value =
            serde_json::to_value(value).map_err(|e| PluginError::Serialization(e.to_string()))?;
        self.config.insert(key.to_string(), value);
        Ok(())
    }

    /// The full configuration map
    pub fn config(&self) -> &HashMap<String, Value> {
        &self.config
    }

    /// Replace the configuration map, returning the previous one.
    /// Used by the host for config reloads and rollbacks.
    pub fn replace_config(&mut self, config: HashMap<String, Value>) -> HashMap<String, Value> {
        std::mem::replace(&mut self.config, config)
    }

    // ─── Permissions ─────────────────────────────────────────────────

    /// The granted permission set
    pub fn permissions(&self) -> &HashSet<String> {
        &self.permissions
    }

    /// Check whether a permission was granted
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// Require a permission. This is a precondition check: a missing
    /// grant is a fatal error for the calling operation.
    pub fn require_permission(&self, permission: &str) -> Result<(), PluginError> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(PluginError::PermissionDenied {
                permission: permission.to_string(),
            })
        }
    }

    // ─── Logging ─────────────────────────────────────────────────────

    /// Log an info message (automatically tagged with the plugin name)
    pub fn log_info(&self, message: &str) {
        tracing::info!(plugin = %self.info.name, "{}", message);
    }

    /// Log a warning message
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(plugin = %self.info.name, "{}", message);
    }

    /// Log an error message
    pub fn log_error(&self, message: &str) {
        tracing::error!(plugin = %self.info.name, "{}", message);
    }

    /// Log a debug message
    pub fn log_debug(&self, message: &str) {
        tracing::debug!(plugin = %self.info.name, "{}", message);
    }
}

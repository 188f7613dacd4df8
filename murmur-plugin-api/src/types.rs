//! Plugin metadata types

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// What kind of capability a plugin primarily provides.
///
/// The type is advisory metadata used for registry indexing and host-side
/// routing; the authoritative capability surface is the set of extension
/// traits the plugin actually implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PluginType {
    /// Reacts to messages flowing through the host pipeline
    MessageHandler,
    /// Provides named commands
    Command,
    /// Intercepts and transforms pipeline traffic
    Middleware,
    /// Provides invokable tools
    Tool,
    /// Bridges an external platform
    Adapter,
    /// Generic extension with no specialized surface
    #[default]
    Extension,
    /// Long-running background service
    Service,
}

impl std::fmt::Display for PluginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MessageHandler => "message_handler",
            Self::Command => "command",
            Self::Middleware => "middleware",
            Self::Tool => "tool",
            Self::Adapter => "adapter",
            Self::Extension => "extension",
            Self::Service => "service",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a loaded plugin instance.
///
/// Transitions: `Loaded → Initialized → Started ⇄ Stopped`. `Error` is
/// reachable from any failed transition and can only be left through a
/// full unload or reload. `Disabled` is an administrative terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    /// Code unit loaded, not yet initialized
    Loaded,
    /// `initialize` succeeded
    Initialized,
    /// `start` succeeded, plugin is active
    Started,
    /// `stop` succeeded
    Stopped,
    /// A lifecycle transition failed
    Error,
    /// Administratively disabled
    Disabled,
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Loaded => "loaded",
            Self::Initialized => "initialized",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

/// Immutable plugin metadata.
///
/// Produced by manifest parsing or entry-point introspection during
/// discovery, and persisted in the host registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Unique plugin name
    pub name: String,
    /// Semantic version string
    pub version: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Plugin author
    #[serde(default)]
    pub author: String,
    /// Primary capability tag
    #[serde(default)]
    pub plugin_type: PluginType,
    /// Path to the loadable unit (dylib, archive, or plugin directory)
    pub entry_point: String,
    /// Names of plugins that must be loaded first
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Permission strings the plugin requests
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Optional JSON schema for the plugin's configuration
    #[serde(default)]
    pub config_schema: Option<serde_json::Value>,
    /// Minimum host version the plugin supports
    #[serde(default)]
    pub min_system_version: Option<String>,
    /// Maximum host version the plugin supports
    #[serde(default)]
    pub max_system_version: Option<String>,
    /// Free-form tags for registry search
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
}

impl PluginInfo {
    /// Create a minimal info with the required fields.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        plugin_type: PluginType,
        entry_point: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: String::new(),
            plugin_type,
            entry_point: entry_point.into(),
            dependencies: Vec::new(),
            permissions: Vec::new(),
            config_schema: None,
            min_system_version: None,
            max_system_version: None,
            tags: Vec::new(),
            homepage: None,
            repository: None,
            license: None,
        }
    }

    /// Check the required-field invariants.
    pub fn validate(&self) -> Result<(), PluginError> {
        if self.name.is_empty() {
            return Err(PluginError::manifest("plugin name is required"));
        }
        if self.version.is_empty() {
            return Err(PluginError::manifest("plugin version is required"));
        }
        if self.entry_point.is_empty() {
            return Err(PluginError::manifest("plugin entry point is required"));
        }
        Ok(())
    }
}

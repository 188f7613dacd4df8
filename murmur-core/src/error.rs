//! Host-side error types

use std::path::PathBuf;
use std::time::Duration;

use murmur_plugin_api::{PluginError, PluginState};
use thiserror::Error;

/// Errors produced by the host runtime
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Invalid plugin manifest at {path}: {reason}")]
    ManifestInvalid { path: PathBuf, reason: String },

    #[error("Failed to load plugin library: {0}")]
    LibraryLoad(#[from] libloading::Error),

    #[error("Plugin API version mismatch: expected {expected}, found {found}")]
    ApiVersionMismatch { expected: u32, found: u32 },

    #[error("Plugin {plugin} requires missing dependency: {dependency}")]
    MissingDependency { plugin: String, dependency: String },

    #[error("Circular dependency detected involving plugin: {plugin}")]
    DependencyCycle { plugin: String },

    #[error("Entry point does not export the plugin contract: {0}")]
    NoContract(PathBuf),

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("Plugin {plugin} is in state '{state}' and must be reloaded")]
    InvalidState { plugin: String, state: PluginState },

    #[error("Plugin {name} exceeded the execution timeout of {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Security violation in plugin {plugin}: {reason}")]
    SecurityViolation { plugin: String, reason: String },

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HostError::ApiVersionMismatch {
            expected: 1,
            found: 2,
        };
        assert_eq!(
            err.to_string(),
            "Plugin API version mismatch: expected 1, found 2"
        );

        let err = HostError::MissingDependency {
            plugin: "stats".to_string(),
            dependency: "base".to_string(),
        };
        assert!(err.to_string().contains("stats"));
        assert!(err.to_string().contains("base"));
    }

    #[test]
    fn test_plugin_error_converts() {
        let err: HostError = PluginError::custom("boom").into();
        assert!(matches!(err, HostError::Plugin(_)));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: HostError = io.into();
        assert!(matches!(err, HostError::Io(_)));
    }
}

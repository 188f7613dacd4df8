//! Error types for plugin authors

use thiserror::Error;

/// Errors that plugins can return
#[derive(Error, Debug)]
pub enum PluginError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest is missing required fields or is malformed
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A guarded operation was attempted without the required permission
    #[error("Permission denied: plugin requires permission '{permission}'")]
    PermissionDenied { permission: String },

    /// The plugin does not implement the requested capability
    #[error("Capability not supported: {0}")]
    NotSupported(String),

    /// Custom error with message
    #[error("{0}")]
    Custom(String),
}

impl PluginError {
    /// Create a custom error with a message
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a manifest error
    pub fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let config_err = PluginError::Config("missing key".to_string());
        assert_eq!(config_err.to_string(), "Configuration error: missing key");

        let custom_err = PluginError::Custom("something happened".to_string());
        assert_eq!(custom_err.to_string(), "something happened");
    }

    #[test]
    fn test_permission_denied_names_permission() {
        let err = PluginError::PermissionDenied {
            permission: "net.http".to_string(),
        };
        assert!(err.to_string().contains("net.http"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let plugin_err: PluginError = io_err.into();

        assert!(matches!(plugin_err, PluginError::Io(_)));
        assert!(plugin_err.to_string().contains("file not found"));
    }

    #[test]
    fn test_helper_constructors() {
        assert!(matches!(PluginError::custom("x"), PluginError::Custom(_)));
        assert!(matches!(PluginError::config("x"), PluginError::Config(_)));
        assert!(matches!(
            PluginError::manifest("x"),
            PluginError::Manifest(_)
        ));
    }
}

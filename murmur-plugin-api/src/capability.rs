//! Capability extension traits
//!
//! These refine the base [`Plugin`](crate::Plugin) contract. They are
//! additional interfaces a plugin may satisfy, not an inheritance chain:
//! the host discovers them through the `as_*` accessors on `Plugin`.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PluginError;

/// Describes one tool a [`ToolProvider`] exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name, unique within the plugin
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON schema for the tool's parameters
    #[serde(default)]
    pub parameters: Option<Value>,
}

/// A plugin that participates in the host message pipeline.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Whether this plugin wants to handle the message.
    fn can_handle(&self, _message: &Value) -> bool {
        true
    }

    /// Handle a message; `Ok(None)` means handled with no reply.
    async fn handle_message(&mut self, message: &Value) -> Result<Option<Value>, PluginError>;
}

/// A plugin that provides named commands.
#[async_trait]
pub trait CommandProvider: Send + Sync {
    /// Map of command name → description.
    fn commands(&self) -> HashMap<String, String>;

    /// Execute a command with positional args and a caller-supplied context.
    async fn execute_command(
        &mut self,
        command: &str,
        args: &[String],
        context: &Value,
    ) -> Result<Value, PluginError>;
}

/// A plugin that exposes invokable tools.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// The tools this plugin provides.
    fn tools(&self) -> Vec<ToolDescriptor>;

    /// Invoke a tool by name.
    async fn execute_tool(&mut self, name: &str, params: Value) -> Result<Value, PluginError>;
}

/// A plugin that runs a long-lived background service.
#[async_trait]
pub trait Service: Send + Sync {
    async fn start_service(&mut self) -> Result<(), PluginError>;

    async fn stop_service(&mut self) -> Result<(), PluginError>;

    /// Current service status as an opaque document.
    fn service_status(&self) -> Value;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_descriptor_roundtrip() {
        let descriptor = ToolDescriptor {
            name: "lookup".to_string(),
            description: "Look something up".to_string(),
            parameters: Some(json!({"type": "object"})),
        };

        let encoded = serde_json::to_string(&descriptor).unwrap();
        let decoded: ToolDescriptor = serde_json::from_str(&encoded).unwrap();
        assert_eq!(descriptor, decoded);
    }

    #[test]
    fn test_tool_descriptor_parameters_optional() {
        let decoded: ToolDescriptor =
            serde_json::from_str(r#"{"name":"t","description":"d"}"#).unwrap();
        assert!(decoded.parameters.is_none());
    }

    #[test]
    fn test_capability_traits_are_object_safe() {
        fn _message(_: Box<dyn MessageHandler>) {}
        fn _command(_: Box<dyn CommandProvider>) {}
        fn _tool(_: Box<dyn ToolProvider>) {}
        fn _service(_: Box<dyn Service>) {}
    }
}

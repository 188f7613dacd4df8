//! murmur-echo - example plugin that echoes messages back
//!
//! The smallest useful plugin: it handles messages by returning them,
//! counts what it has seen, and listens for `message.received` events on
//! the host bus. Useful as a template and as a smoke test for the host.

use async_trait::async_trait;
use murmur_plugin_api::{
    Event, HandlerSpec, MessageHandler, Plugin, PluginContext, PluginError, PluginInfo,
    PluginType, export_plugin,
};
use serde_json::{Value, json};

#[derive(Default)]
pub struct EchoPlugin {
    /// Prefix prepended to every echoed message, from config key "prefix"
    prefix: String,
    handled: u64,
}

#[async_trait]
impl Plugin for EchoPlugin {
    fn info(&self) -> PluginInfo {
        let mut info = PluginInfo::new(
            "murmur-echo",
            env!("CARGO_PKG_VERSION"),
            PluginType::MessageHandler,
            "libmurmur_echo.so",
        );
        info.description = "Echoes messages back to the sender".to_string();
        info.tags = vec!["example".to_string(), "echo".to_string()];
        info
    }

    async fn initialize(&mut self, ctx: &mut PluginContext) -> Result<(), PluginError> {
        self.prefix = ctx.config_get::<String>("prefix").unwrap_or_default();
        ctx.log_info("Echo plugin initialized");
        Ok(())
    }

    async fn start(&mut self, ctx: &mut PluginContext) -> Result<(), PluginError> {
        ctx.log_info("Echo plugin started");
        Ok(())
    }

    async fn stop(&mut self, ctx: &mut PluginContext) -> Result<(), PluginError> {
        ctx.log_info(&format!("Echo plugin stopped after {} messages", self.handled));
        Ok(())
    }

    fn declare_handlers(&self) -> Vec<HandlerSpec> {
        vec![HandlerSpec::new("message.received", |event: Event| async move {
            Ok(json!({ "echo": event.payload }))
        })]
    }

    fn as_message_handler(&mut self) -> Option<&mut dyn MessageHandler> {
        Some(self)
    }
}

#[async_trait]
impl MessageHandler for EchoPlugin {
    async fn handle_message(&mut self, message: &Value) -> Result<Option<Value>, PluginError> {
        self.handled += 1;
        let text = message.as_str().unwrap_or_default();
        Ok(Some(json!(format!("{}{}", self.prefix, text))))
    }
}

export_plugin!(EchoPlugin);

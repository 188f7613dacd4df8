//! murmur-plugin-api - Plugin API for the murmur extension host
//!
//! This crate provides the traits and types needed to write plugins for
//! murmur. Plugins are native Rust dynamic libraries that move through a
//! fixed lifecycle (load, initialize, start, stop, cleanup), subscribe to
//! the host event bus, and can opt into capability interfaces such as
//! command or tool provision.
//!
//! # Example
//!
//! ```ignore
//! use murmur_plugin_api::{
//!     Plugin, PluginContext, PluginError, PluginInfo, PluginType, export_plugin,
//! };
//!
//! #[derive(Default)]
//! pub struct MyPlugin;
//!
//! #[async_trait::async_trait]
//! impl Plugin for MyPlugin {
//!     fn info(&self) -> PluginInfo {
//!         PluginInfo::new("my-plugin", "0.1.0", PluginType::Extension, "my_plugin.so")
//!     }
//!
//!     async fn initialize(&mut self, ctx: &mut PluginContext) -> Result<(), PluginError> {
//!         ctx.log_info("Plugin initialized!");
//!         Ok(())
//!     }
//!
//!     async fn start(&mut self, _ctx: &mut PluginContext) -> Result<(), PluginError> {
//!         Ok(())
//!     }
//!
//!     async fn stop(&mut self, _ctx: &mut PluginContext) -> Result<(), PluginError> {
//!         Ok(())
//!     }
//! }
//!
//! export_plugin!(MyPlugin);
//! ```

pub mod capability;
pub mod context;
pub mod error;
pub mod event;
pub mod handlers;
pub mod manifest;
pub mod types;

use async_trait::async_trait;

pub use capability::{CommandProvider, MessageHandler, Service, ToolDescriptor, ToolProvider};
pub use context::PluginContext;
pub use error::PluginError;
pub use event::{Event, EventPriority, HandlerFn, HandlerFuture, HandlerResult, HandlerSpec, handler};
pub use handlers::{LocalHandlerId, LocalHandlers};
pub use manifest::{MANIFEST_STEMS, ManifestFormat, PluginManifest};
pub use types::{PluginInfo, PluginState, PluginType};

/// Current plugin API version. Plugins must match this exactly.
/// This is checked when loading plugins to ensure compatibility.
pub const API_VERSION: u32 = 1;

/// The core plugin trait - implement this to create a murmur plugin.
///
/// Lifecycle methods are called in a fixed order by the host: `initialize`
/// after loading, `start` after initialization, `stop` before unloading,
/// and `cleanup` last. Everything beyond `info`, `initialize`, `start`,
/// and `stop` has a default implementation.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Return plugin metadata
    fn info(&self) -> PluginInfo;

    /// Called once after loading, before any other lifecycle method.
    /// Acquire resources and validate configuration here.
    async fn initialize(&mut self, ctx: &mut PluginContext) -> Result<(), PluginError>;

    /// Called after `initialize` to begin active operation.
    async fn start(&mut self, ctx: &mut PluginContext) -> Result<(), PluginError>;

    /// Called to halt active operation. The plugin may be started again.
    async fn stop(&mut self, ctx: &mut PluginContext) -> Result<(), PluginError>;

    /// Called exactly once before the instance is dropped. The default
    /// delegates to [`cleanup_resources`](Plugin::cleanup_resources).
    async fn cleanup(&mut self, ctx: &mut PluginContext) -> Result<(), PluginError> {
        self.cleanup_resources(ctx).await
    }

    /// Release any resources still held. Called from the default
    /// `cleanup`; override this rather than `cleanup` in most plugins.
    async fn cleanup_resources(&mut self, _ctx: &mut PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called when the host replaces the plugin's configuration. Returning
    /// an error rejects the new configuration and the host rolls back.
    async fn on_config_changed(
        &mut self,
        _old: &std::collections::HashMap<String, serde_json::Value>,
        _new: &std::collections::HashMap<String, serde_json::Value>,
        _ctx: &mut PluginContext,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    /// Event subscriptions this plugin wants. The host registers these
    /// with its bus after `initialize` and removes them at unload.
    fn declare_handlers(&self) -> Vec<HandlerSpec> {
        Vec::new()
    }

    // ─── Capability accessors (default None) ─────────────────────────

    /// Message pipeline capability, if this plugin handles messages
    fn as_message_handler(&mut self) -> Option<&mut dyn MessageHandler> {
        None
    }

    /// Command capability, if this plugin provides commands
    fn as_command_provider(&mut self) -> Option<&mut dyn CommandProvider> {
        None
    }

    /// Tool capability, if this plugin exposes tools
    fn as_tool_provider(&mut self) -> Option<&mut dyn ToolProvider> {
        None
    }

    /// Service capability, if this plugin runs a background service
    fn as_service(&mut self) -> Option<&mut dyn Service> {
        None
    }
}

impl std::fmt::Debug for dyn Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin").field("info", &self.info()).finish()
    }
}

/// Export a plugin type for dynamic loading.
///
/// This macro generates the C ABI entry points that the murmur host uses
/// to load and unload plugins dynamically.
///
/// # Usage
///
/// ```ignore
/// murmur_plugin_api::export_plugin!(MyPlugin);
/// ```
///
/// # Generated Functions
///
/// - `_murmur_plugin_create()`: Creates a new plugin instance
/// - `_murmur_plugin_api_version()`: Returns the API version
/// - `_murmur_plugin_manifest()`: Returns the plugin's metadata as a JSON C string
/// - `_murmur_plugin_manifest_free()`: Frees a string returned by `_murmur_plugin_manifest`
/// - `_murmur_plugin_destroy()`: Destroys a plugin instance
#[macro_export]
macro_rules! export_plugin {
    ($plugin_type:ty) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn _murmur_plugin_create() -> *mut dyn $crate::Plugin {
            let plugin: Box<dyn $crate::Plugin> = Box::new(<$plugin_type>::default());
            Box::into_raw(plugin)
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _murmur_plugin_api_version() -> u32 {
            $crate::API_VERSION
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _murmur_plugin_manifest() -> *mut std::os::raw::c_char {
            let info = <$plugin_type>::default().info();
            let json = match serde_json::to_string(&info) {
                Ok(json) => json,
                Err(_) => return std::ptr::null_mut(),
            };
            match std::ffi::CString::new(json) {
                Ok(c) => c.into_raw(),
                Err(_) => std::ptr::null_mut(),
            }
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _murmur_plugin_manifest_free(ptr: *mut std::os::raw::c_char) {
            if !ptr.is_null() {
                unsafe {
                    drop(std::ffi::CString::from_raw(ptr));
                }
            }
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _murmur_plugin_destroy(ptr: *mut dyn $crate::Plugin) {
            if !ptr.is_null() {
                unsafe {
                    drop(Box::from_raw(ptr));
                }
            }
        }
    };
}

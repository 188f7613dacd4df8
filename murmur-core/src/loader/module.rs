//! Module loading seam
//!
//! `ModuleLoader` abstracts how a plugin entry point becomes a live
//! instance. `DylibModuleLoader` is the real implementation over the
//! versioned C-ABI symbols; `StaticModuleLoader` maps entry paths to
//! registered factories so the host can be tested without building
//! dynamic libraries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use libloading::Library;
use murmur_plugin_api::{API_VERSION, Plugin, PluginInfo};

use crate::error::HostError;

/// A loaded code unit: the live instance, its introspected metadata, and
/// the library keeping the code mapped. The instance must be dropped
/// before the library; the loader sequences this.
#[derive(Debug)]
pub struct LoadedModule {
    pub instance: Box<dyn Plugin>,
    pub info: PluginInfo,
    pub library: Option<Library>,
}

/// Turns an entry-point path into a plugin instance.
pub trait ModuleLoader: Send + Sync {
    /// Load the module and instantiate its plugin.
    fn load(&self, entry: &Path) -> Result<LoadedModule, HostError>;

    /// Read the module's metadata without keeping it loaded.
    fn introspect(&self, entry: &Path) -> Result<PluginInfo, HostError>;
}

/// Real loader over `libloading`.
pub struct DylibModuleLoader;

type CreateFn = extern "C" fn() -> *mut dyn Plugin;
type ApiVersionFn = extern "C" fn() -> u32;
type ManifestFn = extern "C" fn() -> *mut std::os::raw::c_char;
type ManifestFreeFn = extern "C" fn(*mut std::os::raw::c_char);

impl DylibModuleLoader {
    fn open(entry: &Path) -> Result<Library, HostError> {
        // SAFETY: loading a library the host operator placed in a plugin
        // directory; the contract symbols are verified before use.
        let library = unsafe { Library::new(entry)? };

        let api_version_fn: libloading::Symbol<ApiVersionFn> =
            unsafe { library.get(b"_murmur_plugin_api_version") }
                .map_err(|_| HostError::NoContract(entry.to_path_buf()))?;

        let found = api_version_fn();
        if found != API_VERSION {
            return Err(HostError::ApiVersionMismatch {
                expected: API_VERSION,
                found,
            });
        }

        drop(api_version_fn);
        Ok(library)
    }
}

impl ModuleLoader for DylibModuleLoader {
    fn load(&self, entry: &Path) -> Result<LoadedModule, HostError> {
        let library = Self::open(entry)?;

        // SAFETY: the create symbol returns a Box::into_raw'd trait object
        // per the export_plugin! contract.
        let create_fn: libloading::Symbol<CreateFn> = unsafe {
            library.get(b"_murmur_plugin_create")
        }
        .map_err(|_| HostError::NoContract(entry.to_path_buf()))?;

        let instance = unsafe { Box::from_raw(create_fn()) };
        let info = instance.info();
        drop(create_fn);

        Ok(LoadedModule {
            instance,
            info,
            library: Some(library),
        })
    }

    fn introspect(&self, entry: &Path) -> Result<PluginInfo, HostError> {
        let library = Self::open(entry)?;

        // SAFETY: manifest symbols follow the export_plugin! contract;
        // the returned string is freed through the paired free symbol.
        let manifest_fn: libloading::Symbol<ManifestFn> = unsafe {
            library.get(b"_murmur_plugin_manifest")
        }
        .map_err(|_| HostError::NoContract(entry.to_path_buf()))?;
        let free_fn: libloading::Symbol<ManifestFreeFn> = unsafe {
            library.get(b"_murmur_plugin_manifest_free")
        }
        .map_err(|_| HostError::NoContract(entry.to_path_buf()))?;

        let raw = manifest_fn();
        if raw.is_null() {
            return Err(HostError::NoContract(entry.to_path_buf()));
        }

        let json = unsafe { std::ffi::CStr::from_ptr(raw) }
            .to_string_lossy()
            .into_owned();
        free_fn(raw);

        let mut info: PluginInfo = serde_json::from_str(&json)?;
        info.entry_point = entry.to_string_lossy().into_owned();
        info.validate()?;
        Ok(info)
    }
}

/// Factory used by [`StaticModuleLoader`]
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// In-process loader for tests and statically linked plugins. Entry paths
/// map to registered factories; no code is actually loaded.
#[derive(Default)]
pub struct StaticModuleLoader {
    factories: Mutex<HashMap<PathBuf, PluginFactory>>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map an entry path to a plugin factory.
    pub fn register<F>(&self, entry: impl Into<PathBuf>, factory: F)
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entry.into(), Arc::new(factory));
    }

    fn factory(&self, entry: &Path) -> Result<PluginFactory, HostError> {
        self.factories
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(entry)
            .cloned()
            .ok_or_else(|| HostError::NoContract(entry.to_path_buf()))
    }
}

impl ModuleLoader for StaticModuleLoader {
    fn load(&self, entry: &Path) -> Result<LoadedModule, HostError> {
        let instance = (self.factory(entry)?)();
        let info = instance.info();
        Ok(LoadedModule {
            instance,
            info,
            library: None,
        })
    }

    fn introspect(&self, entry: &Path) -> Result<PluginInfo, HostError> {
        let instance = (self.factory(entry)?)();
        Ok(instance.info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use murmur_plugin_api::{PluginContext, PluginError, PluginType};

    #[derive(Default)]
    struct Probe;

    #[async_trait]
    impl Plugin for Probe {
        fn info(&self) -> PluginInfo {
            PluginInfo::new("probe", "1.0.0", PluginType::Extension, "probe.so")
        }

        async fn initialize(&mut self, _ctx: &mut PluginContext) -> Result<(), PluginError> {
            Ok(())
        }

        async fn start(&mut self, _ctx: &mut PluginContext) -> Result<(), PluginError> {
            Ok(())
        }

        async fn stop(&mut self, _ctx: &mut PluginContext) -> Result<(), PluginError> {
            Ok(())
        }
    }

    #[test]
    fn test_static_loader_load_and_introspect() {
        let loader = StaticModuleLoader::new();
        loader.register("probe.so", || Box::new(Probe));

        let info = loader.introspect(Path::new("probe.so")).unwrap();
        assert_eq!(info.name, "probe");

        let module = loader.load(Path::new("probe.so")).unwrap();
        assert_eq!(module.info.name, "probe");
        assert!(module.library.is_none());
    }

    #[test]
    fn test_static_loader_unknown_entry() {
        let loader = StaticModuleLoader::new();
        let err = loader.load(Path::new("missing.so")).unwrap_err();
        assert!(matches!(err, HostError::NoContract(_)));
    }

    #[test]
    fn test_dylib_loader_missing_file() {
        let loader = DylibModuleLoader;
        let err = loader.load(Path::new("/nonexistent/plugin.so")).unwrap_err();
        assert!(matches!(err, HostError::LibraryLoad(_)));
    }
}

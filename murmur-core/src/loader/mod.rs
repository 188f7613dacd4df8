//! Manifest-driven plugin discovery and loading
//!
//! The loader scans configured directories for three plugin shapes:
//! directories carrying a manifest file, bare dynamic libraries, and
//! `.tar.gz` archives. Discovery failures are logged and skipped; a bad
//! plugin never aborts the scan. Loading verifies dependencies against
//! the discovered set, instantiates the module through a [`ModuleLoader`],
//! and retains the backing library until the plugin is unloaded.

pub mod archive;
mod module;

pub use module::{
    DylibModuleLoader, LoadedModule, ModuleLoader, PluginFactory, StaticModuleLoader,
};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use murmur_plugin_api::{
    MANIFEST_STEMS, ManifestFormat, Plugin, PluginContext, PluginInfo, PluginManifest,
};
use serde_json::Value;

use crate::error::HostError;
use crate::loader::archive::DYLIB_EXTENSIONS;

const MANIFEST_EXTENSIONS: &[&str] = &["json", "yaml", "yml", "toml"];

/// Discovers and loads plugins from a set of directories.
pub struct PluginLoader {
    dirs: Vec<PathBuf>,
    modules: Arc<dyn ModuleLoader>,
    discovered: HashMap<String, PluginInfo>,
    // Keeps each loaded plugin's library mapped until unload
    retained: HashMap<String, Option<Library>>,
}

impl PluginLoader {
    /// Create a loader over the given search directories, using the real
    /// dynamic-library module loader.
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self::with_module_loader(dirs, Arc::new(DylibModuleLoader))
    }

    /// Create a loader with an explicit module loader. Tests pass a
    /// [`StaticModuleLoader`].
    pub fn with_module_loader(dirs: Vec<PathBuf>, modules: Arc<dyn ModuleLoader>) -> Self {
        Self {
            dirs,
            modules,
            discovered: HashMap::new(),
            retained: HashMap::new(),
        }
    }

    // ─── Discovery ───────────────────────────────────────────────────

    /// Scan all directories, refreshing the discovered set. Earlier
    /// directories win name collisions. Individual entries that fail to
    /// parse are logged and skipped.
    pub fn discover(&mut self) -> Vec<PluginInfo> {
        self.discovered.clear();

        for base in self.dirs.clone() {
            if !base.is_dir() {
                tracing::debug!(dir = %base.display(), "Plugin directory does not exist");
                continue;
            }

            let entries = match std::fs::read_dir(&base) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(dir = %base.display(), error = %e, "Failed to read plugin directory");
                    continue;
                }
            };

            for entry in entries {
                let path = match entry {
                    Ok(entry) => entry.path(),
                    Err(e) => {
                        tracing::warn!(dir = %base.display(), error = %e, "Failed to read directory entry");
                        continue;
                    }
                };

                match self.discover_entry(&path) {
                    Ok(Some(info)) => {
                        if self.discovered.contains_key(&info.name) {
                            tracing::debug!(
                                plugin = %info.name,
                                path = %path.display(),
                                "Duplicate plugin name, earlier directory wins"
                            );
                            continue;
                        }
                        tracing::info!(
                            plugin = %info.name,
                            version = %info.version,
                            path = %path.display(),
                            "Discovered plugin"
                        );
                        self.discovered.insert(info.name.clone(), info);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping undiscoverable plugin");
                    }
                }
            }
        }

        let mut infos: Vec<_> = self.discovered.values().cloned().collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Classify and parse one directory entry. `Ok(None)` means the entry
    /// is not a plugin shape at all.
    fn discover_entry(&self, path: &Path) -> Result<Option<PluginInfo>, HostError> {
        if path.is_dir() {
            let Some(manifest_path) = find_manifest(path) else {
                return Ok(None);
            };
            return self.parse_dir_manifest(path, &manifest_path).map(Some);
        }

        if archive::is_archive(path) {
            let manifest = archive::read_manifest(path)?;
            let info = manifest.into_info(path.to_string_lossy().into_owned())?;
            return Ok(Some(info));
        }

        let is_dylib = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| DYLIB_EXTENSIONS.contains(&e));
        if is_dylib {
            let mut info = self.modules.introspect(path)?;
            info.entry_point = path.to_string_lossy().into_owned();
            return Ok(Some(info));
        }

        Ok(None)
    }

    fn parse_dir_manifest(
        &self,
        dir: &Path,
        manifest_path: &Path,
    ) -> Result<PluginInfo, HostError> {
        let format =
            ManifestFormat::from_path(manifest_path).ok_or_else(|| HostError::ManifestInvalid {
                path: manifest_path.to_path_buf(),
                reason: "unrecognized manifest format".to_string(),
            })?;
        let content = std::fs::read_to_string(manifest_path)?;
        let manifest =
            PluginManifest::parse(&content, format).map_err(|e| HostError::ManifestInvalid {
                path: manifest_path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let entry = match manifest.entry_point {
            Some(ref rel) => dir.join(rel),
            None => find_library(dir, &manifest.name).ok_or_else(|| HostError::ManifestInvalid {
                path: manifest_path.to_path_buf(),
                reason: format!("no entry_point and no library named '{}'", manifest.name),
            })?,
        };

        Ok(manifest.into_info(entry.to_string_lossy().into_owned())?)
    }

    /// The current discovered set, keyed by name.
    pub fn discovered(&self) -> &HashMap<String, PluginInfo> {
        &self.discovered
    }

    pub fn get_discovered(&self, name: &str) -> Option<&PluginInfo> {
        self.discovered.get(name)
    }

    // ─── Loading ─────────────────────────────────────────────────────

    /// Load a discovered plugin: verify dependencies, resolve the entry
    /// point (extracting archives into `temp_dir`), instantiate the
    /// module, and build the instance's context. The backing library is
    /// retained until [`unload`](Self::unload).
    pub fn load(
        &mut self,
        info: &PluginInfo,
        config: HashMap<String, Value>,
        data_dir: PathBuf,
        temp_dir: PathBuf,
    ) -> Result<(Box<dyn Plugin>, PluginContext), HostError> {
        if self.retained.contains_key(&info.name) {
            return Err(HostError::AlreadyLoaded(info.name.clone()));
        }

        // All dependencies must be discoverable or already loaded
        for dep in &info.dependencies {
            if !self.discovered.contains_key(dep) && !self.retained.contains_key(dep) {
                return Err(HostError::MissingDependency {
                    plugin: info.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let entry_path = Path::new(&info.entry_point);
        let entry = if archive::is_archive(entry_path) {
            archive::extract_dylib(entry_path, &temp_dir)?
        } else {
            entry_path.to_path_buf()
        };

        let module = self.modules.load(&entry)?;
        if module.info.name != info.name {
            tracing::warn!(
                manifest_name = %info.name,
                module_name = %module.info.name,
                "Module reports a different name than its manifest"
            );
        }

        let permissions: HashSet<String> = info.permissions.iter().cloned().collect();
        let context = PluginContext::new(info.clone(), config, data_dir, temp_dir, permissions);

        self.retained.insert(info.name.clone(), module.library);
        tracing::debug!(plugin = %info.name, entry = %entry.display(), "Plugin module loaded");
        Ok((module.instance, context))
    }

    /// Drop the retained library for a plugin. The caller must have
    /// dropped the plugin instance first.
    pub fn unload(&mut self, name: &str) -> bool {
        let unloaded = self.retained.remove(name).is_some();
        if unloaded {
            tracing::debug!(plugin = %name, "Plugin module unloaded");
        }
        unloaded
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.retained.contains_key(name)
    }
}

fn find_manifest(dir: &Path) -> Option<PathBuf> {
    for stem in MANIFEST_STEMS {
        for ext in MANIFEST_EXTENSIONS {
            let candidate = dir.join(format!("{stem}.{ext}"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Look for `<name>.<ext>` or `lib<name>.<ext>` in a plugin directory.
fn find_library(dir: &Path, name: &str) -> Option<PathBuf> {
    for ext in DYLIB_EXTENSIONS {
        for candidate in [format!("{name}.{ext}"), format!("lib{name}.{ext}")] {
            let path = dir.join(candidate);
            if path.is_file() {
                return Some(path);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use murmur_plugin_api::{PluginError, PluginType};
    use tempfile::TempDir;

    struct Probe {
        info: PluginInfo,
    }

    #[async_trait]
    impl Plugin for Probe {
        fn info(&self) -> PluginInfo {
            self.info.clone()
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

    fn probe_factory(name: &str) -> impl Fn() -> Box<dyn Plugin> + Send + Sync + 'static {
        let info = PluginInfo::new(name, "1.0.0", PluginType::Extension, format!("{name}.so"));
        move || {
            Box::new(Probe {
                info: info.clone(),
            })
        }
    }

    fn write_manifest_dir(base: &Path, name: &str, manifest: &str, manifest_file: &str) -> PathBuf {
        let dir = base.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(manifest_file), manifest).unwrap();
        dir
    }

    #[test]
    fn test_discover_manifest_directory_json() {
        let base = TempDir::new().unwrap();
        write_manifest_dir(
            base.path(),
            "echo",
            r#"{"name":"echo","version":"1.0.0","entry_point":"echo.so"}"#,
            "plugin.json",
        );

        let mut loader = PluginLoader::with_module_loader(
            vec![base.path().to_path_buf()],
            Arc::new(StaticModuleLoader::new()),
        );
        let infos = loader.discover();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "echo");
        assert!(infos[0].entry_point.ends_with("echo.so"));
    }

    #[test]
    fn test_discover_all_manifest_formats() {
        let base = TempDir::new().unwrap();
        write_manifest_dir(
            base.path(),
            "a",
            r#"{"name":"a","version":"1.0","entry_point":"a.so"}"#,
            "plugin.json",
        );
        write_manifest_dir(
            base.path(),
            "b",
            "name: b\nversion: '1.0'\nentry_point: b.so\n",
            "plugin.yaml",
        );
        write_manifest_dir(
            base.path(),
            "c",
            "name = \"c\"\nversion = \"1.0\"\nentry_point = \"c.so\"\n",
            "manifest.toml",
        );

        let mut loader = PluginLoader::with_module_loader(
            vec![base.path().to_path_buf()],
            Arc::new(StaticModuleLoader::new()),
        );
        let infos = loader.discover();
        let names: Vec<_> = infos.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_discover_skips_invalid_manifest() {
        let base = TempDir::new().unwrap();
        write_manifest_dir(base.path(), "bad", "{not json", "plugin.json");
        write_manifest_dir(
            base.path(),
            "good",
            r#"{"name":"good","version":"1.0","entry_point":"good.so"}"#,
            "plugin.json",
        );

        let mut loader = PluginLoader::with_module_loader(
            vec![base.path().to_path_buf()],
            Arc::new(StaticModuleLoader::new()),
        );
        let infos = loader.discover();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "good");
    }

    #[test]
    fn test_discover_bare_dylib_via_introspection() {
        let base = TempDir::new().unwrap();
        let dylib = base.path().join("probe.so");
        std::fs::write(&dylib, b"fake").unwrap();

        let statics = StaticModuleLoader::new();
        statics.register(&dylib, probe_factory("probe"));

        let mut loader = PluginLoader::with_module_loader(
            vec![base.path().to_path_buf()],
            Arc::new(statics),
        );
        let infos = loader.discover();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "probe");
        assert_eq!(infos[0].entry_point, dylib.to_string_lossy());
    }

    #[test]
    fn test_discover_archive() {
        let base = TempDir::new().unwrap();
        let manifest = br#"{"name":"packaged","version":"2.0.0","entry_point":"packaged.so"}"#;

        // Reuse the archive writer shape from the archive module tests
        let path = base.path().join("packaged.tar.gz");
        let file = std::fs::File::create(&path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "plugin.json", &manifest[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let mut loader = PluginLoader::with_module_loader(
            vec![base.path().to_path_buf()],
            Arc::new(StaticModuleLoader::new()),
        );
        let infos = loader.discover();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "packaged");
        assert!(infos[0].entry_point.ends_with(".tar.gz"));
    }

    #[test]
    fn test_earlier_directory_wins_collision() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        write_manifest_dir(
            first.path(),
            "echo",
            r#"{"name":"echo","version":"2.0.0","entry_point":"echo.so"}"#,
            "plugin.json",
        );
        write_manifest_dir(
            second.path(),
            "echo",
            r#"{"name":"echo","version":"1.0.0","entry_point":"echo.so"}"#,
            "plugin.json",
        );

        let mut loader = PluginLoader::with_module_loader(
            vec![first.path().to_path_buf(), second.path().to_path_buf()],
            Arc::new(StaticModuleLoader::new()),
        );
        let infos = loader.discover();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].version, "2.0.0");
    }

    fn loader_with_probe(name: &str) -> (PluginLoader, PluginInfo) {
        let statics = StaticModuleLoader::new();
        statics.register(format!("{name}.so"), probe_factory(name));
        let loader = PluginLoader::with_module_loader(Vec::new(), Arc::new(statics));
        let info = PluginInfo::new(name, "1.0.0", PluginType::Extension, format!("{name}.so"));
        (loader, info)
    }

    #[test]
    fn test_load_builds_context_with_declared_permissions() {
        let (mut loader, mut info) = loader_with_probe("probe");
        info.permissions = vec!["events.emit".to_string()];
        loader.discovered.insert("probe".to_string(), info.clone());

        let (instance, context) = loader
            .load(
                &info,
                HashMap::new(),
                PathBuf::from("/tmp/data"),
                PathBuf::from("/tmp/scratch"),
            )
            .unwrap();

        assert_eq!(instance.info().name, "probe");
        assert!(context.has_permission("events.emit"));
        assert!(!context.has_permission("net.http"));
        assert!(loader.is_loaded("probe"));
    }

    #[test]
    fn test_load_rejects_missing_dependency() {
        let (mut loader, mut info) = loader_with_probe("probe");
        info.dependencies = vec!["ghost".to_string()];
        loader.discovered.insert("probe".to_string(), info.clone());

        let err = loader
            .load(&info, HashMap::new(), PathBuf::new(), PathBuf::new())
            .unwrap_err();
        assert!(matches!(
            err,
            HostError::MissingDependency { ref dependency, .. } if dependency == "ghost"
        ));
        assert!(!loader.is_loaded("probe"));
    }

    #[test]
    fn test_load_twice_is_already_loaded() {
        let (mut loader, info) = loader_with_probe("probe");
        loader.discovered.insert("probe".to_string(), info.clone());

        loader
            .load(&info, HashMap::new(), PathBuf::new(), PathBuf::new())
            .unwrap();
        let err = loader
            .load(&info, HashMap::new(), PathBuf::new(), PathBuf::new())
            .unwrap_err();
        assert!(matches!(err, HostError::AlreadyLoaded(_)));
    }

    #[test]
    fn test_unload() {
        let (mut loader, info) = loader_with_probe("probe");
        loader.discovered.insert("probe".to_string(), info.clone());

        let (instance, _context) = loader
            .load(&info, HashMap::new(), PathBuf::new(), PathBuf::new())
            .unwrap();
        drop(instance);

        assert!(loader.unload("probe"));
        assert!(!loader.unload("probe"));
        assert!(!loader.is_loaded("probe"));
    }
}

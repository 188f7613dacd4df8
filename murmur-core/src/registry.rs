//! Persistent plugin registry
//!
//! Tracks every discovered plugin's metadata with secondary indexes by
//! type, author, and tag. The registry is persisted as a single JSON
//! document rewritten atomically on every mutation; a missing or corrupt
//! file degrades to an empty registry with a warning, never an error.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use murmur_plugin_api::{PluginInfo, PluginType};
use serde::{Deserialize, Serialize};

use crate::error::HostError;

const REGISTRY_FORMAT_VERSION: u32 = 1;

/// On-disk registry document
#[derive(Debug, Serialize, Deserialize)]
struct RegistryDocument {
    version: u32,
    updated_at: DateTime<Utc>,
    plugins: Vec<PluginInfo>,
}

/// Search filters for [`PluginRegistry::search`]. `query` is matched
/// case-insensitively against name, description, and tags; the remaining
/// fields are exact filters applied on top.
#[derive(Debug, Default, Clone)]
pub struct SearchFilter {
    pub query: String,
    pub plugin_type: Option<PluginType>,
    pub author: Option<String>,
    pub tags: Vec<String>,
}

/// Aggregate counts over the registry contents
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatistics {
    pub total: usize,
    pub by_type: HashMap<String, usize>,
    pub by_author: HashMap<String, usize>,
    pub by_tag: HashMap<String, usize>,
}

/// Name-keyed plugin metadata store with secondary indexes.
pub struct PluginRegistry {
    path: Option<PathBuf>,
    plugins: HashMap<String, PluginInfo>,
    by_type: HashMap<PluginType, HashSet<String>>,
    by_author: HashMap<String, HashSet<String>>,
    by_tag: HashMap<String, HashSet<String>>,
}

impl PluginRegistry {
    /// Create an in-memory registry with no persistence.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            plugins: HashMap::new(),
            by_type: HashMap::new(),
            by_author: HashMap::new(),
            by_tag: HashMap::new(),
        }
    }

    /// Open a registry backed by the given file, loading any existing
    /// contents. A corrupt file is logged and treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut registry = Self {
            path: Some(path.clone()),
            plugins: HashMap::new(),
            by_type: HashMap::new(),
            by_author: HashMap::new(),
            by_tag: HashMap::new(),
        };

        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<RegistryDocument>(&content) {
                Ok(doc) => {
                    for info in doc.plugins {
                        registry.index(&info);
                        registry.plugins.insert(info.name.clone(), info);
                    }
                    tracing::debug!(
                        path = %path.display(),
                        count = registry.plugins.len(),
                        "Loaded plugin registry"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Corrupt plugin registry, starting empty"
                    );
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to read plugin registry, starting empty"
                );
            }
        }

        registry
    }

    /// Register or replace a plugin's metadata.
    pub fn register(&mut self, info: PluginInfo) -> Result<(), HostError> {
        info.validate()?;

        if let Some(existing) = self.plugins.get(&info.name) {
            if existing.version != info.version {
                tracing::info!(
                    plugin = %info.name,
                    old_version = %existing.version,
                    new_version = %info.version,
                    "Plugin version changed"
                );
            }
            let old = existing.clone();
            self.unindex(&old);
        }

        self.index(&info);
        self.plugins.insert(info.name.clone(), info);
        self.persist();
        Ok(())
    }

    /// Remove a plugin. Returns the removed metadata, if any.
    pub fn unregister(&mut self, name: &str) -> Option<PluginInfo> {
        let info = self.plugins.remove(name)?;
        self.unindex(&info);
        self.persist();
        Some(info)
    }

    pub fn get(&self, name: &str) -> Option<&PluginInfo> {
        self.plugins.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn list_all(&self) -> Vec<&PluginInfo> {
        let mut all: Vec<_> = self.plugins.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn list_by_type(&self, plugin_type: PluginType) -> Vec<&PluginInfo> {
        self.names_to_infos(self.by_type.get(&plugin_type))
    }

    pub fn list_by_author(&self, author: &str) -> Vec<&PluginInfo> {
        self.names_to_infos(self.by_author.get(author))
    }

    pub fn list_by_tag(&self, tag: &str) -> Vec<&PluginInfo> {
        self.names_to_infos(self.by_tag.get(tag))
    }

    /// Search the registry. The text query matches name, description, and
    /// tags case-insensitively; empty query matches everything. Filters
    /// are conjunctive.
    pub fn search(&self, filter: &SearchFilter) -> Vec<&PluginInfo> {
        let needle = filter.query.to_lowercase();

        let mut results: Vec<_> = self
            .plugins
            .values()
            .filter(|info| {
                if !needle.is_empty() {
                    let text_match = info.name.to_lowercase().contains(&needle)
                        || info.description.to_lowercase().contains(&needle)
                        || info.tags.iter().any(|t| t.to_lowercase().contains(&needle));
                    if !text_match {
                        return false;
                    }
                }
                if let Some(pt) = filter.plugin_type {
                    if info.plugin_type != pt {
                        return false;
                    }
                }
                if let Some(ref author) = filter.author {
                    if &info.author != author {
                        return false;
                    }
                }
                filter.tags.iter().all(|t| info.tags.contains(t))
            })
            .collect();

        results.sort_by(|a, b| a.name.cmp(&b.name));
        results
    }

    /// Aggregate counts per type, author, and tag.
    pub fn statistics(&self) -> RegistryStatistics {
        let mut by_type = HashMap::new();
        let mut by_author = HashMap::new();
        let mut by_tag = HashMap::new();

        for info in self.plugins.values() {
            *by_type.entry(info.plugin_type.to_string()).or_insert(0) += 1;
            if !info.author.is_empty() {
                *by_author.entry(info.author.clone()).or_insert(0) += 1;
            }
            for tag in &info.tags {
                *by_tag.entry(tag.clone()).or_insert(0) += 1;
            }
        }

        RegistryStatistics {
            total: self.plugins.len(),
            by_type,
            by_author,
            by_tag,
        }
    }

    // ─── Internals ───────────────────────────────────────────────────

    fn names_to_infos(&self, names: Option<&HashSet<String>>) -> Vec<&PluginInfo> {
        let mut infos: Vec<_> = names
            .into_iter()
            .flatten()
            .filter_map(|n| self.plugins.get(n))
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    fn index(&mut self, info: &PluginInfo) {
        self.by_type
            .entry(info.plugin_type)
            .or_default()
            .insert(info.name.clone());
        if !info.author.is_empty() {
            self.by_author
                .entry(info.author.clone())
                .or_default()
                .insert(info.name.clone());
        }
        for tag in &info.tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(info.name.clone());
        }
    }

    fn unindex(&mut self, info: &PluginInfo) {
        if let Some(set) = self.by_type.get_mut(&info.plugin_type) {
            set.remove(&info.name);
            if set.is_empty() {
                self.by_type.remove(&info.plugin_type);
            }
        }
        if let Some(set) = self.by_author.get_mut(&info.author) {
            set.remove(&info.name);
            if set.is_empty() {
                self.by_author.remove(&info.author);
            }
        }
        for tag in &info.tags {
            if let Some(set) = self.by_tag.get_mut(tag) {
                set.remove(&info.name);
                if set.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
    }

    /// Write the registry document atomically. Failure is logged and
    /// swallowed: an unwritable registry must not take down the host.
    fn persist(&self) {
        let Some(ref path) = self.path else {
            return;
        };
        if let Err(e) = self.write_document(path) {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Failed to persist plugin registry"
            );
        }
    }

    fn write_document(&self, path: &Path) -> Result<(), HostError> {
        let mut plugins: Vec<_> = self.plugins.values().cloned().collect();
        plugins.sort_by(|a, b| a.name.cmp(&b.name));

        let doc = RegistryDocument {
            version: REGISTRY_FORMAT_VERSION,
            updated_at: Utc::now(),
            plugins,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Temp file + rename so readers never observe a partial document
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&doc)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

//! Plugin manifest parsing
//!
//! A manifest is a `plugin.{json,yaml,yml,toml}` or `manifest.*` file that
//! describes a plugin without loading its code. Unknown fields are ignored;
//! a manifest missing `name` or `version` is rejected.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;
use crate::types::{PluginInfo, PluginType};

/// File stems recognized as manifests during discovery.
pub const MANIFEST_STEMS: &[&str] = &["plugin", "manifest"];

/// Supported manifest file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Json,
    Yaml,
    Toml,
}

impl ManifestFormat {
    /// Determine the format from a file extension, if recognized.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }
}

/// On-disk manifest form.
///
/// `name` and `version` are required; everything else is optional and
/// defaults to empty. The `entry_point` field is relative to the plugin
/// directory and resolved by the loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, rename = "type")]
    pub plugin_type: PluginType,
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub config_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub min_system_version: Option<String>,
    #[serde(default)]
    pub max_system_version: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
}

impl PluginManifest {
    /// Parse a manifest from a string in the given format.
    pub fn parse(content: &str, format: ManifestFormat) -> Result<Self, PluginError> {
        let manifest: Self = match format {
            ManifestFormat::Json => serde_json::from_str(content)
                .map_err(|e| PluginError::manifest(format!("invalid JSON manifest: {e}")))?,
            ManifestFormat::Yaml => serde_yaml::from_str(content)
                .map_err(|e| PluginError::manifest(format!("invalid YAML manifest: {e}")))?,
            ManifestFormat::Toml => toml::from_str(content)
                .map_err(|e| PluginError::manifest(format!("invalid TOML manifest: {e}")))?,
        };
        Ok(manifest)
    }

    /// Convert into a validated [`PluginInfo`] with a resolved entry point.
    pub fn into_info(self, entry_point: String) -> Result<PluginInfo, PluginError> {
        let info = PluginInfo {
            name: self.name,
            version: self.version,
            description: self.description,
            author: self.author,
            plugin_type: self.plugin_type,
            entry_point,
            dependencies: self.dependencies,
            permissions: self.permissions,
            config_schema: self.config_schema,
            min_system_version: self.min_system_version,
            max_system_version: self.max_system_version,
            tags: self.tags,
            homepage: self.homepage,
            repository: self.repository,
            license: self.license,
        };
        info.validate()?;
        Ok(info)
    }
}

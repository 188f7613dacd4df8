//! Packaged plugin archives
//!
//! A packaged plugin is a `.tar.gz` holding a manifest file and the
//! platform dynamic library. Discovery reads only the manifest; the
//! dylib is extracted to the plugin's temp directory at load time.

use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use murmur_plugin_api::{MANIFEST_STEMS, ManifestFormat, PluginManifest};
use tar::Archive;

use crate::error::HostError;

pub const DYLIB_EXTENSIONS: &[&str] = &["so", "dylib", "dll"];

/// Whether a path looks like a packaged plugin archive.
pub fn is_archive(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

fn open(path: &Path) -> Result<Archive<GzDecoder<std::fs::File>>, HostError> {
    let file = std::fs::File::open(path)?;
    Ok(Archive::new(GzDecoder::new(file)))
}

fn is_manifest_name(path: &Path) -> bool {
    let stem_ok = path
        .file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|s| MANIFEST_STEMS.contains(&s));
    stem_ok && ManifestFormat::from_path(path).is_some()
}

/// Read the manifest out of an archive without extracting anything else.
pub fn read_manifest(path: &Path) -> Result<PluginManifest, HostError> {
    let mut archive = open(path)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        if !is_manifest_name(&entry_path) {
            continue;
        }

        let format = ManifestFormat::from_path(&entry_path).ok_or_else(|| {
            HostError::ManifestInvalid {
                path: path.to_path_buf(),
                reason: "unrecognized manifest format".to_string(),
            }
        })?;

        let mut content = String::new();
        entry.read_to_string(&mut content)?;
        return PluginManifest::parse(&content, format).map_err(|e| HostError::ManifestInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        });
    }

    Err(HostError::ManifestInvalid {
        path: path.to_path_buf(),
        reason: "archive contains no manifest file".to_string(),
    })
}

/// Extract the archive's dynamic library into `dest_dir` and return the
/// extracted path.
pub fn extract_dylib(path: &Path, dest_dir: &Path) -> Result<PathBuf, HostError> {
    let mut archive = open(path)?;
    std::fs::create_dir_all(dest_dir)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();

        let is_dylib = entry_path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| DYLIB_EXTENSIONS.contains(&e));
        if !is_dylib {
            continue;
        }

        // Flatten: only the file name matters, never nested archive paths
        let Some(file_name) = entry_path.file_name() else {
            continue;
        };
        let dest = dest_dir.join(file_name);
        entry.unpack(&dest)?;
        tracing::debug!(
            archive = %path.display(),
            dylib = %dest.display(),
            "Extracted plugin library"
        );
        return Ok(dest);
    }

    Err(HostError::NoContract(path.to_path_buf()))
}

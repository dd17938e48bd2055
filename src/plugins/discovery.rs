//! Plugin discovery - scan directories for `switchboard.plugin.json` manifests

use std::path::{Path, PathBuf};

use super::manifest::PluginManifest;

/// Manifest file name looked for in each plugin directory
pub const MANIFEST_FILE: &str = "switchboard.plugin.json";

/// Scan plugin directories for manifests
///
/// Looks for manifests in immediate subdirectories of each search path and
/// returns `(directory, manifest)` pairs sorted by directory, so discovery
/// order does not depend on the filesystem.
#[must_use]
pub fn discover_plugins(dirs: &[PathBuf]) -> Vec<(PathBuf, PluginManifest)> {
    let mut results = Vec::new();

    for dir in dirs {
        if !dir.is_dir() {
            tracing::debug!(path = %dir.display(), "plugin directory does not exist, skipping");
            continue;
        }

        let Ok(entries) = std::fs::read_dir(dir) else {
            tracing::warn!(path = %dir.display(), "failed to read plugin directory");
            continue;
        };

        let mut found: Vec<_> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .filter_map(|path| load_manifest(&path.join(MANIFEST_FILE)).map(|m| (path, m)))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));

        for (path, manifest) in &found {
            tracing::debug!(plugin_id = %manifest.id, path = %path.display(), "discovered plugin");
        }
        results.extend(found);
    }

    results
}

/// Load and parse a single manifest file
fn load_manifest(path: &Path) -> Option<PluginManifest> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<PluginManifest>(&content) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to parse plugin manifest");
            None
        }
    }
}

/// Default plugin search directories
#[must_use]
pub fn default_plugin_dirs() -> Vec<PathBuf> {
    let Some(base) = directories::BaseDirs::new() else {
        return Vec::new();
    };

    vec![
        base.config_dir().join("omni").join("switchboard").join("plugins"),
        base.data_dir().join("omni").join("switchboard").join("plugins"),
    ]
}

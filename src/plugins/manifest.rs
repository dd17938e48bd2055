//! Plugin manifest format (`switchboard.plugin.json`)

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Plugin manifest describing a plugin's metadata and what it provides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin identifier (e.g. "acme.fakechat")
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Semver version string
    pub version: String,
    /// Short description
    #[serde(default)]
    pub description: Option<String>,
    /// Plugin author
    #[serde(default)]
    pub author: Option<String>,
    /// What kind of plugin this is
    #[serde(default)]
    pub kind: PluginKind,
    /// Declarations per extension point: entry name -> relative executable
    #[serde(default)]
    pub extension_points: HashMap<String, IndexMap<String, String>>,
}

/// Plugin category
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// Provides one or more channel transports
    #[default]
    Channel,
    /// Anything else; ignored by the switchboard
    #[serde(other)]
    Other,
}

impl PluginManifest {
    /// Entries declared under `extension_point`, in manifest order
    pub fn entries<'a>(&'a self, extension_point: &str) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.extension_points
            .get(extension_point)
            .into_iter()
            .flat_map(|entries| entries.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

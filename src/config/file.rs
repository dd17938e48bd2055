//! TOML configuration file loading
//!
//! Supports `~/.config/omni/switchboard/config.toml` as a persistent config
//! source. Every section is optional; the file is a partial overlay on top
//! of defaults.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;

use crate::channels::ChannelSpec;
use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct SwitchboardConfigFile {
    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Sender pairing configuration
    #[serde(default)]
    pub pairing: PairingFileConfig,

    /// Session configuration
    #[serde(default)]
    pub sessions: SessionsFileConfig,

    /// Backend conversation engine
    #[serde(default)]
    pub backend: BackendFileConfig,

    /// Plugin search paths
    #[serde(default)]
    pub plugins: PluginsFileConfig,

    /// Channel instances keyed by instance name, in file order
    #[serde(default)]
    pub channels: IndexMap<String, ChannelSpec>,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// HTTP port
    pub port: Option<u16>,

    /// Bearer token for `/api`; the admin API is not mounted without one
    pub admin_token: Option<String>,

    /// Admin API requests allowed per minute
    pub requests_per_minute: Option<u32>,

    /// Directory holding the sender database
    pub data_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PairingFileConfig {
    /// `open`, `pairing` or `allowlist`
    pub policy: Option<String>,
    pub code_ttl_secs: Option<u64>,
    pub rate_limit_messages: Option<u32>,
    pub rate_limit_window_secs: Option<u64>,
    pub blocked_reply: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionsFileConfig {
    pub idle_timeout_secs: Option<u64>,
    pub max_history: Option<usize>,
    /// Heartbeat interval; expired sessions are pruned on each tick
    pub prune_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BackendFileConfig {
    /// Endpoint receiving approved messages; echo backend when unset
    pub url: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PluginsFileConfig {
    /// Directories scanned for plugin manifests
    pub dirs: Option<Vec<String>>,
}

impl SwitchboardConfigFile {
    /// Parse a TOML document
    ///
    /// # Errors
    ///
    /// Returns error if the document is not valid TOML or does not match
    /// the schema
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        for (name, spec) in &mut config.channels {
            spec.name.clone_from(name);
        }
        Ok(config)
    }
}

/// Load the TOML config file
///
/// Reads `path` when given, otherwise the standard location. A missing file
/// yields defaults.
///
/// # Errors
///
/// Returns error if the file exists but cannot be read or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<SwitchboardConfigFile> {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return Ok(SwitchboardConfigFile::default());
    };

    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(SwitchboardConfigFile::default());
    }

    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    let config = SwitchboardConfigFile::parse(&content)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;

    tracing::info!(path = %path.display(), channels = config.channels.len(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/omni/switchboard/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("switchboard")
            .join("config.toml")
    })
}

//! Configuration management for the switchboard

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use secrecy::SecretString;

use self::file::SwitchboardConfigFile;
use crate::channels::ChannelSpec;
use crate::security::{DmPolicy, PairingSettings};
use crate::sessions::SessionSettings;
use crate::{Error, Result};

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 18790;

/// Switchboard configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Path to data directory (sender database)
    pub data_dir: PathBuf,

    /// Sender pairing policy and limits
    pub pairing: PairingSettings,

    /// Session expiry and history
    pub sessions: SessionSettings,

    /// Heartbeat / session prune interval
    pub prune_interval: Duration,

    /// Backend conversation engine
    pub backend: BackendConfig,

    /// Directories scanned for plugin manifests
    pub plugin_dirs: Vec<PathBuf>,

    /// Channel instances in configuration order
    pub channels: IndexMap<String, ChannelSpec>,
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Bearer token for admin endpoints (from `SWITCHBOARD_ADMIN_TOKEN` env)
    pub admin_token: Option<SecretString>,

    /// Admin API requests allowed per minute
    pub requests_per_minute: u32,
}

/// Backend endpoint configuration
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// HTTP endpoint; `None` selects the echo backend
    pub url: Option<String>,

    /// Per-request timeout
    pub timeout: Duration,
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if the config file cannot be parsed or an override is
    /// invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path)?;
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Combine a parsed file with environment overrides
    ///
    /// # Errors
    ///
    /// Returns error if an override is invalid
    pub fn resolve(fc: SwitchboardConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = match env("SWITCHBOARD_PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::Config(format!("invalid SWITCHBOARD_PORT: {raw}")))?,
            None => fc.server.port.unwrap_or(DEFAULT_PORT),
        };

        let admin_token = env("SWITCHBOARD_ADMIN_TOKEN")
            .or(fc.server.admin_token)
            .filter(|t| !t.trim().is_empty())
            .map(SecretString::from);

        let server = ServerConfig {
            port,
            admin_token,
            requests_per_minute: fc.server.requests_per_minute.unwrap_or(120).max(1),
        };

        // Data directory (~/.local/share/omni/switchboard on Linux)
        let data_dir = env("SWITCHBOARD_DATA_DIR")
            .or(fc.server.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);

        let policy = match env("SWITCHBOARD_DM_POLICY").or(fc.pairing.policy) {
            Some(raw) => {
                DmPolicy::parse(&raw).ok_or_else(|| Error::Config(format!("unknown dm policy: {raw}")))?
            }
            None => DmPolicy::default(),
        };

        let defaults = PairingSettings::default();
        let pairing = PairingSettings {
            policy,
            code_ttl: fc.pairing.code_ttl_secs.map_or(defaults.code_ttl, seconds),
            rate_limit_messages: fc
                .pairing
                .rate_limit_messages
                .unwrap_or(defaults.rate_limit_messages),
            rate_limit_window: fc
                .pairing
                .rate_limit_window_secs
                .map_or(defaults.rate_limit_window, seconds),
            blocked_reply: fc.pairing.blocked_reply.or(defaults.blocked_reply),
        };

        let session_defaults = SessionSettings::default();
        let sessions = SessionSettings {
            idle_timeout: fc
                .sessions
                .idle_timeout_secs
                .map_or(session_defaults.idle_timeout, seconds),
            max_history: fc.sessions.max_history.unwrap_or(session_defaults.max_history),
        };
        let prune_interval = Duration::from_secs(fc.sessions.prune_interval_secs.unwrap_or(60).max(1));

        let backend = BackendConfig {
            url: env("SWITCHBOARD_BACKEND_URL")
                .or(fc.backend.url)
                .filter(|u| !u.trim().is_empty()),
            timeout: Duration::from_secs(fc.backend.timeout_secs.unwrap_or(60)),
        };

        let plugin_dirs = fc.plugins.dirs.map_or_else(crate::plugins::default_plugin_dirs, |dirs| {
            dirs.into_iter().map(PathBuf::from).collect()
        });

        Ok(Self {
            server,
            data_dir,
            pairing,
            sessions,
            prune_interval,
            backend,
            plugin_dirs,
            channels: fc.channels,
        })
    }

    /// Path to the sender database
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("switchboard.db")
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/omni/switchboard"),
        |d| d.data_dir().join("omni").join("switchboard"),
    )
}

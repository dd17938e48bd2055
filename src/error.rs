//! Error types for the switchboard

use thiserror::Error;

/// Result type alias for switchboard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the switchboard
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Channel error
    #[error("channel error: {0}")]
    Channel(String),

    /// A plugin or built-in channel failed to load
    #[error("plugin load failure for {name}: {reason}")]
    PluginLoad { name: String, reason: String },

    /// An optional dependency (cargo feature, binary, credential) is absent
    #[error("missing dependency: {0}")]
    MissingDependency(String),

    /// Configuration references a channel type nobody provides
    #[error("unknown channel type: {0}")]
    UnknownChannelType(String),

    /// Adapter could not be started
    #[error("adapter start failed: {0}")]
    AdapterStart(String),

    /// Transport-level send failure
    #[error("send failed: {0}")]
    Send(String),

    /// External process bridge error
    #[error("process error: {0}")]
    Process(String),

    /// Backend conversation engine error
    #[error("backend error: {0}")]
    Backend(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Authentication/authorization error
    #[error("auth error: {0}")]
    Auth(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Whether this error means an optional piece is simply not available
    ///
    /// Such failures are expected during discovery and are logged at debug level
    #[must_use]
    pub const fn is_missing_dependency(&self) -> bool {
        matches!(self, Self::MissingDependency(_))
    }
}

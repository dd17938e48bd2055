//! Beacon Switchboard - channel switchboard for AI assistants
//!
//! This library provides the control plane between messaging transports and
//! a conversational backend:
//! - Channel discovery from built-ins and plugins
//! - Channel adapter lifecycle
//! - Sender pairing and authorization
//! - Per-sender session routing
//! - Display routing to canvas or chat surfaces
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Channels                         │
//! │  Webhook  │  Web  │  Telegram  │  Signal  │ plugins  │
//! └────────────────────┬────────────────────────────────┘
//!                      │ inbound
//! ┌────────────────────▼────────────────────────────────┐
//! │                    Switchboard                       │
//! │   Sender store  →  Session router  │  Display router │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                      Backend                         │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod backend;
pub mod channels;
pub mod config;
pub mod daemon;
pub mod db;
pub mod display;
pub mod error;
pub mod plugins;
pub mod registry;
pub mod security;
pub mod sessions;
pub mod sync;

use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Time source, replaceable in tests
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub use backend::{Backend, EchoBackend, HttpBackend};
pub use channels::{
    Channel, ChannelSpec, ChannelState, ChannelType, DisplayContent, InboundMessage,
    OutboundMessage, Transport,
};
pub use config::Config;
pub use daemon::{Daemon, DaemonBuilder};
pub use db::{DbConn, DbPool};
pub use display::{DisplayMetadata, DisplayRouter};
pub use error::{Error, Result};
pub use plugins::{ChannelPluginDecl, PluginKind, PluginManifest};
pub use registry::{ChannelCatalog, Registry, SharedCatalog};
pub use security::{AuthDecision, DmPolicy, SenderStore};
pub use sessions::{SessionKey, SessionRouter};

//! Daemon - the main switchboard service
//!
//! Builds channel instances from configuration, wires every inbound message
//! through sender authorization and the session router, and serves the HTTP
//! surface until interrupted.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use indexmap::IndexMap;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::backend::{Backend, EchoBackend, HttpBackend};
use crate::channels::{
    Channel, ChannelSpec, ChannelState, InboundHandler, InboundMessage, ReplyFuture,
};
use crate::db::{self, DbPool};
use crate::display::{ChannelMap, DisplayRouter};
use crate::registry::{ChannelCatalog, Registry, SharedCatalog};
use crate::security::{AuthDecision, SenderStore};
use crate::sessions::{SessionKey, SessionRouter};
use crate::{Clock, Config, Error, Result};

/// Authorization then session routing for every inbound message
struct Pipeline {
    store: SenderStore,
    sessions: Arc<SessionRouter>,
}

impl InboundHandler for Pipeline {
    fn on_message(&self, message: InboundMessage) -> ReplyFuture {
        let store = self.store.clone();
        let sessions = Arc::clone(&self.sessions);

        // Queued before returning so per-sender order is the arrival order
        self.sessions
            .enqueue(SessionKey::of(&message), async move {
                match store.check(&message).await {
                    Ok(AuthDecision::Allow) => sessions.route(&message).await,
                    Ok(decision) => {
                        tracing::debug!(
                            channel = %message.instance,
                            sender = %message.sender_id,
                            decision = ?decision,
                            "message not routed"
                        );
                        decision.reply().map(str::to_string)
                    }
                    Err(e) => {
                        tracing::warn!(
                            channel = %message.instance,
                            sender = %message.sender_id,
                            error = %e,
                            "sender check failed"
                        );
                        None
                    }
                }
            })
            .map(Option::flatten)
            .boxed()
    }
}

/// Per-channel status for operators
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub name: String,
    pub channel_type: String,
    pub state: ChannelState,
    pub canvas: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Daemon status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub sessions: usize,
    pub channels: Vec<ChannelStatus>,
}

/// Builder for [`Daemon`]
pub struct DaemonBuilder {
    config: Config,
    registry: Option<Registry>,
    backend: Option<Arc<dyn Backend>>,
    pool: Option<DbPool>,
    clock: Option<Clock>,
}

impl DaemonBuilder {
    /// Use a custom registry instead of built-ins plus configured plugin dirs
    #[must_use]
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use a custom backend instead of the configured one
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use an existing database pool
    #[must_use]
    pub fn pool(mut self, pool: DbPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Replace the time source for pairing and sessions
    #[must_use]
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Discover channel types and build every configured instance
    ///
    /// Instances whose type is unknown or whose construction fails are
    /// logged and left out; the rest are built in configuration order.
    ///
    /// # Errors
    ///
    /// Returns error if the database or backend cannot be initialized
    pub fn build(self) -> Result<Daemon> {
        let config = self.config;

        let pool = match self.pool {
            Some(pool) => pool,
            None => {
                let path = config.database_path();
                let pool = db::init(&path)?;
                tracing::info!(path = %path.display(), "database initialized");
                pool
            }
        };

        let backend = match self.backend {
            Some(backend) => backend,
            None => backend_from_config(&config)?,
        };

        let registry = self
            .registry
            .unwrap_or_else(|| Registry::with_plugin_dirs(config.plugin_dirs.clone()));
        let catalog = Arc::new(SharedCatalog::new(registry));

        let mut store = SenderStore::new(pool, config.pairing.clone());
        let mut sessions = SessionRouter::new(backend, config.sessions.clone());
        if let Some(clock) = self.clock {
            store = store.with_clock(Arc::clone(&clock));
            sessions = sessions.with_clock(clock);
        }
        let sessions = Arc::new(sessions);

        let handler: Arc<dyn InboundHandler> = Arc::new(Pipeline {
            store: store.clone(),
            sessions: Arc::clone(&sessions),
        });
        let channels = Arc::new(build_channels(&catalog.snapshot(), &config.channels, &handler)?);
        let display = Arc::new(DisplayRouter::new(Arc::clone(&channels)));

        tracing::info!(
            configured = config.channels.len(),
            built = channels.len(),
            policy = %store.policy(),
            "daemon initialized"
        );

        Ok(Daemon {
            config,
            catalog,
            channels,
            store,
            sessions,
            display,
            started_at: Utc::now(),
            last_heartbeat: Mutex::new(None),
        })
    }
}

fn backend_from_config(config: &Config) -> Result<Arc<dyn Backend>> {
    match &config.backend.url {
        Some(url) => {
            tracing::info!(url = %url, "using http backend");
            Ok(Arc::new(HttpBackend::new(url, config.backend.timeout)?))
        }
        None => {
            tracing::info!("no backend configured, echoing messages");
            Ok(Arc::new(EchoBackend))
        }
    }
}

fn build_channels(
    catalog: &ChannelCatalog,
    specs: &IndexMap<String, ChannelSpec>,
    handler: &Arc<dyn InboundHandler>,
) -> Result<ChannelMap> {
    let mut channels = ChannelMap::new();

    for (name, spec) in specs {
        let mut spec = spec.clone();
        spec.name.clone_from(name);

        let transport = match catalog.build(&spec) {
            Ok(transport) => transport,
            Err(Error::UnknownChannelType(kind)) => {
                tracing::warn!(channel = %name, kind = %kind, "unknown channel type, skipping");
                continue;
            }
            Err(e) => {
                tracing::warn!(channel = %name, kind = %spec.channel_type, error = %e, "failed to create channel, skipping");
                continue;
            }
        };

        let channel = Channel::new(&spec, transport);
        channel.set_handler(Arc::clone(handler))?;
        channels.insert(name.clone(), Arc::new(channel));
    }

    Ok(channels)
}

/// The switchboard daemon
pub struct Daemon {
    config: Config,
    catalog: Arc<SharedCatalog>,
    channels: Arc<ChannelMap>,
    store: SenderStore,
    sessions: Arc<SessionRouter>,
    display: Arc<DisplayRouter>,
    started_at: DateTime<Utc>,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
}

impl Daemon {
    /// Start building a daemon for `config`
    #[must_use]
    pub const fn builder(config: Config) -> DaemonBuilder {
        DaemonBuilder {
            config,
            registry: None,
            backend: None,
            pool: None,
            clock: None,
        }
    }

    /// Create a daemon with the configured registry, backend and database
    ///
    /// # Errors
    ///
    /// Returns error if initialization fails
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Channel instances in configuration order
    #[must_use]
    pub fn channels(&self) -> &ChannelMap {
        &self.channels
    }

    /// Look up a channel instance by name
    #[must_use]
    pub fn channel(&self, name: &str) -> Option<&Arc<Channel>> {
        self.channels.get(name)
    }

    #[must_use]
    pub const fn senders(&self) -> &SenderStore {
        &self.store
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionRouter {
        &self.sessions
    }

    #[must_use]
    pub fn display(&self) -> &DisplayRouter {
        &self.display
    }

    #[must_use]
    pub fn catalog(&self) -> &SharedCatalog {
        &self.catalog
    }

    /// Re-run channel discovery
    ///
    /// Running instances keep the implementation they were built with; the
    /// new catalog applies to types looked up afterwards.
    pub fn reload_registry(&self) -> Vec<String> {
        let catalog = self.catalog.reload();
        let names: Vec<String> = catalog.names().map(String::from).collect();
        tracing::info!(types = names.len(), "channel registry reloaded");
        names
    }

    /// Start every channel concurrently
    ///
    /// Returns how many are running. One channel failing to start affects
    /// no other.
    pub async fn start_all(&self) -> usize {
        let mut tasks = JoinSet::new();
        for channel in self.channels.values() {
            let channel = Arc::clone(channel);
            tasks.spawn(async move { channel.start().await });
        }

        let mut running = 0;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(true) => running += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(error = %e, "channel start task failed"),
            }
        }

        tracing::info!(running, total = self.channels.len(), "channels started");
        running
    }

    /// Stop every channel concurrently
    pub async fn stop_all(&self) {
        let mut tasks = JoinSet::new();
        for channel in self.channels.values() {
            let channel = Arc::clone(channel);
            tasks.spawn(async move { channel.stop().await });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "channel stop task failed");
            }
        }
        tracing::info!("channels stopped");
    }

    /// Record a heartbeat and prune expired sessions
    pub fn heartbeat(&self) -> usize {
        let pruned = self.sessions.prune_expired();
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        if pruned > 0 {
            tracing::debug!(pruned, "pruned expired sessions");
        }
        pruned
    }

    /// Current status of the daemon and its channels
    #[must_use]
    pub fn status(&self) -> DaemonStatus {
        DaemonStatus {
            started_at: self.started_at,
            last_heartbeat: *self
                .last_heartbeat
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            sessions: self.sessions.len(),
            channels: self
                .channels
                .values()
                .map(|c| ChannelStatus {
                    name: c.name().to_string(),
                    channel_type: c.channel_type().to_string(),
                    state: c.state(),
                    canvas: c.is_canvas(),
                    last_error: c.last_error(),
                })
                .collect(),
        }
    }

    /// Run until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP server cannot bind or fails
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.start_all().await;

        let heartbeat = {
            let daemon = Arc::clone(&self);
            let period = self.config.prune_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                // Skip the first immediate tick
                interval.tick().await;
                loop {
                    interval.tick().await;
                    daemon.heartbeat();
                }
            })
        };

        let addr = format!("0.0.0.0:{}", self.config.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind {addr}: {e}")))?;
        tracing::info!(port = self.config.server.port, "switchboard listening");

        let served = axum::serve(listener, crate::api::router(Arc::clone(&self)))
            .with_graceful_shutdown(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown requested");
                }
            })
            .await
            .map_err(|e| Error::Config(format!("server error: {e}")));

        heartbeat.abort();
        self.stop_all().await;
        served
    }
}

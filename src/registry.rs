//! Channel catalog discovery
//!
//! Builds the mapping from channel type name to factory. Built-in channels
//! are resolved first; every declared plugin is then loaded independently
//! and merged over them by name, so a plugin may replace a built-in.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use indexmap::IndexMap;
use serde::Serialize;

use crate::channels::{ChannelFactory, ChannelSpec, ChannelType, Transport};
use crate::plugins::{InventorySource, ManifestSource, PluginSource};
use crate::{Error, Result};

/// A channel shipped with the switchboard
#[derive(Clone, Copy)]
pub struct BuiltinChannel {
    /// Channel type name
    pub name: &'static str,
    /// Resolve into a factory; fails if a cargo feature or dependency is absent
    pub resolve: fn() -> Result<ChannelFactory>,
}

/// Every built-in channel, available or not
#[must_use]
pub fn builtin_channels() -> Vec<BuiltinChannel> {
    vec![
        BuiltinChannel {
            name: "webhook",
            resolve: webhook_factory,
        },
        BuiltinChannel {
            name: "web",
            resolve: web_factory,
        },
        BuiltinChannel {
            name: "telegram",
            resolve: telegram_factory,
        },
        BuiltinChannel {
            name: "signal",
            resolve: signal_factory,
        },
    ]
}

fn webhook_factory() -> Result<ChannelFactory> {
    Ok(Arc::new(|spec: &ChannelSpec| -> Result<Box<dyn Transport>> {
        Ok(Box::new(crate::channels::WebhookTransport::from_spec(spec)?))
    }))
}

fn web_factory() -> Result<ChannelFactory> {
    Ok(Arc::new(|spec: &ChannelSpec| -> Result<Box<dyn Transport>> {
        Ok(Box::new(crate::channels::WebTransport::from_spec(spec)))
    }))
}

#[cfg(feature = "telegram")]
fn telegram_factory() -> Result<ChannelFactory> {
    Ok(Arc::new(|spec: &ChannelSpec| -> Result<Box<dyn Transport>> {
        Ok(Box::new(crate::channels::telegram::TelegramTransport::from_spec(spec)?))
    }))
}

#[cfg(not(feature = "telegram"))]
fn telegram_factory() -> Result<ChannelFactory> {
    Err(Error::MissingDependency(
        "built without the `telegram` feature".to_string(),
    ))
}

#[cfg(feature = "signal")]
fn signal_factory() -> Result<ChannelFactory> {
    Ok(Arc::new(|spec: &ChannelSpec| -> Result<Box<dyn Transport>> {
        Ok(Box::new(crate::channels::signal::SignalTransport::from_spec(spec)?))
    }))
}

#[cfg(not(feature = "signal"))]
fn signal_factory() -> Result<ChannelFactory> {
    Err(Error::MissingDependency(
        "built without the `signal` feature".to_string(),
    ))
}

/// Where a catalog entry came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "from", rename_all = "snake_case")]
pub enum Provenance {
    Builtin,
    Plugin(String),
}

#[derive(Clone)]
struct CatalogEntry {
    factory: ChannelFactory,
    provenance: Provenance,
}

/// Result of discovery: channel type name -> factory
#[derive(Clone, Default)]
pub struct ChannelCatalog {
    entries: IndexMap<String, CatalogEntry>,
}

impl ChannelCatalog {
    /// Factory for a channel type
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ChannelFactory> {
        self.entries.get(name).map(|e| Arc::clone(&e.factory))
    }

    /// Whether a channel type is available
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Where a channel type's implementation came from
    #[must_use]
    pub fn provenance(&self, name: &str) -> Option<&Provenance> {
        self.entries.get(name).map(|e| &e.provenance)
    }

    /// Available channel type names, built-ins first
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of available channel types
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is available
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Construct a transport for a configured instance
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownChannelType`] if no implementation matches
    /// `spec.channel_type`, or the factory's own error
    pub fn build(&self, spec: &ChannelSpec) -> Result<Box<dyn Transport>> {
        let factory = self
            .get(spec.channel_type.as_str())
            .ok_or_else(|| Error::UnknownChannelType(spec.channel_type.to_string()))?;
        std::panic::catch_unwind(AssertUnwindSafe(|| factory(spec))).unwrap_or_else(|_| {
            Err(Error::PluginLoad {
                name: spec.channel_type.to_string(),
                reason: "factory panicked".to_string(),
            })
        })
    }

    fn insert(&mut self, name: String, factory: ChannelFactory, provenance: Provenance) {
        self.entries.insert(name, CatalogEntry { factory, provenance });
    }
}

impl std::fmt::Debug for ChannelCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, &v.provenance)))
            .finish()
    }
}

/// Discovers channel implementations from built-ins and plugin sources
pub struct Registry {
    builtins: Vec<BuiltinChannel>,
    sources: Vec<Box<dyn PluginSource>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Registry over the built-in channels and compiled-in plugins
    #[must_use]
    pub fn new() -> Self {
        Self {
            builtins: builtin_channels(),
            sources: vec![Box::new(InventorySource)],
        }
    }

    /// Registry that also scans manifest plugin directories
    #[must_use]
    pub fn with_plugin_dirs(dirs: Vec<std::path::PathBuf>) -> Self {
        Self::new().source(ManifestSource::new(dirs))
    }

    /// Registry with nothing registered
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            builtins: Vec::new(),
            sources: Vec::new(),
        }
    }

    /// Replace the built-in table
    #[must_use]
    pub fn builtins(mut self, builtins: Vec<BuiltinChannel>) -> Self {
        self.builtins = builtins;
        self
    }

    /// Add a plugin source; later sources override earlier ones by name
    #[must_use]
    pub fn source(mut self, source: impl PluginSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Resolve every built-in and load every declared plugin
    ///
    /// Never fails: unavailable built-ins are skipped at debug level and
    /// broken plugins at warn level, one entry at a time.
    #[must_use]
    pub fn discover(&self) -> ChannelCatalog {
        let mut catalog = ChannelCatalog::default();

        for builtin in &self.builtins {
            match guarded(builtin.name, builtin.resolve) {
                Ok(factory) => catalog.insert(builtin.name.to_string(), factory, Provenance::Builtin),
                Err(e) if e.is_missing_dependency() => {
                    tracing::debug!(channel = builtin.name, reason = %e, "built-in channel unavailable");
                }
                Err(e) => {
                    tracing::warn!(channel = builtin.name, error = %e, "failed to load built-in channel");
                }
            }
        }

        for source in &self.sources {
            let declarations = match std::panic::catch_unwind(AssertUnwindSafe(|| source.declarations())) {
                Ok(declarations) => declarations,
                Err(_) => {
                    tracing::warn!(source = source.label(), "plugin source panicked while enumerating");
                    continue;
                }
            };

            for decl in declarations {
                let name = decl.name;
                let origin = decl.origin;
                match guarded(&name, decl.load) {
                    Ok(factory) => {
                        if catalog.contains(&name) {
                            tracing::info!(channel = %name, plugin = %origin, "plugin overrides existing channel");
                        } else {
                            tracing::debug!(channel = %name, plugin = %origin, "loaded channel plugin");
                        }
                        catalog.insert(name, factory, Provenance::Plugin(origin));
                    }
                    Err(e) => {
                        tracing::warn!(channel = %name, plugin = %origin, error = %e, "skipping channel plugin");
                    }
                }
            }
        }

        tracing::info!(
            count = catalog.len(),
            channels = ?catalog.names().collect::<Vec<_>>(),
            "channel discovery complete"
        );
        catalog
    }
}

fn guarded(name: &str, load: impl FnOnce() -> Result<ChannelFactory>) -> Result<ChannelFactory> {
    std::panic::catch_unwind(AssertUnwindSafe(load)).unwrap_or_else(|_| {
        Err(Error::PluginLoad {
            name: name.to_string(),
            reason: "loader panicked".to_string(),
        })
    })
}

/// A catalog that can be re-discovered and swapped atomically
pub struct SharedCatalog {
    registry: Registry,
    current: RwLock<Arc<ChannelCatalog>>,
    reloading: Mutex<()>,
}

impl SharedCatalog {
    /// Run discovery once and hold the result
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        let catalog = registry.discover();
        Self {
            registry,
            current: RwLock::new(Arc::new(catalog)),
            reloading: Mutex::new(()),
        }
    }

    /// Current catalog
    #[must_use]
    pub fn snapshot(&self) -> Arc<ChannelCatalog> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Re-run discovery and replace the catalog in one step
    ///
    /// Readers see either the old or the new catalog, never a mix. Channels
    /// already built from the old catalog keep running.
    pub fn reload(&self) -> Arc<ChannelCatalog> {
        let _guard = self.reloading.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = Arc::new(self.registry.discover());
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&fresh);
        fresh
    }

    /// Whether `channel_type` is currently available
    #[must_use]
    pub fn contains(&self, channel_type: &ChannelType) -> bool {
        self.snapshot().contains(channel_type.as_str())
    }
}

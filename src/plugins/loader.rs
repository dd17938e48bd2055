//! Plugin sources
//!
//! A [`PluginSource`] enumerates channel declarations without loading them.
//! Loading is a separate, fallible step per declaration so the registry can
//! skip a broken entry and keep going.

use std::path::PathBuf;
use std::sync::Arc;

use super::discovery::discover_plugins;
use super::{ChannelPluginDecl, EXTENSION_POINT, PluginKind};
use crate::channels::{ChannelFactory, ChannelSpec, ProcessConfig, ProcessTransport, Transport};
use crate::{Error, Result};

/// Loader for one declared entry
pub type LoadFn = Box<dyn FnOnce() -> Result<ChannelFactory> + Send>;

/// A channel declared under the extension point, not yet loaded
pub struct PluginDeclaration {
    /// Channel type name the entry provides
    pub name: String,
    /// Where the declaration came from, for logs
    pub origin: String,
    /// Resolve the declaration into a factory
    pub load: LoadFn,
}

impl PluginDeclaration {
    /// Create a declaration
    pub fn new(
        name: impl Into<String>,
        origin: impl Into<String>,
        load: impl FnOnce() -> Result<ChannelFactory> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            origin: origin.into(),
            load: Box::new(load),
        }
    }
}

impl std::fmt::Debug for PluginDeclaration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDeclaration")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Something that can enumerate channel plugin declarations
pub trait PluginSource: Send + Sync {
    /// Short label for logs
    fn label(&self) -> &str;

    /// Every declaration under [`EXTENSION_POINT`], in a stable order
    fn declarations(&self) -> Vec<PluginDeclaration>;
}

/// Plugins compiled into the binary via `inventory::submit!`
#[derive(Debug, Default, Clone, Copy)]
pub struct InventorySource;

impl PluginSource for InventorySource {
    fn label(&self) -> &'static str {
        "compiled"
    }

    fn declarations(&self) -> Vec<PluginDeclaration> {
        let mut decls: Vec<&'static ChannelPluginDecl> = inventory::iter::<ChannelPluginDecl>
            .into_iter()
            .filter(|decl| decl.extension_point == EXTENSION_POINT)
            .collect();
        // Link order is not meaningful, so make it deterministic
        decls.sort_by_key(|decl| decl.name);

        decls
            .into_iter()
            .map(|decl| PluginDeclaration::new(decl.name, "compiled", decl.load))
            .collect()
    }
}

/// A fixed list of declarations supplied at construction
pub struct StaticSource {
    label: String,
    entries: Vec<(String, Arc<dyn Fn() -> Result<ChannelFactory> + Send + Sync>)>,
}

impl StaticSource {
    /// Create an empty source
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            entries: Vec::new(),
        }
    }

    /// Declare an entry
    #[must_use]
    pub fn with(
        mut self,
        name: impl Into<String>,
        load: impl Fn() -> Result<ChannelFactory> + Send + Sync + 'static,
    ) -> Self {
        self.entries.push((name.into(), Arc::new(load)));
        self
    }
}

impl PluginSource for StaticSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn declarations(&self) -> Vec<PluginDeclaration> {
        self.entries
            .iter()
            .map(|(name, load)| {
                let load = Arc::clone(load);
                PluginDeclaration::new(name.clone(), self.label.clone(), move || load())
            })
            .collect()
    }
}

/// Independently packaged plugins described by manifests on disk
///
/// Each entry names an executable relative to the plugin directory; the
/// resulting channel runs it as a process-bridge transport.
#[derive(Debug, Clone)]
pub struct ManifestSource {
    dirs: Vec<PathBuf>,
}

impl ManifestSource {
    /// Scan the given directories
    #[must_use]
    pub const fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }
}

impl PluginSource for ManifestSource {
    fn label(&self) -> &'static str {
        "manifest"
    }

    fn declarations(&self) -> Vec<PluginDeclaration> {
        let mut decls = Vec::new();

        for (dir, manifest) in discover_plugins(&self.dirs) {
            if manifest.kind != PluginKind::Channel {
                tracing::debug!(plugin = %manifest.id, kind = ?manifest.kind, "skipping non-channel plugin");
                continue;
            }
            for (name, entry) in manifest.entries(EXTENSION_POINT) {
                let executable = dir.join(entry);
                let origin = format!("{}@{}", manifest.id, manifest.version);
                decls.push(PluginDeclaration::new(name, origin, move || {
                    process_factory(executable)
                }));
            }
        }

        decls
    }
}

/// Factory producing process-bridge transports for `executable`
///
/// # Errors
///
/// Returns [`Error::MissingDependency`] if the executable does not exist
pub fn process_factory(executable: PathBuf) -> Result<ChannelFactory> {
    if !executable.is_file() {
        return Err(Error::MissingDependency(format!(
            "plugin executable {} not found",
            executable.display()
        )));
    }

    let cwd = executable.parent().map(PathBuf::from);
    Ok(Arc::new(move |spec: &ChannelSpec| -> Result<Box<dyn Transport>> {
        let mut config = ProcessConfig::new(executable.clone());
        config.cwd.clone_from(&cwd);
        if let Some(secs) = spec.u64("stop_grace_secs") {
            config = config.grace(std::time::Duration::from_secs(secs));
        }
        config = config.args(spec.strings("args"));
        Ok(Box::new(ProcessTransport::new(config, spec.settings.clone())))
    }))
}

//! Channel plugin declarations
//!
//! Plugins declare channel implementations under a fixed extension point.
//! Two mechanisms feed it: crates linked into the binary register with
//! `inventory::submit!`, and independently packaged plugins ship a
//! `switchboard.plugin.json` manifest pointing at an executable.
//!
//! ```ignore
//! inventory::submit! {
//!     ChannelPluginDecl::new("fakechat", || Ok(Arc::new(|_spec: &ChannelSpec| {
//!         Ok(Box::new(FakeChat::default()) as Box<dyn Transport>)
//!     })))
//! }
//! ```

pub mod discovery;
pub mod loader;
pub mod manifest;

pub use discovery::{MANIFEST_FILE, default_plugin_dirs, discover_plugins};
pub use loader::{
    InventorySource, ManifestSource, PluginDeclaration, PluginSource, StaticSource, process_factory,
};
pub use manifest::{PluginKind, PluginManifest};

use crate::Result;
use crate::channels::ChannelFactory;

/// Extension point channel plugins declare themselves under
pub const EXTENSION_POINT: &str = "switchboard.channels";

/// A compiled-in channel declaration
pub struct ChannelPluginDecl {
    /// Extension point this entry belongs to
    pub extension_point: &'static str,
    /// Channel type name
    pub name: &'static str,
    /// Resolve into a factory; may fail if something optional is absent
    pub load: fn() -> Result<ChannelFactory>,
}

impl ChannelPluginDecl {
    /// Declare a channel under [`EXTENSION_POINT`]
    #[must_use]
    pub const fn new(name: &'static str, load: fn() -> Result<ChannelFactory>) -> Self {
        Self {
            extension_point: EXTENSION_POINT,
            name,
            load,
        }
    }
}

inventory::collect!(ChannelPluginDecl);

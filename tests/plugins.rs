//! Compiled-in channel plugin tests
//!
//! Declarations submitted here are linked into this test binary only, so the
//! registry sees them next to the built-ins.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use beacon_switchboard::channels::{
    ChannelFactory, ChannelState, InboundSink, OutboundMessage, ReplyFuture,
};
use beacon_switchboard::registry::Provenance;
use beacon_switchboard::{
    ChannelPluginDecl, ChannelSpec, Daemon, EchoBackend, Error, Registry, Result, Transport,
};

mod common;
use common::{TestClock, config, setup_test_db};

/// Chat transport that lets the test inject inbound messages
#[derive(Default)]
struct FakeChat {
    sink: Mutex<Option<InboundSink>>,
    delivered: Mutex<Vec<String>>,
}

impl FakeChat {
    fn inject(&self, sender: &str, text: &str) -> Option<ReplyFuture> {
        let sink = self.sink.lock().unwrap().clone()?;
        let message = sink.message(sender, sender, text, None);
        Some(sink.dispatch(message))
    }
}

#[async_trait]
impl Transport for FakeChat {
    async fn open(&self, inbound: InboundSink) -> Result<()> {
        *self.sink.lock().unwrap() = Some(inbound);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.sink.lock().unwrap().take();
        Ok(())
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<()> {
        self.delivered.lock().unwrap().push(message.text.clone());
        Ok(())
    }
}

fn load_fakechat() -> Result<ChannelFactory> {
    Ok(Arc::new(|_spec: &ChannelSpec| {
        Ok(Box::new(FakeChat::default()) as Box<dyn Transport>)
    }))
}

fn load_broken() -> Result<ChannelFactory> {
    Err(Error::PluginLoad {
        name: "brokenchat".to_string(),
        reason: "client library missing".to_string(),
    })
}

fn load_panicking() -> Result<ChannelFactory> {
    panic!("plugin initialisation blew up")
}

inventory::submit! { ChannelPluginDecl::new("fakechat", load_fakechat) }
inventory::submit! { ChannelPluginDecl::new("webhook", load_fakechat) }
inventory::submit! { ChannelPluginDecl::new("brokenchat", load_broken) }
inventory::submit! { ChannelPluginDecl::new("panicchat", load_panicking) }
inventory::submit! {
    ChannelPluginDecl {
        extension_point: "elsewhere.widgets",
        name: "elsewhere",
        load: load_fakechat,
    }
}

fn plugin_daemon(toml: &str) -> Arc<Daemon> {
    let clock = TestClock::new();
    let daemon = Daemon::builder(config(toml))
        .registry(Registry::new())
        .pool(setup_test_db())
        .backend(Arc::new(EchoBackend))
        .clock(clock.clock())
        .build()
        .expect("failed to build daemon");
    Arc::new(daemon)
}

#[test]
fn test_compiled_plugins_are_discovered() {
    let catalog = Registry::new().discover();

    assert!(catalog.contains("fakechat"));
    assert_eq!(
        catalog.provenance("fakechat"),
        Some(&Provenance::Plugin("compiled".to_string()))
    );
    assert_eq!(catalog.provenance("web"), Some(&Provenance::Builtin));
}

#[test]
fn test_broken_plugins_are_skipped_individually() {
    let catalog = Registry::new().discover();

    assert!(!catalog.contains("brokenchat"));
    assert!(!catalog.contains("panicchat"));
    assert!(!catalog.contains("elsewhere"));
    assert!(catalog.contains("fakechat"));
}

#[test]
fn test_plugin_overrides_builtin_by_name() {
    let catalog = Registry::new().discover();
    assert_eq!(
        catalog.provenance("webhook"),
        Some(&Provenance::Plugin("compiled".to_string()))
    );

    let daemon = plugin_daemon("[channels.hook]\ntype = \"webhook\"\n");
    let channel = daemon.channel("hook").unwrap();
    assert!(channel.transport::<FakeChat>().is_some());
}

#[tokio::test]
async fn test_plugin_channel_is_wired_to_pipeline() {
    let daemon = plugin_daemon(
        r#"
        [pairing]
        policy = "open"

        [channels.fake]
        type = "fakechat"

        [channels.broken]
        type = "brokenchat"
        "#,
    );
    assert!(daemon.channel("broken").is_none());

    let channel = Arc::clone(daemon.channel("fake").unwrap());
    assert!(channel.has_handler());
    let transport = channel.transport::<FakeChat>().unwrap();
    assert!(transport.inject("zoe", "ping").is_none());

    assert_eq!(daemon.start_all().await, 1);
    assert_eq!(channel.state(), ChannelState::Running);

    let reply = transport.inject("zoe", "ping").unwrap().await;
    assert_eq!(reply.as_deref(), Some("ping"));

    assert!(channel.send(OutboundMessage::text(channel.channel_type().clone(), "fake", "pong")).await);
    assert_eq!(*transport.delivered.lock().unwrap(), ["pong"]);
}

#[test]
fn test_empty_registry_builds_no_channels() {
    let daemon = Arc::new(
        Daemon::builder(config("[channels.fake]\ntype = \"fakechat\"\n"))
            .registry(Registry::empty())
            .pool(setup_test_db())
            .backend(Arc::new(EchoBackend))
            .build()
            .unwrap(),
    );

    assert!(daemon.catalog().snapshot().is_empty());
    assert!(daemon.channels().is_empty());
}

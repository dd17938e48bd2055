use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use beacon_switchboard::db;
use beacon_switchboard::security::SenderRecord;
use beacon_switchboard::{ChannelType, Config, Daemon, Registry, SenderStore};

/// Switchboard - channel switchboard for AI assistants
#[derive(Parser)]
#[command(name = "switchboard", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/omni/switchboard/config.toml)
    #[arg(short, long, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the switchboard (default)
    Run,
    /// List discovered channel types
    Channels,
    /// Manage known senders
    Senders {
        #[command(subcommand)]
        action: SendersCommand,
    },
    /// Pairing operations
    Pairing {
        #[command(subcommand)]
        action: PairingCommand,
    },
}

#[derive(Subcommand)]
enum SendersCommand {
    /// List senders, optionally for one channel type
    List {
        #[arg(long)]
        channel: Option<String>,
    },
    /// Approve a sender
    Approve { channel: String, sender: String },
    /// Block a sender
    Block { channel: String, sender: String },
    /// Unblock a blocked sender
    Unblock { channel: String, sender: String },
}

#[derive(Subcommand)]
enum PairingCommand {
    /// Approve the pending sender holding a pairing code
    Approve { channel: String, code: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity; RUST_LOG wins when set
    let filter = match cli.verbose {
        0 => "info,beacon_switchboard=info",
        1 => "info,beacon_switchboard=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            tracing::info!(port = config.server.port, "starting switchboard");
            let daemon = Arc::new(Daemon::new(config)?);
            daemon.run().await?;
            Ok(())
        }
        Command::Channels => {
            list_channels(&config);
            Ok(())
        }
        Command::Senders { action } => senders(&config, action).await,
        Command::Pairing {
            action: PairingCommand::Approve { channel, code },
        } => {
            let store = open_store(&config)?;
            match store.approve_code(&ChannelType::new(channel), &code).await? {
                Some(record) => {
                    println!("approved {}/{}", record.channel_type, record.sender_id);
                    Ok(())
                }
                None => anyhow::bail!("no pending sender holds code {code}"),
            }
        }
    }
}

fn list_channels(config: &Config) {
    let catalog = Registry::with_plugin_dirs(config.plugin_dirs.clone()).discover();
    if catalog.is_empty() {
        println!("no channel types available");
        return;
    }
    for name in catalog.names() {
        let origin = match catalog.provenance(name) {
            Some(beacon_switchboard::registry::Provenance::Plugin(origin)) => origin.as_str(),
            _ => "builtin",
        };
        println!("{name:<16} {origin}");
    }
}

fn open_store(config: &Config) -> anyhow::Result<SenderStore> {
    let pool = db::init(config.database_path())?;
    Ok(SenderStore::new(pool, config.pairing.clone()))
}

async fn senders(config: &Config, action: SendersCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let record = match action {
        SendersCommand::List { channel } => {
            let channel = channel.map(ChannelType::new);
            for record in store.list(channel.as_ref())? {
                print_sender(&record);
            }
            return Ok(());
        }
        SendersCommand::Approve { channel, sender } => {
            store.approve(&ChannelType::new(channel), &sender).await?
        }
        SendersCommand::Block { channel, sender } => {
            store.block(&ChannelType::new(channel), &sender).await?
        }
        SendersCommand::Unblock { channel, sender } => {
            store.unblock(&ChannelType::new(channel), &sender).await?
        }
    };
    print_sender(&record);
    Ok(())
}

fn print_sender(record: &SenderRecord) {
    println!(
        "{:<12} {:<24} {:<9} {}",
        record.channel_type,
        record.sender_id,
        record.status.as_str(),
        record.updated_at.to_rfc3339()
    );
}

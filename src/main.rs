//! The rtctunnel CLI: manage the config and run the tunnel.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rtctunnel::channels::ChannelRegistry;
use rtctunnel::config::{self, Config, Route, RouteKind};
use rtctunnel::crypt::Key;
use rtctunnel::tunnel;

#[derive(Debug, Parser)]
#[command(name = "rtctunnel", about = "rtctunnel creates network tunnels over WebRTC")]
struct Cli {
    /// The config file.
    #[arg(long, global = true)]
    config_file: Option<PathBuf>,

    /// The ip address to bind.
    #[arg(long, global = true, default_value = "127.0.0.1")]
    bind_address: IpAddr,

    /// The log level to use.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a new key pair and store a fresh config to disk.
    Init,
    /// Print the public key and routes of the config.
    Info,
    /// Validate and append a route.
    AddRoute {
        /// The local port to start listening on.
        #[arg(long)]
        local_port: u16,
        /// The remote port to connect to.
        #[arg(long)]
        remote_port: u16,
        /// The local peer (defaults to this config's public key).
        #[arg(long)]
        local_peer: Option<String>,
        /// The remote peer.
        #[arg(long)]
        remote_peer: String,
        /// The route type (TCP or UDP).
        #[arg(long, default_value = "TCP")]
        r#type: String,
    },
    /// Load the config, connect to peers, and start forwarding.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).context("invalid log level")?)
        .init();

    let config_file = match &cli.config_file {
        Some(path) => path.clone(),
        None => config::default_path()?,
    };

    match cli.command {
        Command::Init => {
            if config_file.exists() {
                bail!(
                    "config file {} already exists. remove it if you want to re-initialize",
                    config_file.display()
                );
            }
            let cfg = Config::generate();
            tracing::info!(
                public_key = %cfg.keypair.public,
                config_file = %config_file.display(),
                "saving config file"
            );
            cfg.save(&config_file).context("failed to save config file")?;
        }

        Command::Info => {
            let cfg = Config::load(&config_file).context("failed to load config file")?;
            println!("public-key: {}", cfg.keypair.public);
            println!("routes:");
            for route in &cfg.routes {
                println!(
                    "  {}:{} -> {}:{}",
                    route.local_peer, route.local_port, route.remote_peer, route.remote_port
                );
            }
        }

        Command::AddRoute {
            local_port,
            remote_port,
            local_peer,
            remote_peer,
            r#type,
        } => {
            let mut cfg = Config::load(&config_file).context("failed to load config file")?;

            if local_port == 0 {
                bail!("local-port is required");
            }
            if remote_port == 0 {
                bail!("remote-port is required");
            }
            let local_peer: Key = match local_peer {
                Some(raw) => raw.parse().context("invalid local peer key")?,
                None => cfg.keypair.public,
            };
            let remote_peer: Key = remote_peer.parse().context("invalid remote peer key")?;
            let kind: RouteKind = r#type.parse()?;

            tracing::info!(
                local_port,
                local_peer = %local_peer,
                remote_peer = %remote_peer,
                remote_port,
                kind = %kind,
                "adding route"
            );
            cfg.add_route(Route {
                local_port,
                local_peer,
                remote_peer,
                remote_port,
                kind,
            });
            cfg.save(&config_file).context("failed to save config file")?;
        }

        Command::Run => {
            let cfg = Config::load(&config_file).context("failed to load config file")?;
            if !cfg.keypair.private.valid() {
                bail!("invalid config file, missing private key");
            }
            tracing::info!(
                config_file = %config_file.display(),
                public_key = %cfg.keypair.public,
                routes = cfg.routes.len(),
                signal_channel = cfg.signal_channel.as_deref().unwrap_or("(default)"),
                "using config"
            );

            let registry = ChannelRegistry::new();
            tunnel::run(cfg, &registry, cli.bind_address).await?;
        }
    }

    Ok(())
}

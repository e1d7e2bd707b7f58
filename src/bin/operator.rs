//! The operator: rendezvous broker for rtctunnel signaling.

use std::net::SocketAddr;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rtctunnel::operator::{serve, Broker};

#[derive(Debug, Parser)]
#[command(
    name = "rtctunnel-operator",
    about = "Long-polling rendezvous broker for rtctunnel signaling"
)]
struct Args {
    /// The address to listen on.
    #[arg(long, default_value = "127.0.0.1:9451")]
    bind_address: SocketAddr,

    /// The log level to use.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level)?)
        .init();

    serve(args.bind_address, Broker::new()).await?;
    Ok(())
}

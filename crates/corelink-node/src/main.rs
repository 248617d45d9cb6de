mod context;
mod echo;
mod events;
mod hub;
mod peer;

use std::net::Ipv4Addr;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use context::{NodeContext, NodeOptions};
use corelink_framework::ServiceType;

#[derive(Parser)]
#[command(name = "corelink-node", about = "Run a corelink hub or peer")]
struct Cli {
    /// Service name. Generated from the service type when omitted.
    #[arg(short, long)]
    name: Option<String>,

    /// Cluster domain; only services of the same domain find each other.
    #[arg(long, default_value = "corelink")]
    domain: String,

    /// Discovery group address.
    #[arg(long, default_value = "224.0.0.226")]
    group: Ipv4Addr,

    /// Discovery group port.
    #[arg(long, default_value = "5599")]
    group_port: u16,

    /// Address the hub listens on and announces.
    #[arg(long, default_value = "127.0.0.1")]
    listen: String,

    /// Listen port range, e.g. "5600-5800" (end exclusive).
    #[arg(long)]
    ports: Option<String>,

    /// Use MessagePack instead of JSON on the wire.
    #[arg(long)]
    msgpack: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Hub mode: announce, accept peers, echo their requests.
    Hub {
        /// Concurrent transaction sessions.
        #[arg(long, default_value = "1024")]
        sessions: u32,
    },

    /// Peer mode: find the hub and send it periodic echo requests.
    Peer {
        /// Service type of this peer.
        #[arg(long = "type", value_enum, default_value = "cell")]
        kind: PeerKind,
        /// Delay between echo requests in ms.
        #[arg(long, default_value = "2000")]
        interval: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PeerKind {
    Cell,
    Image,
}

impl From<PeerKind> for ServiceType {
    fn from(kind: PeerKind) -> Self {
        match kind {
            PeerKind::Cell => ServiceType::Cell,
            PeerKind::Image => ServiceType::Image,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = NodeOptions {
        name: cli.name,
        domain: cli.domain,
        group: cli.group,
        group_port: cli.group_port,
        listen: cli.listen,
        ports: cli.ports,
        msgpack: cli.msgpack,
    };

    eprintln!("corelink-node v{}", env!("CARGO_PKG_VERSION"));

    let node = match cli.command {
        Command::Hub { sessions } => NodeContext::hub(&options, sessions)?,
        Command::Peer { kind, interval } => {
            NodeContext::peer(&options, kind.into(), Duration::from_millis(interval))?
        }
    };

    node.start().await?;
    node.wait().await?;
    node.shutdown().await?;
    Ok(())
}

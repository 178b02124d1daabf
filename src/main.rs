use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use chord_dht::core::{Config, Endpoint};
use chord_dht::node::Node;
use chord_dht::store::FsStore;
use chord_dht::{client, server};

/// A Chord distributed hash table node.
#[derive(Debug, Parser)]
#[command(name = "chord-dht", version, about)]
struct Args {
    /// Run the interactive client against a node's service endpoint
    /// instead of a node.
    #[arg(long)]
    client: bool,

    /// Known peer to join through (node mode) or the service endpoint to
    /// connect to (client mode).
    peer: Option<Endpoint>,

    /// Address advertised to peers.
    #[arg(long, default_value_t = Ipv4Addr::LOCALHOST)]
    host: Ipv4Addr,

    /// Port for the routing protocol and the client service
    /// (0 = OS-assigned).
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Root directory of the blob store.
    #[arg(long, default_value = "chord-store")]
    store_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    if args.client {
        let server = args
            .peer
            .context("--client needs a service endpoint, e.g. 127.0.0.1:4242")?;
        return client::run_repl(server).await;
    }

    run_node(args).await
}

async fn run_node(args: Args) -> Result<()> {
    let config = Config {
        host: args.host,
        port: args.port,
        store_dir: args.store_dir,
        ..Config::default()
    };

    let node = Node::bind(config).await?;

    // Join before spawning: the join handshake is the only synchronous
    // read on the node socket.
    if let Some(peer) = args.peer {
        node.join(peer).await?;
    }

    let handle = node.spawn();

    let store = FsStore::open(&node.config().store_dir).await?;
    let (service_addr, service) =
        server::serve(node.clone(), store, node.shutdown_signal()).await?;

    info!(node = %node.local(), service = %service_addr, "node running");

    // Minimal operator console.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await? {
            Some(line) => match line.trim() {
                "p" => print!("{}", node.snapshot()),
                "q" => break,
                "" => {}
                other => println!("unknown command '{other}': p prints the ring, q quits"),
            },
            // stdin closed (e.g. running under a supervisor): park until
            // the process is killed.
            None => std::future::pending::<()>().await,
        }
    }

    node.leave().await;
    handle.shutdown().await;
    service.abort();
    Ok(())
}

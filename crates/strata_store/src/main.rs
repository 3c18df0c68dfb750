// strata-store node binary: wires the shard engines, log store, state
// machine, and RESP listener together behind a CLI.

use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use strata_store::node::{KvNode, ShardConfig};
use strata_store::redis_server;

#[derive(Parser)]
#[command(name = "strata-store", about = "Replicated sharded KV store node")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a shard node.
    Node(NodeArgs),
}

#[derive(clap::Args)]
struct NodeArgs {
    /// Node identity within the replica group.
    #[arg(long)]
    node_id: u64,
    /// Replica group (shard) id.
    #[arg(long, default_value_t = 1)]
    group_id: u32,
    /// Data directory holding the raft log and data engines.
    #[arg(long)]
    data_dir: PathBuf,
    /// Namespace this shard is bound to; every wire key carries it.
    #[arg(long, default_value = "default")]
    namespace: String,
    /// RESP listen address.
    #[arg(long, default_value = "127.0.0.1:6380")]
    listen_redis: SocketAddr,
    /// Applied entries between snapshot+compact cycles (0 disables).
    #[arg(long, default_value_t = 10_000)]
    snap_count: u64,
    /// Per-proposal deadline in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    propose_timeout_ms: u64,
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Node(args) => run_node(args).await,
    }
}

async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    std::fs::create_dir_all(&args.data_dir).context("create data dir")?;

    let mut config = ShardConfig::new(args.node_id, args.group_id, &args.data_dir, args.namespace);
    config.snap_count = args.snap_count;
    config.propose_timeout = Duration::from_millis(args.propose_timeout_ms.max(1));

    let node = KvNode::open(config)?;
    let server = tokio::spawn(redis_server::run(args.listen_redis, node.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
        res = server => res.context("redis server task")??,
    }

    node.shutdown().await;
    Ok(())
}

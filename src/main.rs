use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use cfs::chunkserver::{LocalChunkserver, MemoryChunkserver, NodeClient, SqliteChunkserver};
use cfs::client::{Client, ClientOptions};
use cfs::common::NodePool;
use cfs::config::{Config, NodeBackend};
use cfs::master::NamespaceTree;
use cfs::shell::{Flow, Shell};
use cfs::{FsError, Result};

#[derive(Parser)]
#[command(name = "cfs")]
#[command(about = "Interactive shell for a chunked, replicated file store")]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured chunk size, e.g. "4 KiB"
    #[arg(long)]
    chunk_size: Option<String>,

    /// Keep chunks in memory instead of the node data directories
    #[arg(long)]
    in_memory: bool,
}

fn build_pool(config: &Config, in_memory: bool) -> Result<NodePool> {
    let mut pool = NodePool::new();
    for node in &config.nodes {
        let client: Arc<dyn NodeClient> = match (in_memory, node.backend) {
            (true, _) => Arc::new(MemoryChunkserver::new(node.id.clone())),
            (false, NodeBackend::File) => {
                Arc::new(LocalChunkserver::new(node.id.clone(), &node.data_dir, config.read_cache_entries)?)
            }
            (false, NodeBackend::Sqlite) => Arc::new(SqliteChunkserver::open(node.id.clone(), &node.data_dir)?),
        };
        let node_ref = pool.add_node(client);
        tracing::info!("Node {} is {}", node.id, node_ref);
    }
    Ok(pool)
}

/// Fail startup unless at least one node answers.
async fn probe(pool: &NodePool) -> Result<()> {
    let mut reachable = 0;
    for (node_ref, node) in pool.iter() {
        match node.list().await {
            Ok(keys) => {
                tracing::info!("Node {} ({}) holds {} chunks", node.id(), node_ref, keys.len());
                reachable += 1;
            }
            Err(e) => tracing::warn!("Node {} ({}) unreachable: {}", node.id(), node_ref, e),
        }
    }
    if reachable == 0 {
        return Err(FsError::node_unavailable("all", "no storage node is reachable"));
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(chunk_size) = cli.chunk_size {
        config.chunk_size = chunk_size;
    }
    config.validate()?;

    let pool = build_pool(&config, cli.in_memory)?;
    probe(&pool).await?;

    let client = Client::new(Arc::new(NamespaceTree::new()), pool, ClientOptions::from_config(&config)?);
    let mut shell = Shell::new(Arc::new(client), std::io::stdout());

    println!("Welcome to the Distributed File System!");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{}", shell.prompt().await);
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        if shell.execute(&line).await? == Flow::Exit {
            break;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cfs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(Cli::parse()).await {
        tracing::error!("Fatal: {}", e);
        std::process::exit(1);
    }
}

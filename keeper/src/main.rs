//! Safe keeper CLI
//!
//! Run modes:
//!   safe-keeper run                   - Start the keeper node and status API
//!   safe-keeper resume-safe <holder>  - Clear the halt of a safe

use clap::{Parser, Subcommand};
use safe_common::logging::{init_logging, LogLevel};
use safe_common::{Chain, HttpBus};
use safe_keeper::{create_router, AppState, ChainClients, EsploraRpc, EvmRpc, KeeperConfig, KeeperNode, SqliteStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "safe-keeper")]
#[command(about = "Keeper node for safe custody")]
struct Cli {
    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the keeper node
    Run,

    /// Resume processing for a halted safe
    ResumeSafe {
        /// Hex holder key of the safe
        holder: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging("safe-keeper", LogLevel::from(cli.log_level.as_str()), cli.log_json)?;

    let config = KeeperConfig::from_env()?;
    match cli.command {
        Commands::Run => run_node(config).await?,
        Commands::ResumeSafe { holder } => {
            let node = build_node(config)?;
            node.resume_safe(&holder.to_lowercase()).await?;
            let replayed = node.replay_initial().await?;
            println!("safe {} resumed, {} requests finished", holder, replayed);
        }
    }

    Ok(())
}

fn chain_clients(config: &KeeperConfig) -> ChainClients {
    config
        .rpc
        .iter()
        .fold(ChainClients::new(), |clients, (chain, url)| match chain {
            Chain::Bitcoin | Chain::Litecoin => clients.with(*chain, Arc::new(EsploraRpc::new(url))),
            Chain::Ethereum | Chain::Polygon => clients.with(*chain, Arc::new(EvmRpc::new(url))),
        })
}

fn build_node(config: KeeperConfig) -> Result<KeeperNode, Box<dyn std::error::Error>> {
    let store = Arc::new(SqliteStore::new(&config.database_path)?);
    let bus = Arc::new(HttpBus::new(config.peers.clone()));
    let clients = chain_clients(&config);
    Ok(KeeperNode::new(config, store, bus, clients)?)
}

async fn run_node(config: KeeperConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.print_summary();
    let addr: SocketAddr = config.bind.parse()?;
    let node = Arc::new(build_node(config)?);

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let runner = tokio::spawn(node.clone().run(inbound_rx));

    let app = create_router(Arc::new(AppState { node }), inbound_tx);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    runner.abort();
    Ok(())
}

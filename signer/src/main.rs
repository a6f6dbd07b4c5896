//! Safe signer CLI
//!
//! Entry point for running a signer node.

use clap::{Parser, Subcommand};
use safe_common::logging::{init_logging, LogLevel};
use safe_common::{HttpBus, OperationCipher, TransportKey};
use safe_signer::{create_router, AppState, Keystore, SessionContext, SignerConfig, SignerNode};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "safe-signer")]
#[command(about = "Threshold signer node for safe custody")]
struct Cli {
    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "debug")]
    log_level: String,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signer node
    Run {
        /// Path to the TOML config
        #[arg(short, long)]
        config: String,

        /// Keystore password (overrides the config file)
        #[arg(long, env = "SAFE_KEYSTORE_PASSWORD")]
        password: Option<String>,

        /// Hex operation key shared with the keeper
        #[arg(long, env = "SAFE_OPERATION_KEY")]
        operation_key: Option<String>,

        /// Hex x25519 transport secret of this node
        #[arg(long, env = "SAFE_TRANSPORT_KEY")]
        transport_key: Option<String>,
    },

    /// Generate an x25519 transport key pair for a new member
    GenerateTransportKey,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging("safe-signer", LogLevel::from(cli.log_level.as_str()), cli.log_json)?;

    match cli.command {
        Commands::Run {
            config,
            password,
            operation_key,
            transport_key,
        } => {
            let mut config = SignerConfig::load(&config)?;
            config.keystore_password = password.or(config.keystore_password);
            config.operation_key = operation_key.or(config.operation_key);
            config.transport_key = transport_key.or(config.transport_key);
            run_node(config).await?;
        }
        Commands::GenerateTransportKey => {
            let key = TransportKey::generate();
            println!("secret: {}", key.secret_hex());
            println!("public: {}", key.public_hex());
        }
    }

    Ok(())
}

async fn run_node(config: SignerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let password = config
        .keystore_password
        .clone()
        .ok_or("keystore password is required")?;
    let cipher = OperationCipher::from_hex(config.operation_key.as_deref().ok_or("operation key is required")?)?;
    let transport = TransportKey::from_hex(config.transport_key.as_deref().ok_or("transport key is required")?)?;

    tracing::info!(
        node_id = %config.node_id,
        members = config.members.len(),
        threshold = config.threshold,
        keystore = %config.keystore_dir.display(),
        "Starting safe signer"
    );

    std::fs::create_dir_all(&config.keystore_dir)?;
    let members: BTreeMap<String, String> = config
        .members
        .iter()
        .map(|m| (m.id.clone(), m.transport_public.clone()))
        .collect();
    let bus = Arc::new(HttpBus::new(config.peer_urls()));
    let ctx = SessionContext::new(
        config.node_id.clone(),
        members,
        config.threshold,
        config.round_timeout(),
        transport,
        bus,
    )?;

    let node = Arc::new(SignerNode::new(
        Arc::new(ctx),
        config.keeper_id.clone(),
        config.output_asset_id,
        cipher,
        Keystore::new(&config.keystore_dir, config.node_id.clone(), password),
        config.session_timeout(),
    )?);

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let runner = tokio::spawn(node.clone().run(inbound_rx));

    let app = create_router(Arc::new(AppState { node }), inbound_tx);
    let addr: SocketAddr = config.bind.parse()?;
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

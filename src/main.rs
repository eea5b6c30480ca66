//! channel-rpc command line client
//!
//! Connects to a node, authenticates, pings, and optionally makes one call.
//!
//! ## Usage
//!
//! ```bash
//! # Connect with defaults and approve the challenge with the local wallet key
//! channel-rpc --auto-approve
//!
//! # Custom node and config
//! channel-rpc --url wss://node.example/ws --config /path/to/config.toml
//!
//! # Make a call and print the response
//! channel-rpc --auto-approve --call get_config --params '[]'
//!
//! # Stay connected and print events until Ctrl-C
//! channel-rpc --auto-approve --watch
//! ```
//!
//! The wallet is a local key kept under `<store_dir>/wallet/`; a browser or
//! hardware wallet plugs in through the `Signer` trait instead.

use anyhow::{Context, Result};
use channel_rpc::rpc::WsConnector;
use channel_rpc::{
    ClientConfig, ClientEvent, CredentialStore, FileCredentialStore, RpcClient, RpcRequest,
    Signer,
};
use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "channel-rpc")]
#[command(about = "Client for state channel nodes")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node WebSocket URL
    #[arg(long, env = "CHANNEL_RPC_URL")]
    url: Option<String>,

    /// Directory for the cached token and keys
    #[arg(long, env = "CHANNEL_RPC_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// Approve the auth challenge with the local wallet key
    #[arg(long)]
    auto_approve: bool,

    /// Method to call once connected
    #[arg(long)]
    call: Option<String>,

    /// JSON params for --call
    #[arg(long, default_value = "[]")]
    params: String,

    /// Keep the connection open and print events until Ctrl-C
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("channel_rpc=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(url) = args.url.clone() {
        config.url = url;
    }
    if let Some(dir) = args.store_dir.clone() {
        config.store_dir = dir;
    }
    config.validate().context("Invalid configuration")?;

    info!(
        url = %config.url,
        store_dir = %config.store_dir.display(),
        "Starting channel-rpc"
    );

    let store = FileCredentialStore::new(config.store_dir.clone());
    let session_key = store
        .load_or_create_session_key()
        .context("Failed to load session key")?;
    let wallet = FileCredentialStore::new(config.store_dir.join("wallet"))
        .load_or_create_session_key()
        .context("Failed to load wallet key")?;
    let wallet: Arc<dyn Signer> = Arc::new(wallet);

    info!(
        wallet = %wallet.address(),
        session_key = %session_key.address(),
        "Identity loaded"
    );

    let client = RpcClient::new(config, Arc::new(WsConnector), Arc::new(store))
        .context("Failed to start client")?;
    let events = tokio::spawn(print_events(client.clone(), args.auto_approve));

    client
        .connect(session_key, wallet)
        .await
        .context("Failed to connect")?;

    let rtt = client.ping().await.context("Ping failed")?;
    info!(rtt_ms = rtt.as_millis() as u64, "Node answered ping");

    if let Some(method) = &args.call {
        let params: Value = serde_json::from_str(&args.params).context("--params is not valid JSON")?;
        let params = match params {
            Value::Array(items) => items,
            other => vec![other],
        };
        let response = client
            .send_with_response(RpcRequest::new(method.clone(), params), None)
            .await
            .with_context(|| format!("Call to {} failed", method))?;
        println!("{}", serde_json::to_string_pretty(&Value::Array(response.params))?);
    }

    if args.watch {
        info!("Watching connection, press Ctrl-C to exit");
        tokio::signal::ctrl_c().await?;
    }

    client.disconnect().await?;
    events.abort();
    Ok(())
}

async fn print_events(client: RpcClient, auto_approve: bool) {
    let mut events = client.subscribe();
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::StatusChanged(status) => info!(status = %status, "Status"),
            ClientEvent::ChallengeReceived(challenge) => {
                if auto_approve {
                    info!(challenge = %challenge.challenge, "Approving challenge");
                    if let Err(e) = client.approve_challenge().await {
                        error!(error = %e, "Challenge approval failed");
                    }
                } else {
                    warn!("Challenge received; rerun with --auto-approve to sign it");
                    if let Err(e) = client.reject_challenge().await {
                        error!(error = %e, "Failed to reject challenge");
                    }
                }
            }
            ClientEvent::AuthenticationFailed(reason) => error!(reason = %reason, "Authentication failed"),
            ClientEvent::Message(response) => {
                info!(id = response.id, method = %response.method, "Message");
            }
        }
    }
}

//! The vigil daemon: wires the node connector, the ZC parser, the
//! subscriber registry, and the encrypted client listener together.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gumdrop::Options;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vigil_client::connection;
use vigil_client::{CommandDispatcher, SubscriberRegistry};
use vigil_mempool::parser;
use vigil_mempool::BroadcastTracker;
use vigil_net::{FramedSocket, LocalIdentity, PeerSet};
use vigil_node::{pump, NodeBroadcaster};

mod chain_index;
mod config;
mod node_rpc;

use config::VigildConfig;

#[derive(Debug, Options)]
struct Args {
    #[options(help = "print this help message")]
    help: bool,

    #[options(help = "path to the TOML config file")]
    config: Option<PathBuf>,

    #[options(help = "network to track (mainnet, testnet, regtest)")]
    network: Option<String>,

    #[options(help = "address to listen on for clients")]
    listen: Option<String>,
}

fn load_config(args: &Args) -> color_eyre::Result<VigildConfig> {
    let mut config = match &args.config {
        Some(path) => VigildConfig::load(path)?,
        None => VigildConfig::default(),
    };
    if let Some(network) = &args.network {
        config.network = network.parse()?;
    }
    if let Some(listen) = &args.listen {
        config.listen_addr = listen.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse_args_default_or_exit();
    let config = load_config(&args)?;
    info!(network = ?config.network, listen = %config.listen_addr, "vigild starting");

    // long-term transport identity; the cookie lets local front-ends
    // pin our key without out-of-band setup
    let identity = LocalIdentity::generate();
    std::fs::write(&config.cookie_path, hex::encode(identity.public_key()))?;
    info!(cookie = %config.cookie_path.display(), "wrote identity cookie");

    let mut authorized = PeerSet::new();
    for key_hex in &config.authorized_clients {
        let bytes = hex::decode(key_hex)?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| color_eyre::eyre::eyre!("authorized client key must be 32 bytes"))?;
        authorized.authorize(key);
    }

    // node connector + confirmed-chain index over the same RPC endpoint
    let node = node_rpc::NodeRpcClient::new(
        config.node_rpc_url.clone(),
        config.node_rpc_user.clone(),
        config.node_rpc_password.clone(),
    );
    let chain = Arc::new(chain_index::RpcChainIndex::new(node.clone(), config.network));

    let registry = Arc::new(SubscriberRegistry::new());
    let tracker = Arc::new(BroadcastTracker::new());

    let (parser_handle, parser_join) = parser::spawn(
        config.mempool.clone(),
        chain.clone(),
        registry.clone(),
        registry.clone(),
        tracker.clone(),
    );

    let broadcaster = Arc::new(NodeBroadcaster::new(
        node.clone(),
        node.clone(),
        tracker,
        registry.clone(),
        config.broadcast.clone(),
    ));

    tokio::spawn(node_rpc::run_node_poller(
        node.clone(),
        Duration::from_millis(config.node_poll_interval_ms),
    ));
    tokio::spawn(pump::run_event_pump(
        node.clone(),
        parser_handle.clone(),
        registry.clone(),
    ));

    let dispatcher = Arc::new(CommandDispatcher::new(
        registry.clone(),
        parser_handle.clone(),
        broadcaster,
        chain,
    ));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "listening for clients");

    let accept_loop = async {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(%error, "accept failed");
                    continue;
                }
            };
            info!(%peer_addr, "inbound connection");

            let identity = identity.clone();
            let authorized = authorized.clone();
            let auth_mode = config.client_auth;
            let net_config = config.net.clone();
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                match FramedSocket::accept(stream, identity, authorized, auth_mode, net_config)
                    .await
                {
                    Ok(socket) => connection::serve(socket, dispatcher).await,
                    Err(error) => warn!(%peer_addr, %error, "handshake failed"),
                }
            });
        }
    };

    tokio::select! {
        _ = accept_loop => {}
        result = parser_join => {
            error!(?result, "parser task exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            let _ = parser_handle.send(parser::ParserEvent::Shutdown).await;
        }
    }

    Ok(())
}

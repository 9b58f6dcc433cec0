use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use voxgate_bridge::bridge::{BridgeConfig, ReplySignal, VoxtaBridge};
use voxgate_core::events::GatewayEvent;
use voxgate_core::state::StateStore;
use voxgate_server::{Gateway, ServerConfig};

#[derive(Parser)]
#[command(name = "voxgate", about = "State-mirroring gateway for the Voxta engine")]
struct Args {
    /// Port for the HTTP/WebSocket server
    #[arg(long, default_value_t = 8081)]
    port: u16,

    /// Base URL of the Voxta engine
    #[arg(long, default_value = "http://127.0.0.1:5384")]
    voxta_url: String,

    /// Seconds between upstream reconnect attempts
    #[arg(long, default_value_t = 5)]
    reconnect_delay: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!(voxta_url = %args.voxta_url, "Starting voxgate");

    let state = StateStore::new();
    let (event_tx, event_rx) = broadcast::channel::<GatewayEvent>(1024);
    let (reply_tx, reply_rx) = mpsc::channel::<ReplySignal>(256);
    let cancel = CancellationToken::new();

    let bridge = VoxtaBridge::new(
        BridgeConfig {
            base_url: args.voxta_url,
            reconnect_delay: Duration::from_secs(args.reconnect_delay),
            ..Default::default()
        },
        state.clone(),
        event_tx.clone(),
        reply_tx,
    );
    let _bridge_task = bridge.start(cancel.clone());

    let gateway = Gateway::new(state.clone(), Arc::clone(&bridge), event_tx);
    let _reply_task = gateway.start_reply_loop(reply_rx, cancel.clone());

    let config = ServerConfig {
        port: args.port,
        ..Default::default()
    };
    let handle = voxgate_server::start(config, state, gateway, bridge, event_rx)
        .await
        .expect("Failed to start server");

    tracing::info!(port = handle.port, "voxgate ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl+c");

    tracing::info!("Shutting down");
    cancel.cancel();
}

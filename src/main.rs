use clap::{Parser, ValueEnum};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tether::auth::{AuthNegotiator, MemoryCredentialStore, PrefixGuestIdentity};
use tether::transport::{TcpConnector, TransportConnector, WsConnector};
use tether::{ClientConfig, ConnectionManager, ConnectionState, OutboundMessage};
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportKind {
    Tcp,
    Ws,
}

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Demo client for the Tether connection manager")]
struct Cli {
    /// Server address (host:port for TCP, ws:// URL for WebSocket)
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Transport to use
    #[arg(short, long, value_enum, default_value = "tcp")]
    transport: TransportKind,

    /// Access token to seed the credential store with
    #[arg(long, env = "TETHER_TOKEN")]
    token: Option<String>,

    /// Refresh token to seed the credential store with
    #[arg(long)]
    refresh_token: Option<String>,

    /// Seconds between status messages
    #[arg(long, default_value_t = 10)]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    info!("Tether client starting");
    info!("  Server: {} ({:?})", cli.server, cli.transport);

    match cli.transport {
        TransportKind::Tcp => run(TcpConnector::new(cli.server.clone()), &cli).await,
        TransportKind::Ws => run(WsConnector::new(cli.server.clone()), &cli).await,
    }
}

async fn run<C: TransportConnector>(connector: C, cli: &Cli) -> anyhow::Result<()> {
    let store = Arc::new(MemoryCredentialStore::with_tokens(
        cli.token.clone(),
        cli.refresh_token.clone(),
    ));
    let auth = AuthNegotiator::new(store, Arc::new(PrefixGuestIdentity::default()));
    let manager = ConnectionManager::new(ClientConfig::default(), connector, auth);

    let _states = manager.on_connection_state_change(|state| match state {
        ConnectionState::Connected => info!("Connection state: {}", state),
        ConnectionState::Error | ConnectionState::Reconnecting => {
            warn!("Connection state: {}", state)
        }
        _ => info!("Connection state: {}", state),
    });
    let _auth_errors = manager.on("auth_error", |envelope| {
        warn!("Backend rejected credential: {:?}", envelope.data);
    });
    let _events = manager.on_any(|envelope| {
        info!(
            "Received '{}' (session={:?}): {:?}",
            envelope.msg_type, envelope.session_id, envelope.data
        );
    });

    // Retries continue in the background after a failed first attempt
    if let Err(e) = manager.connect().await {
        warn!("Initial connect failed: {}", e);
    }

    let mut ticker = interval(Duration::from_secs(cli.status_interval.max(1)));
    let mut sequence: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sequence += 1;
                let mut message = OutboundMessage::new(
                    "client_status",
                    Some(json!({
                        "sequence": sequence,
                        "latencyMs": manager.latency().as_millis() as u64,
                    })),
                );
                if let Some(session) = manager.session() {
                    message = message.with_session(session.session_id);
                }
                manager.send(message);
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Shutting down");
                manager.disconnect();
                break;
            }
        }
    }

    // Let the actor close the transport before the runtime stops
    let mut state = manager.state_watcher();
    let _ = tokio::time::timeout(
        Duration::from_secs(1),
        state.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await;

    Ok(())
}

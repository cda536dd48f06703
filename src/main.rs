//! CLI for eventfabric
//!
//! Subcommands:
//! - `server`: run the event fabric (bus, relay, session state machine, WebSocket server)
//! - `client`: subscribe to a pattern and print every frame (useful for smoke tests)

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eventfabric::broker::{EventBus, Relay};
use eventfabric::config::{Settings, load_config};
use eventfabric::session::{
    BusFacade, ConnectionStateMachine, RetryPolicy, SessionCommandHandler,
};
use eventfabric::transport::{CommandRouter, WebSocketServer};
use eventfabric::utils::error::FabricError;
use eventfabric::utils::logging;
use tracing::{error, info};

/// How long shutdown waits for the session to apply its final disconnect.
const SESSION_STOP_LIMIT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "eventfabric")]
enum Command {
    /// Start the event fabric server
    Server,
    /// Subscribe to a topic pattern and print received frames
    Client {
        /// WebSocket server URL to connect to
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        /// Topic pattern to subscribe to
        #[arg(long, default_value = "**")]
        topic: String,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    match cmd {
        Command::Server => {
            if let Err(e) = run_server().await {
                error!("Server failed: {e}");
                std::process::exit(1);
            }
        }
        Command::Client { url, topic } => {
            logging::init("info");
            if let Err(e) = run_client(&url, &topic).await {
                error!("Client failed: {e}");
                std::process::exit(1);
            }
        }
    }
}

/// Load settings, making sure a failure is logged somewhere.
fn load_settings() -> Result<Settings, FabricError> {
    let config = load_config().inspect_err(|_| logging::init("info"))?;
    logging::init(&config.logging.level);
    Ok(config)
}

async fn run_server() -> Result<(), FabricError> {
    let config = load_settings()?;

    let (bus, bus_rx) = EventBus::new(config.relay.handoff_capacity);
    let (relay, relay_handle) = Relay::new(bus_rx);
    let relay_task = tokio::spawn(relay.run());

    let session = ConnectionStateMachine::new(
        RetryPolicy::from(&config.session),
        Arc::new(BusFacade::new(bus.clone())),
        Arc::new(bus.clone()),
    )
    .spawn();

    let router = CommandRouter::new()
        .with_service(
            "AndroidAuto",
            Arc::new(SessionCommandHandler::new(session.clone(), bus.clone())),
        )
        .with_bus_services(&bus);

    let server = WebSocketServer::bind(&config, relay_handle, Arc::new(router)).await?;
    info!(
        addr = %server.local_addr()?,
        secure = server.is_secure(),
        "Event fabric ready"
    );

    tokio::select! {
        _ = server.serve() => {
            error!("WebSocket server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    if session.shutdown(SESSION_STOP_LIMIT).await {
        // Let the relay hand the final session events to whoever is still connected.
        tokio::task::yield_now().await;
    }
    drop(bus);
    relay_task.abort();
    Ok(())
}

async fn run_client(url: &str, topic: &str) -> Result<(), Box<dyn std::error::Error>> {
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    let (mut ws_stream, _response) = connect_async(url).await?;
    info!(url, "Connected");

    let subscribe = json!({ "action": "subscribe", "topic": topic });
    ws_stream
        .send(WsMessage::Text(subscribe.to_string().into()))
        .await?;
    info!(topic, "Subscribed; waiting for frames");

    while let Some(msg) = ws_stream.next().await {
        match msg? {
            WsMessage::Text(text) => println!("{text}"),
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    info!("Server closed the connection");
    Ok(())
}

//! WebSocket transport
//!
//! This file implements the WebSocket server that connects UI clients to the
//! relay. Responsibilities:
//! - Accept TCP connections, optionally wrap them in TLS (`wss://`), and run
//!   the WebSocket handshake
//! - Enforce the configured connection limit
//! - Create a `Client` for each connection and register it with the relay
//! - Feed inbound text frames through the `CommandRouter`, answering
//!   rejected frames with an error frame on the same connection
//! - Drain the client's outbox onto the socket, in order
//!
//! Each connection runs two loops. The read loop owns the inbound half and
//! never writes to the socket directly; error replies go through the client's
//! frame channel like every other frame, so a client sees them in order with
//! its events. When the read loop ends it unregisters the client and tells
//! the send loop to stop, discarding anything still pending.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::RelayHandle;
use crate::client::{Client, Outbox};
use crate::config::Settings;
use crate::transport::message::ServerMessage;
use crate::transport::router::CommandRouter;
use crate::transport::tls::load_tls_acceptor;
use crate::utils::error::{ProtocolError, TransportError};

/// Error text sent to a connection refused by the connection limit.
pub const SERVER_AT_CAPACITY: &str = "server at capacity";

/// Everything a connection task needs, cloned per accept.
#[derive(Debug, Clone)]
struct ConnectionContext {
    relay: RelayHandle,
    router: Arc<CommandRouter>,
    client_queue_capacity: usize,
    max_connections: usize,
    active: Arc<AtomicUsize>,
}

/// Holds one slot of the connection limit until dropped.
struct ActiveSlot(Arc<AtomicUsize>);

impl ActiveSlot {
    fn acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let previous = active.fetch_add(1, Ordering::SeqCst);
        if previous >= max {
            active.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(ActiveSlot(active.clone()))
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WebSocketServer {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    ctx: ConnectionContext,
}

impl std::fmt::Debug for WebSocketServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("secure", &self.is_secure())
            .field("max_connections", &self.ctx.max_connections)
            .finish()
    }
}

impl WebSocketServer {
    /// Bind the listener described by `settings.server`.
    ///
    /// TLS material is loaded here, so a bad certificate fails startup rather
    /// than the first handshake.
    pub async fn bind(
        settings: &Settings,
        relay: RelayHandle,
        router: Arc<CommandRouter>,
    ) -> Result<Self, TransportError> {
        let tls = settings
            .server
            .tls_paths()
            .map(|(cert, key)| load_tls_acceptor(Path::new(cert), Path::new(key)))
            .transpose()?;

        let addr = settings.server.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.clone(),
                source,
            })?;

        let scheme = if tls.is_some() { "wss" } else { "ws" };
        info!("WebSocket server listening on {scheme}://{}", listener.local_addr()?);

        Ok(Self {
            listener,
            tls,
            ctx: ConnectionContext {
                relay,
                router,
                client_queue_capacity: settings.relay.client_queue_capacity,
                max_connections: settings.server.max_connections,
                active: Arc::new(AtomicUsize::new(0)),
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Whether connections are served over TLS.
    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    pub fn active_connections(&self) -> usize {
        self.ctx.active.load(Ordering::SeqCst)
    }

    /// Accept connections until the task is dropped.
    pub async fn serve(self) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {e}");
                    continue;
                }
            };
            let ctx = self.ctx.clone();

            match self.tls.clone() {
                Some(acceptor) => {
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => handle_connection(tls_stream, peer, ctx).await,
                            Err(e) => warn!(%peer, "TLS handshake error: {e}"),
                        }
                    });
                }
                None => {
                    tokio::spawn(handle_connection(stream, peer, ctx));
                }
            }
        }
    }
}

async fn handle_connection<S>(stream: S, peer: SocketAddr, ctx: ConnectionContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, "WebSocket handshake error: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let Some(_slot) = ActiveSlot::acquire(&ctx.active, ctx.max_connections) else {
        warn!(%peer, max = ctx.max_connections, "Connection limit reached; rejecting");
        if let Ok(text) = ServerMessage::error(SERVER_AT_CAPACITY).to_json() {
            let _ = ws_sender.send(WsMessage::Text(text.into())).await;
        }
        let _ = ws_sender.close().await;
        return;
    };

    let (client, outbox) = Client::new(ctx.client_queue_capacity);
    let client_id = client.id.clone();
    let replies = client.sender();
    ctx.relay.register(client);
    info!(client_id = %client_id, %peer, "Client connected");

    let (stop_tx, stop_rx) = oneshot::channel();
    let send_task = tokio::spawn(send_loop(ws_sender, outbox, stop_rx, client_id.clone()));
    let reply = |frame: ServerMessage| {
        if replies.send(frame).is_err() {
            debug!(client_id = %client_id, "Send loop gone; reply discarded");
        }
    };

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                if let Err(e) = ctx.router.handle_frame(&client_id, text.as_str(), &ctx.relay) {
                    reply(ServerMessage::error(e.to_string()));
                }
            }
            Ok(WsMessage::Binary(_)) => {
                reply(ServerMessage::error(ProtocolError::InvalidMessage.to_string()));
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(client_id = %client_id, "Read error: {e}");
                break;
            }
        }
    }

    ctx.relay.unregister(&client_id);
    let _ = stop_tx.send(());
    if let Err(e) = send_task.await {
        error!(client_id = %client_id, "Send loop panicked: {e}");
    }
    info!(client_id = %client_id, "Client disconnected");
}

/// Drain `outbox` onto the socket until it ends, a write fails or `stop`
/// fires.
async fn send_loop<S>(
    mut ws_sender: SplitSink<WebSocketStream<S>, WsMessage>,
    mut outbox: Outbox,
    mut stop: oneshot::Receiver<()>,
    client_id: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut stop => break,
            frame = outbox.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let text = match frame.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!(client_id = %client_id, "Failed to encode frame: {e}");
                continue;
            }
        };
        if let Err(e) = ws_sender.send(WsMessage::Text(text.into())).await {
            debug!(client_id = %client_id, "Failed to send frame: {e}");
            break;
        }
    }

    let _ = ws_sender.close().await;
    debug!(client_id = %client_id, "Send loop closed");
}

/// Bind per `settings` and serve until the task is dropped.
pub async fn start_websocket_server(
    settings: &Settings,
    relay: RelayHandle,
    router: Arc<CommandRouter>,
) -> Result<(), TransportError> {
    let server = WebSocketServer::bind(settings, relay, router).await?;
    server.serve().await;
    Ok(())
}

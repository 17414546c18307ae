//! WebSocket binding for the collaboration core.
//!
//! ```text
//! Client A ──┐
//!             ├── WebSocket ── CollabServer ── SyncCoordinator ── SessionRegistry
//! Client B ──┘                      │                                  │
//!                                   │                          ConflictResolver
//!                            RoomManager
//!                                   │
//!                        ┌──────────┴──────────┐
//!                        ▼                     ▼
//!                    Client A              Client B
//! ```
//!
//! The server owns the sockets and nothing else: every decoded event goes
//! through the coordinator behind a write lock, which serializes all session
//! mutations (the one mandatory exclusion region), and every returned
//! [`Outgoing`] is either sent back on the connection or fanned out through
//! the session's room.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{Frame, RoomManager};
use crate::coordinator::SyncCoordinator;
use crate::protocol::{ClientEvent, Outgoing, ServerMessage};
use crate::session::SessionId;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbox capacity per connection (frames buffered before drops)
    pub broadcast_capacity: usize,
    /// History entries retained per session, oldest trimmed first
    pub max_history: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9191".to_string(),
            broadcast_capacity: 256,
            max_history: 100,
        }
    }
}

/// Server-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    coordinator: Arc<RwLock<SyncCoordinator>>,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        let coordinator = Arc::new(RwLock::new(SyncCoordinator::new(config.max_history)));
        Self {
            config,
            coordinator,
            rooms: Arc::new(RoomManager::new()),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Accept loop. Call from an async runtime; runs until the process stops.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collaboration server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let coordinator = self.coordinator.clone();
            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, coordinator, rooms, stats, config).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        coordinator: Arc<RwLock<SyncCoordinator>>,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let conn_id = Uuid::new_v4();
        log::info!("connection {conn_id} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Room frames destined for this connection.
        let (outbox_tx, mut outbox_rx) = mpsc::channel::<Frame>(config.broadcast_capacity);
        let mut joined: Vec<SessionId> = Vec::new();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let event = match ClientEvent::decode(&bytes) {
                                Ok(event) => event,
                                Err(e) => {
                                    log::warn!("undecodable frame from {conn_id}: {e}");
                                    continue;
                                }
                            };

                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let outgoing =
                                coordinator.write().await.handle(conn_id, event.clone());

                            // A successful join subscribes this connection to
                            // the session room before any replies go out.
                            if matches!(event, ClientEvent::Join { .. }) {
                                if let Some(session_id) = snapshot_session_id(&outgoing) {
                                    rooms.join(session_id, conn_id, outbox_tx.clone()).await;
                                    if !joined.contains(&session_id) {
                                        joined.push(session_id);
                                    }
                                }
                            }

                            Self::dispatch(&mut ws_sender, &rooms, conn_id, &outgoing).await?;

                            if let ClientEvent::Leave { session_id, .. } = event {
                                rooms.leave(session_id, conn_id).await;
                                joined.retain(|s| *s != session_id);
                                rooms.remove_if_empty(session_id).await;
                            }

                            {
                                let session_count = coordinator.read().await.session_count();
                                stats.write().await.active_sessions = session_count;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection {conn_id} closed");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("websocket error from {conn_id}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                frame = outbox_rx.recv() => {
                    match frame {
                        Some(bytes) => {
                            ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                        }
                        None => break,
                    }
                }
            }
        }

        // Dropped connection: leave every joined session, then unsubscribe.
        let outgoing = coordinator.write().await.disconnect(conn_id);
        for out in &outgoing {
            if let Outgoing::ToRoom {
                session_id,
                message,
                include_sender,
            } = out
            {
                Self::broadcast(&rooms, conn_id, *session_id, message, *include_sender).await;
            }
        }
        for session_id in joined {
            rooms.leave(session_id, conn_id).await;
            rooms.remove_if_empty(session_id).await;
        }

        {
            let session_count = coordinator.read().await.session_count();
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_sessions = session_count;
        }

        Ok(())
    }

    /// Route one batch of coordinator output.
    async fn dispatch(
        ws_sender: &mut WsSink,
        rooms: &RoomManager,
        conn_id: Uuid,
        outgoing: &[Outgoing],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        for out in outgoing {
            match out {
                Outgoing::ToSender(message) => {
                    let encoded = message.encode()?;
                    ws_sender.send(Message::Binary(encoded.into())).await?;
                }
                Outgoing::ToRoom {
                    session_id,
                    message,
                    include_sender,
                } => {
                    Self::broadcast(rooms, conn_id, *session_id, message, *include_sender).await;
                }
            }
        }
        Ok(())
    }

    async fn broadcast(
        rooms: &RoomManager,
        conn_id: Uuid,
        session_id: SessionId,
        message: &ServerMessage,
        include_sender: bool,
    ) {
        let encoded = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("failed to encode broadcast for {session_id}: {e}");
                return;
            }
        };
        let exclude = if include_sender { None } else { Some(conn_id) };
        rooms.broadcast(session_id, Arc::new(encoded), exclude).await;
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Session id carried by a join reply, if the join succeeded.
fn snapshot_session_id(outgoing: &[Outgoing]) -> Option<SessionId> {
    outgoing.iter().find_map(|out| match out {
        Outgoing::ToSender(ServerMessage::SessionSnapshot { session_id, .. }) => Some(*session_id),
        _ => None,
    })
}

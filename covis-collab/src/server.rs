//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                    ┌── SceneStore (Mutex) ── index
//!            ├── Session (per) ───┤
//! Client B ──┘                    └── SubscriberRegistry ──┐
//!                                                          │ fan-out
//!                                     ┌────────────────────┼──────────┐
//!                                     ▼                    ▼          ▼
//!                                  Client A            Client B   Client C
//! ```
//!
//! Each connection runs its own task: it opens a [`Session`] (snapshot, then
//! registration), feeds inbound updates to it, and writes queued frames from
//! its outbox back to the socket. Every way out of the loop ends in exactly
//! one `Session::close`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{MessageType, SyncMessage};
use crate::session::{BroadcastOrdering, CloseReason, Disposition, Session, SyncHub};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Whether fan-out is serialized with store mutations
    pub ordering: BroadcastOrdering,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9734".to_string(),
            ordering: BroadcastOrdering::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub rejected_updates: u64,
    pub total_bytes: u64,
}

/// Run `block` and log how long it took at debug level.
fn timed<R>(name: &str, block: impl FnOnce() -> R) -> R {
    let start = Instant::now();
    let result = block();
    log::debug!("{name} took {:?}", start.elapsed());
    result
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    hub: SyncHub,
    stats: Arc<RwLock<ServerStats>>,
    listener: Option<TcpListener>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let hub = SyncHub::new(config.ordering);
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            listener: None,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the listener ahead of `run`, returning the actual address.
    pub async fn bind(&mut self) -> Result<SocketAddr, BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Address of the bound listener, if `bind` has been called.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Serve until the listener fails.
    pub async fn run(&mut self) -> Result<(), BoxError> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Serve until `shutdown` resolves. Open connections keep running on
    /// their own tasks; only accepting stops.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), BoxError>
    where
        F: Future<Output = ()>,
    {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => TcpListener::bind(&self.config.bind_addr).await?,
        };
        log::info!(
            "Server started, listening on {} ({} broadcast ordering)",
            listener.local_addr()?,
            self.config.ordering
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutting down sync server");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let hub = self.hub.clone();
                    let stats = self.stats.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, hub, stats).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: SyncHub,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (mut session, mut outbox) = match hub.open().await {
            Ok(opened) => opened,
            Err(e) => {
                stats.write().await.active_connections -= 1;
                return Err(e.into());
            }
        };

        let reason = loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            let reply = Self::process_frame(&mut session, &bytes, &stats).await;
                            match reply {
                                FrameOutcome::Continue => {}
                                FrameOutcome::Reply(frame) => {
                                    if let Err(e) = ws_sender.send(Message::Binary(frame.into())).await {
                                        break CloseReason::Error(e.to_string());
                                    }
                                }
                                FrameOutcome::Disconnect => break CloseReason::Voluntary,
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Received completion from {}", session.id());
                            break CloseReason::Completed;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break CloseReason::Error(e.to_string());
                            }
                        }

                        Some(Err(e)) => {
                            log::info!("Received error from {}: {e}", session.id());
                            break CloseReason::Error(e.to_string());
                        }

                        _ => {}
                    }
                }

                // Outgoing snapshot or broadcast frame
                frame = outbox.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = ws_sender.send(Message::Binary(frame.to_vec().into())).await {
                                break CloseReason::Error(e.to_string());
                            }
                        }
                        // Registry dropped our channel
                        None => break CloseReason::Completed,
                    }
                }
            }
        };

        session.close(reason).await;
        // Complete the client's inbound stream; the peer may already be gone.
        let _ = ws_sender.send(Message::Close(None)).await;

        stats.write().await.active_connections -= 1;
        Ok(())
    }

    /// Decode and dispatch one binary frame.
    async fn process_frame(
        session: &mut Session,
        bytes: &[u8],
        stats: &RwLock<ServerStats>,
    ) -> FrameOutcome {
        let sync_msg = match SyncMessage::decode(bytes) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Failed to decode message from {}: {e}", session.id());
                return FrameOutcome::Continue;
            }
        };

        match sync_msg.msg_type {
            MessageType::Update => {
                let update = match sync_msg.to_update() {
                    Ok(u) => u,
                    Err(e) => {
                        log::warn!("Failed to decode update from {}: {e}", session.id());
                        return FrameOutcome::Continue;
                    }
                };
                match session.handle(&update).await {
                    Ok(Disposition::Continue) => FrameOutcome::Continue,
                    Ok(Disposition::Disconnect) => FrameOutcome::Disconnect,
                    Err(e) => {
                        stats.write().await.rejected_updates += 1;
                        log::warn!("Processing failed for {}: {e}", session.id());
                        FrameOutcome::Continue
                    }
                }
            }
            MessageType::Ping => match timed("Responding to ping", || SyncMessage::pong().encode()) {
                Ok(frame) => FrameOutcome::Reply(frame),
                Err(e) => {
                    log::error!("Failed to encode pong: {e}");
                    FrameOutcome::Continue
                }
            },
            MessageType::Pong => {
                log::debug!("Unexpected pong from {}", session.id());
                FrameOutcome::Continue
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Shared session state (store and registry).
    pub fn hub(&self) -> &SyncHub {
        &self.hub
    }
}

/// Result of processing one inbound frame.
enum FrameOutcome {
    Continue,
    Reply(Vec<u8>),
    Disconnect,
}

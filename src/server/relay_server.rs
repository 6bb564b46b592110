//! Chat relay server: accept loop, configuration, and shutdown
//!
//! Binds the stream listener and the discovery listener to the same port
//! value, assigns monotonically increasing connection ids, and spawns one
//! session per accepted connection. Shutdown stops the accept loop and
//! hands every live session an explicit close signal; a session blocked
//! in a read is unblocked by its own socket being shut down.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::error::{RelayError, Result};
use crate::protocol::messages::NodeAddr;
use crate::server::discovery::DiscoveryListener;
use crate::server::session::Session;
use crate::server::state::ChatState;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port shared by the chat listener and the discovery listener
    pub port: u16,
    /// Address to bind the chat listener to; None resolves the host's
    /// local address
    pub bind_ip: Option<IpAddr>,
    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9000,
            bind_ip: None,
            max_connections: 64,
        }
    }
}

/// Handle for stopping a running server from another task
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown_tx: broadcast::Sender<()>,
    state: Arc<ChatState>,
}

impl ShutdownHandle {
    /// Stop accepting and close every live session
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.state.close_all().await;
    }
}

/// The chat relay server
pub struct RelayServer {
    config: ServerConfig,
    state: Arc<ChatState>,
    listener: TcpListener,
    discovery: DiscoveryListener,
    shutdown_tx: broadcast::Sender<()>,
    local_addr: SocketAddr,
}

impl RelayServer {
    /// Bind both listeners; a bind failure here is fatal to startup
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let ip = config
            .bind_ip
            .or_else(crate::local_ip)
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let listener = TcpListener::bind(SocketAddr::new(ip, config.port))
            .await
            .map_err(|e| {
                RelayError::network(format!("failed to bind chat listener on {ip}:{}: {e}", config.port))
            })?;
        let local_addr = listener.local_addr()?;

        // Same port value, different socket type; broadcast reception lets
        // probes reach us without prior knowledge of our address
        let udp = UdpSocket::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_addr.port(),
        ))
        .await
        .map_err(|e| {
            RelayError::network(format!(
                "failed to bind discovery listener on port {}: {e}",
                local_addr.port()
            ))
        })?;
        udp.set_broadcast(true)?;

        let advertise = NodeAddr::from_socket_addr(local_addr);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            state: Arc::new(ChatState::new()),
            listener,
            discovery: DiscoveryListener::new(udp, advertise),
            shutdown_tx,
            local_addr,
        })
    }

    /// Address the chat listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The shared chat state
    pub fn state(&self) -> Arc<ChatState> {
        Arc::clone(&self.state)
    }

    /// Handle for stopping the server once `run` owns it
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown_tx: self.shutdown_tx.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Accept connections until shutdown
    pub async fn run(self) -> Result<()> {
        info!("chat relay listening on {}", self.local_addr);

        tokio::spawn(self.discovery.run(self.shutdown_tx.subscribe()));

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            if self.state.connection_count().await >= self.config.max_connections {
                                // Dropping the socket closes it
                                warn!(%peer, "connection limit reached, rejecting");
                                continue;
                            }

                            let (tx, rx) = mpsc::unbounded_channel();
                            let id = self.state.add_connection(tx).await;
                            info!(id, %peer, "connection established");

                            let session = Session::new(id, peer, Arc::clone(&self.state));
                            tokio::spawn(session.run(socket, rx, self.shutdown_tx.subscribe()));
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, no longer accepting");
                    break;
                }
            }
        }

        Ok(())
    }
}

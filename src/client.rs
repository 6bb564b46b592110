//! Chat relay client service
//!
//! The non-graphical half of a chat client: locate a server with a
//! broadcast probe, connect over TCP, register a display name, send
//! direct or broadcast messages, and receive the server's full-state
//! pushes as a typed event stream. A UI subscribes to the event receiver
//! and re-renders from each sync.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::protocol::codec::{self, Encodable, Inbound};
use crate::protocol::frame::{Frame, FrameCodec};
use crate::protocol::messages::{ConnId, FileId, NodeAddr, Package, RosterSync, StoreSync};

/// Relay client configuration
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Server address to connect to; None means discover one first
    pub server_addr: Option<SocketAddr>,
    /// Port probed during discovery (the server's configured port)
    pub discovery_port: u16,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// How long to wait for a discovery reply, in seconds
    pub discovery_timeout_secs: u64,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            server_addr: None,
            discovery_port: 9000,
            connect_timeout_secs: 10,
            discovery_timeout_secs: 5,
        }
    }
}

/// Events that the client can receive
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Successfully connected to the server
    Connected,
    /// Disconnected from the server
    Disconnected(String),
    /// Received the full conversation store
    StoreSynced(StoreSync),
    /// Received the roster (and our own connection id)
    RosterSynced(RosterSync),
}

/// Chat relay client
pub struct RelayClient {
    config: RelayClientConfig,
    server_addr: Option<SocketAddr>,
    writer: Option<OwnedWriteHalf>,
    event_tx: Option<mpsc::UnboundedSender<ClientEvent>>,
}

impl RelayClient {
    /// Create a new client with the given configuration
    pub fn new(config: RelayClientConfig) -> Self {
        let server_addr = config.server_addr;
        Self {
            config,
            server_addr,
            writer: None,
            event_tx: None,
        }
    }

    /// Locate a server on the local segment with a broadcast probe
    pub async fn discover(&mut self) -> Result<SocketAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        let local = socket.local_addr()?;

        // The probe tells the server where to send its unicast reply
        let reply_to = NodeAddr::new(
            crate::local_ip()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| Ipv4Addr::LOCALHOST.to_string()),
            local.port(),
        );
        let probe = codec::encode_probe(&reply_to)?;

        let target = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::BROADCAST),
            self.config.discovery_port,
        );
        socket.send_to(&probe, target).await?;
        debug!(%target, "discovery probe sent");

        let mut buf = vec![0u8; 1024];
        let (len, _) = timeout(
            Duration::from_secs(self.config.discovery_timeout_secs),
            socket.recv_from(&mut buf),
        )
        .await
        .map_err(|_| RelayError::timeout("no discovery reply"))??;

        let frame = Frame::decode_complete(&buf[..len])?;
        let server = match Inbound::decode(&frame)? {
            Inbound::Reply(addr) => addr,
            other => {
                return Err(RelayError::protocol(format!(
                    "expected a discovery reply, got {:?}",
                    other.frame_type()
                )));
            }
        };

        let addr = server.to_socket_addr()?;
        info!(%addr, "discovered chat server");
        self.server_addr = Some(addr);
        Ok(addr)
    }

    /// Connect to the server and start receiving state pushes
    pub async fn connect(&mut self) -> Result<mpsc::UnboundedReceiver<ClientEvent>> {
        let addr = self
            .server_addr
            .ok_or_else(|| RelayError::config("no server address: set one or discover first"))?;

        let socket = timeout(
            Duration::from_secs(self.config.connect_timeout_secs),
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| RelayError::timeout("connection timeout"))?
        .map_err(|e| RelayError::connection(format!("failed to connect to {addr}: {e}")))?;

        info!(%addr, "connected to chat server");

        let (read_half, write_half) = socket.into_split();
        self.writer = Some(write_half);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.event_tx = Some(event_tx.clone());
        let _ = event_tx.send(ClientEvent::Connected);

        tokio::spawn(read_loop(read_half, event_tx));

        Ok(event_rx)
    }

    /// Register or change the display name
    pub async fn register(&mut self, name: &str) -> Result<()> {
        self.send_package(&Package::registration(name)).await
    }

    /// Register a name and send a broadcast message in one wire unit
    pub async fn send_registration_message(&mut self, name: &str, message: &str) -> Result<()> {
        let package = Package {
            is_for_all: true,
            message: message.to_string(),
            ..Package::registration(name)
        };
        self.send_package(&package).await
    }

    /// Send a message to the global conversation
    pub async fn send_broadcast(&mut self, message: &str, files: Vec<FileId>) -> Result<()> {
        self.send_package(&Package::broadcast(message, files)).await
    }

    /// Send a direct message to one connection
    pub async fn send_direct(
        &mut self,
        receiver_id: ConnId,
        message: &str,
        files: Vec<FileId>,
    ) -> Result<()> {
        self.send_package(&Package::direct(receiver_id, message, files))
            .await
    }

    /// Check if connected to a server
    pub fn is_connected(&self) -> bool {
        self.writer.is_some()
    }

    /// Disconnect from the server
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
            info!("disconnected from chat server");
        }
        self.event_tx = None;
        Ok(())
    }

    async fn send_package(&mut self, package: &Package) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| RelayError::connection("not connected"))?;

        let bytes = package
            .encode_frame()
            .map_err(|e| RelayError::serialization(e.to_string()))?
            .encode_to_bytes();
        writer.write_all(&bytes).await?;
        Ok(())
    }
}

/// Decode server pushes into client events until the connection ends
async fn read_loop(mut read_half: OwnedReadHalf, event_tx: mpsc::UnboundedSender<ClientEvent>) {
    let mut codec = FrameCodec::new();
    let mut buf = bytes::BytesMut::with_capacity(8192);

    loop {
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = event_tx.send(ClientEvent::Disconnected("server closed".to_string()));
                return;
            }
            Ok(_) => {
                codec.feed(&buf);
                buf.clear();

                loop {
                    match codec.decode_next() {
                        Ok(Some(frame)) => match Inbound::decode(&frame) {
                            Ok(Inbound::StoreSync(store)) => {
                                let _ = event_tx.send(ClientEvent::StoreSynced(store));
                            }
                            Ok(Inbound::RosterSync(roster)) => {
                                let _ = event_tx.send(ClientEvent::RosterSynced(roster));
                            }
                            Ok(other) => {
                                warn!("unexpected {:?} push from server", other.frame_type());
                            }
                            Err(e) => {
                                warn!("undecodable push from server: {e}");
                                let _ = event_tx.send(ClientEvent::Disconnected(format!(
                                    "protocol error: {e}"
                                )));
                                return;
                            }
                        },
                        Ok(None) => break,
                        Err(e) => {
                            warn!("undecodable frame from server: {e}");
                            let _ = event_tx
                                .send(ClientEvent::Disconnected(format!("protocol error: {e}")));
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                let _ = event_tx.send(ClientEvent::Disconnected(format!("read failed: {e}")));
                return;
            }
        }
    }
}

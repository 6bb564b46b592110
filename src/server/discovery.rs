//! Broadcast discovery listener
//!
//! Answers "where are you" probes so a client with no prior knowledge of
//! the server's address can locate it on the local network segment. The
//! listener shares the chat listener's port value on a datagram socket
//! with broadcast reception enabled, keeps no state between probes, and
//! never touches the conversation store.
//!
//! A probe is one discovery frame carrying the requester's address; the
//! reply goes unicast to the address in the payload and carries the
//! server's advertised address. Replaying a probe yields the same reply.

use bytes::Bytes;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::protocol::codec::{self, Inbound};
use crate::protocol::frame::Frame;
use crate::protocol::messages::NodeAddr;

/// Independent datagram listener answering discovery probes
pub struct DiscoveryListener {
    socket: UdpSocket,
    advertise: NodeAddr,
}

impl DiscoveryListener {
    pub fn new(socket: UdpSocket, advertise: NodeAddr) -> Self {
        Self { socket, advertise }
    }

    /// Address the datagram socket is bound to
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve probes until the shutdown signal fires
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        // The reply never changes; encode it once
        let reply = match codec::encode_reply(&self.advertise) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to encode discovery reply: {e}");
                return;
            }
        };

        info!(
            ip = %self.advertise.ip,
            port = self.advertise.port,
            "discovery listener started"
        );

        let mut buf = vec![0u8; 1024];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, src)) => self.answer_probe(&buf[..len], src, &reply).await,
                        Err(e) => warn!("discovery receive failed: {e}"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("discovery listener stopped");
                    return;
                }
            }
        }
    }

    /// Handle one datagram; per-packet failures are logged and skipped
    async fn answer_probe(&self, datagram: &[u8], src: SocketAddr, reply: &Bytes) {
        let frame = match Frame::decode_complete(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%src, "ignoring malformed datagram: {e}");
                return;
            }
        };

        let requester = match Inbound::decode(&frame) {
            Ok(Inbound::Probe(addr)) => addr,
            Ok(other) => {
                debug!(%src, "ignoring {:?} datagram", other.frame_type());
                return;
            }
            Err(e) => {
                debug!(%src, "ignoring undecodable probe: {e}");
                return;
            }
        };

        // The reply goes to the address carried in the probe payload
        let target = match requester.to_socket_addr() {
            Ok(target) => target,
            Err(e) => {
                warn!(%src, "probe carries an unusable requester address: {e}");
                return;
            }
        };

        match self.socket.send_to(reply, target).await {
            Ok(_) => debug!(%target, "answered discovery probe"),
            Err(e) => warn!(%target, "discovery reply failed: {e}"),
        }
    }
}

//! LAN chat relay with broadcast server discovery
//!
//! A small multi-client chat system: clients locate the server with a
//! broadcast probe on a datagram socket, connect over TCP, register a
//! display name, and exchange direct or broadcast messages carrying
//! attachment references. After every change the server pushes its full
//! conversation store and roster to all connected clients, so each
//! client's view converges to the authoritative state.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::{ClientEvent, RelayClient, RelayClientConfig};
pub use error::{RelayError, Result};
pub use server::{RelayServer, ServerConfig};

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp in milliseconds since UNIX epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Best-effort resolution of the host's LAN-facing address
///
/// Connecting a UDP socket sends nothing; it only asks the OS which local
/// address would be used to reach the target.
pub fn local_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

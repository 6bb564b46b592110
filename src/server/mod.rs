//! Chat relay server implementation
//!
//! This module provides:
//! - The accept loop and server configuration
//! - Per-connection session handling
//! - The coordinating owner of all shared chat state
//! - The broadcast discovery listener

pub mod discovery;
pub mod relay_server;
pub mod session;
pub mod state;

pub use discovery::DiscoveryListener;
pub use relay_server::{RelayServer, ServerConfig, ShutdownHandle};
pub use session::{Session, SessionCommand};
pub use state::{ChatState, RouteOutcome};

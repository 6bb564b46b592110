//! Per-connection session handling
//!
//! Each accepted connection gets two tasks: a read loop that decodes
//! incoming packages and drives the shared state, and a writer that owns
//! the socket's write half and drains the session's outbound queue. The
//! writer is what makes fan-out non-blocking for the rest of the server.
//!
//! Session lifecycle: Active -> (read failure | protocol error | stop
//! signal | write failure) -> teardown. Teardown is idempotent, so the
//! read and write sides may both report the end of the session safely.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::protocol::codec::Inbound;
use crate::protocol::frame::{Frame, FrameCodec};
use crate::protocol::messages::ConnId;
use crate::server::state::ChatState;

/// Commands delivered to a session's writer task
#[derive(Debug)]
pub enum SessionCommand {
    /// Write these pre-encoded frame bytes to the client
    Deliver(Bytes),
    /// Close the connection (server shutdown)
    Close,
}

/// One connection's session
pub struct Session {
    id: ConnId,
    peer: SocketAddr,
    state: Arc<ChatState>,
}

impl Session {
    pub fn new(id: ConnId, peer: SocketAddr, state: Arc<ChatState>) -> Self {
        Self { id, peer, state }
    }

    /// Run the session to completion and tear the connection down
    pub async fn run(
        self,
        socket: TcpStream,
        outbound: mpsc::UnboundedReceiver<SessionCommand>,
        shutdown: broadcast::Receiver<()>,
    ) {
        let (read_half, write_half) = socket.into_split();

        let (write_done_tx, write_done_rx) = oneshot::channel();
        let writer = tokio::spawn(write_loop(
            self.id,
            self.peer,
            write_half,
            outbound,
            write_done_tx,
        ));

        let reason = tokio::select! {
            reason = self.read_loop(read_half, shutdown) => reason,
            reason = write_done_rx => reason.unwrap_or("write side closed"),
        };

        info!(id = self.id, peer = %self.peer, reason, "session closed");

        // One logical teardown: registry, directory, and conversations go
        // together. Dropping the registry entry closes the outbound queue,
        // which lets the writer drain and shut the socket down.
        self.state.teardown(self.id).await;
        let _ = writer.await;
    }

    async fn read_loop(
        &self,
        mut read_half: OwnedReadHalf,
        mut shutdown: broadcast::Receiver<()>,
    ) -> &'static str {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::with_capacity(4096);

        loop {
            tokio::select! {
                read = read_half.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => return "peer closed",
                        Ok(_) => {
                            codec.feed(&buf);
                            buf.clear();

                            // Drain every frame buffered by this read burst
                            // before reading again
                            loop {
                                match codec.decode_next() {
                                    Ok(Some(frame)) => {
                                        if let Err(e) = self.handle_frame(&frame).await {
                                            warn!(id = self.id, peer = %self.peer, "protocol error: {e}");
                                            return "protocol error";
                                        }
                                    }
                                    Ok(None) => break,
                                    Err(e) => {
                                        warn!(id = self.id, peer = %self.peer, "undecodable frame: {e}");
                                        return "protocol error";
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!(id = self.id, peer = %self.peer, "read failed: {e}");
                            return "read failed";
                        }
                    }
                }
                _ = shutdown.recv() => return "server shutdown",
            }
        }
    }

    async fn handle_frame(&self, frame: &Frame) -> io::Result<()> {
        match Inbound::decode(frame)? {
            Inbound::Package(package) => {
                if package.has_registration() {
                    match package.sender_name.as_deref() {
                        Some(name) => self.state.register(self.id, name).await,
                        None => {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "registration package without a name",
                            ));
                        }
                    }
                }

                if package.has_body() {
                    let outcome = self.state.route(&package, self.id).await;
                    debug!(id = self.id, ?outcome, "routed package");
                }

                Ok(())
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "unexpected {:?} frame on the chat channel",
                    other.frame_type()
                ),
            )),
        }
    }
}

/// Drain the outbound queue into the socket until the queue closes, a
/// close command arrives, or a write fails
async fn write_loop(
    id: ConnId,
    peer: SocketAddr,
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<SessionCommand>,
    done: oneshot::Sender<&'static str>,
) {
    let mut reason = "outbound queue closed";

    while let Some(cmd) = outbound.recv().await {
        match cmd {
            SessionCommand::Deliver(bytes) => {
                if let Err(e) = write_half.write_all(&bytes).await {
                    warn!(id, %peer, "push failed, treating client as gone: {e}");
                    reason = "write failed";
                    break;
                }
            }
            SessionCommand::Close => {
                reason = "close requested";
                break;
            }
        }
    }

    let _ = write_half.shutdown().await;
    let _ = done.send(reason);
}

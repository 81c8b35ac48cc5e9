//! Connection handler strategies.
//!
//! The server is parameterised by a [`ConnectionHandler`]. In blocking mode
//! each accepted connection is handed to [`ConnectionHandler::handle`] on its
//! own worker thread. In non-blocking mode the event loop owns the handle and
//! calls [`ConnectionHandler::on_data`] for every chunk it reads.

use crate::connection::ConnectionHandle;
use bytes::{Bytes, BytesMut};
use tracing::debug;

/// Read size used by handlers that drive their own blocking reads.
pub const READ_CHUNK: usize = 16 * 1024;

/// What the event loop should do with a connection after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Keep the connection registered for more input.
    Continue,
    /// Close the connection once queued output has drained.
    Close,
}

/// Logic run against accepted connections.
///
/// Both methods default to closing the connection immediately.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Consume one connection to completion (blocking mode).
    ///
    /// The handle is closed when it is dropped at the end of this call.
    fn handle(&self, conn: ConnectionHandle) {
        drop(conn);
    }

    /// Handle one chunk of input (non-blocking mode).
    ///
    /// Must not block: `conn.send` queues whatever the socket cannot take.
    fn on_data(&self, _conn: &mut ConnectionHandle, _data: &[u8]) -> Dispatch {
        Dispatch::Close
    }
}

/// Accepts and immediately closes every connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct CloseHandler;

impl ConnectionHandler for CloseHandler {}

/// Replies to each chunk with `prefix` followed by the chunk.
///
/// With an empty prefix this is a plain echo.
#[derive(Debug, Clone, Default)]
pub struct EchoHandler {
    prefix: Bytes,
}

impl EchoHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<Bytes>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn reply(&self, data: &[u8]) -> BytesMut {
        let mut out = BytesMut::with_capacity(self.prefix.len() + data.len());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(data);
        out
    }
}

impl ConnectionHandler for EchoHandler {
    fn handle(&self, mut conn: ConnectionHandle) {
        let peer = conn.peer_addr();
        loop {
            let data = match conn.receive(READ_CHUNK) {
                Ok(data) if data.is_empty() => break,
                Ok(data) => data,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "Echo read failed");
                    break;
                }
            };
            if let Err(e) = conn.send(&self.reply(&data)) {
                debug!(peer = %peer, error = %e, "Echo write failed");
                break;
            }
        }
    }

    fn on_data(&self, conn: &mut ConnectionHandle, data: &[u8]) -> Dispatch {
        match conn.send(&self.reply(data)) {
            Ok(_) => Dispatch::Continue,
            Err(e) => {
                debug!(peer = %conn.peer_addr(), error = %e, "Echo write failed");
                Dispatch::Close
            }
        }
    }
}

/// Adapts a closure into a blocking-mode handler.
///
/// In non-blocking mode connections served by a closure are closed on first
/// input.
pub struct FnHandler<F>(pub F);

impl<F> ConnectionHandler for FnHandler<F>
where
    F: Fn(ConnectionHandle) + Send + Sync + 'static,
{
    fn handle(&self, conn: ConnectionHandle) {
        (self.0)(conn)
    }
}

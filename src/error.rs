//! Error taxonomy for listener, connection and client operations.
//!
//! Every fallible operation returns a [`NetError`]. Callers that only care
//! about the coarse outcome can collapse it into an [`ErrorCode`].

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced by the server, client and connection handles.
#[derive(Debug, Error)]
pub enum NetError {
    /// Listening setup failed (socket create, bind or listen).
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// A single accept call failed while the server was running.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    /// The client address is not a valid IPv4/IPv6 literal.
    #[error("invalid or unsupported address '{0}'")]
    Address(String),
    /// The peer refused the connection or is unreachable.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// A configured connect deadline elapsed.
    #[error("connect to {0} timed out")]
    Timeout(SocketAddr),
    /// The peer closed the connection mid-transfer.
    #[error("connection reset by peer")]
    ConnectionReset,
    /// Operation attempted on a handle that was already closed.
    #[error("connection handle is closed")]
    Closed,
    /// Client send/receive attempted before a successful connect.
    #[error("client is not connected")]
    NotConnected,
    /// Client connect attempted while a connection is open.
    #[error("client is already connected")]
    AlreadyConnected,
    /// Lifecycle method called from a state that does not allow it.
    #[error("operation '{op}' not valid in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: crate::server::ServerState,
    },
    /// Any other socket failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl NetError {
    /// Collapse into the three-valued status code.
    pub fn code(&self) -> ErrorCode {
        match self {
            NetError::Address(_)
            | NetError::InvalidState { .. }
            | NetError::NotConnected
            | NetError::AlreadyConnected
            | NetError::Closed => ErrorCode::Invalid,
            _ => ErrorCode::Error,
        }
    }

    /// Classify an I/O error raised while transferring bytes.
    pub(crate) fn from_transfer(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::WriteZero
            | io::ErrorKind::UnexpectedEof => NetError::ConnectionReset,
            _ => NetError::Io(e),
        }
    }
}

/// Coarse status returned across `init`, `connect` and related operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success,
    Error,
    Invalid,
}

impl ErrorCode {
    /// Status of an operation result.
    pub fn of<T>(result: &Result<T, NetError>) -> Self {
        match result {
            Ok(_) => ErrorCode::Success,
            Err(e) => e.code(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Success => "Success",
            ErrorCode::Error => "Error",
            ErrorCode::Invalid => "Invalid",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

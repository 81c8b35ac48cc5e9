//! tcpcore: TCP connection handling
//!
//! - [`Server`]: binds a port and dispatches every accepted connection to a
//!   [`ConnectionHandler`], either on a worker thread per connection or from
//!   a single readiness-polled event loop
//! - [`Client`]: one outbound connection with byte-level send/receive
//! - [`ConnectionHandle`]: an owned socket with full-write `send` and
//!   short-read `receive`
//!
//! Payloads are opaque bytes; no framing is imposed.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod server;

pub use client::Client;
pub use config::{ClientConfig, Mode, ServerConfig};
pub use connection::ConnectionHandle;
pub use error::{ErrorCode, NetError};
pub use handler::{CloseHandler, ConnectionHandler, Dispatch, EchoHandler, FnHandler};
pub use server::{Server, ServerState, ServerThread};

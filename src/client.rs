//! TCP client holding a single outbound connection.

use crate::config::ClientConfig;
use crate::connection::ConnectionHandle;
use crate::error::NetError;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{error, info};

/// Client for one server address.
///
/// Construction does no I/O; the socket is created by [`connect`](Self::connect).
#[derive(Debug)]
pub struct Client {
    address: String,
    port: u16,
    connect_timeout: Option<Duration>,
    conn: Option<ConnectionHandle>,
}

impl Client {
    /// `address` must be an IPv4 or IPv6 literal.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            connect_timeout: None,
            conn: None,
        }
    }

    pub fn from_config(address: impl Into<String>, port: u16, config: &ClientConfig) -> Self {
        Self::new(address, port).with_connect_timeout(config.connect_timeout)
    }

    /// Bound the connect call; `None` leaves it to the OS.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn is_connected(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.is_open())
    }

    /// Create the socket, resolve the address and connect.
    pub fn connect(&mut self) -> Result<(), NetError> {
        if self.is_connected() {
            return Err(NetError::AlreadyConnected);
        }

        let ip: IpAddr = self.address.parse().map_err(|_| {
            error!(address = %self.address, "Invalid address or address not supported");
            NetError::Address(self.address.clone())
        })?;
        let addr = SocketAddr::new(ip, self.port);

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| {
                error!(error = %e, "Socket creation failed");
                NetError::Io(e)
            })?;

        let connected = match self.connect_timeout {
            Some(timeout) => socket.connect_timeout(&addr.into(), timeout),
            None => socket.connect(&addr.into()),
        };
        if let Err(source) = connected {
            error!(addr = %addr, error = %source, "Connection failed");
            return Err(match source.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => NetError::Timeout(addr),
                _ => NetError::Connect { addr, source },
            });
        }

        self.conn = Some(ConnectionHandle::new(socket.into(), addr));
        info!(addr = %addr, "Connected to server");
        Ok(())
    }

    /// Close the connection. Safe to call when not connected.
    pub fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
            info!(addr = %conn.peer_addr(), "Disconnect server");
        }
    }

    pub fn send(&mut self, data: &[u8]) -> Result<usize, NetError> {
        self.connection()?.send(data)
    }

    /// One read of at most `max` bytes; empty means the server closed.
    pub fn receive(&mut self, max: usize) -> Result<Bytes, NetError> {
        self.connection()?.receive(max)
    }

    pub fn receive_exact(&mut self, len: usize) -> Result<Bytes, NetError> {
        self.connection()?.receive_exact(len)
    }

    fn connection(&mut self) -> Result<&mut ConnectionHandle, NetError> {
        self.conn.as_mut().ok_or(NetError::NotConnected)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn test_invalid_address() {
        let mut client = Client::new("not.an.ip", 80);
        let result = client.connect();
        assert!(matches!(result, Err(NetError::Address(_))));
        assert_eq!(ErrorCode::of(&result), ErrorCode::Invalid);
        assert!(!client.is_connected());
    }

    #[test]
    fn test_hostname_is_not_resolved() {
        let mut client = Client::new("localhost", 80);
        assert!(matches!(client.connect(), Err(NetError::Address(_))));
    }

    #[test]
    fn test_not_connected() {
        let mut client = Client::new("127.0.0.1", 80);
        assert!(matches!(client.send(b"x"), Err(NetError::NotConnected)));
        assert!(matches!(client.receive(8), Err(NetError::NotConnected)));
        client.disconnect();
    }

    #[test]
    fn test_connect_refused() {
        // Grab a free port, then release it so nothing listens there.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut client = Client::new("127.0.0.1", port);
        let result = client.connect();
        assert!(matches!(result, Err(NetError::Connect { .. })));
        assert_eq!(ErrorCode::of(&result), ErrorCode::Error);
    }

    #[test]
    fn test_connect_twice_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut client = Client::new("127.0.0.1", port);
        client.connect().unwrap();
        assert!(matches!(client.connect(), Err(NetError::AlreadyConnected)));

        client.disconnect();
        client.disconnect();
        assert!(!client.is_connected());

        // Reconnect after disconnect is allowed.
        client.connect().unwrap();
    }

    #[test]
    fn test_send_receive_with_timeout_config() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = ClientConfig {
            connect_timeout: Some(Duration::from_secs(2)),
        };
        let mut client = Client::from_config("127.0.0.1", port, &config);
        client.connect().unwrap();

        let (mut peer, _) = listener.accept().unwrap();
        assert_eq!(client.send(b"Hello").unwrap(), 5);

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        peer.write_all(b"World!").unwrap();

        assert_eq!(&client.receive_exact(6).unwrap()[..], b"World!");
    }

    #[test]
    fn test_ipv6_literal() {
        let Ok(listener) = TcpListener::bind("[::1]:0") else {
            // Host without IPv6 loopback.
            return;
        };
        let port = listener.local_addr().unwrap().port();

        let mut client = Client::new("::1", port);
        client.connect().unwrap();
        assert!(client.is_connected());
    }
}

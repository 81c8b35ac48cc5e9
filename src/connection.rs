//! Connection handle for one established TCP stream.
//!
//! A handle owns its socket exclusively. It is either open or closed; once
//! closed every operation fails with [`NetError::Closed`] and closing again
//! is a no-op.
//!
//! Handles created by the readiness-polled server run in non-blocking mode:
//! output the socket cannot take right away is queued and flushed by the
//! event loop when the socket turns writable.

use crate::error::NetError;
use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::{debug, trace};

/// Upper bound on the buffer behind a single read.
const MAX_READ_CHUNK: usize = 64 * 1024;

/// A single open (or closed) TCP connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// `None` once the handle has been closed.
    stream: Option<TcpStream>,
    peer: SocketAddr,
    /// Stream is non-blocking and driven by the event loop.
    polled: bool,
    /// Bytes accepted by `send` but not yet written (polled mode only).
    pending: BytesMut,
}

impl ConnectionHandle {
    /// Wrap a blocking stream.
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream: Some(stream),
            peer,
            polled: false,
            pending: BytesMut::new(),
        }
    }

    /// Wrap a stream that has already been switched to non-blocking mode.
    pub(crate) fn polled(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream: Some(stream),
            peer,
            polled: true,
            pending: BytesMut::new(),
        }
    }

    /// Address of the remote end.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Write all of `data`, returning the number of bytes accepted.
    ///
    /// Short writes are retried until everything is written. On a polled
    /// handle, whatever the socket cannot take without blocking is queued.
    pub fn send(&mut self, data: &[u8]) -> Result<usize, NetError> {
        if self.polled {
            return self.send_polled(data);
        }

        let stream = self.stream.as_mut().ok_or(NetError::Closed)?;
        let mut written = 0;
        while written < data.len() {
            match stream.write(&data[written..]) {
                Ok(0) => return Err(NetError::ConnectionReset),
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(NetError::from_transfer(e)),
            }
        }

        trace!(peer = %self.peer, bytes = written, "Sent");
        Ok(written)
    }

    fn send_polled(&mut self, data: &[u8]) -> Result<usize, NetError> {
        let stream = self.stream.as_mut().ok_or(NetError::Closed)?;

        // Anything already queued must go out first to keep stream order.
        let mut written = 0;
        if self.pending.is_empty() {
            while written < data.len() {
                match stream.write(&data[written..]) {
                    Ok(0) => return Err(NetError::ConnectionReset),
                    Ok(n) => written += n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(NetError::from_transfer(e)),
                }
            }
        }

        if written < data.len() {
            self.pending.extend_from_slice(&data[written..]);
            trace!(peer = %self.peer, queued = self.pending.len(), "Output queued");
        }
        Ok(data.len())
    }

    /// Whether queued output is waiting for the socket to become writable.
    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Write as much queued output as the socket accepts.
    ///
    /// Returns `true` once the queue is empty.
    pub(crate) fn flush_pending(&mut self) -> Result<bool, NetError> {
        let stream = self.stream.as_mut().ok_or(NetError::Closed)?;
        while !self.pending.is_empty() {
            match stream.write(&self.pending) {
                Ok(0) => return Err(NetError::ConnectionReset),
                Ok(n) => self.pending.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(NetError::from_transfer(e)),
            }
        }
        Ok(true)
    }

    /// Perform one read of at most `max` bytes.
    ///
    /// The result may be shorter than `max`, and never exceeds 64 KiB. An
    /// empty result means the peer closed its side cleanly.
    pub fn receive(&mut self, max: usize) -> Result<Bytes, NetError> {
        self.try_receive(max)?
            .ok_or_else(|| NetError::Io(io::Error::from(io::ErrorKind::WouldBlock)))
    }

    /// Like [`receive`](Self::receive), but `Ok(None)` when a polled socket
    /// has nothing to read.
    pub(crate) fn try_receive(&mut self, max: usize) -> Result<Option<Bytes>, NetError> {
        let stream = self.stream.as_mut().ok_or(NetError::Closed)?;
        if max == 0 {
            return Ok(Some(Bytes::new()));
        }

        let mut buf = BytesMut::zeroed(max.min(MAX_READ_CHUNK));
        loop {
            match stream.read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    if n == 0 {
                        debug!(peer = %self.peer, "Peer closed connection");
                    }
                    return Ok(Some(buf.freeze()));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(NetError::from_transfer(e)),
            }
        }
    }

    /// Read until exactly `len` bytes have arrived.
    ///
    /// Fails with [`NetError::ConnectionReset`] if the peer closes first.
    pub fn receive_exact(&mut self, len: usize) -> Result<Bytes, NetError> {
        let mut out = BytesMut::with_capacity(len);
        while out.len() < len {
            let chunk = self.receive(len - out.len())?;
            if chunk.is_empty() {
                return Err(NetError::ConnectionReset);
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Release the socket. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            self.pending.clear();
            debug!(peer = %self.peer, "Connection closed");
        }
    }

    #[cfg(unix)]
    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

//! mio event loop for non-blocking mode.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking accept/read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Everything runs on the thread that called `Server::run`. Handlers are
//! invoked inline for every chunk read, so they must return promptly.

use super::{lock, Server};
use crate::connection::ConnectionHandle;
use crate::error::NetError;
use crate::handler::{ConnectionHandler, Dispatch};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use socket2::Socket;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Reads served per readiness event before moving on to other connections.
const MAX_READS_PER_EVENT: usize = 16;

/// Per-connection state owned by the event loop.
struct PolledConnection {
    handle: ConnectionHandle,
    interest: Interest,
    /// Close once queued output has drained.
    closing: bool,
}

pub(super) fn run(server: &Server, listener: &Socket) -> Result<(), NetError> {
    let mut poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    *lock(&server.waker) = Some(waker);

    let listener_fd = listener.as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&listener_fd), LISTENER_TOKEN, Interest::READABLE)?;

    let config = &server.config;
    let mut events = Events::with_capacity(config.poll_batch);
    let mut connections: Slab<PolledConnection> =
        Slab::with_capacity(config.max_connections.min(1024));

    info!(max_connections = config.max_connections, "Event loop started");

    // `stop` may have flipped the flag before the waker was published.
    let result = loop {
        if !server.is_running() {
            break Ok(());
        }

        if let Err(e) = poll.poll(&mut events, config.accept_timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            break Err(NetError::Io(e));
        }

        for event in events.iter() {
            match event.token() {
                WAKER_TOKEN => {}
                LISTENER_TOKEN => {
                    accept_connections(server, listener, poll.registry(), &mut connections);
                }
                Token(conn_id) => {
                    let registry = poll.registry();
                    match handle_connection_event(server, conn_id, event, registry, &mut connections)
                    {
                        Ok(true) => {}
                        Ok(false) => close_connection(registry, &mut connections, conn_id),
                        Err(e) => {
                            debug!(conn_id, error = %e, "Connection error");
                            close_connection(registry, &mut connections, conn_id);
                        }
                    }
                }
            }
        }
    };

    let open = connections.len();
    for mut conn in connections.drain() {
        deregister(poll.registry(), &conn.handle);
        conn.handle.close();
    }
    let _ = poll.registry().deregister(&mut SourceFd(&listener_fd));
    *lock(&server.waker) = None;

    info!(closed = open, "Event loop stopped");
    result
}

fn accept_connections(
    server: &Server,
    listener: &Socket,
    registry: &Registry,
    connections: &mut Slab<PolledConnection>,
) {
    loop {
        match listener.accept() {
            Ok((socket, addr)) => {
                let Some(peer) = addr.as_socket() else {
                    continue;
                };
                if connections.len() >= server.config.max_connections {
                    warn!(peer = %peer, "Connection limit reached");
                    continue;
                }
                if let Err(e) = socket.set_nonblocking(true) {
                    warn!(peer = %peer, error = %e, "Failed to configure connection");
                    continue;
                }

                let handle = ConnectionHandle::polled(socket.into(), peer);
                let Some(fd) = handle.raw_fd() else {
                    continue;
                };

                let entry = connections.vacant_entry();
                let conn_id = entry.key();
                if let Err(e) =
                    registry.register(&mut SourceFd(&fd), Token(conn_id), Interest::READABLE)
                {
                    warn!(peer = %peer, error = %e, "Failed to register connection");
                    continue;
                }
                entry.insert(PolledConnection {
                    handle,
                    interest: Interest::READABLE,
                    closing: false,
                });

                info!(conn_id, peer = %peer, "Client connection accepted");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if server.is_running() {
                    error!(error = %NetError::Accept(e), "Listener accept failed");
                }
                break;
            }
        }
    }
}

/// Returns `Ok(false)` when the connection should be closed.
fn handle_connection_event(
    server: &Server,
    conn_id: usize,
    event: &mio::event::Event,
    registry: &Registry,
    connections: &mut Slab<PolledConnection>,
) -> Result<bool, NetError> {
    let Some(conn) = connections.get_mut(conn_id) else {
        return Ok(true);
    };

    let mut drained = true;
    if (event.is_readable() || event.is_read_closed() || event.is_error()) && !conn.closing {
        drained = read_and_dispatch(server.handler.as_ref(), server.config.buffer_size, conn)?;
    }

    // The handler may have closed the handle itself.
    if !conn.handle.is_open() {
        return Ok(false);
    }

    if conn.handle.has_pending() {
        conn.handle.flush_pending()?;
    }

    if conn.closing && !conn.handle.has_pending() {
        return Ok(false);
    }

    let wanted = if conn.handle.has_pending() {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    };
    // Edge-triggered: unread input only raises a new event once re-armed.
    if wanted != conn.interest || !drained {
        if let Some(fd) = conn.handle.raw_fd() {
            registry.reregister(&mut SourceFd(&fd), Token(conn_id), wanted)?;
        }
        conn.interest = wanted;
    }

    Ok(true)
}

/// Read and dispatch chunks until the socket would block, the connection
/// is closing, or the per-event read budget runs out.
///
/// Returns `false` when input may still be waiting in the socket.
fn read_and_dispatch(
    handler: &dyn ConnectionHandler,
    buffer_size: usize,
    conn: &mut PolledConnection,
) -> Result<bool, NetError> {
    for _ in 0..MAX_READS_PER_EVENT {
        let data = match conn.handle.try_receive(buffer_size)? {
            None => return Ok(true),
            Some(data) => data,
        };

        if data.is_empty() {
            conn.closing = true;
            return Ok(true);
        }

        if handler.on_data(&mut conn.handle, &data) == Dispatch::Close || !conn.handle.is_open() {
            conn.closing = true;
            return Ok(true);
        }
    }
    Ok(false)
}

fn close_connection(registry: &Registry, connections: &mut Slab<PolledConnection>, conn_id: usize) {
    if let Some(mut conn) = connections.try_remove(conn_id) {
        deregister(registry, &conn.handle);
        conn.handle.close();
        debug!(conn_id, "Connection closed");
    }
}

fn deregister(registry: &Registry, handle: &ConnectionHandle) {
    if let Some(fd) = handle.raw_fd() {
        let _ = registry.deregister(&mut SourceFd(&fd));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mode, ServerConfig};
    use crate::handler::EchoHandler;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    type LoopThread = thread::JoinHandle<Result<(), NetError>>;

    fn start(handler: impl ConnectionHandler, max_connections: usize) -> (Arc<Server>, LoopThread) {
        let mut config = ServerConfig::new(0, Mode::NonBlocking, None);
        config.host = "127.0.0.1".parse().unwrap();
        config.max_connections = max_connections;
        let server = Arc::new(Server::with_config(config, handler));
        server.init().unwrap();

        let runner = Arc::clone(&server);
        let loop_thread = thread::spawn(move || runner.run());
        (server, loop_thread)
    }

    #[test]
    fn test_echo_single_threaded() {
        let (server, loop_thread) = start(EchoHandler::with_prefix("> "), 16);
        let addr = server.local_addr().unwrap();

        let mut a = TcpStream::connect(addr).unwrap();
        let mut b = TcpStream::connect(addr).unwrap();

        a.write_all(b"alpha").unwrap();
        b.write_all(b"beta").unwrap();

        let mut buf = [0u8; 7];
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"> alpha");

        let mut buf = [0u8; 6];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"> beta");

        server.stop();
        loop_thread.join().unwrap().unwrap();

        // Open connections are closed when the loop exits.
        let mut rest = Vec::new();
        a.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_default_handler_closes_on_input() {
        let (server, loop_thread) = start(crate::handler::CloseHandler, 16);
        let addr = server.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"hello").unwrap();

        let mut rest = Vec::new();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let _ = stream.read_to_end(&mut rest);
        assert!(rest.is_empty());

        server.stop();
        loop_thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_connection_limit() {
        let (server, loop_thread) = start(EchoHandler::new(), 1);
        let addr = server.local_addr().unwrap();

        let mut first = TcpStream::connect(addr).unwrap();
        first.write_all(b"1").unwrap();
        let mut buf = [0u8; 1];
        first.read_exact(&mut buf).unwrap();

        // Over the limit: accepted by the kernel, then dropped by the loop.
        let mut second = TcpStream::connect(addr).unwrap();
        second.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut rest = Vec::new();
        let _ = second.read_to_end(&mut rest);
        assert!(rest.is_empty());

        server.stop();
        loop_thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_large_reply_flushed_on_writable() {
        let (server, loop_thread) = start(EchoHandler::new(), 16);
        let addr = server.local_addr().unwrap();

        let payload: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 253) as u8).collect();
        let mut stream = TcpStream::connect(addr).unwrap();
        let mut reader = stream.try_clone().unwrap();

        let expected = payload.clone();
        let read_side = thread::spawn(move || {
            let mut received = vec![0u8; expected.len()];
            reader.read_exact(&mut received).unwrap();
            received == expected
        });

        stream.write_all(&payload).unwrap();
        assert!(read_side.join().unwrap());

        server.stop();
        loop_thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_zero_buffer_size_still_dispatches() {
        let mut config = ServerConfig::new(0, Mode::NonBlocking, None);
        config.host = "127.0.0.1".parse().unwrap();
        config.buffer_size = 0;
        let server = Arc::new(Server::with_config(config, EchoHandler::new()));
        server.init().unwrap();
        let runner = Arc::clone(&server);
        let loop_thread = thread::spawn(move || runner.run());

        let mut stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        stream.write_all(b"abc").unwrap();
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");

        server.stop();
        loop_thread.join().unwrap().unwrap();
    }

    /// Answers `ping` chunks and swallows everything else.
    struct PingHandler;

    impl ConnectionHandler for PingHandler {
        fn on_data(&self, conn: &mut ConnectionHandle, data: &[u8]) -> Dispatch {
            if data == b"ping" && conn.send(b"pong").is_err() {
                return Dispatch::Close;
            }
            Dispatch::Continue
        }
    }

    #[test]
    fn test_busy_peer_does_not_starve_others() {
        let (server, loop_thread) = start(PingHandler, 16);
        let addr = server.local_addr().unwrap();

        let flooding = Arc::new(AtomicBool::new(true));
        let mut flood = TcpStream::connect(addr).unwrap();
        let flag = Arc::clone(&flooding);
        let flooder = thread::spawn(move || {
            let chunk = vec![0u8; 64 * 1024];
            while flag.load(Ordering::Relaxed) {
                if flood.write_all(&chunk).is_err() {
                    break;
                }
            }
        });
        thread::sleep(Duration::from_millis(100));

        let mut quiet = TcpStream::connect(addr).unwrap();
        quiet.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let started = Instant::now();
        quiet.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        quiet.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
        assert!(started.elapsed() < Duration::from_secs(5));

        flooding.store(false, Ordering::Relaxed);
        server.stop();
        loop_thread.join().unwrap().unwrap();
        flooder.join().unwrap();
    }
}

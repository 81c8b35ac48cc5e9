//! TCP server lifecycle.
//!
//! A [`Server`] moves through `Created → Bound → Running → Stopped`:
//! - `init` creates, binds and listens on the socket
//! - `run` drives the accept loop on the calling thread until `stop`
//! - `stop` closes the listener, waits for the loop and joins all workers
//!
//! Two accept loops are available:
//! - `Blocking`: one worker thread per accepted connection
//! - `NonBlocking`: a single mio event loop (epoll on Linux, kqueue on macOS)
//!   multiplexing the listener and every open connection

mod blocking;
#[cfg(unix)]
mod event_loop;
mod thread;

pub use crate::config::Mode;
pub use thread::ServerThread;

use crate::config::ServerConfig;
use crate::error::NetError;
use crate::handler::{CloseHandler, ConnectionHandler};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTEN_BACKLOG: i32 = 1024;

/// Bound on the loopback connect `stop` uses to wake a parked accept.
const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_millis(200);

/// Lifecycle state of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Bound,
    Running,
    Stopped,
}

struct Lifecycle {
    state: ServerState,
    /// Thread currently inside `run`, if any.
    loop_thread: Option<ThreadId>,
}

/// A listening TCP server dispatching connections to a [`ConnectionHandler`].
///
/// All methods take `&self`; share the server through an `Arc` to call
/// `stop` from another thread while `run` is blocked.
pub struct Server {
    config: ServerConfig,
    handler: Arc<dyn ConnectionHandler>,
    lifecycle: Mutex<Lifecycle>,
    loop_exited: Condvar,
    running: AtomicBool,
    /// Shared with the accept loop so the fd is closed exactly once.
    listener: Mutex<Option<Arc<Socket>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    #[cfg(unix)]
    waker: Mutex<Option<Arc<mio::Waker>>>,
}

impl Server {
    /// Server on every interface that closes each accepted connection.
    pub fn new(port: u16, mode: Mode, accept_timeout: Option<Duration>) -> Self {
        Self::with_config(ServerConfig::new(port, mode, accept_timeout), CloseHandler)
    }

    /// Server on every interface with a custom handler.
    pub fn with_handler(
        port: u16,
        mode: Mode,
        accept_timeout: Option<Duration>,
        handler: impl ConnectionHandler,
    ) -> Self {
        Self::with_config(ServerConfig::new(port, mode, accept_timeout), handler)
    }

    pub fn with_config(mut config: ServerConfig, handler: impl ConnectionHandler) -> Self {
        config.accept_timeout = config.accept_timeout.filter(|t| !t.is_zero());
        // A zero-byte read would look like end of stream to the event loop.
        config.buffer_size = config.buffer_size.max(1);
        config.poll_batch = config.poll_batch.max(1);
        Self {
            config,
            handler: Arc::new(handler),
            lifecycle: Mutex::new(Lifecycle {
                state: ServerState::Created,
                loop_thread: None,
            }),
            loop_exited: Condvar::new(),
            running: AtomicBool::new(false),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            #[cfg(unix)]
            waker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ServerState {
        lock(&self.lifecycle).state
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    /// Address actually bound, available once `init` succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Number of blocking-mode workers not yet joined.
    pub fn worker_count(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Create, bind and listen on the server socket.
    ///
    /// Only valid from `Created`. On failure the state stays `Created`, so
    /// the call can be retried.
    pub fn init(&self) -> Result<(), NetError> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.state != ServerState::Created {
            return Err(NetError::InvalidState {
                op: "init",
                state: lifecycle.state,
            });
        }

        let addr = SocketAddr::new(self.config.host, self.config.port);
        let socket = match create_listener(addr, &self.config) {
            Ok(socket) => socket,
            Err(source) => {
                error!(addr = %addr, error = %source, "Socket binding failed");
                return Err(NetError::Bind { addr, source });
            }
        };

        let bound = socket
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .unwrap_or(addr);
        *lock(&self.local_addr) = Some(bound);
        *lock(&self.listener) = Some(Arc::new(socket));
        lifecycle.state = ServerState::Bound;

        info!(
            addr = %bound,
            mode = ?self.config.mode,
            accept_timeout = ?self.config.accept_timeout,
            "Successfully bound port"
        );
        Ok(())
    }

    /// Run the accept loop on the calling thread until `stop` is called.
    ///
    /// Only valid from `Bound`.
    pub fn run(&self) -> Result<(), NetError> {
        let listener = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.state != ServerState::Bound {
                return Err(NetError::InvalidState {
                    op: "run",
                    state: lifecycle.state,
                });
            }
            let listener = lock(&self.listener).clone().ok_or(NetError::InvalidState {
                op: "run",
                state: lifecycle.state,
            })?;
            lifecycle.state = ServerState::Running;
            lifecycle.loop_thread = Some(std::thread::current().id());
            self.running.store(true, Ordering::SeqCst);
            listener
        };

        info!(mode = ?self.config.mode, "Server running");
        let result = match self.config.mode {
            Mode::Blocking => blocking::accept_loop(self, &listener),
            Mode::NonBlocking => self.run_event_loop(&listener),
        };
        // Last reference once `stop` has taken its copy: closes the socket.
        drop(listener);

        if let Err(ref e) = result {
            error!(error = %e, "Accept loop terminated");
        }
        lock(&self.lifecycle).loop_thread = None;
        self.loop_exited.notify_all();
        result
    }

    #[cfg(unix)]
    fn run_event_loop(&self, listener: &Socket) -> Result<(), NetError> {
        event_loop::run(self, listener)
    }

    #[cfg(not(unix))]
    fn run_event_loop(&self, _listener: &Socket) -> Result<(), NetError> {
        Err(NetError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            "non-blocking mode requires a unix platform",
        )))
    }

    /// Stop accepting, close the listener and join every worker.
    ///
    /// Safe from any thread and safe to repeat; later calls are no-ops.
    /// In-flight handlers are waited for, never interrupted.
    pub fn stop(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.state == ServerState::Stopped {
            return;
        }
        let previous = lifecycle.state;
        lifecycle.state = ServerState::Stopped;
        self.running.store(false, Ordering::SeqCst);
        info!(previous = ?previous, "Stop server");

        if let Some(listener) = lock(&self.listener).take() {
            if lifecycle.loop_thread.is_some() && self.config.mode == Mode::Blocking {
                self.wake_accept(&listener);
            }
        }
        self.wake_event_loop();

        let current = std::thread::current().id();
        while lifecycle.loop_thread.is_some_and(|id| id != current) {
            lifecycle = self
                .loop_exited
                .wait(lifecycle)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(lifecycle);

        let joined = self.join_workers();
        info!(workers = joined, "Server stopped");
    }

    /// Unblock a thread parked in `accept` on `listener`.
    ///
    /// Shutting a listening socket down wakes `accept` on Linux but fails
    /// with `ENOTCONN` elsewhere, so a loopback connect follows either way.
    /// The accept loop re-checks the running flag and drops that connection.
    fn wake_accept(&self, listener: &Socket) {
        if let Err(e) = listener.shutdown(Shutdown::Both) {
            debug!(error = %e, "Listener shutdown did not wake accept");
        }
        let Some(addr) = self.local_addr().map(wake_address) else {
            return;
        };
        match TcpStream::connect_timeout(&addr, WAKE_CONNECT_TIMEOUT) {
            Ok(stream) => drop(stream),
            Err(e) => trace!(addr = %addr, error = %e, "Wake connect failed"),
        }
    }

    #[cfg(unix)]
    fn wake_event_loop(&self) {
        if let Some(waker) = lock(&self.waker).as_ref() {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "Failed to wake event loop");
            }
        }
    }

    #[cfg(not(unix))]
    fn wake_event_loop(&self) {}

    /// Join all tracked workers except the calling thread.
    fn join_workers(&self) -> usize {
        let workers = std::mem::take(&mut *lock(&self.workers));
        let current = std::thread::current().id();
        let mut joined = 0;
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!("Connection worker panicked");
            }
            joined += 1;
        }
        joined
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

/// Create the listening socket.
///
/// `SO_REUSEADDR` only: a port held by another listener must fail to bind.
fn create_listener(addr: SocketAddr, config: &ServerConfig) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    match config.mode {
        Mode::Blocking => {
            // Lets a parked accept return periodically to observe `stop`.
            if let Some(timeout) = config.accept_timeout {
                socket.set_read_timeout(Some(timeout))?;
            }
        }
        Mode::NonBlocking => socket.set_nonblocking(true)?,
    }

    Ok(socket)
}

/// Address a local connect can reach for a listener bound to `bound`.
fn wake_address(bound: SocketAddr) -> SocketAddr {
    let ip = match bound.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, bound.port())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn loopback(mode: Mode) -> Server {
        let mut config = ServerConfig::new(0, mode, None);
        config.host = "127.0.0.1".parse().unwrap();
        Server::with_config(config, CloseHandler)
    }

    #[test]
    fn test_state_transitions() {
        let server = loopback(Mode::Blocking);
        assert_eq!(server.state(), ServerState::Created);
        assert!(server.local_addr().is_none());

        server.init().unwrap();
        assert_eq!(server.state(), ServerState::Bound);
        assert_ne!(server.local_addr().unwrap().port(), 0);

        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_init_twice_rejected() {
        let server = loopback(Mode::Blocking);
        server.init().unwrap();

        let err = server.init().unwrap_err();
        assert!(matches!(
            err,
            NetError::InvalidState {
                op: "init",
                state: ServerState::Bound
            }
        ));
    }

    #[test]
    fn test_run_before_init_rejected() {
        let server = loopback(Mode::Blocking);
        assert!(matches!(
            server.run(),
            Err(NetError::InvalidState {
                op: "run",
                state: ServerState::Created
            })
        ));
    }

    #[test]
    fn test_run_after_stop_rejected() {
        let server = loopback(Mode::NonBlocking);
        server.init().unwrap();
        server.stop();
        assert!(server.run().is_err());
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_bind_conflict_is_retriable() {
        let holder = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let server = Server::new(port, Mode::Blocking, None);
        let err = server.init().unwrap_err();
        assert!(matches!(err, NetError::Bind { .. }));
        assert_eq!(server.state(), ServerState::Created);

        drop(holder);
        server.init().unwrap();
        assert_eq!(server.state(), ServerState::Bound);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let server = loopback(Mode::Blocking);
        server.stop();
        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_zero_timeout_means_none() {
        let server = Server::new(0, Mode::Blocking, Some(Duration::ZERO));
        assert!(server.config.accept_timeout.is_none());
    }

    #[test]
    fn test_zero_sizes_clamped() {
        let mut config = ServerConfig::new(0, Mode::NonBlocking, None);
        config.buffer_size = 0;
        config.poll_batch = 0;
        let server = Server::with_config(config, CloseHandler);
        assert_eq!(server.config.buffer_size, 1);
        assert_eq!(server.config.poll_batch, 1);
    }

    #[test]
    fn test_wake_address_targets_loopback() {
        let v4: SocketAddr = "0.0.0.0:4000".parse().unwrap();
        assert_eq!(wake_address(v4), "127.0.0.1:4000".parse().unwrap());

        let v6: SocketAddr = "[::]:4000".parse().unwrap();
        assert_eq!(wake_address(v6), "[::1]:4000".parse().unwrap());

        let bound: SocketAddr = "10.1.2.3:4000".parse().unwrap();
        assert_eq!(wake_address(bound), bound);
    }
}

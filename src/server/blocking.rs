//! Thread-per-connection accept loop.

use super::{lock, Server};
use crate::connection::ConnectionHandle;
use crate::error::NetError;
use socket2::Socket;
use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

pub(super) fn accept_loop(server: &Server, listener: &Socket) -> Result<(), NetError> {
    let mut next_worker = 0u64;

    while server.is_running() {
        match listener.accept() {
            Ok((socket, addr)) => {
                // Includes the loopback connect `stop` uses to wake us.
                if !server.is_running() {
                    break;
                }
                let Some(peer) = addr.as_socket() else {
                    debug!("Dropping connection without an inet peer address");
                    continue;
                };
                match prepare_stream(socket) {
                    Ok(stream) => {
                        info!(peer = %peer, "Client connection accepted");
                        server.spawn_worker(ConnectionHandle::new(stream, peer), next_worker);
                        next_worker += 1;
                    }
                    Err(e) => warn!(peer = %peer, error = %e, "Failed to configure connection"),
                }
            }
            // Accept timeout elapsed: re-check the running flag.
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                trace!("Accept timed out");
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                if !server.is_running() {
                    break;
                }
                error!(error = %NetError::Accept(e), "Listener accept failed");
                thread::sleep(ACCEPT_BACKOFF);
            }
        }

        server.reap_workers();
    }

    debug!("Accept loop exited");
    Ok(())
}

/// Accepted sockets may inherit the listener's receive timeout; handles
/// carry no implicit timeouts.
fn prepare_stream(socket: Socket) -> io::Result<TcpStream> {
    socket.set_nonblocking(false)?;
    socket.set_read_timeout(None)?;
    Ok(socket.into())
}

impl Server {
    /// Hand `conn` to a new worker thread and track it for `stop`.
    fn spawn_worker(&self, conn: ConnectionHandle, worker_id: u64) {
        let handler = Arc::clone(&self.handler);
        let peer = conn.peer_addr();

        // Checked under the workers lock: `stop` flips the flag before it
        // drains this list, so a worker is either joined or never spawned.
        let mut workers = lock(&self.workers);
        if !self.is_running() {
            debug!(peer = %peer, "Server stopping, closing connection");
            return;
        }

        let spawned = thread::Builder::new()
            .name(format!("conn-{worker_id}"))
            .spawn(move || {
                handler.handle(conn);
                debug!(peer = %peer, "Worker finished");
            });

        match spawned {
            Ok(handle) => workers.push(handle),
            Err(e) => error!(peer = %peer, error = %e, "Failed to spawn worker"),
        }
    }

    /// Join workers that already finished.
    fn reap_workers(&self) {
        let mut workers = lock(&self.workers);
        let mut i = 0;
        while i < workers.len() {
            if workers[i].is_finished() {
                if workers.swap_remove(i).join().is_err() {
                    warn!("Connection worker panicked");
                }
            } else {
                i += 1;
            }
        }
    }
}

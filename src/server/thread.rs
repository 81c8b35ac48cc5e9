//! Running a server's accept loop on a dedicated thread.

use super::{Server, ServerState};
use crate::error::NetError;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Owns the thread running [`Server::run`].
///
/// Dropping a `ServerThread` stops the server and joins the thread.
pub struct ServerThread {
    server: Arc<Server>,
    handle: Option<JoinHandle<Result<(), NetError>>>,
}

impl ServerThread {
    /// Spawn a thread that runs the (already bound) server.
    pub fn start(server: Arc<Server>) -> io::Result<Self> {
        let runner = Arc::clone(&server);
        let handle = thread::Builder::new()
            .name("accept-loop".to_string())
            .spawn(move || {
                debug!("Start accept thread");
                let result = runner.run();
                debug!("End accept thread");
                result
            })?;

        Ok(Self {
            server,
            handle: Some(handle),
        })
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Whether the accept thread is still alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the server and join the accept thread.
    ///
    /// Returns the loop's own error, if it failed. Repeated calls return
    /// `Ok(())`.
    pub fn stop(&mut self) -> Result<(), NetError> {
        self.server.stop();

        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match handle.join() {
            // Stopped before the thread got to `run`.
            Ok(Err(NetError::InvalidState {
                state: ServerState::Stopped,
                ..
            })) => Ok(()),
            Ok(result) => result,
            Err(_) => {
                error!("Accept thread panicked");
                Err(NetError::Io(io::Error::other("accept thread panicked")))
            }
        }
    }
}

impl Drop for ServerThread {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mode, ServerConfig};
    use crate::handler::CloseHandler;
    use std::net::TcpStream;

    fn bound(mode: Mode) -> Arc<Server> {
        let mut config = ServerConfig::new(0, mode, None);
        config.host = "127.0.0.1".parse().unwrap();
        let server = Arc::new(Server::with_config(config, CloseHandler));
        server.init().unwrap();
        server
    }

    #[test]
    fn test_start_stop() {
        for mode in [Mode::Blocking, Mode::NonBlocking] {
            let mut background = ServerThread::start(bound(mode)).unwrap();
            let addr = background.server().local_addr().unwrap();

            TcpStream::connect(addr).unwrap();
            assert!(background.is_running());

            background.stop().unwrap();
            assert!(!background.is_running());
            assert_eq!(background.server().state(), ServerState::Stopped);

            // Second stop is a no-op.
            background.stop().unwrap();
        }
    }

    #[test]
    fn test_stop_before_run_starts() {
        let server = bound(Mode::Blocking);
        server.stop();

        let mut background = ServerThread::start(server).unwrap();
        background.stop().unwrap();
    }

    #[test]
    fn test_run_error_is_reported() {
        // Never bound: `run` rejects the Created state.
        let server = Arc::new(Server::new(0, Mode::Blocking, None));
        let mut background = ServerThread::start(server).unwrap();

        // The thread exits by itself; the state error is surfaced on join.
        while background.is_running() {
            thread::sleep(std::time::Duration::from_millis(5));
        }
        let err = background.stop().unwrap_err();
        assert!(matches!(
            err,
            NetError::InvalidState {
                state: ServerState::Created,
                ..
            }
        ));
    }
}

//! tcpcore: echo server launcher
//!
//! Binds the configured port and echoes every chunk it receives back to the
//! sender, prefixed with the configured text.
//!
//! Features:
//! - Blocking (thread per connection) or non-blocking (mio event loop) mode
//! - Optional accept timeout
//! - Configuration via CLI arguments or TOML file

use tcpcore::config::Config;
use tcpcore::{EchoHandler, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.server.host,
        port = config.server.port,
        mode = ?config.server.mode,
        accept_timeout = ?config.server.accept_timeout,
        "Starting tcpcore echo server"
    );

    let server = Server::with_config(
        config.server.clone(),
        EchoHandler::with_prefix(config.prefix.clone()),
    );
    server.init()?;
    server.run()?;
    Ok(())
}

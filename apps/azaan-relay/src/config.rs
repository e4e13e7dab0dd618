use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{ensure, Context};
use clap::Parser;

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, Parser)]
#[command(
    name = "azaan-relay",
    author,
    version,
    about = "Live azaan broadcast relay: WebRTC signaling with server-relayed audio fallback"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "AZAAN_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:5000")]
    pub listen_addr: String,

    /// Largest WebSocket message accepted from a client; bigger frames close the connection.
    #[arg(
        long,
        env = "AZAAN_RELAY_MAX_MESSAGE_BYTES",
        default_value_t = DEFAULT_MAX_MESSAGE_BYTES
    )]
    pub max_message_bytes: usize,

    /// Messages queued per connection before further messages to it are dropped.
    #[arg(
        long,
        env = "AZAAN_RELAY_OUTBOUND_BUFFER",
        default_value_t = DEFAULT_OUTBOUND_BUFFER
    )]
    pub outbound_buffer: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "AZAAN_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub max_message_bytes: usize,
    pub outbound_buffer: usize,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        ensure!(cli.max_message_bytes > 0, "max message size must be positive");
        ensure!(cli.outbound_buffer > 0, "outbound buffer must be positive");

        Ok(RelayConfig {
            listen_addr,
            max_message_bytes: cli.max_message_bytes,
            outbound_buffer: cli.outbound_buffer,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

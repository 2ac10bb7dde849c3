use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::{hub::HubConfig, server::ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting WebSocket clients on `/ws`.
    Start(StartArgs),
    /// Connect to a relay and chat from the terminal.
    Connect(ConnectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StartArgs {
    /// Host to bind to.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Messages that may wait for broadcast before senders are held back.
    #[arg(long, default_value_t = crate::hub::DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Messages that may wait for one slow client before it is dropped.
    #[arg(long, default_value_t = crate::hub::DEFAULT_OUTBOUND_CAPACITY)]
    pub outbound_capacity: usize,

    /// Seconds a single write may take before the client is dropped. 0 disables the limit.
    #[arg(long, default_value_t = 10)]
    pub write_timeout_secs: u64,

    /// Seconds allowed for closing clients on shutdown.
    #[arg(long, default_value_t = 5)]
    pub shutdown_timeout_secs: u64,
}

impl StartArgs {
    pub fn server_config(&self) -> ServerConfig {
        let write_timeout =
            (self.write_timeout_secs > 0).then(|| Duration::from_secs(self.write_timeout_secs));

        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            hub: HubConfig {
                queue_capacity: self.queue_capacity,
                outbound_capacity: self.outbound_capacity,
                write_timeout,
                ..HubConfig::default()
            },
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Address of the relay, as host:port.
    #[arg(long, default_value = "localhost:8080")]
    pub addr: String,

    /// Name shown in front of every message you send.
    #[arg(long)]
    pub username: Option<String>,
}

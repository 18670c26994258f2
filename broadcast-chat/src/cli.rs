use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::{
    codec::DEFAULT_MAX_LINE_LENGTH,
    config::{ClientConfig, DEFAULT_HOST, DEFAULT_PORT, ServerConfig},
    registry::DEFAULT_OUTBOX_CAPACITY,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server and broadcast every message to all logged-in clients.
    Serve(ServeArgs),
    /// Connect to a server and chat from the terminal.
    Connect(ConnectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Host or address to bind.
    #[arg(long, env = "CHAT_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to bind. Use 0 for an ephemeral port.
    #[arg(long, env = "CHAT_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Longest accepted line in bytes.
    #[arg(long, env = "CHAT_MAX_LINE_LENGTH", default_value_t = DEFAULT_MAX_LINE_LENGTH)]
    pub max_line_length: usize,

    /// Lines buffered per client before senders wait for it to catch up.
    #[arg(long, env = "CHAT_OUTBOX_CAPACITY", default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    pub outbox_capacity: usize,

    /// Milliseconds a write to one client, or a wait for room in its buffer,
    /// may stall before that client is disconnected.
    #[arg(long, env = "CHAT_WRITE_TIMEOUT_MS", default_value_t = 10_000)]
    pub write_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Server host.
    #[arg(long, env = "CHAT_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Server port.
    #[arg(long, env = "CHAT_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Username to log in with; prompted for when omitted.
    #[arg(long, env = "CHAT_USER")]
    pub user: Option<String>,
}

impl From<ServeArgs> for ServerConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            host: args.host,
            port: args.port,
            max_line_length: args.max_line_length,
            outbox_capacity: args.outbox_capacity,
            write_timeout: Duration::from_millis(args.write_timeout_ms),
        }
    }
}

impl ConnectArgs {
    pub fn into_config(self, user: String) -> ClientConfig {
        ClientConfig {
            host: self.host,
            port: self.port,
            user,
        }
    }
}

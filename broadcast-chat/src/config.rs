//! Typed settings for the server and the client.

use std::time::Duration;

use crate::{codec::DEFAULT_MAX_LINE_LENGTH, registry::DEFAULT_OUTBOX_CAPACITY};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 21213;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    /// Port to bind. Use 0 for an ephemeral port.
    pub port: u16,
    /// Longest accepted line in bytes, excluding the newline.
    pub max_line_length: usize,
    /// Lines buffered per client before senders wait for it to catch up.
    pub outbox_capacity: usize,
    /// How long a single write to a client, or a wait for room in its
    /// outbox, may stall before that client is dropped.
    pub write_timeout: Duration,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl ClientConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

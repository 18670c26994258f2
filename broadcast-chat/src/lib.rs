//! Line-oriented broadcast chat over TCP.
//!
//! A client logs in once with `login <username>`, and every `msg <text>` line
//! it sends afterwards is relayed as `msg <username> <timestamp> <text>` to all
//! logged-in clients, the sender included.
//!
//! - [`message`] holds the wire grammar: decoding and encoding of protocol lines.
//! - [`codec`] splits byte streams into newline-terminated lines.
//! - [`registry`] tracks logged-in sessions and fans messages out to them.
//! - [`session`] drives one server-side connection from login to close.
//! - [`server`] accepts TCP connections and runs a session for each.
//! - [`client`] connects to a server, multiplexing terminal input and
//!   incoming messages.
//! - [`config`] and [`cli`] describe how both sides are configured.

pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;

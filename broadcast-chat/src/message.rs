//! Text line protocol shared by the server and the client.
//!
//! ```text
//! client -> server:   login <username>\n
//!                     msg <text>\n
//! server -> client:   msg <username> <timestamp> <text>\n
//! ```
//!
//! Decoders work on a single line *including* its terminating `\n` and never
//! fail loudly: anything that does not match the grammar yields `None`, and the
//! caller decides whether that closes the connection or skips the line.

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncWrite, AsyncWriteExt};

const LOGIN_PREFIX: &[u8] = b"login ";
const MSG_PREFIX: &[u8] = b"msg ";

/// First line of every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub user: String,
}

/// A chat line tagged with its sender and the second the server received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub user: String,
    pub timestamp: u64,
    pub text: String,
}

/// The two shapes a protocol line can take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Login(Login),
    Msg(Msg),
}

impl Login {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }

    /// Matches `login <word>\n`.
    pub fn decode(line: &[u8]) -> Option<Self> {
        let rest = line.strip_prefix(LOGIN_PREFIX)?;
        let (user, rest) = split_word(rest)?;
        if !rest.starts_with(b"\n") {
            return None;
        }

        let user = std::str::from_utf8(user).ok()?;
        Some(Self::new(user))
    }

    pub fn encode(&self) -> Vec<u8> {
        format!("login {}\n", self.user).into_bytes()
    }
}

impl Msg {
    /// Matches `msg <rest-of-line>\n` from an authenticated client and stamps
    /// it with the current wall-clock second.
    pub fn decode_client(user: &str, line: &[u8]) -> Option<Self> {
        Self::decode_client_at(user, line, unix_now())
    }

    pub fn decode_client_at(user: &str, line: &[u8], timestamp: u64) -> Option<Self> {
        let rest = line.strip_prefix(MSG_PREFIX)?;
        let text = rest_of_line(rest)?;

        Some(Self {
            user: user.to_string(),
            timestamp,
            text: String::from_utf8_lossy(text).into_owned(),
        })
    }

    /// Matches `msg <word> <digits> <rest-of-line>\n` as relayed by the server.
    pub fn decode_server(line: &[u8]) -> Option<Self> {
        let rest = line.strip_prefix(MSG_PREFIX)?;
        let (user, rest) = split_word(rest)?;
        let rest = rest.strip_prefix(b" ")?;

        let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }
        let (timestamp, rest) = rest.split_at(digits);
        let text = rest_of_line(rest.strip_prefix(b" ")?)?;

        let user = std::str::from_utf8(user).ok()?;
        // Only ASCII digits were taken, so the slice is valid UTF-8; overflow is "no match".
        let timestamp = std::str::from_utf8(timestamp).ok()?.parse().ok()?;

        Some(Self {
            user: user.to_string(),
            timestamp,
            text: String::from_utf8_lossy(text).into_owned(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(!self.text.contains('\n'), "message text must be a single line");
        format!("msg {} {} {}\n", self.user, self.timestamp, self.text).into_bytes()
    }
}

impl Message {
    /// Dispatches a client line on its `login`/`msg` prefix.
    ///
    /// `msg` lines only match once the connection has a `sender` to attribute
    /// them to; they are stamped with the current wall-clock second.
    pub fn decode_client(sender: Option<&str>, line: &[u8]) -> Option<Self> {
        if line.starts_with(LOGIN_PREFIX) {
            Login::decode(line).map(Message::Login)
        } else {
            Msg::decode_client(sender?, line).map(Message::Msg)
        }
    }
}

/// Client-side `msg <text>\n`; the server adds sender and timestamp.
pub fn encode_client_msg(text: &str) -> Vec<u8> {
    format!("msg {text}\n").into_bytes()
}

/// Whether `user` satisfies the username grammar `[A-Za-z0-9_]+`.
pub fn is_valid_username(user: &str) -> bool {
    !user.is_empty() && user.bytes().all(is_word_byte)
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Writes one encoded line and flushes so peers see it immediately.
pub async fn write_line<W>(writer: &mut W, line: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line).await?;
    writer.flush().await
}

fn is_word_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

/// Splits a leading non-empty run of word bytes from the remainder.
fn split_word(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let len = bytes.iter().take_while(|b| is_word_byte(**b)).count();
    if len == 0 {
        return None;
    }
    Some(bytes.split_at(len))
}

/// Everything up to the first newline; the newline itself is mandatory.
fn rest_of_line(bytes: &[u8]) -> Option<&[u8]> {
    let end = bytes.iter().position(|b| *b == b'\n')?;
    Some(&bytes[..end])
}

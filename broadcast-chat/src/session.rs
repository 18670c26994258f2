//! Server side of one connection: login handshake, then relay lines until
//! something ends the session.
//!
//! ```text
//! Connecting -> Authenticating -> Active -> Closed
//!                     \_______________________^
//! ```
//!
//! A single task drives the session, selecting between the next inbound line
//! and the next line queued in the member's outbox. While a broadcast waits for
//! room in other members' outboxes, the session keeps draining its own, so the
//! echo of its own message never deadlocks it. Every exit path goes through
//! [`run_session`] returning a [`CloseReason`], and the registry membership is
//! released when the [`Registration`] drops.

use std::{fmt, io, sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    select,
    time::timeout,
};
use tokio_util::codec::FramedRead;
use tracing::{debug, info};

use crate::{
    codec::LineCodec,
    config::ServerConfig,
    message::{Login, Message, Msg, write_line},
    registry::{Registration, Registry},
};

/// Why a session reached `Closed`.
#[derive(Debug)]
pub enum CloseReason {
    /// The peer closed its side.
    EndOfStream,
    /// The first line was not a valid `login`.
    RejectedLogin,
    /// A line after login was not a valid `msg`, or was too long.
    MalformedLine,
    /// The registry dropped this member because its outbox overflowed.
    Evicted,
    /// A write to the peer stalled for longer than the configured timeout.
    WriteTimeout,
    Io(io::Error),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::EndOfStream => f.write_str("end of stream"),
            CloseReason::RejectedLogin => f.write_str("rejected login"),
            CloseReason::MalformedLine => f.write_str("malformed line"),
            CloseReason::Evicted => f.write_str("evicted"),
            CloseReason::WriteTimeout => f.write_str("write timeout"),
            CloseReason::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl From<io::Error> for CloseReason {
    fn from(err: io::Error) -> Self {
        // The line codec reports oversized lines as InvalidData.
        if err.kind() == io::ErrorKind::InvalidData {
            CloseReason::MalformedLine
        } else {
            CloseReason::Io(err)
        }
    }
}

/// Drives one connection to completion.
///
/// Never fails: protocol and transport problems end only this session and are
/// reported through the returned reason.
pub async fn run_session<S>(stream: S, registry: &Arc<Registry>, config: &ServerConfig) -> CloseReason
where
    S: AsyncRead + AsyncWrite,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = FramedRead::new(reader, LineCodec::new(config.max_line_length));

    let login = match authenticate(&mut lines).await {
        Ok(login) => login,
        Err(reason) => {
            debug!(%reason, "closing unauthenticated connection");
            return reason;
        }
    };

    let mut registration = registry.register(&login);
    info!(session = registration.id(), user = %login.user, "client logged in");

    let reason = relay(
        &mut lines,
        &mut writer,
        &mut registration,
        registry,
        config.write_timeout,
    )
    .await;

    info!(session = registration.id(), user = %login.user, %reason, "client left");
    drop(registration);

    if !matches!(reason, CloseReason::WriteTimeout) {
        let _ = timeout(config.write_timeout, writer.shutdown()).await;
    }

    reason
}

async fn authenticate<R>(lines: &mut FramedRead<R, LineCodec>) -> Result<Login, CloseReason>
where
    R: AsyncRead + Unpin,
{
    let line = match lines.next().await {
        Some(line) => line?,
        None => return Err(CloseReason::EndOfStream),
    };

    match Message::decode_client(None, &line) {
        Some(Message::Login(login)) => Ok(login),
        _ => Err(CloseReason::RejectedLogin),
    }
}

async fn relay<R, W>(
    lines: &mut FramedRead<R, LineCodec>,
    writer: &mut W,
    registration: &mut Registration,
    registry: &Registry,
    write_timeout: Duration,
) -> CloseReason
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let step = select! {
            inbound = lines.next() => {
                let line = match inbound {
                    Some(Ok(line)) => line,
                    Some(Err(err)) => return err.into(),
                    None => return CloseReason::EndOfStream,
                };

                match Message::decode_client(Some(registration.user()), &line) {
                    Some(Message::Msg(msg)) => {
                        broadcast(&msg, registry, registration, writer, write_timeout).await
                    }
                    Some(Message::Login(_)) => {
                        debug!("second login on an authenticated connection");
                        Err(CloseReason::MalformedLine)
                    }
                    None => Err(CloseReason::MalformedLine),
                }
            }
            outbound = registration.recv() => deliver(outbound, writer, write_timeout).await,
        };

        if let Err(reason) = step {
            return reason;
        }
    }
}

/// Fans `msg` out while still draining this member's own outbox, which the
/// broadcast may be waiting on.
async fn broadcast<W>(
    msg: &Msg,
    registry: &Registry,
    registration: &mut Registration,
    writer: &mut W,
    write_timeout: Duration,
) -> Result<(), CloseReason>
where
    W: AsyncWrite + Unpin,
{
    let fan_out = registry.broadcast_to_all(msg);
    tokio::pin!(fan_out);

    loop {
        select! {
            biased;
            _ = &mut fan_out => return Ok(()),
            outbound = registration.recv() => deliver(outbound, writer, write_timeout).await?,
        }
    }
}

async fn deliver<W>(
    outbound: Option<Bytes>,
    writer: &mut W,
    write_timeout: Duration,
) -> Result<(), CloseReason>
where
    W: AsyncWrite + Unpin,
{
    let Some(line) = outbound else {
        return Err(CloseReason::Evicted);
    };

    match timeout(write_timeout, write_line(writer, &line)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(CloseReason::Io(err)),
        Err(_) => Err(CloseReason::WriteTimeout),
    }
}

use anyhow::{Context, Result, bail};
use chrono::DateTime;
use futures_util::StreamExt;
use tokio::{
    io::{self, AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    select,
};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::{
    codec::{DEFAULT_MAX_LINE_LENGTH, LineCodec},
    config::ClientConfig,
    message::{Login, Msg, encode_client_msg, is_valid_username, write_line},
};

/// A relayed line carries a username and a text, each bounded by the server's
/// line limit, plus the `msg`, timestamp and separators.
const INCOMING_MAX_LINE_LENGTH: usize = 2 * DEFAULT_MAX_LINE_LENGTH + 32;

/// Longest input line that still fits the server's limit once sent as
/// `msg <text>`.
const INPUT_MAX_LINE_LENGTH: usize = DEFAULT_MAX_LINE_LENGTH - 4;

/// How a client session came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ended {
    /// Local input was exhausted.
    InputClosed,
    /// The server closed the connection.
    ServerClosed,
}

/// Connects to `host:port` as `user` and chats over the terminal.
pub async fn connect(host: &str, port: u16, user: &str) -> Result<Ended> {
    run(ClientConfig {
        host: host.to_string(),
        port,
        user: user.to_string(),
    })
    .await
}

pub async fn run(config: ClientConfig) -> Result<Ended> {
    let address = config.address();
    let stream = TcpStream::connect(&address)
        .await
        .with_context(|| format!("failed to connect to {address}"))?;
    info!(%address, user = %config.user, "connected");

    let ended = run_session(stream, &config.user, tokio::io::stdin(), tokio::io::stdout()).await?;
    match ended {
        Ended::ServerClosed => write_stderr("*** server closed the connection").await?,
        Ended::InputClosed => debug!("input closed"),
    }

    Ok(ended)
}

/// Logs in as `user`, then forwards `input` lines as messages while rendering
/// server messages to `output`, until either side ends.
///
/// The two directions run concurrently so a busy server never holds up
/// outgoing input and an idle user never holds up incoming messages.
pub async fn run_session<S, I, O>(stream: S, user: &str, input: I, mut output: O) -> Result<Ended>
where
    S: AsyncRead + AsyncWrite,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    if !is_valid_username(user) {
        bail!("invalid username '{user}': use letters, digits and underscores only");
    }

    let (reader, mut writer) = tokio::io::split(stream);
    write_line(&mut writer, &Login::new(user).encode())
        .await
        .context("failed to send login")?;

    let ended = select! {
        result = forward_input(input, &mut writer) => {
            result?;
            Ended::InputClosed
        }
        result = render_incoming(reader, &mut output) => {
            result?;
            Ended::ServerClosed
        }
    };

    if let Err(err) = writer.shutdown().await {
        debug!(error = ?err, "failed to shut down connection cleanly");
    }

    Ok(ended)
}

async fn forward_input<I, W>(input: I, writer: &mut W) -> Result<()>
where
    I: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = FramedRead::new(input, LineCodec::skipping(INPUT_MAX_LINE_LENGTH));

    while let Some(line) = lines.next().await {
        let line = line.context("failed to read input")?;
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\n', '\r']);

        write_line(writer, &encode_client_msg(text))
            .await
            .context("failed to send message")?;
    }

    Ok(())
}

async fn render_incoming<R, O>(reader: R, output: &mut O) -> Result<()>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut lines = FramedRead::new(reader, LineCodec::skipping(INCOMING_MAX_LINE_LENGTH));

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(error = ?err, "connection error");
                break;
            }
        };

        match Msg::decode_server(&line) {
            Some(msg) => {
                let mut rendered = render_msg(&msg);
                rendered.push('\n');
                write_line(output, rendered.as_bytes())
                    .await
                    .context("failed to write output")?;
            }
            None => warn!(line = %String::from_utf8_lossy(&line).trim_end(), "ignoring unexpected line"),
        }
    }

    Ok(())
}

/// Formats a message as `[YYYY-MM-DD HH:MM:SS] <user> text` in UTC.
pub fn render_msg(msg: &Msg) -> String {
    let time = i64::try_from(msg.timestamp)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| msg.timestamp.to_string());

    format!("[{time}] <{}> {}", msg.user, msg.text)
}

/// Asks for a username on the terminal until a valid one is entered.
pub async fn prompt_username() -> Result<String> {
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"username: ").await?;
        stdout.flush().await?;

        // std's stdin is buffered process-wide, so nothing typed after the
        // username is lost to the chat input that follows.
        let (read, input) = tokio::task::spawn_blocking(|| {
            let mut input = String::new();
            std::io::stdin().read_line(&mut input).map(|read| (read, input))
        })
        .await
        .context("username prompt task failed")??;

        if read == 0 {
            bail!("no username entered");
        }

        let user = input.trim();
        if is_valid_username(user) {
            return Ok(user.to_string());
        }
        write_stderr("!!! usernames may only contain letters, digits and underscores").await?;
    }
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

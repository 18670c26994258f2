use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use broadcast_chat::{
    config::ServerConfig,
    message::{Login, Msg, encode_client_msg, unix_now},
    registry::Registry,
    server::Server,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

struct TestServer {
    addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        let server = Server::bind(ServerConfig::new("127.0.0.1", 0)).await?;
        let addr = server.local_addr()?;
        let registry = server.registry();

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async move {
            let _ = shutdown_rx.await;
        }));

        Ok(Self {
            addr,
            registry,
            shutdown,
            task,
        })
    }

    async fn wait_for_members(&self, count: usize) -> Result<()> {
        timeout(READ_TIMEOUT, async {
            while self.registry.len() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        Ok(())
    }

    async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task.await??;
        Ok(())
    }
}

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn login(addr: SocketAddr, user: &str) -> Result<Self> {
        let mut client = Self::connect(addr).await?;
        client.send(&Login::new(user).encode()).await?;
        Ok(client)
    }

    async fn send(&mut self, line: &[u8]) -> Result<()> {
        self.writer.write_all(line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn say(&mut self, text: &str) -> Result<()> {
        self.send(&encode_client_msg(text)).await
    }

    /// Next raw line, or `None` once the server closed the connection.
    async fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let read = timeout(READ_TIMEOUT, self.reader.read_until(b'\n', &mut line)).await??;
        Ok((read > 0).then_some(line))
    }

    async fn read_msg(&mut self) -> Result<Msg> {
        let line = self
            .read_line()
            .await?
            .ok_or_else(|| anyhow::anyhow!("connection closed"))?;
        Msg::decode_server(&line)
            .ok_or_else(|| anyhow::anyhow!("unexpected line: {:?}", String::from_utf8_lossy(&line)))
    }
}

#[tokio::test]
async fn message_reaches_every_client_including_sender() -> Result<()> {
    let server = TestServer::start().await?;

    let mut alice = TestClient::login(server.addr, "alice").await?;
    let mut bob = TestClient::login(server.addr, "bob").await?;
    let mut carol = TestClient::login(server.addr, "carol").await?;
    server.wait_for_members(3).await?;

    let before = unix_now();
    alice.say("hello").await?;

    for client in [&mut alice, &mut bob, &mut carol] {
        let line = client.read_line().await?.expect("broadcast line");
        let msg = Msg::decode_server(&line).expect("server format");
        assert_eq!(msg.user, "alice");
        assert_eq!(msg.text, "hello");
        assert!(msg.timestamp >= before && msg.timestamp <= unix_now() + 1);
        assert_eq!(line, format!("msg alice {} hello\n", msg.timestamp).into_bytes());
    }

    server.stop().await
}

#[tokio::test]
async fn late_joiner_receives_later_messages() -> Result<()> {
    let server = TestServer::start().await?;

    let mut alice = TestClient::login(server.addr, "alice").await?;
    server.wait_for_members(1).await?;
    alice.say("hello").await?;
    assert_eq!(alice.read_msg().await?.text, "hello");

    let mut bob = TestClient::login(server.addr, "bob").await?;
    server.wait_for_members(2).await?;
    alice.say("hi bob").await?;

    let start = unix_now();
    for client in [&mut alice, &mut bob] {
        let msg = client.read_msg().await?;
        assert_eq!((msg.user.as_str(), msg.text.as_str()), ("alice", "hi bob"));
        assert!(msg.timestamp.abs_diff(start) <= 2);
    }

    server.stop().await
}

#[tokio::test]
async fn message_before_login_closes_connection_without_broadcast() -> Result<()> {
    let server = TestServer::start().await?;

    let mut alice = TestClient::login(server.addr, "alice").await?;
    server.wait_for_members(1).await?;

    let mut intruder = TestClient::connect(server.addr).await?;
    intruder.send(b"msg hi\n").await?;
    assert_eq!(intruder.read_line().await?, None);
    assert_eq!(server.registry.len(), 1);

    // Alice only ever sees her own message.
    alice.say("anyone?").await?;
    let msg = alice.read_msg().await?;
    assert_eq!((msg.user.as_str(), msg.text.as_str()), ("alice", "anyone?"));

    server.stop().await
}

#[tokio::test]
async fn malformed_line_drops_only_that_client() -> Result<()> {
    let server = TestServer::start().await?;

    let mut alice = TestClient::login(server.addr, "alice").await?;
    let mut bob = TestClient::login(server.addr, "bob").await?;
    server.wait_for_members(2).await?;

    bob.send(b"hello without prefix\n").await?;
    assert_eq!(bob.read_line().await?, None);
    server.wait_for_members(1).await?;

    alice.say("still up").await?;
    assert_eq!(alice.read_msg().await?.text, "still up");

    server.stop().await
}

#[tokio::test]
async fn disconnect_during_broadcast_does_not_affect_others() -> Result<()> {
    let server = TestServer::start().await?;

    let mut alice = TestClient::login(server.addr, "alice").await?;
    let bob = TestClient::login(server.addr, "bob").await?;
    let mut carol = TestClient::login(server.addr, "carol").await?;
    server.wait_for_members(3).await?;

    drop(bob);
    alice.say("one").await?;
    alice.say("two").await?;

    for client in [&mut alice, &mut carol] {
        assert_eq!(client.read_msg().await?.text, "one");
        assert_eq!(client.read_msg().await?.text, "two");
    }
    server.wait_for_members(2).await?;

    server.stop().await
}

#[tokio::test]
async fn messages_from_one_sender_keep_their_order() -> Result<()> {
    let server = TestServer::start().await?;

    let mut alice = TestClient::login(server.addr, "alice").await?;
    let mut bob = TestClient::login(server.addr, "bob").await?;
    server.wait_for_members(2).await?;

    let mut burst = Vec::new();
    for i in 0..50 {
        burst.extend_from_slice(&encode_client_msg(&format!("line {i}")));
    }
    alice.send(&burst).await?;

    for i in 0..50 {
        assert_eq!(bob.read_msg().await?.text, format!("line {i}"));
    }
    for i in 0..50 {
        assert_eq!(alice.read_msg().await?.text, format!("line {i}"));
    }

    server.stop().await
}

#[tokio::test]
async fn burst_far_beyond_outbox_capacity_reaches_every_reader() -> Result<()> {
    const BURST: usize = 2000;

    let server = TestServer::start().await?;
    let mut alice = TestClient::login(server.addr, "alice").await?;
    let bob = TestClient::login(server.addr, "bob").await?;
    let carol = TestClient::login(server.addr, "carol").await?;
    server.wait_for_members(3).await?;

    let read_all = |mut client: TestClient| {
        tokio::spawn(async move {
            for i in 0..BURST {
                let msg = client.read_msg().await?;
                anyhow::ensure!(msg.text == i.to_string(), "line {i} arrived as {:?}", msg.text);
            }
            Ok::<_, anyhow::Error>(client)
        })
    };
    let readers = [read_all(bob), read_all(carol)];

    let mut burst = Vec::new();
    for i in 0..BURST {
        burst.extend_from_slice(&encode_client_msg(&i.to_string()));
    }
    alice.send(&burst).await?;
    let echo = read_all(alice);

    let mut connected = vec![echo.await??];
    for reader in readers {
        connected.push(reader.await??);
    }
    assert_eq!(server.registry.len(), connected.len());

    server.stop().await
}

#[tokio::test]
async fn duplicate_usernames_are_allowed() -> Result<()> {
    let server = TestServer::start().await?;

    let mut first = TestClient::login(server.addr, "alice").await?;
    let mut second = TestClient::login(server.addr, "alice").await?;
    server.wait_for_members(2).await?;

    second.say("it's me").await?;
    for client in [&mut first, &mut second] {
        let msg = client.read_msg().await?;
        assert_eq!((msg.user.as_str(), msg.text.as_str()), ("alice", "it's me"));
    }

    server.stop().await
}

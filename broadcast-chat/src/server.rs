use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::JoinSet,
};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{config::ServerConfig, registry::Registry, session::run_session};

pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    config: Arc<ServerConfig>,
}

impl Server {
    /// Binds the configured address. Failing to bind is fatal for the caller.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let address = config.address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("failed to bind {address}"))?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        Self {
            listener,
            registry: Arc::new(
                Registry::new(config.outbox_capacity).with_send_timeout(config.write_timeout),
            ),
            config: Arc::new(config),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until `shutdown` resolves.
    ///
    /// Each connection runs as its own task. On shutdown the listener is closed
    /// and the remaining sessions are aborted, which unregisters them.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            registry,
            config,
        } = self;
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry, &config, &mut sessions);
                }
                Some(joined) = sessions.join_next() => {
                    if let Err(err) = joined {
                        if err.is_panic() {
                            error!(error = ?err, "session task panicked");
                        }
                    }
                }
            }
        }

        drop(listener);
        info!(active = sessions.len(), "server shutting down");
        sessions.shutdown().await;

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Binds `host:port` and serves until ctrl-c.
pub async fn serve(host: &str, port: u16) -> Result<()> {
    let server = Server::bind(ServerConfig::new(host, port)).await?;
    info!(addr = %server.local_addr()?, "server listening");
    server.run_until_ctrl_c().await
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<Registry>,
    config: &Arc<ServerConfig>,
    sessions: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, registry, config, sessions),
        // Typically EMFILE or a connection reset before accept; keep serving.
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<Registry>,
    config: &Arc<ServerConfig>,
    sessions: &mut JoinSet<()>,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, error = ?err, "failed to set TCP_NODELAY");
    }

    let registry = Arc::clone(registry);
    let config = Arc::clone(config);
    sessions.spawn(
        async move {
            debug!("connection accepted");
            let reason = run_session(stream, &registry, &config).await;
            debug!(%reason, "connection closed");
        }
        .instrument(info_span!("session", %peer)),
    );
}

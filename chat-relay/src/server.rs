use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    broadcast::Broadcaster,
    framing::Framing,
    registry::{ClientId, Registry},
    session,
};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5555;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub framing: Framing,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            framing: Framing::default(),
        }
    }
}

/// The relay: one listening socket plus everything needed to serve it.
///
/// Built by [`Server::bind`] (or [`Server::new`] around an existing listener)
/// and consumed by [`Server::run_until`], which force-closes every client and
/// releases the listener when it returns.
pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;
        Ok(Self::new(listener, config.framing))
    }

    pub fn new(listener: TcpListener, framing: Framing) -> Self {
        Self {
            listener,
            state: Arc::new(ServerState::new(framing)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(self.state.broadcaster.registry())
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        drop(listener);
        info!("server closed");
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

struct ServerState {
    broadcaster: Broadcaster,
    /// Parent of every session's close token.
    sessions: CancellationToken,
    next_id: AtomicU64,
}

impl ServerState {
    fn new(framing: Framing) -> Self {
        Self {
            broadcaster: Broadcaster::new(Arc::new(Registry::new()), framing),
            sessions: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Empties the registry before closing anything so that sessions winding down
/// find nothing to remove and send no departure notices.
async fn handle_shutdown(state: &ServerState) {
    info!("server shutting down");
    let clients = state.broadcaster.registry().drain().await;
    state.sessions.cancel();
    join_all(clients.iter().map(|entry| entry.handle.close())).await;
    info!(closed = clients.len(), "closed client connections");
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
) {
    match result {
        Ok((stream, peer)) => spawn_client_session(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_client_session(stream: TcpStream, peer: SocketAddr, state: &Arc<ServerState>) {
    let state = Arc::clone(state);
    let id = state.next_id();
    let closed = state.sessions.child_token();
    info!(peer = %peer, client = id, "new connection");
    tokio::spawn(async move {
        session::handle_connection(stream, id, &state.broadcaster, closed).await;
    });
}

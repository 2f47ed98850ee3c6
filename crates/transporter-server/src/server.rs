//! Agent listener and first-frame dispatch

use crate::pending::DataConnection;
use crate::registry::TunnelRegistry;
use crate::tunnel::{Tunnel, TunnelConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use transporter_auth::Authenticator;
use transporter_connection::{Acceptor, FramedTransport, TlsFiles, TransportError};
use transporter_proto::{BootstrapRequest, NewConnectionResponse, Signal};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] TransportError),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listener for both control and data connections from agents
    pub agent_addr: SocketAddr,
    /// Address every per-tunnel public listener binds to (on an ephemeral port)
    pub public_bind_addr: IpAddr,
    /// Deadline for the TLS handshake plus the first frame of a new connection
    pub handshake_timeout: Duration,
    pub tunnel: TunnelConfig,
    pub auth: Authenticator,
    pub acceptor: Acceptor,
}

impl ServerConfig {
    pub fn new(agent_addr: SocketAddr) -> Self {
        Self {
            agent_addr,
            public_bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            handshake_timeout: Duration::from_secs(10),
            tunnel: TunnelConfig::default(),
            auth: Authenticator::None,
            acceptor: Acceptor::plain(),
        }
    }

    pub fn with_public_bind_addr(mut self, addr: IpAddr) -> Self {
        self.public_bind_addr = addr;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_tunnel_config(mut self, tunnel: TunnelConfig) -> Self {
        self.tunnel = tunnel;
        self
    }

    pub fn with_static_token(mut self, token: impl Into<String>) -> Self {
        self.auth = Authenticator::static_token(token);
        self
    }

    /// Require mutual TLS on the agent listener
    pub fn with_certificate_auth(mut self, files: &TlsFiles) -> Result<Self, ServerError> {
        self.acceptor = Acceptor::mutual_tls(files)?;
        self.auth = Authenticator::Certificate;
        Ok(self)
    }
}

struct Shared {
    config: ServerConfig,
    registry: Arc<TunnelRegistry>,
}

/// Accepts agent connections and routes them by their first signal
pub struct TunnelServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl TunnelServer {
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener =
            TcpListener::bind(config.agent_addr)
                .await
                .map_err(|source| ServerError::Bind {
                    address: config.agent_addr,
                    source,
                })?;

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                config,
                registry: Arc::new(TunnelRegistry::new()),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<TunnelRegistry> {
        Arc::clone(&self.shared.registry)
    }

    /// Serve until `cancel` fires, then shut down every tunnel and wait for
    /// their public listeners to be released
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServerError> {
        info!(
            address = %self.local_addr()?,
            auth = %self.shared.config.auth.mode(),
            "Agent listener started"
        );

        loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    debug!(peer_addr = %peer_addr, "Accepted agent connection");
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(shared.handle_connection(stream, peer_addr, cancel.child_token()));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept agent connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        drop(self.listener);

        let tunnels = self.shared.registry.values();
        info!(tunnels = tunnels.len(), "Server shutting down");
        for tunnel in &tunnels {
            tunnel.shutdown("server shutting down");
        }
        for tunnel in tunnels {
            tunnel.wait_released().await;
        }
        Ok(())
    }
}

impl Shared {
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        cancel: CancellationToken,
    ) {
        let handshake = async {
            let mut transport = self.config.acceptor.accept(stream, peer_addr).await?;
            let first = transport.read_signal().await?;
            Ok::<_, TransportError>((transport, first))
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            outcome = tokio::time::timeout(self.config.handshake_timeout, handshake) => outcome,
        };

        let (transport, first) = match outcome {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(e)) => {
                debug!(
                    peer_addr = %peer_addr,
                    error = %e,
                    "Agent connection failed before first signal"
                );
                return;
            }
            Err(_) => {
                debug!(peer_addr = %peer_addr, "No first signal within handshake timeout");
                return;
            }
        };

        match first {
            Signal::BootstrapRequest(request) => self.bootstrap(transport, request, cancel).await,
            Signal::NewConnectionResponse(response) => self.attach(transport, response),
            other => {
                debug!(
                    peer_addr = %peer_addr,
                    signal = other.kind(),
                    "Discarding connection with unexpected first signal"
                );
            }
        }
    }

    async fn bootstrap(
        &self,
        mut transport: FramedTransport,
        request: BootstrapRequest,
        cancel: CancellationToken,
    ) {
        let identity = request.identity();

        if let Err(e) = self.config.auth.verify(&request.static_token) {
            warn!(
                agent_id = %identity.id,
                peer_addr = ?transport.peer_addr(),
                error = %e,
                "Bootstrap rejected"
            );
            reject(transport, &e.to_string()).await;
            return;
        }

        if identity.id.is_empty() {
            warn!(peer_addr = ?transport.peer_addr(), "Bootstrap without agent id");
            reject(transport, "missing agent id").await;
            return;
        }

        let listener = match TcpListener::bind((self.config.public_bind_addr, 0)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(agent_id = %identity.id, error = %e, "Failed to bind public listener");
                reject(transport, "failed to allocate public endpoint").await;
                return;
            }
        };

        if let Err(e) = transport.write_signal(&Signal::bootstrap_accepted()).await {
            debug!(agent_id = %identity.id, error = %e, "Agent left during bootstrap");
            return;
        }

        let opened = Tunnel::open(
            identity,
            transport,
            listener,
            Arc::clone(&self.registry),
            self.config.tunnel,
            cancel.clone(),
        );
        let (tunnel, replaced) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                error!(error = %e, "Failed to open tunnel");
                return;
            }
        };

        if let Some(stale) = replaced {
            stale.shutdown("replaced by a new connection from the same agent");
        }
        if cancel.is_cancelled() {
            tunnel.shutdown("server shutting down");
        }
    }

    fn attach(&self, transport: FramedTransport, response: NewConnectionResponse) {
        let peer_addr = transport.peer_addr();

        if !response.error.is_empty() {
            debug!(
                agent_id = %response.agent_id,
                error = %response.error,
                "Agent reported data connection error"
            );
            return;
        }

        if let Err(e) = self.config.auth.verify(&response.static_token) {
            warn!(
                agent_id = %response.agent_id,
                peer_addr = ?peer_addr,
                error = %e,
                "Data connection rejected"
            );
            return;
        }

        let Some(tunnel) = self.registry.get_by_agent(&response.agent_id) else {
            debug!(agent_id = %response.agent_id, "Data connection for unknown agent");
            return;
        };

        match tunnel.offer(DataConnection::new(transport)) {
            Ok(()) => debug!(agent_id = %response.agent_id, "Data connection queued"),
            Err(e) => {
                warn!(agent_id = %response.agent_id, error = %e, "Data connection discarded")
            }
        }
    }
}

async fn reject(mut transport: FramedTransport, reason: &str) {
    if let Err(e) = transport
        .write_signal(&Signal::bootstrap_rejected(reason))
        .await
    {
        debug!(error = %e, "Failed to deliver bootstrap rejection");
    }
    let _ = transport.shutdown().await;
}

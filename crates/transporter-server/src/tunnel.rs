//! Per-agent tunnel: public listener, control channel, data-connection pool

use crate::active::ActiveConnections;
use crate::pending::{DataConnection, OfferError, PendingConnections, RendezvousError};
use crate::registry::TunnelRegistry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transporter_connection::{splice, FramedTransport};
use transporter_control::{ControlChannel, FatalReceiver, HeartbeatConfig, Role, SignalHandler};
use transporter_proto::{AgentIdentity, Signal};

/// Pause after a failed accept on a public listener
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Per-tunnel tuning shared by every tunnel of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelConfig {
    /// How long a public connection waits for the agent to supply a data connection
    pub rendezvous_timeout: Duration,
    /// Capacity of the pending data-connection queue
    pub pending_capacity: usize,
    pub heartbeat: HeartbeatConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            rendezvous_timeout: Duration::from_secs(10),
            pending_capacity: 10,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// Server-side consumer of control signals. The responder end has nothing to
/// act on beyond the heartbeat, which the channel handles itself.
struct ControlSignals {
    agent_id: String,
}

impl SignalHandler for ControlSignals {
    fn on_signal(&self, signal: Signal) {
        debug!(
            agent_id = %self.agent_id,
            signal = signal.kind(),
            "Ignoring signal on server control channel"
        );
    }
}

/// The live association between one agent and its public listener
pub struct Tunnel {
    identity: AgentIdentity,
    public_addr: SocketAddr,
    control: ControlChannel,
    pending: PendingConnections,
    active: ActiveConnections,
    registry: Arc<TunnelRegistry>,
    rendezvous_timeout: Duration,
    cancel: CancellationToken,
    closing: AtomicBool,
    released: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Tunnel {
    /// Build a tunnel around an accepted bootstrap, register it and start
    /// serving `listener`.
    ///
    /// Returns the new tunnel and the tunnel it displaced in the registry, if
    /// the same agent was still registered.
    pub fn open(
        identity: AgentIdentity,
        control: FramedTransport,
        listener: TcpListener,
        registry: Arc<TunnelRegistry>,
        config: TunnelConfig,
        cancel: CancellationToken,
    ) -> std::io::Result<(Arc<Self>, Option<Arc<Self>>)> {
        let public_addr = listener.local_addr()?;

        let handler = Arc::new(ControlSignals {
            agent_id: identity.id.clone(),
        });
        let (control, fatal) = ControlChannel::spawn(
            control,
            Role::Responder,
            config.heartbeat,
            handler,
            cancel.child_token(),
        );

        let tunnel = Arc::new(Self {
            identity,
            public_addr,
            control,
            pending: PendingConnections::new(config.pending_capacity),
            active: ActiveConnections::new(),
            registry: Arc::clone(&registry),
            rendezvous_timeout: config.rendezvous_timeout,
            cancel,
            closing: AtomicBool::new(false),
            released: CancellationToken::new(),
            accept_task: Mutex::new(None),
        });

        // Registered before any task that can trigger teardown is running
        let replaced = registry.register(tunnel.agent_id(), tunnel.port(), Arc::clone(&tunnel));

        // Teardown awaits the accept task, so it must be stored before the
        // control watcher can start one
        let accept_task = tokio::spawn(Arc::clone(&tunnel).accept_loop(listener));
        *tunnel
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(accept_task);
        tokio::spawn(Arc::clone(&tunnel).watch_control(fatal));

        info!(
            agent_id = %tunnel.identity.id,
            agent_version = %tunnel.identity.version,
            os = %tunnel.identity.os,
            arch = %tunnel.identity.arch,
            agent_addr = ?tunnel.control.peer_addr(),
            public_addr = %public_addr,
            "Tunnel opened"
        );

        Ok((tunnel, replaced))
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn agent_id(&self) -> &str {
        &self.identity.id
    }

    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    pub fn port(&self) -> u16 {
        self.public_addr.port()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Number of public connections currently being served
    pub fn active_connections(&self) -> usize {
        self.active.len()
    }

    /// Hand a freshly attached data connection to the next rendezvous waiter
    pub fn offer(&self, connection: DataConnection) -> Result<(), OfferError> {
        if self.is_closing() {
            return Err(OfferError::TunnelClosed);
        }
        self.pending.offer(connection)
    }

    /// Ask the agent for a new data connection and wait for it to arrive.
    ///
    /// A failure to send the request tears the tunnel down; running out of
    /// time only fails this one call.
    pub async fn acquire_data_connection(
        self: &Arc<Self>,
    ) -> Result<DataConnection, RendezvousError> {
        if self.is_closing() {
            return Err(RendezvousError::TunnelClosed);
        }

        if let Err(e) = self.control.send(&Signal::new_connection_request()).await {
            self.shutdown("failed to request a data connection");
            return Err(RendezvousError::ControlChannel(e));
        }

        self.pending.take(self.rendezvous_timeout).await
    }

    /// Begin teardown. Only the first call has any effect; it returns
    /// immediately and the release sequence runs in the background.
    pub fn shutdown(self: &Arc<Self>, reason: &str) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }

        info!(
            agent_id = %self.identity.id,
            port = self.port(),
            reason = %reason,
            "Closing tunnel"
        );

        // Stops the public accept loop, the control channel and every splice.
        // The listener can therefore close before the registry entry is
        // removed; a port reused in that window evicts the stale entry in
        // `Registry::register`, and `remove` only drops a matching pair.
        self.cancel.cancel();
        tokio::spawn(Arc::clone(self).teardown());
        true
    }

    /// Resolves once teardown has released the public listener
    pub async fn wait_released(&self) {
        self.released.cancelled().await;
    }

    pub fn is_released(&self) -> bool {
        self.released.is_cancelled()
    }

    async fn teardown(self: Arc<Self>) {
        self.control.close().await;

        let drained = self.pending.close_and_drain().await;
        let aborted = self.active.abort_all();

        let unregistered = self.registry.remove(&self.identity.id, self.port());

        let accept_task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(accept_task) = accept_task {
            let _ = accept_task.await;
        }

        debug!(
            agent_id = %self.identity.id,
            port = self.port(),
            drained,
            aborted,
            unregistered,
            "Tunnel released"
        );
        self.released.cancel();
    }

    async fn watch_control(self: Arc<Self>, fatal: FatalReceiver) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            error = fatal => {
                if let Ok(error) = error {
                    warn!(agent_id = %self.identity.id, error = %error, "Control channel failed");
                    self.shutdown(&error.to_string());
                }
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let tunnel = Arc::clone(&self);
                    self.active
                        .spawn(async move { tunnel.serve_public(stream, peer_addr).await });
                }
                Err(e) => {
                    warn!(agent_id = %self.identity.id, error = %e, "Public accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
        debug!(agent_id = %self.identity.id, port = self.port(), "Public accept loop stopped");
    }

    async fn serve_public(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        debug!(agent_id = %self.identity.id, peer_addr = %peer_addr, "Public connection accepted");

        let data = match self.acquire_data_connection().await {
            Ok(data) => data,
            Err(e) => {
                // Dropping the stream resets the public client
                warn!(
                    agent_id = %self.identity.id,
                    peer_addr = %peer_addr,
                    error = %e,
                    "No data connection for public client"
                );
                return;
            }
        };

        debug!(
            agent_id = %self.identity.id,
            peer_addr = %peer_addr,
            data_addr = ?data.peer_addr(),
            "Splicing public connection"
        );
        let stats = splice(stream, data.into_io(), self.cancel.child_token()).await;
        debug!(
            agent_id = %self.identity.id,
            peer_addr = %peer_addr,
            bytes_in = stats.a_to_b,
            bytes_out = stats.b_to_a,
            "Public connection finished"
        );
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("agent_id", &self.identity.id)
            .field("public_addr", &self.public_addr)
            .field("closing", &self.is_closing())
            .finish()
    }
}

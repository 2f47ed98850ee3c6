//! Control channel dispatch loop

use crate::heartbeat::{Heartbeat, HeartbeatConfig, Role};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use transporter_connection::{
    FramedTransport, SignalReader, SignalWriter, TransportError, TransportResult,
};
use transporter_proto::{BootstrapRequest, Signal};

/// Upper bound for flushing the shutdown of a closing channel
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames read ahead of the dispatch loop
const FRAME_BACKLOG: usize = 16;

/// Fatal control channel conditions
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Heartbeat timeout ({role})")]
    HeartbeatTimeout { role: Role },

    #[error("Bootstrap rejected: {0}")]
    Rejected(String),

    #[error("Control channel closed")]
    Closed,
}

/// Receives the first fatal condition of a channel
pub type FatalReceiver = oneshot::Receiver<ChannelError>;

/// Consumer of the signals a control channel does not handle itself.
///
/// Called from the dispatch loop, so implementations must not block; spawn
/// for anything that waits on I/O.
pub trait SignalHandler: Send + Sync + 'static {
    fn on_signal(&self, signal: Signal);
}

/// One-shot sink for the first fatal condition; later reports are dropped
struct FatalSignal {
    tx: Mutex<Option<oneshot::Sender<ChannelError>>>,
}

impl FatalSignal {
    fn new() -> (Self, FatalReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Returns true if this was the first report
    fn report(&self, error: ChannelError) -> bool {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match tx {
            Some(tx) => {
                // Receiver may already be gone; the report still counts
                let _ = tx.send(error);
                true
            }
            None => false,
        }
    }
}

struct Inner {
    role: Role,
    peer_addr: Option<SocketAddr>,
    writer: tokio::sync::Mutex<SignalWriter>,
    fatal: FatalSignal,
    cancel: CancellationToken,
}

/// Handle to a running control channel
///
/// Cloning is cheap; all clones share the same connection.
#[derive(Clone)]
pub struct ControlChannel {
    inner: Arc<Inner>,
}

impl ControlChannel {
    /// Start the dispatch loop over an already handshaken transport.
    ///
    /// Cancelling `cancel` stops the loop without reporting a fatal error.
    pub fn spawn(
        transport: FramedTransport,
        role: Role,
        heartbeat: HeartbeatConfig,
        handler: Arc<dyn SignalHandler>,
        cancel: CancellationToken,
    ) -> (Self, FatalReceiver) {
        let peer_addr = transport.peer_addr();
        let (reader, writer) = transport.into_split();
        let (fatal, fatal_rx) = FatalSignal::new();

        let channel = Self {
            inner: Arc::new(Inner {
                role,
                peer_addr,
                writer: tokio::sync::Mutex::new(writer),
                fatal,
                cancel,
            }),
        };

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_BACKLOG);
        tokio::spawn(read_frames(reader, frame_tx, channel.inner.cancel.clone()));
        tokio::spawn(channel.clone().dispatch_loop(frame_rx, heartbeat, handler));

        (channel, fatal_rx)
    }

    /// Agent side: send `BootstrapReq` as the first frame, then start the loop
    pub async fn initiate(
        mut transport: FramedTransport,
        bootstrap: BootstrapRequest,
        heartbeat: HeartbeatConfig,
        handler: Arc<dyn SignalHandler>,
        cancel: CancellationToken,
    ) -> Result<(Self, FatalReceiver), ChannelError> {
        transport
            .write_signal(&Signal::BootstrapRequest(bootstrap))
            .await?;
        Ok(Self::spawn(
            transport,
            Role::Initiator,
            heartbeat,
            handler,
            cancel,
        ))
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Write one signal.
    ///
    /// A write failure is reported as the channel's fatal error and the
    /// caller gets [`ChannelError::Closed`].
    pub async fn send(&self, signal: &Signal) -> Result<(), ChannelError> {
        self.send_until(signal, None).await
    }

    /// Like [`ControlChannel::send`], but a write still pending at `deadline`
    /// is reported as a heartbeat timeout
    async fn send_until(
        &self,
        signal: &Signal,
        deadline: Option<Instant>,
    ) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let write = async {
            let mut writer = self.inner.writer.lock().await;
            writer.write_signal(signal).await
        };
        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        let result = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => return Err(ChannelError::Closed),
            result = write => result,
            _ = expired => {
                let role = self.inner.role;
                warn!(role = %role, signal = signal.kind(), "Heartbeat write stalled past its deadline");
                self.report_fatal(ChannelError::HeartbeatTimeout { role });
                return Err(ChannelError::Closed);
            }
        };

        result.map_err(|e| {
            warn!(role = %self.inner.role, error = %e, "Control channel write failed");
            self.report_fatal(ChannelError::Transport(e));
            ChannelError::Closed
        })
    }

    /// Report a fatal condition and stop the channel. Only the first report
    /// reaches the owner.
    pub fn report_fatal(&self, error: ChannelError) {
        if self.inner.fatal.report(error) {
            debug!(role = %self.inner.role, "Control channel failed");
        } else {
            trace!(role = %self.inner.role, "Ignoring repeated fatal report");
        }
        self.inner.cancel.cancel();
    }

    /// Stop the dispatch loop and close the sending side of the connection
    pub async fn close(&self) {
        self.inner.cancel.cancel();

        let shutdown = async {
            let mut writer = self.inner.writer.lock().await;
            writer.shutdown().await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Control channel shutdown failed"),
            Err(_) => debug!("Control channel shutdown timed out"),
        }
    }

    async fn dispatch_loop(
        self,
        mut frames: mpsc::Receiver<TransportResult<Signal>>,
        config: HeartbeatConfig,
        handler: Arc<dyn SignalHandler>,
    ) {
        let role = self.inner.role;
        let mut heartbeat = Heartbeat::new(role, config, Instant::now());

        let ping_interval = heartbeat
            .ping_interval()
            .unwrap_or(config.ping_interval)
            .max(Duration::from_millis(1));
        let mut ping_tick = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sends_pings = heartbeat.ping_interval().is_some();

        loop {
            let deadline = heartbeat.deadline();

            tokio::select! {
                biased;

                _ = self.inner.cancel.cancelled() => break,

                frame = frames.recv() => match frame {
                    Some(Ok(signal)) => {
                        if let Err(e) = self.dispatch(signal, &mut heartbeat, handler.as_ref()).await {
                            self.report_fatal(e);
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        self.report_fatal(ChannelError::Transport(e));
                        break;
                    }
                    None => {
                        self.report_fatal(ChannelError::Closed);
                        break;
                    }
                },

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!(role = %role, "Heartbeat timeout");
                    self.report_fatal(ChannelError::HeartbeatTimeout { role });
                    break;
                }

                _ = ping_tick.tick(), if sends_pings => {
                    trace!("Sending ping");
                    // Armed before writing so a stalled write still times out
                    let now = Instant::now();
                    heartbeat.on_ping_sent(now);
                    let write_deadline = heartbeat.write_deadline(now);
                    if self.send_until(&Signal::ping(), Some(write_deadline)).await.is_err() {
                        break;
                    }
                }
            }
        }

        self.inner.cancel.cancel();
        debug!(role = %role, "Control channel dispatch loop stopped");
    }

    async fn dispatch(
        &self,
        signal: Signal,
        heartbeat: &mut Heartbeat,
        handler: &dyn SignalHandler,
    ) -> Result<(), ChannelError> {
        match signal {
            Signal::Ping {} => {
                trace!("Received ping");
                let now = Instant::now();
                heartbeat.on_ping(now);
                self.send_until(&Signal::pong(), Some(heartbeat.write_deadline(now)))
                    .await?;
            }
            Signal::Pong {} => {
                trace!("Received pong");
                heartbeat.on_pong();
            }
            Signal::BootstrapResponse(response) if !response.is_accepted() => {
                return Err(ChannelError::Rejected(response.error));
            }
            signal @ (Signal::BootstrapResponse(_)
            | Signal::NewConnectionRequest(_)
            | Signal::NewConnectionResponse(_)) => handler.on_signal(signal),
            other => {
                warn!(
                    role = %self.inner.role,
                    signal = other.kind(),
                    "Ignoring unexpected signal on control channel"
                );
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("role", &self.inner.role)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Pump frames into the dispatch loop so that a timer firing never drops a
/// partially read frame
async fn read_frames(
    mut reader: SignalReader,
    frames: mpsc::Sender<TransportResult<Signal>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            frame = reader.read_signal() => frame,
        };

        let failed = frame.is_err();
        if frames.send(frame).await.is_err() || failed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use transporter_proto::{AgentIdentity, CodecError, NewConnectionResponse};

    struct Recorder(mpsc::UnboundedSender<Signal>);

    impl SignalHandler for Recorder {
        fn on_signal(&self, signal: Signal) {
            let _ = self.0.send(signal);
        }
    }

    fn recorder() -> (Arc<dyn SignalHandler>, mpsc::UnboundedReceiver<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder(tx)), rx)
    }

    fn pipe() -> (FramedTransport, DuplexStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (FramedTransport::new(a), b)
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_liveness_both_ends() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (h1, _r1) = recorder();
        let (h2, _r2) = recorder();

        let (_initiator, mut initiator_fatal) = ControlChannel::spawn(
            FramedTransport::new(a),
            Role::Initiator,
            HeartbeatConfig::default(),
            h1,
            CancellationToken::new(),
        );
        let (_responder, mut responder_fatal) = ControlChannel::spawn(
            FramedTransport::new(b),
            Role::Responder,
            HeartbeatConfig::default(),
            h2,
            CancellationToken::new(),
        );

        tokio::time::sleep(Duration::from_secs(300)).await;

        assert!(matches!(
            initiator_fatal.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
        assert!(matches!(
            responder_fatal.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiator_times_out_without_pong() {
        let (transport, _silent_peer) = pipe();
        let (handler, _rx) = recorder();
        let start = Instant::now();

        let (_channel, fatal) = ControlChannel::spawn(
            transport,
            Role::Initiator,
            HeartbeatConfig::default(),
            handler,
            CancellationToken::new(),
        );

        let error = fatal.await.unwrap();
        assert!(matches!(
            error,
            ChannelError::HeartbeatTimeout {
                role: Role::Initiator
            }
        ));

        // First ping at 10s, unanswered for 10s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(20));
        assert!(elapsed <= Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiator_times_out_when_ping_write_stalls() {
        // Smaller than one ping frame, and the peer never reads
        let (a, _stalled_peer) = tokio::io::duplex(16);
        let (handler, _rx) = recorder();
        let start = Instant::now();

        let (_channel, fatal) = ControlChannel::spawn(
            FramedTransport::new(a),
            Role::Initiator,
            HeartbeatConfig::default(),
            handler,
            CancellationToken::new(),
        );

        let error = tokio::time::timeout(Duration::from_secs(300), fatal)
            .await
            .expect("stalled ping should time out")
            .unwrap();
        assert!(matches!(
            error,
            ChannelError::HeartbeatTimeout {
                role: Role::Initiator
            }
        ));
        assert!(start.elapsed() <= Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_times_out_when_pong_write_stalls() {
        let (b, peer) = tokio::io::duplex(16);
        let (handler, _rx) = recorder();

        let (_channel, fatal) = ControlChannel::spawn(
            FramedTransport::new(b),
            Role::Responder,
            HeartbeatConfig::default(),
            handler,
            CancellationToken::new(),
        );

        // The peer sends one ping and then stops reading
        let mut peer = FramedTransport::new(peer);
        peer.write_signal(&Signal::ping()).await.unwrap();
        let pinged = Instant::now();

        let error = tokio::time::timeout(Duration::from_secs(300), fatal)
            .await
            .expect("stalled pong should time out")
            .unwrap();
        assert!(matches!(
            error,
            ChannelError::HeartbeatTimeout {
                role: Role::Responder
            }
        ));
        assert!(pinged.elapsed() <= Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_times_out_without_ping() {
        let (transport, _silent_peer) = pipe();
        let (handler, _rx) = recorder();
        let start = Instant::now();

        let (_channel, fatal) = ControlChannel::spawn(
            transport,
            Role::Responder,
            HeartbeatConfig::default(),
            handler,
            CancellationToken::new(),
        );

        let error = fatal.await.unwrap();
        assert!(matches!(
            error,
            ChannelError::HeartbeatTimeout {
                role: Role::Responder
            }
        ));
        assert!(start.elapsed() <= Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_answers_pings_and_stays_alive() {
        let (transport, peer) = pipe();
        let (handler, _rx) = recorder();

        let (_channel, mut fatal) = ControlChannel::spawn(
            transport,
            Role::Responder,
            HeartbeatConfig::default(),
            handler,
            CancellationToken::new(),
        );

        let mut peer = FramedTransport::new(peer);
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(25)).await;
            peer.write_signal(&Signal::ping()).await.unwrap();
            assert_eq!(peer.read_signal().await.unwrap(), Signal::pong());
        }

        assert!(matches!(
            fatal.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_fatal() {
        let (transport, mut peer) = pipe();
        let (handler, _rx) = recorder();

        let (channel, fatal) = ControlChannel::spawn(
            transport,
            Role::Responder,
            HeartbeatConfig::default(),
            handler,
            CancellationToken::new(),
        );

        let payload = br#"{"Type":"Launch","Payload":{}}"#;
        peer.write_u64_le(payload.len() as u64).await.unwrap();
        peer.write_all(payload).await.unwrap();

        assert!(matches!(
            fatal.await.unwrap(),
            ChannelError::Transport(TransportError::Codec(CodecError::UnknownSignalType(_)))
        ));
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_unexpected_signal_is_ignored() {
        let (transport, peer) = pipe();
        let (handler, mut received) = recorder();

        let (_channel, mut fatal) = ControlChannel::spawn(
            transport,
            Role::Responder,
            HeartbeatConfig::default(),
            handler,
            CancellationToken::new(),
        );

        let mut peer = FramedTransport::new(peer);
        let identity = AgentIdentity::local("agent-x");
        peer.write_signal(&Signal::BootstrapRequest(BootstrapRequest::new(&identity, "")))
            .await
            .unwrap();
        let response = Signal::NewConnectionResponse(NewConnectionResponse::new("agent-x", ""));
        peer.write_signal(&response).await.unwrap();

        assert_eq!(received.recv().await.unwrap(), response);
        assert!(matches!(
            fatal.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_rejected_bootstrap_is_fatal() {
        let (transport, peer) = pipe();
        let (handler, mut received) = recorder();

        let (_channel, fatal) = ControlChannel::spawn(
            transport,
            Role::Initiator,
            HeartbeatConfig::default(),
            handler,
            CancellationToken::new(),
        );

        let mut peer = FramedTransport::new(peer);
        peer.write_signal(&Signal::bootstrap_accepted()).await.unwrap();
        assert_eq!(received.recv().await.unwrap(), Signal::bootstrap_accepted());

        peer.write_signal(&Signal::bootstrap_rejected("invalid token"))
            .await
            .unwrap();
        match fatal.await.unwrap() {
            ChannelError::Rejected(reason) => assert_eq!(reason, "invalid token"),
            other => panic!("Expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fatal_is_reported_once() {
        let (transport, _peer) = pipe();
        let (handler, _rx) = recorder();

        let (channel, fatal) = ControlChannel::spawn(
            transport,
            Role::Responder,
            HeartbeatConfig::default(),
            handler,
            CancellationToken::new(),
        );

        channel.report_fatal(ChannelError::Rejected("first".to_string()));
        channel.report_fatal(ChannelError::Rejected("second".to_string()));
        channel.report_fatal(ChannelError::Closed);

        match fatal.await.unwrap() {
            ChannelError::Rejected(reason) => assert_eq!(reason, "first"),
            other => panic!("Expected first report, got {:?}", other),
        }
        assert!(matches!(
            channel.send(&Signal::ping()).await,
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_initiate_sends_bootstrap_first() {
        let (transport, peer) = pipe();
        let (handler, _rx) = recorder();
        let identity = AgentIdentity::local("agent-7");

        let (channel, _fatal) = ControlChannel::initiate(
            transport,
            BootstrapRequest::new(&identity, "tok"),
            HeartbeatConfig::default(),
            handler,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(channel.role(), Role::Initiator);

        let mut peer = FramedTransport::new(peer);
        match peer.read_signal().await.unwrap() {
            Signal::BootstrapRequest(request) => {
                assert_eq!(request.agent_id, "agent-7");
                assert_eq!(request.static_token, "tok");
            }
            other => panic!("Expected BootstrapRequest, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_shuts_down_peer_and_stops_silently() {
        let (transport, peer) = pipe();
        let (handler, _rx) = recorder();

        let (channel, mut fatal) = ControlChannel::spawn(
            transport,
            Role::Responder,
            HeartbeatConfig::default(),
            handler,
            CancellationToken::new(),
        );
        channel.close().await;

        let mut peer = FramedTransport::new(peer);
        assert!(matches!(
            peer.read_signal().await,
            Err(TransportError::ConnectionClosed)
        ));
        assert!(channel.is_closed());
        assert!(matches!(
            fatal.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
    }
}

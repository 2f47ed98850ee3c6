//! Rendezvous queue for data connections supplied by an agent

use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use transporter_connection::{BoxedIo, FramedTransport};
use transporter_control::ChannelError;

/// Why a rendezvous produced no data connection
#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("No data connection arrived within {0:?}")]
    ProvisioningTimeout(Duration),

    #[error("Tunnel closed")]
    TunnelClosed,

    #[error("Control channel failed: {0}")]
    ControlChannel(#[from] ChannelError),
}

/// Why a supplied data connection was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OfferError {
    #[error("Pending connection queue is full")]
    QueueFull,

    #[error("Tunnel closed")]
    TunnelClosed,
}

/// An agent-originated connection whose `NewConnResp` has already been read.
/// Everything left on the stream is payload for exactly one splice.
#[derive(Debug)]
pub struct DataConnection {
    transport: FramedTransport,
}

impl DataConnection {
    pub fn new(transport: FramedTransport) -> Self {
        Self { transport }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.transport.peer_addr()
    }

    pub fn into_io(self) -> BoxedIo {
        self.transport.into_inner()
    }
}

/// Bounded FIFO between the inbound dispatch path (producer) and rendezvous
/// waiters (consumers)
pub struct PendingConnections {
    sender: Mutex<Option<mpsc::Sender<DataConnection>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<DataConnection>>,
    closed: CancellationToken,
}

impl PendingConnections {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: tokio::sync::Mutex::new(receiver),
            closed: CancellationToken::new(),
        }
    }

    /// Queue a connection without waiting. On error the connection is dropped.
    pub fn offer(&self, connection: DataConnection) -> Result<(), OfferError> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = sender.as_ref().ok_or(OfferError::TunnelClosed)?;

        sender.try_send(connection).map_err(|e| match e {
            TrySendError::Full(_) => OfferError::QueueFull,
            TrySendError::Closed(_) => OfferError::TunnelClosed,
        })
    }

    /// Wait up to `timeout` for the next connection. Each queued connection
    /// is handed to exactly one caller.
    pub async fn take(&self, timeout: Duration) -> Result<DataConnection, RendezvousError> {
        let next = async {
            let mut receiver = self.receiver.lock().await;
            receiver.recv().await
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(RendezvousError::TunnelClosed),
            connection = next => connection.ok_or(RendezvousError::TunnelClosed),
            _ = tokio::time::sleep(timeout) => Err(RendezvousError::ProvisioningTimeout(timeout)),
        }
    }

    /// Refuse further offers, wake every waiter and close whatever was queued.
    /// Returns the number of connections discarded.
    pub async fn close_and_drain(&self) -> usize {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.closed.cancel();

        let mut receiver = self.receiver.lock().await;
        receiver.close();

        let mut drained = 0;
        while let Ok(connection) = receiver.try_recv() {
            drop(connection);
            drained += 1;
        }
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl std::fmt::Debug for PendingConnections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConnections")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

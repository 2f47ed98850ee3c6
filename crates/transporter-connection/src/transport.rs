//! Length-prefixed signal framing over a raw byte stream

use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use transporter_proto::{CodecError, Signal, SignalCodec};

/// Keep-alive period applied to every agent/server TCP connection
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    Tls(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Any bidirectional byte stream a transport can sit on (TCP, TLS, in-memory pipe)
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedIo = Box<dyn AsyncIo>;

/// Enable TCP keep-alive on a freshly dialed or accepted socket
pub fn tune_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Read exactly one signal frame
pub async fn read_frame<R>(reader: &mut R) -> TransportResult<Signal>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let length = match reader.read_u64_le().await {
        Ok(length) => length,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            return Err(TransportError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    };

    let length = SignalCodec::check_length(length)?;
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(SignalCodec::decode_payload(&payload)?)
}

/// Write exactly one signal frame and flush it
pub async fn write_frame<W>(writer: &mut W, signal: &Signal) -> TransportResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = SignalCodec::encode(signal)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// A connection that speaks framed signals
///
/// Reads never buffer past the end of the current frame, so after the first
/// signal of a data connection the remaining bytes on the stream belong to the
/// spliced payload.
pub struct FramedTransport {
    io: BoxedIo,
    peer_addr: Option<SocketAddr>,
}

impl FramedTransport {
    pub fn new<T: AsyncIo>(io: T) -> Self {
        Self {
            io: Box::new(io),
            peer_addr: None,
        }
    }

    /// Wrap a TCP stream, applying keep-alive tuning
    pub fn from_tcp(stream: TcpStream) -> Self {
        if let Err(e) = tune_keepalive(&stream) {
            tracing::debug!(error = %e, "Failed to enable TCP keep-alive");
        }
        let peer_addr = stream.peer_addr().ok();
        Self {
            io: Box::new(stream),
            peer_addr,
        }
    }

    pub fn with_peer_addr(mut self, peer_addr: SocketAddr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub async fn read_signal(&mut self) -> TransportResult<Signal> {
        read_frame(&mut self.io).await
    }

    pub async fn write_signal(&mut self, signal: &Signal) -> TransportResult<()> {
        write_frame(&mut self.io, signal).await
    }

    /// Close the sending side of the connection
    pub async fn shutdown(&mut self) -> TransportResult<()> {
        self.io.shutdown().await?;
        Ok(())
    }

    /// Split into independently owned read and write halves
    pub fn into_split(self) -> (SignalReader, SignalWriter) {
        let (reader, writer) = tokio::io::split(self.io);
        (SignalReader { inner: reader }, SignalWriter { inner: writer })
    }

    /// Give up framing and return the raw stream (used once a data connection is attached)
    pub fn into_inner(self) -> BoxedIo {
        self.io
    }
}

impl fmt::Debug for FramedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedTransport")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// Read half of a split [`FramedTransport`]
pub struct SignalReader {
    inner: ReadHalf<BoxedIo>,
}

impl SignalReader {
    pub async fn read_signal(&mut self) -> TransportResult<Signal> {
        read_frame(&mut self.inner).await
    }
}

/// Write half of a split [`FramedTransport`]
pub struct SignalWriter {
    inner: WriteHalf<BoxedIo>,
}

impl SignalWriter {
    pub async fn write_signal(&mut self, signal: &Signal) -> TransportResult<()> {
        write_frame(&mut self.inner, signal).await
    }

    pub async fn shutdown(&mut self) -> TransportResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transporter_proto::{NewConnectionResponse, LENGTH_PREFIX_SIZE};

    #[tokio::test]
    async fn test_signal_round_trip_over_pipe() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = FramedTransport::new(a);
        let mut right = FramedTransport::new(b);

        let signal = Signal::NewConnectionResponse(NewConnectionResponse::new("agent-1", "t"));
        left.write_signal(&signal).await.unwrap();
        left.write_signal(&Signal::ping()).await.unwrap();

        assert_eq!(right.read_signal().await.unwrap(), signal);
        assert_eq!(right.read_signal().await.unwrap(), Signal::ping());
    }

    #[tokio::test]
    async fn test_eof_reports_connection_closed() {
        let (a, b) = tokio::io::duplex(64);
        let mut reader = FramedTransport::new(b);
        drop(a);

        assert!(matches!(
            reader.read_signal().await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_unknown_type_is_a_codec_error() {
        let (mut a, b) = tokio::io::duplex(256);
        let mut reader = FramedTransport::new(b);

        let payload = br#"{"Type":"Reboot","Payload":{}}"#;
        a.write_u64_le(payload.len() as u64).await.unwrap();
        a.write_all(payload).await.unwrap();

        assert!(matches!(
            reader.read_signal().await,
            Err(TransportError::Codec(CodecError::UnknownSignalType(_)))
        ));
    }

    #[tokio::test]
    async fn test_reads_stop_at_frame_boundary() {
        let (mut a, b) = tokio::io::duplex(256);

        let frame = SignalCodec::encode(&Signal::pong()).unwrap();
        a.write_all(&frame).await.unwrap();
        a.write_all(b"raw payload").await.unwrap();
        drop(a);

        let mut transport = FramedTransport::new(b);
        assert_eq!(transport.read_signal().await.unwrap(), Signal::pong());

        let mut rest = Vec::new();
        transport.into_inner().read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"raw payload");
        assert!(frame.len() > LENGTH_PREFIX_SIZE);
    }

    #[tokio::test]
    async fn test_split_halves() {
        let (a, b) = tokio::io::duplex(256);
        let (mut reader, mut writer) = FramedTransport::new(a).into_split();
        let mut peer = FramedTransport::new(b);

        writer.write_signal(&Signal::ping()).await.unwrap();
        assert_eq!(peer.read_signal().await.unwrap(), Signal::ping());

        peer.write_signal(&Signal::pong()).await.unwrap();
        assert_eq!(reader.read_signal().await.unwrap(), Signal::pong());

        writer.shutdown().await.unwrap();
        assert!(matches!(
            peer.read_signal().await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}

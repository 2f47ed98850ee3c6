//! Connection plumbing shared by agent and server
//!
//! Framed signal I/O over any async byte stream, plain or mutual-TLS dialing
//! and accepting, and the splice engine that joins two connections.

pub mod splice;
pub mod tls;
pub mod transport;

pub use splice::{splice, SpliceStats};
pub use tls::{Acceptor, Connector, TlsFiles};
pub use transport::{
    tune_keepalive, AsyncIo, BoxedIo, FramedTransport, SignalReader, SignalWriter,
    TransportError, TransportResult,
};

//! Server side of the tunnel
//!
//! A single agent listener accepts both control and data connections. Each
//! successful bootstrap opens a [`Tunnel`] with its own public listener; every
//! public connection is served by asking the agent for a fresh data connection
//! and splicing the two together.

pub mod active;
pub mod pending;
pub mod registry;
pub mod server;
pub mod tunnel;

pub use active::ActiveConnections;
pub use pending::{DataConnection, OfferError, PendingConnections, RendezvousError};
pub use registry::{Registry, TunnelRegistry};
pub use server::{ServerConfig, ServerError, TunnelServer};
pub use tunnel::{Tunnel, TunnelConfig};

//! Control channel between an agent and the server
//!
//! One long-lived connection per tunnel carries the handshake, the heartbeat
//! and the requests for new data connections. Any fatal condition on it is
//! reported exactly once to the owner.

pub mod channel;
pub mod heartbeat;

pub use channel::{ChannelError, ControlChannel, FatalReceiver, SignalHandler};
pub use heartbeat::{Heartbeat, HeartbeatConfig, Role};

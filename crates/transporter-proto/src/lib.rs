//! Tunnel signal protocol
//!
//! Defines the signals exchanged between agent and server on every connection,
//! and the length-prefixed codec that frames them.

pub mod codec;
pub mod signal;

pub use codec::{CodecError, SignalCodec};
pub use signal::*;

/// Maximum payload size of a single frame (16MB)
pub const MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

/// Size of the little-endian length prefix in front of every frame
pub const LENGTH_PREFIX_SIZE: usize = 8;

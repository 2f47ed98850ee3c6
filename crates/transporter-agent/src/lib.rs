//! Agent side of the tunnel
//!
//! Keeps one control connection to the server alive forever and answers each
//! `NewConnReq` by dialing the local service and attaching a fresh data
//! connection to the server.

pub mod agent;
pub mod provision;

pub use agent::{Agent, AgentConfig, AgentError};
pub use provision::{provision_data_connection, ProvisionError};

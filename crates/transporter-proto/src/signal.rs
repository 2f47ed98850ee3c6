//! Signal types carried on control and data connections

use serde::{Deserialize, Serialize};

/// Wire tags of every known signal, in declaration order
pub const SIGNAL_TAGS: [&str; 6] = [
    "Ping",
    "Pong",
    "BootstrapReq",
    "BootstrapResp",
    "NewConnReq",
    "NewConnResp",
];

/// A single message exchanged between agent and server.
///
/// Serialized as `{"Type": <tag>, "Payload": {...}}`. Variants without fields
/// still carry an empty payload object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Type", content = "Payload")]
pub enum Signal {
    /// Liveness probe sent by the initiator of a control channel
    Ping {},
    /// Answer to a `Ping`
    Pong {},
    /// First frame of a control connection
    #[serde(rename = "BootstrapReq")]
    BootstrapRequest(BootstrapRequest),
    /// Server verdict on a bootstrap; an empty error means success
    #[serde(rename = "BootstrapResp")]
    BootstrapResponse(BootstrapResponse),
    /// Server asks the agent for a fresh data connection
    #[serde(rename = "NewConnReq")]
    NewConnectionRequest(NewConnectionRequest),
    /// First frame of a data connection
    #[serde(rename = "NewConnResp")]
    NewConnectionResponse(NewConnectionResponse),
}

impl Signal {
    pub fn ping() -> Self {
        Signal::Ping {}
    }

    pub fn pong() -> Self {
        Signal::Pong {}
    }

    pub fn new_connection_request() -> Self {
        Signal::NewConnectionRequest(NewConnectionRequest {})
    }

    pub fn bootstrap_accepted() -> Self {
        Signal::BootstrapResponse(BootstrapResponse {
            error: String::new(),
        })
    }

    pub fn bootstrap_rejected(reason: impl Into<String>) -> Self {
        Signal::BootstrapResponse(BootstrapResponse {
            error: reason.into(),
        })
    }

    /// The wire tag of this signal
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Ping {} => SIGNAL_TAGS[0],
            Signal::Pong {} => SIGNAL_TAGS[1],
            Signal::BootstrapRequest(_) => SIGNAL_TAGS[2],
            Signal::BootstrapResponse(_) => SIGNAL_TAGS[3],
            Signal::NewConnectionRequest(_) => SIGNAL_TAGS[4],
            Signal::NewConnectionResponse(_) => SIGNAL_TAGS[5],
        }
    }
}

/// Identity an agent presents at bootstrap. `id` is the routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentIdentity {
    pub id: String,
    pub version: String,
    pub os: String,
    pub arch: String,
}

impl AgentIdentity {
    /// Identity of the running process with the given agent id
    pub fn local(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BootstrapRequest {
    pub agent_version: String,
    pub agent_id: String,
    #[serde(rename = "OS")]
    pub os: String,
    pub arch: String,
    pub static_token: String,
}

impl BootstrapRequest {
    pub fn new(identity: &AgentIdentity, static_token: impl Into<String>) -> Self {
        Self {
            agent_version: identity.version.clone(),
            agent_id: identity.id.clone(),
            os: identity.os.clone(),
            arch: identity.arch.clone(),
            static_token: static_token.into(),
        }
    }

    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity {
            id: self.agent_id.clone(),
            version: self.agent_version.clone(),
            os: self.os.clone(),
            arch: self.arch.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BootstrapResponse {
    pub error: String,
}

impl BootstrapResponse {
    pub fn is_accepted(&self) -> bool {
        self.error.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewConnectionRequest {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NewConnectionResponse {
    pub agent_id: String,
    pub static_token: String,
    pub error: String,
}

impl NewConnectionResponse {
    pub fn new(agent_id: impl Into<String>, static_token: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            static_token: static_token.into(),
            error: String::new(),
        }
    }
}

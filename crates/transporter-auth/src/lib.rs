//! Authentication policy for bootstrap and data-connection attach
//!
//! The same [`Authenticator`] is evaluated when an agent bootstraps a tunnel
//! and again each time it attaches a data connection. In certificate mode the
//! peer was already verified during the TLS handshake, so the signal-level
//! check always passes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Authentication mode as named in configuration files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    #[default]
    None,
    StaticToken,
    Certificate,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthMode::None => "none",
            AuthMode::StaticToken => "static-token",
            AuthMode::Certificate => "certificate",
        };
        f.write_str(name)
    }
}

/// Authentication errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid static token")]
    InvalidToken,

    #[error("Missing static token")]
    MissingToken,
}

/// Resolved authentication policy
#[derive(Clone, PartialEq, Eq)]
pub enum Authenticator {
    /// Every peer is accepted
    None,
    /// Peers must present exactly this secret
    StaticToken(String),
    /// Peers are verified by mutual TLS before any signal is read
    Certificate,
}

impl Authenticator {
    pub fn static_token(token: impl Into<String>) -> Self {
        Authenticator::StaticToken(token.into())
    }

    pub fn mode(&self) -> AuthMode {
        match self {
            Authenticator::None => AuthMode::None,
            Authenticator::StaticToken(_) => AuthMode::StaticToken,
            Authenticator::Certificate => AuthMode::Certificate,
        }
    }

    /// Check the token a peer presented in `BootstrapReq` or `NewConnResp`
    pub fn verify(&self, presented: &str) -> Result<(), AuthError> {
        match self {
            Authenticator::None | Authenticator::Certificate => Ok(()),
            Authenticator::StaticToken(_) if presented.is_empty() => Err(AuthError::MissingToken),
            Authenticator::StaticToken(expected) if expected == presented => Ok(()),
            Authenticator::StaticToken(_) => Err(AuthError::InvalidToken),
        }
    }

    /// The token this side presents to its peer (empty unless static-token)
    pub fn token(&self) -> &str {
        match self {
            Authenticator::StaticToken(token) => token,
            _ => "",
        }
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authenticator::None => f.write_str("None"),
            Authenticator::StaticToken(_) => f.write_str("StaticToken(<redacted>)"),
            Authenticator::Certificate => f.write_str("Certificate"),
        }
    }
}

use crate::provision::provision_data_connection;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transporter_auth::Authenticator;
use transporter_connection::{Connector, TlsFiles, TransportError};
use transporter_control::{ChannelError, ControlChannel, HeartbeatConfig, SignalHandler};
use transporter_proto::{AgentIdentity, BootstrapRequest, NewConnectionResponse, Signal};

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Failed to connect to server {address}: {source}")]
    Dial {
        address: String,
        source: TransportError,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Control channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identity presented at bootstrap; `identity.id` is the routing key
    pub identity: AgentIdentity,

    /// Server agent listener (host:port)
    pub server_addr: String,

    /// Service that public traffic is forwarded to (host:port)
    pub local_addr: String,

    pub auth: Authenticator,

    pub connector: Connector,

    /// Fixed pause between reconnect attempts
    pub reconnect_delay: Duration,

    pub heartbeat: HeartbeatConfig,
}

impl AgentConfig {
    pub fn new(
        identity: AgentIdentity,
        server_addr: impl Into<String>,
        local_addr: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            server_addr: server_addr.into(),
            local_addr: local_addr.into(),
            auth: Authenticator::None,
            connector: Connector::plain(),
            reconnect_delay: Duration::from_secs(5),
            heartbeat: HeartbeatConfig::default(),
        }
    }

    pub fn with_static_token(mut self, token: impl Into<String>) -> Self {
        self.auth = Authenticator::static_token(token);
        self
    }

    /// Dial the server over mutual TLS, verifying it as `server_name`
    pub fn with_certificate_auth(
        mut self,
        files: &TlsFiles,
        server_name: &str,
    ) -> Result<Self, AgentError> {
        self.connector =
            Connector::mutual_tls(files, server_name).map_err(|e| AgentError::Tls(e.to_string()))?;
        self.auth = Authenticator::Certificate;
        Ok(self)
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    fn validate(&self) -> Result<(), AgentError> {
        if self.identity.id.trim().is_empty() {
            return Err(AgentError::InvalidConfig("agent id is empty".to_string()));
        }
        if self.server_addr.trim().is_empty() {
            return Err(AgentError::InvalidConfig(
                "server endpoint is empty".to_string(),
            ));
        }
        if self.local_addr.trim().is_empty() {
            return Err(AgentError::InvalidConfig(
                "local endpoint is empty".to_string(),
            ));
        }
        if self.heartbeat.ping_interval.is_zero() || self.heartbeat.pong_timeout.is_zero() {
            return Err(AgentError::InvalidConfig(
                "heartbeat intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Answers `NewConnReq` on the control channel
struct Provisioner {
    config: Arc<AgentConfig>,
    cancel: CancellationToken,
}

impl SignalHandler for Provisioner {
    fn on_signal(&self, signal: Signal) {
        match signal {
            Signal::NewConnectionRequest(_) => {
                let config = Arc::clone(&self.config);
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    let response = NewConnectionResponse::new(
                        config.identity.id.clone(),
                        config.auth.token(),
                    );
                    match provision_data_connection(
                        &config.local_addr,
                        &config.server_addr,
                        &config.connector,
                        response,
                        cancel,
                    )
                    .await
                    {
                        Ok(stats) => debug!(
                            bytes_to_local = stats.a_to_b,
                            bytes_to_server = stats.b_to_a,
                            "Data connection finished"
                        ),
                        Err(e) => warn!(error = %e, "Data connection failed"),
                    }
                });
            }
            Signal::BootstrapResponse(_) => info!("Bootstrap accepted by server"),
            other => debug!(signal = other.kind(), "Ignoring signal on agent control channel"),
        }
    }
}

/// The tunnel agent
pub struct Agent {
    config: Arc<AgentConfig>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Keep a control connection up until `shutdown` fires.
    ///
    /// Every failure, including a rejected bootstrap, is followed by the same
    /// fixed delay and a fresh attempt.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            match self.run_once(&shutdown).await {
                Ok(()) => break,
                Err(e) => warn!(
                    agent_id = %self.config.identity.id,
                    attempt,
                    error = %e,
                    retry_in = ?self.config.reconnect_delay,
                    "Control connection lost"
                ),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        info!(agent_id = %self.config.identity.id, "Agent stopped");
    }

    /// One control session: dial, bootstrap, then wait for the first fatal
    /// condition. Returns `Ok(())` only when `shutdown` fired.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<(), AgentError> {
        let config = &self.config;

        let transport = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            dialed = config.connector.connect(&config.server_addr) => {
                dialed.map_err(|source| AgentError::Dial {
                    address: config.server_addr.clone(),
                    source,
                })?
            }
        };

        let handler = Arc::new(Provisioner {
            config: Arc::clone(config),
            cancel: shutdown.clone(),
        });
        let session = shutdown.child_token();
        let (channel, fatal) = ControlChannel::initiate(
            transport,
            BootstrapRequest::new(&config.identity, config.auth.token()),
            config.heartbeat,
            handler,
            session.clone(),
        )
        .await?;

        info!(
            agent_id = %config.identity.id,
            server = %config.server_addr,
            local = %config.local_addr,
            "Connected to server"
        );

        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Ok(()),
            error = fatal => Err(error.unwrap_or(ChannelError::Closed).into()),
        };

        channel.close().await;
        result
    }
}

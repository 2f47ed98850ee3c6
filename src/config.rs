//! YAML configuration file
//!
//! One file carries the log level plus a `server` and/or `agent` section.
//! Sections are resolved into the explicit config structs of the server and
//! agent crates; nothing here is global.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use transporter_agent::AgentConfig;
use transporter_auth::AuthMode;
use transporter_connection::TlsFiles;
use transporter_control::HeartbeatConfig;
use transporter_proto::AgentIdentity;
use transporter_server::{ServerConfig, TunnelConfig};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigFile {
    #[serde(default)]
    pub log: LogSection,
    pub server: Option<ServerSection>,
    pub agent: Option<AgentSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerSection {
    pub agent_port: u16,
    #[serde(default = "default_public_bind_address")]
    pub public_bind_address: IpAddr,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_rendezvous_timeout_secs")]
    pub rendezvous_timeout_secs: u64,
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
    #[serde(default)]
    pub authentication: ServerAuthentication,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerAuthentication {
    #[serde(rename = "type", default)]
    pub mode: AuthMode,
    pub static_token: Option<StaticTokenSection>,
    pub certificate: Option<ServerCertificateSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StaticTokenSection {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerCertificateSection {
    pub ca_certificate_path: PathBuf,
    pub server_certificate_path: PathBuf,
    pub server_certificate_key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AgentSection {
    /// Generated when omitted
    pub id: Option<String>,
    pub server_endpoint: String,
    pub local_endpoint: String,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    #[serde(default)]
    pub authentication: AgentAuthentication,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AgentAuthentication {
    #[serde(rename = "type", default)]
    pub mode: AuthMode,
    pub static_token: Option<StaticTokenSection>,
    pub certificate: Option<AgentCertificateSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AgentCertificateSection {
    pub ca_certificate_path: PathBuf,
    pub agent_certificate_path: PathBuf,
    pub agent_certificate_key_path: PathBuf,
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_public_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_rendezvous_timeout_secs() -> u64 {
    10
}

fn default_pending_capacity() -> usize {
    10
}

fn default_ping_timeout_secs() -> u64 {
    30
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_ping_interval_secs() -> u64 {
    10
}

fn default_pong_timeout_secs() -> u64 {
    10
}

fn default_server_name() -> String {
    "localhost".to_string()
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }
}

/// Token of a `static-token` section, rejecting blank secrets
fn static_token(section: Option<&StaticTokenSection>) -> Result<&str> {
    let section = section
        .context("authentication type is static-token but the `static-token` section is missing")?;
    if section.token.trim().is_empty() {
        bail!("static-token authentication requires a non-empty token");
    }
    Ok(&section.token)
}

fn positive_secs(name: &str, secs: u64) -> Result<Duration> {
    if secs == 0 {
        bail!("{} must be greater than zero", name);
    }
    Ok(Duration::from_secs(secs))
}

impl ServerSection {
    pub fn to_server_config(&self) -> Result<ServerConfig> {
        if self.pending_capacity == 0 {
            bail!("pending-capacity must be greater than zero");
        }

        let tunnel = TunnelConfig {
            rendezvous_timeout: positive_secs(
                "rendezvous-timeout-secs",
                self.rendezvous_timeout_secs,
            )?,
            pending_capacity: self.pending_capacity,
            heartbeat: HeartbeatConfig {
                ping_timeout: positive_secs("ping-timeout-secs", self.ping_timeout_secs)?,
                ..HeartbeatConfig::default()
            },
        };

        let agent_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.agent_port);
        let config = ServerConfig::new(agent_addr)
            .with_public_bind_addr(self.public_bind_address)
            .with_handshake_timeout(positive_secs(
                "handshake-timeout-secs",
                self.handshake_timeout_secs,
            )?)
            .with_tunnel_config(tunnel);

        let auth = &self.authentication;
        match auth.mode {
            AuthMode::None => Ok(config),
            AuthMode::StaticToken => {
                Ok(config.with_static_token(static_token(auth.static_token.as_ref())?))
            }
            AuthMode::Certificate => {
                let certificate = auth.certificate.as_ref().context(
                    "authentication type is certificate but the `certificate` section is missing",
                )?;
                let files = TlsFiles {
                    ca_certificate: certificate.ca_certificate_path.clone(),
                    certificate: certificate.server_certificate_path.clone(),
                    private_key: certificate.server_certificate_key_path.clone(),
                };
                config
                    .with_certificate_auth(&files)
                    .context("Failed to load server TLS material")
            }
        }
    }
}

impl AgentSection {
    pub fn to_agent_config(&self) -> Result<AgentConfig> {
        let id = match &self.id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => format!("agent-{}", uuid::Uuid::new_v4()),
        };
        if self.server_endpoint.trim().is_empty() {
            bail!("agent server-endpoint must not be empty");
        }
        if self.local_endpoint.trim().is_empty() {
            bail!("agent local-endpoint must not be empty");
        }

        let heartbeat = HeartbeatConfig {
            ping_interval: positive_secs("ping-interval-secs", self.ping_interval_secs)?,
            pong_timeout: positive_secs("pong-timeout-secs", self.pong_timeout_secs)?,
            ..HeartbeatConfig::default()
        };

        let config = AgentConfig::new(
            AgentIdentity::local(id),
            self.server_endpoint.clone(),
            self.local_endpoint.clone(),
        )
        .with_reconnect_delay(Duration::from_secs(self.reconnect_delay_secs))
        .with_heartbeat(heartbeat);

        let auth = &self.authentication;
        match auth.mode {
            AuthMode::None => Ok(config),
            AuthMode::StaticToken => {
                Ok(config.with_static_token(static_token(auth.static_token.as_ref())?))
            }
            AuthMode::Certificate => {
                let certificate = auth.certificate.as_ref().context(
                    "authentication type is certificate but the `certificate` section is missing",
                )?;
                let files = TlsFiles {
                    ca_certificate: certificate.ca_certificate_path.clone(),
                    certificate: certificate.agent_certificate_path.clone(),
                    private_key: certificate.agent_certificate_key_path.clone(),
                };
                config
                    .with_certificate_auth(&files, &certificate.server_name)
                    .context("Failed to load agent TLS material")
            }
        }
    }
}

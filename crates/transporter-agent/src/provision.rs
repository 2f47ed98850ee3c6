//! One data connection: local service <-> server

use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use transporter_connection::{splice, Connector, SpliceStats, TransportError};
use transporter_proto::{NewConnectionResponse, Signal};

const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that end a single provisioning attempt
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Failed to connect to local service {address}: {source}")]
    LocalDial {
        address: String,
        source: std::io::Error,
    },

    #[error("Failed to connect to server {address}: {source}")]
    ServerDial {
        address: String,
        source: TransportError,
    },

    #[error("Failed to attach data connection: {0}")]
    Attach(#[from] TransportError),
}

/// Dial the local service, then the server, announce the new connection with
/// `NewConnResp` and splice the two until either side closes.
pub async fn provision_data_connection(
    local_addr: &str,
    server_addr: &str,
    connector: &Connector,
    response: NewConnectionResponse,
    cancel: CancellationToken,
) -> Result<SpliceStats, ProvisionError> {
    let local = match tokio::time::timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(local_addr)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(ProvisionError::LocalDial {
                address: local_addr.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(ProvisionError::LocalDial {
                address: local_addr.to_string(),
                source: std::io::ErrorKind::TimedOut.into(),
            })
        }
    };

    let mut data =
        connector
            .connect(server_addr)
            .await
            .map_err(|source| ProvisionError::ServerDial {
                address: server_addr.to_string(),
                source,
            })?;

    data.write_signal(&Signal::NewConnectionResponse(response))
        .await?;

    Ok(splice(data.into_inner(), local, cancel).await)
}

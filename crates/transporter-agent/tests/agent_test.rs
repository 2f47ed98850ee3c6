//! Agent behaviour against a scripted server

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use transporter_agent::{Agent, AgentConfig};
use transporter_connection::FramedTransport;
use transporter_proto::{AgentIdentity, Signal};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("transporter=debug")
        .try_init();
}

async fn accept(listener: &TcpListener) -> FramedTransport {
    let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("agent should connect")
        .unwrap();
    FramedTransport::from_tcp(stream)
}

async fn echo_service() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

fn agent(server: SocketAddr, local: SocketAddr) -> Agent {
    let config = AgentConfig::new(
        AgentIdentity::local("agent-test"),
        server.to_string(),
        local.to_string(),
    )
    .with_static_token("tok")
    .with_reconnect_delay(Duration::from_millis(50));
    Agent::new(config).unwrap()
}

#[tokio::test]
async fn test_agent_bootstraps_with_identity_and_token() {
    init_tracing();
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = echo_service().await;
    let shutdown = CancellationToken::new();

    let agent = agent(server.local_addr().unwrap(), local);
    let running = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { agent.run(shutdown).await }
    });

    let mut control = accept(&server).await;
    match control.read_signal().await.unwrap() {
        Signal::BootstrapRequest(request) => {
            assert_eq!(request.agent_id, "agent-test");
            assert_eq!(request.static_token, "tok");
            assert_eq!(request.os, std::env::consts::OS);
            assert_eq!(request.arch, std::env::consts::ARCH);
        }
        other => panic!("Expected BootstrapRequest, got {:?}", other),
    }

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("agent should stop")
        .unwrap();
}

#[tokio::test]
async fn test_agent_provisions_data_connection() {
    init_tracing();
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = echo_service().await;
    let shutdown = CancellationToken::new();

    let agent = agent(server.local_addr().unwrap(), local);
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { agent.run(shutdown).await }
    });

    let mut control = accept(&server).await;
    assert!(matches!(
        control.read_signal().await.unwrap(),
        Signal::BootstrapRequest(_)
    ));
    control
        .write_signal(&Signal::bootstrap_accepted())
        .await
        .unwrap();
    control
        .write_signal(&Signal::new_connection_request())
        .await
        .unwrap();

    let mut data = accept(&server).await;
    match data.read_signal().await.unwrap() {
        Signal::NewConnectionResponse(response) => {
            assert_eq!(response.agent_id, "agent-test");
            assert_eq!(response.static_token, "tok");
            assert!(response.error.is_empty());
        }
        other => panic!("Expected NewConnectionResponse, got {:?}", other),
    }

    let mut data = data.into_inner();
    data.write_all(b"echo me").await.unwrap();
    let mut buf = [0u8; 7];
    data.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"echo me");

    shutdown.cancel();
}

#[tokio::test]
async fn test_agent_reconnects_after_rejection() {
    init_tracing();
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = echo_service().await;
    let shutdown = CancellationToken::new();

    let agent = agent(server.local_addr().unwrap(), local);
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { agent.run(shutdown).await }
    });

    let mut first = accept(&server).await;
    assert!(matches!(
        first.read_signal().await.unwrap(),
        Signal::BootstrapRequest(_)
    ));
    first
        .write_signal(&Signal::bootstrap_rejected("Invalid static token"))
        .await
        .unwrap();

    // The agent comes back after its fixed delay
    let mut second = accept(&server).await;
    assert!(matches!(
        second.read_signal().await.unwrap(),
        Signal::BootstrapRequest(_)
    ));

    shutdown.cancel();
}

#[tokio::test]
async fn test_agent_reconnects_after_server_drop() {
    init_tracing();
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = echo_service().await;
    let shutdown = CancellationToken::new();

    let agent = agent(server.local_addr().unwrap(), local);
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { agent.run(shutdown).await }
    });

    let first = accept(&server).await;
    drop(first);

    let mut second = accept(&server).await;
    assert!(matches!(
        second.read_signal().await.unwrap(),
        Signal::BootstrapRequest(_)
    ));

    shutdown.cancel();
}

#[tokio::test]
async fn test_local_dial_failure_keeps_control_channel() {
    init_tracing();
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_local = unused.local_addr().unwrap();
    drop(unused);

    let shutdown = CancellationToken::new();
    let agent = agent(server.local_addr().unwrap(), dead_local);
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { agent.run(shutdown).await }
    });

    let mut control = accept(&server).await;
    control.read_signal().await.unwrap();
    control
        .write_signal(&Signal::new_connection_request())
        .await
        .unwrap();

    // No data connection shows up, and the control channel still answers
    let attached = tokio::time::timeout(Duration::from_millis(300), server.accept()).await;
    assert!(attached.is_err());

    control.write_signal(&Signal::ping()).await.unwrap();
    assert_eq!(control.read_signal().await.unwrap(), Signal::pong());

    shutdown.cancel();
}

use std::time::Duration;

use clap::Parser;
use hatchway::{ApplicationConfig, entrypoint};
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};

mod common;
use common::ServerHandle;

/// With only execution allowed, every forwarding flavor and the sftp
/// subsystem are refused, and no listener or dial happens as a side effect.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn forward_denied_permissions() {
    // 1. Initialize Hatchway with only execution allowed
    let directory = tempfile::tempdir().expect("Failed to create temporary directory");
    let config = ApplicationConfig::parse_from([
        "hatchway".to_string(),
        "--host=127.0.0.1".to_string(),
        "--port=18922".to_string(),
        format!("--host-key-file={}", directory.path().join("host_key").display()),
        "--user=scout:hunter2".to_string(),
        "--allow-execute".to_string(),
    ]);
    let _server = ServerHandle(tokio::spawn(async move { entrypoint(config).await }));
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect("127.0.0.1:18922").await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for Hatchway to start.")
    };

    // 2. Connect and authenticate
    let mut session = russh::client::connect(Default::default(), "127.0.0.1:18922", SshClient)
        .await
        .expect("Failed to connect to SSH server");
    assert!(
        session
            .authenticate_password("scout", "hunter2")
            .await
            .expect("SSH authentication failed")
            .success(),
        "authentication didn't succeed"
    );

    // 3. direct-tcpip channels are rejected
    assert!(
        session
            .channel_open_direct_tcpip("127.0.0.1", 18999, "127.0.0.1", 0)
            .await
            .is_err(),
        "direct-tcpip should be rejected"
    );

    // 4. Remote forwarding is refused and binds nothing
    assert!(
        session.tcpip_forward("127.0.0.1", 18923).await.is_err(),
        "tcpip-forward should be refused"
    );
    assert!(
        TcpStream::connect("127.0.0.1:18923").await.is_err(),
        "no listener should have been created"
    );

    // 5. Unix socket forwarding is refused as well
    #[cfg(unix)]
    {
        let socket_path = directory.path().join("denied.sock");
        let socket_path_str = socket_path.to_str().expect("Invalid socket path");
        assert!(
            session.streamlocal_forward(socket_path_str).await.is_err(),
            "streamlocal-forward should be refused"
        );
        assert!(
            !socket_path.exists(),
            "no socket file should have been created"
        );
        assert!(
            session
                .channel_open_direct_streamlocal(socket_path_str)
                .await
                .is_err(),
            "direct-streamlocal should be rejected"
        );
    }

    // 6. The sftp subsystem is refused
    let mut channel = session
        .channel_open_session()
        .await
        .expect("channel_open_session failed");
    channel
        .request_subsystem(true, "sftp")
        .await
        .expect("subsystem request failed");
    let mut rejected = false;
    let _ = timeout(Duration::from_secs(2), async {
        while let Some(message) = channel.wait().await {
            if matches!(message, russh::ChannelMsg::Failure) {
                rejected = true;
                break;
            }
        }
    })
    .await;
    assert!(rejected, "sftp subsystem should be refused");
}

struct SshClient;

impl russh::client::Handler for SshClient {
    type Error = color_eyre::eyre::Error;

    async fn check_server_key(
        &mut self,
        _key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

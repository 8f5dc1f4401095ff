#![cfg(unix)]

use std::time::Duration;

use clap::Parser;
use hatchway::{ApplicationConfig, entrypoint};
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};

mod common;
use common::ServerHandle;

/// Requesting a pty starts the configured shell on it; input and output
/// round-trip through the channel and the exit status is reported when the
/// shell finishes. A shell request without a pty is accepted but starts
/// nothing.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn session_pty_shell() {
    // 1. Initialize Hatchway
    let directory = tempfile::tempdir().expect("Failed to create temporary directory");
    let config = ApplicationConfig::parse_from([
        "hatchway".to_string(),
        "--host=127.0.0.1".to_string(),
        "--port=18822".to_string(),
        format!("--host-key-file={}", directory.path().join("host_key").display()),
        "--user=scout:hunter2".to_string(),
        "--shell=/bin/sh".to_string(),
    ]);
    let _server = ServerHandle(tokio::spawn(async move { entrypoint(config).await }));
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect("127.0.0.1:18822").await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for Hatchway to start.")
    };

    // 2. Connect and authenticate
    let mut session = russh::client::connect(Default::default(), "127.0.0.1:18822", SshClient)
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

    // 3. Interact with a shell on a pty
    let mut channel = session
        .channel_open_session()
        .await
        .expect("channel_open_session failed");
    channel
        .request_pty(true, "xterm", 80, 24, 0, 0, &[])
        .await
        .expect("pty request failed");
    channel
        .request_shell(true)
        .await
        .expect("shell request failed");
    channel
        .window_change(120, 40, 0, 0)
        .await
        .expect("window change failed");
    channel
        .data(&b"echo pty_round_trip; exit\n"[..])
        .await
        .expect("channel data failed");
    let mut output = Vec::new();
    let mut exit_status = None;
    if timeout(Duration::from_secs(10), async {
        while let Some(message) = channel.wait().await {
            match message {
                russh::ChannelMsg::Data { data } => output.extend_from_slice(&data),
                russh::ChannelMsg::ExitStatus {
                    exit_status: status,
                } => exit_status = Some(status),
                _ => {}
            }
        }
    })
    .await
    .is_err()
    {
        panic!("Timed out waiting for the shell to finish.")
    };
    let text = String::from_utf8_lossy(&output);
    assert!(
        text.contains("pty_round_trip"),
        "shell output should contain the echoed marker, got: {text}"
    );
    assert_eq!(exit_status, Some(0));

    // 4. A shell request without a pty is accepted but starts nothing
    let mut channel = session
        .channel_open_session()
        .await
        .expect("channel_open_session failed");
    channel
        .request_shell(true)
        .await
        .expect("shell request failed");
    let reply = timeout(Duration::from_secs(2), channel.wait())
        .await
        .expect("Timed out waiting for the shell reply");
    assert!(
        matches!(reply, Some(russh::ChannelMsg::Success)),
        "shell without a pty should still be accepted"
    );
    assert!(
        timeout(Duration::from_secs(1), channel.wait()).await.is_err(),
        "no shell should start without a pty"
    );
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

#![cfg(unix)]

use std::time::Duration;

use clap::Parser;
use hatchway::{ApplicationConfig, entrypoint};
use russh::{
    Channel,
    client::{Msg, Session},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UnixStream},
    sync::mpsc,
    time::{sleep, timeout},
};

mod common;
use common::ServerHandle;

/// A streamlocal-forward request binds a Unix socket whose connections are
/// tunneled back to the client; canceling removes the socket again.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn forward_streamlocal() {
    // 1. Initialize Hatchway
    let directory = tempfile::tempdir().expect("Failed to create temporary directory");
    let config = ApplicationConfig::parse_from([
        "hatchway".to_string(),
        "--host=127.0.0.1".to_string(),
        "--port=18622".to_string(),
        format!("--host-key-file={}", directory.path().join("host_key").display()),
        "--user=scout:hunter2".to_string(),
    ]);
    let _server = ServerHandle(tokio::spawn(async move { entrypoint(config).await }));
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect("127.0.0.1:18622").await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for Hatchway to start.")
    };

    // 2. Connect, authenticate, and request the forwarding
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut session = russh::client::connect(
        Default::default(),
        "127.0.0.1:18622",
        SshClient { forwarded: tx },
    )
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
    let socket_path = directory.path().join("relay.sock");
    let socket_path_str = socket_path.to_str().expect("Invalid socket path");
    session
        .streamlocal_forward(socket_path_str)
        .await
        .expect("streamlocal_forward failed");

    // 3. Dial the forwarded socket and relay bytes both ways
    let mut stream = UnixStream::connect(&socket_path)
        .await
        .expect("Unix connection failed");
    stream.write_all(b"PING").await.expect("write failed");
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("Timed out waiting for the forwarded reply")
        .expect("read failed");
    assert_eq!(&buf, b"PONG");

    // 4. The reverse channel carried the socket path
    let forwarded_path = rx.recv().await.expect("Missing forwarded channel");
    assert_eq!(forwarded_path, socket_path_str);

    // 5. Canceling the forwarding removes the socket
    session
        .cancel_streamlocal_forward(socket_path_str)
        .await
        .expect("cancel_streamlocal_forward failed");
    assert!(
        UnixStream::connect(&socket_path).await.is_err(),
        "canceled forwarding should refuse connections"
    );
}

struct SshClient {
    forwarded: mpsc::UnboundedSender<String>,
}

impl russh::client::Handler for SshClient {
    type Error = color_eyre::eyre::Error;

    async fn check_server_key(
        &mut self,
        _key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_streamlocal(
        &mut self,
        channel: Channel<Msg>,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self.forwarded.send(socket_path.to_string());
        tokio::spawn(async move {
            let mut stream = channel.into_stream();
            let mut buf = [0u8; 4];
            if stream.read_exact(&mut buf).await.is_ok() && &buf == b"PING" {
                let _ = stream.write_all(b"PONG").await;
            }
        });
        Ok(())
    }
}

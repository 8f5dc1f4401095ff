use std::path::PathBuf;

use dashmap::DashMap;
use russh::{
    Channel,
    server::{Handle, Msg},
};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::bridge;

// A running accept loop. The loop owns its listener, so aborting the task
// is what closes the bound address.
#[derive(Debug)]
struct AcceptLoop(JoinHandle<()>);

impl Drop for AcceptLoop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// Key identifying one remote forwarding. TCP and Unix listeners share the
// registry but cannot collide across address families.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ForwardKey {
    Tcp(String, u32),
    Unix(PathBuf),
}

impl std::fmt::Display for ForwardKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardKey::Tcp(address, port) => write!(f, "{address}:{port}"),
            ForwardKey::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

// Owner of one listener's accept loop. Dropping the guard aborts the loop,
// which closes the listener; Unix listeners also remove their socket file.
#[derive(Debug)]
pub(crate) struct ForwardGuard {
    task: AcceptLoop,
    socket_path: Option<PathBuf>,
}

impl ForwardGuard {
    // Stop the accept loop and wait until the listener is actually gone, so
    // that a positive cancel reply never races the address still being bound.
    pub(crate) async fn shut_down(mut self) {
        self.task.0.abort();
        let _ = (&mut self.task.0).await;
    }
}

impl Drop for ForwardGuard {
    fn drop(&mut self) {
        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

// Per-connection mapping from bind address to the listener serving it.
// Dropping the registry, which happens when the connection goes away,
// releases every listener still registered.
#[derive(Debug, Default)]
pub(crate) struct ForwardRegistry {
    listeners: DashMap<ForwardKey, ForwardGuard>,
}

impl ForwardRegistry {
    pub(crate) fn store(&self, key: ForwardKey, guard: ForwardGuard) {
        if let Some(displaced) = self.listeners.insert(key.clone(), guard) {
            warn!(address = %key, "Displacing existing listener for forwarding address.");
            drop(displaced);
        }
    }

    pub(crate) fn take(&self, key: &ForwardKey) -> Option<ForwardGuard> {
        self.listeners.remove(key).map(|(_, guard)| guard)
    }
}

// Bind a TCP listener for a tcpip-forward request and start its accept loop.
// `port` is updated with the effective port so that requests for port 0
// report the allocated one back to the client.
pub(crate) async fn start_tcpip_forward(
    registry: &ForwardRegistry,
    handle: Handle,
    peer: &str,
    address: &str,
    port: &mut u32,
) -> bool {
    let listener = match TcpListener::bind((address, *port as u16)).await {
        Ok(listener) => listener,
        Err(error) => {
            info!(peer = %peer, %address, port = *port, %error, "Failed to bind for tcpip-forward.");
            return false;
        }
    };
    if let Ok(local) = listener.local_addr() {
        *port = local.port().into();
    }
    let key = ForwardKey::Tcp(address.to_string(), *port);
    info!(peer = %peer, address = %key, "Remote forwarding started.");
    let task = AcceptLoop(tokio::spawn(tcp_accept_loop(
        listener,
        handle,
        address.to_string(),
        *port,
    )));
    registry.store(
        key,
        ForwardGuard {
            task,
            socket_path: None,
        },
    );
    true
}

async fn tcp_accept_loop(listener: TcpListener, handle: Handle, address: String, port: u32) {
    loop {
        match listener.accept().await {
            Ok((stream, originator)) => {
                let handle = handle.clone();
                let address = address.clone();
                tokio::spawn(async move {
                    match handle
                        .channel_open_forwarded_tcpip(
                            address,
                            port,
                            originator.ip().to_canonical().to_string(),
                            originator.port().into(),
                        )
                        .await
                    {
                        Ok(channel) => bridge(channel.into_stream(), stream).await,
                        Err(error) => {
                            debug!(%error, "Failed to open forwarded-tcpip channel.");
                        }
                    }
                });
            }
            Err(error) => {
                debug!(%address, port, %error, "Stopped accepting forwarded connections.");
                break;
            }
        }
    }
}

pub(crate) async fn cancel_tcpip_forward(
    registry: &ForwardRegistry,
    peer: &str,
    address: &str,
    port: u32,
) -> bool {
    let key = ForwardKey::Tcp(address.to_string(), port);
    match registry.take(&key) {
        Some(guard) => {
            guard.shut_down().await;
            info!(peer = %peer, address = %key, "Remote forwarding canceled.");
            true
        }
        None => {
            info!(peer = %peer, address = %key, "No listener found for cancel-tcpip-forward.");
            false
        }
    }
}

// Unix socket variant of the remote forwarding setup, keyed by socket path.
#[cfg(unix)]
pub(crate) async fn start_streamlocal_forward(
    registry: &ForwardRegistry,
    handle: Handle,
    peer: &str,
    socket_path: &str,
) -> bool {
    let path = PathBuf::from(socket_path);
    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(error) => {
            info!(peer = %peer, path = %path.display(), %error, "Failed to bind for streamlocal-forward.");
            return false;
        }
    };
    info!(peer = %peer, path = %path.display(), "Remote Unix socket forwarding started.");
    let task = AcceptLoop(tokio::spawn(unix_accept_loop(
        listener,
        handle,
        socket_path.to_string(),
    )));
    registry.store(
        ForwardKey::Unix(path.clone()),
        ForwardGuard {
            task,
            socket_path: Some(path),
        },
    );
    true
}

#[cfg(unix)]
async fn unix_accept_loop(listener: UnixListener, handle: Handle, socket_path: String) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let handle = handle.clone();
                let socket_path = socket_path.clone();
                tokio::spawn(async move {
                    match handle.channel_open_forwarded_streamlocal(socket_path).await {
                        Ok(channel) => bridge(channel.into_stream(), stream).await,
                        Err(error) => {
                            debug!(%error, "Failed to open forwarded-streamlocal channel.");
                        }
                    }
                });
            }
            Err(error) => {
                debug!(path = %socket_path, %error, "Stopped accepting forwarded connections.");
                break;
            }
        }
    }
}

#[cfg(unix)]
pub(crate) async fn cancel_streamlocal_forward(
    registry: &ForwardRegistry,
    peer: &str,
    socket_path: &str,
) -> bool {
    let key = ForwardKey::Unix(PathBuf::from(socket_path));
    match registry.take(&key) {
        Some(guard) => {
            guard.shut_down().await;
            info!(peer = %peer, address = %key, "Remote Unix socket forwarding canceled.");
            true
        }
        None => {
            info!(peer = %peer, address = %key, "No listener found for cancel-streamlocal-forward.");
            false
        }
    }
}

// Dial the backend for a direct-tcpip channel and bridge it. The channel is
// already accepted; a failed dial simply closes it.
pub(crate) async fn direct_tcpip(channel: Channel<Msg>, address: String, peer: String) {
    match TcpStream::connect(&address).await {
        Ok(stream) => bridge(channel.into_stream(), stream).await,
        Err(error) => {
            info!(peer = %peer, %address, %error, "Failed to dial for direct-tcpip.");
            let _ = channel.close().await;
        }
    }
}

#[cfg(unix)]
pub(crate) async fn direct_streamlocal(channel: Channel<Msg>, socket_path: String, peer: String) {
    match UnixStream::connect(&socket_path).await {
        Ok(stream) => bridge(channel.into_stream(), stream).await,
        Err(error) => {
            info!(peer = %peer, path = %socket_path, %error, "Failed to dial for direct-streamlocal.");
            let _ = channel.close().await;
        }
    }
}

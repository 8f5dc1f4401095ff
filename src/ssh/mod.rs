use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::{
    Channel, ChannelId, MethodKind, MethodSet,
    server::{Auth, Handler, Msg, Session},
};
use tracing::{debug, info, warn};

pub(crate) mod exec;
pub(crate) mod forwarding;
#[cfg(unix)]
pub(crate) mod pty;

use crate::{HatchwayServer, HatchwayServerHandle, sftp, ssh::forwarding::ForwardRegistry};

// Per-connection state. One handler exists for the lifetime of each
// authenticated SSH connection; dropping it releases everything the
// connection owns.
pub(crate) struct ServerHandler {
    // Peer label for logging; Unix socket clients have no address.
    peer: String,
    // The username from this connection's authentication.
    user: Option<String>,
    // Reference to the shared server data: permissions, shell, credentials.
    server: Arc<HatchwayServer>,
    // Listeners owned by this connection's remote forwardings.
    forwards: ForwardRegistry,
    // Session channels waiting for the request that decides their fate.
    session_channels: HashMap<ChannelId, Channel<Msg>>,
    // Master sides of the ptys allocated on this connection.
    #[cfg(unix)]
    ptys: pty::PtyTable,
}

impl russh::server::Server for HatchwayServerHandle {
    type Handler = ServerHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> ServerHandler {
        let peer = peer_addr.map_or_else(|| String::from("unix"), |address| address.to_string());
        info!(peer = %peer, "SSH client connected.");
        ServerHandler {
            peer,
            user: None,
            server: Arc::clone(&self.0),
            forwards: ForwardRegistry::default(),
            session_channels: HashMap::new(),
            #[cfg(unix)]
            ptys: Default::default(),
        }
    }
}

impl Handler for ServerHandler {
    type Error = russh::Error;

    // Passwordless logins are only allowed for users configured with an
    // empty password.
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        match self.server.users.get(user) {
            Some(password) if password.is_empty() => {
                self.user = Some(user.into());
                info!(peer = %self.peer, %user, "SSH client authenticated without password.");
                Ok(Auth::Accept)
            }
            _ => Ok(Auth::Reject {
                proceed_with_methods: Some(MethodSet::from([MethodKind::Password].as_slice())),
                partial_success: false,
            }),
        }
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.server.users.get(user) {
            Some(expected) if expected.is_empty() || expected == password => {
                self.user = Some(user.into());
                info!(peer = %self.peer, %user, "SSH client authenticated with password.");
                Ok(Auth::Accept)
            }
            _ => {
                warn!(peer = %self.peer, %user, "Failed password authentication.");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    // The channel is retained until one of the session requests decides what
    // it becomes: an exec conduit, an sftp stream, or a pty (which drops it).
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(peer = %self.peer, channel = %channel.id(), "Session channel opened.");
        self.session_channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // Reject invalid ports
        if port_to_connect > u16::MAX.into() || originator_port > u16::MAX.into() {
            return Err(russh::Error::Disconnect);
        }
        if !self.server.permissions.direct_tcpip {
            info!(peer = %self.peer, "direct-tcpip not allowed.");
            return Ok(false);
        }
        debug!(
            peer = %self.peer,
            host = %host_to_connect,
            port = port_to_connect,
            originator = %originator_address,
            originator_port,
            "Opening direct-tcpip channel."
        );
        let address = format!("{host_to_connect}:{port_to_connect}");
        tokio::spawn(forwarding::direct_tcpip(channel, address, self.peer.clone()));
        Ok(true)
    }

    async fn channel_open_direct_streamlocal(
        &mut self,
        channel: Channel<Msg>,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.server.permissions.direct_streamlocal {
            info!(peer = %self.peer, "direct-streamlocal (Unix domain socket) not allowed.");
            return Ok(false);
        }
        #[cfg(unix)]
        {
            debug!(peer = %self.peer, path = %socket_path, "Opening direct-streamlocal channel.");
            tokio::spawn(forwarding::direct_streamlocal(
                channel,
                socket_path.to_string(),
                self.peer.clone(),
            ));
            Ok(true)
        }
        #[cfg(not(unix))]
        {
            let _ = (channel, socket_path);
            info!(peer = %self.peer, "direct-streamlocal unsupported on this platform.");
            Ok(false)
        }
    }

    // Client data only matters to pty sessions here; exec and sftp channels
    // consume their data through their own streams.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        #[cfg(unix)]
        if let Some(pty) = self.ptys.lock().await.get_mut(&channel) {
            use tokio::io::AsyncWriteExt;
            if let Err(error) = pty.write_all(data).await {
                debug!(peer = %self.peer, %channel, %error, "Failed to write to pty.");
            }
        }
        #[cfg(not(unix))]
        let _ = (channel, data);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.server.permissions.execute {
            info!(peer = %self.peer, "execution not allowed (exec).");
            return session.channel_failure(channel_id);
        }
        let command = String::from_utf8_lossy(data);
        let Some(argv) = exec::parse_command(&command) else {
            info!(peer = %self.peer, %command, "Rejecting unparseable exec command.");
            return session.channel_failure(channel_id);
        };
        let Some(channel) = self.session_channels.remove(&channel_id) else {
            debug!(peer = %self.peer, %channel_id, "exec request on an unavailable channel.");
            return session.channel_failure(channel_id);
        };
        match exec::spawn_command(&argv) {
            Ok(child) => {
                debug!(peer = %self.peer, command = %argv[0], "Command spawned.");
                // Reply before any command output flows.
                session.channel_success(channel_id)?;
                tokio::spawn(exec::serve_child(child, channel, session.handle()));
                Ok(())
            }
            Err(error) => {
                info!(peer = %self.peer, command = %argv[0], %error, "Failed to spawn command.");
                session.channel_failure(channel_id)?;
                let _ = channel.close().await;
                Ok(())
            }
        }
    }

    // Accepted as-is: the shell itself only starts once a pty is requested.
    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = %self.peer, %channel_id, "Accepting shell request.");
        self.session_channels.remove(&channel_id);
        session.channel_success(channel_id)
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.server.permissions.execute {
            info!(peer = %self.peer, "execution not allowed (pty-req).");
            return session.channel_failure(channel_id);
        }
        #[cfg(unix)]
        {
            debug!(peer = %self.peer, %channel_id, %term, col_width, row_height, "Allocating pty.");
            // Input now flows through the pty table; the retained channel is
            // no longer needed.
            self.session_channels.remove(&channel_id);
            match pty::start(
                &self.server.shell,
                col_width,
                row_height,
                channel_id,
                session.handle(),
                Arc::clone(&self.ptys),
            )
            .await
            {
                Ok(()) => session.channel_success(channel_id),
                Err(error) => {
                    info!(peer = %self.peer, %error, "Failed to allocate pty.");
                    session.channel_failure(channel_id)
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (term, col_width, row_height);
            info!(peer = %self.peer, "pty unsupported.");
            session.channel_failure(channel_id)
        }
    }

    async fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        #[cfg(unix)]
        if let Some(pty) = self.ptys.lock().await.get_mut(&channel_id)
            && let Err(error) =
                pty.resize(pty_process::Size::new(row_height as u16, col_width as u16))
        {
            warn!(peer = %self.peer, %error, "Failed to resize pty.");
            return session.channel_failure(channel_id);
        }
        #[cfg(not(unix))]
        let _ = (col_width, row_height);
        // Sessions without a pty ignore the request.
        session.channel_success(channel_id)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            info!(peer = %self.peer, subsystem = %name, "Unsupported subsystem requested.");
            return session.channel_failure(channel_id);
        }
        if !self.server.permissions.sftp {
            info!(peer = %self.peer, "sftp not allowed.");
            return session.channel_failure(channel_id);
        }
        let Some(channel) = self.session_channels.remove(&channel_id) else {
            debug!(peer = %self.peer, %channel_id, "subsystem request on an unavailable channel.");
            return session.channel_failure(channel_id);
        };
        debug!(peer = %self.peer, %channel_id, "Starting sftp subsystem.");
        session.channel_success(channel_id)?;
        let handle = session.handle();
        tokio::spawn(async move {
            sftp::serve(channel.into_stream()).await;
            let _ = handle.close(channel_id).await;
        });
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // Reject invalid ports
        if *port > u16::MAX.into() {
            return Err(russh::Error::Disconnect);
        }
        if !self.server.permissions.tcpip_forward {
            info!(peer = %self.peer, "tcpip-forward not allowed.");
            return Ok(false);
        }
        Ok(forwarding::start_tcpip_forward(
            &self.forwards,
            session.handle(),
            &self.peer,
            address,
            port,
        )
        .await)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // Reject invalid ports
        if port > u16::MAX.into() {
            return Err(russh::Error::Disconnect);
        }
        Ok(forwarding::cancel_tcpip_forward(&self.forwards, &self.peer, address, port).await)
    }

    async fn streamlocal_forward(
        &mut self,
        socket_path: &str,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.server.permissions.streamlocal_forward {
            info!(peer = %self.peer, "streamlocal-forward not allowed.");
            return Ok(false);
        }
        #[cfg(unix)]
        {
            Ok(forwarding::start_streamlocal_forward(
                &self.forwards,
                session.handle(),
                &self.peer,
                socket_path,
            )
            .await)
        }
        #[cfg(not(unix))]
        {
            let _ = (socket_path, session);
            info!(peer = %self.peer, "streamlocal-forward unsupported on this platform.");
            Ok(false)
        }
    }

    async fn cancel_streamlocal_forward(
        &mut self,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        #[cfg(unix)]
        {
            Ok(
                forwarding::cancel_streamlocal_forward(&self.forwards, &self.peer, socket_path)
                    .await,
            )
        }
        #[cfg(not(unix))]
        {
            let _ = socket_path;
            Ok(false)
        }
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = %self.peer, %channel, "Channel closed.");
        self.session_channels.remove(&channel);
        #[cfg(unix)]
        self.ptys.lock().await.remove(&channel);
        Ok(())
    }
}

// Connection teardown: the forward registry drops with the handler, closing
// every listener still registered.
impl Drop for ServerHandler {
    fn drop(&mut self) {
        let user = self.user.as_deref().unwrap_or("unknown");
        info!(peer = %self.peer, %user, "SSH client disconnected.");
    }
}

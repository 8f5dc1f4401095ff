use std::{collections::HashMap, sync::Arc, time::Duration};

use color_eyre::eyre::Context;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use russh::{
    MethodKind, MethodSet,
    keys::{
        decode_secret_key,
        ssh_key::{LineEnding, private::Ed25519Keypair},
    },
    server::{Config, Server as _},
};
use tokio::fs;
use tracing::{debug, info};

use crate::{HatchwayServer, HatchwayServerHandle, config::ApplicationConfig, error::ServerError};

// Main entrypoint of the application.
#[doc(hidden)]
pub async fn entrypoint(config: ApplicationConfig) -> color_eyre::Result<()> {
    info!("Starting Hatchway...");
    if config.users.is_empty() {
        return Err(ServerError::NoUsersConfigured.into());
    }
    // Find the host key or create a new one.
    let key = match fs::read_to_string(config.host_key_file.as_path()).await {
        Ok(key) => decode_secret_key(&key, None).with_context(|| "Error decoding host key")?,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %config.host_key_file.display(), "Host key not found. Creating...");
            if let Some(parent) = config.host_key_file.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| "Error creating host key directory")?;
            }
            let key = russh::keys::PrivateKey::from(Ed25519Keypair::from_seed(
                &ChaCha20Rng::from_os_rng().random(),
            ));
            let key_string = key
                .to_openssh(LineEnding::LF)
                .with_context(|| "Error encoding host key")?;
            let key = decode_secret_key(&key_string, None)
                .with_context(|| "Error decoding host key")?;
            fs::write(config.host_key_file.as_path(), key_string.as_bytes())
                .await
                .with_context(|| "Error saving host key to filesystem")?;
            key
        }
        Err(error) => return Err(error).with_context(|| "Error reading host key"),
    };

    let users: HashMap<String, String> = config
        .users
        .iter()
        .map(|user| (user.name.clone(), user.password.clone()))
        .collect();
    let permissions = config.permissions();
    debug!(?permissions, "Resolved permissions.");
    let mut server = HatchwayServerHandle(Arc::new(HatchwayServer {
        permissions,
        shell: config.shell.clone(),
        users,
    }));

    let server_config = Arc::new(Config {
        methods: MethodSet::from([MethodKind::None, MethodKind::Password].as_slice()),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        // Forwarding connections are expected to sit idle for long stretches.
        inactivity_timeout: None,
        keys: vec![key],
        ..Default::default()
    });

    match config.unix_socket {
        Some(ref path) => {
            #[cfg(unix)]
            {
                use russh::server::run_stream;
                use tokio::net::UnixListener;

                let listener =
                    UnixListener::bind(path).with_context(|| "Error binding Unix socket")?;
                info!(path = %path.display(), "Listening for SSH connections.");
                loop {
                    let (stream, _) = listener
                        .accept()
                        .await
                        .with_context(|| "Error accepting Unix socket connection")?;
                    let handler = server.new_client(None);
                    let config = Arc::clone(&server_config);
                    tokio::spawn(async move {
                        match run_stream(config, stream, handler).await {
                            Ok(session) => {
                                if let Err(error) = session.await {
                                    debug!(%error, "Connection closed with error.");
                                }
                            }
                            Err(error) => debug!(%error, "Connection setup failed."),
                        }
                    });
                }
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                Err(color_eyre::eyre::eyre!(
                    "Unix socket listeners are not supported on this platform"
                ))
            }
        }
        None => {
            info!(host = %config.host, port = config.port, "Listening for SSH connections.");
            server
                .run_on_address(server_config, (config.host.as_str(), config.port))
                .await
                .with_context(|| "Error listening for SSH connections")?;
            Ok(())
        }
    }
}

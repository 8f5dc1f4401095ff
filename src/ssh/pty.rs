use std::collections::HashMap;
use std::sync::Arc;

use pty_process::Size;
use russh::{ChannelId, CryptoVec, server::Handle};
use tokio::{io::AsyncReadExt, sync::Mutex};
use tracing::debug;

// Master write sides of the ptys allocated on this connection, shared
// between the session dispatcher (input, window changes) and the pump tasks
// (cleanup).
pub(crate) type PtyTable = Arc<Mutex<HashMap<ChannelId, pty_process::OwnedWritePty>>>;

// Allocate a pty pair, spawn the shell attached to the slave side, and pump
// the master to the session channel until the shell exits, at which point
// the exit status is reported and the channel closed. The write side stays
// in the shared table so the dispatcher can feed input and window changes.
pub(crate) async fn start(
    shell: &str,
    col_width: u32,
    row_height: u32,
    channel_id: ChannelId,
    handle: Handle,
    ptys: PtyTable,
) -> Result<(), pty_process::Error> {
    let (pty, pts) = pty_process::open()?;
    let mut child = pty_process::Command::new(shell).spawn(pts)?;
    let (mut reader, writer) = pty.into_split();
    // Resizing only works reliably once the child is attached.
    if let Err(error) = writer.resize(Size::new(row_height as u16, col_width as u16)) {
        debug!(%error, "Failed to apply initial pty size.");
    }
    ptys.lock().await.insert(channel_id, writer);

    tokio::spawn(async move {
        let mut buffer = [0u8; 4096];
        // The master read fails once the shell exits and the slave closes.
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if handle
                        .data(channel_id, CryptoVec::from_slice(&buffer[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
        let exit_status = match child.wait().await {
            Ok(status) => status.code().map_or(0, |code| code as u32),
            Err(error) => {
                debug!(%error, "Failed to await shell.");
                0
            }
        };
        let _ = handle.exit_status_request(channel_id, exit_status).await;
        let _ = handle.eof(channel_id).await;
        let _ = handle.close(channel_id).await;
        ptys.lock().await.remove(&channel_id);
    });
    Ok(())
}

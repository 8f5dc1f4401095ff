use std::process::Stdio;

use russh::{
    Channel, ChannelId, ChannelMsg, CryptoVec,
    server::{Handle, Msg},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
};
use tracing::debug;

// Split a command line into an argv with POSIX shell quoting rules. Commands
// that parse to nothing are rejected.
pub(crate) fn parse_command(command: &str) -> Option<Vec<String>> {
    shell_words::split(command)
        .ok()
        .filter(|argv| !argv.is_empty())
}

pub(crate) fn spawn_command(argv: &[String]) -> std::io::Result<Child> {
    Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

// Drive a spawned command over its session channel: channel data feeds
// stdin, stdout goes to the primary stream, and stderr to extended data
// stream 1. Once the process exits, its status is reported on the channel
// before it is closed.
pub(crate) async fn serve_child(mut child: Child, mut channel: Channel<Msg>, handle: Handle) {
    let channel_id = channel.id();
    let mut stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_task = stdout
        .map(|stdout| tokio::spawn(pump_output(stdout, handle.clone(), channel_id, None)));
    let stderr_task = stderr
        .map(|stderr| tokio::spawn(pump_output(stderr, handle.clone(), channel_id, Some(1))));

    let stdin_task = tokio::spawn(async move {
        while let Some(message) = channel.wait().await {
            match message {
                ChannelMsg::Data { data } => {
                    if let Some(writer) = stdin.as_mut()
                        && writer.write_all(&data).await.is_err()
                    {
                        stdin = None;
                    }
                }
                // EOF from the client closes the process's stdin.
                ChannelMsg::Eof => {
                    stdin = None;
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }
    });

    let status = child.wait().await;
    // Let the output pumps drain the pipes before the status goes out.
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }
    let exit_status = match &status {
        Ok(status) => status.code().map_or(0, |code| code as u32),
        Err(error) => {
            debug!(%error, "Failed to await command.");
            0
        }
    };
    let _ = handle.exit_status_request(channel_id, exit_status).await;
    let _ = handle.eof(channel_id).await;
    let _ = handle.close(channel_id).await;
    stdin_task.abort();
}

async fn pump_output<R>(mut reader: R, handle: Handle, channel_id: ChannelId, ext: Option<u32>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; 4096];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let data = CryptoVec::from_slice(&buffer[..n]);
                let result = match ext {
                    Some(ext) => handle.extended_data(channel_id, ext, data).await,
                    None => handle.data(channel_id, data).await,
                };
                if result.is_err() {
                    break;
                }
            }
        }
    }
}

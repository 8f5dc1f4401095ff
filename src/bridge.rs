use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, copy, split};
use tracing::debug;

// Copy both directions between a channel stream and a backend stream until
// either side reaches EOF or fails. The losing direction is dropped
// mid-flight and both endpoints are shut down exactly once before the
// streams themselves go away.
pub(crate) async fn bridge<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut read_a, mut write_a) = split(a);
    let (mut read_b, mut write_b) = split(b);
    let result = tokio::select! {
        result = copy(&mut read_a, &mut write_b) => result,
        result = copy(&mut read_b, &mut write_a) => result,
    };
    if let Err(error) = result {
        debug!(%error, "Bridge closed with error.");
    }
    let mut a = read_a.unsplit(write_a);
    let mut b = read_b.unsplit(write_b);
    let _ = a.shutdown().await;
    let _ = b.shutdown().await;
}

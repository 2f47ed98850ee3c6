//! Bidirectional byte copy between two established connections

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction by one [`splice`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

enum DirectionEnd {
    Eof,
    Cancelled,
    Failed(std::io::Error),
}

/// Join `a` and `b` until both directions have ended, one fails, or `cancel`
/// fires.
///
/// EOF on one side is forwarded as a write shutdown to the other, which may
/// keep answering on the reverse direction. A read or write error ends both
/// directions. Both write halves are shut down and both connections are
/// dropped before this returns.
pub async fn splice<A, B>(a: A, b: B, cancel: CancellationToken) -> SpliceStats
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let done = cancel.child_token();

    let (a_to_b, b_to_a) = tokio::join!(
        copy_direction(&mut a_read, &mut b_write, &done, "a->b"),
        copy_direction(&mut b_read, &mut a_write, &done, "b->a"),
    );

    SpliceStats { a_to_b, b_to_a }
}

async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    done: &CancellationToken,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    let end = loop {
        let n = tokio::select! {
            biased;
            _ = done.cancelled() => break DirectionEnd::Cancelled,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break DirectionEnd::Eof,
                Ok(n) => n,
                Err(e) => break DirectionEnd::Failed(e),
            },
        };

        tokio::select! {
            biased;
            _ = done.cancelled() => break DirectionEnd::Cancelled,
            written = writer.write_all(&buf[..n]) => {
                if let Err(e) = written {
                    break DirectionEnd::Failed(e);
                }
            }
        }
        total += n as u64;
    };

    // EOF only half-closes; the reverse direction runs until its own end
    if !matches!(end, DirectionEnd::Eof) {
        done.cancel();
    }
    let _ = writer.shutdown().await;

    match end {
        DirectionEnd::Eof => debug!(direction, bytes = total, "Splice direction reached EOF"),
        DirectionEnd::Cancelled => debug!(direction, bytes = total, "Splice direction cancelled"),
        DirectionEnd::Failed(e) => {
            debug!(direction, bytes = total, error = %e, "Splice direction failed")
        }
    }

    total
}

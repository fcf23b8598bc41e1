//! Exact-length byte transfer over stream sockets.
//!
//! A single read or write on a stream may move fewer bytes than requested.
//! Every frame in the batch protocol is built on [`receive_exact`] and
//! [`send_exact`], which loop until the full length has been transferred.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Transport-level failures, always local to one connection.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// Peer closed the stream before the requested length arrived.
    #[error("peer closed after {received} of {expected} bytes")]
    ShortRead { expected: usize, received: usize },

    /// A write on an open stream accepted zero bytes.
    #[error("connection broken after writing {written} of {total} bytes")]
    ConnectionBroken { written: usize, total: usize },

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Read exactly `n` bytes from `reader`.
pub async fn receive_exact<R>(reader: &mut R, n: usize) -> Result<Bytes, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(n);

    while buffer.len() < n {
        let mut chunk = (&mut *reader).take((n - buffer.len()) as u64);
        let read = chunk.read_buf(&mut buffer).await?;
        if read == 0 {
            return Err(FramingError::ShortRead {
                expected: n,
                received: buffer.len(),
            });
        }
    }

    Ok(buffer.freeze())
}

/// Write all of `data` to `writer` and flush it.
pub async fn send_exact<W>(writer: &mut W, data: &[u8]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;

    while written < data.len() {
        let n = writer.write(&data[written..]).await?;
        if n == 0 {
            return Err(FramingError::ConnectionBroken {
                written,
                total: data.len(),
            });
        }
        written += n;
    }

    writer.flush().await?;
    Ok(())
}

//! Batch wire protocol.
//!
//! All integers are big-endian and unsigned.
//!
//! - Client to server, one batch: `u16 length` then `length` bytes of UTF-8
//!   text, one record per line. A trailing `END` line marks the final batch.
//! - Server to client, acknowledgment: `u16 count` of record lines accepted.
//! - Server to client, winners (once, after the draw): `u32 winner_count`
//!   followed by `winner_count` × `u32 document_id`.

use crate::codec::{receive_exact, send_exact, FramingError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{error, trace};

/// Last line of an agency's final batch.
pub const END_SENTINEL: &str = "END";

/// Size of the batch length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 2;

/// One batch as read off the wire, with the sentinel removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Record lines, `\n`-joined.
    pub text: String,
    /// The batch ended with the `END` sentinel.
    pub is_last: bool,
    /// Count sent back in the acknowledgment.
    pub acknowledged: u16,
}

/// Framing violations in a client batch.
#[derive(Debug, thiserror::Error)]
pub enum MalformedBatch {
    #[error("failed to read length prefix: {0}")]
    LengthPrefix(FramingError),

    #[error("failed to read {length}-byte payload: {source}")]
    Payload { length: u16, source: FramingError },

    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed batch: {0}")]
    MalformedBatch(#[from] MalformedBatch),

    #[error(transparent)]
    Framing(#[from] FramingError),
}

/// Read one batch, acknowledge it, and return its record text.
///
/// The acknowledgment is sent before returning, including for the final batch.
pub async fn read_batch<S>(stream: &mut S) -> Result<Batch, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut prefix = receive_exact(stream, LENGTH_PREFIX_LEN)
        .await
        .map_err(MalformedBatch::LengthPrefix)?;
    let length = prefix.get_u16();

    let payload = receive_exact(stream, length as usize)
        .await
        .map_err(|source| MalformedBatch::Payload { length, source })?;
    let payload = std::str::from_utf8(&payload).map_err(MalformedBatch::Utf8)?;

    let (text, is_last) = strip_sentinel(payload);
    let acknowledged = count_lines(text);

    send_exact(stream, &acknowledged.to_be_bytes()).await?;
    trace!(length, acknowledged, is_last, "Batch acknowledged");

    Ok(Batch {
        text: text.to_string(),
        is_last,
        acknowledged,
    })
}

/// Split off a trailing `END` line.
fn strip_sentinel(payload: &str) -> (&str, bool) {
    let payload = payload.trim_end();
    match payload.rsplit_once('\n') {
        Some((head, last)) if last.trim_end() == END_SENTINEL => (head, true),
        None if payload == END_SENTINEL => ("", true),
        _ => (payload, false),
    }
}

/// Non-blank lines; a batch fits in 64 KiB so this always fits in a `u16`.
fn count_lines(text: &str) -> u16 {
    text.lines().filter(|line| !line.trim().is_empty()).count() as u16
}

/// Encode the winners message for one agency.
pub fn encode_winners(document_ids: &[u32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + 4 * document_ids.len());
    buf.put_u32(document_ids.len() as u32);
    for &id in document_ids {
        buf.put_u32(id);
    }
    buf.freeze()
}

/// Send the winners message. Failures are logged, never returned, so one
/// broken agency cannot abort delivery to the others.
///
/// Returns whether the whole message was written.
pub async fn send_winners<W>(writer: &mut W, document_ids: &[u32]) -> bool
where
    W: AsyncWrite + Unpin,
{
    match send_exact(writer, &encode_winners(document_ids)).await {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, winners = document_ids.len(), "Failed to send winners");
            false
        }
    }
}

//! Per-connection session handling.
//!
//! A session reads batches until the agency sends its final one, then hands
//! its records and its socket to the shared state. Any framing, protocol or
//! parse error fails the session: the records read so far are still stored,
//! but the socket is closed and the agency is not counted.

use crate::bet::{parse_batch, BetRecord, InvalidBetFormat};
use crate::protocol::{read_batch, ProtocolError};
use crate::shutdown::Shutdown;
use crate::state::{CommitOutcome, SharedState};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

/// Reasons a session ends without reaching its final batch.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    InvalidBet(#[from] InvalidBetFormat),

    #[error("server is shutting down")]
    Shutdown,
}

/// Records accumulated on one connection.
struct Session<S> {
    stream: S,
    records: Vec<BetRecord>,
    batches: usize,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S) -> Self {
        Self {
            stream,
            records: Vec::new(),
            batches: 0,
        }
    }

    /// Read batches until the final one. A batch that fails to parse adds no
    /// records.
    async fn read_batches(&mut self) -> Result<(), SessionError> {
        loop {
            let batch = read_batch(&mut self.stream).await?;
            let records = parse_batch(&batch.text)?;

            self.batches += 1;
            self.records.extend(records);
            debug!(
                batch = self.batches,
                acknowledged = batch.acknowledged,
                total = self.records.len(),
                "Batch received"
            );

            if batch.is_last {
                return Ok(());
            }
        }
    }
}

/// Run one connection to completion and commit it to `state`.
pub async fn handle_session<S>(
    stream: S,
    peer: SocketAddr,
    state: &SharedState<S>,
    shutdown: &Shutdown,
) -> CommitOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session::new(stream);

    let result = tokio::select! {
        result = session.read_batches() => result,
        _ = shutdown.wait() => Err(SessionError::Shutdown),
    };

    match result {
        Ok(()) => {
            let bets = session.records.len();
            let outcome = state.commit_session(&session.records, Some(session.stream));
            match &outcome {
                CommitOutcome::Counted { agency, finished } => info!(
                    %peer,
                    %agency,
                    bets,
                    batches = session.batches,
                    finished,
                    "Bets received"
                ),
                CommitOutcome::Duplicate { agency } => {
                    warn!(%peer, %agency, bets, "Bets stored, agency was already counted")
                }
                CommitOutcome::Stored { records } => {
                    warn!(%peer, records, "No bets received, agency not counted")
                }
                CommitOutcome::Rejected | CommitOutcome::StoreFailed => {
                    warn!(%peer, bets, "Bets not stored")
                }
            }
            outcome
        }
        Err(e) => {
            error!(%peer, error = %e, bets = session.records.len(), "Session failed");
            drop(session.stream);
            state.commit_session(&session.records, None)
        }
    }
}

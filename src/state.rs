//! Process-wide state shared by every session and the coordinator.
//!
//! One mutex guards the bet store, the agency to socket map and the finished
//! counter together. Committing records, registering the socket and bumping
//! the counter happen in one critical section, so whoever sees the counter
//! reach the total also sees every socket that got it there.
//!
//! The counter is mirrored into a `watch` channel from inside that critical
//! section; the coordinator waits on the channel instead of polling the lock.

use crate::bet::BetRecord;
use crate::storage::{BetStore, StoreError};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What happened to a session's records and socket on commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Records stored, socket registered, agency counted.
    Counted { agency: String, finished: usize },
    /// Records stored, but the agency had already been counted.
    Duplicate { agency: String },
    /// Records stored; no socket to register (failed or empty session).
    Stored { records: usize },
    /// The state is sealed; nothing was stored.
    Rejected,
    /// The store refused the records.
    StoreFailed,
}

struct Inner<S> {
    store: Box<dyn BetStore>,
    sockets: HashMap<String, S>,
    finished: usize,
    sealed: bool,
}

pub struct SharedState<S> {
    inner: Mutex<Inner<S>>,
    finished_tx: watch::Sender<usize>,
    total: usize,
}

impl<S> SharedState<S> {
    /// `total` is the number of agencies that must finish before the draw.
    pub fn new(store: Box<dyn BetStore>, total: usize) -> Self {
        let (finished_tx, _rx) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                store,
                sockets: HashMap::new(),
                finished: 0,
                sealed: false,
            }),
            finished_tx,
            total,
        }
    }

    // A panicking session must not wedge the others.
    fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn finished(&self) -> usize {
        *self.finished_tx.borrow()
    }

    /// Commit a session's records and, for a completed session, register its
    /// socket and count its agency.
    ///
    /// `socket` is `None` for a failed session: its records are kept but it
    /// is never counted. A completed session with no records is not counted
    /// either. Sockets that are not registered are dropped (closed) here.
    pub fn commit_session(&self, records: &[BetRecord], socket: Option<S>) -> CommitOutcome {
        let mut inner = self.lock();

        if inner.sealed {
            warn!(records = records.len(), "Session finished after the draw closed, discarding");
            return CommitOutcome::Rejected;
        }

        if !records.is_empty() {
            if let Err(e) = inner.store.append(records) {
                error!(error = %e, records = records.len(), "Failed to store bets");
                return CommitOutcome::StoreFailed;
            }
        }

        let (Some(socket), Some(first)) = (socket, records.first()) else {
            return CommitOutcome::Stored {
                records: records.len(),
            };
        };

        let agency = first.agency_id.clone();
        if inner.sockets.contains_key(&agency) {
            warn!(%agency, "Agency already finished, closing duplicate connection");
            return CommitOutcome::Duplicate { agency };
        }

        inner.sockets.insert(agency.clone(), socket);
        inner.finished += 1;
        let finished = inner.finished;
        if finished >= self.total {
            inner.sealed = true;
        }
        self.finished_tx.send_replace(finished);

        debug!(%agency, finished, total = self.total, "Agency finished");
        CommitOutcome::Counted { agency, finished }
    }

    /// Resolves once `total` agencies have been counted.
    pub async fn wait_until_complete(&self) {
        let mut rx = self.finished_tx.subscribe();
        let total = self.total;
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|finished| *finished >= total).await;
        info!(total, "All agencies finished");
    }

    /// Seal the state and hand out everything the draw needs: every stored
    /// bet and every registered socket.
    pub fn take_for_draw(&self) -> (Result<Vec<BetRecord>, StoreError>, HashMap<String, S>) {
        let mut inner = self.lock();
        inner.sealed = true;
        let bets = inner.store.load_all();
        (bets, std::mem::take(&mut inner.sockets))
    }

    /// Seal the state without a draw, returning the registered sockets.
    /// Later calls return an empty map.
    pub fn take_sockets(&self) -> HashMap<String, S> {
        let mut inner = self.lock();
        inner.sealed = true;
        std::mem::take(&mut inner.sockets)
    }
}

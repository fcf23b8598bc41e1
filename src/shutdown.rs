//! Shutdown signalling.
//!
//! A single [`Shutdown`] handle is cloned into the acceptor, the coordinator
//! and every session. Triggering it any number of times, from a signal or
//! from the coordinator after the draw, has the same effect as once.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown. Returns `true` only for the call that flipped the flag.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|requested| !std::mem::replace(requested, true))
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Trigger `shutdown` on SIGTERM or SIGINT.
#[cfg(unix)]
pub async fn listen_for_signals(shutdown: Shutdown) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        _ = sigint.recv() => info!("SIGINT received, shutting down"),
        _ = shutdown.wait() => return Ok(()),
    }

    if !shutdown.trigger() {
        warn!("Shutdown already in progress");
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn listen_for_signals(shutdown: Shutdown) -> std::io::Result<()> {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Ctrl+C received, shutting down");
        }
        _ = shutdown.wait() => return Ok(()),
    }

    if !shutdown.trigger() {
        warn!("Shutdown already in progress");
    }
    Ok(())
}

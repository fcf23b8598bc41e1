//! TCP server for collecting agency bets and announcing winners.
//!
//! The acceptor spawns one session task per connection. Alongside it the
//! coordinator waits for every expected agency to finish, runs the draw
//! exactly once, sends each retained connection its winners, closes them all
//! and stops the acceptor.

use crate::config::{Config, ConfigError};
use crate::lottery::{find_winners, Draw, WinnersIndex};
use crate::protocol::send_winners;
use crate::session::handle_session;
use crate::shutdown::Shutdown;
use crate::state::{CommitOutcome, SharedState};
use crate::storage::BetStore;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

/// Startup errors; the only failures that stop the process.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to listen on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// How the server's single draw cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Every agency finished; winners went out to `delivered` of `agencies`.
    Drawn { agencies: usize, delivered: usize },
    /// Every agency finished but the bets could not be loaded back.
    DrawFailed { agencies: usize },
    /// The barrier deadline passed with only `finished` agencies done.
    DeadlineExpired { finished: usize },
    /// Stopped by an external shutdown request.
    Shutdown { finished: usize },
}

/// Server instance
pub struct Server {
    config: Config,
    listener: TcpListener,
    state: Arc<SharedState<TcpStream>>,
    draw: Arc<dyn Draw>,
    shutdown: Shutdown,
}

impl Server {
    /// Bind the listening socket. Must be called from within a tokio runtime.
    pub async fn bind(
        config: Config,
        store: Box<dyn BetStore>,
        draw: Arc<dyn Draw>,
    ) -> Result<Self, ServerError> {
        let addr = config.listen_addr()?;
        let listener = create_listener(addr, config.listen_backlog)
            .map_err(|source| ServerError::Bind { addr, source })?;

        info!(
            address = %listener.local_addr().unwrap_or(addr),
            backlog = config.listen_backlog,
            client_total = config.client_total,
            "Server listening"
        );

        Ok(Server {
            state: Arc::new(SharedState::new(store, config.client_total)),
            config,
            listener,
            draw,
            shutdown: Shutdown::new(),
        })
    }

    /// Get the bound address for testing
    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for stopping the server from outside, e.g. on a signal.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Accept connections until the draw is done or shutdown is requested.
    pub async fn run(self) -> Completion {
        let mut sessions = JoinSet::new();

        let (completion, ()) = tokio::join!(self.coordinate(), self.accept_loop(&mut sessions));

        let Server { listener, .. } = self;
        drop(listener);
        info!("Listener closed");

        // Sessions still reading see the shutdown and close their sockets.
        while let Some(result) = sessions.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Session task failed");
            }
        }

        info!(?completion, "Server stopped");
        completion
    }

    async fn accept_loop(&self, sessions: &mut JoinSet<CommitOutcome>) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.wait() => break,
                accepted = tokio::time::timeout(self.config.accept_timeout, self.listener.accept()) => accepted,
            };

            match accepted {
                Err(_elapsed) => trace!("No connection within accept timeout"),
                Ok(Ok((stream, peer))) => {
                    info!(%peer, "Connection accepted");
                    let state = Arc::clone(&self.state);
                    let shutdown = self.shutdown.clone();
                    sessions.spawn(async move { handle_session(stream, peer, &state, &shutdown).await });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Failed to accept connection");
                    if self.shutdown.is_triggered() {
                        break;
                    }
                }
            }
        }

        debug!("Acceptor stopped");
    }

    /// Wait for the barrier (or shutdown, or the deadline), then finish the
    /// server's one draw cycle. Always leaves shutdown triggered.
    async fn coordinate(&self) -> Completion {
        let deadline = async {
            match self.config.barrier_deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending().await,
            }
        };

        let completion = tokio::select! {
            _ = self.state.wait_until_complete() => self.draw_and_broadcast().await,
            _ = self.shutdown.wait() => {
                let finished = self.state.finished();
                info!(finished, total = self.state.total(), "Shutdown requested before the draw");
                close_sockets(self.state.take_sockets()).await;
                Completion::Shutdown { finished }
            }
            _ = deadline => {
                let finished = self.state.finished();
                error!(
                    finished,
                    total = self.state.total(),
                    "Barrier deadline expired before every agency finished, no draw"
                );
                close_sockets(self.state.take_sockets()).await;
                Completion::DeadlineExpired { finished }
            }
        };

        self.shutdown.trigger();
        completion
    }

    async fn draw_and_broadcast(&self) -> Completion {
        let (bets, mut sockets) = self.state.take_for_draw();
        let agencies = sockets.len();

        let bets = match bets {
            Ok(bets) => bets,
            Err(e) => {
                error!(error = %e, "Failed to load bets for the draw");
                close_sockets(sockets).await;
                return Completion::DrawFailed { agencies };
            }
        };

        let winners = find_winners(&bets, self.draw.as_ref());
        let delivered = broadcast_winners(winners, &mut sockets, self.config.send_timeout).await;
        close_sockets(sockets).await;

        Completion::Drawn {
            agencies,
            delivered,
        }
    }
}

/// Send every registered agency its winners, an empty list included.
///
/// Agencies with winners but no socket are logged and skipped. A slow or
/// broken socket costs at most `send_timeout` and never stops the others.
/// Returns the number of agencies that received their message.
pub async fn broadcast_winners<S>(
    mut winners: WinnersIndex,
    sockets: &mut HashMap<String, S>,
    send_timeout: Duration,
) -> usize
where
    S: AsyncWrite + Unpin,
{
    let mut delivered = 0;

    for (agency, socket) in sockets.iter_mut() {
        let documents = winners.remove(agency).unwrap_or_default();
        match tokio::time::timeout(send_timeout, send_winners(socket, &documents)).await {
            Ok(true) => {
                delivered += 1;
                info!(%agency, winners = documents.len(), "Winners sent");
            }
            Ok(false) => {}
            Err(_) => warn!(%agency, "Timed out sending winners"),
        }
    }

    for (agency, documents) in winners {
        warn!(
            %agency,
            winners = documents.len(),
            "No socket for agency, winners not delivered"
        );
    }

    delivered
}

async fn close_sockets<S>(sockets: HashMap<String, S>)
where
    S: AsyncWrite + Unpin,
{
    for (agency, mut socket) in sockets {
        if let Err(e) = socket.shutdown().await {
            debug!(%agency, error = %e, "Error closing connection");
        }
    }
}

/// Create a non-blocking listener with the configured accept backlog.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lottery::WinningNumber;
    use crate::protocol::client::{read_winners, send_text};
    use crate::storage::MemoryStore;
    use tokio::io::AsyncReadExt;
    use tokio::task::JoinHandle;

    fn test_config(client_total: usize) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            listen_backlog: 16,
            client_total,
            accept_timeout: Duration::from_millis(100),
            send_timeout: Duration::from_secs(1),
            barrier_deadline: None,
            winning_number: 77,
            bets_file: None,
            log_level: "info".to_string(),
        }
    }

    async fn start(config: Config) -> (SocketAddr, Shutdown, JoinHandle<Completion>) {
        let draw = Arc::new(WinningNumber(config.winning_number));
        let server = Server::bind(config, Box::new(MemoryStore::new()), draw)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        (addr, shutdown, tokio::spawn(server.run()))
    }

    /// Submit `batches` on a fresh connection; return the acks and the winners.
    async fn agency(addr: SocketAddr, batches: Vec<&'static str>) -> (Vec<u16>, Vec<u32>) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut acks = Vec::new();
        for batch in batches {
            acks.push(send_text(&mut stream, batch).await.unwrap());
        }
        let winners = read_winners(&mut stream).await.unwrap();

        // The server closes the connection after the winners.
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        (acks, winners)
    }

    async fn finish(handle: JoinHandle<Completion>) -> Completion {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server did not stop")
            .unwrap()
    }

    #[tokio::test]
    async fn test_two_agencies_receive_their_winners() {
        let (addr, _shutdown, server) = start(test_config(2)).await;

        let a = tokio::spawn(agency(addr, vec!["A,Bob,Lee,111,1990-01-01,77\nEND"]));
        let b = tokio::spawn(agency(addr, vec!["B,Ann,Ng,222,1991-02-02,77\nEND"]));

        assert_eq!(a.await.unwrap(), (vec![1], vec![111]));
        assert_eq!(b.await.unwrap(), (vec![1], vec![222]));
        assert_eq!(
            finish(server).await,
            Completion::Drawn {
                agencies: 2,
                delivered: 2
            }
        );
    }

    #[tokio::test]
    async fn test_multiple_batches_and_zero_winners() {
        let (addr, _shutdown, server) = start(test_config(2)).await;

        let a = tokio::spawn(agency(
            addr,
            vec![
                "A,Bob,Lee,111,1990-01-01,77\nA,Eva,Paz,112,1990-01-02,3\n",
                "A,Leo,Sol,113,1990-01-03,77\nEND\n",
            ],
        ));
        let b = tokio::spawn(agency(addr, vec!["B,Ann,Ng,222,1991-02-02,5\nEND\n"]));

        assert_eq!(a.await.unwrap(), (vec![2, 1], vec![111, 113]));
        assert_eq!(b.await.unwrap(), (vec![1], vec![]));
        assert!(matches!(finish(server).await, Completion::Drawn { agencies: 2, .. }));
    }

    #[tokio::test]
    async fn test_malformed_session_is_not_counted() {
        let (addr, _shutdown, server) = start(test_config(2)).await;

        let mut bad = TcpStream::connect(addr).await.unwrap();
        assert_eq!(send_text(&mut bad, "A,Bob,Lee,111").await.unwrap(), 1);
        let mut buf = [0u8; 1];
        assert_eq!(bad.read(&mut buf).await.unwrap(), 0);

        let a = tokio::spawn(agency(addr, vec!["A,Bob,Lee,111,1990-01-01,77\nEND"]));
        let b = tokio::spawn(agency(addr, vec!["B,Ann,Ng,222,1991-02-02,1\nEND"]));

        assert_eq!(a.await.unwrap(), (vec![1], vec![111]));
        assert_eq!(b.await.unwrap(), (vec![1], vec![]));
        assert_eq!(
            finish(server).await,
            Completion::Drawn {
                agencies: 2,
                delivered: 2
            }
        );
    }

    #[tokio::test]
    async fn test_failed_agency_winners_are_skipped() {
        let (addr, _shutdown, server) = start(test_config(1)).await;

        // Agency C submits a winning bet, then drops before its final batch.
        let mut partial = TcpStream::connect(addr).await.unwrap();
        assert_eq!(
            send_text(&mut partial, "C,Ivo,Ruiz,333,1993-03-03,77\n").await.unwrap(),
            1
        );
        drop(partial);

        // Give the server time to fail C's session before A finishes.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let a = agency(addr, vec!["A,Bob,Lee,111,1990-01-01,77\nEND"]).await;
        assert_eq!(a, (vec![1], vec![111]));
        assert_eq!(
            finish(server).await,
            Completion::Drawn {
                agencies: 1,
                delivered: 1
            }
        );
    }

    #[tokio::test]
    async fn test_shutdown_closes_retained_sockets() {
        let (addr, shutdown, server) = start(test_config(2)).await;

        let mut a = TcpStream::connect(addr).await.unwrap();
        send_text(&mut a, "A,Bob,Lee,111,1990-01-01,77\nEND").await.unwrap();
        let mut idle = TcpStream::connect(addr).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.trigger();
        shutdown.trigger();

        assert_eq!(finish(server).await, Completion::Shutdown { finished: 1 });
        assert!(read_winners(&mut a).await.is_err());
        let mut buf = [0u8; 1];
        assert_eq!(idle.read(&mut buf).await.unwrap(), 0);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_barrier_deadline_stops_server() {
        let mut config = test_config(2);
        config.barrier_deadline = Some(Duration::from_millis(300));
        let (addr, _shutdown, server) = start(config).await;

        let mut a = TcpStream::connect(addr).await.unwrap();
        send_text(&mut a, "A,Bob,Lee,111,1990-01-01,77\nEND").await.unwrap();

        assert_eq!(
            finish(server).await,
            Completion::DeadlineExpired { finished: 1 }
        );
        assert!(read_winners(&mut a).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config(1);
        config.port = first.local_addr().unwrap().port();

        let result = Server::bind(config, Box::new(MemoryStore::new()), Arc::new(WinningNumber(1))).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_broadcast_sends_empty_list_and_skips_missing_sockets() {
        let (a_server, mut a_client) = tokio::io::duplex(64);
        let (b_server, mut b_client) = tokio::io::duplex(64);
        let mut sockets = HashMap::from([("A".to_string(), a_server), ("B".to_string(), b_server)]);
        let winners = WinnersIndex::from([("A".to_string(), vec![10, 20, 30]), ("Z".to_string(), vec![9])]);

        let delivered = broadcast_winners(winners, &mut sockets, Duration::from_secs(1)).await;
        assert_eq!(delivered, 2);

        assert_eq!(read_winners(&mut a_client).await.unwrap(), vec![10, 20, 30]);
        assert!(read_winners(&mut b_client).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_continues_past_broken_socket() {
        let (a_server, a_client) = tokio::io::duplex(64);
        let (b_server, mut b_client) = tokio::io::duplex(64);
        drop(a_client);
        let mut sockets = HashMap::from([("A".to_string(), a_server), ("B".to_string(), b_server)]);
        let winners = WinnersIndex::from([("A".to_string(), vec![1]), ("B".to_string(), vec![2])]);

        let delivered = broadcast_winners(winners, &mut sockets, Duration::from_secs(1)).await;
        assert_eq!(delivered, 1);
        assert_eq!(read_winners(&mut b_client).await.unwrap(), vec![2]);
    }
}

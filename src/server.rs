//! linevault TCP server
//!
//! `KeyValueServer` is the lifecycle facade: `start` binds the listener and
//! launches the acceptor and coordinator tasks, `stop` broadcasts shutdown.
//! The acceptor hands every socket to the coordinator before its pumps run,
//! so a connection is always registered before its first request.

use crate::config::ServerConfig;
use crate::connection::{ClientConnection, PumpSettings};
use crate::coordinator::{shutdown_signaled, ConnectionId, Coordinator, CoordinatorHandle, ServerStats};
use crate::error::{Error, Result};
use crate::store::Store;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Pause after a failed accept so persistent errors (e.g. fd exhaustion)
/// do not spin the acceptor
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Key-value server over the colon-separated line protocol
pub struct KeyValueServer<S: Store> {
    config: ServerConfig,
    /// Store and stats publisher, handed to the coordinator on start
    pending: Option<(S, watch::Sender<ServerStats>)>,
    shutdown_tx: watch::Sender<bool>,
    stats: watch::Receiver<ServerStats>,
    local_addr: Option<SocketAddr>,
    tasks: JoinSet<()>,
}

impl<S: Store> KeyValueServer<S> {
    /// Create a server over `store`; nothing runs until `start`
    pub fn new(store: S, config: ServerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (stats_tx, stats) = watch::channel(ServerStats::default());

        Self {
            config,
            pending: Some((store, stats_tx)),
            shutdown_tx,
            stats,
            local_addr: None,
            tasks: JoinSet::new(),
        }
    }

    /// Bind `bind_addr:port` and start serving in the background.
    ///
    /// Fails if the server was stopped, was already started, the config is
    /// invalid, or the bind fails. A failed bind leaves the server ready for
    /// another attempt.
    pub async fn start(&mut self, port: u16) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::Closed);
        }
        self.config.validate()?;
        let Some((store, stats_tx)) = self.pending.take() else {
            return Err(Error::AlreadyStarted);
        };

        let bound = match TcpListener::bind((self.config.bind_addr.as_str(), port)).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.pending = Some((store, stats_tx));
                return Err(e.into());
            }
        };

        let (coordinator, handle) =
            Coordinator::new(store, &self.config, self.shutdown_tx.subscribe(), stats_tx);
        let acceptor = Acceptor {
            listener,
            coordinator: handle,
            shutdown: self.shutdown_tx.subscribe(),
            settings: PumpSettings::from(&self.config),
            next_id: 0,
        };

        self.tasks.spawn(async move {
            coordinator.run().await;
        });
        self.tasks.spawn(acceptor.run());

        self.local_addr = Some(local_addr);
        info!("linevault server listening on {}", local_addr);
        Ok(())
    }

    /// Signal shutdown. Idempotent; does not wait for connections to drain.
    pub fn stop(&self) {
        let signaled = self.shutdown_tx.send_if_modified(|stopped| {
            let first = !*stopped;
            *stopped = true;
            first
        });
        if signaled {
            info!("Shutdown signal sent");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Wait for the acceptor and coordinator to finish after `stop`
    pub async fn wait(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!("server task failed: {}", e);
            }
        }
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stats(&self) -> ServerStats {
        *self.stats.borrow()
    }

    /// Connections currently open and registered
    pub fn active_count(&self) -> usize {
        self.stats().active
    }

    /// Connections that have disconnected since start
    pub fn dropped_count(&self) -> usize {
        self.stats().dropped
    }
}

/// Accept loop; owns the listening socket, which closes when the loop exits
struct Acceptor {
    listener: TcpListener,
    coordinator: CoordinatorHandle,
    shutdown: watch::Receiver<bool>,
    settings: PumpSettings,
    next_id: ConnectionId,
}

impl Acceptor {
    async fn run(mut self) {
        loop {
            let accepted = tokio::select! {
                biased;

                _ = shutdown_signaled(&mut self.shutdown) => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => self.admit(stream, addr).await,
                Err(_) if self.stopping() => break,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    if !self.backoff().await {
                        break;
                    }
                }
            }
        }

        info!("Acceptor stopped");
    }

    /// Sleep out `ACCEPT_BACKOFF`; `false` if shutdown cut it short
    async fn backoff(&mut self) -> bool {
        tokio::select! {
            biased;

            _ = shutdown_signaled(&mut self.shutdown) => false,
            _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn admit(&mut self, stream: TcpStream, addr: SocketAddr) {
        self.next_id += 1;
        let id = self.next_id;
        debug!(conn = id, %addr, "New client connected");
        if let Err(e) = stream.set_nodelay(self.settings.tcp_nodelay) {
            warn!(conn = id, error = %e, "Failed to set TCP_NODELAY");
        }

        let (handle, connection) = ClientConnection::new(id, stream, addr);
        if !self.coordinator.connect(id, handle).await {
            // Shutting down; dropping the connection closes the socket
            debug!(conn = id, "Connection refused during shutdown");
            return;
        }
        connection.spawn(self.coordinator.clone(), self.settings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn test_server() -> KeyValueServer<MemoryStore> {
        KeyValueServer::new(MemoryStore::new(), ServerConfig::default())
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_port() {
        let mut server = test_server();
        assert!(server.local_addr().is_none());

        server.start(0).await.unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.active_count(), 0);
        assert_eq!(server.dropped_count(), 0);

        server.stop();
        server.wait().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut server = test_server();
        server.start(0).await.unwrap();
        assert!(matches!(server.start(0).await, Err(Error::AlreadyStarted)));
        server.stop();
    }

    #[tokio::test]
    async fn test_start_after_stop_is_rejected() {
        let mut server = test_server();
        server.stop();
        server.stop();
        assert!(server.is_stopped());
        assert!(matches!(server.start(0).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_accept_backoff_yields_to_shutdown() {
        let config = ServerConfig::default();
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (stats_tx, _stats) = watch::channel(ServerStats::default());
        let (_coordinator, handle) =
            Coordinator::new(MemoryStore::new(), &config, shutdown_tx.subscribe(), stats_tx);
        let mut acceptor = Acceptor {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
            coordinator: handle,
            shutdown,
            settings: PumpSettings::from(&config),
            next_id: 0,
        };

        assert!(acceptor.backoff().await);
        shutdown_tx.send_replace(true);
        assert!(!acceptor.backoff().await);
    }

    #[tokio::test]
    async fn test_bind_failure_is_returned() {
        let mut first = test_server();
        first.start(0).await.unwrap();
        let port = first.local_addr().unwrap().port();

        let mut second = test_server();
        assert!(matches!(second.start(port).await, Err(Error::Io(_))));
        // The failed server can still bind elsewhere
        second.start(0).await.unwrap();

        first.stop();
        second.stop();
        first.wait().await;
        second.wait().await;
    }
}

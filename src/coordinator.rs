//! The serializing coordinator
//!
//! One task owns the client registry, the liveness counters and the store.
//! Pumps reach it only through messages: membership changes arrive on the
//! event channel, commands on the request channel, each request carrying its
//! own oneshot reply. Because the coordinator handles one message at a time,
//! every store operation from every client is totally ordered.

use crate::config::ServerConfig;
use crate::connection::ClientHandle;
use crate::protocol::{format_values, parse_command, Command};
use crate::store::Store;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

pub type ConnectionId = u64;

/// A command line from one connection, waiting for its response lines
#[derive(Debug)]
pub struct Request {
    pub conn_id: ConnectionId,
    pub command: Bytes,
    pub reply: oneshot::Sender<Vec<Bytes>>,
}

/// Membership changes reported by the acceptor and the pumps
#[derive(Debug)]
pub enum ClientEvent {
    Connect {
        id: ConnectionId,
        handle: ClientHandle,
    },
    Disconnect {
        id: ConnectionId,
    },
}

/// Point-in-time connection counters published by the coordinator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Connections currently registered
    pub active: usize,
    /// Connections that have gone away since start
    pub dropped: usize,
}

/// Resolves once shutdown has been signaled, or the signal source is gone.
pub(crate) async fn shutdown_signaled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// State touched by nobody but the coordinator task
#[derive(Debug, Default)]
struct ServerState {
    clients: HashMap<ConnectionId, ClientHandle>,
    active: usize,
    dropped: usize,
    closed: bool,
}

impl ServerState {
    fn stats(&self) -> ServerStats {
        ServerStats {
            active: self.active,
            dropped: self.dropped,
        }
    }
}

pub struct Coordinator<S: Store> {
    store: S,
    state: ServerState,
    events: mpsc::Receiver<ClientEvent>,
    requests: mpsc::Receiver<Request>,
    shutdown: watch::Receiver<bool>,
    stats: watch::Sender<ServerStats>,
}

impl<S: Store> Coordinator<S> {
    /// Create the coordinator and the handle pumps use to reach it.
    ///
    /// Counters are published on `stats` after every membership change.
    pub fn new(
        store: S,
        config: &ServerConfig,
        shutdown: watch::Receiver<bool>,
        stats: watch::Sender<ServerStats>,
    ) -> (Self, CoordinatorHandle) {
        let (event_tx, events) = mpsc::channel(config.event_channel_capacity);
        let (request_tx, requests) = mpsc::channel(config.request_channel_capacity);

        let handle = CoordinatorHandle {
            events: event_tx,
            requests: request_tx,
            shutdown: shutdown.clone(),
        };
        let coordinator = Self {
            store,
            state: ServerState::default(),
            events,
            requests,
            shutdown,
            stats,
        };
        (coordinator, handle)
    }

    /// Run the event loop until shutdown; hands the store back afterwards.
    pub async fn run(mut self) -> S {
        while !self.state.closed {
            tokio::select! {
                biased;

                _ = shutdown_signaled(&mut self.shutdown) => self.close(),
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(request) = self.requests.recv() => self.handle_request(request),
            }
        }

        info!(dropped = self.state.dropped, "coordinator stopped");
        self.store
    }

    fn handle_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connect { id, handle } => {
                debug!(conn = id, addr = %handle.addr(), "client registered");
                self.state.clients.insert(id, handle);
                self.state.active += 1;
            }
            ClientEvent::Disconnect { id } => {
                if self.state.clients.remove(&id).is_none() {
                    return;
                }
                debug!(conn = id, "client deregistered");
                self.state.active -= 1;
                self.state.dropped += 1;
            }
        }
        self.publish();
    }

    fn handle_request(&mut self, request: Request) {
        let Request {
            conn_id,
            command,
            reply,
        } = request;

        let responses = if self.state.clients.contains_key(&conn_id) {
            self.execute(conn_id, &command)
        } else {
            Vec::new()
        };

        // The requester may already be gone
        let _ = reply.send(responses);
    }

    fn execute(&mut self, conn_id: ConnectionId, line: &[u8]) -> Vec<Bytes> {
        let command = parse_command(line);
        trace!(conn = conn_id, command = command.name(), "executing");

        let result = match command {
            Command::Put { key, value } => self.store.put(key, value),
            Command::Get { key } => return format_values(key, &self.store.get(key)),
            Command::Update { key, old, new } => self.store.update(key, old, new),
            Command::Delete { key } => self.store.delete(key),
            Command::Unrecognized => Ok(()),
        };

        if let Err(e) = result {
            warn!(conn = conn_id, command = command.name(), error = %e, "store operation failed");
        }
        Vec::new()
    }

    /// Close every registered connection and stop processing.
    fn close(&mut self) {
        let closing = self.state.clients.len();
        for (_, handle) in self.state.clients.drain() {
            handle.close();
        }
        self.state.dropped += closing;
        self.state.active = 0;
        self.state.closed = true;
        self.publish();
        info!(closed = closing, "coordinator closing client connections");
    }

    fn publish(&self) {
        self.stats.send_replace(self.state.stats());
    }
}

/// Cloneable handle to the coordinator, used by the acceptor and the pumps
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    events: mpsc::Sender<ClientEvent>,
    requests: mpsc::Sender<Request>,
    shutdown: watch::Receiver<bool>,
}

impl CoordinatorHandle {
    /// Register a connection. Returns `false` if the coordinator is shutting
    /// down or gone, in which case the connection must not be served.
    pub async fn connect(&self, id: ConnectionId, handle: ClientHandle) -> bool {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            biased;

            _ = shutdown_signaled(&mut shutdown) => false,
            sent = self.events.send(ClientEvent::Connect { id, handle }) => sent.is_ok(),
        }
    }

    /// Deregister a connection. Never blocks past shutdown.
    pub async fn disconnect(&self, id: ConnectionId) {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = shutdown_signaled(&mut shutdown) => {}
            _ = self.events.send(ClientEvent::Disconnect { id }) => {}
        }
    }

    /// Send one command line and wait for its response lines.
    ///
    /// Returns `None` if the coordinator stopped before answering.
    pub async fn request(&self, conn_id: ConnectionId, command: Bytes) -> Option<Vec<Bytes>> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request {
                conn_id,
                command,
                reply,
            })
            .await
            .ok()?;
        response.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};
    use tokio::sync::broadcast::error::RecvError;
    use tokio::task::JoinHandle;

    struct Harness {
        handle: CoordinatorHandle,
        shutdown: watch::Sender<bool>,
        stats: watch::Receiver<ServerStats>,
        task: JoinHandle<MemoryStore>,
    }

    fn start() -> Harness {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (stats_tx, stats) = watch::channel(ServerStats::default());
        let (coordinator, handle) = Coordinator::new(
            MemoryStore::new(),
            &ServerConfig::default(),
            shutdown_rx,
            stats_tx,
        );
        let task = tokio::spawn(coordinator.run());
        Harness {
            handle,
            shutdown,
            stats,
            task,
        }
    }

    async fn send(handle: &CoordinatorHandle, id: ConnectionId, line: &'static [u8]) -> Vec<Bytes> {
        handle.request(id, Bytes::from_static(line)).await.unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let h = start();
        let (client, _kill) = ClientHandle::detached();
        assert!(h.handle.connect(1, client).await);

        assert!(send(&h.handle, 1, b"Put:a:1").await.is_empty());
        assert!(send(&h.handle, 1, b"Put:a:x:y").await.is_empty());
        assert_eq!(
            send(&h.handle, 1, b"Get:a").await,
            vec![Bytes::from_static(b"a:1"), Bytes::from_static(b"a:x:y")]
        );
        assert!(send(&h.handle, 1, b"Get:missing").await.is_empty());
        assert!(send(&h.handle, 1, b"Ping").await.is_empty());
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let h = start();
        let (client, _kill) = ClientHandle::detached();
        h.handle.connect(7, client).await;

        send(&h.handle, 7, b"Put:a:1").await;
        send(&h.handle, 7, b"Update:a:1:2").await;
        assert_eq!(send(&h.handle, 7, b"Get:a").await, vec![Bytes::from_static(b"a:2")]);

        send(&h.handle, 7, b"Delete:a").await;
        assert!(send(&h.handle, 7, b"Get:a").await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_connection_gets_empty_reply() {
        let h = start();
        let (client, _kill) = ClientHandle::detached();
        h.handle.connect(1, client).await;
        send(&h.handle, 1, b"Put:a:1").await;

        // Requests from unregistered connections are answered but not executed
        assert!(send(&h.handle, 99, b"Get:a").await.is_empty());
        assert!(send(&h.handle, 99, b"Delete:a").await.is_empty());
        assert_eq!(send(&h.handle, 1, b"Get:a").await, vec![Bytes::from_static(b"a:1")]);
    }

    #[tokio::test]
    async fn test_counters_and_idempotent_disconnect() {
        let h = start();
        for id in 1..=3 {
            let (client, _kill) = ClientHandle::detached();
            h.handle.connect(id, client).await;
        }
        h.handle.disconnect(2).await;
        h.handle.disconnect(2).await;
        h.handle.disconnect(42).await;

        // Events are handled before requests, so a round trip observes them
        send(&h.handle, 1, b"Ping").await;
        assert_eq!(
            *h.stats.borrow(),
            ServerStats {
                active: 2,
                dropped: 1
            }
        );
    }

    #[tokio::test]
    async fn test_shutdown_closes_registered_clients() {
        let h = start();
        let (client, mut kill) = ClientHandle::detached();
        h.handle.connect(1, client).await;
        send(&h.handle, 1, b"Put:a:1").await;

        h.shutdown.send_replace(true);
        let store = h.task.await.unwrap();

        assert!(matches!(kill.recv().await, Ok(()) | Err(RecvError::Closed)));
        assert_eq!(store.get(b"a"), vec![b"1".to_vec()]);
        assert_eq!(h.stats.borrow().active, 0);
        assert!(h.handle.request(1, Bytes::from_static(b"Get:a")).await.is_none());

        // Late connects are refused instead of hanging
        let (late, _kill) = ClientHandle::detached();
        assert!(!h.handle.connect(2, late).await);
    }
}

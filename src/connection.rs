//! Per-connection pumps
//!
//! Every accepted socket gets a Reader and a Writer task joined by a bounded
//! outbound queue. The Reader is the only producer and the Writer the only
//! consumer, so the queue closes from the pump side and nothing can post to
//! a queue that is already torn down. The coordinator keeps a `ClientHandle`
//! whose kill switch stops both pumps; dropping the handle has the same
//! effect.

use crate::codec::LineCodec;
use crate::config::ServerConfig;
use crate::coordinator::{ConnectionId, CoordinatorHandle};
use crate::error::Result;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

/// Per-connection limits taken from the server configuration
#[derive(Debug, Clone, Copy)]
pub struct PumpSettings {
    pub queue_capacity: usize,
    pub max_line_length: usize,
    pub drain_timeout: Duration,
    pub tcp_nodelay: bool,
}

impl From<&ServerConfig> for PumpSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            queue_capacity: config.outbound_queue_capacity,
            max_line_length: config.max_line_length,
            drain_timeout: config.drain_timeout(),
            tcp_nodelay: config.tcp_nodelay,
        }
    }
}

/// The coordinator's registry entry for a connection
#[derive(Debug)]
pub struct ClientHandle {
    addr: SocketAddr,
    kill: broadcast::Sender<()>,
}

impl ClientHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop both pumps; they close the socket and the outbound queue.
    pub fn close(self) {
        let _ = self.kill.send(());
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, broadcast::Receiver<()>) {
        let (kill, kill_rx) = broadcast::channel(1);
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        (Self { addr, kill }, kill_rx)
    }
}

/// An accepted socket whose pumps have not been started yet
pub struct ClientConnection {
    id: ConnectionId,
    addr: SocketAddr,
    stream: TcpStream,
    reader_kill: broadcast::Receiver<()>,
    writer_kill: broadcast::Receiver<()>,
}

impl ClientConnection {
    /// Wrap an accepted socket, returning the handle to register with the
    /// coordinator alongside it.
    pub fn new(id: ConnectionId, stream: TcpStream, addr: SocketAddr) -> (ClientHandle, Self) {
        let (kill, reader_kill) = broadcast::channel(1);
        let writer_kill = kill.subscribe();

        let connection = Self {
            id,
            addr,
            stream,
            reader_kill,
            writer_kill,
        };
        (ClientHandle { addr, kill }, connection)
    }

    /// Launch the Reader and Writer tasks.
    pub fn spawn(self, coordinator: CoordinatorHandle, settings: PumpSettings) {
        let (read_half, write_half) = self.stream.into_split();
        spawn_pumps(
            self.id,
            self.addr,
            (read_half, write_half),
            (self.reader_kill, self.writer_kill),
            coordinator,
            settings,
        );
    }
}

/// Join a Reader and a Writer over `io` with a fresh outbound queue.
fn spawn_pumps<R, W>(
    id: ConnectionId,
    addr: SocketAddr,
    io: (R, W),
    kills: (broadcast::Receiver<()>, broadcast::Receiver<()>),
    coordinator: CoordinatorHandle,
    settings: PumpSettings,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = io;
    let (reader_kill, writer_kill) = kills;
    let (outbound_tx, outbound_rx) = mpsc::channel(settings.queue_capacity);

    let writer = Writer {
        id,
        sink: FramedWrite::new(write_half, LineCodec::new(settings.max_line_length)),
        outbound: outbound_rx,
        kill: writer_kill,
        drain_timeout: settings.drain_timeout,
    };
    let reader = Reader {
        id,
        addr,
        lines: FramedRead::new(read_half, LineCodec::new(settings.max_line_length)),
        outbound: outbound_tx,
        kill: reader_kill,
        coordinator,
    };

    tokio::spawn(writer.run());
    tokio::spawn(reader.run());
}

/// Inbound pump: socket lines to coordinator requests
struct Reader<R> {
    id: ConnectionId,
    addr: SocketAddr,
    lines: FramedRead<R, LineCodec>,
    outbound: mpsc::Sender<Bytes>,
    kill: broadcast::Receiver<()>,
    coordinator: CoordinatorHandle,
}

impl<R: AsyncRead + Unpin> Reader<R> {
    async fn run(mut self) {
        debug!(conn = self.id, addr = %self.addr, "reader started");

        loop {
            let line = tokio::select! {
                biased;

                _ = self.kill.recv() => {
                    debug!(conn = self.id, "connection closed by coordinator");
                    break;
                }
                _ = self.outbound.closed() => {
                    debug!(conn = self.id, "writer gone, closing connection");
                    break;
                }
                frame = self.lines.next() => match frame {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        debug!(conn = self.id, error = %e, "read failed");
                        break;
                    }
                    None => {
                        debug!(conn = self.id, "client closed connection");
                        break;
                    }
                },
            };

            let responses = tokio::select! {
                biased;

                _ = self.kill.recv() => break,
                responses = self.coordinator.request(self.id, line) => match responses {
                    Some(responses) => responses,
                    None => break,
                },
            };

            for response in responses {
                match self.outbound.try_send(response) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        debug!(conn = self.id, "outbound queue full, dropping response");
                    }
                    // Writer is gone; the next select notices
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        }

        self.coordinator.disconnect(self.id).await;
        debug!(conn = self.id, "reader stopped");
    }
}

/// Outbound pump: queued responses to the socket
struct Writer<W> {
    id: ConnectionId,
    sink: FramedWrite<W, LineCodec>,
    outbound: mpsc::Receiver<Bytes>,
    kill: broadcast::Receiver<()>,
    drain_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> Writer<W> {
    async fn run(mut self) {
        loop {
            let payload = tokio::select! {
                biased;

                _ = self.kill.recv() => break,
                payload = self.outbound.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };

            // A client that stops reading must not keep the writer past a kill
            let written = tokio::select! {
                _ = self.kill.recv() => break,
                written = write_batch(&mut self.sink, &mut self.outbound, payload) => written,
            };
            if let Err(e) = written {
                // Dropping the queue tells the reader to disconnect
                debug!(conn = self.id, error = %e, "write failed");
                return;
            }
        }

        self.drain().await;
        debug!(conn = self.id, "writer stopped");
    }

    /// Flush whatever is already queued, then shut the write half down.
    async fn drain(&mut self) {
        self.outbound.close();

        let sink = &mut self.sink;
        let outbound = &mut self.outbound;
        let flush = async move {
            while let Some(payload) = outbound.recv().await {
                sink.feed(payload).await?;
            }
            sink.close().await
        };

        match tokio::time::timeout(self.drain_timeout, flush).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(conn = self.id, error = %e, "flush on close failed"),
            Err(_) => debug!(conn = self.id, "gave up flushing queued responses"),
        }
    }
}

/// Write `first` and everything else already queued, then flush once.
async fn write_batch<W: AsyncWrite + Unpin>(
    sink: &mut FramedWrite<W, LineCodec>,
    outbound: &mut mpsc::Receiver<Bytes>,
    first: Bytes,
) -> Result<()> {
    sink.feed(first).await?;
    while let Ok(payload) = outbound.try_recv() {
        sink.feed(payload).await?;
    }
    sink.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{Coordinator, ServerStats};
    use crate::store::MemoryStore;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::watch;
    use tokio::time::timeout;

    /// A socket whose peer has already reset the connection
    struct ResetSocket;

    impl AsyncWrite for ResetSocket {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_write_failure_disconnects_client() {
        let config = ServerConfig::default();
        let (_shutdown, shutdown_rx) = watch::channel(false);
        let (stats_tx, mut stats) = watch::channel(ServerStats::default());
        let (coordinator, handle) =
            Coordinator::new(MemoryStore::new(), &config, shutdown_rx, stats_tx);
        tokio::spawn(coordinator.run());

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let (kill, reader_kill) = broadcast::channel(1);
        let writer_kill = kill.subscribe();
        assert!(handle.connect(1, ClientHandle { addr, kill }).await);

        let (mut client, server_side) = tokio::io::duplex(1024);
        spawn_pumps(
            1,
            addr,
            (server_side, ResetSocket),
            (reader_kill, writer_kill),
            handle,
            PumpSettings::from(&config),
        );

        // The Get response is the first write, and it fails while the
        // client's side of the connection stays open
        client.write_all(b"Put:a:1\nGet:a\n").await.unwrap();

        let expected = ServerStats { active: 0, dropped: 1 };
        timeout(Duration::from_secs(5), stats.wait_for(|s| *s == expected))
            .await
            .unwrap()
            .unwrap();
        drop(client);
    }

    #[tokio::test]
    async fn test_writer_batches_queued_responses() {
        let (mut client, server_side) = tokio::io::duplex(1024);
        let mut sink = FramedWrite::new(server_side, LineCodec::default());
        let (tx, mut rx) = mpsc::channel(4);
        tx.try_send(Bytes::from_static(b"k:2")).unwrap();
        tx.try_send(Bytes::from_static(b"k:3")).unwrap();

        write_batch(&mut sink, &mut rx, Bytes::from_static(b"k:1")).await.unwrap();
        assert!(rx.try_recv().is_err());

        let mut received = [0u8; 12];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"k:1\nk:2\nk:3\n");
    }
}

//! Per-connection plumbing shared by the server and the client
//!
//! Each connection is split in two: the reading side runs in the task that
//! owns the socket, the writing side is a dedicated task draining an
//! outbound queue. Handlers reply through a cloneable [`ConnectionHandle`]
//! and never touch the socket directly.

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use tracker_common::{Error, Result};
use tracker_proto::{HEADER_LEN, Packet, PacketCodec};

/// Outbound queue depth per connection
pub const OUTBOUND_QUEUE: usize = 256;

pub(crate) enum Outbound {
    Packet(Packet),
    /// Flush what is queued, then shut the socket down
    Close,
}

/// Reply path to one connection
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    peer: SocketAddr,
    tx: mpsc::Sender<Outbound>,
    closed: Arc<Notify>,
}

impl ConnectionHandle {
    pub(crate) fn new(id: u64, peer: SocketAddr, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            peer,
            tx,
            closed: Arc::new(Notify::new()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue a packet for the peer
    pub async fn send(&self, packet: Packet) -> Result<()> {
        self.tx
            .send(Outbound::Packet(packet))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Send whatever is queued, then close the connection
    pub async fn close(&self) {
        let _ = self.tx.send(Outbound::Close).await;
        self.closed.notify_one();
    }

    /// Resolves once [`close`](Self::close) has been called
    pub(crate) async fn closed(&self) {
        self.closed.notified().await;
    }
}

/// Spawn the task that writes queued packets to `writer`
pub(crate) fn spawn_writer<W>(
    mut writer: W,
    codec: PacketCodec,
    mut rx: mpsc::Receiver<Outbound>,
    label: String,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 4096);
        while let Some(message) = rx.recv().await {
            let packet = match message {
                Outbound::Packet(packet) => packet,
                Outbound::Close => break,
            };

            buf.clear();
            if let Err(e) = codec.encode(&packet, &mut buf) {
                warn!("{}: dropping {} #{}: {}", label, packet.packet_type, packet.request_id, e);
                continue;
            }
            // Batch whatever else is already queued into the same write
            while buf.len() < 64 * 1024 {
                match rx.try_recv() {
                    Ok(Outbound::Packet(next)) => {
                        if let Err(e) = codec.encode(&next, &mut buf) {
                            warn!("{}: dropping {} #{}: {}", label, next.packet_type, next.request_id, e);
                        }
                    }
                    Ok(Outbound::Close) => {
                        let _ = writer.write_all(&buf).await;
                        let _ = writer.shutdown().await;
                        debug!("{}: closed by local side", label);
                        return;
                    }
                    Err(_) => break,
                }
            }
            if let Err(e) = writer.write_all(&buf).await {
                debug!("{}: write failed: {}", label, e);
                return;
            }
        }
        let _ = writer.shutdown().await;
        debug!("{}: writer finished", label);
    })
}

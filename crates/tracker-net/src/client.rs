//! Multiplexing client connection
//!
//! Many requests can be in flight on one connection. Each gets a fresh
//! request id and a oneshot slot in the pending map; the reading task
//! completes the slot whose id matches the response. Whoever removes the
//! entry from the map (response, timeout or connection loss) resolves the
//! request, so every request resolves exactly once.

use crate::connection::{OUTBOUND_QUEUE, Outbound, spawn_writer};
use bytes::Bytes;
use dashmap::DashMap;
use prost::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use tracker_common::{Error, Result};
use tracker_proto::{FrameReader, Packet, PacketCodec, PacketType};

type PendingMap = DashMap<u64, oneshot::Sender<Result<Packet>>>;

struct ClientShared {
    pending: PendingMap,
    closed: AtomicBool,
}

impl ClientShared {
    /// Fail every outstanding request
    fn fail_all(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, slot)) = self.pending.remove(&id) {
                let _ = slot.send(Err(Error::ConnectionFailed(reason.to_string())));
            }
        }
    }
}

/// A client connection to a tracker
pub struct NetClient {
    peer: SocketAddr,
    shared: Arc<ClientShared>,
    tx: mpsc::Sender<Outbound>,
    next_request_id: AtomicU64,
    default_timeout: Duration,
    reader: JoinHandle<()>,
}

impl NetClient {
    /// Dial `addr`
    pub async fn connect(addr: impl ToSocketAddrs, codec: PacketCodec, default_timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr()?;

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        spawn_writer(write_half, codec, rx, format!("client to {peer}"));

        let shared = Arc::new(ClientShared {
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
        });
        let reader = tokio::spawn(read_loop(FrameReader::new(read_half, codec), Arc::clone(&shared), peer));

        debug!("Connected to {}", peer);
        Ok(Self {
            peer,
            shared,
            tx,
            next_request_id: AtomicU64::new(1),
            default_timeout,
            reader,
        })
    }

    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Whether the connection has been lost or closed
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Requests still waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a request and wait for its response
    ///
    /// Fails with [`Error::Timeout`] when nothing arrives within `timeout`;
    /// a response arriving later is dropped. The returned packet may be an
    /// ERROR packet; see [`call`](Self::call) for the decoded form.
    pub async fn send_sync(&self, packet_type: PacketType, body: impl Into<Bytes>, timeout: Duration) -> Result<Packet> {
        let request_id = self.next_request_id();
        let (slot, response) = oneshot::channel();
        self.shared.pending.insert(request_id, slot);

        // Registered after a connection loss swept the map
        if self.is_closed() {
            self.shared.pending.remove(&request_id);
            return Err(Error::ConnectionClosed);
        }

        let packet = Packet::new(packet_type, request_id, body);
        if self.tx.send(Outbound::Packet(packet)).await.is_err() {
            self.shared.pending.remove(&request_id);
            return Err(Error::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.shared.pending.remove(&request_id);
                debug!("{} #{} to {} timed out after {:?}", packet_type, request_id, self.peer, timeout);
                Err(Error::Timeout)
            }
        }
    }

    /// Typed request/response with the default timeout
    pub async fn call<Req, Resp>(&self, packet_type: PacketType, request: &Req) -> Result<Resp>
    where
        Req: Message,
        Resp: Message + Default,
    {
        self.call_with_timeout(packet_type, request, self.default_timeout).await
    }

    pub async fn call_with_timeout<Req, Resp>(
        &self,
        packet_type: PacketType,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Message,
        Resp: Message + Default,
    {
        self.send_sync(packet_type, request.encode_to_vec(), timeout)
            .await?
            .into_result()
    }

    /// Close the connection, failing outstanding requests
    pub async fn close(&self) {
        let _ = self.tx.send(Outbound::Close).await;
        self.shared.fail_all("connection closed locally");
    }
}

impl Drop for NetClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R>(mut reader: FrameReader<R>, shared: Arc<ClientShared>, peer: SocketAddr)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let reason = loop {
        match reader.next_packet().await {
            Ok(Some(packet)) if packet.packet_type.is_response() => {
                match shared.pending.remove(&packet.request_id) {
                    Some((_, slot)) => {
                        let _ = slot.send(Ok(packet));
                    }
                    None => debug!(
                        "Dropping response #{} from {}: no request waiting",
                        packet.request_id, peer
                    ),
                }
            }
            Ok(Some(packet)) => {
                debug!("Ignoring unsolicited {} from {}", packet.packet_type, peer);
            }
            Ok(None) => break "connection closed by peer".to_string(),
            Err(e) => {
                warn!("Connection to {} failed: {}", peer, e);
                break e.to_string();
            }
        }
    };
    shared.fail_all(&reason);
}

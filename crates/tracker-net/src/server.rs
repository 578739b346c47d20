//! TCP server: accept loops and per-connection read loops

use crate::connection::{ConnectionHandle, OUTBOUND_QUEUE, spawn_writer};
use crate::dispatcher::Dispatcher;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracker_common::{Error, Result};
use tracker_proto::{FrameReader, PacketCodec};

struct ServerShared {
    dispatcher: Arc<Dispatcher>,
    codec: PacketCodec,
    next_connection_id: AtomicU64,
    open_connections: AtomicUsize,
    close_connections: watch::Sender<bool>,
}

/// Listens on one or more addresses and feeds packets to a [`Dispatcher`]
pub struct NetServer {
    shared: Arc<ServerShared>,
    local_addrs: Vec<SocketAddr>,
    stop_accepting: watch::Sender<bool>,
    accept_loops: Mutex<Vec<JoinHandle<()>>>,
}

impl NetServer {
    /// Bind every address and start accepting
    ///
    /// Port 0 binds an ephemeral port; see [`local_addrs`](Self::local_addrs).
    pub async fn bind(addrs: &[SocketAddr], dispatcher: Arc<Dispatcher>, codec: PacketCodec) -> Result<Self> {
        if addrs.is_empty() {
            return Err(Error::configuration("no listen address"));
        }

        let mut listeners = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| Error::ConnectionFailed(format!("failed to bind {addr}: {e}")))?;
            listeners.push(listener);
        }

        let (stop_accepting, _) = watch::channel(false);
        let (close_connections, _) = watch::channel(false);
        let shared = Arc::new(ServerShared {
            dispatcher,
            codec,
            next_connection_id: AtomicU64::new(1),
            open_connections: AtomicUsize::new(0),
            close_connections,
        });

        let mut local_addrs = Vec::with_capacity(listeners.len());
        let mut accept_loops = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let addr = listener.local_addr()?;
            info!("Listening on {}", addr);
            local_addrs.push(addr);
            accept_loops.push(tokio::spawn(accept_loop(
                listener,
                Arc::clone(&shared),
                stop_accepting.subscribe(),
            )));
        }

        Ok(Self {
            shared,
            local_addrs,
            stop_accepting,
            accept_loops: Mutex::new(accept_loops),
        })
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn open_connections(&self) -> usize {
        self.shared.open_connections.load(Ordering::SeqCst)
    }

    /// Close every listener; open connections keep being served
    pub async fn stop_accepting(&self) {
        self.stop_accepting.send_replace(true);
        let loops: Vec<_> = std::mem::take(&mut *self.accept_loops.lock());
        for handle in loops {
            let _ = handle.await;
        }
        info!("Stopped accepting connections on {:?}", self.local_addrs);
    }

    /// Stop reading from every open connection
    pub fn close_connections(&self) {
        self.shared.close_connections.send_replace(true);
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>, mut stop: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    serve_connection(stream, peer, shared).await;
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<ServerShared>) {
    let id = shared.next_connection_id.fetch_add(1, Ordering::Relaxed);
    shared.open_connections.fetch_add(1, Ordering::SeqCst);
    debug!("Connection {} from {}", id, peer);
    let _ = stream.set_nodelay(true);

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    let writer = spawn_writer(write_half, shared.codec, rx, format!("connection {id} ({peer})"));
    let handle = ConnectionHandle::new(id, peer, tx);
    let mut reader = FrameReader::new(read_half, shared.codec);
    let mut close_all = shared.close_connections.subscribe();

    loop {
        if *close_all.borrow_and_update() {
            break;
        }
        tokio::select! {
            next = reader.next_packet() => match next {
                Ok(Some(packet)) => {
                    if let Err(e) = shared.dispatcher.dispatch(&handle, packet).await {
                        warn!("Closing connection {} ({}): {}", id, peer, e);
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Closing connection {} ({}): {}", id, peer, e);
                    break;
                }
            },
            () = handle.closed() => break,
            _ = close_all.changed() => break,
        }
    }

    // In-flight handlers keep their own handle clones; the writer ends once
    // they are done and every sender is gone.
    drop(handle);
    let _ = writer.await;
    shared.open_connections.fetch_sub(1, Ordering::SeqCst);
    debug!("Connection {} from {} closed", id, peer);
}

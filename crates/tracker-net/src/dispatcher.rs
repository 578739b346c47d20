//! Packet routing
//!
//! Handlers are registered per packet type at startup. The dispatcher
//! looks the handler up on the connection's reading task and runs it on
//! the shared [`WorkerPool`], so a slow handler never stalls socket I/O.

use crate::connection::ConnectionHandle;
use crate::pool::WorkerPool;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};
use tracker_common::{Error, Result};
use tracker_proto::{Packet, PacketType};

/// What the connection does with a handler's outcome
#[derive(Debug)]
pub enum Reply {
    /// Send the packet, keep the connection open
    Respond(Packet),
    /// Send the packet, then close the connection
    RespondAndClose(Packet),
    /// Send nothing
    None,
}

/// Where a request came from
#[derive(Clone, Copy, Debug)]
pub struct RequestContext {
    pub connection_id: u64,
    pub peer: SocketAddr,
}

/// Serves one or more packet types
#[async_trait]
pub trait PacketHandler: Send + Sync + 'static {
    /// Handle a request
    ///
    /// An error becomes an ERROR packet carrying the request id; a
    /// protocol error additionally closes the connection.
    async fn handle(&self, ctx: RequestContext, packet: Packet) -> Result<Reply>;
}

/// Packet type to handler table
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<PacketType, Arc<dyn PacketHandler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `packet_type` to `handler`, replacing any earlier registration
    pub fn register(&mut self, packet_type: PacketType, handler: Arc<dyn PacketHandler>) -> &mut Self {
        if self.handlers.insert(packet_type, handler).is_some() {
            warn!("Handler for {} replaced", packet_type);
        }
        self
    }

    pub fn get(&self, packet_type: PacketType) -> Option<&Arc<dyn PacketHandler>> {
        self.handlers.get(&packet_type)
    }

    pub fn types(&self) -> Vec<PacketType> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }
}

/// Routes decoded packets to handlers on the worker pool
pub struct Dispatcher {
    registry: HandlerRegistry,
    pool: WorkerPool,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry, pool: WorkerPool) -> Self {
        Self { registry, pool }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Hand one packet to its handler
    ///
    /// Returns an error only for a protocol violation, after which the
    /// caller must drop the connection. Overload is answered in-band.
    pub async fn dispatch(&self, conn: &ConnectionHandle, packet: Packet) -> Result<()> {
        let Some(handler) = self.registry.get(packet.packet_type) else {
            return Err(Error::UnknownPacketType(packet.packet_type.0));
        };

        let handler = Arc::clone(handler);
        let reply_to = conn.clone();
        let ctx = RequestContext {
            connection_id: conn.id(),
            peer: conn.peer(),
        };
        let request_id = packet.request_id;
        let packet_type = packet.packet_type;

        let job = async move {
            let reply = match handler.handle(ctx, packet).await {
                Ok(reply) => reply,
                Err(e) if e.is_protocol() => {
                    warn!("{} from {}: {}", packet_type, ctx.peer, e);
                    Reply::RespondAndClose(Packet::error(request_id, &e))
                }
                Err(e) => {
                    debug!("{} #{} from {} failed: {}", packet_type, request_id, ctx.peer, e);
                    Reply::Respond(Packet::error(request_id, &e))
                }
            };
            deliver(&reply_to, reply).await;
        };

        match self.pool.submit(job).await {
            Ok(()) => Ok(()),
            Err(e @ (Error::Overloaded | Error::ShuttingDown)) => {
                let _ = conn.send(Packet::error(request_id, &e)).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

async fn deliver(conn: &ConnectionHandle, reply: Reply) {
    match reply {
        Reply::Respond(packet) => {
            if conn.send(packet).await.is_err() {
                debug!("Connection {} gone before reply", conn.id());
            }
        }
        Reply::RespondAndClose(packet) => {
            let _ = conn.send(packet).await;
            conn.close().await;
        }
        Reply::None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use tokio::sync::mpsc;
    use tracker_common::config::{Backpressure, DispatcherConfig};

    struct Echo;

    #[async_trait]
    impl PacketHandler for Echo {
        async fn handle(&self, _ctx: RequestContext, packet: Packet) -> Result<Reply> {
            Ok(Reply::Respond(Packet::new(
                PacketType::RESPONSE,
                packet.request_id,
                packet.body,
            )))
        }
    }

    struct Failing;

    #[async_trait]
    impl PacketHandler for Failing {
        async fn handle(&self, _ctx: RequestContext, packet: Packet) -> Result<Reply> {
            Err(Error::PathNotFound(format!("#{}", packet.request_id)))
        }
    }

    /// Holds every request until a permit is released
    struct Gated(Arc<tokio::sync::Semaphore>);

    #[async_trait]
    impl PacketHandler for Gated {
        async fn handle(&self, _ctx: RequestContext, packet: Packet) -> Result<Reply> {
            let _permit = self.0.acquire().await.map_err(|_| Error::ShuttingDown)?;
            Ok(Reply::Respond(Packet::new(
                PacketType::RESPONSE,
                packet.request_id,
                Vec::new(),
            )))
        }
    }

    fn dispatcher() -> Dispatcher {
        let mut registry = HandlerRegistry::new();
        registry
            .register(PacketType::STAT, Arc::new(Echo))
            .register(PacketType::DELETE_FILE, Arc::new(Failing));
        let config = DispatcherConfig {
            core_workers: 1,
            max_workers: 1,
            backlog: 4,
            backpressure: Backpressure::Reject,
            ..DispatcherConfig::default()
        };
        Dispatcher::new(registry, WorkerPool::new("test", &config))
    }

    fn connection() -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnectionHandle::new(1, "127.0.0.1:9".parse().unwrap(), tx), rx)
    }

    async fn next_packet(rx: &mut mpsc::Receiver<Outbound>) -> Packet {
        match rx.recv().await {
            Some(Outbound::Packet(p)) => p,
            _ => panic!("expected a packet"),
        }
    }

    #[tokio::test]
    async fn test_routes_by_type() {
        let dispatcher = dispatcher();
        let (conn, mut rx) = connection();

        dispatcher
            .dispatch(&conn, Packet::new(PacketType::STAT, 5, &b"hi"[..]))
            .await
            .unwrap();
        let reply = next_packet(&mut rx).await;
        assert_eq!(reply.packet_type, PacketType::RESPONSE);
        assert_eq!(reply.request_id, 5);
        assert_eq!(&reply.body[..], b"hi");
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_packet() {
        let dispatcher = dispatcher();
        let (conn, mut rx) = connection();

        dispatcher
            .dispatch(&conn, Packet::new(PacketType::DELETE_FILE, 8, Vec::new()))
            .await
            .unwrap();
        let reply = next_packet(&mut rx).await;
        assert_eq!(reply.packet_type, PacketType::ERROR);
        let result: Result<tracker_proto::messages::MutationResponse> = reply.into_result();
        assert!(matches!(result, Err(Error::Remote { code: 201, .. })));
    }

    #[tokio::test]
    async fn test_unknown_type_is_protocol_error() {
        let dispatcher = dispatcher();
        let (conn, _rx) = connection();
        let result = dispatcher
            .dispatch(&conn, Packet::new(PacketType(999), 1, Vec::new()))
            .await;
        assert!(matches!(result, Err(Error::UnknownPacketType(999))));
        assert_eq!(dispatcher.registry.types(), vec![PacketType::DELETE_FILE, PacketType::STAT]);
    }

    #[tokio::test]
    async fn test_saturated_pool_answers_overloaded() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register(PacketType::LIST, Arc::new(Gated(Arc::clone(&gate))));
        let config = DispatcherConfig {
            core_workers: 1,
            max_workers: 1,
            backlog: 1,
            backpressure: Backpressure::Reject,
            ..DispatcherConfig::default()
        };
        let dispatcher = Dispatcher::new(registry, WorkerPool::new("saturated", &config));
        let (conn, mut rx) = connection();

        // one running, one queued, the third has nowhere to go
        for request_id in 1..=3 {
            dispatcher
                .dispatch(&conn, Packet::new(PacketType::LIST, request_id, Vec::new()))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let rejected = next_packet(&mut rx).await;
        assert_eq!(rejected.packet_type, PacketType::ERROR);
        assert_eq!(rejected.request_id, 3);
        let result: Result<tracker_proto::messages::MutationResponse> = rejected.into_result();
        assert!(matches!(result, Err(Error::Overloaded)));
        assert_eq!(dispatcher.pool().stats().rejected, 1);

        gate.add_permits(2);
        let mut served = Vec::new();
        for _ in 0..2 {
            served.push(next_packet(&mut rx).await.request_id);
        }
        served.sort_unstable();
        assert_eq!(served, vec![1, 2]);
    }
}

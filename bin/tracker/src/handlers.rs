//! Packet handlers
//!
//! One handler per concern, registered for the packet types it serves.

use crate::fatal::FatalSignal;
use crate::file_service::{NamespaceStore, TrackerFileService};
use crate::membership::{ClientMembership, ClientRecord};
use crate::trash::TrashQueue;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};
use tracker_common::{Attributes, ClientId, ClientState, Error, Result, now_millis};
use tracker_namespace::tree::normalize;
use tracker_namespace::{EntryKind, MetadataStore};
use tracker_net::{HandlerRegistry, PacketHandler, Reply, RequestContext};
use tracker_proto::messages::{
    ClientInfo, ClientListResponse, ClientStatus, CreateFileRequest, DeleteFileRequest, EntryInfo,
    HeartbeatRequest, HeartbeatResponse, ListRequest, ListResponse, MkdirRequest, MutationResponse,
    RegisterRequest, RegisterResponse, StatRequest, StatResponse,
};
use tracker_proto::{Packet, PacketType};

/// Register every tracker handler
pub fn register_all(
    registry: &mut HandlerRegistry,
    membership: &Arc<ClientMembership>,
    files: &Arc<TrackerFileService>,
    trash: &Arc<TrashQueue>,
    fatal: &FatalSignal,
) {
    let membership_handler = Arc::new(MembershipHandler {
        membership: Arc::clone(membership),
    });
    let namespace_handler = Arc::new(NamespaceHandler {
        files: Arc::clone(files),
        trash: Arc::clone(trash),
        fatal: fatal.clone(),
    });

    registry
        .register(PacketType::CLIENT_REGISTER, membership_handler.clone())
        .register(PacketType::CLIENT_HEART_BEAT, membership_handler.clone())
        .register(PacketType::CLIENT_LIST, membership_handler)
        .register(PacketType::MKDIR, namespace_handler.clone())
        .register(PacketType::CREATE_FILE, namespace_handler.clone())
        .register(PacketType::DELETE_FILE, namespace_handler.clone())
        .register(PacketType::STAT, namespace_handler.clone())
        .register(PacketType::LIST, namespace_handler);
}

/// CLIENT_REGISTER, CLIENT_HEART_BEAT and CLIENT_LIST
pub struct MembershipHandler {
    membership: Arc<ClientMembership>,
}

#[async_trait]
impl PacketHandler for MembershipHandler {
    async fn handle(&self, ctx: RequestContext, packet: Packet) -> Result<Reply> {
        match packet.packet_type {
            PacketType::CLIENT_REGISTER => {
                let request: RegisterRequest = packet.decode_body()?;
                let id = self
                    .membership
                    .register(&request.hostname, request.port, now_millis())
                    .inspect_err(|e| info!("Registration from {} refused: {}", ctx.peer, e))?;
                Ok(Reply::Respond(Packet::response(
                    packet.request_id,
                    &RegisterResponse {
                        client_id: id.as_u64(),
                    },
                )))
            }
            PacketType::CLIENT_HEART_BEAT => {
                let request: HeartbeatRequest = packet.decode_body()?;
                let id = ClientId(request.client_id);
                match self.membership.heartbeat(id, now_millis()) {
                    Some(commands) => {
                        debug!("Heartbeat from {} ({} commands)", id, commands.len());
                        Ok(Reply::Respond(Packet::response(
                            packet.request_id,
                            &HeartbeatResponse {
                                success: true,
                                commands,
                            },
                        )))
                    }
                    None => {
                        info!("Rejected heartbeat from {} for client {}, closing", ctx.peer, id);
                        Ok(Reply::RespondAndClose(Packet::response(
                            packet.request_id,
                            &HeartbeatResponse::default(),
                        )))
                    }
                }
            }
            PacketType::CLIENT_LIST => {
                let clients = self.membership.list().iter().map(client_info).collect();
                Ok(Reply::Respond(Packet::response(
                    packet.request_id,
                    &ClientListResponse { clients },
                )))
            }
            other => Err(Error::UnknownPacketType(other.0)),
        }
    }
}

fn client_info(record: &ClientRecord) -> ClientInfo {
    let status = match record.state {
        ClientState::Alive => ClientStatus::Alive,
        ClientState::Dead => ClientStatus::Dead,
    };
    ClientInfo {
        client_id: record.id.as_u64(),
        hostname: record.hostname.clone(),
        port: u32::from(record.port),
        status: status as i32,
        registered_at_ms: record.registered_at_ms,
        last_heartbeat_ms: record.last_heartbeat_ms,
    }
}

/// MKDIR, CREATE_FILE, DELETE_FILE, STAT and LIST
pub struct NamespaceHandler {
    files: Arc<TrackerFileService>,
    trash: Arc<TrashQueue>,
    fatal: FatalSignal,
}

impl NamespaceHandler {
    /// Run a mutation off the runtime threads; it may flush the edit log
    async fn mutate<F>(&self, apply: F) -> Result<bool>
    where
        F: FnOnce(&NamespaceStore) -> Result<bool> + Send + 'static,
    {
        let store = Arc::clone(self.files.store());
        let outcome = tokio::task::spawn_blocking(move || apply(&store))
            .await
            .unwrap_or_else(|e| Err(Error::internal(format!("namespace mutation task failed: {e}"))));
        outcome.inspect_err(|e| self.fatal.check(e))
    }

    fn mutation(request_id: u64, success: bool) -> Reply {
        Reply::Respond(Packet::response(request_id, &MutationResponse { success }))
    }
}

#[async_trait]
impl PacketHandler for NamespaceHandler {
    async fn handle(&self, _ctx: RequestContext, packet: Packet) -> Result<Reply> {
        let store = self.files.store();
        match packet.packet_type {
            PacketType::MKDIR => {
                let request: MkdirRequest = packet.decode_body()?;
                let attrs = to_attributes(request.attrs);
                let success = self.mutate(move |store| store.mkdir(&request.path, &attrs)).await?;
                Ok(Self::mutation(packet.request_id, success))
            }
            PacketType::CREATE_FILE => {
                let request: CreateFileRequest = packet.decode_body()?;
                let attrs = to_attributes(request.attrs);
                let success = self
                    .mutate(move |store| store.create_file(&request.path, &attrs))
                    .await?;
                Ok(Self::mutation(packet.request_id, success))
            }
            PacketType::DELETE_FILE => {
                let request: DeleteFileRequest = packet.decode_body()?;
                let path = request.path.clone();
                let success = self.mutate(move |store| store.delete_file(&path)).await?;
                if success {
                    let path = normalize(&request.path).unwrap_or(request.path);
                    self.trash.push(path, now_millis());
                }
                Ok(Self::mutation(packet.request_id, success))
            }
            PacketType::STAT => {
                let request: StatRequest = packet.decode_body()?;
                let entry = store.stat(&request.path)?.map(entry_info);
                Ok(Reply::Respond(Packet::response(
                    packet.request_id,
                    &StatResponse { entry },
                )))
            }
            PacketType::LIST => {
                let request: ListRequest = packet.decode_body()?;
                let entries = store.list(&request.path)?.into_iter().map(entry_info).collect();
                Ok(Reply::Respond(Packet::response(
                    packet.request_id,
                    &ListResponse { entries },
                )))
            }
            other => Err(Error::UnknownPacketType(other.0)),
        }
    }
}

fn to_attributes(attrs: HashMap<String, String>) -> Attributes {
    attrs.into_iter().collect::<BTreeMap<_, _>>()
}

fn entry_info(info: tracker_namespace::EntryInfo) -> EntryInfo {
    let kind = match info.kind {
        EntryKind::Directory => tracker_proto::messages::EntryKind::Directory,
        EntryKind::File => tracker_proto::messages::EntryKind::File,
    };
    EntryInfo {
        path: info.path,
        kind: kind as i32,
        attrs: info.attrs.into_iter().collect(),
    }
}

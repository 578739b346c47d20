//! Tracker client

use tokio::net::ToSocketAddrs;
use tracing::debug;
use tracker_common::config::DispatcherConfig;
use tracker_common::{Attributes, ClientId, Result};
use tracker_net::NetClient;
use tracker_proto::PacketCodec;
use tracker_proto::PacketType;
use tracker_proto::messages::{
    ClientInfo, ClientListResponse, CreateFileRequest, DeleteFileRequest, Empty, EntryInfo,
    HeartbeatRequest, HeartbeatResponse, ListRequest, ListResponse, MkdirRequest, MutationResponse,
    RegisterRequest, RegisterResponse, StatRequest, StatResponse,
};

/// Client for the tracker service
///
/// One connection, any number of concurrent calls.
pub struct TrackerClient {
    conn: NetClient,
}

impl TrackerClient {
    /// Connect with the default frame limit and request timeout
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        Self::connect_with(addr, &DispatcherConfig::default()).await
    }

    /// Connect using the frame limit and timeout of `config`
    pub async fn connect_with(addr: impl ToSocketAddrs, config: &DispatcherConfig) -> Result<Self> {
        let conn = NetClient::connect(
            addr,
            PacketCodec::new(config.max_frame_bytes),
            config.request_timeout(),
        )
        .await?;
        debug!("Tracker client connected to {}", conn.peer());
        Ok(Self { conn })
    }

    /// Underlying connection, for raw `send_sync` calls
    pub const fn connection(&self) -> &NetClient {
        &self.conn
    }

    /// Register a storage node
    pub async fn register(&self, hostname: &str, port: u16) -> Result<ClientId> {
        let request = RegisterRequest {
            hostname: hostname.to_string(),
            port: u32::from(port),
        };
        let response: RegisterResponse = self.conn.call(PacketType::CLIENT_REGISTER, &request).await?;
        Ok(ClientId(response.client_id))
    }

    /// Report liveness
    ///
    /// `success == false` means the tracker does not know `id` (or has
    /// declared it dead); the tracker closes the connection after answering.
    pub async fn heartbeat(&self, id: ClientId) -> Result<HeartbeatResponse> {
        let request = HeartbeatRequest {
            client_id: id.as_u64(),
        };
        self.conn.call(PacketType::CLIENT_HEART_BEAT, &request).await
    }

    pub async fn mkdir(&self, path: &str, attrs: &Attributes) -> Result<bool> {
        let request = MkdirRequest {
            path: path.to_string(),
            attrs: attrs.clone().into_iter().collect(),
        };
        let response: MutationResponse = self.conn.call(PacketType::MKDIR, &request).await?;
        Ok(response.success)
    }

    pub async fn create_file(&self, path: &str, attrs: &Attributes) -> Result<bool> {
        let request = CreateFileRequest {
            path: path.to_string(),
            attrs: attrs.clone().into_iter().collect(),
        };
        let response: MutationResponse = self.conn.call(PacketType::CREATE_FILE, &request).await?;
        Ok(response.success)
    }

    pub async fn delete_file(&self, path: &str) -> Result<bool> {
        let request = DeleteFileRequest {
            path: path.to_string(),
        };
        let response: MutationResponse = self.conn.call(PacketType::DELETE_FILE, &request).await?;
        Ok(response.success)
    }

    pub async fn stat(&self, path: &str) -> Result<Option<EntryInfo>> {
        let request = StatRequest {
            path: path.to_string(),
        };
        let response: StatResponse = self.conn.call(PacketType::STAT, &request).await?;
        Ok(response.entry)
    }

    /// Children of a directory
    pub async fn list(&self, path: &str) -> Result<Vec<EntryInfo>> {
        let request = ListRequest {
            path: path.to_string(),
        };
        let response: ListResponse = self.conn.call(PacketType::LIST, &request).await?;
        Ok(response.entries)
    }

    /// Every storage node the tracker knows, dead ones included
    pub async fn clients(&self) -> Result<Vec<ClientInfo>> {
        let response: ClientListResponse = self.conn.call(PacketType::CLIENT_LIST, &Empty {}).await?;
        Ok(response.clients)
    }

    pub async fn close(&self) {
        self.conn.close().await;
    }
}

//! Storage node membership
//!
//! Storage nodes register once, then heartbeat. A node whose last heartbeat
//! is older than the timeout is marked DEAD by the liveness scan and must
//! register again; DEAD records are physically removed after a retention
//! period. Each ALIVE node also carries the removal commands queued for it,
//! handed out on its next heartbeat.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracker_common::config::MembershipConfig;
use tracker_common::{ClientId, ClientState, Error, IdGenerator, Result};
use tracker_proto::messages::RemoveFileCommand;

/// What the tracker knows about one storage node
#[derive(Clone, Debug)]
pub struct ClientRecord {
    pub id: ClientId,
    pub hostname: String,
    pub port: u16,
    pub state: ClientState,
    pub registered_at_ms: u64,
    pub last_heartbeat_ms: u64,
    /// When the liveness scan declared the node dead
    pub dead_since_ms: Option<u64>,
    pending: Vec<RemoveFileCommand>,
}

impl ClientRecord {
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn pending_commands(&self) -> usize {
        self.pending.len()
    }
}

/// Registry of storage nodes keyed by client id
pub struct ClientMembership {
    clients: DashMap<ClientId, ClientRecord>,
    ids: Arc<dyn IdGenerator>,
    heartbeat_timeout_ms: u64,
    // serializes the address uniqueness check with the insert
    registration: Mutex<()>,
}

impl ClientMembership {
    pub fn new(config: &MembershipConfig, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            clients: DashMap::new(),
            ids,
            heartbeat_timeout_ms: config.heartbeat_timeout_ms,
            registration: Mutex::new(()),
        }
    }

    /// Admit a storage node and return its new id
    ///
    /// An ALIVE node already registered at the same address is a
    /// duplicate; a DEAD one is replaced.
    pub fn register(&self, hostname: &str, port: u32, now_ms: u64) -> Result<ClientId> {
        let hostname = hostname.trim();
        if hostname.is_empty() {
            return Err(Error::InvalidRegistration("empty hostname".to_string()));
        }
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| Error::InvalidRegistration(format!("invalid port {port}")))?;

        let _registration = self.registration.lock();
        let existing = self
            .clients
            .iter()
            .find(|entry| entry.hostname == hostname && entry.port == port)
            .map(|entry| (entry.id, entry.state));
        match existing {
            Some((id, ClientState::Alive)) => {
                return Err(Error::DuplicateClient(format!("{hostname}:{port} is registered as {id}")));
            }
            Some((id, ClientState::Dead)) => {
                self.clients.remove(&id);
                info!("Replacing dead client {} at {}:{}", id, hostname, port);
            }
            None => {}
        }

        let id = ClientId(self.ids.next_id());
        self.clients.insert(
            id,
            ClientRecord {
                id,
                hostname: hostname.to_string(),
                port,
                state: ClientState::Alive,
                registered_at_ms: now_ms,
                last_heartbeat_ms: now_ms,
                dead_since_ms: None,
                pending: Vec::new(),
            },
        );
        info!("Registered client {} at {}:{}", id, hostname, port);
        Ok(id)
    }

    /// Record a heartbeat
    ///
    /// Returns the commands queued for the node, or `None` when the id is
    /// unknown or DEAD; nothing is modified in that case.
    pub fn heartbeat(&self, id: ClientId, now_ms: u64) -> Option<Vec<RemoveFileCommand>> {
        let Some(mut record) = self.clients.get_mut(&id) else {
            debug!("Heartbeat from unknown client {}", id);
            return None;
        };
        if record.state == ClientState::Dead {
            debug!("Heartbeat from dead client {}", id);
            return None;
        }
        record.last_heartbeat_ms = record.last_heartbeat_ms.max(now_ms);
        Some(std::mem::take(&mut record.pending))
    }

    /// Mark ALIVE nodes without a recent heartbeat as DEAD
    ///
    /// Returns the ids that changed state.
    pub fn scan_liveness(&self, now_ms: u64) -> Vec<ClientId> {
        let mut expired = Vec::new();
        for mut record in self.clients.iter_mut() {
            if record.state != ClientState::Alive {
                continue;
            }
            let silent_for = now_ms.saturating_sub(record.last_heartbeat_ms);
            if silent_for > self.heartbeat_timeout_ms {
                warn!(
                    "Client {} at {} missed heartbeats for {} ms, marking DEAD",
                    record.id,
                    record.address(),
                    silent_for
                );
                record.state = ClientState::Dead;
                record.dead_since_ms = Some(now_ms);
                record.pending.clear();
                expired.push(record.id);
            }
        }
        expired
    }

    /// Drop DEAD records older than `retention_ms`
    pub fn purge_dead(&self, now_ms: u64, retention_ms: u64) -> usize {
        let before = self.clients.len();
        self.clients.retain(|id, record| {
            let expired = record
                .dead_since_ms
                .is_some_and(|since| now_ms.saturating_sub(since) >= retention_ms);
            if expired {
                debug!("Removing dead client {}", id);
            }
            !expired
        });
        before - self.clients.len()
    }

    /// Queue a removal command for `paths` on every ALIVE node
    ///
    /// Returns the number of commands queued.
    pub fn enqueue_removals(&self, paths: &[String]) -> usize {
        if paths.is_empty() {
            return 0;
        }
        let mut queued = 0;
        for mut record in self.clients.iter_mut() {
            if record.state != ClientState::Alive {
                continue;
            }
            record
                .pending
                .extend(paths.iter().map(|path| RemoveFileCommand { path: path.clone() }));
            queued += paths.len();
        }
        queued
    }

    pub fn get(&self, id: ClientId) -> Option<ClientRecord> {
        self.clients.get(&id).map(|record| record.clone())
    }

    /// Every record, ordered by id
    pub fn list(&self) -> Vec<ClientRecord> {
        let mut records: Vec<_> = self.clients.iter().map(|r| r.clone()).collect();
        records.sort_by_key(|r| r.id);
        records
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

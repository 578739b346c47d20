//! Tracker server composition root
//!
//! Wires recovery, membership, the trash policy and the packet handlers to
//! the network server, and owns the shutdown sequence.

use crate::fatal::FatalSignal;
use crate::file_service::TrackerFileService;
use crate::handlers;
use crate::membership::ClientMembership;
use crate::trash::{TrashQueue, run_trash_pass};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracker_common::{MonotonicIdGenerator, Result, TrackerConfig, TxId, now_millis};
use tracker_net::{Dispatcher, HandlerRegistry, NetServer, TaskScheduler, WorkerPool};
use tracker_proto::PacketCodec;

/// A running tracker
pub struct TrackerServer {
    net: NetServer,
    dispatcher: Arc<Dispatcher>,
    files: Arc<TrackerFileService>,
    membership: Arc<ClientMembership>,
    trash: Arc<TrashQueue>,
    scheduler: Arc<TaskScheduler>,
    fatal: FatalSignal,
    stopped: AtomicBool,
}

impl TrackerServer {
    /// Recover the namespace, start background tasks and bind every
    /// listen address
    pub async fn start(config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        info!("Starting tracker '{}' in {:?}", config.node.name, config.node.base_dir);

        let fatal = FatalSignal::new();
        let scheduler = Arc::new(TaskScheduler::new());
        let files = TrackerFileService::start(&config, &scheduler, &fatal)?;

        let membership = Arc::new(ClientMembership::new(
            &config.membership,
            Arc::new(MonotonicIdGenerator::new()),
        ));
        let trash = Arc::new(TrashQueue::new(config.membership.trash_grace_ms));
        schedule_membership_tasks(&scheduler, &config, &membership, &trash);

        let mut registry = HandlerRegistry::new();
        handlers::register_all(&mut registry, &membership, &files, &trash, &fatal);
        let pool = WorkerPool::new("tracker-handlers", &config.dispatcher);
        let dispatcher = Arc::new(Dispatcher::new(registry, pool));

        let codec = PacketCodec::new(config.dispatcher.max_frame_bytes);
        let net = match NetServer::bind(&config.node.listen, Arc::clone(&dispatcher), codec).await {
            Ok(net) => net,
            Err(e) => {
                error!("Failed to bind {:?}: {}", config.node.listen, e);
                dispatcher.pool().shutdown().await;
                scheduler.shutdown().await;
                if let Err(close) = files.shutdown() {
                    error!("Closing the namespace failed: {}", close);
                }
                return Err(e);
            }
        };

        info!("Tracker '{}' serving on {:?}", config.node.name, net.local_addrs());
        Ok(Self {
            net,
            dispatcher,
            files,
            membership,
            trash,
            scheduler,
            fatal,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        self.net.local_addrs()
    }

    pub fn files(&self) -> &Arc<TrackerFileService> {
        &self.files
    }

    pub fn membership(&self) -> &Arc<ClientMembership> {
        &self.membership
    }

    pub fn trash(&self) -> &Arc<TrashQueue> {
        &self.trash
    }

    pub fn fatal(&self) -> &FatalSignal {
        &self.fatal
    }

    /// Stop serving, persisting everything accepted so far
    ///
    /// Listeners close first, then the log is flushed and the final
    /// snapshot written; only then are connections, workers and background
    /// tasks released. Returns the txid of the final snapshot.
    pub async fn shutdown(&self) -> Result<TxId> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(self.files.log().last_tx_id());
        }

        info!("Shutdown: closing listeners");
        self.net.stop_accepting().await;

        info!("Shutdown: flushing edit log and writing final snapshot");
        let files = Arc::clone(&self.files);
        let persisted = match tokio::task::spawn_blocking(move || files.shutdown()).await {
            Ok(result) => result,
            Err(e) => Err(tracker_common::Error::internal(format!("final checkpoint task failed: {e}"))),
        };
        if let Err(e) = &persisted {
            error!("Final flush or snapshot failed: {}", e);
        }

        info!("Shutdown: closing connections");
        self.net.close_connections();

        info!("Shutdown: stopping workers and background tasks");
        self.dispatcher.pool().shutdown().await;
        self.scheduler.shutdown().await;

        let tx_id = persisted?;
        info!("Tracker stopped at txid {}", tx_id);
        Ok(tx_id)
    }
}

fn schedule_membership_tasks(
    scheduler: &TaskScheduler,
    config: &TrackerConfig,
    membership: &Arc<ClientMembership>,
    trash: &Arc<TrashQueue>,
) {
    let scan_interval = config.membership.liveness_scan_interval();
    let scanned = Arc::clone(membership);
    scheduler.schedule("liveness-scan", scan_interval, scan_interval, move || {
        let membership = Arc::clone(&scanned);
        async move {
            membership.scan_liveness(now_millis());
        }
    });

    let trash_interval = config.membership.trash_interval();
    let membership = Arc::clone(membership);
    let trash = Arc::clone(trash);
    let membership_config = config.membership.clone();
    scheduler.schedule("trash", trash_interval, trash_interval, move || {
        let membership = Arc::clone(&membership);
        let trash = Arc::clone(&trash);
        let config = membership_config.clone();
        async move {
            run_trash_pass(&trash, &membership, &config, now_millis());
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;
    use tracker_client::{ClientStatus, EntryKind, TrackerClient};
    use tracker_common::{ClientId, Error};
    use tracker_namespace::{EditLog, LogOp, MetadataStore};

    fn config(dir: &TempDir) -> TrackerConfig {
        let mut config = TrackerConfig::default();
        config.node.listen = vec!["127.0.0.1:0".parse().unwrap()];
        config.node.base_dir = dir.path().to_path_buf();
        config.edit_log.sync_on_flush = false;
        config
    }

    async fn connect(server: &TrackerServer) -> TrackerClient {
        TrackerClient::connect(server.local_addrs()[0]).await.unwrap()
    }

    fn no_attrs() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[tokio::test]
    async fn test_mkdir_survives_restart() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let server = TrackerServer::start(config.clone()).await.unwrap();
        let client = connect(&server).await;
        assert!(client.mkdir("/a", &no_attrs()).await.unwrap());
        server.files().flush().unwrap();
        client.close().await;
        server.shutdown().await.unwrap();

        // no snapshot: recovery replays the log from txid 0
        for entry in std::fs::read_dir(config.image_dir()).unwrap() {
            std::fs::remove_file(entry.unwrap().path()).unwrap();
        }

        let server = TrackerServer::start(config).await.unwrap();
        let client = connect(&server).await;
        let entry = client.stat("/a").await.unwrap().unwrap();
        assert_eq!(entry.kind, EntryKind::Directory as i32);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_twice_logs_once() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let server = TrackerServer::start(config.clone()).await.unwrap();
        let client = connect(&server).await;

        let mut attrs = no_attrs();
        attrs.insert("replicas".to_string(), "3".to_string());
        assert!(client.mkdir("/a", &no_attrs()).await.unwrap());
        assert!(client.create_file("/a/f.txt", &attrs).await.unwrap());
        assert!(!client.create_file("/a/f.txt", &no_attrs()).await.unwrap());
        assert!(!client.delete_file("/a/missing").await.unwrap());

        let entry = client.stat("/a/f.txt").await.unwrap().unwrap();
        assert_eq!(entry.attrs.get("replicas").map(String::as_str), Some("3"));
        server.shutdown().await.unwrap();

        let mut creates = Vec::new();
        EditLog::replay(config.edit_log_dir(), TxId::ZERO, |record| {
            if record.op == LogOp::Create {
                creates.push(record.path);
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(creates, vec!["/a/f.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_register_and_heartbeat() {
        let dir = TempDir::new().unwrap();
        let server = TrackerServer::start(config(&dir)).await.unwrap();
        let client = connect(&server).await;

        let id = client.register("storage-1", 7001).await.unwrap();
        let beat = client.heartbeat(id).await.unwrap();
        assert!(beat.success);
        assert!(beat.commands.is_empty());

        let clients = client.clients().await.unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].client_id, id.as_u64());
        assert_eq!(clients[0].status, ClientStatus::Alive as i32);

        let duplicate = client.register("storage-1", 7001).await;
        assert!(matches!(duplicate, Err(Error::Remote { code: 207, .. })));
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_heartbeat_closes_connection() {
        let dir = TempDir::new().unwrap();
        let server = TrackerServer::start(config(&dir)).await.unwrap();
        let client = connect(&server).await;

        let beat = client.heartbeat(ClientId(404)).await.unwrap();
        assert!(!beat.success);
        assert!(server.membership().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(client.connection().is_closed());
        server.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_mkdir_and_heartbeat() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let server = TrackerServer::start(config.clone()).await.unwrap();
        let writer = connect(&server).await;
        let node = connect(&server).await;
        let id = node.register("storage-1", 7001).await.unwrap();

        let mkdirs = async {
            for i in 0..50 {
                assert!(writer.mkdir(&format!("/dir{i}"), &no_attrs()).await.unwrap());
            }
        };
        let heartbeats = async {
            for _ in 0..50 {
                assert!(node.heartbeat(id).await.unwrap().success);
            }
        };
        tokio::join!(mkdirs, heartbeats);

        assert_eq!(writer.list("/").await.unwrap().len(), 50);
        let record = server.membership().get(id).unwrap();
        assert_eq!(record.state, tracker_common::ClientState::Alive);
        assert_eq!(server.shutdown().await.unwrap(), TxId(50));
    }

    #[tokio::test]
    async fn test_validation_errors_keep_connection() {
        let dir = TempDir::new().unwrap();
        let server = TrackerServer::start(config(&dir)).await.unwrap();
        let client = connect(&server).await;

        let result = client.create_file("/no/parent", &no_attrs()).await;
        assert!(matches!(result, Err(Error::Remote { code: 203, .. })));
        let result = client.mkdir("relative", &no_attrs()).await;
        assert!(matches!(result, Err(Error::Remote { code: 200, .. })));

        assert!(client.mkdir("/ok", &no_attrs()).await.unwrap());
        assert!(!client.connection().is_closed());
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_log_write_reaches_client_and_raises_fatal() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        // every mutation flushes before it is acknowledged
        config.edit_log.flush_threshold_bytes = 1;
        let server = TrackerServer::start(config.clone()).await.unwrap();
        let client = connect(&server).await;

        std::fs::remove_dir_all(config.edit_log_dir()).unwrap();
        std::fs::write(config.edit_log_dir(), b"not a directory").unwrap();

        let result = client.mkdir("/a", &no_attrs()).await;
        assert!(
            matches!(result, Err(Error::Remote { code: 300, .. }) | Err(Error::LogFailed)),
            "unexpected {result:?}"
        );
        assert!(server.fatal().reason().is_some());

        // the log stays poisoned
        let result = client.mkdir("/b", &no_attrs()).await;
        assert!(matches!(result, Err(Error::LogFailed)));
        assert!(server.shutdown().await.is_err());
    }

    #[tokio::test]
    async fn test_deleted_file_reaches_storage_nodes() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.membership.trash_grace_ms = 0;
        let server = TrackerServer::start(config.clone()).await.unwrap();
        let client = connect(&server).await;
        let id = client.register("storage-1", 7001).await.unwrap();

        client.mkdir("/a", &no_attrs()).await.unwrap();
        client.create_file("/a/f", &no_attrs()).await.unwrap();
        assert!(client.delete_file("/a/f/").await.unwrap());
        assert_eq!(server.trash().len(), 1);

        run_trash_pass(server.trash(), server.membership(), &config.membership, now_millis());
        let beat = client.heartbeat(id).await.unwrap();
        let paths: Vec<_> = beat.commands.into_iter().map(|c| c.path).collect();
        assert_eq!(paths, vec!["/a/f".to_string()]);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_connections_and_persists() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let server = TrackerServer::start(config.clone()).await.unwrap();
        let addr = server.local_addrs()[0];
        let client = connect(&server).await;
        client.mkdir("/kept", &no_attrs()).await.unwrap();

        assert_eq!(server.shutdown().await.unwrap(), TxId(1));
        // idempotent
        assert_eq!(server.shutdown().await.unwrap(), TxId(1));
        assert!(TrackerClient::connect(addr).await.is_err());

        let server = TrackerServer::start(config).await.unwrap();
        assert!(server.files().store().stat("/kept").unwrap().is_some());
        server.shutdown().await.unwrap();
    }
}

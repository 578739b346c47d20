//! Namespace persistence lifecycle
//!
//! Owns the logged metadata store, its edit log and the snapshot store:
//! recovery at startup, periodic flushes and checkpoints while running, and
//! the final flush and snapshot at shutdown.

use crate::fatal::FatalSignal;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info};
use tracker_common::{Error, Result, TrackerConfig, TxId};
use tracker_namespace::{
    EditLog, InMemoryMetadataStore, LoggingMetadataStore, RecoveryCoordinator, SnapshotStore,
};
use tracker_net::TaskScheduler;

pub type NamespaceStore = LoggingMetadataStore<InMemoryMetadataStore>;

/// Durable namespace service
pub struct TrackerFileService {
    store: Arc<NamespaceStore>,
    log: Arc<EditLog>,
    snapshots: SnapshotStore,
    retention: usize,
    checkpoint_lock: Mutex<()>,
}

impl TrackerFileService {
    /// Recover the namespace and open the edit log after the last record
    pub fn open(config: &TrackerConfig) -> Result<Self> {
        let snapshots = SnapshotStore::new(config.image_dir());
        let log_dir = config.edit_log_dir();
        let recovered = RecoveryCoordinator::new(snapshots.clone(), &log_dir).recover()?;
        info!(
            "Recovery complete: snapshot txid {}, {} records replayed, last txid {}",
            recovered.snapshot_tx_id, recovered.replayed, recovered.last_tx_id
        );

        let log = Arc::new(EditLog::open(&log_dir, &config.edit_log, recovered.last_tx_id)?);
        let store = Arc::new(LoggingMetadataStore::new(recovered.store, Arc::clone(&log)));
        Ok(Self {
            store,
            log,
            snapshots,
            retention: config.snapshot.retention.max(1),
            checkpoint_lock: Mutex::new(()),
        })
    }

    /// Open, then schedule the periodic flush and checkpoint
    ///
    /// A failure in either task raises `fatal`.
    pub fn start(config: &TrackerConfig, scheduler: &TaskScheduler, fatal: &FatalSignal) -> Result<Arc<Self>> {
        let service = Arc::new(Self::open(config)?);

        let flush_interval = config.edit_log.flush_interval();
        let flusher = Arc::clone(&service);
        let flush_fatal = fatal.clone();
        scheduler.schedule("edit-log-flush", flush_interval, flush_interval, move || {
            let service = Arc::clone(&flusher);
            let fatal = flush_fatal.clone();
            async move {
                match tokio::task::spawn_blocking(move || service.flush()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => fatal.check(&e),
                    Err(e) => fatal.raise(format!("edit log flush task failed: {e}")),
                }
            }
        });

        let checkpoint_interval = config.snapshot.interval();
        let checkpointer = Arc::clone(&service);
        let checkpoint_fatal = fatal.clone();
        scheduler.schedule("checkpoint", checkpoint_interval, checkpoint_interval, move || {
            let service = Arc::clone(&checkpointer);
            let fatal = checkpoint_fatal.clone();
            async move {
                match tokio::task::spawn_blocking(move || service.checkpoint()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        error!("Checkpoint failed: {}", e);
                        fatal.check(&e);
                    }
                    Err(e) => fatal.raise(format!("checkpoint task failed: {e}")),
                }
            }
        });

        Ok(service)
    }

    pub fn store(&self) -> &Arc<NamespaceStore> {
        &self.store
    }

    pub fn log(&self) -> &Arc<EditLog> {
        &self.log
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn flush(&self) -> Result<()> {
        self.log.flush()
    }

    /// Write a snapshot of the current tree, then drop what it supersedes
    ///
    /// Keeps `retention` snapshots and purges log segments covered by the
    /// oldest one kept. Returns the snapshot's maxTxId. Every failure is
    /// fatal: an I/O error while listing or pruning is reported as
    /// [`Error::SnapshotWrite`].
    pub fn checkpoint(&self) -> Result<TxId> {
        let _checkpoint = self.checkpoint_lock.lock();
        let (tree, tx_id) = self.store.capture();
        // every record up to the image's txid is on disk before anything is purged
        self.log.flush()?;

        let newest = self
            .snapshots
            .list()
            .map_err(|e| checkpoint_failure("listing snapshots", e))?
            .first()
            .map(|(tx, _)| *tx);
        if newest == Some(tx_id) {
            debug!("Snapshot at txid {} is current", tx_id);
            return Ok(tx_id);
        }

        let path = self
            .snapshots
            .write(&tree, tx_id)
            .map_err(|e| checkpoint_failure("writing snapshot", e))?;
        info!("Checkpoint at txid {} written to {:?} ({} entries)", tx_id, path, tree.len());

        self.snapshots
            .retain(self.retention)
            .map_err(|e| checkpoint_failure("removing old snapshots", e))?;
        let oldest = self
            .snapshots
            .oldest()
            .map_err(|e| checkpoint_failure("listing snapshots", e))?;
        if let Some(oldest) = oldest {
            self.log
                .purge_through(oldest)
                .map_err(|e| checkpoint_failure("purging edit log segments", e))?;
        }
        Ok(tx_id)
    }

    /// Refuse further mutations, flush and write the final snapshot
    pub fn shutdown(&self) -> Result<TxId> {
        self.store.seal();
        info!("Namespace sealed, flushing edit log");
        self.log.flush()?;
        let tx_id = self.checkpoint()?;
        self.log.close()?;
        info!("Final snapshot at txid {}", tx_id);
        Ok(tx_id)
    }
}

fn checkpoint_failure(step: &str, err: Error) -> Error {
    if err.is_fatal() {
        err
    } else {
        Error::SnapshotWrite(format!("{step}: {err}"))
    }
}

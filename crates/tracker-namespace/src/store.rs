//! Metadata store interface and implementations
//!
//! [`InMemoryMetadataStore`] owns the tree behind a reader/writer lock.
//! [`LoggingMetadataStore`] wraps any store and appends an edit log record
//! after each mutation that changed the tree.

use crate::editlog::{EditLog, LogOp};
use crate::tree::{EntryInfo, NamespaceTree, normalize};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error};
use tracker_common::{Attributes, Error, Result, TxId};

/// Namespace operations
///
/// Mutations return `Ok(false)` when they had nothing to do; only
/// `Ok(true)` changes the tree.
pub trait MetadataStore: Send + Sync {
    fn mkdir(&self, path: &str, attrs: &Attributes) -> Result<bool>;

    fn create_file(&self, path: &str, attrs: &Attributes) -> Result<bool>;

    fn delete_file(&self, path: &str) -> Result<bool>;

    fn stat(&self, path: &str) -> Result<Option<EntryInfo>>;

    fn list(&self, path: &str) -> Result<Vec<EntryInfo>>;

    /// Copy of the whole tree
    fn export_tree(&self) -> NamespaceTree;
}

/// Tree held in memory only
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    tree: RwLock<NamespaceTree>,
}

impl InMemoryMetadataStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_tree(tree: NamespaceTree) -> Self {
        Self {
            tree: RwLock::new(tree),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn mkdir(&self, path: &str, attrs: &Attributes) -> Result<bool> {
        self.tree.write().mkdir(path, attrs)
    }

    fn create_file(&self, path: &str, attrs: &Attributes) -> Result<bool> {
        self.tree.write().create_file(path, attrs)
    }

    fn delete_file(&self, path: &str) -> Result<bool> {
        self.tree.write().delete_file(path)
    }

    fn stat(&self, path: &str) -> Result<Option<EntryInfo>> {
        self.tree.read().stat(path)
    }

    fn list(&self, path: &str) -> Result<Vec<EntryInfo>> {
        self.tree.read().list(path)
    }

    fn export_tree(&self) -> NamespaceTree {
        self.tree.read().clone()
    }
}

/// Store decorator that records every effective mutation in the edit log
///
/// A single writer lock is held across "apply, then append" so the order of
/// tree mutations and the order of txids always agree. The mutation is
/// visible to readers before its record is durable.
pub struct LoggingMetadataStore<S> {
    inner: S,
    log: Arc<EditLog>,
    writer: Mutex<()>,
    sealed: AtomicBool,
}

impl<S: MetadataStore> LoggingMetadataStore<S> {
    pub fn new(inner: S, log: Arc<EditLog>) -> Self {
        Self {
            inner,
            log,
            writer: Mutex::new(()),
            sealed: AtomicBool::new(false),
        }
    }

    pub fn log(&self) -> &Arc<EditLog> {
        &self.log
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Tree and the txid it reflects, taken atomically with respect to writers
    pub fn capture(&self) -> (NamespaceTree, TxId) {
        let _writer = self.writer.lock();
        (self.inner.export_tree(), self.log.last_tx_id())
    }

    /// Refuse every later mutation with [`Error::ShuttingDown`]
    ///
    /// Waits for the mutation in progress, if any.
    pub fn seal(&self) {
        let _writer = self.writer.lock();
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    fn mutate<F>(&self, op: LogOp, path: &str, attrs: &Attributes, apply: F) -> Result<bool>
    where
        F: FnOnce(&S, &str) -> Result<bool>,
    {
        let path = normalize(path)?;
        let appended = {
            let _writer = self.writer.lock();
            if self.sealed.load(Ordering::SeqCst) {
                return Err(Error::ShuttingDown);
            }
            // Do not touch the tree once the log can no longer record it
            self.log.check_writable()?;

            if !apply(&self.inner, &path)? {
                return Ok(false);
            }
            self.log.append(op, &path, attrs).inspect_err(|e| {
                error!("{} {} applied but not logged: {}", op, path, e);
            })?
        };
        debug!("{} {} -> txid {}", op, path, appended.tx_id);

        // Flush outside the writer lock so other mutations keep going
        if appended.flush_due {
            self.log.flush()?;
        }
        Ok(true)
    }
}

impl<S: MetadataStore> MetadataStore for LoggingMetadataStore<S> {
    fn mkdir(&self, path: &str, attrs: &Attributes) -> Result<bool> {
        self.mutate(LogOp::Mkdir, path, attrs, |s, p| s.mkdir(p, attrs))
    }

    fn create_file(&self, path: &str, attrs: &Attributes) -> Result<bool> {
        self.mutate(LogOp::Create, path, attrs, |s, p| s.create_file(p, attrs))
    }

    fn delete_file(&self, path: &str) -> Result<bool> {
        self.mutate(LogOp::Delete, path, &Attributes::new(), |s, p| {
            s.delete_file(p)
        })
    }

    fn stat(&self, path: &str) -> Result<Option<EntryInfo>> {
        self.inner.stat(path)
    }

    fn list(&self, path: &str) -> Result<Vec<EntryInfo>> {
        self.inner.list(path)
    }

    fn export_tree(&self) -> NamespaceTree {
        self.inner.export_tree()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editlog::LogRecord;
    use tempfile::TempDir;
    use tracker_common::config::EditLogConfig;

    fn open(dir: &TempDir) -> LoggingMetadataStore<InMemoryMetadataStore> {
        let config = EditLogConfig {
            sync_on_flush: false,
            ..EditLogConfig::default()
        };
        let log = Arc::new(EditLog::open(dir.path(), &config, TxId::ZERO).unwrap());
        LoggingMetadataStore::new(InMemoryMetadataStore::new(), log)
    }

    fn records(store: &LoggingMetadataStore<InMemoryMetadataStore>) -> Vec<LogRecord> {
        store.log().flush().unwrap();
        let mut out = Vec::new();
        EditLog::replay(store.log().dir(), TxId::ZERO, |r| {
            out.push(r);
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn test_only_effective_mutations_are_logged() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        assert!(store.mkdir("/a", &Attributes::new()).unwrap());
        assert!(!store.mkdir("/a/", &Attributes::new()).unwrap());
        assert!(store.create_file("/a/f.txt", &Attributes::new()).unwrap());
        assert!(!store.create_file("/a/f.txt", &Attributes::new()).unwrap());
        assert!(!store.delete_file("/a/missing").unwrap());
        assert!(store.create_file("/b/g", &Attributes::new()).is_err());

        let log = records(&store);
        assert_eq!(
            log.iter().map(|r| (r.op, r.path.as_str())).collect::<Vec<_>>(),
            vec![(LogOp::Mkdir, "/a"), (LogOp::Create, "/a/f.txt")]
        );
        assert_eq!(store.log().last_tx_id(), TxId(2));
    }

    #[test]
    fn test_logged_paths_are_normalized() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.mkdir("/x/y/", &Attributes::new()).unwrap();
        assert_eq!(records(&store)[0].path, "/x/y");
    }

    #[test]
    fn test_capture_matches_last_txid() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.mkdir("/a", &Attributes::new()).unwrap();
        store.create_file("/a/f", &Attributes::new()).unwrap();

        let (tree, tx) = store.capture();
        assert_eq!(tx, TxId(2));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_sealed_store_rejects_mutations() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.mkdir("/a", &Attributes::new()).unwrap();
        store.seal();

        assert!(matches!(
            store.mkdir("/b", &Attributes::new()),
            Err(Error::ShuttingDown)
        ));
        // reads still work
        assert!(store.stat("/a").unwrap().is_some());
        assert_eq!(store.log().last_tx_id(), TxId(1));
    }

    #[test]
    fn test_concurrent_writers_keep_log_order() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open(&dir));
        store.mkdir("/d", &Attributes::new()).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let path = format!("/d/{t}-{i}");
                        assert!(store.create_file(&path, &Attributes::new()).unwrap());
                        if i % 2 == 0 {
                            assert!(store.delete_file(&path).unwrap());
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // replaying the log reproduces the live tree
        let replayed = InMemoryMetadataStore::new();
        for record in records(&store) {
            let changed = match record.op {
                LogOp::Mkdir => replayed.mkdir(&record.path, &record.attrs),
                LogOp::Create => replayed.create_file(&record.path, &record.attrs),
                LogOp::Delete => replayed.delete_file(&record.path),
            };
            assert!(changed.unwrap());
        }
        assert_eq!(replayed.export_tree(), store.export_tree());
        assert_eq!(replayed.len(), 1 + 4 * 25);
    }
}

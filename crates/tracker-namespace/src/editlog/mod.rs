//! Edit log (write-ahead log) with a double-buffered writer
//!
//! Appends go into the *active* buffer under the state lock. A flush swaps
//! the active buffer with the empty *flushing* buffer and writes the latter
//! to the current segment outside the state lock, so appends keep flowing
//! while the disk write is in progress. Only one flush runs at a time; a
//! second caller waits for it to finish and then flushes whatever has
//! accumulated since.
//!
//! Lock order is `state` then `sink`. The flusher releases `sink` before it
//! takes `state` again.

mod buffer;
mod record;
mod segment;

pub use buffer::LogBuffer;
pub use record::{LogOp, LogRecord};
pub use segment::{SegmentFile, list_segments, segment_name, sync_dir};

use parking_lot::{Condvar, Mutex};
use segment::{SegmentWriter, read_segment, truncate_torn_tail};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};
use tracker_common::config::EditLogConfig;
use tracker_common::{Attributes, Error, Result, TxId};

/// Outcome of [`EditLog::append`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Appended {
    pub tx_id: TxId,
    /// The active buffer crossed the flush threshold and no flush is running
    pub flush_due: bool,
}

/// Edit log counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogStats {
    pub appends: u64,
    pub flushes: u64,
    pub bytes_written: u64,
    pub last_tx_id: TxId,
    pub persisted_tx_id: TxId,
}

/// What a replay saw
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Highest txid visited, or the starting point if nothing was visited
    pub last_tx_id: TxId,
    pub replayed: u64,
    pub segments: usize,
}

struct LogState {
    active: LogBuffer,
    next_tx_id: u64,
    flushing: bool,
    persisted_tx_id: TxId,
    failed: bool,
}

struct Sink {
    buffer: LogBuffer,
    writer: SegmentWriter,
}

/// The edit log
pub struct EditLog {
    dir: PathBuf,
    flush_threshold: usize,
    state: Mutex<LogState>,
    flush_done: Condvar,
    sink: Mutex<Sink>,
    appends: AtomicU64,
    flushes: AtomicU64,
    bytes_written: AtomicU64,
}

impl EditLog {
    /// Open the log for appending, continuing after `last_tx_id`
    ///
    /// `last_tx_id` is the last record recovery applied. A torn record left
    /// at the end of the newest segment is truncated away. Nothing is
    /// written until the first flush, which opens a fresh segment.
    pub fn open(dir: impl AsRef<Path>, config: &EditLogConfig, last_tx_id: TxId) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        truncate_torn_tail(&dir)?;

        info!(
            "Opened edit log at {:?}, next txid {}",
            dir,
            last_tx_id.next()
        );
        Ok(Self {
            flush_threshold: config.flush_threshold_bytes,
            state: Mutex::new(LogState {
                active: LogBuffer::with_capacity(config.flush_threshold_bytes),
                next_tx_id: last_tx_id.as_u64() + 1,
                flushing: false,
                persisted_tx_id: last_tx_id,
                failed: false,
            }),
            flush_done: Condvar::new(),
            sink: Mutex::new(Sink {
                buffer: LogBuffer::with_capacity(config.flush_threshold_bytes),
                writer: SegmentWriter::new(&dir, config.segment_max_bytes, config.sync_on_flush),
            }),
            dir,
            appends: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fail if a previous flush poisoned the log
    pub fn check_writable(&self) -> Result<()> {
        if self.state.lock().failed {
            return Err(Error::LogFailed);
        }
        Ok(())
    }

    /// Assign the next txid and buffer the record
    ///
    /// The record is not durable until a flush covering its txid completes.
    pub fn append(&self, op: LogOp, path: &str, attrs: &Attributes) -> Result<Appended> {
        let mut state = self.state.lock();
        if state.failed {
            return Err(Error::LogFailed);
        }

        let tx_id = TxId(state.next_tx_id);
        state.active.push(&LogRecord {
            tx_id,
            op,
            path: path.to_string(),
            attrs: attrs.clone(),
        })?;
        state.next_tx_id += 1;
        self.appends.fetch_add(1, Ordering::Relaxed);

        let flush_due = !state.flushing && state.active.size() >= self.flush_threshold;
        Ok(Appended { tx_id, flush_due })
    }

    /// Persist every record appended before this call
    ///
    /// A write failure poisons the log: this call and every later append or
    /// flush fail with [`Error::LogFailed`] or the write error.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.failed {
                return Err(Error::LogFailed);
            }
            if !state.flushing {
                break;
            }
            self.flush_done.wait(&mut state);
        }
        if state.active.is_empty() {
            return Ok(());
        }

        state.flushing = true;
        let mut sink = self.sink.lock();
        std::mem::swap(&mut state.active, &mut sink.buffer);
        drop(state);

        let last = sink.buffer.last_tx();
        let records = sink.buffer.records();
        let Sink { buffer, writer } = &mut *sink;
        let result = writer.write(buffer);
        buffer.clear();
        drop(sink);

        let mut state = self.state.lock();
        state.flushing = false;
        let result = match result {
            Ok(bytes) => {
                state.persisted_tx_id = last;
                self.flushes.fetch_add(1, Ordering::Relaxed);
                self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
                debug!("Flushed {} edit log records through txid {}", records, last);
                Ok(())
            }
            Err(e) => {
                state.failed = true;
                error!("Edit log flush through txid {} failed: {}", last, e);
                Err(Error::LogWrite(e.to_string()))
            }
        };
        drop(state);
        self.flush_done.notify_all();
        result
    }

    /// Last txid handed out by [`append`](Self::append)
    pub fn last_tx_id(&self) -> TxId {
        TxId(self.state.lock().next_tx_id - 1)
    }

    /// Highest txid known to be on disk
    pub fn persisted_tx_id(&self) -> TxId {
        self.state.lock().persisted_tx_id
    }

    pub fn stats(&self) -> LogStats {
        let state = self.state.lock();
        LogStats {
            appends: self.appends.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            last_tx_id: TxId(state.next_tx_id - 1),
            persisted_tx_id: state.persisted_tx_id,
        }
    }

    /// Delete segments whose every record is at or below `tx_id`
    ///
    /// A segment's records end right before the next segment starts, so the
    /// newest segment is never a candidate.
    pub fn purge_through(&self, tx_id: TxId) -> Result<usize> {
        let segments = list_segments(&self.dir)?;
        let mut removed = 0;
        for pair in segments.windows(2) {
            if pair[1].start.as_u64() <= tx_id.as_u64() + 1 {
                std::fs::remove_file(&pair[0].path)?;
                debug!("Purged edit log segment {:?}", pair[0].path);
                removed += 1;
            } else {
                break;
            }
        }
        if removed > 0 {
            sync_dir(&self.dir)?;
            info!("Purged {} edit log segments through txid {}", removed, tx_id);
        }
        Ok(removed)
    }

    /// Flush and close the current segment
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.sink.lock().writer.close()
    }

    /// Visit every persisted record with a txid above `from`, in order
    ///
    /// Txids must be contiguous from `from + 1`. A gap, a missing segment or
    /// a corrupt record fails the replay. A torn record at the end of the
    /// newest segment is the remains of a crash during the last write and
    /// ends the replay with a warning.
    pub fn replay<F>(dir: impl AsRef<Path>, from: TxId, mut visit: F) -> Result<ReplaySummary>
    where
        F: FnMut(LogRecord) -> Result<()>,
    {
        let dir = dir.as_ref();
        let segments = list_segments(dir)?;
        let mut expected = from.as_u64() + 1;
        let mut summary = ReplaySummary {
            last_tx_id: from,
            ..ReplaySummary::default()
        };

        for (i, segment) in segments.iter().enumerate() {
            let next = segments.get(i + 1);
            // Every record here precedes the next segment's start
            if next.is_some_and(|n| n.start.as_u64() <= expected) {
                continue;
            }
            if segment.start.as_u64() > expected {
                return Err(Error::MissingSegment { expected });
            }

            let contents = read_segment(segment)?;
            let mut cursor = segment.start.as_u64();
            for record in contents.records {
                if record.tx_id.as_u64() != cursor {
                    return Err(Error::CorruptSegment(format!(
                        "{}: expected txid {cursor}, found {}",
                        segment.path.display(),
                        record.tx_id
                    )));
                }
                cursor += 1;

                if record.tx_id.as_u64() >= expected {
                    let tx_id = record.tx_id;
                    visit(record)?;
                    expected = tx_id.as_u64() + 1;
                    summary.last_tx_id = tx_id;
                    summary.replayed += 1;
                }
            }
            summary.segments += 1;

            if contents.torn_bytes > 0 {
                if next.is_some() {
                    return Err(Error::CorruptSegment(format!(
                        "{}: {} trailing bytes do not form a record",
                        segment.path.display(),
                        contents.torn_bytes
                    )));
                }
                warn!(
                    "Ignoring torn record ({} bytes) at the end of {:?}",
                    contents.torn_bytes, segment.path
                );
            }
            if let Some(next) = next {
                if next.start.as_u64() != cursor {
                    return Err(if next.start.as_u64() > cursor {
                        Error::MissingSegment { expected: cursor }
                    } else {
                        Error::CorruptSegment(format!(
                            "{} overlaps {}",
                            segment.path.display(),
                            next.path.display()
                        ))
                    });
                }
            }
        }

        info!(
            "Replayed {} edit log records from {} segments (txid {} -> {})",
            summary.replayed, summary.segments, from, summary.last_tx_id
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn config(threshold: usize) -> EditLogConfig {
        EditLogConfig {
            flush_threshold_bytes: threshold,
            flush_interval_ms: 1000,
            segment_max_bytes: 64 * 1024 * 1024,
            sync_on_flush: false,
        }
    }

    fn collect(dir: &Path, from: TxId) -> Result<Vec<LogRecord>> {
        let mut out = Vec::new();
        EditLog::replay(dir, from, |r| {
            out.push(r);
            Ok(())
        })?;
        Ok(out)
    }

    #[test]
    fn test_append_assigns_increasing_txids() {
        let dir = TempDir::new().unwrap();
        let log = EditLog::open(dir.path(), &config(1 << 20), TxId::ZERO).unwrap();

        let a = log.append(LogOp::Mkdir, "/a", &Attributes::new()).unwrap();
        let b = log.append(LogOp::Create, "/a/f", &Attributes::new()).unwrap();
        assert_eq!(a.tx_id, TxId(1));
        assert_eq!(b.tx_id, TxId(2));
        assert!(!b.flush_due);
        assert_eq!(log.last_tx_id(), TxId(2));
        assert_eq!(log.persisted_tx_id(), TxId::ZERO);

        log.flush().unwrap();
        assert_eq!(log.persisted_tx_id(), TxId(2));
        let stats = log.stats();
        assert_eq!(stats.appends, 2);
        assert_eq!(stats.flushes, 1);
        assert!(stats.bytes_written > 0);
    }

    #[test]
    fn test_threshold_reports_flush_due() {
        let dir = TempDir::new().unwrap();
        let log = EditLog::open(dir.path(), &config(1), TxId::ZERO).unwrap();
        let appended = log.append(LogOp::Mkdir, "/a", &Attributes::new()).unwrap();
        assert!(appended.flush_due);
    }

    #[test]
    fn test_flush_of_empty_buffer_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let log = EditLog::open(dir.path(), &config(1024), TxId::ZERO).unwrap();
        log.flush().unwrap();
        assert!(list_segments(dir.path()).unwrap().is_empty());
        assert_eq!(log.stats().flushes, 0);
    }

    #[test]
    fn test_replay_from_offset_and_across_restarts() {
        let dir = TempDir::new().unwrap();
        {
            let log = EditLog::open(dir.path(), &config(1024), TxId::ZERO).unwrap();
            for i in 0..5 {
                log.append(LogOp::Mkdir, &format!("/d{i}"), &Attributes::new())
                    .unwrap();
            }
            log.close().unwrap();
        }
        {
            // second process continues in a new segment
            let log = EditLog::open(dir.path(), &config(1024), TxId(5)).unwrap();
            log.append(LogOp::Mkdir, "/d5", &Attributes::new()).unwrap();
            log.close().unwrap();
        }
        assert_eq!(list_segments(dir.path()).unwrap().len(), 2);

        let all = collect(dir.path(), TxId::ZERO).unwrap();
        assert_eq!(
            all.iter().map(|r| r.tx_id.as_u64()).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5, 6]
        );

        let tail = collect(dir.path(), TxId(4)).unwrap();
        assert_eq!(
            tail.iter().map(|r| r.path.as_str()).collect::<Vec<_>>(),
            vec!["/d4", "/d5"]
        );

        assert!(collect(dir.path(), TxId(6)).unwrap().is_empty());
    }

    #[test]
    fn test_replay_detects_missing_segment() {
        let dir = TempDir::new().unwrap();
        for (start, count) in [(0u64, 3u64), (3, 3), (6, 3)] {
            let log = EditLog::open(dir.path(), &config(1024), TxId(start)).unwrap();
            for i in 0..count {
                log.append(LogOp::Mkdir, &format!("/d{}", start + i), &Attributes::new())
                    .unwrap();
            }
            log.close().unwrap();
        }

        let segments = list_segments(dir.path()).unwrap();
        std::fs::remove_file(&segments[1].path).unwrap();
        assert!(matches!(
            collect(dir.path(), TxId::ZERO),
            Err(Error::MissingSegment { expected: 4 })
        ));

        // nothing before the snapshot point is needed
        std::fs::remove_file(&segments[0].path).unwrap();
        assert_eq!(collect(dir.path(), TxId(6)).unwrap().len(), 3);
        assert!(matches!(
            collect(dir.path(), TxId(2)),
            Err(Error::MissingSegment { expected: 3 })
        ));
    }

    #[test]
    fn test_replay_tolerates_torn_tail_only_in_last_segment() {
        let dir = TempDir::new().unwrap();
        for start in [0u64, 2] {
            let log = EditLog::open(dir.path(), &config(1024), TxId(start)).unwrap();
            log.append(LogOp::Mkdir, &format!("/a{start}"), &Attributes::new())
                .unwrap();
            log.append(LogOp::Mkdir, &format!("/b{start}"), &Attributes::new())
                .unwrap();
            log.close().unwrap();
        }
        let segments = list_segments(dir.path()).unwrap();

        let last = &segments[1].path;
        let data = std::fs::read(last).unwrap();
        std::fs::write(last, &data[..data.len() - 2]).unwrap();
        let records = collect(dir.path(), TxId::ZERO).unwrap();
        assert_eq!(records.len(), 3);

        let first = &segments[0].path;
        let data = std::fs::read(first).unwrap();
        std::fs::write(first, &data[..data.len() - 2]).unwrap();
        assert!(matches!(
            collect(dir.path(), TxId::ZERO),
            Err(Error::CorruptSegment(_))
        ));
    }

    #[test]
    fn test_purge_through_keeps_needed_segments() {
        let dir = TempDir::new().unwrap();
        for start in [0u64, 2, 4] {
            let log = EditLog::open(dir.path(), &config(1024), TxId(start)).unwrap();
            log.append(LogOp::Mkdir, &format!("/a{start}"), &Attributes::new())
                .unwrap();
            log.append(LogOp::Mkdir, &format!("/b{start}"), &Attributes::new())
                .unwrap();
            log.close().unwrap();
        }

        let log = EditLog::open(dir.path(), &config(1024), TxId(6)).unwrap();
        // txid 3 lives in the second segment, so only the first goes
        assert_eq!(log.purge_through(TxId(3)).unwrap(), 1);
        assert_eq!(log.purge_through(TxId(4)).unwrap(), 1);
        // the newest segment always stays
        assert_eq!(log.purge_through(TxId(100)).unwrap(), 0);
        assert_eq!(collect(dir.path(), TxId(4)).unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_appends_during_flush_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(EditLog::open(dir.path(), &config(256), TxId::ZERO).unwrap());

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        let appended = log
                            .append(LogOp::Mkdir, &format!("/t{t}/{i}"), &Attributes::new())
                            .unwrap();
                        if appended.flush_due {
                            log.flush().unwrap();
                        }
                    }
                })
            })
            .collect();
        let flusher = {
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    log.flush().unwrap();
                    std::thread::yield_now();
                }
            })
        };
        for handle in writers {
            handle.join().unwrap();
        }
        flusher.join().unwrap();
        log.close().unwrap();

        let records = collect(dir.path(), TxId::ZERO).unwrap();
        assert_eq!(records.len(), 1000);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.tx_id.as_u64(), i as u64 + 1);
        }
        assert_eq!(log.persisted_tx_id(), TxId(1000));
    }

    #[test]
    fn test_failed_flush_poisons_log() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("editlog");
        let log = EditLog::open(&log_dir, &config(1024), TxId::ZERO).unwrap();
        log.append(LogOp::Mkdir, "/a", &Attributes::new()).unwrap();

        // a plain file where the segment directory should be
        std::fs::remove_dir_all(&log_dir).unwrap();
        std::fs::write(&log_dir, b"not a directory").unwrap();

        assert!(matches!(log.flush(), Err(Error::LogWrite(_))));
        assert!(matches!(
            log.append(LogOp::Mkdir, "/b", &Attributes::new()),
            Err(Error::LogFailed)
        ));
        assert!(matches!(log.flush(), Err(Error::LogFailed)));
        assert!(log.check_writable().is_err());
    }
}

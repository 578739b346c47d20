//! Edit log segment files
//!
//! A segment is named after the txid of its first record
//! (`edits_<20 digits>.log`) and only ever appended to.

use super::buffer::LogBuffer;
use super::record::{FrameError, LogRecord};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracker_common::{Error, Result, TxId};

const SEGMENT_PREFIX: &str = "edits_";
const SEGMENT_SUFFIX: &str = ".log";

/// A segment file found on disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentFile {
    pub start: TxId,
    pub path: PathBuf,
}

#[must_use]
pub fn segment_name(start: TxId) -> String {
    format!("{SEGMENT_PREFIX}{:020}{SEGMENT_SUFFIX}", start.as_u64())
}

fn parse_segment_name(name: &str) -> Option<TxId> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
        .map(TxId)
}

/// Segments in `dir`, ascending by starting txid
pub fn list_segments(dir: &Path) -> Result<Vec<SegmentFile>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(start) = name.to_str().and_then(parse_segment_name) {
            segments.push(SegmentFile {
                start,
                path: entry.path(),
            });
        }
    }
    segments.sort_by_key(|s| s.start);
    Ok(segments)
}

/// Result of reading one segment
#[derive(Debug, Default)]
pub struct SegmentContents {
    pub records: Vec<LogRecord>,
    /// Length of the prefix made of whole records
    pub valid_len: u64,
    /// Bytes at the end that did not form a whole record
    pub torn_bytes: usize,
}

/// Read every record of a segment
///
/// A truncated record is only reported through `torn_bytes`; whether that
/// is acceptable depends on the segment's position and is the caller's call.
pub fn read_segment(segment: &SegmentFile) -> Result<SegmentContents> {
    let data = std::fs::read(&segment.path)?;
    let mut contents = SegmentContents::default();
    let mut pos = 0;

    while pos < data.len() {
        match LogRecord::decode(&data[pos..]) {
            Ok((record, size)) => {
                contents.records.push(record);
                pos += size;
            }
            Err(FrameError::Truncated) => {
                contents.valid_len = pos as u64;
                contents.torn_bytes = data.len() - pos;
                break;
            }
            Err(FrameError::Corrupt(msg)) => {
                return Err(Error::CorruptSegment(format!(
                    "{} at offset {pos}: {msg}",
                    segment.path.display()
                )));
            }
        }
    }
    if contents.torn_bytes == 0 {
        contents.valid_len = data.len() as u64;
    }
    Ok(contents)
}

/// Cut a torn record off the end of the newest segment in `dir`
///
/// Once a new segment follows it, a torn tail would sit in the middle of
/// the log and fail every later replay. Returns the bytes removed.
pub fn truncate_torn_tail(dir: &Path) -> Result<usize> {
    let Some(newest) = list_segments(dir)?.pop() else {
        return Ok(0);
    };
    let contents = read_segment(&newest)?;
    if contents.torn_bytes == 0 {
        return Ok(0);
    }

    let file = OpenOptions::new().write(true).open(&newest.path)?;
    file.set_len(contents.valid_len)?;
    file.sync_all()?;
    sync_dir(dir)?;
    warn!(
        "Truncated torn record ({} bytes) at the end of {:?}",
        contents.torn_bytes, newest.path
    );
    Ok(contents.torn_bytes)
}

/// fsync a directory so renames and new files inside it are durable
pub fn sync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

struct OpenSegment {
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
}

/// Appends flushed buffers to the current segment, rolling as needed
pub struct SegmentWriter {
    dir: PathBuf,
    max_bytes: u64,
    sync: bool,
    current: Option<OpenSegment>,
}

impl SegmentWriter {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64, sync: bool) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
            sync,
            current: None,
        }
    }

    /// Write the whole buffer to disk; returns the bytes written
    ///
    /// The first write of a process opens a fresh segment named after the
    /// buffer's first txid.
    pub fn write(&mut self, buffer: &LogBuffer) -> Result<u64> {
        let Some(first) = buffer.first_tx() else {
            return Ok(0);
        };

        let roll = self
            .current
            .as_ref()
            .is_none_or(|seg| seg.size >= self.max_bytes);
        if roll {
            self.roll(first)?;
        }

        let seg = self
            .current
            .as_mut()
            .ok_or_else(|| Error::internal("no open edit log segment"))?;
        seg.writer.write_all(buffer.bytes())?;
        seg.writer.flush()?;
        if self.sync {
            seg.writer.get_ref().sync_data()?;
        }

        let written = buffer.size() as u64;
        seg.size += written;
        Ok(written)
    }

    fn roll(&mut self, start: TxId) -> Result<()> {
        if let Some(mut old) = self.current.take() {
            old.writer.flush()?;
            old.writer.get_ref().sync_all()?;
            debug!("Closed edit log segment {:?} ({} bytes)", old.path, old.size);
        }

        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(segment_name(start));
        // A leftover file with this name can only hold a torn tail that
        // recovery already accepted as lost, so it is truncated.
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        sync_dir(&self.dir)?;

        info!("Opened edit log segment {:?}", path);
        self.current = Some(OpenSegment {
            path,
            writer: BufWriter::with_capacity(64 * 1024, file),
            size: 0,
        });
        Ok(())
    }

    /// Path of the segment currently written to
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|seg| seg.path.as_path())
    }

    /// Flush and fsync the open segment
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut seg) = self.current.take() {
            seg.writer.flush()?;
            seg.writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

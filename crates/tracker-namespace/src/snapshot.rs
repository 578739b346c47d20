//! Namespace snapshots (images)
//!
//! A snapshot named `fsimage_<maxTxId>.img` holds the tree as of `maxTxId`:
//! ```text
//! +--------+---------+----------+-------------+--------+---------+
//! | Magic  | Version | MaxTxId  | Payload len | CRC32C | Payload |
//! | 4B     | 4B      | 8B       | 8B          | 4B     | var     |
//! +--------+---------+----------+-------------+--------+---------+
//! ```
//! Images are written to a `.tmp` file, synced and renamed into place, so
//! a reader only ever discovers complete files.

use crate::editlog::sync_dir;
use crate::tree::NamespaceTree;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracker_common::{Error, Result, TxId};

const SNAPSHOT_MAGIC: u32 = 0x5449_4D47; // "TIMG"
const SNAPSHOT_VERSION: u32 = 1;
const IMAGE_PREFIX: &str = "fsimage_";
const IMAGE_SUFFIX: &str = ".img";

/// Snapshot file header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SnapshotHeader {
    version: u32,
    max_tx_id: u64,
    payload_len: u64,
    checksum: u32,
}

impl SnapshotHeader {
    const SIZE: usize = 28;

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.max_tx_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[24..28].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> std::result::Result<Self, String> {
        if buf.len() < Self::SIZE {
            return Err(format!("{} bytes is shorter than the header", buf.len()));
        }
        let u32_at = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[at..at + 4]);
            u32::from_le_bytes(b)
        };
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(b)
        };

        let magic = u32_at(0);
        if magic != SNAPSHOT_MAGIC {
            return Err(format!("bad magic {magic:#010x}"));
        }
        let version = u32_at(4);
        if version != SNAPSHOT_VERSION {
            return Err(format!("unsupported version {version}"));
        }
        Ok(Self {
            version,
            max_tx_id: u64_at(8),
            payload_len: u64_at(16),
            checksum: u32_at(24),
        })
    }
}

/// A structurally valid snapshot found on disk
#[derive(Debug)]
pub struct SnapshotImage {
    pub path: PathBuf,
    pub max_tx_id: TxId,
    payload: Vec<u8>,
}

#[must_use]
pub fn image_name(max_tx_id: TxId) -> String {
    format!("{IMAGE_PREFIX}{:020}{IMAGE_SUFFIX}", max_tx_id.as_u64())
}

fn parse_image_name(name: &str) -> Option<TxId> {
    name.strip_prefix(IMAGE_PREFIX)?
        .strip_suffix(IMAGE_SUFFIX)?
        .parse()
        .ok()
        .map(TxId)
}

/// Reads and writes snapshots in one directory
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot files by name, newest first
    pub fn list(&self) -> Result<Vec<(TxId, PathBuf)>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut images = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            match name.to_str().and_then(parse_image_name) {
                Some(tx) => images.push((tx, entry.path())),
                None => debug!("Skipping non-snapshot file {:?}", entry.path()),
            }
        }
        images.sort_by_key(|(tx, _)| std::cmp::Reverse(*tx));
        Ok(images)
    }

    /// The valid snapshot with the greatest maxTxId
    ///
    /// Candidates that fail validation are skipped with a warning so a
    /// half-written or damaged newest image falls back to an older one.
    pub fn scan_latest_valid(&self) -> Result<Option<SnapshotImage>> {
        for (tx, path) in self.list()? {
            match Self::validate(&path) {
                Ok((header, payload)) if header.max_tx_id == tx.as_u64() => {
                    return Ok(Some(SnapshotImage {
                        path,
                        max_tx_id: tx,
                        payload,
                    }));
                }
                Ok((header, _)) => warn!(
                    "Skipping snapshot {:?}: header txid {} does not match its name",
                    path, header.max_tx_id
                ),
                Err(reason) => warn!("Skipping invalid snapshot {:?}: {}", path, reason),
            }
        }
        Ok(None)
    }

    fn validate(path: &Path) -> std::result::Result<(SnapshotHeader, Vec<u8>), String> {
        let mut data = std::fs::read(path).map_err(|e| e.to_string())?;
        let header = SnapshotHeader::from_bytes(&data)?;

        let payload_len = usize::try_from(header.payload_len).map_err(|e| e.to_string())?;
        if data.len() - SnapshotHeader::SIZE != payload_len {
            return Err(format!(
                "payload is {} bytes, header says {}",
                data.len() - SnapshotHeader::SIZE,
                payload_len
            ));
        }
        let payload = data.split_off(SnapshotHeader::SIZE);
        if crc32c::crc32c(&payload) != header.checksum {
            return Err("checksum mismatch".to_string());
        }
        Ok((header, payload))
    }

    /// Deserialize the tree held by `image`
    pub fn read(&self, image: &SnapshotImage) -> Result<NamespaceTree> {
        bincode::deserialize(&image.payload).map_err(|e| {
            Error::CorruptSnapshot(format!("{}: {e}", image.path.display()))
        })
    }

    /// Publish `tree` as the snapshot for `max_tx_id`
    pub fn write(&self, tree: &NamespaceTree, max_tx_id: TxId) -> Result<PathBuf> {
        let payload = bincode::serialize(tree)
            .map_err(|e| Error::SnapshotWrite(format!("failed to serialize tree: {e}")))?;
        let header = SnapshotHeader {
            version: SNAPSHOT_VERSION,
            max_tx_id: max_tx_id.as_u64(),
            payload_len: payload.len() as u64,
            checksum: crc32c::crc32c(&payload),
        };

        let snapshot_path = self.dir.join(image_name(max_tx_id));
        let temp_path = self.dir.join(format!("{}.tmp", image_name(max_tx_id)));
        self.write_file(&temp_path, &header, &payload)
            .and_then(|()| std::fs::rename(&temp_path, &snapshot_path))
            .and_then(|()| sync_dir(&self.dir))
            .map_err(|e| {
                let _ = std::fs::remove_file(&temp_path);
                Error::SnapshotWrite(format!("{}: {e}", snapshot_path.display()))
            })?;

        info!(
            "Wrote snapshot {:?} ({} entries, {} bytes)",
            snapshot_path,
            tree.len(),
            payload.len()
        );
        Ok(snapshot_path)
    }

    fn write_file(
        &self,
        path: &Path,
        header: &SnapshotHeader,
        payload: &[u8],
    ) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&header.to_bytes())?;
        writer.write_all(payload)?;
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Delete all but the newest `keep` snapshots; returns how many went
    pub fn retain(&self, keep: usize) -> Result<usize> {
        let mut removed = 0;
        for (_, path) in self.list()?.into_iter().skip(keep) {
            std::fs::remove_file(&path)?;
            debug!("Removed old snapshot {:?}", path);
            removed += 1;
        }
        Ok(removed)
    }

    /// maxTxId of the oldest snapshot still on disk
    pub fn oldest(&self) -> Result<Option<TxId>> {
        Ok(self.list()?.last().map(|(tx, _)| *tx))
    }
}

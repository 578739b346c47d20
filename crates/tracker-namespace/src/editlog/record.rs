//! Edit log records
//!
//! Record format:
//! ```text
//! +--------+------+--------+---------+--------+
//! | Magic  | TxId | Length | Payload | CRC32C |
//! | 4B     | 8B   | 4B     | var     | 4B     |
//! +--------+------+--------+---------+--------+
//! ```
//! The payload is the bincode encoding of [`RecordBody`]; the checksum
//! covers everything before it.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracker_common::{Attributes, Error, Result, TxId};

/// Record magic number
pub const RECORD_MAGIC: u32 = 0x5445_444C; // "TEDL"

/// Header size (magic + txid + length)
pub const RECORD_HEADER_SIZE: usize = 16;

/// Trailing checksum size
const CRC_SIZE: usize = 4;

/// Structural mutation carried by a record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogOp {
    Mkdir,
    Create,
    Delete,
}

impl fmt::Display for LogOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mkdir => "MKDIR",
            Self::Create => "CREATE",
            Self::Delete => "DELETE",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct RecordBody {
    op: LogOp,
    path: String,
    attrs: Attributes,
}

/// One immutable edit log entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub tx_id: TxId,
    pub op: LogOp,
    pub path: String,
    pub attrs: Attributes,
}

/// Why a frame could not be decoded
#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the frame needs; a torn write at the end of a segment
    Truncated,
    /// Bytes are present but wrong
    Corrupt(String),
}

impl LogRecord {
    /// Append the framed record to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let body = RecordBody {
            op: self.op,
            path: self.path.clone(),
            attrs: self.attrs.clone(),
        };
        let payload =
            bincode::serialize(&body).map_err(|e| Error::Serialization(e.to_string()))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::Serialization(format!("record payload of {} bytes", payload.len())))?;

        let start = buf.len();
        buf.reserve(RECORD_HEADER_SIZE + payload.len() + CRC_SIZE);
        buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.tx_id.as_u64().to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);

        let crc = crc32c::crc32c(&buf[start..]);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    /// Parse one record from the front of `data`, returning it and its size
    pub fn decode(data: &[u8]) -> std::result::Result<(Self, usize), FrameError> {
        if data.len() < RECORD_HEADER_SIZE {
            return Err(FrameError::Truncated);
        }

        let magic = u32::from_le_bytes(le_array(&data[0..4]));
        if magic != RECORD_MAGIC {
            return Err(FrameError::Corrupt(format!("bad magic {magic:#010x}")));
        }
        let tx_id = u64::from_le_bytes(le_array(&data[4..12]));
        let len = u32::from_le_bytes(le_array(&data[12..16])) as usize;

        let total = RECORD_HEADER_SIZE + len + CRC_SIZE;
        if data.len() < total {
            return Err(FrameError::Truncated);
        }

        let stored = u32::from_le_bytes(le_array(&data[total - CRC_SIZE..total]));
        let computed = crc32c::crc32c(&data[..total - CRC_SIZE]);
        if stored != computed {
            return Err(FrameError::Corrupt(format!("checksum mismatch at txid {tx_id}")));
        }

        let body: RecordBody = bincode::deserialize(&data[RECORD_HEADER_SIZE..total - CRC_SIZE])
            .map_err(|e| FrameError::Corrupt(format!("txid {tx_id}: {e}")))?;

        Ok((
            Self {
                tx_id: TxId(tx_id),
                op: body.op,
                path: body.path,
                attrs: body.attrs,
            },
            total,
        ))
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

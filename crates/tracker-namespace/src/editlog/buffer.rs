//! One half of the edit log double buffer

use super::record::LogRecord;
use tracker_common::{Result, TxId};

/// Encoded records waiting to be written to a segment
#[derive(Debug, Default)]
pub struct LogBuffer {
    data: Vec<u8>,
    first_tx: Option<TxId>,
    last_tx: TxId,
    records: u64,
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Encode `record` at the end of the buffer
    ///
    /// Records must arrive in txid order; the caller holds the lock that
    /// assigns txids.
    pub fn push(&mut self, record: &LogRecord) -> Result<()> {
        record.encode_into(&mut self.data)?;
        self.first_tx.get_or_insert(record.tx_id);
        self.last_tx = record.tx_id;
        self.records += 1;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub const fn first_tx(&self) -> Option<TxId> {
        self.first_tx
    }

    pub const fn last_tx(&self) -> TxId {
        self.last_tx
    }

    /// Drop the contents, keeping the allocation
    pub fn clear(&mut self) {
        self.data.clear();
        self.first_tx = None;
        self.last_tx = TxId::ZERO;
        self.records = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editlog::record::LogOp;
    use tracker_common::Attributes;

    #[test]
    fn test_tracks_txid_range() {
        let mut buf = LogBuffer::with_capacity(64);
        assert!(buf.is_empty());

        for tx in 5..8 {
            buf.push(&LogRecord {
                tx_id: TxId(tx),
                op: LogOp::Mkdir,
                path: format!("/d{tx}"),
                attrs: Attributes::new(),
            })
            .unwrap();
        }
        assert_eq!(buf.first_tx(), Some(TxId(5)));
        assert_eq!(buf.last_tx(), TxId(7));
        assert_eq!(buf.records(), 3);
        assert!(buf.size() > 0);

        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.first_tx(), None);
    }
}

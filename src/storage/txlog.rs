use std::fs::{File, OpenOptions};
use std::io::{Read, Write};

use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::config::RtSettings;
use crate::core::error::{Error, Result};
use crate::segment::data::SegmentData;
use crate::storage::layout::IndexLayout;

const TLOG_HEADER: [u8; 8] = *b"RTTLOG\x01\x00";

/// One replayable transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TxLogOp {
    /// Full committed accumulator state: the freshly built segment (None
    /// for delete-only commits) plus the kill list
    Commit {
        tid: u64,
        segment: Option<SegmentData>,
        kill_list: Vec<u64>,
    },
    /// Tokenizer/dictionary/index settings change
    Reconfigure {
        tid: u64,
        settings: RtSettings,
        tokenizer_hash: u64,
        dictionary_hash: u64,
    },
}

impl TxLogOp {
    pub fn tid(&self) -> u64 {
        match self {
            TxLogOp::Commit { tid, .. } | TxLogOp::Reconfigure { tid, .. } => *tid,
        }
    }
}

/// Append-only transaction log (`P.tlog`). Records whose TID is already
/// covered by the on-disk state are skipped on replay; the log is reset
/// after every successful save.
pub struct TxLog {
    file: Mutex<File>,
    layout: IndexLayout,
}

impl TxLog {
    pub fn open(layout: &IndexLayout) -> Result<Self> {
        let path = layout.tlog_path();
        let is_new = !path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        if is_new {
            file.write_all(&TLOG_HEADER)?;
            file.sync_all()?;
        }
        Ok(TxLog {
            file: Mutex::new(file),
            layout: layout.clone(),
        })
    }

    /// Append one record: length, body checksum, bincode body
    pub fn append(&self, op: &TxLogOp) -> Result<()> {
        let body = bincode::serialize(op)?;
        let mut file = self.file.lock();
        file.write_all(&(body.len() as u32).to_le_bytes())?;
        file.write_all(&crc32fast::hash(&body).to_le_bytes())?;
        file.write_all(&body)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read every record with `tid > after_tid`. A torn tail (crash mid
    /// append) ends replay with a warning instead of an error.
    pub fn replay(layout: &IndexLayout, after_tid: u64) -> Result<Vec<TxLogOp>> {
        let path = layout.tlog_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut data = Vec::new();
        File::open(&path)?.read_to_end(&mut data)?;
        if data.len() < TLOG_HEADER.len() || data[..TLOG_HEADER.len()] != TLOG_HEADER {
            return Err(Error::corrupted(format!("{path:?}: bad transaction log header")));
        }

        let mut ops = Vec::new();
        let mut pos = TLOG_HEADER.len();
        while pos + 8 <= data.len() {
            let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
                as usize;
            let crc =
                u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
            pos += 8;
            if pos + len > data.len() {
                warn!("{path:?}: torn record at byte {pos}, stopping replay");
                break;
            }
            let body = &data[pos..pos + len];
            if crc32fast::hash(body) != crc {
                warn!("{path:?}: checksum mismatch at byte {pos}, stopping replay");
                break;
            }
            pos += len;
            let op: TxLogOp = bincode::deserialize(body)?;
            if op.tid() > after_tid {
                ops.push(op);
            }
        }
        if !ops.is_empty() {
            info!("transaction log: {} records to replay", ops.len());
        }
        Ok(ops)
    }

    /// Drop all records; the on-disk state now covers them
    pub fn reset(&self) -> Result<()> {
        let mut file = self.file.lock();
        let fresh = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.layout.tlog_path())?;
        *file = fresh;
        file.write_all(&TLOG_HEADER)?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_layout() -> (tempfile::TempDir, IndexLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = IndexLayout::new(dir.path().join("idx"));
        (dir, layout)
    }

    #[test]
    fn test_append_and_replay_filters_by_tid() {
        let (_dir, layout) = temp_layout();
        let log = TxLog::open(&layout).unwrap();
        for tid in 1..=3u64 {
            log.append(&TxLogOp::Commit {
                tid,
                segment: None,
                kill_list: vec![tid * 10],
            })
            .unwrap();
        }
        let ops = TxLog::replay(&layout, 1).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].tid(), 2);
        assert_eq!(ops[1].tid(), 3);
    }

    #[test]
    fn test_torn_tail_is_tolerated() {
        let (_dir, layout) = temp_layout();
        let log = TxLog::open(&layout).unwrap();
        log.append(&TxLogOp::Commit {
            tid: 1,
            segment: None,
            kill_list: vec![],
        })
        .unwrap();
        drop(log);

        // Simulate a crash mid-append
        let mut file = OpenOptions::new()
            .append(true)
            .open(layout.tlog_path())
            .unwrap();
        file.write_all(&[0xFF, 0x00, 0x00, 0x00, 1, 2, 3]).unwrap();
        drop(file);

        let ops = TxLog::replay(&layout, 0).unwrap();
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn test_reset_clears_records() {
        let (_dir, layout) = temp_layout();
        let log = TxLog::open(&layout).unwrap();
        log.append(&TxLogOp::Commit {
            tid: 1,
            segment: None,
            kill_list: vec![],
        })
        .unwrap();
        log.reset().unwrap();
        assert!(TxLog::replay(&layout, 0).unwrap().is_empty());
    }
}

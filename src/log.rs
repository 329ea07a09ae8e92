//! The metadata record log.
//!
//! The controller never applies the records it produces directly. Records are appended to a
//! `RecordLog`, and only once the log reports them as committed, via a `CommittedBatch`, are they
//! replayed into the cluster control manager.

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::models::MetadataRecord;
use crate::versioned::NO_OFFSET;

/// A batch of records which has been committed to the log, along with its offsets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedBatch {
    /// The offset of the first record of the batch.
    pub base_offset: i64,
    /// The offset of the last record of the batch.
    pub last_offset: i64,
    /// The records of the batch, in offset order.
    pub records: Vec<MetadataRecord>,
}

impl CommittedBatch {
    /// Iterate over the records of this batch along with the offset of each.
    pub fn iter(&self) -> impl Iterator<Item = (i64, &MetadataRecord)> {
        self.records.iter().enumerate().map(move |(idx, record)| (self.base_offset + idx as i64, record))
    }
}

/// A replicated log of metadata records.
pub trait RecordLog: Send {
    /// The offset which will be assigned to the next appended record.
    fn next_offset(&self) -> i64;

    /// Append the given records, returning the offset assigned to the last of them.
    ///
    /// Records are assigned consecutive offsets starting at `next_offset()`. Committed batches
    /// are delivered out of band, in offset order.
    fn append(&mut self, records: Vec<MetadataRecord>) -> Result<i64>;
}

/// An in-process log which commits every batch as soon as it is appended.
///
/// This is the log used by a single controller node, and it is what the tests run against.
pub struct LocalLog {
    next_offset: i64,
    committed_tx: mpsc::UnboundedSender<CommittedBatch>,
}

impl LocalLog {
    /// Create a new instance whose first record will be written at `NO_OFFSET + 1`.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CommittedBatch>) {
        let (committed_tx, committed_rx) = mpsc::unbounded_channel();
        (
            Self {
                next_offset: NO_OFFSET + 1,
                committed_tx,
            },
            committed_rx,
        )
    }
}

impl RecordLog for LocalLog {
    fn next_offset(&self) -> i64 {
        self.next_offset
    }

    #[tracing::instrument(level = "trace", skip(self, records))]
    fn append(&mut self, records: Vec<MetadataRecord>) -> Result<i64> {
        if records.is_empty() {
            return Ok(self.next_offset - 1);
        }
        let base_offset = self.next_offset;
        let last_offset = base_offset + records.len() as i64 - 1;
        self.committed_tx
            .send(CommittedBatch {
                base_offset,
                last_offset,
                records,
            })
            .ok()
            .context("error committing batch, the committed batch receiver has been dropped")?;
        self.next_offset = last_offset + 1;
        tracing::trace!(base_offset, last_offset, "batch committed to local log");
        Ok(last_offset)
    }
}

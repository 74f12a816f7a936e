//! Sink connector capability

use super::batch::Batch;
use crate::error::ConnectorResult;
use async_trait::async_trait;
use serde::Serialize;

/// How written data becomes visible in the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkMode {
    /// Every acknowledged batch is immediately visible; commit only flushes
    Direct,
    /// Batches accumulate in a staging area; only commit makes them visible
    Staging,
}

/// Acknowledgement for one written batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteAck {
    pub rows_written: u64,
    pub bytes_written: u64,
}

impl WriteAck {
    pub fn new(rows_written: u64, bytes_written: u64) -> Self {
        Self {
            rows_written,
            bytes_written,
        }
    }
}

/// Outcome of the final commit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitResult {
    /// Rows made visible by this commit (direct sinks report rows written)
    pub rows_committed: u64,
    /// Where the data landed, e.g. a table or directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// A connector that writes batches to an external system.
///
/// `write` is all-or-nothing per batch: a failed write leaves none of that
/// batch's rows visible, so the executor can retry it without duplicates.
/// A staging sink must not expose any rows before `commit`, and a failed
/// commit must leave the target unchanged.
#[async_trait]
pub trait Sink: Send {
    fn kind(&self) -> &str;

    fn mode(&self) -> SinkMode;

    async fn open(&mut self) -> ConnectorResult<()>;

    async fn write(&mut self, batch: &Batch) -> ConnectorResult<WriteAck>;

    async fn commit(&mut self) -> ConnectorResult<CommitResult>;

    /// Release resources and remove staging artifacts per connector policy.
    /// Must be safe to call whether or not `open` or `commit` succeeded.
    async fn close(&mut self) -> ConnectorResult<()>;
}

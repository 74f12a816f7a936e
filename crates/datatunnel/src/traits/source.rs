//! Source connector capability

use super::batch::Batch;
use crate::error::ConnectorResult;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Lazy, finite sequence of batches produced by a source
pub type BatchStream = BoxStream<'static, ConnectorResult<Batch>>;

/// A connector that reads batches from an external system.
///
/// Lifecycle: `open` once, `read` once, `close` always (also after failures).
/// The stream returned by `read` is not restartable; reading again requires a
/// fresh `open`. Transport errors surface as stream items and are never
/// retried by the source itself.
#[async_trait]
pub trait Source: Send {
    /// Connector kind this instance was created for
    fn kind(&self) -> &str;

    /// Acquire connections and check that the configured dataset is readable
    async fn open(&mut self) -> ConnectorResult<()>;

    /// Start reading. Batches honor the configured column projection.
    async fn read(&mut self) -> ConnectorResult<BatchStream>;

    /// Release resources. Must be safe to call on a source that never opened.
    async fn close(&mut self) -> ConnectorResult<()>;
}

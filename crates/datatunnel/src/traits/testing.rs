//! Testing utilities for connectors
//!
//! Mock connectors that record every lifecycle call into a shared
//! [`MockState`] and fail on demand, so executor behavior (retries,
//! cancellation, cleanup) can be asserted without external systems.
//!
//! # Example
//!
//! ```rust,ignore
//! let state = MockState::default();
//! state.fail_write(5, MockFailure::Transient);
//!
//! let mut registry = ConnectorRegistry::new();
//! registry.register_source("mock", Arc::new(MockSourceFactory::new(state.clone())));
//! registry.register_sink("mock", Arc::new(MockSinkFactory::new(state.clone())));
//! ```

use super::batch::Batch;
use super::registry::{SinkFactory, SourceFactory};
use super::sink::{CommitResult, Sink, SinkMode, WriteAck};
use super::source::{BatchStream, Source};
use crate::error::{ConnectorError, ConnectorResult, OptionsError};
use crate::options::{OptionSchema, OptionType, OptionsBag, Projection};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Failure category to inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Transient,
    Timeout,
    Connection,
    Schema,
    Fatal,
}

impl MockFailure {
    fn to_error(self, what: &str) -> ConnectorError {
        match self {
            MockFailure::Transient => ConnectorError::transient(format!("injected {what} failure")),
            MockFailure::Timeout => ConnectorError::Timeout(format!("injected {what} timeout")),
            MockFailure::Connection => ConnectorError::connection(format!("injected {what} refusal")),
            MockFailure::Schema => ConnectorError::schema(format!("injected {what} schema mismatch")),
            MockFailure::Fatal => ConnectorError::fatal(format!("injected {what} failure")),
        }
    }
}

#[derive(Default)]
struct Inner {
    source_opens: u32,
    source_closes: u32,
    sink_opens: u32,
    sink_closes: u32,
    write_calls: u32,
    commit_calls: u32,
    source_open_failures: Vec<MockFailure>,
    sink_open_failures: Vec<MockFailure>,
    write_failures: HashMap<u32, MockFailure>,
    read_failure_after: Option<usize>,
    commit_failure: Option<MockFailure>,
    write_delay: Option<Duration>,
    cancel_after_writes: Option<(u32, CancellationToken)>,
    staged: Vec<Batch>,
    visible: Vec<Batch>,
}

/// Shared, inspectable state behind the mock connectors
#[derive(Clone, Default)]
pub struct MockState {
    inner: Arc<Mutex<Inner>>,
}

impl MockState {
    /// Fail the `call`-th write (1-based). Retries count as new calls.
    pub fn fail_write(&self, call: u32, failure: MockFailure) {
        self.inner.lock().write_failures.insert(call, failure);
    }

    /// Fail the next source opens, one injected failure per attempt
    pub fn fail_source_open(&self, failures: Vec<MockFailure>) {
        self.inner.lock().source_open_failures = failures;
    }

    pub fn fail_sink_open(&self, failures: Vec<MockFailure>) {
        self.inner.lock().sink_open_failures = failures;
    }

    /// Emit a transient read error after `batches` good batches
    pub fn fail_read_after(&self, batches: usize) {
        self.inner.lock().read_failure_after = Some(batches);
    }

    pub fn fail_commit(&self, failure: MockFailure) {
        self.inner.lock().commit_failure = Some(failure);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.inner.lock().write_delay = Some(delay);
    }

    /// Cancel `token` right after the `writes`-th successful write
    pub fn cancel_after_writes(&self, writes: u32, token: CancellationToken) {
        self.inner.lock().cancel_after_writes = Some((writes, token));
    }

    pub fn source_opens(&self) -> u32 {
        self.inner.lock().source_opens
    }

    pub fn source_closes(&self) -> u32 {
        self.inner.lock().source_closes
    }

    pub fn sink_opens(&self) -> u32 {
        self.inner.lock().sink_opens
    }

    pub fn sink_closes(&self) -> u32 {
        self.inner.lock().sink_closes
    }

    pub fn write_calls(&self) -> u32 {
        self.inner.lock().write_calls
    }

    pub fn commit_calls(&self) -> u32 {
        self.inner.lock().commit_calls
    }

    /// Rows visible in the mock target, in write order
    pub fn visible_records(&self) -> Vec<Map<String, Value>> {
        self.inner
            .lock()
            .visible
            .iter()
            .flat_map(Batch::to_records)
            .collect()
    }

    pub fn visible_batches(&self) -> Vec<Batch> {
        self.inner.lock().visible.clone()
    }

    pub fn staged_batches(&self) -> usize {
        self.inner.lock().staged.len()
    }
}

// ============================================================================
// Mock Source
// ============================================================================

/// Produces `{"id": n, "label": "row-n"}` rows
pub struct MockSource {
    state: MockState,
    rows: u64,
    batch_size: usize,
    projection: Projection,
    opened: bool,
}

#[async_trait]
impl Source for MockSource {
    fn kind(&self) -> &str {
        "mock"
    }

    async fn open(&mut self) -> ConnectorResult<()> {
        let mut inner = self.state.inner.lock();
        inner.source_opens += 1;
        if !inner.source_open_failures.is_empty() {
            let failure = inner.source_open_failures.remove(0);
            return Err(failure.to_error("source open"));
        }
        self.opened = true;
        Ok(())
    }

    async fn read(&mut self) -> ConnectorResult<BatchStream> {
        if !self.opened {
            return Err(ConnectorError::Internal("source not opened".to_string()));
        }
        let fail_after = self.state.inner.lock().read_failure_after;
        let records: Vec<Map<String, Value>> = (0..self.rows)
            .map(|id| match json!({"id": id, "label": format!("row-{id}")}) {
                Value::Object(map) => map,
                _ => Map::new(),
            })
            .collect();

        let mut items: Vec<ConnectorResult<Batch>> = Batch::from_records(records)
            .chunks(self.batch_size)
            .into_iter()
            .map(|batch| batch.project(&self.projection))
            .collect();
        if let Some(n) = fail_after {
            items.truncate(n);
            items.push(Err(ConnectorError::transient("injected read failure")));
        }
        Ok(stream::iter(items).boxed())
    }

    async fn close(&mut self) -> ConnectorResult<()> {
        self.state.inner.lock().source_closes += 1;
        self.opened = false;
        Ok(())
    }
}

pub struct MockSourceFactory {
    state: MockState,
}

impl MockSourceFactory {
    pub fn new(state: MockState) -> Self {
        Self { state }
    }
}

impl SourceFactory for MockSourceFactory {
    fn schema(&self) -> OptionSchema {
        OptionSchema::new("mock")
            .with_default("rows", OptionType::Integer, 0, "Number of rows to produce")
            .with_default("batchSize", OptionType::Integer, 100, "Rows per batch")
            .with_columns()
    }

    fn create(&self, options: OptionsBag) -> Result<Box<dyn Source>, OptionsError> {
        Ok(Box::new(MockSource {
            state: self.state.clone(),
            rows: options.get_i64("rows").unwrap_or(0).max(0) as u64,
            batch_size: options.get_i64("batchSize").unwrap_or(100).max(1) as usize,
            projection: options.projection()?,
            opened: false,
        }))
    }
}

// ============================================================================
// Mock Sink
// ============================================================================

/// Records written batches; in staging mode nothing is visible until commit
pub struct MockSink {
    state: MockState,
    mode: SinkMode,
}

#[async_trait]
impl Sink for MockSink {
    fn kind(&self) -> &str {
        "mock"
    }

    fn mode(&self) -> SinkMode {
        self.mode
    }

    async fn open(&mut self) -> ConnectorResult<()> {
        let mut inner = self.state.inner.lock();
        inner.sink_opens += 1;
        if !inner.sink_open_failures.is_empty() {
            let failure = inner.sink_open_failures.remove(0);
            return Err(failure.to_error("sink open"));
        }
        Ok(())
    }

    async fn write(&mut self, batch: &Batch) -> ConnectorResult<WriteAck> {
        let delay = {
            let mut inner = self.state.inner.lock();
            inner.write_calls += 1;
            inner.write_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.state.inner.lock();
        let call = inner.write_calls;
        if let Some(failure) = inner.write_failures.remove(&call) {
            return Err(failure.to_error("write"));
        }
        match self.mode {
            SinkMode::Direct => inner.visible.push(batch.clone()),
            SinkMode::Staging => inner.staged.push(batch.clone()),
        }
        let successful = (inner.visible.len() + inner.staged.len()) as u32;
        if let Some((after, token)) = &inner.cancel_after_writes {
            if successful >= *after {
                token.cancel();
            }
        }
        Ok(WriteAck::new(batch.num_rows() as u64, 0))
    }

    async fn commit(&mut self) -> ConnectorResult<CommitResult> {
        let mut inner = self.state.inner.lock();
        inner.commit_calls += 1;
        if let Some(failure) = inner.commit_failure {
            return Err(failure.to_error("commit"));
        }
        let staged = std::mem::take(&mut inner.staged);
        inner.visible.extend(staged);
        let rows = inner.visible.iter().map(|b| b.num_rows() as u64).sum();
        Ok(CommitResult {
            rows_committed: rows,
            location: Some("mock://target".to_string()),
        })
    }

    async fn close(&mut self) -> ConnectorResult<()> {
        let mut inner = self.state.inner.lock();
        inner.sink_closes += 1;
        inner.staged.clear();
        Ok(())
    }
}

pub struct MockSinkFactory {
    state: MockState,
}

impl MockSinkFactory {
    pub fn new(state: MockState) -> Self {
        Self { state }
    }
}

impl SinkFactory for MockSinkFactory {
    fn schema(&self) -> OptionSchema {
        OptionSchema::new("mock").with_default(
            "mode",
            OptionType::OneOf(&["direct", "staging"]),
            "direct",
            "Whether writes are visible before commit",
        )
    }

    fn create(&self, options: OptionsBag) -> Result<Box<dyn Sink>, OptionsError> {
        let mode = match options.get_str("mode") {
            Some("staging") => SinkMode::Staging,
            _ => SinkMode::Direct,
        };
        Ok(Box::new(MockSink {
            state: self.state.clone(),
            mode,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{RawOptions, UnknownOptionPolicy};

    fn bag(schema: OptionSchema, pairs: &[(&str, crate::options::OptionValue)]) -> OptionsBag {
        let raw: RawOptions = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        schema.parse(&raw, UnknownOptionPolicy::Reject).unwrap()
    }

    #[tokio::test]
    async fn test_mock_source_batches() {
        let state = MockState::default();
        let factory = MockSourceFactory::new(state.clone());
        let options = bag(
            factory.schema(),
            &[("rows", 250.into()), ("batchSize", 100.into())],
        );
        let mut source = factory.create(options).unwrap();
        source.open().await.unwrap();
        let batches: Vec<_> = source.read().await.unwrap().collect().await;
        let sizes: Vec<usize> = batches.iter().map(|b| b.as_ref().unwrap().num_rows()).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        source.close().await.unwrap();
        assert_eq!(state.source_opens(), 1);
        assert_eq!(state.source_closes(), 1);
    }

    #[tokio::test]
    async fn test_mock_sink_injected_write_failure() {
        let state = MockState::default();
        state.fail_write(2, MockFailure::Transient);
        let factory = MockSinkFactory::new(state.clone());
        let mut sink = factory.create(bag(factory.schema(), &[])).unwrap();
        let batch = Batch::from_records(vec![Map::new()]);

        assert!(sink.write(&batch).await.is_ok());
        let err = sink.write(&batch).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(sink.write(&batch).await.is_ok());
        assert_eq!(state.visible_batches().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_staging_sink_hides_until_commit() {
        let state = MockState::default();
        let factory = MockSinkFactory::new(state.clone());
        let mut sink = factory
            .create(bag(factory.schema(), &[("mode", "staging".into())]))
            .unwrap();
        let batch = Batch::from_records(vec![Map::new()]);
        sink.write(&batch).await.unwrap();
        assert!(state.visible_batches().is_empty());
        sink.commit().await.unwrap();
        assert_eq!(state.visible_batches().len(), 1);
    }
}

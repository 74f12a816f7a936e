//! Cancellation between batches

use datatunnel::connectors::memory::MemoryStore;
use datatunnel::connectors::staging::WarehouseSinkFactory;
use datatunnel::prelude::*;
use datatunnel::traits::testing::{MockSinkFactory, MockSourceFactory, MockState};
use datatunnel::{ExecutorConfig, JobState, RetryConfig};
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config() -> ExecutorConfig {
    ExecutorConfig {
        retry: RetryConfig::fixed_delay(1, Duration::from_millis(1)),
        channel_capacity: 1,
        ..ExecutorConfig::default()
    }
}

fn mock_executor(state: &MockState) -> TunnelExecutor {
    let mut registry = ConnectorRegistry::new();
    registry.register_source("mock", Arc::new(MockSourceFactory::new(state.clone())));
    registry.register_sink("mock", Arc::new(MockSinkFactory::new(state.clone())));
    TunnelExecutor::new(Arc::new(registry)).with_config(config())
}

#[tokio::test]
async fn direct_sink_keeps_only_whole_batches() {
    let state = MockState::default();
    let cancel = CancellationToken::new();
    state.cancel_after_writes(3, cancel.clone());

    let err = mock_executor(&state)
        .run_statement_with_cancel(
            r#"DATATUNNEL SOURCE("mock") OPTIONS(rows=1000, batchSize=100) SINK("mock") OPTIONS(mode="direct")"#,
            cancel,
        )
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(state.commit_calls(), 0);
    let batches = state.visible_batches();
    assert_eq!(batches.len(), 3);
    assert!(batches.iter().all(|b| b.num_rows() == 100));
    assert_eq!(state.sink_closes(), 1);
    assert_eq!(state.source_closes(), 1);
}

#[tokio::test]
async fn staging_sink_publishes_nothing() {
    let state = MockState::default();
    let cancel = CancellationToken::new();
    state.cancel_after_writes(2, cancel.clone());

    let err = mock_executor(&state)
        .run_statement_with_cancel(
            r#"DATATUNNEL SOURCE("mock") OPTIONS(rows=1000, batchSize=100) SINK("mock") OPTIONS(mode="staging")"#,
            cancel,
        )
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(state.commit_calls(), 0);
    assert!(state.visible_records().is_empty());
    assert_eq!(state.staged_batches(), 0);
}

/// Emits `batches` single-row batches and cancels after the `cancel_at`-th
struct CancellingSource {
    batches: usize,
    cancel_at: usize,
    token: CancellationToken,
}

#[async_trait]
impl Source for CancellingSource {
    fn kind(&self) -> &str {
        "cancelling"
    }

    async fn open(&mut self) -> ConnectorResult<()> {
        Ok(())
    }

    async fn read(&mut self) -> ConnectorResult<BatchStream> {
        let token = self.token.clone();
        let cancel_at = self.cancel_at;
        let items = (0..self.batches).map(move |i| {
            if i + 1 == cancel_at {
                token.cancel();
            }
            let mut record = Map::new();
            record.insert("n".to_string(), json!(i));
            Ok::<_, ConnectorError>(Batch::from_records(vec![record]))
        });
        Ok(stream::iter(items).boxed())
    }

    async fn close(&mut self) -> ConnectorResult<()> {
        Ok(())
    }
}

struct CancellingSourceFactory {
    token: CancellationToken,
}

impl SourceFactory for CancellingSourceFactory {
    fn schema(&self) -> OptionSchema {
        OptionSchema::new("cancelling")
            .with_default("batches", OptionType::Integer, 50, "Batches to emit")
            .with_default("cancelAt", OptionType::Integer, 5, "Batch that triggers cancellation")
    }

    fn create(&self, options: OptionsBag) -> Result<Box<dyn Source>, OptionsError> {
        Ok(Box::new(CancellingSource {
            batches: options.get_i64("batches").unwrap_or(50) as usize,
            cancel_at: options.get_i64("cancelAt").unwrap_or(5) as usize,
            token: self.token.clone(),
        }))
    }
}

#[tokio::test]
async fn warehouse_target_absent_after_cancel() {
    let tables = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();

    let mut registry = ConnectorRegistry::new();
    registry.register_source(
        "cancelling",
        Arc::new(CancellingSourceFactory {
            token: cancel.clone(),
        }),
    );
    registry.register_sink("warehouse", Arc::new(WarehouseSinkFactory::new(tables.clone())));
    let executor = TunnelExecutor::new(Arc::new(registry)).with_config(config());

    let err = executor
        .run_statement_with_cancel(
            r#"DATATUNNEL SOURCE("cancelling") OPTIONS(batches=50, cancelAt=5) SINK("warehouse") OPTIONS(target="wh")"#,
            cancel,
        )
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(!tables.contains("wh"));
}

#[tokio::test]
async fn completed_job_ignores_later_cancel() {
    let state = MockState::default();
    let cancel = CancellationToken::new();
    let report = mock_executor(&state)
        .run_statement_with_cancel(
            r#"DATATUNNEL SOURCE("mock") OPTIONS(rows=10) SINK("mock") OPTIONS()"#,
            cancel.clone(),
        )
        .await
        .unwrap();
    cancel.cancel();

    assert_eq!(report.state, JobState::Completed);
    let ids: Vec<Value> = state
        .visible_records()
        .into_iter()
        .filter_map(|r| r.get("id").cloned())
        .collect();
    assert_eq!(ids.len(), 10);
}

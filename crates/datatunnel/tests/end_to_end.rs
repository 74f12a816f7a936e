//! End-to-end statement execution over in-process connectors
//!
//! Run with: cargo test -p datatunnel --test end_to_end

use datatunnel::connectors::memory::{MemorySinkFactory, MemorySourceFactory, MemoryStore};
use datatunnel::connectors::staging::WarehouseSinkFactory;
use datatunnel::traits::testing::{MockFailure, MockSinkFactory, MockSourceFactory, MockState};
use datatunnel::{
    ConnectorRegistry, ErrorKind, ExecutionContext, ExecutorConfig, JobState, RetryConfig,
    TunnelExecutor,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    store: Arc<MemoryStore>,
    state: MockState,
    host: Arc<ExecutionContext>,
    executor: TunnelExecutor,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let state = MockState::default();
    let host = Arc::new(ExecutionContext::new());

    let mut registry = ConnectorRegistry::new();
    registry.register_source(
        "memory",
        Arc::new(MemorySourceFactory::new(store.clone()).with_context(host.clone())),
    );
    registry.register_sink("memory", Arc::new(MemorySinkFactory::new(store.clone())));
    registry.register_sink("warehouse", Arc::new(WarehouseSinkFactory::new(store.clone())));
    registry.register_source("mock", Arc::new(MockSourceFactory::new(state.clone())));
    registry.register_sink("mock", Arc::new(MockSinkFactory::new(state.clone())));

    let executor = TunnelExecutor::new(Arc::new(registry))
        .with_config(ExecutorConfig {
            retry: RetryConfig::fixed_delay(3, Duration::from_millis(1)),
            channel_capacity: 4,
            open_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            commit_timeout: Duration::from_secs(5),
        })
        .with_host(host.clone());

    Harness {
        store,
        state,
        host,
        executor,
    }
}

#[tokio::test]
async fn memory_to_memory_copies_inline_rows() {
    let h = harness();
    let report = h
        .executor
        .run_statement(
            r#"DATATUNNEL SOURCE("memory") OPTIONS(rows=[{"id": 1}]) SINK("memory") OPTIONS(target="t1")"#,
        )
        .await
        .unwrap();

    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.rows_written, 1);
    let rows = h.store.rows("t1").unwrap();
    assert_eq!(Value::Object(rows[0].clone()), json!({"id": 1}));
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn chained_statements_through_memory_tables() {
    let h = harness();
    h.executor
        .run_statement(
            r#"DATATUNNEL SOURCE("memory") OPTIONS(rows=[{"id": 1, "name": "a"}, {"id": 2, "name": "b"}])
               SINK("memory") OPTIONS(target="stage")"#,
        )
        .await
        .unwrap();
    h.executor
        .run_statement(
            r#"DATATUNNEL SOURCE("memory") OPTIONS(table="stage", columns=["name"])
               SINK("memory") OPTIONS(target="names", saveMode="overwrite")"#,
        )
        .await
        .unwrap();

    let names: Vec<Value> = h
        .store
        .rows("names")
        .unwrap()
        .into_iter()
        .map(Value::Object)
        .collect();
    assert_eq!(names, vec![json!({"name": "a"}), json!({"name": "b"})]);
}

#[tokio::test]
async fn unknown_sink_kind_opens_nothing() {
    let h = harness();
    let err = h
        .executor
        .run_statement(r#"DATATUNNEL SOURCE("mock") OPTIONS(rows=5) SINK("bogus") OPTIONS()"#)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UnknownConnectorKind);
    assert!(err.to_string().contains("bogus"));
    assert_eq!(h.state.source_opens(), 0);
    assert_eq!(h.state.sink_opens(), 0);
}

#[tokio::test]
async fn transient_write_failure_delivers_every_row_once() {
    let h = harness();
    h.state.fail_write(5, MockFailure::Transient);

    let report = h
        .executor
        .run_statement(
            r#"DATATUNNEL SOURCE("mock") OPTIONS(rows=10000, batchSize=100) SINK("mock") OPTIONS()"#,
        )
        .await
        .unwrap();

    assert_eq!(report.rows_read, 10_000);
    assert_eq!(report.rows_written, 10_000);
    assert_eq!(report.batches, 100);
    assert_eq!(report.retries, 1);
    assert_eq!(h.state.write_calls(), 101);

    let records = h.state.visible_records();
    assert_eq!(records.len(), 10_000);
    let ids: HashSet<u64> = records
        .iter()
        .filter_map(|r| r.get("id").and_then(Value::as_u64))
        .collect();
    assert_eq!(ids.len(), 10_000);
    assert_eq!(ids.iter().max(), Some(&9_999));
}

#[tokio::test]
async fn result_table_visible_in_execution_context() {
    let h = harness();
    h.executor
        .run_statement(
            r#"DATATUNNEL SOURCE("memory") OPTIONS(rows=[{"id": 1}, {"id": 2}], resultTableName="t0")
               SINK("memory") OPTIONS(target="t1")"#,
        )
        .await
        .unwrap();

    let table = h.host.result_table("t0").unwrap();
    assert_eq!(table.source_kind, "memory");
    assert_eq!(table.rows, 2);
    assert_eq!(table.location.as_deref(), Some("memory://t1"));
    assert!(!table.source_options.contains_key("resultTableName"));
    assert_eq!(h.host.table_names(), vec!["t0".to_string()]);
}

#[tokio::test]
async fn later_statement_reads_result_table_by_name() {
    let h = harness();
    h.executor
        .run_statement(
            r#"DATATUNNEL SOURCE("mock") OPTIONS(rows=30, batchSize=10, resultTableName="orders")
               SINK("warehouse") OPTIONS(target="orders_wh")"#,
        )
        .await
        .unwrap();

    let report = h
        .executor
        .run_statement(
            r#"DATATUNNEL SOURCE("memory") OPTIONS(table="orders", columns=["id"])
               SINK("memory") OPTIONS(target="order_ids")"#,
        )
        .await
        .unwrap();

    assert_eq!(report.rows_written, 30);
    let ids: HashSet<u64> = h
        .store
        .rows("order_ids")
        .unwrap()
        .iter()
        .filter_map(|r| r.get("id").and_then(Value::as_u64))
        .collect();
    assert_eq!(ids.len(), 30);
    assert!(!h.store.contains("orders"));
}

#[tokio::test]
async fn warehouse_sink_publishes_on_commit() {
    let h = harness();
    let report = h
        .executor
        .run_statement(
            r#"DATATUNNEL SOURCE("mock") OPTIONS(rows=250, batchSize=100)
               SINK("warehouse") OPTIONS(target="wh", columns=["id"])"#,
        )
        .await
        .unwrap();

    assert_eq!(report.commit.rows_committed, 250);
    assert_eq!(report.commit.location.as_deref(), Some("memory://wh"));
    let rows = h.store.rows("wh").unwrap();
    assert_eq!(rows.len(), 250);
    assert!(rows.iter().all(|r| r.len() == 1 && r.contains_key("id")));
}

#[tokio::test]
async fn invalid_options_report_the_key() {
    let h = harness();
    let err = h
        .executor
        .run_statement(
            r#"DATATUNNEL SOURCE("memory") OPTIONS(rows=[{"id": 1}]) SINK("memory") OPTIONS(target="t", mode="fast")"#,
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Options);
    assert!(err.to_string().contains("mode"));
    assert!(!h.store.contains("t"));
}

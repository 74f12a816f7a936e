//! File sink output read back through the file source

use datatunnel::connectors::file::{read_records, FileSinkFactory, FileSourceFactory};
use datatunnel::connectors::memory::{MemorySinkFactory, MemorySourceFactory, MemoryStore};
use datatunnel::{ConnectorRegistry, ErrorKind, TunnelExecutor};
use serde_json::{json, Value};
use std::sync::Arc;

fn executor(store: &Arc<MemoryStore>) -> TunnelExecutor {
    let mut registry = ConnectorRegistry::new();
    registry.register_source("memory", Arc::new(MemorySourceFactory::new(store.clone())));
    registry.register_sink("memory", Arc::new(MemorySinkFactory::new(store.clone())));
    registry.register_source("file", Arc::new(FileSourceFactory));
    registry.register_sink("file", Arc::new(FileSinkFactory));
    TunnelExecutor::new(Arc::new(registry))
}

fn seed(store: &MemoryStore, table: &str, rows: usize) {
    let records = (0..rows)
        .filter_map(|i| match json!({"id": i, "city": format!("city-{}", i % 7)}) {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect();
    store.append(table, records);
}

#[tokio::test]
async fn json_parts_read_back_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let store = Arc::new(MemoryStore::new());
    seed(&store, "cities", 45);
    let executor = executor(&store);

    let report = executor
        .run_statement(&format!(
            r#"DATATUNNEL SOURCE("memory") OPTIONS(table="cities", batchSize=10)
               SINK("file") OPTIONS(path="{}")"#,
            out.display()
        ))
        .await
        .unwrap();
    assert_eq!(report.batches, 5);
    assert!(out.join("_SUCCESS").exists());

    let mut parts: Vec<_> = std::fs::read_dir(&out)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
        .collect();
    parts.sort();
    assert_eq!(parts.len(), 5);
    let first = read_records(&parts[0]).unwrap();
    assert_eq!(first.len(), 10);
    assert_eq!(Value::Object(first[0].clone()), json!({"id": 0, "city": "city-0"}));

    executor
        .run_statement(&format!(
            r#"DATATUNNEL SOURCE("file") OPTIONS(path="{}", columns=["id"])
               SINK("memory") OPTIONS(target="ids")"#,
            out.display()
        ))
        .await
        .unwrap();

    let ids: Vec<Value> = store
        .rows("ids")
        .unwrap()
        .into_iter()
        .map(|r| r["id"].clone())
        .collect();
    assert_eq!(ids, (0..45).map(|i| json!(i)).collect::<Vec<_>>());
}

#[tokio::test]
async fn error_if_exists_refuses_populated_directory() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    seed(&store, "src", 3);
    let executor = executor(&store);
    let statement = format!(
        r#"DATATUNNEL SOURCE("memory") OPTIONS(table="src") SINK("file") OPTIONS(path="{}", saveMode="errorIfExists")"#,
        dir.path().display()
    );

    executor.run_statement(&statement).await.unwrap();
    let err = executor.run_statement(&statement).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}

#[tokio::test]
async fn overwrite_replaces_previous_parts() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    seed(&store, "src", 12);
    let executor = executor(&store);
    let statement = format!(
        r#"DATATUNNEL SOURCE("memory") OPTIONS(table="src", batchSize=4) SINK("file") OPTIONS(path="{}", saveMode="overwrite")"#,
        dir.path().display()
    );

    executor.run_statement(&statement).await.unwrap();
    executor.run_statement(&statement).await.unwrap();

    let parts = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("part-"))
        .count();
    assert_eq!(parts, 3);
}

//! Two-phase commit behavior of staging sinks

use datatunnel::connectors::memory::MemoryStore;
use datatunnel::connectors::staging::{
    read_staged_records, BulkLoader, StagingLocation, StagingManifest, StagingSink,
};
use datatunnel::prelude::*;
use datatunnel::traits::testing::{MockSourceFactory, MockState};
use datatunnel::{ExecutorConfig, RetryConfig};
use futures::TryStreamExt;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Loader that reads every part, then fails or appends to `target`
struct FlakyLoader {
    tables: Arc<MemoryStore>,
    target: String,
    fail: bool,
    loads: Arc<AtomicU32>,
}

#[async_trait]
impl BulkLoader for FlakyLoader {
    fn kind(&self) -> &str {
        "flaky"
    }

    async fn load(
        &mut self,
        store: &Arc<dyn ObjectStore>,
        _location: &StagingLocation,
        manifest: &StagingManifest,
    ) -> ConnectorResult<u64> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let records = read_staged_records(store, manifest).await?;
        if self.fail {
            return Err(ConnectorError::transient("load rejected by target"));
        }
        let rows = records.len() as u64;
        self.tables.append(&self.target, records);
        Ok(rows)
    }
}

struct FlakySinkFactory {
    tables: Arc<MemoryStore>,
    staging: Arc<dyn ObjectStore>,
    loads: Arc<AtomicU32>,
}

impl SinkFactory for FlakySinkFactory {
    fn schema(&self) -> OptionSchema {
        OptionSchema::new("flaky")
            .required("target", OptionType::String, "Table published on commit")
            .with_default("fail", OptionType::Boolean, false, "Reject the load")
    }

    fn create(&self, options: OptionsBag) -> Result<Box<dyn Sink>, OptionsError> {
        let loader = FlakyLoader {
            tables: self.tables.clone(),
            target: options.get_str("target").unwrap_or_default().to_string(),
            fail: options.get_bool("fail").unwrap_or(false),
            loads: self.loads.clone(),
        };
        let location = StagingLocation::Memory {
            prefix: "stage".to_string(),
        };
        Ok(Box::new(
            StagingSink::new(loader, location, Projection::All).with_store(self.staging.clone()),
        ))
    }
}

struct Fixture {
    tables: Arc<MemoryStore>,
    staging: Arc<dyn ObjectStore>,
    loads: Arc<AtomicU32>,
    executor: TunnelExecutor,
}

fn fixture() -> Fixture {
    let tables = Arc::new(MemoryStore::new());
    let staging: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let loads = Arc::new(AtomicU32::new(0));

    let mut registry = ConnectorRegistry::new();
    registry.register_source(
        "mock",
        Arc::new(MockSourceFactory::new(MockState::default())),
    );
    registry.register_sink(
        "flaky",
        Arc::new(FlakySinkFactory {
            tables: tables.clone(),
            staging: staging.clone(),
            loads: loads.clone(),
        }),
    );

    let executor = TunnelExecutor::new(Arc::new(registry)).with_config(ExecutorConfig {
        retry: RetryConfig::fixed_delay(2, Duration::from_millis(1)),
        ..ExecutorConfig::default()
    });

    Fixture {
        tables,
        staging,
        loads,
        executor,
    }
}

async fn staged_objects(store: &Arc<dyn ObjectStore>) -> usize {
    let listed: Vec<_> = store.list(None).try_collect().await.unwrap();
    listed.len()
}

#[tokio::test]
async fn failed_commit_leaves_target_unchanged() {
    let f = fixture();
    f.tables.append("orders", Vec::new());

    let err = f
        .executor
        .run_statement(
            r#"DATATUNNEL SOURCE("mock") OPTIONS(rows=30, batchSize=10) SINK("flaky") OPTIONS(target="orders", fail=true)"#,
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), datatunnel::ErrorKind::SinkCommit);
    // commit runs once even for a retryable error
    assert_eq!(f.loads.load(Ordering::SeqCst), 1);
    assert!(f.tables.contains("orders"));
    assert_eq!(f.tables.row_count("orders"), 0);
    assert_eq!(staged_objects(&f.staging).await, 0);
}

#[tokio::test]
async fn successful_commit_publishes_all_parts() {
    let f = fixture();
    let report = f
        .executor
        .run_statement(
            r#"DATATUNNEL SOURCE("mock") OPTIONS(rows=30, batchSize=10) SINK("flaky") OPTIONS(target="orders")"#,
        )
        .await
        .unwrap();

    assert_eq!(report.commit.rows_committed, 30);
    assert_eq!(report.batches, 3);
    assert_eq!(f.tables.row_count("orders"), 30);
    assert_eq!(staged_objects(&f.staging).await, 0);
}

#[tokio::test]
async fn empty_source_commits_nothing() {
    let f = fixture();
    let report = f
        .executor
        .run_statement(r#"DATATUNNEL SOURCE("mock") OPTIONS(rows=0) SINK("flaky") OPTIONS(target="empty")"#)
        .await
        .unwrap();

    assert_eq!(report.rows_written, 0);
    assert_eq!(report.commit.rows_committed, 0);
    assert_eq!(f.loads.load(Ordering::SeqCst), 1);
    assert_eq!(f.tables.row_count("empty"), 0);
}

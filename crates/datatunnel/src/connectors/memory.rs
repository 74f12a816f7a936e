//! In-process memory connectors
//!
//! The `memory` source emits inline `rows` or the contents of a table in a
//! [`MemoryStore`]; the `memory` sink appends batches to a store table. Tables
//! are plain JSON records, which makes them convenient for tests and for
//! chaining statements inside one process.
//!
//! With an [`ExecutionContext`] attached, the source's `table` option also
//! accepts a published `resultTableName` whose data landed in the store.

use super::SaveMode;
use crate::error::{ConnectorError, ConnectorResult, OptionsError};
use crate::host::ExecutionContext;
use crate::options::{OptionSchema, OptionType, OptionsBag, Projection};
use crate::traits::{
    Batch, BatchStream, CommitResult, Sink, SinkFactory, SinkMode, Source, SourceFactory, WriteAck,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};
use validator::Validate;

pub type Record = Map<String, Value>;

/// Location prefix reported by sinks that write into a [`MemoryStore`]
pub const MEMORY_SCHEME: &str = "memory://";

/// Named tables of JSON records shared by memory connectors
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Vec<Record>>>,
}

static GLOBAL_STORE: OnceLock<Arc<MemoryStore>> = OnceLock::new();

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store used by the built-in registry
    pub fn global() -> Arc<MemoryStore> {
        GLOBAL_STORE
            .get_or_init(|| Arc::new(MemoryStore::new()))
            .clone()
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.read().contains_key(table)
    }

    /// Snapshot of a table's rows
    pub fn rows(&self, table: &str) -> Option<Vec<Record>> {
        self.tables.read().get(table).cloned()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map(Vec::len).unwrap_or(0)
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Append all rows under one lock, creating the table if needed
    pub fn append(&self, table: &str, rows: Vec<Record>) {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    /// Replace a table's contents under one lock
    pub fn replace(&self, table: &str, rows: Vec<Record>) {
        self.tables.write().insert(table.to_string(), rows);
    }

    pub fn ensure_table(&self, table: &str) {
        self.tables.write().entry(table.to_string()).or_default();
    }

    pub fn drop_table(&self, table: &str) -> bool {
        self.tables.write().remove(table).is_some()
    }
}

// ============================================================================
// Memory Source
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MemorySourceConfig {
    #[serde(default)]
    pub rows: Option<Vec<Record>>,

    #[serde(default)]
    pub table: Option<String>,

    #[validate(range(min = 1, max = 1_000_000))]
    pub batch_size: usize,
}

pub struct MemorySource {
    store: Arc<MemoryStore>,
    context: Option<Arc<ExecutionContext>>,
    config: MemorySourceConfig,
    projection: Projection,
    snapshot: Option<Vec<Record>>,
}

impl MemorySource {
    /// Rows of a store table, or of the store table a result table was written to
    fn table_rows(&self, table: &str) -> ConnectorResult<Vec<Record>> {
        if let Some(rows) = self.store.rows(table) {
            return Ok(rows);
        }
        let Some(result) = self.context.as_ref().and_then(|ctx| ctx.result_table(table)) else {
            return Err(ConnectorError::NotFound(format!("memory table '{table}'")));
        };
        let location = result.location.as_deref().unwrap_or_default();
        let target = location.strip_prefix(MEMORY_SCHEME).ok_or_else(|| {
            ConnectorError::NotFound(format!(
                "result table '{table}' is stored at '{location}', not in memory"
            ))
        })?;
        debug!(table = %table, target = %target, "Resolved result table");
        self.store.rows(target).ok_or_else(|| {
            ConnectorError::NotFound(format!("memory table '{target}' behind result table '{table}'"))
        })
    }
}

#[async_trait]
impl Source for MemorySource {
    fn kind(&self) -> &str {
        "memory"
    }

    async fn open(&mut self) -> ConnectorResult<()> {
        let rows = match (&self.config.rows, &self.config.table) {
            (Some(rows), _) => rows.clone(),
            (None, Some(table)) => self.table_rows(table)?,
            (None, None) => Vec::new(),
        };
        debug!(rows = rows.len(), "Opened memory source");
        self.snapshot = Some(rows);
        Ok(())
    }

    async fn read(&mut self) -> ConnectorResult<BatchStream> {
        let rows = self
            .snapshot
            .take()
            .ok_or_else(|| ConnectorError::Internal("memory source read before open".into()))?;
        let batch = Batch::from_records(rows).project(&self.projection)?;
        let batches = batch.chunks(self.config.batch_size);
        Ok(stream::iter(batches.into_iter().map(Ok)).boxed())
    }

    async fn close(&mut self) -> ConnectorResult<()> {
        self.snapshot = None;
        Ok(())
    }
}

pub struct MemorySourceFactory {
    store: Arc<MemoryStore>,
    context: Option<Arc<ExecutionContext>>,
}

impl MemorySourceFactory {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            context: None,
        }
    }

    /// Resolve `table` against result tables published in `context`
    pub fn with_context(mut self, context: Arc<ExecutionContext>) -> Self {
        self.context = Some(context);
        self
    }
}

impl SourceFactory for MemorySourceFactory {
    fn schema(&self) -> OptionSchema {
        OptionSchema::new("memory")
            .optional("rows", OptionType::Records, "Inline rows as JSON objects")
            .optional("table", OptionType::String, "Memory table to read instead of inline rows")
            .with_default("batchSize", OptionType::Integer, 100, "Rows per batch")
            .with_columns()
    }

    fn create(&self, options: OptionsBag) -> Result<Box<dyn Source>, OptionsError> {
        let config: MemorySourceConfig = options.deserialize()?;
        if config.rows.is_some() == config.table.is_some() {
            return Err(OptionsError::InvalidValue {
                kind: options.kind().to_string(),
                key: "rows".to_string(),
                message: "exactly one of 'rows' or 'table' must be set".to_string(),
            });
        }
        Ok(Box::new(MemorySource {
            store: self.store.clone(),
            context: self.context.clone(),
            projection: options.projection()?,
            config,
            snapshot: None,
        }))
    }
}

// ============================================================================
// Memory Sink
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MemorySinkConfig {
    #[validate(length(min = 1))]
    pub target: String,

    pub save_mode: SaveMode,
}

pub struct MemorySink {
    store: Arc<MemoryStore>,
    config: MemorySinkConfig,
    projection: Projection,
    discard: bool,
    rows: u64,
}

#[async_trait]
impl Sink for MemorySink {
    fn kind(&self) -> &str {
        "memory"
    }

    fn mode(&self) -> SinkMode {
        SinkMode::Direct
    }

    async fn open(&mut self) -> ConnectorResult<()> {
        let target = &self.config.target;
        let exists = self.store.contains(target);
        match self.config.save_mode {
            SaveMode::Append => {}
            SaveMode::Overwrite => self.store.replace(target, Vec::new()),
            SaveMode::ErrorIfExists if exists => {
                return Err(ConnectorError::fatal(format!(
                    "memory table '{target}' already exists"
                )))
            }
            SaveMode::ErrorIfExists => {}
            SaveMode::Ignore if exists => {
                info!(target = %target, "Memory table exists, ignoring written rows");
                self.discard = true;
            }
            SaveMode::Ignore => {}
        }
        Ok(())
    }

    async fn write(&mut self, batch: &Batch) -> ConnectorResult<WriteAck> {
        if self.discard {
            return Ok(WriteAck::default());
        }
        let records = batch.project(&self.projection)?.to_records();
        let rows = records.len() as u64;
        self.store.append(&self.config.target, records);
        self.rows += rows;
        Ok(WriteAck::new(rows, 0))
    }

    async fn commit(&mut self) -> ConnectorResult<CommitResult> {
        if !self.discard {
            self.store.ensure_table(&self.config.target);
        }
        Ok(CommitResult {
            rows_committed: self.rows,
            location: Some(format!("{MEMORY_SCHEME}{}", self.config.target)),
        })
    }

    async fn close(&mut self) -> ConnectorResult<()> {
        Ok(())
    }
}

pub struct MemorySinkFactory {
    store: Arc<MemoryStore>,
}

impl MemorySinkFactory {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

impl SinkFactory for MemorySinkFactory {
    fn schema(&self) -> OptionSchema {
        OptionSchema::new("memory")
            .required("target", OptionType::String, "Memory table to write")
            .with_default(
                "saveMode",
                OptionType::OneOf(SaveMode::CHOICES),
                "append",
                "What to do when the target already exists",
            )
            .with_columns()
    }

    fn create(&self, options: OptionsBag) -> Result<Box<dyn Sink>, OptionsError> {
        let config: MemorySinkConfig = options.deserialize()?;
        Ok(Box::new(MemorySink {
            store: self.store.clone(),
            projection: options.projection()?,
            config,
            discard: false,
            rows: 0,
        }))
    }
}

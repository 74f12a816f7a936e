//! Host environment binding for `resultTableName`
//!
//! A completed job publishes a descriptor of its source output under the
//! statement's `resultTableName`, so later statements in the same execution
//! context can refer to it by name.

use crate::options::RawOptions;
use crate::traits::Schema;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Descriptor of a completed transfer's source dataset
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultTable {
    pub name: String,
    pub source_kind: String,
    /// Source options with sensitive values redacted
    pub source_options: RawOptions,
    pub schema: Option<Arc<Schema>>,
    pub rows: u64,
    /// Where the sink put the data, when it reports one
    pub location: Option<String>,
    pub registered_at: DateTime<Utc>,
}

/// Receives result tables of completed jobs
pub trait HostEnvironment: Send + Sync {
    fn register_result_table(&self, table: ResultTable);
}

/// In-process execution context. Re-registering a name replaces the entry.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    tables: RwLock<HashMap<String, ResultTable>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn result_table(&self, name: &str) -> Option<ResultTable> {
        self.tables.read().get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl HostEnvironment for ExecutionContext {
    fn register_result_table(&self, table: ResultTable) {
        info!(
            name = %table.name,
            source = %table.source_kind,
            rows = table.rows,
            "Registered result table"
        );
        self.tables.write().insert(table.name.clone(), table);
    }
}

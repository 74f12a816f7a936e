//! Log sink connector
//!
//! Renders the first rows of the transfer as a text table and emits it through
//! `tracing` at INFO level. Every batch is acknowledged; rows beyond `numRows`
//! are counted but not printed.

use crate::error::{ConnectorResult, OptionsError};
use crate::options::{OptionSchema, OptionType, OptionsBag, Projection};
use crate::traits::{Batch, CommitResult, Sink, SinkFactory, SinkMode, WriteAck};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::fmt::Write as _;
use tracing::info;
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LogSinkConfig {
    /// Rows to print over the whole job
    pub num_rows: u64,

    /// Maximum cell width; 0 disables truncation
    pub truncate: usize,

    /// One `column | value` block per row instead of a table
    pub vertical: bool,
}

pub struct LogSink {
    config: LogSinkConfig,
    projection: Projection,
    printed: u64,
    rows: u64,
}

#[async_trait]
impl Sink for LogSink {
    fn kind(&self) -> &str {
        "log"
    }

    fn mode(&self) -> SinkMode {
        SinkMode::Direct
    }

    async fn open(&mut self) -> ConnectorResult<()> {
        Ok(())
    }

    async fn write(&mut self, batch: &Batch) -> ConnectorResult<WriteAck> {
        let batch = batch.project(&self.projection)?;
        let rows = batch.num_rows() as u64;
        let budget = self.config.num_rows.saturating_sub(self.printed);
        if budget > 0 && rows > 0 {
            let shown = budget.min(rows) as usize;
            let text = if self.config.vertical {
                render_vertical(&batch, shown, self.config.truncate, self.printed)
            } else {
                render_table(&batch, shown, self.config.truncate)
            };
            info!("\n{}", text);
            self.printed += shown as u64;
        }
        self.rows += rows;
        Ok(WriteAck::new(rows, 0))
    }

    async fn commit(&mut self) -> ConnectorResult<CommitResult> {
        if self.rows > self.printed {
            info!("only showing top {} of {} rows", self.printed, self.rows);
        }
        Ok(CommitResult {
            rows_committed: self.rows,
            location: None,
        })
    }

    async fn close(&mut self) -> ConnectorResult<()> {
        Ok(())
    }
}

fn cell(value: &Value, truncate: usize) -> String {
    let text = match value {
        Value::Null => "null".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if truncate == 0 || text.chars().count() <= truncate {
        return text;
    }
    if truncate < 4 {
        return text.chars().take(truncate).collect();
    }
    let mut short: String = text.chars().take(truncate - 3).collect();
    short.push_str("...");
    short
}

/// Bordered table of the first `limit` rows, right-aligned like a SQL shell
pub fn render_table(batch: &Batch, limit: usize, truncate: usize) -> String {
    let header: Vec<String> = batch.schema().field_names().map(str::to_string).collect();
    let cells: Vec<Vec<String>> = batch
        .rows()
        .iter()
        .take(limit)
        .map(|row| row.iter().map(|v| cell(v, truncate)).collect())
        .collect();

    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count().max(3)).collect();
    for row in &cells {
        for (i, c) in row.iter().enumerate() {
            widths[i] = widths[i].max(c.chars().count());
        }
    }

    let separator: String = widths.iter().fold(String::from("+"), |mut acc, w| {
        acc.push_str(&"-".repeat(*w));
        acc.push('+');
        acc
    });

    let mut out = String::new();
    let line = |out: &mut String, values: &[String]| {
        out.push('|');
        for (value, &width) in values.iter().zip(&widths) {
            let _ = write!(out, "{value:>width$}|");
        }
        out.push('\n');
    };

    out.push_str(&separator);
    out.push('\n');
    line(&mut out, &header);
    out.push_str(&separator);
    out.push('\n');
    for row in &cells {
        line(&mut out, row);
    }
    out.push_str(&separator);
    out
}

/// Record-per-block rendering; `offset` numbers rows across batches
pub fn render_vertical(batch: &Batch, limit: usize, truncate: usize, offset: u64) -> String {
    let names: Vec<&str> = batch.schema().field_names().collect();
    let name_width = names.iter().map(|n| n.chars().count()).max().unwrap_or(0);
    let mut out = String::new();
    for (i, row) in batch.rows().iter().take(limit).enumerate() {
        let _ = writeln!(out, "-RECORD {}-", offset + i as u64);
        for (name, value) in names.iter().zip(row) {
            let _ = writeln!(out, " {name:<name_width$} | {}", cell(value, truncate));
        }
    }
    out
}

pub struct LogSinkFactory;

impl SinkFactory for LogSinkFactory {
    fn schema(&self) -> OptionSchema {
        OptionSchema::new("log")
            .with_default("numRows", OptionType::Integer, 10, "Rows to print")
            .with_default(
                "truncate",
                OptionType::Integer,
                20,
                "Maximum cell width, 0 for no truncation",
            )
            .with_default("vertical", OptionType::Boolean, false, "Print rows vertically")
            .with_columns()
    }

    fn create(&self, options: OptionsBag) -> Result<Box<dyn Sink>, OptionsError> {
        let config: LogSinkConfig = options.deserialize()?;
        Ok(Box::new(LogSink {
            config,
            projection: options.projection()?,
            printed: 0,
            rows: 0,
        }))
    }
}

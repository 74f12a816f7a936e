//! Local file connectors
//!
//! The `file` source reads newline-delimited JSON from a single file or from
//! every `*.json`/`*.jsonl` file of a directory. The `file` sink writes one
//! part object per batch into a directory, as JSON lines or CSV, and drops a
//! `_SUCCESS` marker on commit.
//!
//! ```text
//! DATATUNNEL SOURCE("datagen") OPTIONS(rowCount=100)
//! SINK("file") OPTIONS(path="/tmp/out", format="csv", saveMode="overwrite")
//! ```

use super::SaveMode;
use crate::error::{ConnectorError, ConnectorResult, OptionsError};
use crate::options::{OptionSchema, OptionType, OptionsBag, Projection};
use crate::traits::{
    Batch, BatchStream, CommitResult, Sink, SinkFactory, SinkMode, Source, SourceFactory, WriteAck,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;
use validator::Validate;

const SUCCESS_MARKER: &str = "_SUCCESS";

// ============================================================================
// Output Format
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// CSV with a header row
    Csv,
}

impl FileFormat {
    const CHOICES: &'static [&'static str] = &["json", "csv"];

    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Json => "jsonl",
            FileFormat::Csv => "csv",
        }
    }

    pub fn encode(&self, batch: &Batch) -> ConnectorResult<Vec<u8>> {
        match self {
            FileFormat::Json => batch.to_json_lines(),
            FileFormat::Csv => Ok(to_csv(batch).into_bytes()),
        }
    }
}

/// Escape a field for CSV output (RFC 4180)
fn escape_csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn csv_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => escape_csv_field(s),
        other => escape_csv_field(&other.to_string()),
    }
}

pub fn to_csv(batch: &Batch) -> String {
    let mut out = batch
        .schema()
        .field_names()
        .map(escape_csv_field)
        .collect::<Vec<_>>()
        .join(",");
    out.push('\n');
    for row in batch.rows() {
        out.push_str(&row.iter().map(csv_value).collect::<Vec<_>>().join(","));
        out.push('\n');
    }
    out
}

// ============================================================================
// File Source
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FileSourceConfig {
    #[validate(length(min = 1))]
    pub path: String,

    #[validate(range(min = 1, max = 1_000_000))]
    pub batch_size: usize,
}

pub struct FileSource {
    config: FileSourceConfig,
    projection: Projection,
    files: Vec<PathBuf>,
}

fn is_data_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('_') || n.starts_with('.'))
        .unwrap_or(true);
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    !hidden && (ext == "json" || ext == "jsonl")
}

async fn list_input_files(root: &Path) -> ConnectorResult<Vec<PathBuf>> {
    let metadata = tokio::fs::metadata(root)
        .await
        .map_err(|_| ConnectorError::NotFound(format!("input path '{}'", root.display())))?;
    if metadata.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && is_data_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

async fn read_json_lines(
    path: PathBuf,
    batch_size: usize,
    projection: Projection,
) -> ConnectorResult<Vec<Batch>> {
    let text = tokio::fs::read_to_string(&path).await?;
    let mut records = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => records.push(map),
            Ok(other) => {
                return Err(ConnectorError::Serialization(format!(
                    "{}:{}: expected a JSON object, found {}",
                    path.display(),
                    idx + 1,
                    other
                )))
            }
            Err(e) => {
                return Err(ConnectorError::Serialization(format!(
                    "{}:{}: {}",
                    path.display(),
                    idx + 1,
                    e
                )))
            }
        }
    }
    debug!(file = %path.display(), rows = records.len(), "Read input file");
    Ok(Batch::from_records(records)
        .project(&projection)?
        .chunks(batch_size))
}

#[async_trait]
impl Source for FileSource {
    fn kind(&self) -> &str {
        "file"
    }

    async fn open(&mut self) -> ConnectorResult<()> {
        self.files = list_input_files(Path::new(&self.config.path)).await?;
        info!(path = %self.config.path, files = self.files.len(), "Opened file source");
        Ok(())
    }

    async fn read(&mut self) -> ConnectorResult<BatchStream> {
        let files = std::mem::take(&mut self.files);
        let batch_size = self.config.batch_size;
        let projection = self.projection.clone();
        let batches = stream::iter(files)
            .then(move |path| read_json_lines(path, batch_size, projection.clone()))
            .flat_map(|result| match result {
                Ok(batches) => stream::iter(batches.into_iter().map(Ok)).left_stream(),
                Err(e) => stream::iter(std::iter::once(Err(e))).right_stream(),
            });
        Ok(batches.boxed())
    }

    async fn close(&mut self) -> ConnectorResult<()> {
        self.files.clear();
        Ok(())
    }
}

pub struct FileSourceFactory;

impl SourceFactory for FileSourceFactory {
    fn schema(&self) -> OptionSchema {
        OptionSchema::new("file")
            .required("path", OptionType::String, "JSON lines file or directory to read")
            .with_default("batchSize", OptionType::Integer, 1000, "Rows per batch")
            .with_columns()
    }

    fn create(&self, options: OptionsBag) -> Result<Box<dyn Source>, OptionsError> {
        let config: FileSourceConfig = options.deserialize()?;
        Ok(Box::new(FileSource {
            projection: options.projection()?,
            config,
            files: Vec::new(),
        }))
    }
}

// ============================================================================
// File Sink
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FileSinkConfig {
    #[validate(length(min = 1))]
    pub path: String,

    pub format: FileFormat,

    pub save_mode: SaveMode,
}

pub struct FileSink {
    config: FileSinkConfig,
    projection: Projection,
    store: Option<Arc<dyn ObjectStore>>,
    run_id: String,
    parts: u64,
    rows: u64,
    discard: bool,
}

impl FileSink {
    fn store(&self) -> ConnectorResult<&Arc<dyn ObjectStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| ConnectorError::Internal("file sink used before open".into()))
    }
}

async fn existing_parts(store: &dyn ObjectStore) -> ConnectorResult<Vec<ObjectPath>> {
    let objects: Vec<_> = store.list(None).try_collect().await?;
    Ok(objects
        .into_iter()
        .map(|meta| meta.location)
        .filter(|location| {
            location
                .filename()
                .map(|name| name.starts_with("part-") || name == SUCCESS_MARKER)
                .unwrap_or(false)
        })
        .collect())
}

#[async_trait]
impl Sink for FileSink {
    fn kind(&self) -> &str {
        "file"
    }

    fn mode(&self) -> SinkMode {
        SinkMode::Direct
    }

    async fn open(&mut self) -> ConnectorResult<()> {
        let root = Path::new(&self.config.path);
        tokio::fs::create_dir_all(root).await.map_err(|e| {
            ConnectorError::Config(format!("failed to create output directory: {}", e))
        })?;
        let store = LocalFileSystem::new_with_prefix(root).map_err(|e| {
            ConnectorError::Config(format!("failed to open local filesystem store: {}", e))
        })?;

        let existing = existing_parts(&store).await?;
        match self.config.save_mode {
            SaveMode::Append => {}
            SaveMode::Overwrite => {
                for location in &existing {
                    store.delete(location).await?;
                }
                debug!(removed = existing.len(), "Cleared output directory");
            }
            SaveMode::ErrorIfExists if !existing.is_empty() => {
                return Err(ConnectorError::fatal(format!(
                    "output path '{}' already contains data",
                    self.config.path
                )))
            }
            SaveMode::ErrorIfExists => {}
            SaveMode::Ignore => self.discard = !existing.is_empty(),
        }

        self.store = Some(Arc::new(store));
        Ok(())
    }

    async fn write(&mut self, batch: &Batch) -> ConnectorResult<WriteAck> {
        if self.discard || batch.is_empty() {
            return Ok(WriteAck::default());
        }
        let batch = batch.project(&self.projection)?;
        let data = self.config.format.encode(&batch)?;
        let bytes = data.len() as u64;
        let key = format!(
            "part-{:05}-{}.{}",
            self.parts,
            self.run_id,
            self.config.format.extension()
        );

        // LocalFileSystem writes to a temporary file and renames, so a part is
        // either fully present or absent
        self.store()?
            .put(&ObjectPath::from(key.as_str()), PutPayload::from(data))
            .await
            .map_err(|e| ConnectorError::Connection(format!("write of {} failed: {}", key, e)))?;

        self.parts += 1;
        self.rows += batch.num_rows() as u64;
        debug!(part = %key, rows = batch.num_rows(), "Wrote part file");
        Ok(WriteAck::new(batch.num_rows() as u64, bytes))
    }

    async fn commit(&mut self) -> ConnectorResult<CommitResult> {
        if !self.discard {
            self.store()?
                .put(&ObjectPath::from(SUCCESS_MARKER), PutPayload::from(Vec::<u8>::new()))
                .await?;
        }
        Ok(CommitResult {
            rows_committed: self.rows,
            location: Some(format!("file://{}", self.config.path)),
        })
    }

    async fn close(&mut self) -> ConnectorResult<()> {
        self.store = None;
        Ok(())
    }
}

pub struct FileSinkFactory;

impl SinkFactory for FileSinkFactory {
    fn schema(&self) -> OptionSchema {
        OptionSchema::new("file")
            .required("path", OptionType::String, "Output directory")
            .with_default(
                "format",
                OptionType::OneOf(FileFormat::CHOICES),
                "json",
                "Part file format",
            )
            .with_default(
                "saveMode",
                OptionType::OneOf(SaveMode::CHOICES),
                "append",
                "What to do when the directory already holds data",
            )
            .with_columns()
    }

    fn create(&self, options: OptionsBag) -> Result<Box<dyn Sink>, OptionsError> {
        let config: FileSinkConfig = options.deserialize()?;
        Ok(Box::new(FileSink {
            projection: options.projection()?,
            config,
            store: None,
            run_id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            parts: 0,
            rows: 0,
            discard: false,
        }))
    }
}

/// Convenience for tests and tools: records of a JSON lines file
pub fn read_records(path: impl AsRef<Path>) -> ConnectorResult<Vec<Map<String, Value>>> {
    let text = std::fs::read_to_string(path)?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(ConnectorError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(values: Vec<Value>) -> Batch {
        Batch::from_records(
            values
                .into_iter()
                .filter_map(|v| match v {
                    Value::Object(m) => Some(m),
                    _ => None,
                })
                .collect(),
        )
    }

    #[test]
    fn test_csv_escaping() {
        let text = to_csv(&batch(vec![
            json!({"id": 1, "note": "plain", "extra": null}),
            json!({"id": 2, "note": "has, comma and \"quote\"", "extra": true}),
        ]));
        assert_eq!(
            text,
            "id,note,extra\n1,plain,\n2,\"has, comma and \"\"quote\"\"\",true\n"
        );
    }

    #[test]
    fn test_data_file_filter() {
        assert!(is_data_file(Path::new("/x/part-00000-ab.jsonl")));
        assert!(is_data_file(Path::new("/x/input.json")));
        assert!(!is_data_file(Path::new("/x/_SUCCESS")));
        assert!(!is_data_file(Path::new("/x/.hidden.json")));
        assert!(!is_data_file(Path::new("/x/data.csv")));
    }

    #[tokio::test]
    async fn test_read_json_lines_reports_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"a\":1}\n[1,2]\n").unwrap();
        let err = read_json_lines(path, 10, Projection::All).await.unwrap_err();
        assert!(err.to_string().contains(":2:"), "{err}");
    }
}

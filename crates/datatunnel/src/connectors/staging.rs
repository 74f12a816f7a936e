//! Staging sinks with two-phase commit
//!
//! A [`StagingSink`] uploads every batch as a part object under a per-job
//! prefix of a staging area (`tempdir`) and makes nothing visible until
//! commit, when a [`BulkLoader`] moves all parts into the target in one
//! transaction. A failed commit leaves the target untouched. Staged parts are
//! removed on close unless `keepStaging` is set.
//!
//! ```text
//! tempdir = "memory://"             in-process, dropped with the sink
//! tempdir = "file:///var/stage"     local directory
//! tempdir = "s3://bucket/prefix"    S3 (redshift connector)
//! ```

use super::memory::{MemoryStore, MEMORY_SCHEME};
use super::SaveMode;
use crate::error::{ConnectorError, ConnectorResult, OptionsError};
use crate::options::{OptionSchema, OptionType, OptionsBag, Projection};
use crate::traits::{Batch, CommitResult, Schema, Sink, SinkFactory, SinkMode, WriteAck};
use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;
use validator::Validate;

// ============================================================================
// Staging Location
// ============================================================================

/// Parsed `tempdir` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagingLocation {
    Memory { prefix: String },
    Local { root: PathBuf },
    S3 { bucket: String, prefix: String },
}

impl StagingLocation {
    pub fn parse(tempdir: &str) -> Result<Self, String> {
        let url = Url::parse(tempdir).map_err(|e| format!("invalid staging URL '{tempdir}': {e}"))?;
        let path = url.path().trim_matches('/').to_string();
        match url.scheme() {
            "memory" => {
                let prefix = [url.host_str().unwrap_or(""), path.as_str()]
                    .iter()
                    .filter(|s| !s.is_empty())
                    .copied()
                    .collect::<Vec<_>>()
                    .join("/");
                Ok(StagingLocation::Memory { prefix })
            }
            "file" => {
                let root = url
                    .to_file_path()
                    .map_err(|_| format!("invalid local staging path '{tempdir}'"))?;
                Ok(StagingLocation::Local { root })
            }
            "s3" | "s3a" => {
                let bucket = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| format!("staging URL '{tempdir}' has no bucket"))?;
                Ok(StagingLocation::S3 {
                    bucket: bucket.to_string(),
                    prefix: path,
                })
            }
            other => Err(format!("unsupported staging scheme '{other}'")),
        }
    }

    /// Key prefix inside the store
    pub fn prefix(&self) -> &str {
        match self {
            StagingLocation::Memory { prefix } | StagingLocation::S3 { prefix, .. } => prefix,
            StagingLocation::Local { .. } => "",
        }
    }

    /// Fully qualified URL of an object in this location
    pub fn url_for(&self, path: &ObjectPath) -> String {
        match self {
            StagingLocation::Memory { .. } => format!("memory://{path}"),
            StagingLocation::Local { root } => format!("file://{}/{}", root.display(), path),
            StagingLocation::S3 { bucket, .. } => format!("s3://{bucket}/{path}"),
        }
    }

    /// Store for locations that need no credentials
    pub async fn open_store(&self) -> ConnectorResult<Arc<dyn ObjectStore>> {
        match self {
            StagingLocation::Memory { .. } => Ok(Arc::new(InMemory::new())),
            StagingLocation::Local { root } => {
                tokio::fs::create_dir_all(root).await.map_err(|e| {
                    ConnectorError::Config(format!("failed to create staging directory: {}", e))
                })?;
                let store = LocalFileSystem::new_with_prefix(root).map_err(|e| {
                    ConnectorError::Config(format!("failed to open staging directory: {}", e))
                })?;
                Ok(Arc::new(store))
            }
            StagingLocation::S3 { .. } => Err(ConnectorError::config(
                "s3 staging is only available to connectors that carry AWS credentials",
            )),
        }
    }
}

impl fmt::Display for StagingLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StagingLocation::Memory { prefix } => write!(f, "memory://{prefix}"),
            StagingLocation::Local { root } => write!(f, "file://{}", root.display()),
            StagingLocation::S3 { bucket, prefix } => write!(f, "s3://{bucket}/{prefix}"),
        }
    }
}

fn join_path<'a>(segments: impl IntoIterator<Item = &'a str>) -> ObjectPath {
    ObjectPath::from_iter(
        segments
            .into_iter()
            .flat_map(|s| s.split('/'))
            .filter(|s| !s.is_empty()),
    )
}

// ============================================================================
// Manifest
// ============================================================================

/// One uploaded part
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedPart {
    #[serde(serialize_with = "serialize_path")]
    pub path: ObjectPath,
    pub url: String,
    pub rows: u64,
    pub bytes: u64,
}

fn serialize_path<S: serde::Serializer>(path: &ObjectPath, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(path.as_ref())
}

/// Everything a loader needs to publish a job's staged parts
#[derive(Debug, Clone, Serialize)]
pub struct StagingManifest {
    pub job_prefix: String,
    pub parts: Vec<StagedPart>,
    pub schema: Option<Arc<Schema>>,
}

impl StagingManifest {
    pub fn rows(&self) -> u64 {
        self.parts.iter().map(|p| p.rows).sum()
    }

    pub fn job_path(&self) -> ObjectPath {
        join_path([self.job_prefix.as_str()])
    }

    /// Redshift/S3 style COPY manifest
    pub fn to_copy_manifest(&self) -> Value {
        json!({
            "entries": self
                .parts
                .iter()
                .map(|p| json!({"url": p.url, "mandatory": true}))
                .collect::<Vec<_>>()
        })
    }
}

/// Publishes staged parts to a target in a single transaction.
///
/// `load` either makes every part visible or leaves the target unchanged.
#[async_trait]
pub trait BulkLoader: Send + Sync {
    fn kind(&self) -> &str;

    /// Establish the target connection; called from the sink's `open`
    async fn connect(&mut self) -> ConnectorResult<()> {
        Ok(())
    }

    /// Publish all parts; returns the rows made visible
    async fn load(
        &mut self,
        store: &Arc<dyn ObjectStore>,
        location: &StagingLocation,
        manifest: &StagingManifest,
    ) -> ConnectorResult<u64>;

    /// Where committed data lives, for the job report
    fn target_location(&self) -> Option<String> {
        None
    }

    async fn disconnect(&mut self) -> ConnectorResult<()> {
        Ok(())
    }
}

// ============================================================================
// Staging Sink
// ============================================================================

/// Sink that stages parts and publishes them through `L` on commit
pub struct StagingSink<L: BulkLoader> {
    loader: L,
    location: StagingLocation,
    store: Option<Arc<dyn ObjectStore>>,
    projection: Projection,
    keep_staging: bool,
    job_prefix: String,
    parts: Vec<StagedPart>,
    schema: Option<Arc<Schema>>,
}

impl<L: BulkLoader> StagingSink<L> {
    pub fn new(loader: L, location: StagingLocation, projection: Projection) -> Self {
        let run = format!("datatunnel-{}", Uuid::new_v4());
        let job_prefix = [location.prefix(), run.as_str()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("/");
        Self {
            loader,
            location,
            store: None,
            projection,
            keep_staging: false,
            job_prefix,
            parts: Vec::new(),
            schema: None,
        }
    }

    /// Use a preconfigured store instead of [`StagingLocation::open_store`]
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_keep_staging(mut self, keep: bool) -> Self {
        self.keep_staging = keep;
        self
    }

    pub fn job_prefix(&self) -> &str {
        &self.job_prefix
    }

    pub fn staged_parts(&self) -> &[StagedPart] {
        &self.parts
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    fn store(&self) -> ConnectorResult<&Arc<dyn ObjectStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| ConnectorError::Internal("staging sink used before open".into()))
    }

    fn manifest(&self) -> StagingManifest {
        StagingManifest {
            job_prefix: self.job_prefix.clone(),
            parts: self.parts.clone(),
            schema: self.schema.clone(),
        }
    }

    async fn remove_staged(&self) -> ConnectorResult<usize> {
        let Some(store) = self.store.as_ref() else {
            return Ok(0);
        };
        let prefix = join_path([self.job_prefix.as_str()]);
        let objects: Vec<_> = store.list(Some(&prefix)).try_collect().await?;
        for meta in &objects {
            store.delete(&meta.location).await?;
        }
        Ok(objects.len())
    }
}

#[async_trait]
impl<L: BulkLoader> Sink for StagingSink<L> {
    fn kind(&self) -> &str {
        self.loader.kind()
    }

    fn mode(&self) -> SinkMode {
        SinkMode::Staging
    }

    async fn open(&mut self) -> ConnectorResult<()> {
        if self.store.is_none() {
            self.store = Some(self.location.open_store().await?);
        }
        self.loader.connect().await?;
        debug!(
            kind = %self.loader.kind(),
            staging = %self.location,
            prefix = %self.job_prefix,
            "Opened staging sink"
        );
        Ok(())
    }

    async fn write(&mut self, batch: &Batch) -> ConnectorResult<WriteAck> {
        if batch.is_empty() {
            return Ok(WriteAck::default());
        }
        let batch = batch.project(&self.projection)?;
        let data = batch.to_json_lines()?;
        let bytes = data.len() as u64;
        let name = format!("part-{:05}.jsonl", self.parts.len());
        let path = join_path([self.job_prefix.as_str(), name.as_str()]);

        self.store()?
            .put(&path, PutPayload::from(data))
            .await
            .map_err(|e| ConnectorError::Connection(format!("staging upload failed: {}", e)))?;

        if self.schema.is_none() {
            self.schema = Some(batch.schema().clone());
        }
        let rows = batch.num_rows() as u64;
        self.parts.push(StagedPart {
            url: self.location.url_for(&path),
            path,
            rows,
            bytes,
        });
        Ok(WriteAck::new(rows, bytes))
    }

    async fn commit(&mut self) -> ConnectorResult<CommitResult> {
        let manifest = self.manifest();
        let store = self.store()?.clone();
        info!(
            kind = %self.loader.kind(),
            parts = manifest.parts.len(),
            rows = manifest.rows(),
            "Loading staged parts"
        );
        let rows = self.loader.load(&store, &self.location, &manifest).await?;
        Ok(CommitResult {
            rows_committed: rows,
            location: self.loader.target_location(),
        })
    }

    async fn close(&mut self) -> ConnectorResult<()> {
        if self.keep_staging {
            info!(prefix = %self.job_prefix, "Keeping staged parts");
        } else {
            match self.remove_staged().await {
                Ok(removed) => debug!(removed, "Removed staged parts"),
                Err(e) => warn!(prefix = %self.job_prefix, "Failed to remove staged parts: {}", e),
            }
        }
        self.loader.disconnect().await
    }
}

/// Read every part of a manifest back as records, in part order
pub async fn read_staged_records(
    store: &Arc<dyn ObjectStore>,
    manifest: &StagingManifest,
) -> ConnectorResult<Vec<serde_json::Map<String, Value>>> {
    let mut records = Vec::with_capacity(manifest.rows() as usize);
    for part in &manifest.parts {
        let bytes = store.get(&part.path).await?.bytes().await?;
        for line in bytes.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            records.push(serde_json::from_slice(line)?);
        }
    }
    Ok(records)
}

// ============================================================================
// Warehouse (in-process bulk loader)
// ============================================================================

/// Loads staged parts into a [`MemoryStore`] table in one swap
pub struct MemoryWarehouseLoader {
    store: Arc<MemoryStore>,
    target: String,
    save_mode: SaveMode,
}

impl MemoryWarehouseLoader {
    pub fn new(store: Arc<MemoryStore>, target: impl Into<String>, save_mode: SaveMode) -> Self {
        Self {
            store,
            target: target.into(),
            save_mode,
        }
    }
}

#[async_trait]
impl BulkLoader for MemoryWarehouseLoader {
    fn kind(&self) -> &str {
        "warehouse"
    }

    async fn load(
        &mut self,
        store: &Arc<dyn ObjectStore>,
        _location: &StagingLocation,
        manifest: &StagingManifest,
    ) -> ConnectorResult<u64> {
        let records = read_staged_records(store, manifest).await?;
        let rows = records.len() as u64;
        match self.save_mode {
            SaveMode::Overwrite => self.store.replace(&self.target, records),
            _ => self.store.append(&self.target, records),
        }
        Ok(rows)
    }

    fn target_location(&self) -> Option<String> {
        Some(format!("{MEMORY_SCHEME}{}", self.target))
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct WarehouseSinkConfig {
    #[validate(length(min = 1))]
    pub target: String,

    pub tempdir: String,

    pub save_mode: SaveMode,

    pub keep_staging: bool,
}

pub struct WarehouseSinkFactory {
    store: Arc<MemoryStore>,
}

impl WarehouseSinkFactory {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

impl SinkFactory for WarehouseSinkFactory {
    fn schema(&self) -> OptionSchema {
        OptionSchema::new("warehouse")
            .required("target", OptionType::String, "Memory table published on commit")
            .with_default(
                "tempdir",
                OptionType::String,
                "memory://",
                "Staging area URL (memory:// or file://)",
            )
            .with_default(
                "saveMode",
                OptionType::OneOf(&["append", "overwrite"]),
                "append",
                "Append to or replace the target on commit",
            )
            .with_default(
                "keepStaging",
                OptionType::Boolean,
                false,
                "Keep staged parts after the job",
            )
            .with_columns()
    }

    fn create(&self, options: OptionsBag) -> Result<Box<dyn Sink>, OptionsError> {
        let config: WarehouseSinkConfig = options.deserialize()?;
        let location =
            StagingLocation::parse(&config.tempdir).map_err(|message| OptionsError::InvalidValue {
                kind: options.kind().to_string(),
                key: "tempdir".to_string(),
                message,
            })?;
        if matches!(location, StagingLocation::S3 { .. }) {
            return Err(OptionsError::InvalidValue {
                kind: options.kind().to_string(),
                key: "tempdir".to_string(),
                message: "warehouse staging supports memory:// and file:// only".to_string(),
            });
        }
        let loader = MemoryWarehouseLoader::new(self.store.clone(), config.target, config.save_mode);
        Ok(Box::new(
            StagingSink::new(loader, location, options.projection()?)
                .with_keep_staging(config.keep_staging),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn batch(ids: std::ops::Range<i64>) -> Batch {
        Batch::from_records(
            ids.map(|i| {
                let mut m = Map::new();
                m.insert("id".into(), json!(i));
                m
            })
            .collect(),
        )
    }

    #[tokio::test]
    async fn test_local_store_creates_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("stage");
        let location = StagingLocation::Local { root: root.clone() };
        let store = location.open_store().await.unwrap();
        assert!(root.is_dir());

        let path = join_path(["job", "part-00000.jsonl"]);
        store.put(&path, PutPayload::from(b"{}\n".to_vec())).await.unwrap();
        assert!(root.join("job").join("part-00000.jsonl").is_file());
    }

    #[test]
    fn test_parse_locations() {
        assert_eq!(
            StagingLocation::parse("memory://").unwrap(),
            StagingLocation::Memory {
                prefix: String::new()
            }
        );
        assert_eq!(
            StagingLocation::parse("s3a://bucket/tmp/stage/").unwrap(),
            StagingLocation::S3 {
                bucket: "bucket".into(),
                prefix: "tmp/stage".into()
            }
        );
        assert_eq!(
            StagingLocation::parse("file:///var/stage").unwrap(),
            StagingLocation::Local {
                root: PathBuf::from("/var/stage")
            }
        );
        assert!(StagingLocation::parse("ftp://host/x").is_err());
        assert!(StagingLocation::parse("not a url").is_err());
    }

    #[test]
    fn test_copy_manifest() {
        let location = StagingLocation::parse("s3://bkt/pre").unwrap();
        let path = join_path(["pre", "job", "part-00000.jsonl"]);
        let manifest = StagingManifest {
            job_prefix: "pre/job".into(),
            parts: vec![StagedPart {
                url: location.url_for(&path),
                path,
                rows: 2,
                bytes: 10,
            }],
            schema: None,
        };
        assert_eq!(
            manifest.to_copy_manifest(),
            json!({"entries": [{"url": "s3://bkt/pre/job/part-00000.jsonl", "mandatory": true}]})
        );
    }

    #[tokio::test]
    async fn test_nothing_visible_before_commit() {
        let tables = Arc::new(MemoryStore::new());
        let loader = MemoryWarehouseLoader::new(tables.clone(), "t", SaveMode::Append);
        let location = StagingLocation::parse("memory://").unwrap();
        let mut sink = StagingSink::new(loader, location, Projection::All);

        sink.open().await.unwrap();
        sink.write(&batch(0..3)).await.unwrap();
        sink.write(&batch(3..5)).await.unwrap();
        assert!(!tables.contains("t"));
        assert_eq!(sink.staged_parts().len(), 2);

        let result = sink.commit().await.unwrap();
        assert_eq!(result.rows_committed, 5);
        assert_eq!(tables.row_count("t"), 5);
        assert_eq!(result.location.as_deref(), Some("memory://t"));
    }

    #[tokio::test]
    async fn test_close_removes_staged_parts() {
        let tables = Arc::new(MemoryStore::new());
        let staging: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let loader = MemoryWarehouseLoader::new(tables, "t", SaveMode::Append);
        let mut sink = StagingSink::new(loader, StagingLocation::parse("memory://").unwrap(), Projection::All)
            .with_store(staging.clone());
        sink.open().await.unwrap();
        sink.write(&batch(0..2)).await.unwrap();
        let listed: Vec<_> = staging.list(None).try_collect().await.unwrap();
        assert_eq!(listed.len(), 1);

        sink.close().await.unwrap();
        let listed: Vec<_> = staging.list(None).try_collect().await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_keep_staging_on_local_dir() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_directory_path(dir.path()).unwrap().to_string();
        let tables = Arc::new(MemoryStore::new());
        let loader = MemoryWarehouseLoader::new(tables.clone(), "t", SaveMode::Overwrite);
        let mut sink = StagingSink::new(loader, StagingLocation::parse(&url).unwrap(), Projection::All)
            .with_keep_staging(true);
        sink.open().await.unwrap();
        sink.write(&batch(0..4)).await.unwrap();
        sink.commit().await.unwrap();
        sink.close().await.unwrap();

        let job_dir = dir.path().join(sink.job_prefix());
        assert!(job_dir.join("part-00000.jsonl").exists());
        assert_eq!(tables.row_count("t"), 4);
    }
}

//! Amazon Redshift sink connector
//!
//! Stages batches as JSON lines under an S3 `tempdir`, then on commit writes a
//! COPY manifest and runs
//!
//! ```sql
//! BEGIN;
//! DELETE FROM "schema"."table";          -- saveMode = overwrite only
//! COPY "schema"."table" FROM 's3://.../manifest.json' ... FORMAT AS JSON 'auto' MANIFEST;
//! COMMIT;
//! ```
//!
//! so the target changes all at once or not at all. The COPY authenticates
//! with `redshiftRoleArn` when set, otherwise with the access key pair used
//! for staging.
//!
//! ```text
//! DATATUNNEL SOURCE("mysql") OPTIONS(host="db", username="ro", password="...",
//!     databaseName="shop", tableName="orders")
//! SINK("redshift") OPTIONS(host="cluster.example.redshift.amazonaws.com",
//!     username="loader", password="...", databaseName="dw", tableName="orders",
//!     tempdir="s3://staging-bucket/tunnel", redshiftRoleArn="arn:aws:iam::123:role/copy")
//! ```

use super::staging::{BulkLoader, StagingLocation, StagingManifest, StagingSink};
use crate::error::{ConnectorError, ConnectorResult, OptionsError};
use crate::options::{OptionSchema, OptionType, OptionsBag};
use crate::traits::{Sink, SinkFactory};
use crate::types::SensitiveString;
use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use rustls::ClientConfig;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::{Client, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, error, info, warn};
use validator::Validate;

/// TLS mode for the cluster connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// No TLS (local testing only)
    Disable,
    /// TLS with certificates verified against the webpki roots
    #[default]
    Require,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedshiftSaveMode {
    #[default]
    Append,
    Overwrite,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RedshiftSinkConfig {
    #[validate(length(min = 1, max = 255))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    #[validate(length(min = 1, max = 127))]
    pub database_name: String,

    #[validate(length(min = 1, max = 128))]
    pub username: String,

    pub password: SensitiveString,

    #[validate(length(min = 1, max = 127))]
    pub schema_name: String,

    #[validate(length(min = 1, max = 127))]
    pub table_name: String,

    pub tempdir: String,

    pub region: String,

    #[serde(default)]
    pub access_key_id: Option<SensitiveString>,

    #[serde(default)]
    pub secret_access_key: Option<SensitiveString>,

    #[serde(default)]
    pub s3_endpoint: Option<String>,

    #[serde(default)]
    pub redshift_role_arn: Option<String>,

    pub ssl_mode: SslMode,

    pub save_mode: RedshiftSaveMode,

    pub keep_staging: bool,

    #[validate(range(min = 1, max = 300))]
    pub connect_timeout_secs: u64,
}

/// Escape a SQL identifier by doubling embedded double quotes
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Escape a SQL string literal by doubling embedded single quotes
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Credentials clause of the COPY statement
#[derive(Debug, Clone)]
pub enum CopyAuth {
    IamRole(String),
    AccessKeys {
        access_key_id: SensitiveString,
        secret_access_key: SensitiveString,
    },
}

impl CopyAuth {
    fn clause(&self) -> String {
        match self {
            CopyAuth::IamRole(arn) => format!("IAM_ROLE {}", quote_literal(arn)),
            CopyAuth::AccessKeys {
                access_key_id,
                secret_access_key,
            } => format!(
                "ACCESS_KEY_ID {} SECRET_ACCESS_KEY {}",
                quote_literal(access_key_id.expose_secret()),
                quote_literal(secret_access_key.expose_secret())
            ),
        }
    }
}

/// Build the COPY statement for a staged manifest
pub fn copy_sql(
    schema: &str,
    table: &str,
    columns: Option<&[String]>,
    manifest_url: &str,
    auth: &CopyAuth,
    region: &str,
) -> String {
    let column_list = columns
        .map(|cols| {
            format!(
                " ({})",
                cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
            )
        })
        .unwrap_or_default();
    format!(
        "COPY {}.{}{} FROM {} {} FORMAT AS JSON 'auto' MANIFEST REGION {}",
        quote_ident(schema),
        quote_ident(table),
        column_list,
        quote_literal(manifest_url),
        auth.clause(),
        quote_literal(region)
    )
}

pub fn delete_sql(schema: &str, table: &str) -> String {
    format!("DELETE FROM {}.{}", quote_ident(schema), quote_ident(table))
}

/// Publishes staged parts with a transactional COPY
pub struct RedshiftLoader {
    config: RedshiftSinkConfig,
    auth: CopyAuth,
    columns: Option<Vec<String>>,
    client: Option<Client>,
    connection: Option<tokio::task::JoinHandle<()>>,
}

impl RedshiftLoader {
    fn pg_config(&self) -> tokio_postgres::Config {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.config.host)
            .port(self.config.port)
            .user(&self.config.username)
            .password(self.config.password.expose_secret())
            .dbname(&self.config.database_name)
            .connect_timeout(Duration::from_secs(self.config.connect_timeout_secs));
        pg
    }

    fn tls_config() -> ConnectorResult<ClientConfig> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectorError::Config(format!("invalid TLS configuration: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();
        Ok(config)
    }

    fn client(&self) -> ConnectorResult<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| ConnectorError::Internal("redshift loader not connected".into()))
    }

    async fn run_copy(
        &self,
        client: &Client,
        manifest_url: &str,
    ) -> Result<u64, tokio_postgres::Error> {
        let copy = copy_sql(
            &self.config.schema_name,
            &self.config.table_name,
            self.columns.as_deref(),
            manifest_url,
            &self.auth,
            &self.config.region,
        );
        client.batch_execute("BEGIN").await?;
        if self.config.save_mode == RedshiftSaveMode::Overwrite {
            client
                .execute(
                    &delete_sql(&self.config.schema_name, &self.config.table_name),
                    &[],
                )
                .await?;
        }
        let rows = client.execute(copy.as_str(), &[]).await?;
        client.batch_execute("COMMIT").await?;
        Ok(rows)
    }
}

#[async_trait]
impl BulkLoader for RedshiftLoader {
    fn kind(&self) -> &str {
        "redshift"
    }

    async fn connect(&mut self) -> ConnectorResult<()> {
        let pg = self.pg_config();
        let (client, handle) = match self.config.ssl_mode {
            SslMode::Disable => {
                let (client, connection) = pg.connect(NoTls).await.map_err(|e| {
                    ConnectorError::Connection(format!("failed to connect to Redshift: {}", e))
                })?;
                let handle = tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        error!("Redshift connection error: {}", e);
                    }
                });
                (client, handle)
            }
            SslMode::Require => {
                let tls = MakeRustlsConnect::new(Self::tls_config()?);
                let (client, connection) = pg.connect(tls).await.map_err(|e| {
                    ConnectorError::Connection(format!(
                        "failed to connect to Redshift with TLS: {}",
                        e
                    ))
                })?;
                let handle = tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        error!("Redshift connection error: {}", e);
                    }
                });
                (client, handle)
            }
        };
        info!(
            host = %self.config.host,
            database = %self.config.database_name,
            "Connected to Redshift"
        );
        self.client = Some(client);
        self.connection = Some(handle);
        Ok(())
    }

    async fn load(
        &mut self,
        store: &Arc<dyn ObjectStore>,
        location: &StagingLocation,
        manifest: &StagingManifest,
    ) -> ConnectorResult<u64> {
        let client = self.client()?;
        if manifest.parts.is_empty() {
            if self.config.save_mode == RedshiftSaveMode::Overwrite {
                client
                    .execute(
                        &delete_sql(&self.config.schema_name, &self.config.table_name),
                        &[],
                    )
                    .await
                    .map_err(|e| ConnectorError::Fatal(format!("truncate failed: {}", e)))?;
            }
            return Ok(0);
        }

        let manifest_path = ObjectPath::from(format!("{}/manifest.json", manifest.job_prefix));
        let body = serde_json::to_vec(&manifest.to_copy_manifest())?;
        store
            .put(&manifest_path, PutPayload::from(body))
            .await
            .map_err(|e| ConnectorError::Connection(format!("manifest upload failed: {}", e)))?;
        let manifest_url = location.url_for(&manifest_path);
        debug!(manifest = %manifest_url, parts = manifest.parts.len(), "Uploaded COPY manifest");

        match self.run_copy(client, &manifest_url).await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                if let Err(rollback) = client.batch_execute("ROLLBACK").await {
                    warn!("Redshift rollback failed: {}", rollback);
                }
                Err(ConnectorError::Fatal(format!("Redshift COPY failed: {}", e)))
            }
        }
    }

    fn target_location(&self) -> Option<String> {
        Some(format!(
            "redshift://{}:{}/{}/{}.{}",
            self.config.host,
            self.config.port,
            self.config.database_name,
            self.config.schema_name,
            self.config.table_name
        ))
    }

    async fn disconnect(&mut self) -> ConnectorResult<()> {
        self.client = None;
        if let Some(handle) = self.connection.take() {
            handle.abort();
        }
        Ok(())
    }
}

fn s3_store(config: &RedshiftSinkConfig, bucket: &str) -> ConnectorResult<Arc<dyn ObjectStore>> {
    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_region(&config.region);

    if let Some(endpoint) = &config.s3_endpoint {
        builder = builder.with_endpoint(endpoint);
    }

    if let (Some(key), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
        builder = builder
            .with_access_key_id(key.expose_secret())
            .with_secret_access_key(secret.expose_secret());
    }

    let store = builder
        .build()
        .map_err(|e| ConnectorError::Config(format!("failed to create S3 client: {}", e)))?;
    Ok(Arc::new(store))
}

pub struct RedshiftSinkFactory;

impl SinkFactory for RedshiftSinkFactory {
    fn schema(&self) -> OptionSchema {
        OptionSchema::new("redshift")
            .required("host", OptionType::String, "Cluster endpoint hostname")
            .with_default("port", OptionType::Integer, 5439, "Cluster port")
            .required("databaseName", OptionType::String, "Database name")
            .alias("database")
            .required("username", OptionType::String, "Database user")
            .alias("user")
            .required("password", OptionType::String, "Database password")
            .sensitive()
            .with_default("schemaName", OptionType::String, "public", "Target schema")
            .required("tableName", OptionType::String, "Target table")
            .alias("dbtable")
            .required("tempdir", OptionType::String, "S3 staging URL (s3:// or s3a://)")
            .with_default("region", OptionType::String, "us-east-1", "AWS region")
            .optional("accessKeyId", OptionType::String, "AWS access key id")
            .sensitive()
            .optional("secretAccessKey", OptionType::String, "AWS secret access key")
            .sensitive()
            .optional("s3Endpoint", OptionType::String, "Custom S3 endpoint")
            .optional("redshiftRoleArn", OptionType::String, "IAM role used by COPY")
            .alias("roleArn")
            .with_default(
                "sslMode",
                OptionType::OneOf(&["disable", "require"]),
                "require",
                "TLS mode",
            )
            .with_default(
                "saveMode",
                OptionType::OneOf(&["append", "overwrite"]),
                "append",
                "Append to or replace the table on commit",
            )
            .with_default(
                "keepStaging",
                OptionType::Boolean,
                false,
                "Keep staged parts after the job",
            )
            .with_default(
                "connectTimeoutSecs",
                OptionType::Integer,
                30,
                "Connection timeout in seconds",
            )
            .with_columns()
    }

    fn create(&self, options: OptionsBag) -> Result<Box<dyn Sink>, OptionsError> {
        let kind = options.kind().to_string();
        let invalid = |key: &str, message: String| OptionsError::InvalidValue {
            kind: kind.clone(),
            key: key.to_string(),
            message,
        };

        let config: RedshiftSinkConfig = options.deserialize()?;
        let location = StagingLocation::parse(&config.tempdir).map_err(|m| invalid("tempdir", m))?;
        let bucket = match &location {
            StagingLocation::S3 { bucket, .. } => bucket.clone(),
            _ => {
                return Err(invalid(
                    "tempdir",
                    "redshift staging must be an s3:// or s3a:// URL".to_string(),
                ))
            }
        };

        let auth = match (
            &config.redshift_role_arn,
            &config.access_key_id,
            &config.secret_access_key,
        ) {
            (Some(arn), _, _) => CopyAuth::IamRole(arn.clone()),
            (None, Some(key), Some(secret)) => CopyAuth::AccessKeys {
                access_key_id: key.clone(),
                secret_access_key: secret.clone(),
            },
            _ => {
                return Err(invalid(
                    "redshiftRoleArn",
                    "set redshiftRoleArn or both accessKeyId and secretAccessKey".to_string(),
                ))
            }
        };

        let projection = options.projection()?;
        let store = s3_store(&config, &bucket).map_err(|e| invalid("tempdir", e.to_string()))?;
        let keep_staging = config.keep_staging;
        let loader = RedshiftLoader {
            columns: projection.columns().map(<[String]>::to_vec),
            config,
            auth,
            client: None,
            connection: None,
        };

        Ok(Box::new(
            StagingSink::new(loader, location, projection)
                .with_store(store)
                .with_keep_staging(keep_staging),
        ))
    }
}

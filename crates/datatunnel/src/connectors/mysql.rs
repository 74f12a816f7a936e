//! MySQL source connector
//!
//! Streams the rows of a table, optionally filtered by a `condition`, over
//! the binary protocol. Rows are read on a background task and handed to the
//! executor through a bounded channel, so at most a couple of `fetchSize`
//! batches are buffered regardless of table size. The `columns` projection is
//! pushed into the SELECT list.
//!
//! When the consumer stops early the scan is interrupted with `KILL QUERY`
//! from a side connection instead of draining the remaining rows, and
//! [`Source::close`] waits for the background task to release its connection.

use crate::error::{ConnectorError, ConnectorResult, OptionsError};
use crate::options::{OptionSchema, OptionType, OptionsBag, Projection};
use crate::traits::{Batch, BatchStream, Source, SourceFactory};
use crate::types::SensitiveString;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use futures::StreamExt;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Row};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use validator::Validate;

/// MySQL "access denied" server error
const ER_ACCESS_DENIED: u16 = 1045;

/// How long `close` waits for the scan task before aborting it
const SCAN_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MysqlSourceConfig {
    #[validate(length(min = 1, max = 255))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    #[validate(length(min = 1))]
    pub username: String,

    pub password: SensitiveString,

    #[validate(length(min = 1))]
    pub database_name: String,

    #[validate(length(min = 1))]
    pub table_name: String,

    /// Raw SQL predicate appended as `WHERE (...)`, with or without a leading `WHERE`
    #[serde(default)]
    pub condition: Option<String>,

    #[validate(range(min = 1, max = 100_000))]
    pub fetch_size: usize,
}

/// Quote an identifier with backticks; dotted names are quoted per part
pub fn quote_ident(ident: &str) -> String {
    ident
        .split('.')
        .map(|part| format!("`{}`", part.replace('`', "``")))
        .collect::<Vec<_>>()
        .join(".")
}

pub fn select_sql(table: &str, projection: &Projection, condition: Option<&str>) -> String {
    let columns = match projection.columns() {
        None => "*".to_string(),
        Some(cols) => cols
            .iter()
            .map(|c| format!("`{}`", c.replace('`', "``")))
            .collect::<Vec<_>>()
            .join(", "),
    };
    let mut sql = format!("SELECT {} FROM {}", columns, quote_ident(table));
    if let Some(condition) = condition.map(strip_where).filter(|c| !c.is_empty()) {
        sql.push_str(&format!(" WHERE ({})", condition));
    }
    sql
}

/// Trim a predicate and drop a leading `WHERE` keyword
fn strip_where(condition: &str) -> &str {
    let condition = condition.trim();
    match condition.get(..5) {
        Some(head) if head.eq_ignore_ascii_case("where") => {
            let rest = &condition[5..];
            if rest.is_empty() || rest.starts_with(|c: char| c.is_whitespace() || c == '(') {
                rest.trim_start()
            } else {
                condition
            }
        }
        _ => condition,
    }
}

fn classify(error: mysql_async::Error) -> ConnectorError {
    match &error {
        mysql_async::Error::Server(server) if server.code == ER_ACCESS_DENIED => {
            ConnectorError::Auth(server.message.clone())
        }
        mysql_async::Error::Server(_) => ConnectorError::Fatal(error.to_string()),
        mysql_async::Error::Io(_) => ConnectorError::Connection(error.to_string()),
        _ => ConnectorError::Internal(error.to_string()),
    }
}

fn mysql_value_to_json(value: mysql_async::Value) -> Value {
    use mysql_async::Value as My;
    match value {
        My::NULL => Value::Null,
        // binary columns that are not valid UTF-8 are emitted as base64
        My::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Value::String(text),
            Err(e) => Value::String(STANDARD.encode(e.into_bytes())),
        },
        My::Int(n) => Value::from(n),
        My::UInt(n) => Value::from(n),
        My::Float(f) => Value::from(f as f64),
        My::Double(d) => Value::from(d),
        My::Date(year, month, day, 0, 0, 0, 0) => {
            Value::String(format!("{:04}-{:02}-{:02}", year, month, day))
        }
        My::Date(year, month, day, hour, min, sec, 0) => Value::String(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            year, month, day, hour, min, sec
        )),
        My::Date(year, month, day, hour, min, sec, micro) => Value::String(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            year, month, day, hour, min, sec, micro
        )),
        My::Time(negative, days, hour, min, sec, micro) => {
            let hours = days * 24 + u32::from(hour);
            let sign = if negative { "-" } else { "" };
            if micro == 0 {
                Value::String(format!("{sign}{hours:02}:{min:02}:{sec:02}"))
            } else {
                Value::String(format!("{sign}{hours:02}:{min:02}:{sec:02}.{micro:06}"))
            }
        }
    }
}

fn row_to_record(row: Row) -> Map<String, Value> {
    row.columns_ref()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let value: mysql_async::Value = row.get(i).unwrap_or(mysql_async::Value::NULL);
            (column.name_str().to_string(), mysql_value_to_json(value))
        })
        .collect()
}

/// How a scan ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanEnd {
    /// Every row was forwarded
    Exhausted(u64),
    /// The consumer went away or the source was closed
    Stopped(u64),
}

/// Send one item unless the scan is cancelled. Returns false when the
/// receiver is gone or `cancel` fired first.
async fn forward(
    tx: &mpsc::Sender<ConnectorResult<Batch>>,
    item: ConnectorResult<Batch>,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

async fn stream_rows(
    conn: &mut Conn,
    sql: &str,
    fetch_size: usize,
    projection: &Projection,
    tx: &mpsc::Sender<ConnectorResult<Batch>>,
    cancel: &CancellationToken,
) -> ConnectorResult<ScanEnd> {
    let mut result = conn.exec_iter(sql, ()).await.map_err(classify)?;
    let mut pending = Vec::with_capacity(fetch_size);
    let mut total = 0u64;
    loop {
        let row = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(ScanEnd::Stopped(total)),
            row = result.next() => row.map_err(classify)?,
        };
        let Some(row) = row else { break };
        pending.push(row_to_record(row));
        if pending.len() >= fetch_size {
            let batch = Batch::from_records(std::mem::take(&mut pending)).project(projection)?;
            let rows = batch.num_rows() as u64;
            if !forward(tx, Ok(batch), cancel).await {
                return Ok(ScanEnd::Stopped(total));
            }
            total += rows;
        }
    }
    if !pending.is_empty() {
        let batch = Batch::from_records(pending).project(projection)?;
        let rows = batch.num_rows() as u64;
        if !forward(tx, Ok(batch), cancel).await {
            return Ok(ScanEnd::Stopped(total));
        }
        total += rows;
    }
    Ok(ScanEnd::Exhausted(total))
}

/// Interrupt the running statement of connection `id` from a side connection
async fn kill_query(opts: Opts, id: u32) {
    let mut side = match Conn::new(opts).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(connection_id = id, "Cannot interrupt MySQL scan: {}", e);
            return;
        }
    };
    if let Err(e) = side.query_drop(format!("KILL QUERY {}", id)).await {
        warn!(connection_id = id, "KILL QUERY failed: {}", e);
    }
    if let Err(e) = side.disconnect().await {
        debug!("MySQL side connection disconnect failed: {}", e);
    }
}

pub struct MysqlSource {
    config: MysqlSourceConfig,
    projection: Projection,
    conn: Option<Conn>,
    cancel: CancellationToken,
    scan: Option<JoinHandle<()>>,
}

impl MysqlSource {
    fn new(config: MysqlSourceConfig, projection: Projection) -> Self {
        Self {
            config,
            projection,
            conn: None,
            cancel: CancellationToken::new(),
            scan: None,
        }
    }

    fn opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.config.host.clone())
            .tcp_port(self.config.port)
            .user(Some(self.config.username.clone()))
            .pass(Some(self.config.password.expose_secret().to_string()))
            .db_name(Some(self.config.database_name.clone()))
            .into()
    }

    /// Stop the scan task and wait for it to release its connection
    async fn stop_scan(&mut self) {
        self.cancel.cancel();
        let Some(mut scan) = self.scan.take() else {
            return;
        };
        if tokio::time::timeout(SCAN_SHUTDOWN_GRACE, &mut scan)
            .await
            .is_err()
        {
            warn!(
                table = %self.config.table_name,
                "MySQL scan did not stop within {:?}, aborting", SCAN_SHUTDOWN_GRACE
            );
            scan.abort();
        }
    }
}

#[async_trait]
impl Source for MysqlSource {
    fn kind(&self) -> &str {
        "mysql"
    }

    async fn open(&mut self) -> ConnectorResult<()> {
        let conn = Conn::new(self.opts()).await.map_err(classify)?;
        info!(
            host = %self.config.host,
            database = %self.config.database_name,
            table = %self.config.table_name,
            "Connected to MySQL"
        );
        self.conn = Some(conn);
        Ok(())
    }

    async fn read(&mut self) -> ConnectorResult<BatchStream> {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| ConnectorError::Internal("mysql source read before open".into()))?;
        let sql = select_sql(
            &self.config.table_name,
            &self.projection,
            self.config.condition.as_deref(),
        );
        let fetch_size = self.config.fetch_size;
        let projection = self.projection.clone();
        let opts = self.opts();
        let cancel = self.cancel.clone();
        let (tx, rx) = mpsc::channel(2);

        debug!(sql = %sql, "Starting MySQL scan");
        self.scan = Some(tokio::spawn(async move {
            let id = conn.id();
            match stream_rows(&mut conn, &sql, fetch_size, &projection, &tx, &cancel).await {
                Ok(ScanEnd::Exhausted(rows)) => debug!(rows, "MySQL scan finished"),
                Ok(ScanEnd::Stopped(rows)) => {
                    debug!(rows, "MySQL scan stopped early");
                    kill_query(opts, id).await;
                }
                Err(e) => {
                    forward(&tx, Err(e), &cancel).await;
                }
            }
            if let Err(e) = conn.disconnect().await {
                debug!("MySQL disconnect failed: {}", e);
            }
        }));

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn close(&mut self) -> ConnectorResult<()> {
        self.stop_scan().await;
        if let Some(conn) = self.conn.take() {
            conn.disconnect().await.map_err(classify)?;
        }
        Ok(())
    }
}

pub struct MysqlSourceFactory;

impl SourceFactory for MysqlSourceFactory {
    fn schema(&self) -> OptionSchema {
        OptionSchema::new("mysql")
            .required("host", OptionType::String, "Server hostname")
            .with_default("port", OptionType::Integer, 3306, "Server port")
            .required("username", OptionType::String, "Database user")
            .alias("user")
            .required("password", OptionType::String, "Database password")
            .sensitive()
            .required("databaseName", OptionType::String, "Database name")
            .alias("database")
            .required("tableName", OptionType::String, "Table to read")
            .alias("dbtable")
            .optional("condition", OptionType::String, "SQL predicate to filter rows")
            .with_default("fetchSize", OptionType::Integer, 1000, "Rows per batch")
            .with_columns()
    }

    fn create(&self, options: OptionsBag) -> Result<Box<dyn Source>, OptionsError> {
        let config: MysqlSourceConfig = options.deserialize()?;
        Ok(Box::new(MysqlSource::new(config, options.projection()?)))
    }
}

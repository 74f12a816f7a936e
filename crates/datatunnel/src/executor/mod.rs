//! Tunnel executor
//!
//! Drives one [`TunnelJobPlan`] through the job state machine. The transfer
//! runs as two stages joined by a bounded channel: a spawned reader task
//! drains the source stream, and the executor writes each batch to the sink.
//! A slow sink therefore throttles the source without unbounded buffering.
//!
//! ```text
//! ┌──────────┐   bounded mpsc   ┌──────────────┐   write + retry   ┌────────┐
//! │  Source  │ ───────────────▶ │   executor   │ ────────────────▶ │  Sink  │
//! │ (reader) │  Batch / error   │ (cancel chk) │                   │        │
//! └──────────┘                  └──────────────┘                   └────────┘
//! ```

mod job;

pub use job::{JobReport, JobState};

use crate::error::{ConnectorError, ConnectorResult, Result, TunnelError};
use crate::host::{ExecutionContext, HostEnvironment, ResultTable};
use crate::statement::{self, ConnectorRole, TunnelJobPlan};
use crate::traits::{Batch, BatchStream, CommitResult, ConnectorRegistry, RetryConfig, RetryGuard};
use crate::traits::{Sink, Source, WriteAck};
use chrono::Utc;
use futures::StreamExt;
use job::Job;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Executor tuning
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Retry policy for batch writes and transient open failures
    pub retry: RetryConfig,
    /// Batches buffered between reader and writer
    pub channel_capacity: usize,
    pub open_timeout: Duration,
    pub write_timeout: Duration,
    pub commit_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            channel_capacity: 4,
            open_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(300),
            commit_timeout: Duration::from_secs(1800),
        }
    }
}

/// Either side of a job, for the shared open path
enum Endpoint<'a> {
    Source(&'a mut Box<dyn Source>),
    Sink(&'a mut Box<dyn Sink>),
}

impl Endpoint<'_> {
    fn role(&self) -> ConnectorRole {
        match self {
            Endpoint::Source(_) => ConnectorRole::Source,
            Endpoint::Sink(_) => ConnectorRole::Sink,
        }
    }

    fn kind(&self) -> String {
        match self {
            Endpoint::Source(s) => s.kind().to_string(),
            Endpoint::Sink(s) => s.kind().to_string(),
        }
    }

    async fn open(&mut self) -> ConnectorResult<()> {
        match self {
            Endpoint::Source(s) => s.open().await,
            Endpoint::Sink(s) => s.open().await,
        }
    }
}

/// Which handles had `open` attempted and so need closing
#[derive(Default)]
struct Opened {
    source: bool,
    sink: bool,
}

/// Runs tunnel jobs against a shared, read-only connector registry
pub struct TunnelExecutor {
    registry: Arc<ConnectorRegistry>,
    host: Arc<dyn HostEnvironment>,
    config: ExecutorConfig,
}

impl TunnelExecutor {
    pub fn new(registry: Arc<ConnectorRegistry>) -> Self {
        Self {
            registry,
            host: Arc::new(ExecutionContext::new()),
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Environment receiving `resultTableName` bindings
    pub fn with_host(mut self, host: Arc<dyn HostEnvironment>) -> Self {
        self.host = host;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectorRegistry> {
        &self.registry
    }

    /// Parse and execute statement text
    pub async fn run_statement(&self, text: &str) -> Result<JobReport> {
        self.run_statement_with_cancel(text, CancellationToken::new())
            .await
    }

    pub async fn run_statement_with_cancel(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<JobReport> {
        let plan = statement::parse(text)?;
        self.execute_with_cancel(plan, cancel).await
    }

    pub async fn execute(&self, plan: TunnelJobPlan) -> Result<JobReport> {
        self.execute_with_cancel(plan, CancellationToken::new())
            .await
    }

    /// Execute a plan. `cancel` is checked between batches; a batch write in
    /// progress is allowed to finish first.
    pub async fn execute_with_cancel(
        &self,
        plan: TunnelJobPlan,
        cancel: CancellationToken,
    ) -> Result<JobReport> {
        let mut job = Job::new();
        info!(
            job_id = %job.id,
            source = %plan.source().kind(),
            sink = %plan.sink().kind(),
            "Starting tunnel job"
        );

        match self.run(&mut job, &plan, &cancel).await {
            Ok(commit) => {
                job.transition(JobState::Completed);
                metrics::counter!("datatunnel_jobs_total", "outcome" => "completed").increment(1);
                self.publish_result_table(&job, &plan, &commit);
                let report = Self::report(&job, &plan, commit);
                info!(
                    job_id = %job.id,
                    rows = report.rows_written,
                    batches = report.batches,
                    retries = report.retries,
                    elapsed_ms = report.elapsed_ms,
                    "Tunnel job completed"
                );
                Ok(report)
            }
            Err(e) => {
                job.transition(JobState::Failed);
                metrics::counter!("datatunnel_jobs_total", "outcome" => e.kind().as_str())
                    .increment(1);
                if e.is_cancelled() {
                    warn!(job_id = %job.id, rows = job.rows_written, "Tunnel job cancelled");
                } else {
                    error!(job_id = %job.id, kind = %e.kind(), error = %e, "Tunnel job failed");
                }
                Err(e)
            }
        }
    }

    /// Resolve, then transfer and commit; handles are closed on every path.
    async fn run(
        &self,
        job: &mut Job,
        plan: &TunnelJobPlan,
        cancel: &CancellationToken,
    ) -> Result<CommitResult> {
        job.transition(JobState::Resolving);
        let mut source = self
            .registry
            .resolve_source(plan.source().kind(), plan.source().options())?;
        let mut sink = self
            .registry
            .resolve_sink(plan.sink().kind(), plan.sink().options())?;

        let mut opened = Opened::default();
        let outcome = self
            .transfer(job, &mut source, &mut sink, &mut opened, cancel)
            .await;
        self.close_all(job, &mut source, &mut sink, &opened).await;
        outcome
    }

    async fn transfer(
        &self,
        job: &mut Job,
        source: &mut Box<dyn Source>,
        sink: &mut Box<dyn Sink>,
        opened: &mut Opened,
        cancel: &CancellationToken,
    ) -> Result<CommitResult> {
        if cancel.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }

        // source first: an unreadable source must fail before sink resources exist
        opened.source = true;
        self.open_with_retry(job, Endpoint::Source(&mut *source), cancel)
            .await?;
        opened.sink = true;
        self.open_with_retry(job, Endpoint::Sink(&mut *sink), cancel)
            .await?;

        job.transition(JobState::Transferring);
        let stream = source
            .read()
            .await
            .map_err(|e| TunnelError::SourceRead {
                kind: source.kind().to_string(),
                source: e,
            })?;

        let (tx, mut rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let reader_cancel = cancel.child_token();
        let reader = tokio::spawn(read_batches(stream, tx, reader_cancel.clone()));

        let consumed = self
            .write_batches(job, source.kind(), sink, &mut rx, cancel)
            .await;
        if consumed.is_err() {
            reader_cancel.cancel();
        }
        drop(rx);
        let joined = reader.await;
        consumed?;
        if let Err(e) = joined {
            return Err(TunnelError::SourceRead {
                kind: source.kind().to_string(),
                source: ConnectorError::Internal(format!("reader task failed: {e}")),
            });
        }

        // a cancelled job never commits, so staged data stays invisible
        if cancel.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }

        job.transition(JobState::Committing);
        let kind = sink.kind().to_string();
        match timeout(self.config.commit_timeout, sink.commit()).await {
            Ok(Ok(commit)) => Ok(commit),
            Ok(Err(e)) => Err(TunnelError::SinkCommit { kind, source: e }),
            Err(_) => Err(TunnelError::SinkCommit {
                kind,
                source: ConnectorError::Timeout(format!(
                    "commit did not finish within {:?}",
                    self.config.commit_timeout
                )),
            }),
        }
    }

    async fn open_with_retry(
        &self,
        job: &mut Job,
        mut endpoint: Endpoint<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let role = endpoint.role();
        let kind = endpoint.kind();
        let mut guard = RetryGuard::new(self.config.retry.clone());

        loop {
            let result = match timeout(self.config.open_timeout, endpoint.open()).await {
                Ok(result) => result,
                Err(_) => Err(ConnectorError::Timeout(format!(
                    "open did not finish within {:?}",
                    self.config.open_timeout
                ))),
            };

            let err = match result {
                Ok(()) => {
                    debug!(job_id = %job.id, role = %role, kind = %kind, "Opened connector");
                    return Ok(());
                }
                Err(e) => e,
            };

            let delay = if err.is_retryable_on_open() {
                guard.record_failure()
            } else {
                None
            };
            let Some(delay) = delay else {
                return Err(TunnelError::Connection {
                    role,
                    kind,
                    source: err,
                });
            };

            job.retries += 1;
            warn!(
                job_id = %job.id,
                role = %role,
                kind = %kind,
                attempt = guard.attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Open failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn write_batches(
        &self,
        job: &mut Job,
        source_kind: &str,
        sink: &mut Box<dyn Sink>,
        rx: &mut mpsc::Receiver<ConnectorResult<Batch>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
                item = rx.recv() => item,
            };

            let batch = match item {
                None => return Ok(()),
                Some(Err(e)) => {
                    return Err(TunnelError::SourceRead {
                        kind: source_kind.to_string(),
                        source: e,
                    })
                }
                Some(Ok(batch)) => batch,
            };

            let rows = batch.num_rows() as u64;
            job.rows_read += rows;
            metrics::counter!("datatunnel_rows_read_total", "source" => source_kind.to_string())
                .increment(rows);
            if job.schema.is_none() {
                job.schema = Some(batch.schema().clone());
            }
            if batch.is_empty() {
                continue;
            }

            let ack = self.write_with_retry(job, sink, &batch, cancel).await?;
            job.batches += 1;
            job.rows_written += ack.rows_written;
            job.bytes_written += ack.bytes_written;
            metrics::counter!("datatunnel_rows_written_total", "sink" => sink.kind().to_string())
                .increment(ack.rows_written);
        }
    }

    /// Write one batch, retrying retryable failures with backoff. Cancellation
    /// is observed during the backoff, never during a write.
    async fn write_with_retry(
        &self,
        job: &mut Job,
        sink: &mut Box<dyn Sink>,
        batch: &Batch,
        cancel: &CancellationToken,
    ) -> Result<WriteAck> {
        let mut guard = RetryGuard::new(self.config.retry.clone());
        loop {
            let result = match timeout(self.config.write_timeout, sink.write(batch)).await {
                Ok(result) => result,
                Err(_) => Err(ConnectorError::Timeout(format!(
                    "batch write did not finish within {:?}",
                    self.config.write_timeout
                ))),
            };

            let err = match result {
                Ok(ack) => return Ok(ack),
                Err(e) => e,
            };

            let delay = if err.is_retryable() {
                guard.record_failure()
            } else {
                None
            };
            let Some(delay) = delay else {
                return Err(TunnelError::SinkWrite {
                    kind: sink.kind().to_string(),
                    attempts: guard.attempts(),
                    source: err,
                });
            };

            job.retries += 1;
            metrics::counter!("datatunnel_batch_retries_total", "sink" => sink.kind().to_string())
                .increment(1);
            warn!(
                job_id = %job.id,
                batch = job.batches + 1,
                attempt = guard.attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Batch write failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn close_all(
        &self,
        job: &Job,
        source: &mut Box<dyn Source>,
        sink: &mut Box<dyn Sink>,
        opened: &Opened,
    ) {
        if opened.sink {
            match timeout(self.config.open_timeout, sink.close()).await {
                Ok(Ok(())) => debug!(job_id = %job.id, kind = %sink.kind(), "Closed sink"),
                Ok(Err(e)) => {
                    warn!(job_id = %job.id, kind = %sink.kind(), error = %e, "Failed to close sink")
                }
                Err(_) => warn!(job_id = %job.id, kind = %sink.kind(), "Timed out closing sink"),
            }
        }
        if opened.source {
            match timeout(self.config.open_timeout, source.close()).await {
                Ok(Ok(())) => debug!(job_id = %job.id, kind = %source.kind(), "Closed source"),
                Ok(Err(e)) => {
                    warn!(job_id = %job.id, kind = %source.kind(), error = %e, "Failed to close source")
                }
                Err(_) => warn!(job_id = %job.id, kind = %source.kind(), "Timed out closing source"),
            }
        }
    }

    fn publish_result_table(&self, job: &Job, plan: &TunnelJobPlan, commit: &CommitResult) {
        let Some(name) = plan.result_table_name() else {
            return;
        };
        let source_options = match self.registry.source_schema(plan.source().kind()) {
            Some(schema) => schema.redact(plan.source().options()),
            None => plan.source().options().clone(),
        };
        self.host.register_result_table(ResultTable {
            name: name.to_string(),
            source_kind: plan.source().kind().to_string(),
            source_options,
            schema: job.schema.clone(),
            rows: job.rows_read,
            location: commit.location.clone(),
            registered_at: Utc::now(),
        });
    }

    fn report(job: &Job, plan: &TunnelJobPlan, commit: CommitResult) -> JobReport {
        JobReport {
            job_id: job.id,
            source_kind: plan.source().kind().to_string(),
            sink_kind: plan.sink().kind().to_string(),
            state: job.state,
            transitions: job.transitions.clone(),
            rows_read: job.rows_read,
            rows_written: job.rows_written,
            bytes_written: job.bytes_written,
            batches: job.batches,
            retries: job.retries,
            commit,
            result_table_name: plan.result_table_name().map(str::to_string),
            elapsed_ms: job.started.elapsed().as_millis() as u64,
        }
    }
}

/// Reader stage: forward stream items until exhaustion, the first error,
/// cancellation, or the writer hanging up.
async fn read_batches(
    mut stream: BatchStream,
    tx: mpsc::Sender<ConnectorResult<Batch>>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = stream.next() => next,
        };
        let Some(item) = next else {
            return;
        };
        let failed = item.is_err();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = tx.send(item) => {
                if sent.is_err() {
                    return;
                }
            }
        }
        if failed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::traits::testing::{MockFailure, MockSinkFactory, MockSourceFactory, MockState};

    fn executor(state: &MockState) -> TunnelExecutor {
        let mut registry = ConnectorRegistry::new();
        registry.register_source("mock", Arc::new(MockSourceFactory::new(state.clone())));
        registry.register_sink("mock", Arc::new(MockSinkFactory::new(state.clone())));
        TunnelExecutor::new(Arc::new(registry)).with_config(ExecutorConfig {
            retry: RetryConfig::fixed_delay(3, Duration::from_millis(1)),
            channel_capacity: 2,
            open_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            commit_timeout: Duration::from_secs(5),
        })
    }

    const STATEMENT: &str =
        r#"DATATUNNEL SOURCE("mock") OPTIONS(rows=25, batchSize=10) SINK("mock") OPTIONS()"#;

    #[tokio::test]
    async fn test_happy_path_transitions() {
        let state = MockState::default();
        let report = executor(&state).run_statement(STATEMENT).await.unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(
            report.transitions,
            vec![
                JobState::Planned,
                JobState::Resolving,
                JobState::Transferring,
                JobState::Committing,
                JobState::Completed
            ]
        );
        assert_eq!(report.rows_read, 25);
        assert_eq!(report.rows_written, 25);
        assert_eq!(report.batches, 3);
        assert_eq!(state.source_closes(), 1);
        assert_eq!(state.sink_closes(), 1);
        assert_eq!(state.commit_calls(), 1);
    }

    #[tokio::test]
    async fn test_parse_error_never_resolves() {
        let state = MockState::default();
        let err = executor(&state)
            .run_statement("DATATUNNEL SOURCE(")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
        assert_eq!(state.source_opens(), 0);
    }

    #[tokio::test]
    async fn test_options_error_before_open() {
        let state = MockState::default();
        let err = executor(&state)
            .run_statement(r#"DATATUNNEL SOURCE("mock") OPTIONS(rows="many") SINK("mock") OPTIONS()"#)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Options);
        assert_eq!(state.source_opens(), 0);
        assert_eq!(state.sink_opens(), 0);
    }

    #[tokio::test]
    async fn test_source_open_failure_skips_sink() {
        let state = MockState::default();
        state.fail_source_open(vec![MockFailure::Connection]);
        let err = executor(&state).run_statement(STATEMENT).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(state.sink_opens(), 0);
        assert_eq!(state.source_closes(), 1);
        assert_eq!(state.sink_closes(), 0);
    }

    #[tokio::test]
    async fn test_open_timeout_is_retried() {
        let state = MockState::default();
        state.fail_sink_open(vec![MockFailure::Timeout, MockFailure::Transient]);
        let report = executor(&state).run_statement(STATEMENT).await.unwrap();
        assert_eq!(state.sink_opens(), 3);
        assert_eq!(report.retries, 2);
    }

    #[tokio::test]
    async fn test_sink_open_failure_closes_source() {
        let state = MockState::default();
        state.fail_sink_open(vec![MockFailure::Fatal]);
        let err = executor(&state).run_statement(STATEMENT).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Connection {
                role: ConnectorRole::Sink,
                ..
            }
        ));
        assert_eq!(state.source_closes(), 1);
        assert_eq!(state.sink_closes(), 1);
    }

    #[tokio::test]
    async fn test_schema_error_is_not_retried() {
        let state = MockState::default();
        state.fail_write(2, MockFailure::Schema);
        let err = executor(&state).run_statement(STATEMENT).await.unwrap_err();
        match err {
            TunnelError::SinkWrite { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(state.write_calls(), 2);
        assert_eq!(state.commit_calls(), 0);
        assert_eq!(state.sink_closes(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let state = MockState::default();
        for call in 1..=4 {
            state.fail_write(call, MockFailure::Transient);
        }
        let err = executor(&state).run_statement(STATEMENT).await.unwrap_err();
        match err {
            TunnelError::SinkWrite { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected {other:?}"),
        }
        assert!(state.visible_records().is_empty());
    }

    #[tokio::test]
    async fn test_source_read_error() {
        let state = MockState::default();
        state.fail_read_after(1);
        let err = executor(&state).run_statement(STATEMENT).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceRead);
        assert_eq!(state.commit_calls(), 0);
        assert_eq!(state.visible_records().len(), 10);
    }

    #[tokio::test]
    async fn test_commit_failure() {
        let state = MockState::default();
        state.fail_commit(MockFailure::Transient);
        let err = executor(&state)
            .run_statement(r#"DATATUNNEL SOURCE("mock") OPTIONS(rows=5) SINK("mock") OPTIONS(mode="staging")"#)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SinkCommit);
        assert_eq!(state.commit_calls(), 1);
        assert!(state.visible_records().is_empty());
        assert_eq!(state.staged_batches(), 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_write_backoff() {
        let state = MockState::default();
        state.fail_write(1, MockFailure::Transient);
        let executor = executor(&state).with_config(ExecutorConfig {
            retry: RetryConfig::fixed_delay(3, Duration::from_secs(60)),
            ..ExecutorConfig::default()
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = timeout(
            Duration::from_secs(5),
            executor.run_statement_with_cancel(STATEMENT, cancel),
        )
        .await
        .expect("backoff should end on cancel")
        .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(state.write_calls(), 1);
        assert_eq!(state.commit_calls(), 0);
        assert_eq!(state.sink_closes(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let state = MockState::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = executor(&state)
            .run_statement_with_cancel(STATEMENT, cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(state.source_opens(), 0);
    }

    #[tokio::test]
    async fn test_result_table_registered_on_completion() {
        let state = MockState::default();
        let host = Arc::new(ExecutionContext::new());
        let executor = executor(&state).with_host(host.clone());
        executor
            .run_statement(
                r#"DATATUNNEL SOURCE("mock") OPTIONS(rows=3, resultTableName="out") SINK("mock") OPTIONS()"#,
            )
            .await
            .unwrap();
        let table = host.result_table("out").unwrap();
        assert_eq!(table.rows, 3);
        assert_eq!(table.source_kind, "mock");
        assert_eq!(
            table.schema.unwrap().field_names().collect::<Vec<_>>(),
            vec!["id", "label"]
        );
    }

    #[tokio::test]
    async fn test_result_table_not_registered_on_failure() {
        let state = MockState::default();
        state.fail_commit(MockFailure::Fatal);
        let host = Arc::new(ExecutionContext::new());
        let executor = executor(&state).with_host(host.clone());
        let result = executor
            .run_statement(
                r#"DATATUNNEL SOURCE("mock") OPTIONS(rows=3, resultTableName="out") SINK("mock") OPTIONS()"#,
            )
            .await;
        assert!(result.is_err());
        assert!(host.result_table("out").is_none());
    }
}

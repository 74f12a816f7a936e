//! datatunnel - statement-driven data transfer engine
//!
//! A single statement names a source connector, a sink connector and the
//! options of each. The engine parses it, validates the options against the
//! connectors' option schemas, resolves both connectors from a registry, and
//! streams batches from source to sink with retries, timeouts, cancellation
//! and an all-or-nothing commit for staging sinks.
//!
//! ```text
//! DATATUNNEL SOURCE("memory") OPTIONS(rows=[{"id": 1}], resultTableName="t0")
//! SINK("memory") OPTIONS(target="t1")
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌──────────────────┐   ┌────────────────┐
//! │ statement │──▶│ TunnelJobPlan│──▶│ ConnectorRegistry│──▶│ TunnelExecutor │
//! │  parser   │   │  (raw opts)  │   │ schema + factory │   │ state machine  │
//! └───────────┘   └──────────────┘   └──────────────────┘   └───────┬────────┘
//!                                                                    │
//!                                      Source ──▶ bounded queue ──▶ Sink
//!                                                                    │
//!                                      HostEnvironment ◀── resultTableName
//! ```
//!
//! # Library Usage
//!
//! ```rust,no_run
//! use datatunnel::prelude::*;
//!
//! # async fn demo() -> datatunnel::Result<()> {
//! let executor = TunnelExecutor::new(datatunnel::connectors::create_registry().into());
//! let report = executor
//!     .run_statement(r#"DATATUNNEL SOURCE("datagen") OPTIONS(rowCount=10)
//!                       SINK("log") OPTIONS(numRows=3)"#)
//!     .await?;
//! assert_eq!(report.rows_written, 10);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connectors;
pub mod error;
pub mod executor;
pub mod host;
pub mod options;
pub mod statement;
pub mod traits;
pub mod types;

pub use config::TunnelConfig;
pub use error::{ConnectorError, ConnectorResult, ErrorKind, OptionsError, ParseError, Result, TunnelError};
pub use executor::{ExecutorConfig, JobReport, JobState, TunnelExecutor};
pub use host::{ExecutionContext, HostEnvironment, ResultTable};
pub use options::{OptionSchema, OptionType, OptionValue, OptionsBag, Projection, RawOptions};
pub use statement::{parse, ConnectorRole, ConnectorSpec, TunnelJobPlan};
pub use traits::registry::{global as global_registry, install_global};
pub use traits::{
    Batch, BatchStream, CommitResult, ConnectorRegistry, DataType, Field, RetryConfig, Schema,
    Sink, SinkFactory, SinkMode, Source, SourceFactory, WriteAck,
};
pub use types::SensitiveString;

// Re-export async_trait for connector implementors
pub use async_trait::async_trait;

/// Everything needed to implement a connector or run a statement
pub mod prelude {
    pub use crate::{
        async_trait, Batch, BatchStream, CommitResult, ConnectorError, ConnectorRegistry,
        ConnectorResult, DataType, ExecutionContext, Field, JobReport, OptionSchema, OptionType,
        OptionsBag, OptionsError, Projection, Schema, Sink, SinkFactory, SinkMode, Source,
        SourceFactory, TunnelError, TunnelExecutor, WriteAck,
    };
    pub use futures::stream::BoxStream;
}

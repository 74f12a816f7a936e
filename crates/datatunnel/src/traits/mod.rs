//! Connector traits and shared building blocks
//!
//! - [`source::Source`] / [`sink::Sink`]: connector capabilities
//! - [`batch`]: the row batch model exchanged between them
//! - [`registry`]: kind name to factory mapping
//! - [`retry`]: backoff policy used by the executor
//! - [`testing`]: mock connectors with failure injection

pub mod batch;
pub mod registry;
pub mod retry;
pub mod sink;
pub mod source;
pub mod testing;

pub use batch::{Batch, DataType, Field, Schema};
pub use registry::{ConnectorRegistry, SinkFactory, SourceFactory};
pub use retry::{RetryConfig, RetryGuard};
pub use sink::{CommitResult, Sink, SinkMode, WriteAck};
pub use source::{BatchStream, Source};

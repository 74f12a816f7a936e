//! Error types for datatunnel
//!
//! `TunnelError` is the single terminal error a caller sees for a statement.
//! Connectors report failures through `ConnectorError`, which the executor
//! classifies (retryable or not) and wraps into the matching taxonomy kind.

use crate::statement::ConnectorRole;
use std::fmt;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Result type alias for connector operations
pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// Location of a token inside statement text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    /// Byte offset from the start of the statement
    pub offset: usize,
    /// 1-based line number
    pub line: usize,
    /// 1-based column (in characters)
    pub column: usize,
}

impl Position {
    /// Compute line/column for a byte offset into `text`
    pub fn locate(text: &str, offset: usize) -> Self {
        let offset = offset.min(text.len());
        let mut line = 1;
        let mut column = 1;
        for (idx, ch) in text.char_indices() {
            if idx >= offset {
                break;
            }
            if ch == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }
        Self {
            offset,
            line,
            column,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// Malformed statement text. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("syntax error at {position}: {message}")]
    Syntax { position: Position, message: String },

    #[error("duplicate option key '{key}' in {role} options at {position}")]
    DuplicateOptionKey {
        key: String,
        role: ConnectorRole,
        position: Position,
    },
}

impl ParseError {
    pub fn position(&self) -> Position {
        match self {
            ParseError::Syntax { position, .. } => *position,
            ParseError::DuplicateOptionKey { position, .. } => *position,
        }
    }
}

/// Option bag validation failures, raised before any connection attempt
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("missing required option '{key}' for connector '{kind}'")]
    MissingRequiredOption { kind: String, key: String },

    #[error("option '{key}' for connector '{kind}' expects {expected}, got {found}")]
    InvalidOptionType {
        kind: String,
        key: String,
        expected: String,
        found: String,
    },

    #[error("unknown option '{key}' for connector '{kind}'")]
    UnknownOption { kind: String, key: String },

    #[error("invalid value for option '{key}' of connector '{kind}': {message}")]
    InvalidValue {
        kind: String,
        key: String,
        message: String,
    },
}

impl OptionsError {
    /// The option key this error refers to
    pub fn key(&self) -> &str {
        match self {
            OptionsError::MissingRequiredOption { key, .. }
            | OptionsError::InvalidOptionType { key, .. }
            | OptionsError::UnknownOption { key, .. }
            | OptionsError::InvalidValue { key, .. } => key,
        }
    }
}

/// Taxonomy tag carried by every terminal error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Parse,
    Options,
    UnknownConnectorKind,
    Connection,
    SourceRead,
    SinkWrite,
    SinkCommit,
    Cancelled,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Parse => "parse_error",
            ErrorKind::Options => "options_error",
            ErrorKind::UnknownConnectorKind => "unknown_connector_kind",
            ErrorKind::Connection => "connection_error",
            ErrorKind::SourceRead => "source_read_error",
            ErrorKind::SinkWrite => "sink_write_error",
            ErrorKind::SinkCommit => "sink_commit_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal error for one statement execution
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error("unknown {role} connector kind: '{kind}'")]
    UnknownConnectorKind { role: ConnectorRole, kind: String },

    #[error("failed to open {role} '{kind}': {source}")]
    Connection {
        role: ConnectorRole,
        kind: String,
        #[source]
        source: ConnectorError,
    },

    #[error("source '{kind}' read failed: {source}")]
    SourceRead {
        kind: String,
        #[source]
        source: ConnectorError,
    },

    #[error("sink '{kind}' write failed after {attempts} attempt(s): {source}")]
    SinkWrite {
        kind: String,
        attempts: u32,
        #[source]
        source: ConnectorError,
    },

    #[error("sink '{kind}' commit failed: {source}")]
    SinkCommit {
        kind: String,
        #[source]
        source: ConnectorError,
    },

    #[error("job cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::Parse(_) => ErrorKind::Parse,
            TunnelError::Options(_) => ErrorKind::Options,
            TunnelError::UnknownConnectorKind { .. } => ErrorKind::UnknownConnectorKind,
            TunnelError::Connection { .. } => ErrorKind::Connection,
            TunnelError::SourceRead { .. } => ErrorKind::SourceRead,
            TunnelError::SinkWrite { .. } => ErrorKind::SinkWrite,
            TunnelError::SinkCommit { .. } => ErrorKind::SinkCommit,
            TunnelError::Cancelled => ErrorKind::Cancelled,
            TunnelError::Config(_) => ErrorKind::Config,
        }
    }

    /// Caller-initiated termination rather than an engine defect
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TunnelError::Cancelled)
    }

    pub(crate) fn unknown_kind(role: ConnectorRole, kind: impl Into<String>) -> Self {
        TunnelError::UnknownConnectorKind {
            role,
            kind: kind.into(),
        }
    }
}

/// Errors that can occur in connector operations
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Configuration validation failed
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection to external system failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Authentication failed
    #[error("authentication error: {0}")]
    Auth(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Rate limited by external system
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Timeout waiting for response
    #[error("timeout: {0}")]
    Timeout(String),

    /// Data serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Schema mismatch or projection error
    #[error("schema error: {0}")]
    Schema(String),

    /// Transient error that may succeed on retry
    #[error("transient error (retryable): {0}")]
    Transient(String),

    /// Fatal error that will not succeed on retry
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

impl ConnectorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectorError::Connection(_)
                | ConnectorError::RateLimited(_)
                | ConnectorError::Timeout(_)
                | ConnectorError::Transient(_)
        )
    }

    /// Whether an open failure of this category should be retried
    ///
    /// Refused connections and bad credentials are fatal at open time; only
    /// timeouts and explicitly transient failures are retried.
    pub fn is_retryable_on_open(&self) -> bool {
        matches!(self, ConnectorError::Timeout(_) | ConnectorError::Transient(_))
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ConnectorError::Config(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        ConnectorError::Connection(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        ConnectorError::Schema(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        ConnectorError::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        ConnectorError::Fatal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ConnectorError::transient("reset").is_retryable());
        assert!(ConnectorError::Timeout("slow".into()).is_retryable());
        assert!(ConnectorError::connection("refused").is_retryable());
        assert!(!ConnectorError::schema("bad column").is_retryable());
        assert!(!ConnectorError::fatal("boom").is_retryable());
        assert!(!ConnectorError::config("bad").is_retryable());
    }

    #[test]
    fn test_open_retry_excludes_connection_refused() {
        assert!(!ConnectorError::connection("refused").is_retryable_on_open());
        assert!(ConnectorError::Timeout("slow".into()).is_retryable_on_open());
    }

    #[test]
    fn test_error_kind_names() {
        let err = TunnelError::unknown_kind(ConnectorRole::Sink, "bogus");
        assert_eq!(err.kind(), ErrorKind::UnknownConnectorKind);
        assert_eq!(err.kind().as_str(), "unknown_connector_kind");
        assert_eq!(err.to_string(), "unknown sink connector kind: 'bogus'");
        assert!(TunnelError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_options_error_from() {
        let err: TunnelError = OptionsError::MissingRequiredOption {
            kind: "mysql".into(),
            key: "host".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Options);
        assert!(err.to_string().contains("'host'"));
    }

    #[test]
    fn test_position_locate() {
        let text = "DATATUNNEL\nSOURCE(";
        let pos = Position::locate(text, 13);
        assert_eq!(pos.line, 2);
        assert_eq!(pos.column, 3);
        assert_eq!(Position::locate(text, 0).column, 1);
    }
}

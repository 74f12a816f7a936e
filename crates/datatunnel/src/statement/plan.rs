use crate::options::{OptionValue, RawOptions};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Source option naming the output dataset in the host environment
pub const RESULT_TABLE_NAME: &str = "resultTableName";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorRole {
    Source,
    Sink,
}

impl ConnectorRole {
    pub fn keyword(&self) -> &'static str {
        match self {
            ConnectorRole::Source => "SOURCE",
            ConnectorRole::Sink => "SINK",
        }
    }
}

impl fmt::Display for ConnectorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorRole::Source => f.write_str("source"),
            ConnectorRole::Sink => f.write_str("sink"),
        }
    }
}

/// One side of a tunnel: connector kind plus its raw options
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorSpec {
    role: ConnectorRole,
    kind: String,
    options: RawOptions,
}

impl ConnectorSpec {
    pub fn new(role: ConnectorRole, kind: impl Into<String>, options: RawOptions) -> Self {
        Self {
            role,
            kind: kind.into(),
            options,
        }
    }

    pub fn source(kind: impl Into<String>, options: RawOptions) -> Self {
        Self::new(ConnectorRole::Source, kind, options)
    }

    pub fn sink(kind: impl Into<String>, options: RawOptions) -> Self {
        Self::new(ConnectorRole::Sink, kind, options)
    }

    pub fn role(&self) -> ConnectorRole {
        self.role
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn options(&self) -> &RawOptions {
        &self.options
    }

    fn write_clause(&self, f: &mut fmt::Formatter<'_>, trailing: Option<&str>) -> fmt::Result {
        write!(
            f,
            "{}({}) OPTIONS(",
            self.role.keyword(),
            OptionValue::from(self.kind.as_str())
        )?;
        let mut first = true;
        for (key, value) in &self.options {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{key}={value}")?;
        }
        if let Some(name) = trailing {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{RESULT_TABLE_NAME}={}", OptionValue::from(name))?;
        }
        f.write_str(")")
    }
}

/// Parsed, immutable representation of one SOURCE -> SINK transfer.
///
/// The executor takes the plan by value, so a plan runs at most once.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelJobPlan {
    source: ConnectorSpec,
    sink: ConnectorSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_table_name: Option<String>,
}

impl TunnelJobPlan {
    pub fn new(
        source: ConnectorSpec,
        sink: ConnectorSpec,
        result_table_name: Option<String>,
    ) -> Self {
        Self {
            source,
            sink,
            result_table_name,
        }
    }

    pub fn source(&self) -> &ConnectorSpec {
        &self.source
    }

    pub fn sink(&self) -> &ConnectorSpec {
        &self.sink
    }

    pub fn result_table_name(&self) -> Option<&str> {
        self.result_table_name.as_deref()
    }

    /// Same plan with sensitive option values replaced, for display
    pub fn map_options<F>(&self, mut redact: F) -> Self
    where
        F: FnMut(&ConnectorSpec) -> RawOptions,
    {
        let source_options = redact(&self.source);
        let sink_options = redact(&self.sink);
        Self {
            source: ConnectorSpec::source(self.source.kind.clone(), source_options),
            sink: ConnectorSpec::sink(self.sink.kind.clone(), sink_options),
            result_table_name: self.result_table_name.clone(),
        }
    }
}

/// Canonical statement text: upper-case keywords, sorted option keys and
/// `resultTableName` last on the source side.
impl fmt::Display for TunnelJobPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DATATUNNEL ")?;
        self.source.write_clause(f, self.result_table_name.as_deref())?;
        f.write_str(" ")?;
        self.sink.write_clause(f, None)
    }
}

impl FromStr for TunnelJobPlan {
    type Err = crate::error::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        super::parse(s)
    }
}

//! Options model
//!
//! Statement options arrive as a flat key/value mapping of [`OptionValue`]s.
//! Each connector kind publishes an [`OptionSchema`]; validating a raw mapping
//! against it yields an [`OptionsBag`] with defaults filled in and values
//! coerced to the declared types. Typed connector configs are then
//! deserialized from the bag with serde and checked with `validator`.

mod schema;

pub use schema::{OptionSchema, OptionSpec, OptionType, UnknownOptionPolicy};

use crate::error::OptionsError;
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use validator::Validate;

/// Option key carrying the column projection
pub const COLUMNS: &str = "columns";

/// Raw options as written in a statement, keyed in canonical (sorted) order
pub type RawOptions = BTreeMap<String, OptionValue>;

/// A single option value
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    List(Vec<OptionValue>),
    /// JSON object literal, only produced inside lists (inline rows)
    Object(serde_json::Map<String, Value>),
}

impl OptionValue {
    pub fn string_list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        OptionValue::List(
            items
                .into_iter()
                .map(|s| OptionValue::String(s.into()))
                .collect(),
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            OptionValue::String(_) => "string",
            OptionValue::Integer(_) => "integer",
            OptionValue::Float(_) => "float",
            OptionValue::Boolean(_) => "boolean",
            OptionValue::List(_) => "list",
            OptionValue::Object(_) => "object",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            OptionValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OptionValue::Float(f) => Some(*f),
            OptionValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[OptionValue]> {
        match self {
            OptionValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            OptionValue::String(s) => Value::String(s.clone()),
            OptionValue::Integer(i) => Value::from(*i),
            OptionValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            OptionValue::Boolean(b) => Value::Bool(*b),
            OptionValue::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            OptionValue::Object(map) => Value::Object(map.clone()),
        }
    }
}

/// Canonical literal rendering, parseable back by the statement parser
impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::String(s) => write_quoted(f, s),
            OptionValue::Integer(i) => write!(f, "{i}"),
            OptionValue::Float(v) => f.write_str(&format_float(*v)),
            OptionValue::Boolean(b) => write!(f, "{b}"),
            OptionValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            OptionValue::Object(map) => {
                let json = serde_json::to_string(map).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

impl Serialize for OptionValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::String(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::String(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Integer(value)
    }
}

impl From<i32> for OptionValue {
    fn from(value: i32) -> Self {
        OptionValue::Integer(i64::from(value))
    }
}

impl From<f64> for OptionValue {
    fn from(value: f64) -> Self {
        OptionValue::Float(value)
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Boolean(value)
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for ch in s.chars() {
        match ch {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            c => write!(f, "{c}")?,
        }
    }
    f.write_str("\"")
}

/// Float text that always reads back as a float
pub(crate) fn format_float(v: f64) -> String {
    let s = format!("{v}");
    if !v.is_finite() || s.contains(['.', 'e', 'E']) {
        s
    } else {
        format!("{s}.0")
    }
}

/// Column projection requested through the `columns` option
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Projection {
    /// `["*"]`: pass every column through unchanged
    #[default]
    All,
    /// Explicit projection and order list
    Columns(Vec<String>),
}

impl Projection {
    pub fn from_list<S: AsRef<str>>(items: &[S]) -> Result<Self, String> {
        if items.is_empty() {
            return Err("column list must not be empty".to_string());
        }
        if items.len() == 1 && items[0].as_ref() == "*" {
            return Ok(Projection::All);
        }
        let mut columns: Vec<String> = Vec::with_capacity(items.len());
        for item in items {
            let name = item.as_ref();
            if name == "*" {
                return Err("'*' cannot be combined with explicit columns".to_string());
            }
            if name.is_empty() {
                return Err("column names must not be empty".to_string());
            }
            if columns.iter().any(|c| c == name) {
                return Err(format!("duplicate column '{name}'"));
            }
            columns.push(name.to_string());
        }
        Ok(Projection::Columns(columns))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Projection::All)
    }

    pub fn columns(&self) -> Option<&[String]> {
        match self {
            Projection::All => None,
            Projection::Columns(cols) => Some(cols),
        }
    }
}

/// Validated options for one connector instance
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OptionsBag {
    kind: String,
    values: BTreeMap<String, OptionValue>,
}

impl OptionsBag {
    pub(crate) fn new(kind: impl Into<String>, values: BTreeMap<String, OptionValue>) -> Self {
        Self {
            kind: kind.into(),
            values,
        }
    }

    /// Connector kind these options were validated for
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(OptionValue::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(OptionValue::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(OptionValue::as_bool)
    }

    pub fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key)?
            .as_list()?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OptionValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    /// Projection from the `columns` option; absent means all columns
    pub fn projection(&self) -> Result<Projection, OptionsError> {
        match self.get_string_list(COLUMNS) {
            None => Ok(Projection::All),
            Some(items) => Projection::from_list(&items).map_err(|message| {
                OptionsError::InvalidValue {
                    kind: self.kind.clone(),
                    key: COLUMNS.to_string(),
                    message,
                }
            }),
        }
    }

    /// Deserialize a typed connector config and run its validation rules.
    pub fn deserialize<T>(&self) -> Result<T, OptionsError>
    where
        T: DeserializeOwned + Validate,
    {
        let config: T =
            serde_json::from_value(self.to_json()).map_err(|e| OptionsError::InvalidValue {
                kind: self.kind.clone(),
                key: "options".to_string(),
                message: e.to_string(),
            })?;

        config.validate().map_err(|errors| {
            let (field, message) = errors
                .field_errors()
                .into_iter()
                .next()
                .map(|(field, errs)| {
                    let message = errs
                        .first()
                        .map(|e| {
                            e.message
                                .as_ref()
                                .map(|m| m.to_string())
                                .unwrap_or_else(|| format!("failed '{}' check", e.code))
                        })
                        .unwrap_or_default();
                    (camel_case(&field), message)
                })
                .unwrap_or_else(|| ("options".to_string(), errors.to_string()));
            OptionsError::InvalidValue {
                kind: self.kind.clone(),
                key: field,
                message,
            }
        })?;

        Ok(config)
    }
}

/// `batch_size` -> `batchSize`
fn camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper = false;
    for ch in field.chars() {
        if ch == '_' {
            upper = true;
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

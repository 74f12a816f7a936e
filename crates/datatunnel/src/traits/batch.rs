//! Row batches exchanged between sources and sinks

use crate::error::{ConnectorError, ConnectorResult};
use crate::options::Projection;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Logical column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Null,
    Boolean,
    Int64,
    Float64,
    Utf8,
    /// Nested arrays/objects, or columns with conflicting value types
    Json,
}

impl DataType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => DataType::Null,
            Value::Bool(_) => DataType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => DataType::Int64,
            Value::Number(_) => DataType::Float64,
            Value::String(_) => DataType::Utf8,
            Value::Array(_) | Value::Object(_) => DataType::Json,
        }
    }

    /// Smallest type holding values of both `self` and `other`
    pub fn widen(self, other: DataType) -> DataType {
        match (self, other) {
            (a, b) if a == b => a,
            (DataType::Null, b) => b,
            (a, DataType::Null) => a,
            (DataType::Int64, DataType::Float64) | (DataType::Float64, DataType::Int64) => {
                DataType::Float64
            }
            _ => DataType::Json,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

/// Ordered column list of a batch
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Column indices selected by `projection`, in projection order
    pub fn project(&self, projection: &Projection) -> ConnectorResult<(Schema, Vec<usize>)> {
        match projection {
            Projection::All => Ok((self.clone(), (0..self.fields.len()).collect())),
            Projection::Columns(columns) => {
                let mut fields = Vec::with_capacity(columns.len());
                let mut indices = Vec::with_capacity(columns.len());
                for name in columns {
                    let idx = self.index_of(name).ok_or_else(|| {
                        ConnectorError::schema(format!(
                            "unknown column '{}' (available: {})",
                            name,
                            self.field_names().collect::<Vec<_>>().join(", ")
                        ))
                    })?;
                    fields.push(self.fields[idx].clone());
                    indices.push(idx);
                }
                Ok((Schema::new(fields), indices))
            }
        }
    }
}

/// A set of rows sharing one schema
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    schema: Arc<Schema>,
    rows: Vec<Vec<Value>>,
}

impl Batch {
    pub fn new(schema: Arc<Schema>, rows: Vec<Vec<Value>>) -> ConnectorResult<Self> {
        if let Some((idx, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != schema.len())
        {
            return Err(ConnectorError::schema(format!(
                "row {} has {} values, schema has {} columns",
                idx,
                row.len(),
                schema.len()
            )));
        }
        Ok(Self { schema, rows })
    }

    pub fn empty(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    /// Build a batch from JSON objects, inferring the schema.
    ///
    /// Columns appear in first-seen key order; keys missing from a record
    /// become nulls.
    pub fn from_records(records: Vec<Map<String, Value>>) -> Self {
        let mut fields: Vec<Field> = Vec::new();
        for record in &records {
            for (key, value) in record {
                let data_type = DataType::of(value);
                match fields.iter_mut().find(|f| &f.name == key) {
                    Some(field) => {
                        field.data_type = field.data_type.widen(data_type);
                        field.nullable |= value.is_null();
                    }
                    None => fields.push(Field::new(key.clone(), data_type, value.is_null())),
                }
            }
        }
        for field in &mut fields {
            if records.iter().any(|r| !r.contains_key(&field.name)) {
                field.nullable = true;
            }
        }

        let rows = records
            .into_iter()
            .map(|mut record| {
                fields
                    .iter()
                    .map(|f| record.remove(&f.name).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        Self {
            schema: Arc::new(Schema::new(fields)),
            rows,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Apply a column projection. Unknown column names are schema errors.
    pub fn project(&self, projection: &Projection) -> ConnectorResult<Batch> {
        if projection.is_all() {
            return Ok(self.clone());
        }
        let (schema, indices) = self.schema.project(projection)?;
        let rows = self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
            .collect();
        Ok(Batch {
            schema: Arc::new(schema),
            rows,
        })
    }

    /// Rows as ordered JSON objects
    pub fn to_records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.schema
                    .field_names()
                    .zip(row.iter())
                    .map(|(name, value)| (name.to_string(), value.clone()))
                    .collect()
            })
            .collect()
    }

    /// One JSON object per line
    pub fn to_json_lines(&self) -> ConnectorResult<Vec<u8>> {
        let mut out = Vec::new();
        for record in self.to_records() {
            serde_json::to_writer(&mut out, &record)?;
            out.push(b'\n');
        }
        Ok(out)
    }

    /// Split into batches of at most `size` rows
    pub fn chunks(self, size: usize) -> Vec<Batch> {
        let size = size.max(1);
        let schema = self.schema;
        let mut out = Vec::new();
        let mut rows = self.rows.into_iter().peekable();
        while rows.peek().is_some() {
            out.push(Batch {
                schema: schema.clone(),
                rows: rows.by_ref().take(size).collect(),
            });
        }
        out
    }
}

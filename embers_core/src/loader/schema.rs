//! Declared target schemas and record normalization.
//!
//! Records are validated against an explicit field list instead of inferring
//! structure from whatever the first response happens to contain. Violations
//! abort the run with `Error::DataShape`.

use crate::loader::models::{RawRecord, Watermark, json_kind, parse_timestamp};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Integer,
    Number,
    Boolean,
    Timestamp,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// What to do with source fields that are not declared.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownFieldPolicy {
    /// Drop them (Socrata adds computed-region columns without notice).
    #[default]
    Ignore,
    /// Treat them as a data-shape violation.
    Reject,
}

impl UnknownFieldPolicy {
    pub fn parse_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Some(Self::Ignore),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// Target table declaration: name, key, watermark field and typed columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Optional database schema (Postgres namespace).
    pub namespace: Option<String>,
    pub table: String,
    pub key_field: String,
    pub watermark_field: String,
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub unknown_fields: UnknownFieldPolicy,
}

impl TableSchema {
    #[tracing::instrument(level = "debug", skip(fields))]
    pub fn new(
        namespace: Option<String>,
        table: impl Into<String> + std::fmt::Debug,
        key_field: impl Into<String> + std::fmt::Debug,
        watermark_field: impl Into<String> + std::fmt::Debug,
        fields: Vec<FieldSpec>,
    ) -> Result<Self> {
        let schema = Self {
            namespace,
            table: table.into(),
            key_field: key_field.into(),
            watermark_field: watermark_field.into(),
            fields,
            unknown_fields: UnknownFieldPolicy::default(),
        };
        schema.validate()?;
        Ok(schema)
    }

    pub fn with_unknown_fields(mut self, policy: UnknownFieldPolicy) -> Self {
        self.unknown_fields = policy;
        self
    }

    pub fn with_namespace(mut self, namespace: Option<String>) -> Result<Self> {
        self.namespace = namespace;
        self.validate()?;
        Ok(self)
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Result<Self> {
        self.table = table.into();
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(ns) = &self.namespace {
            ensure_identifier("namespace", ns)?;
        }
        ensure_identifier("table", &self.table)?;
        if self.fields.is_empty() {
            return Err(Error::InvalidInput(format!(
                "table '{}' declares no fields",
                self.table
            )));
        }

        let mut seen = HashSet::new();
        for f in &self.fields {
            ensure_identifier("field", &f.name)?;
            if !seen.insert(f.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "field '{}' declared twice",
                    f.name
                )));
            }
        }

        match self.field_type(&self.key_field) {
            Some(FieldType::Text) => {}
            Some(other) => {
                return Err(Error::InvalidInput(format!(
                    "key field '{}' must be text, declared {other:?}",
                    self.key_field
                )));
            }
            None => {
                return Err(Error::InvalidInput(format!(
                    "key field '{}' is not declared",
                    self.key_field
                )));
            }
        }
        match self.field_type(&self.watermark_field) {
            Some(FieldType::Timestamp) => {}
            Some(other) => {
                return Err(Error::InvalidInput(format!(
                    "watermark field '{}' must be a timestamp, declared {other:?}",
                    self.watermark_field
                )));
            }
            None => {
                return Err(Error::InvalidInput(format!(
                    "watermark field '{}' is not declared",
                    self.watermark_field
                )));
            }
        }
        Ok(())
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.field_type)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// `namespace.table` or `table`; both parts are validated identifiers.
    pub fn qualified_table(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}.{}", self.table),
            None => self.table.clone(),
        }
    }

    /// Non-key columns, overwritten on conflict.
    pub fn update_columns(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.name != self.key_field)
    }
}

/// Plain SQL identifiers only: names are spliced into DDL and upserts.
fn ensure_identifier(what: &str, name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        _ => false,
    };
    if !valid || name.len() > 63 {
        return Err(Error::InvalidInput(format!(
            "{what} name {name:?} is not a plain identifier ([a-z_][a-z0-9_]*)"
        )));
    }
    Ok(())
}

/// A normalized column value. `Null` is explicit: "missing" is never stored as zero or NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// One normalized record, values aligned with `TableSchema::fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRow {
    pub id: String,
    pub loaded_at: DateTime<Utc>,
    pub values: Vec<FieldValue>,
}

impl TargetRow {
    pub fn value<'a>(&'a self, schema: &TableSchema, field: &str) -> Option<&'a FieldValue> {
        schema.column_index(field).and_then(|i| self.values.get(i))
    }

    pub fn watermark(&self) -> Watermark {
        Watermark::new(self.loaded_at)
    }
}

/// Normalize one record against the declared schema.
pub fn normalize_record(schema: &TableSchema, record: &RawRecord) -> Result<TargetRow> {
    if schema.unknown_fields == UnknownFieldPolicy::Reject {
        if let Some(extra) = record
            .payload()
            .keys()
            .find(|k| schema.field_type(k).is_none())
        {
            return Err(Error::DataShape(format!("undeclared field '{extra}'")));
        }
    }

    let mut values = Vec::with_capacity(schema.fields.len());
    for spec in &schema.fields {
        let raw = record.get(&spec.name).unwrap_or(&serde_json::Value::Null);
        let value = coerce(spec, raw)?;
        values.push(value);
    }

    let id = match schema.column_index(&schema.key_field).map(|i| &values[i]) {
        Some(FieldValue::Text(id)) if !id.trim().is_empty() => id.clone(),
        _ => {
            return Err(Error::DataShape(format!(
                "missing key field '{}'",
                schema.key_field
            )));
        }
    };
    let loaded_at = match schema
        .column_index(&schema.watermark_field)
        .map(|i| &values[i])
    {
        Some(FieldValue::Timestamp(ts)) => *ts,
        _ => {
            return Err(Error::DataShape(format!(
                "missing watermark field '{}' (id={id})",
                schema.watermark_field
            )));
        }
    };

    Ok(TargetRow {
        id,
        loaded_at,
        values,
    })
}

/// Normalize a fetched batch.
///
/// Fails on the first violating record. Rows sharing an `id` are collapsed to
/// the one with the greatest `loaded_at` (later position wins ties), so a single
/// upsert statement never touches the same key twice. Output keeps first-seen order.
#[tracing::instrument(level = "debug", skip_all, fields(table = %schema.table, records = records.len()))]
pub fn normalize_batch(schema: &TableSchema, records: &[RawRecord]) -> Result<Vec<TargetRow>> {
    let mut rows: Vec<TargetRow> = Vec::with_capacity(records.len());
    let mut by_id: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut duplicates = 0usize;

    for (idx, record) in records.iter().enumerate() {
        let row = normalize_record(schema, record)
            .map_err(|e| Error::DataShape(format!("record {idx}: {}", shape_message(e))))?;
        match by_id.get(&row.id) {
            Some(&pos) => {
                duplicates += 1;
                if row.loaded_at >= rows[pos].loaded_at {
                    rows[pos] = row;
                }
            }
            None => {
                by_id.insert(row.id.clone(), rows.len());
                rows.push(row);
            }
        }
    }

    if duplicates > 0 {
        tracing::warn!(duplicates, "collapsed duplicate ids within one fetch");
    }
    Ok(rows)
}

fn shape_message(e: Error) -> String {
    match e {
        Error::DataShape(msg) => msg,
        other => other.to_string(),
    }
}

fn is_null_sentinel(s: &str) -> bool {
    let s = s.trim();
    s.is_empty() || s.eq_ignore_ascii_case("nan") || s.eq_ignore_ascii_case("null")
}

fn mismatch(spec: &FieldSpec, raw: &serde_json::Value) -> Error {
    Error::DataShape(format!(
        "field '{}' expects {:?}, got {} {}",
        spec.name,
        spec.field_type,
        json_kind(raw),
        truncate(&raw.to_string(), 64)
    ))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{head}…")
    }
}

fn finite(v: f64) -> FieldValue {
    if v.is_finite() {
        FieldValue::Number(v)
    } else {
        FieldValue::Null
    }
}

fn coerce(spec: &FieldSpec, raw: &serde_json::Value) -> Result<FieldValue> {
    use serde_json::Value;

    if raw.is_null() {
        return Ok(FieldValue::Null);
    }

    match spec.field_type {
        FieldType::Json => Ok(FieldValue::Json(raw.clone())),
        FieldType::Text => match raw {
            Value::String(s) => Ok(FieldValue::Text(s.clone())),
            Value::Number(n) => Ok(FieldValue::Text(n.to_string())),
            Value::Bool(b) => Ok(FieldValue::Text(b.to_string())),
            _ => Err(mismatch(spec, raw)),
        },
        FieldType::Number => match raw {
            Value::Number(n) => Ok(n.as_f64().map(finite).unwrap_or(FieldValue::Null)),
            Value::String(s) if is_null_sentinel(s) => Ok(FieldValue::Null),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(finite)
                .map_err(|_| mismatch(spec, raw)),
            _ => Err(mismatch(spec, raw)),
        },
        FieldType::Integer => {
            let as_float = match raw {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        return Ok(FieldValue::Integer(i));
                    }
                    n.as_f64()
                }
                Value::String(s) if is_null_sentinel(s) => return Ok(FieldValue::Null),
                Value::String(s) => {
                    let t = s.trim();
                    if let Ok(i) = t.parse::<i64>() {
                        return Ok(FieldValue::Integer(i));
                    }
                    t.parse::<f64>().ok()
                }
                _ => None,
            };
            match as_float {
                Some(f) if !f.is_finite() => Ok(FieldValue::Null),
                Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => {
                    Ok(FieldValue::Integer(f as i64))
                }
                _ => Err(mismatch(spec, raw)),
            }
        }
        FieldType::Boolean => match raw {
            Value::Bool(b) => Ok(FieldValue::Boolean(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(FieldValue::Boolean(false)),
                Some(1) => Ok(FieldValue::Boolean(true)),
                _ => Err(mismatch(spec, raw)),
            },
            Value::String(s) if is_null_sentinel(s) => Ok(FieldValue::Null),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Ok(FieldValue::Boolean(true)),
                "false" | "f" | "no" | "n" | "0" => Ok(FieldValue::Boolean(false)),
                _ => Err(mismatch(spec, raw)),
            },
            _ => Err(mismatch(spec, raw)),
        },
        FieldType::Timestamp => match raw {
            Value::String(s) if s.trim().is_empty() => Ok(FieldValue::Null),
            Value::String(s) => parse_timestamp(s)
                .map(FieldValue::Timestamp)
                .ok_or_else(|| mismatch(spec, raw)),
            _ => Err(mismatch(spec, raw)),
        },
    }
}

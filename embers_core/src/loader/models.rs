use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Parse a source timestamp.
///
/// Accepts RFC 3339 (with offset) and naive ISO 8601 "floating" timestamps as
/// emitted by Socrata (`2024-03-01T08:15:00.000`), which are read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// The most recently ingested `loaded_at` value. Exclusive lower bound for the next fetch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(DateTime<Utc>);

impl Watermark {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(at)
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Parse a stored or operator-supplied watermark.
    pub fn parse(raw: &str) -> Result<Self> {
        parse_timestamp(raw)
            .map(Self)
            .ok_or_else(|| Error::InvalidInput(format!("invalid watermark timestamp: {raw:?}")))
    }

    /// Text form persisted in the run-state store (RFC 3339, UTC, lossless).
    pub fn to_storage_string(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    /// Naive UTC literal for filters against floating timestamp columns.
    pub fn to_floating_literal(&self) -> String {
        let naive = self.0.naive_utc();
        if naive.nanosecond() % 1_000_000 == 0 {
            naive.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
        } else {
            naive.format("%Y-%m-%dT%H:%M:%S%.9f").to_string()
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_storage_string())
    }
}

impl FromStr for Watermark {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<DateTime<Utc>> for Watermark {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}

/// A raw record pulled from a source: one JSON object, field names as the source emits them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord {
    payload: serde_json::Map<String, serde_json::Value>,
}

impl RawRecord {
    pub fn new(payload: serde_json::Map<String, serde_json::Value>) -> Self {
        Self { payload }
    }

    /// Wrap a JSON value; anything but an object is a data-shape error.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Object(payload) => Ok(Self { payload }),
            other => Err(Error::DataShape(format!(
                "source record must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.payload.get(field)
    }

    pub fn payload(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.payload
    }
}

pub(crate) fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// What a source is asked to return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchQuery {
    /// Complete history (no watermark yet, or a full refresh).
    All,
    /// Records whose `field` is strictly greater than `watermark`.
    After { field: String, watermark: Watermark },
}

impl FetchQuery {
    pub fn for_watermark(field: &str, watermark: Option<Watermark>) -> Self {
        match watermark {
            None => Self::All,
            Some(watermark) => Self::After {
                field: field.to_string(),
                watermark,
            },
        }
    }

    pub fn watermark(&self) -> Option<Watermark> {
        match self {
            Self::All => None,
            Self::After { watermark, .. } => Some(*watermark),
        }
    }
}

/// Result of one loader invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadOutcome {
    /// Watermark the loader was started with.
    pub previous: Option<Watermark>,
    /// Max `loaded_at` over written rows; `None` when nothing was written.
    pub watermark: Option<Watermark>,
    pub records_fetched: u64,
    pub rows_written: u64,
}

impl LoadOutcome {
    pub fn unchanged(previous: Option<Watermark>, records_fetched: u64) -> Self {
        Self {
            previous,
            watermark: None,
            records_fetched,
            rows_written: 0,
        }
    }

    pub fn advanced(&self) -> bool {
        self.watermark.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunTrigger {
    /// Continue from the stored watermark.
    Incremental,
    /// Ignore the stored watermark and fetch complete history.
    FullRefresh,
    /// Fetch records strictly after an operator-supplied timestamp.
    Backfill { since: Watermark },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadRunStatus {
    Running,
    Succeeded,
    Failed,
}

impl LoadRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A single load execution record (durable, queryable).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRun {
    pub run_id: Uuid,
    /// Run-state key of the pipeline (also the watermark key).
    pub pipeline: String,
    pub trigger: RunTrigger,
    pub status: LoadRunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub watermark_before: Option<Watermark>,
    pub watermark_after: Option<Watermark>,
    pub records_fetched: u64,
    pub rows_written: u64,
    pub error_message: Option<String>,
}

impl LoadRun {
    #[tracing::instrument(level = "debug")]
    pub fn new_running(
        pipeline: impl Into<String> + std::fmt::Debug,
        trigger: RunTrigger,
        started_at: DateTime<Utc>,
    ) -> Result<Self> {
        let pipeline = pipeline.into();
        if pipeline.trim().is_empty() {
            return Err(Error::InvalidInput("pipeline key is empty".to_string()));
        }
        Ok(Self {
            run_id: Uuid::new_v4(),
            pipeline,
            trigger,
            status: LoadRunStatus::Running,
            started_at,
            finished_at: None,
            watermark_before: None,
            watermark_after: None,
            records_fetched: 0,
            rows_written: 0,
            error_message: None,
        })
    }

    pub fn succeed(&mut self, outcome: &LoadOutcome, committed: Option<Watermark>) {
        self.status = LoadRunStatus::Succeeded;
        self.finished_at = Some(Utc::now());
        self.records_fetched = outcome.records_fetched;
        self.rows_written = outcome.rows_written;
        self.watermark_after = committed;
        self.error_message = None;
    }

    pub fn fail(&mut self, error: &Error) {
        self.status = LoadRunStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error_message = Some(error.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRunQuery {
    pub pipeline: Option<String>,
    pub status: Option<LoadRunStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for LoadRunQuery {
    fn default() -> Self {
        Self {
            pipeline: None,
            status: None,
            limit: 100,
            offset: 0,
        }
    }
}

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::loader::models::{FetchQuery, RawRecord, parse_timestamp};
use crate::loader::traits::RecordSource;
use crate::{Error, Result};

/// In-memory RecordSource for fixtures, dry runs and file imports.
///
/// Honors `FetchQuery::After` with a strict greater-than comparison. Records
/// whose watermark field cannot be parsed are always returned so that
/// normalization rejects them loudly instead of them being skipped here.
#[derive(Clone, Default)]
pub struct MemorySource {
    name: String,
    records: Arc<Mutex<Vec<RawRecord>>>,
    queries: Arc<Mutex<Vec<FetchQuery>>>,
    fail_next: Arc<Mutex<Option<String>>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, records: Vec<RawRecord>) -> Self {
        Self {
            name: name.into(),
            records: Arc::new(Mutex::new(records)),
            ..Default::default()
        }
    }

    /// Load a JSON array of objects (e.g. a saved API export).
    #[tracing::instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::source_err(format!("read {}", path.display()), e))?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| Error::DataShape(format!("{}: invalid json: {e}", path.display())))?;
        let items = match value {
            serde_json::Value::Array(items) => items,
            _ => {
                return Err(Error::DataShape(format!(
                    "{}: expected a JSON array of records",
                    path.display()
                )));
            }
        };
        let records = items
            .into_iter()
            .map(RawRecord::from_value)
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(records = records.len(), "loaded records from file");
        Ok(Self::new(format!("file:{}", path.display()), records))
    }

    pub async fn push(&self, record: RawRecord) {
        self.records.lock().await.push(record);
    }

    /// Replace a record with the same value in `key_field`, or append it.
    pub async fn replace(&self, key_field: &str, record: RawRecord) {
        let mut records = self.records.lock().await;
        let key = record.get(key_field).cloned();
        match records
            .iter_mut()
            .find(|r| key.is_some() && r.get(key_field) == key.as_ref())
        {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    /// Make the next fetch fail with a transient source error.
    pub async fn fail_next_fetch(&self, message: impl Into<String>) {
        *self.fail_next.lock().await = Some(message.into());
    }

    /// Every query received so far, in order.
    pub async fn queries(&self) -> Vec<FetchQuery> {
        self.queries.lock().await.clone()
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, query: &FetchQuery) -> Result<Vec<RawRecord>> {
        self.queries.lock().await.push(query.clone());
        if let Some(message) = self.fail_next.lock().await.take() {
            return Err(Error::SourceMessage(message));
        }

        let records = self.records.lock().await;
        let out = match query {
            FetchQuery::All => records.clone(),
            FetchQuery::After { field, watermark } => records
                .iter()
                .filter(|r| {
                    match r.get(field).and_then(|v| v.as_str()).and_then(parse_timestamp) {
                        Some(ts) => ts > watermark.as_datetime(),
                        None => true,
                    }
                })
                .cloned()
                .collect(),
        };
        Ok(out)
    }
}

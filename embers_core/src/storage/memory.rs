use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::loader::models::{LoadRun, LoadRunQuery, LoadRunStatus, Watermark};
use crate::loader::schema::{TableSchema, TargetRow};
use crate::storage::traits::{StateStore, TargetStore};
use crate::{Error, Result};

type Table = BTreeMap<String, TargetRow>;

/// In-memory TargetStore for local dry runs and tests.
///
/// Writes are staged on a copy of the table and swapped in only after every
/// chunk applied, mirroring the single-transaction contract of the SQL stores.
/// Failures can be injected per chunk index (single-shot).
#[derive(Clone, Default)]
pub struct MemoryTargetStore {
    tables: Arc<Mutex<HashMap<String, Table>>>,
    fail_on_chunk: Arc<Mutex<HashSet<usize>>>,
    chunks_applied: Arc<AtomicUsize>,
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the chunk with this 0-based index on the next `upsert_rows` call that reaches it.
    pub async fn fail_on_chunk(&self, index: usize) {
        self.fail_on_chunk.lock().await.insert(index);
    }

    /// Total chunks applied to staging across all calls (including rolled-back ones).
    pub fn chunks_applied(&self) -> usize {
        self.chunks_applied.load(Ordering::SeqCst)
    }

    /// Snapshot of committed rows ordered by key.
    pub async fn rows(&self, schema: &TableSchema) -> Vec<TargetRow> {
        self.tables
            .lock()
            .await
            .get(&schema.qualified_table())
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn row(&self, schema: &TableSchema, id: &str) -> Option<TargetRow> {
        self.tables
            .lock()
            .await
            .get(&schema.qualified_table())
            .and_then(|t| t.get(id).cloned())
    }

    pub async fn table_exists(&self, schema: &TableSchema) -> bool {
        self.tables
            .lock()
            .await
            .contains_key(&schema.qualified_table())
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn ensure_table(&self, schema: &TableSchema) -> Result<()> {
        self.tables
            .lock()
            .await
            .entry(schema.qualified_table())
            .or_default();
        Ok(())
    }

    async fn upsert_rows(
        &self,
        schema: &TableSchema,
        rows: &[TargetRow],
        chunk_size: usize,
    ) -> Result<u64> {
        if chunk_size == 0 {
            return Err(Error::InvalidInput("chunk_size must be > 0".to_string()));
        }
        let name = schema.qualified_table();
        let mut tables = self.tables.lock().await;
        let mut staged = tables
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::StoreMessage(format!("table '{name}' does not exist")))?;

        for (index, chunk) in rows.chunks(chunk_size).enumerate() {
            if self.fail_on_chunk.lock().await.remove(&index) {
                return Err(Error::StoreMessage(format!(
                    "injected write failure on chunk {index}"
                )));
            }
            for row in chunk {
                staged.insert(row.id.clone(), row.clone());
            }
            self.chunks_applied.fetch_add(1, Ordering::SeqCst);
        }

        tables.insert(name, staged);
        Ok(rows.len() as u64)
    }
}

/// In-memory StateStore. Values are kept as text, like the SQL stores.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    values: Arc<Mutex<HashMap<String, String>>>,
    runs: Arc<Mutex<Vec<LoadRun>>>,
    fail_reads: Arc<AtomicBool>,
    fail_watermark_writes: Arc<AtomicBool>,
    fail_success_records: Arc<AtomicBool>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw value, bypassing validation (simulates legacy or corrupt state).
    pub async fn put_raw(&self, key: &str, value: &str) {
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_watermark_writes(&self, fail: bool) {
        self.fail_watermark_writes.store(fail, Ordering::SeqCst);
    }

    /// Reject run records marked succeeded; failed ones still land.
    pub fn set_fail_success_records(&self, fail: bool) {
        self.fail_success_records.store(fail, Ordering::SeqCst);
    }

    pub async fn all_runs(&self) -> Vec<LoadRun> {
        self.runs.lock().await.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_watermark(&self, key: &str) -> Result<Option<Watermark>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::StateMessage("run state unavailable".to_string()));
        }
        let values = self.values.lock().await;
        match values.get(key) {
            None => Ok(None),
            Some(raw) => Watermark::parse(raw).map(Some).map_err(|_| {
                Error::StateMessage(format!("stored watermark '{key}' is corrupt: {raw:?}"))
            }),
        }
    }

    async fn put_watermark(&self, key: &str, watermark: Watermark) -> Result<()> {
        if self.fail_watermark_writes.load(Ordering::SeqCst) {
            return Err(Error::StateMessage(
                "run state rejected watermark write".to_string(),
            ));
        }
        self.values
            .lock()
            .await
            .insert(key.to_string(), watermark.to_storage_string());
        Ok(())
    }

    async fn delete_watermark(&self, key: &str) -> Result<()> {
        self.values.lock().await.remove(key);
        Ok(())
    }

    async fn upsert_load_run(&self, run: &LoadRun) -> Result<()> {
        if run.status == LoadRunStatus::Succeeded
            && self.fail_success_records.load(Ordering::SeqCst)
        {
            return Err(Error::StateMessage(
                "run state rejected run record".to_string(),
            ));
        }
        let mut runs = self.runs.lock().await;
        match runs.iter_mut().find(|r| r.run_id == run.run_id) {
            Some(existing) => *existing = run.clone(),
            None => runs.push(run.clone()),
        }
        Ok(())
    }

    async fn list_load_runs(&self, query: LoadRunQuery) -> Result<Vec<LoadRun>> {
        let runs = self.runs.lock().await;
        let mut out: Vec<LoadRun> = runs
            .iter()
            .filter(|r| query.pipeline.as_deref().is_none_or(|p| r.pipeline == p))
            .filter(|r| query.status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(out
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }
}

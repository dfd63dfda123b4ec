use crate::Result;
use crate::loader::models::{LoadRun, LoadRunQuery, Watermark};
use crate::loader::schema::{TableSchema, TargetRow};
use async_trait::async_trait;

/// Outbound table store keyed by the schema's primary key.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Create the target table if it does not exist (idempotent).
    async fn ensure_table(&self, schema: &TableSchema) -> Result<()>;

    /// Insert-or-replace every row, keyed by `schema.key_field`.
    ///
    /// Existing rows are fully replaced (all non-key columns overwritten).
    /// Rows are written in chunks of at most `chunk_size`, but the call is
    /// all-or-nothing: if any chunk fails, no row of this call is visible.
    /// Returns the number of rows written.
    async fn upsert_rows(
        &self,
        schema: &TableSchema,
        rows: &[TargetRow],
        chunk_size: usize,
    ) -> Result<u64>;
}

/// Durable run state: watermarks by key plus load-run history.
///
/// Errors from implementations must be `Error::State*` so a run never mistakes
/// an unreadable watermark for an absent one.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_watermark(&self, key: &str) -> Result<Option<Watermark>>;
    /// Replace the stored value atomically.
    async fn put_watermark(&self, key: &str, watermark: Watermark) -> Result<()>;
    async fn delete_watermark(&self, key: &str) -> Result<()>;

    async fn upsert_load_run(&self, run: &LoadRun) -> Result<()>;
    /// Newest first.
    async fn list_load_runs(&self, query: LoadRunQuery) -> Result<Vec<LoadRun>>;
}

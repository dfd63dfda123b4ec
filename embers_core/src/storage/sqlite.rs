//! SQLite-backed target table and run-state store.
//!
//! Single-file WAL database for local runs and small deployments. Timestamps
//! and run ids are stored as text; timestamps use a fixed-width RFC 3339 form
//! so that text ordering matches time ordering.
//!
//! ```ignore
//! let store = SqliteStore::open("/var/lib/embers/incidents.db").await?;
//! ```

use crate::loader::models::{LoadRun, LoadRunQuery, LoadRunStatus, RunTrigger, Watermark};
use crate::loader::schema::{FieldType, FieldValue, TableSchema, TargetRow};
use crate::storage::traits::{StateStore, TargetStore};
use crate::storage::{
    insert_prefix, on_conflict_replace, quote_ident, rows_per_statement,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::query_builder::Separated;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

/// SQLite allows at most 32766 host parameters per statement.
const MAX_BIND_PARAMS: usize = 32_766;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS embers_pipeline_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS embers_load_runs (
    run_id TEXT PRIMARY KEY,
    pipeline TEXT NOT NULL,
    run_trigger TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    watermark_before TEXT,
    watermark_after TEXT,
    records_fetched INTEGER NOT NULL DEFAULT 0,
    rows_written INTEGER NOT NULL DEFAULT 0,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS embers_load_runs_pipeline_started_idx
    ON embers_load_runs(pipeline, started_at DESC);
"#;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create (or open) a store at the given file path, creating parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::backend("create sqlite directory", e))?;
        }
        Self::connect(&format!("sqlite://{}", path.display())).await
    }

    /// Connect with a `sqlite:` URL. `sqlite::memory:` gives a private in-memory store.
    pub async fn connect(url: &str) -> Result<Self> {
        if url.contains(":memory:") {
            return Self::in_memory().await;
        }
        let opts = SqliteConnectOptions::from_str(url)
            .map_err(|e| Error::backend("parse sqlite url", e))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| Error::backend("open sqlite", e))?;
        Self::with_pool(pool).await
    }

    /// In-memory store on a single pinned connection (each connection would get its own database).
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::backend("parse sqlite url", e))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(|e| Error::backend("open sqlite", e))?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| Error::backend("sqlite migration", e))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn load_run_from_row(row: &SqliteRow) -> Result<LoadRun> {
        let run_id: String = get(row, "run_id")?;
        let trigger: String = get(row, "run_trigger")?;
        let status: String = get(row, "status")?;
        let started_at: String = get(row, "started_at")?;
        let finished_at: Option<String> = get(row, "finished_at")?;

        Ok(LoadRun {
            run_id: Uuid::parse_str(&run_id).map_err(|e| Error::state_err("run_id", e))?,
            pipeline: get(row, "pipeline")?,
            trigger: serde_json::from_str::<RunTrigger>(&trigger)
                .map_err(|e| Error::state_err("deserialize run trigger", e))?,
            status: LoadRunStatus::parse_str(&status).ok_or_else(|| {
                Error::StateMessage(format!("invalid load run status in db: {status}"))
            })?,
            started_at: parse_time(&started_at)?,
            finished_at: finished_at.as_deref().map(parse_time).transpose()?,
            watermark_before: stored_watermark(get(row, "watermark_before")?)?,
            watermark_after: stored_watermark(get(row, "watermark_after")?)?,
            records_fetched: get::<i64>(row, "records_fetched")?.max(0) as u64,
            rows_written: get::<i64>(row, "rows_written")?.max(0) as u64,
            error_message: get(row, "error_message")?,
        })
    }
}

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(column)
        .map_err(|e| Error::state_err(column.to_string(), e))
}

fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::state_err(format!("timestamp {raw:?}"), e))
}

fn stored_watermark(raw: Option<String>) -> Result<Option<Watermark>> {
    raw.map(|s| {
        Watermark::parse(&s)
            .map_err(|_| Error::StateMessage(format!("stored watermark is corrupt: {s:?}")))
    })
    .transpose()
}

fn sqlite_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Text | FieldType::Timestamp | FieldType::Json => "TEXT",
        FieldType::Integer | FieldType::Boolean => "INTEGER",
        FieldType::Number => "REAL",
    }
}

fn push_value(
    b: &mut Separated<'_, '_, Sqlite, &'static str>,
    field_type: FieldType,
    value: &FieldValue,
) {
    match value {
        FieldValue::Text(v) => b.push_bind(v.clone()),
        FieldValue::Integer(v) => b.push_bind(*v),
        FieldValue::Number(v) => b.push_bind(*v),
        FieldValue::Boolean(v) => b.push_bind(*v),
        FieldValue::Timestamp(v) => b.push_bind(format_time(*v)),
        FieldValue::Json(v) => b.push_bind(v.to_string()),
        FieldValue::Null => match field_type {
            FieldType::Integer | FieldType::Boolean => b.push_bind(None::<i64>),
            FieldType::Number => b.push_bind(None::<f64>),
            FieldType::Text | FieldType::Timestamp | FieldType::Json => {
                b.push_bind(None::<String>)
            }
        },
    };
}

#[async_trait]
impl TargetStore for SqliteStore {
    #[tracing::instrument(level = "debug", skip_all, fields(table = %schema.table))]
    async fn ensure_table(&self, schema: &TableSchema) -> Result<()> {
        let table = quote_ident(&schema.table);
        let columns = schema
            .fields
            .iter()
            .map(|f| {
                let key = if f.name == schema.key_field {
                    " NOT NULL PRIMARY KEY"
                } else {
                    ""
                };
                format!("{} {}{key}", quote_ident(&f.name), sqlite_type(f.field_type))
            })
            .collect::<Vec<_>>()
            .join(",\n  ");
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n  {columns}\n);\nCREATE INDEX IF NOT EXISTS {} ON {table} ({});\n",
            quote_ident(&format!("{}_{}_idx", schema.table, schema.watermark_field)),
            quote_ident(&schema.watermark_field)
        );
        sqlx::raw_sql(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::store_err(format!("create table {table}"), e))?;
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all, fields(table = %schema.table, rows = rows.len()))]
    async fn upsert_rows(
        &self,
        schema: &TableSchema,
        rows: &[TargetRow],
        chunk_size: usize,
    ) -> Result<u64> {
        if chunk_size == 0 {
            return Err(Error::InvalidInput("chunk_size must be > 0".to_string()));
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let table = quote_ident(&schema.table);
        let prefix = insert_prefix(&table, schema);
        let conflict = on_conflict_replace(schema);
        let per_statement = rows_per_statement(chunk_size, schema.fields.len(), MAX_BIND_PARAMS);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::store_err("begin upsert transaction", e))?;

        for (index, chunk) in rows.chunks(per_statement).enumerate() {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(&prefix);
            qb.push_values(chunk, |mut b, row| {
                for (spec, value) in schema.fields.iter().zip(&row.values) {
                    push_value(&mut b, spec.field_type, value);
                }
            });
            qb.push(&conflict);
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::store_err(format!("upsert chunk {index} into {table}"), e))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::store_err(format!("commit upsert into {table}"), e))?;
        Ok(rows.len() as u64)
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_watermark(&self, key: &str) -> Result<Option<Watermark>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM embers_pipeline_state WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| Error::state_err(format!("read watermark '{key}'"), e))?;
        stored_watermark(value)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn put_watermark(&self, key: &str, watermark: Watermark) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embers_pipeline_state (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (key) DO UPDATE
              SET value = excluded.value,
                  updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(watermark.to_storage_string())
        .bind(format_time(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::state_err(format!("write watermark '{key}'"), e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_watermark(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM embers_pipeline_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::state_err(format!("delete watermark '{key}'"), e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, run), fields(run_id = %run.run_id))]
    async fn upsert_load_run(&self, run: &LoadRun) -> Result<()> {
        let trigger = serde_json::to_string(&run.trigger)
            .map_err(|e| Error::state_err("serialize run trigger", e))?;

        sqlx::query(
            r#"
            INSERT INTO embers_load_runs (
              run_id, pipeline, run_trigger, status, started_at, finished_at,
              watermark_before, watermark_after, records_fetched, rows_written, error_message
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (run_id) DO UPDATE
              SET status = excluded.status,
                  finished_at = excluded.finished_at,
                  watermark_before = excluded.watermark_before,
                  watermark_after = excluded.watermark_after,
                  records_fetched = excluded.records_fetched,
                  rows_written = excluded.rows_written,
                  error_message = excluded.error_message
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.pipeline)
        .bind(trigger)
        .bind(run.status.as_str())
        .bind(format_time(run.started_at))
        .bind(run.finished_at.map(format_time))
        .bind(run.watermark_before.map(|w| w.to_storage_string()))
        .bind(run.watermark_after.map(|w| w.to_storage_string()))
        .bind(run.records_fetched as i64)
        .bind(run.rows_written as i64)
        .bind(&run.error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::state_err("upsert load run", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_load_runs(&self, query: LoadRunQuery) -> Result<Vec<LoadRun>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT run_id, pipeline, run_trigger, status, started_at, finished_at, watermark_before, watermark_after, records_fetched, rows_written, error_message FROM embers_load_runs WHERE 1 = 1",
        );
        if let Some(pipeline) = query.pipeline.as_deref() {
            qb.push(" AND pipeline = ").push_bind(pipeline);
        }
        if let Some(status) = query.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        qb.push(" ORDER BY started_at DESC LIMIT ")
            .push_bind(query.limit as i64)
            .push(" OFFSET ")
            .push_bind(query.offset as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::state_err("list load runs", e))?;

        rows.iter().map(Self::load_run_from_row).collect()
    }
}

use crate::config::DatabaseConfig;
use crate::loader::models::{LoadRun, LoadRunQuery, LoadRunStatus, RunTrigger, Watermark};
use crate::loader::schema::{FieldType, FieldValue, TableSchema, TargetRow};
use crate::storage::traits::{StateStore, TargetStore};
use crate::storage::{
    insert_prefix, on_conflict_replace, quote_ident, quoted_table, rows_per_statement,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::query_builder::Separated;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

const MIGRATION_0001: &str = include_str!("../../migrations/0001_init.sql");

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

/// Postgres-backed target table and run-state store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    #[tracing::instrument(level = "debug", skip(cfg))]
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(cfg.acquire_timeout)
            .connect(&cfg.url)
            .await
            .map_err(|e| Error::backend("connect postgres", e))?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply run-state migrations (idempotent).
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(MIGRATION_0001)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::backend("apply migrations", e))?;
        Ok(())
    }

    fn load_run_from_row(row: &PgRow) -> Result<LoadRun> {
        let trigger: serde_json::Value = get(row, "run_trigger")?;
        let trigger: RunTrigger = serde_json::from_value(trigger)
            .map_err(|e| Error::state_err("deserialize run trigger", e))?;

        let status_str: String = get(row, "status")?;
        let status = LoadRunStatus::parse_str(&status_str).ok_or_else(|| {
            Error::StateMessage(format!("invalid load run status in db: {status_str}"))
        })?;

        Ok(LoadRun {
            run_id: get::<Uuid>(row, "run_id")?,
            pipeline: get(row, "pipeline")?,
            trigger,
            status,
            started_at: get::<DateTime<Utc>>(row, "started_at")?,
            finished_at: get::<Option<DateTime<Utc>>>(row, "finished_at")?,
            watermark_before: stored_watermark(get(row, "watermark_before")?)?,
            watermark_after: stored_watermark(get(row, "watermark_after")?)?,
            records_fetched: get::<i64>(row, "records_fetched")?.max(0) as u64,
            rows_written: get::<i64>(row, "rows_written")?.max(0) as u64,
            error_message: get(row, "error_message")?,
        })
    }
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| Error::state_err(column.to_string(), e))
}

fn stored_watermark(raw: Option<String>) -> Result<Option<Watermark>> {
    raw.map(|s| {
        Watermark::parse(&s)
            .map_err(|_| Error::StateMessage(format!("stored watermark is corrupt: {s:?}")))
    })
    .transpose()
}

fn pg_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Text => "TEXT",
        FieldType::Integer => "BIGINT",
        FieldType::Number => "DOUBLE PRECISION",
        FieldType::Boolean => "BOOLEAN",
        FieldType::Timestamp => "TIMESTAMPTZ",
        FieldType::Json => "JSONB",
    }
}

/// Bind one value; nulls are bound with the column's type so Postgres can infer the parameter.
fn push_value(
    b: &mut Separated<'_, '_, Postgres, &'static str>,
    field_type: FieldType,
    value: &FieldValue,
) {
    match value {
        FieldValue::Text(v) => b.push_bind(v.clone()),
        FieldValue::Integer(v) => b.push_bind(*v),
        FieldValue::Number(v) => b.push_bind(*v),
        FieldValue::Boolean(v) => b.push_bind(*v),
        FieldValue::Timestamp(v) => b.push_bind(*v),
        FieldValue::Json(v) => b.push_bind(Json(v.clone())),
        FieldValue::Null => match field_type {
            FieldType::Text => b.push_bind(None::<String>),
            FieldType::Integer => b.push_bind(None::<i64>),
            FieldType::Number => b.push_bind(None::<f64>),
            FieldType::Boolean => b.push_bind(None::<bool>),
            FieldType::Timestamp => b.push_bind(None::<DateTime<Utc>>),
            FieldType::Json => b.push_bind(None::<Json<serde_json::Value>>),
        },
    };
}

#[async_trait]
impl TargetStore for PostgresStore {
    #[tracing::instrument(level = "debug", skip_all, fields(table = %schema.qualified_table()))]
    async fn ensure_table(&self, schema: &TableSchema) -> Result<()> {
        let table = quoted_table(schema);
        let columns = schema
            .fields
            .iter()
            .map(|f| {
                let key = if f.name == schema.key_field {
                    " NOT NULL PRIMARY KEY"
                } else {
                    ""
                };
                format!("{} {}{key}", quote_ident(&f.name), pg_type(f.field_type))
            })
            .collect::<Vec<_>>()
            .join(",\n  ");

        let mut ddl = String::new();
        if let Some(ns) = &schema.namespace {
            ddl.push_str(&format!("CREATE SCHEMA IF NOT EXISTS {};\n", quote_ident(ns)));
        }
        ddl.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n  {columns}\n);\n"
        ));
        ddl.push_str(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {table} ({});\n",
            quote_ident(&format!("{}_{}_idx", schema.table, schema.watermark_field)),
            quote_ident(&schema.watermark_field)
        ));

        sqlx::raw_sql(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::store_err(format!("create table {table}"), e))?;
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all, fields(table = %schema.qualified_table(), rows = rows.len()))]
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

        let table = quoted_table(schema);
        let prefix = insert_prefix(&table, schema);
        let conflict = on_conflict_replace(schema);
        let per_statement = rows_per_statement(chunk_size, schema.fields.len(), MAX_BIND_PARAMS);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::store_err("begin upsert transaction", e))?;

        for (index, chunk) in rows.chunks(per_statement).enumerate() {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(&prefix);
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
            tracing::debug!(chunk = index, rows = chunk.len(), "chunk staged");
        }

        tx.commit()
            .await
            .map_err(|e| Error::store_err(format!("commit upsert into {table}"), e))?;
        Ok(rows.len() as u64)
    }
}

#[async_trait]
impl StateStore for PostgresStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_watermark(&self, key: &str) -> Result<Option<Watermark>> {
        let row = sqlx::query("SELECT value FROM embers_pipeline_state WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::state_err(format!("read watermark '{key}'"), e))?;
        match row {
            None => Ok(None),
            Some(row) => stored_watermark(Some(get(&row, "value")?)),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn put_watermark(&self, key: &str, watermark: Watermark) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embers_pipeline_state (key, value, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (key) DO UPDATE
              SET value = EXCLUDED.value,
                  updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(key)
        .bind(watermark.to_storage_string())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::state_err(format!("write watermark '{key}'"), e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_watermark(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM embers_pipeline_state WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::state_err(format!("delete watermark '{key}'"), e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, run), fields(run_id = %run.run_id))]
    async fn upsert_load_run(&self, run: &LoadRun) -> Result<()> {
        let trigger = serde_json::to_value(&run.trigger)
            .map_err(|e| Error::state_err("serialize run trigger", e))?;

        sqlx::query(
            r#"
            INSERT INTO embers_load_runs (
              run_id, pipeline, run_trigger, status, started_at, finished_at,
              watermark_before, watermark_after, records_fetched, rows_written, error_message
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
            ON CONFLICT (run_id) DO UPDATE
              SET status = EXCLUDED.status,
                  finished_at = EXCLUDED.finished_at,
                  watermark_before = EXCLUDED.watermark_before,
                  watermark_after = EXCLUDED.watermark_after,
                  records_fetched = EXCLUDED.records_fetched,
                  rows_written = EXCLUDED.rows_written,
                  error_message = EXCLUDED.error_message
            "#,
        )
        .bind(run.run_id)
        .bind(&run.pipeline)
        .bind(trigger)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
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
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT run_id, pipeline, run_trigger, status, started_at, finished_at, watermark_before, watermark_after, records_fetched, rows_written, error_message FROM embers_load_runs WHERE TRUE",
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

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(Self::load_run_from_row(&r)?);
        }
        Ok(out)
    }
}

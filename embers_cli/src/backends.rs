//! Backend selection: Postgres or SQLite by URL scheme, plus pipeline wiring.

use embers_core::config::{DatabaseConfig, EmbersConfig};
use embers_core::incidents::fire_incidents_schema;
use embers_core::loader::engine::{IncrementalLoader, LoadPipeline};
use embers_core::loader::handoff::CommandHandoff;
use embers_core::loader::memory::MemorySource;
use embers_core::loader::schema::TableSchema;
use embers_core::loader::traits::RecordSource;
use embers_core::storage::postgres::PostgresStore;
use embers_core::storage::sqlite::SqliteStore;
use embers_core::storage::traits::{StateStore, TargetStore};
use embers_core::{Error, Result};
use embers_integrations::sources::socrata::SocrataSource;
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub enum Store {
    Postgres(PostgresStore),
    Sqlite(SqliteStore),
}

impl Store {
    #[tracing::instrument(level = "debug", skip(cfg))]
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self> {
        let url = cfg.url.trim();
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            let store = PostgresStore::connect(cfg).await?;
            store.migrate().await?;
            Ok(Self::Postgres(store))
        } else if url.starts_with("sqlite:") {
            Ok(Self::Sqlite(SqliteStore::connect(url).await?))
        } else {
            Err(Error::InvalidInput(format!(
                "unsupported database url scheme: {}",
                embers_core::config::redact_url(url)
            )))
        }
    }

    pub fn target(&self) -> Arc<dyn TargetStore> {
        match self {
            Self::Postgres(s) => Arc::new(s.clone()),
            Self::Sqlite(s) => Arc::new(s.clone()),
        }
    }

    pub fn state(&self) -> Arc<dyn StateStore> {
        match self {
            Self::Postgres(s) => Arc::new(s.clone()),
            Self::Sqlite(s) => Arc::new(s.clone()),
        }
    }
}

/// Target and run-state stores; one connection pool when both URLs match.
pub struct Stores {
    pub target: Arc<dyn TargetStore>,
    pub state: Arc<dyn StateStore>,
}

impl Stores {
    pub async fn connect(cfg: &EmbersConfig) -> Result<Self> {
        let target = Store::connect(&cfg.target_db).await?;
        let state = if cfg.state_db.url == cfg.target_db.url {
            target.clone()
        } else {
            Store::connect(&cfg.state_db).await?
        };
        Ok(Self {
            target: target.target(),
            state: state.state(),
        })
    }

    pub async fn state_only(cfg: &EmbersConfig) -> Result<Arc<dyn StateStore>> {
        Ok(Store::connect(&cfg.state_db).await?.state())
    }
}

/// The fire incidents schema with configured placement and unknown-field policy.
pub fn target_schema(cfg: &EmbersConfig) -> Result<TableSchema> {
    Ok(fire_incidents_schema()?
        .with_namespace(cfg.loader.namespace.clone())?
        .with_table(cfg.loader.table.clone())?
        .with_unknown_fields(cfg.loader.unknown_fields))
}

#[tracing::instrument(level = "info", skip(cfg, stores))]
pub async fn build_pipeline(
    cfg: &EmbersConfig,
    stores: &Stores,
    from_file: Option<&Path>,
) -> Result<LoadPipeline> {
    let source: Arc<dyn RecordSource> = match from_file {
        Some(path) => Arc::new(MemorySource::from_json_file(path).await?),
        None => Arc::new(SocrataSource::new(&cfg.socrata)?),
    };
    let loader = IncrementalLoader::new(
        source,
        stores.target.clone(),
        target_schema(cfg)?,
        cfg.loader.chunk_size,
    )?;
    let mut pipeline =
        LoadPipeline::new(loader, stores.state.clone(), cfg.loader.watermark_key.clone())?;
    if let Some(h) = &cfg.handoff {
        let handoff = CommandHandoff::new(h.command.clone(), h.working_dir.clone())?;
        tracing::info!(program = handoff.program(), "downstream handoff configured");
        pipeline = pipeline.with_handoff(Arc::new(handoff));
    }
    Ok(pipeline)
}

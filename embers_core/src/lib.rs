//! Embers core library: incremental load engine, run state and storage backends.

pub mod config;
pub mod error;
pub mod incidents;
pub mod loader;
pub mod o11y;
pub mod storage;

pub use config::{DatabaseConfig, EmbersConfig, HandoffConfig, LoaderConfig, SocrataConfig};
pub use error::{Error, Result};
pub use loader::engine::{DEFAULT_CHUNK_SIZE, IncrementalLoader, LoadPipeline};
pub use loader::handoff::CommandHandoff;
pub use loader::memory::MemorySource;
pub use loader::models::{
    FetchQuery, LoadOutcome, LoadRun, LoadRunQuery, LoadRunStatus, RawRecord, RunTrigger,
    Watermark, parse_timestamp,
};
pub use loader::schema::{
    FieldSpec, FieldType, FieldValue, TableSchema, TargetRow, UnknownFieldPolicy,
    normalize_batch, normalize_record,
};
pub use loader::traits::{Handoff, RecordSource};
pub use storage::memory::{MemoryStateStore, MemoryTargetStore};
pub use storage::postgres::PostgresStore;
pub use storage::sqlite::SqliteStore;
pub use storage::traits::{StateStore, TargetStore};

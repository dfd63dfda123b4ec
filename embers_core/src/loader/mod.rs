//! Incremental extract/load: fetch records newer than the stored watermark,
//! normalize them against a declared schema, upsert them in one transaction,
//! then advance the watermark.

pub mod engine;
pub mod handoff;
pub mod memory;
pub mod models;
pub mod schema;
pub mod traits;

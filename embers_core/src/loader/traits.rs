use crate::Result;
use crate::loader::models::{FetchQuery, LoadRun, RawRecord};
use async_trait::async_trait;

/// A source pulls raw records from an external system.
///
/// Source implementations live in `embers_integrations` (HTTP APIs) or in
/// `loader::memory` (fixtures, file imports).
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Stable identifier used in logs and run records, e.g. "socrata:wr8u-xric".
    fn name(&self) -> &str;

    /// Fetch every record matching `query`, across all pages.
    ///
    /// `FetchQuery::After` is a strict greater-than filter on the watermark field.
    /// Transport failures must surface as `Error::Source*` so callers can tell
    /// them apart from data-shape problems.
    async fn fetch(&self, query: &FetchQuery) -> Result<Vec<RawRecord>>;
}

/// Downstream step notified after a run committed (e.g. a transformation job).
#[async_trait]
pub trait Handoff: Send + Sync {
    async fn notify(&self, run: &LoadRun) -> Result<()>;
}

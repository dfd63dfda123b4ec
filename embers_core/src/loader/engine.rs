use crate::loader::models::{FetchQuery, LoadOutcome, LoadRun, RunTrigger, Watermark};
use crate::loader::schema::{TableSchema, normalize_batch};
use crate::loader::traits::{Handoff, RecordSource};
use crate::storage::traits::{StateStore, TargetStore};
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;

/// Default rows per write chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 50_000;

/// Fetch → normalize → upsert, bounded by a watermark passed in by the caller.
///
/// The loader owns no run state: it receives the current watermark and returns
/// the new one in `LoadOutcome`. Persisting it is the caller's job
/// (`LoadPipeline`, or a test harness).
pub struct IncrementalLoader {
    source: Arc<dyn RecordSource>,
    target: Arc<dyn TargetStore>,
    schema: TableSchema,
    chunk_size: usize,
}

impl IncrementalLoader {
    #[tracing::instrument(level = "debug", skip(source, target, schema))]
    pub fn new(
        source: Arc<dyn RecordSource>,
        target: Arc<dyn TargetStore>,
        schema: TableSchema,
        chunk_size: usize,
    ) -> Result<Self> {
        schema.validate()?;
        if chunk_size == 0 {
            return Err(Error::InvalidInput("chunk_size must be > 0".to_string()));
        }
        Ok(Self {
            source,
            target,
            schema,
            chunk_size,
        })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Run one load bounded below (exclusive) by `watermark`.
    #[tracing::instrument(
        level = "info",
        skip(self),
        fields(source = %self.source.name(), table = %self.schema.qualified_table())
    )]
    pub async fn load(&self, watermark: Option<Watermark>) -> Result<LoadOutcome> {
        let query = FetchQuery::for_watermark(&self.schema.watermark_field, watermark);
        match &watermark {
            Some(w) => tracing::info!(watermark = %w, "pulling records newer than watermark"),
            None => tracing::info!("no watermark, pulling complete history"),
        }

        let records = self.source.fetch(&query).await?;
        let records_fetched = records.len() as u64;
        if records.is_empty() {
            tracing::info!("source returned no records, target is up to date");
            return Ok(LoadOutcome::unchanged(watermark, 0));
        }

        let mut rows = normalize_batch(&self.schema, &records)?;
        if let Some(w) = watermark {
            let before = rows.len();
            rows.retain(|r| r.watermark() > w);
            let dropped = before - rows.len();
            if dropped > 0 {
                tracing::warn!(
                    dropped,
                    watermark = %w,
                    "source returned records at or before the watermark; skipped"
                );
            }
        }
        let Some(new_watermark) = rows.iter().map(|r| r.watermark()).max() else {
            return Ok(LoadOutcome::unchanged(watermark, records_fetched));
        };

        self.target.ensure_table(&self.schema).await?;
        let rows_written = self
            .target
            .upsert_rows(&self.schema, &rows, self.chunk_size)
            .await?;

        tracing::info!(
            records_fetched,
            rows_written,
            watermark = %new_watermark,
            "loaded records"
        );
        Ok(LoadOutcome {
            previous: watermark,
            watermark: Some(new_watermark),
            records_fetched,
            rows_written,
        })
    }
}

/// One pipeline: a loader plus the run state that bounds it.
///
/// Ordering per run: record run start → read watermark → load → commit
/// watermark → record success → handoff. The watermark is written only after
/// the target write returned, and only ever moves forward.
pub struct LoadPipeline {
    loader: IncrementalLoader,
    state: Arc<dyn StateStore>,
    watermark_key: String,
    handoff: Option<Arc<dyn Handoff>>,
}

impl LoadPipeline {
    #[tracing::instrument(level = "debug", skip(loader, state))]
    pub fn new(
        loader: IncrementalLoader,
        state: Arc<dyn StateStore>,
        watermark_key: impl Into<String> + std::fmt::Debug,
    ) -> Result<Self> {
        let watermark_key = watermark_key.into();
        if watermark_key.trim().is_empty() {
            return Err(Error::InvalidInput("watermark key is empty".to_string()));
        }
        Ok(Self {
            loader,
            state,
            watermark_key,
            handoff: None,
        })
    }

    /// Set a downstream step to run after every successful run.
    pub fn with_handoff(mut self, handoff: Arc<dyn Handoff>) -> Self {
        self.handoff = Some(handoff);
        self
    }

    pub fn watermark_key(&self) -> &str {
        &self.watermark_key
    }

    /// Execute one run. Any error leaves the stored watermark as it was before
    /// the failing step (handoff failures happen after the commit).
    #[tracing::instrument(level = "info", skip(self), fields(pipeline = %self.watermark_key))]
    pub async fn run(&self, trigger: RunTrigger) -> Result<LoadRun> {
        let mut run = LoadRun::new_running(self.watermark_key.clone(), trigger.clone(), Utc::now())?;
        self.state.upsert_load_run(&run).await?;

        let stored = match self.state.get_watermark(&self.watermark_key).await {
            Ok(w) => w,
            Err(e) => return Err(self.abort(&mut run, e).await),
        };
        run.watermark_before = stored;

        let effective = match &trigger {
            RunTrigger::Incremental => stored,
            RunTrigger::FullRefresh => None,
            RunTrigger::Backfill { since } => Some(*since),
        };

        let outcome = match self.loader.load(effective).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.abort(&mut run, e).await),
        };

        // A backfill starting past the stored watermark must not jump over
        // the records in between.
        let candidate = match &trigger {
            RunTrigger::Backfill { since } if stored.map_or(true, |old| *since > old) => {
                if outcome.watermark.is_some() {
                    tracing::warn!(
                        since = %since,
                        stored = ?stored,
                        "backfill starts after the stored watermark; watermark left unchanged"
                    );
                }
                None
            }
            _ => outcome.watermark,
        };

        let committed = match (candidate, stored) {
            (Some(new), Some(old)) if new <= old => Some(old),
            (Some(new), _) => {
                if let Err(e) = self.state.put_watermark(&self.watermark_key, new).await {
                    run.records_fetched = outcome.records_fetched;
                    run.rows_written = outcome.rows_written;
                    return Err(self.abort(&mut run, e).await);
                }
                tracing::info!(watermark = %new, "watermark committed");
                Some(new)
            }
            (None, old) => old,
        };

        run.succeed(&outcome, committed);
        if let Err(e) = self.state.upsert_load_run(&run).await {
            return Err(self.abort(&mut run, e).await);
        }

        if let Some(handoff) = &self.handoff {
            if let Err(e) = handoff.notify(&run).await {
                let e = Error::BackendMessage(format!("handoff failed: {e}"));
                return Err(self.abort(&mut run, e).await);
            }
        }

        tracing::info!(
            run_id = %run.run_id,
            records_fetched = run.records_fetched,
            rows_written = run.rows_written,
            "run succeeded"
        );
        Ok(run)
    }

    /// Mark the run failed (best effort) and hand the error back.
    async fn abort(&self, run: &mut LoadRun, error: Error) -> Error {
        tracing::error!(
            run_id = %run.run_id,
            error = %error,
            kind = error.kind(),
            transient = error.is_transient(),
            "run failed"
        );
        run.fail(&error);
        if let Err(e) = self.state.upsert_load_run(run).await {
            tracing::warn!(error = %e, "could not record failed run");
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::memory::MemorySource;
    use crate::loader::models::{LoadRunStatus, RawRecord};
    use crate::loader::schema::{FieldSpec, FieldType, FieldValue};
    use crate::storage::memory::{MemoryStateStore, MemoryTargetStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KEY: &str = "latest_data";

    fn schema() -> TableSchema {
        TableSchema::new(
            Some("incidents".into()),
            "incidents",
            "id",
            "data_loaded_at",
            vec![
                FieldSpec::new("id", FieldType::Text),
                FieldSpec::new("address", FieldType::Text),
                FieldSpec::new("estimated_property_loss", FieldType::Number),
                FieldSpec::new("data_loaded_at", FieldType::Timestamp),
            ],
        )
        .unwrap()
    }

    fn rec(id: &str, ts: &str) -> RawRecord {
        RawRecord::from_value(json!({
            "id": id,
            "address": format!("{id} Market St"),
            "estimated_property_loss": "100",
            "data_loaded_at": ts,
        }))
        .unwrap()
    }

    fn wm(s: &str) -> Watermark {
        Watermark::parse(s).unwrap()
    }

    struct Harness {
        source: MemorySource,
        target: MemoryTargetStore,
        state: MemoryStateStore,
        pipeline: LoadPipeline,
    }

    fn harness(records: Vec<RawRecord>, chunk_size: usize) -> Harness {
        let source = MemorySource::new("memory", records);
        let target = MemoryTargetStore::new();
        let state = MemoryStateStore::new();
        let loader = IncrementalLoader::new(
            Arc::new(source.clone()),
            Arc::new(target.clone()),
            schema(),
            chunk_size,
        )
        .unwrap();
        let pipeline = LoadPipeline::new(loader, Arc::new(state.clone()), KEY).unwrap();
        Harness {
            source,
            target,
            state,
            pipeline,
        }
    }

    #[tokio::test]
    async fn first_run_fetches_full_history_and_sets_max_watermark() {
        let h = harness(
            vec![
                rec("a", "2024-01-02T00:00:00.000"),
                rec("b", "2024-01-03T00:00:00.000"),
                rec("c", "2024-01-01T00:00:00.000"),
            ],
            DEFAULT_CHUNK_SIZE,
        );
        let run = h.pipeline.run(RunTrigger::Incremental).await.unwrap();

        assert_eq!(h.source.queries().await, vec![FetchQuery::All]);
        assert_eq!(run.status, LoadRunStatus::Succeeded);
        assert_eq!(run.rows_written, 3);
        assert_eq!(run.watermark_before, None);
        assert_eq!(run.watermark_after, Some(wm("2024-01-03T00:00:00Z")));
        assert_eq!(
            h.state.get_watermark(KEY).await.unwrap(),
            Some(wm("2024-01-03T00:00:00Z"))
        );
        assert_eq!(h.target.rows(&schema()).await.len(), 3);
    }

    #[tokio::test]
    async fn second_run_without_new_data_changes_nothing() {
        let h = harness(vec![rec("a", "2024-01-02T00:00:00.000")], DEFAULT_CHUNK_SIZE);
        h.pipeline.run(RunTrigger::Incremental).await.unwrap();
        let rows_before = h.target.rows(&schema()).await;
        let chunks_before = h.target.chunks_applied();

        let run = h.pipeline.run(RunTrigger::Incremental).await.unwrap();
        assert_eq!(run.records_fetched, 0);
        assert_eq!(run.rows_written, 0);
        assert_eq!(h.target.rows(&schema()).await, rows_before);
        assert_eq!(h.target.chunks_applied(), chunks_before);
        assert_eq!(
            h.state.get_watermark(KEY).await.unwrap(),
            Some(wm("2024-01-02T00:00:00Z"))
        );
        assert_eq!(
            h.source.queries().await[1],
            FetchQuery::After {
                field: "data_loaded_at".into(),
                watermark: wm("2024-01-02T00:00:00Z"),
            }
        );
    }

    #[tokio::test]
    async fn empty_source_is_a_noop_success() {
        let h = harness(vec![], DEFAULT_CHUNK_SIZE);
        let run = h.pipeline.run(RunTrigger::Incremental).await.unwrap();
        assert_eq!(run.status, LoadRunStatus::Succeeded);
        assert_eq!(h.state.get_watermark(KEY).await.unwrap(), None);
        assert!(!h.target.table_exists(&schema()).await);
    }

    #[tokio::test]
    async fn boundary_is_strictly_greater_than() {
        let h = harness(
            vec![
                rec("equal", "2024-01-01T00:00:00.000"),
                rec("later", "2024-01-01T00:00:01.000"),
            ],
            DEFAULT_CHUNK_SIZE,
        );
        h.state
            .put_watermark(KEY, wm("2024-01-01T00:00:00Z"))
            .await
            .unwrap();

        let run = h.pipeline.run(RunTrigger::Incremental).await.unwrap();
        assert_eq!(run.rows_written, 1);
        let ids: Vec<_> = h
            .target
            .rows(&schema())
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["later"]);
        assert_eq!(
            h.state.get_watermark(KEY).await.unwrap(),
            Some(wm("2024-01-01T00:00:01Z"))
        );
    }

    /// Ignores the query and returns everything, like a misbehaving API.
    struct LenientSource(Vec<RawRecord>);

    #[async_trait]
    impl RecordSource for LenientSource {
        fn name(&self) -> &str {
            "lenient"
        }
        async fn fetch(&self, _query: &FetchQuery) -> Result<Vec<RawRecord>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn loader_filters_records_a_lenient_source_returns_at_the_boundary() {
        let target = MemoryTargetStore::new();
        let loader = IncrementalLoader::new(
            Arc::new(LenientSource(vec![
                rec("old", "2023-12-31T00:00:00.000"),
                rec("equal", "2024-01-01T00:00:00.000"),
            ])),
            Arc::new(target.clone()),
            schema(),
            10,
        )
        .unwrap();
        let prev = Some(wm("2024-01-01T00:00:00Z"));
        let outcome = loader.load(prev).await.unwrap();
        assert_eq!(outcome.records_fetched, 2);
        assert_eq!(outcome.rows_written, 0);
        assert_eq!(outcome.previous, prev);
        assert_eq!(outcome.watermark, None);
        assert!(!outcome.advanced());
    }

    #[tokio::test]
    async fn upsert_replaces_whole_row() {
        let h = harness(
            vec![RawRecord::from_value(json!({
                "id": "a",
                "address": "1 Main St",
                "estimated_property_loss": "5000",
                "data_loaded_at": "2024-01-01T00:00:00.000",
            }))
            .unwrap()],
            DEFAULT_CHUNK_SIZE,
        );
        h.pipeline.run(RunTrigger::Incremental).await.unwrap();

        // Newer version drops the loss estimate entirely.
        h.source
            .replace(
                "id",
                RawRecord::from_value(json!({
                    "id": "a",
                    "address": "2 Main St",
                    "data_loaded_at": "2024-01-02T00:00:00.000",
                }))
                .unwrap(),
            )
            .await;
        h.pipeline.run(RunTrigger::Incremental).await.unwrap();

        let s = schema();
        let row = h.target.row(&s, "a").await.unwrap();
        assert_eq!(
            row.value(&s, "address"),
            Some(&FieldValue::Text("2 Main St".into()))
        );
        assert_eq!(
            row.value(&s, "estimated_property_loss"),
            Some(&FieldValue::Null)
        );
        assert_eq!(h.target.rows(&s).await.len(), 1);
    }

    #[tokio::test]
    async fn nan_is_stored_as_explicit_null() {
        let h = harness(
            vec![RawRecord::from_value(json!({
                "id": "a",
                "estimated_property_loss": "NaN",
                "data_loaded_at": "2024-01-01T00:00:00.000",
            }))
            .unwrap()],
            DEFAULT_CHUNK_SIZE,
        );
        h.pipeline.run(RunTrigger::Incremental).await.unwrap();
        let s = schema();
        let row = h.target.row(&s, "a").await.unwrap();
        assert_eq!(
            row.value(&s, "estimated_property_loss"),
            Some(&FieldValue::Null)
        );
    }

    #[tokio::test]
    async fn failure_on_second_of_three_chunks_keeps_watermark_and_retry_recovers() {
        let records: Vec<_> = (0..6)
            .map(|i| rec(&format!("r{i}"), &format!("2024-02-0{}T00:00:00.000", i + 1)))
            .collect();
        let h = harness(records, 2);

        // An earlier run left the watermark here.
        h.state
            .put_watermark(KEY, wm("2024-01-15T00:00:00Z"))
            .await
            .unwrap();
        h.target.ensure_table(&schema()).await.unwrap();

        h.target.fail_on_chunk(1).await;
        let err = h.pipeline.run(RunTrigger::Incremental).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(
            h.state.get_watermark(KEY).await.unwrap(),
            Some(wm("2024-01-15T00:00:00Z"))
        );
        assert!(h.target.rows(&schema()).await.is_empty());

        let runs = h.state.all_runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, LoadRunStatus::Failed);
        assert!(runs[0].error_message.is_some());

        // Retry replays from the original watermark.
        let run = h.pipeline.run(RunTrigger::Incremental).await.unwrap();
        assert_eq!(run.watermark_before, Some(wm("2024-01-15T00:00:00Z")));
        assert_eq!(run.rows_written, 6);
        let ids: Vec<_> = h
            .target
            .rows(&schema())
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["r0", "r1", "r2", "r3", "r4", "r5"]);
        assert_eq!(
            h.state.get_watermark(KEY).await.unwrap(),
            Some(wm("2024-02-06T00:00:00Z"))
        );
        let last = h.source.queries().await.pop().unwrap();
        assert_eq!(last.watermark(), Some(wm("2024-01-15T00:00:00Z")));
    }

    #[tokio::test]
    async fn unreadable_state_aborts_before_fetch() {
        let h = harness(vec![rec("a", "2024-01-01T00:00:00.000")], 10);
        h.state.put_raw(KEY, "not-a-timestamp").await;
        let err = h.pipeline.run(RunTrigger::Incremental).await.unwrap_err();
        assert_eq!(err.kind(), "state");
        assert!(h.source.queries().await.is_empty());

        h.state.set_fail_reads(true);
        assert!(h.pipeline.run(RunTrigger::Incremental).await.is_err());
        assert!(h.source.queries().await.is_empty());
    }

    #[tokio::test]
    async fn source_and_shape_errors_do_not_touch_state() {
        let h = harness(vec![rec("a", "2024-01-01T00:00:00.000")], 10);
        h.source.fail_next_fetch("503 from upstream").await;
        let err = h.pipeline.run(RunTrigger::Incremental).await.unwrap_err();
        assert_eq!(err.kind(), "source");
        assert_eq!(h.state.get_watermark(KEY).await.unwrap(), None);

        let no_id = json!({"address": "no id", "data_loaded_at": "2024-01-02"});
        h.source.push(RawRecord::from_value(no_id).unwrap()).await;
        let err = h.pipeline.run(RunTrigger::Incremental).await.unwrap_err();
        assert_eq!(err.kind(), "data_shape");
        assert!(!err.is_transient());
        assert_eq!(h.state.get_watermark(KEY).await.unwrap(), None);
        assert!(h.target.rows(&schema()).await.is_empty());
    }

    #[tokio::test]
    async fn failed_watermark_write_replays_safely() {
        let h = harness(vec![rec("a", "2024-01-01T00:00:00.000")], 10);
        h.state.set_fail_watermark_writes(true);
        assert!(h.pipeline.run(RunTrigger::Incremental).await.is_err());
        assert_eq!(h.target.rows(&schema()).await.len(), 1);

        h.state.set_fail_watermark_writes(false);
        let run = h.pipeline.run(RunTrigger::Incremental).await.unwrap();
        assert_eq!(run.rows_written, 1);
        assert_eq!(h.target.rows(&schema()).await.len(), 1);
        assert_eq!(
            h.state.get_watermark(KEY).await.unwrap(),
            Some(wm("2024-01-01T00:00:00Z"))
        );
    }

    #[tokio::test]
    async fn full_refresh_and_backfill_never_move_watermark_backwards() {
        let h = harness(
            vec![
                rec("a", "2024-01-01T00:00:00.000"),
                rec("b", "2024-01-05T00:00:00.000"),
            ],
            10,
        );
        h.state
            .put_watermark(KEY, wm("2024-03-01T00:00:00Z"))
            .await
            .unwrap();

        let run = h.pipeline.run(RunTrigger::FullRefresh).await.unwrap();
        assert_eq!(h.source.queries().await, vec![FetchQuery::All]);
        assert_eq!(run.rows_written, 2);
        assert_eq!(run.watermark_after, Some(wm("2024-03-01T00:00:00Z")));

        let run = h
            .pipeline
            .run(RunTrigger::Backfill {
                since: wm("2024-01-02T00:00:00Z"),
            })
            .await
            .unwrap();
        assert_eq!(run.rows_written, 1);
        assert_eq!(
            h.state.get_watermark(KEY).await.unwrap(),
            Some(wm("2024-03-01T00:00:00Z"))
        );
    }

    #[tokio::test]
    async fn backfill_past_the_watermark_never_skips_records() {
        let h = harness(vec![rec("feb", "2024-02-01T00:00:00.000")], 10);
        h.state
            .put_watermark(KEY, wm("2024-01-01T00:00:00Z"))
            .await
            .unwrap();

        let run = h
            .pipeline
            .run(RunTrigger::Backfill {
                since: wm("2024-03-01T00:00:00Z"),
            })
            .await
            .unwrap();
        assert_eq!(run.records_fetched, 0);
        assert_eq!(run.watermark_after, Some(wm("2024-01-01T00:00:00Z")));
        assert_eq!(
            h.state.get_watermark(KEY).await.unwrap(),
            Some(wm("2024-01-01T00:00:00Z"))
        );

        let run = h.pipeline.run(RunTrigger::Incremental).await.unwrap();
        assert_eq!(run.rows_written, 1);
        assert!(h.target.row(&schema(), "feb").await.is_some());
    }

    #[tokio::test]
    async fn backfill_that_writes_past_the_watermark_leaves_it_alone() {
        let h = harness(
            vec![
                rec("feb", "2024-02-01T00:00:00.000"),
                rec("apr", "2024-04-01T00:00:00.000"),
            ],
            10,
        );
        h.state
            .put_watermark(KEY, wm("2024-01-01T00:00:00Z"))
            .await
            .unwrap();

        let run = h
            .pipeline
            .run(RunTrigger::Backfill {
                since: wm("2024-03-01T00:00:00Z"),
            })
            .await
            .unwrap();
        assert_eq!(run.rows_written, 1);
        assert_eq!(
            h.state.get_watermark(KEY).await.unwrap(),
            Some(wm("2024-01-01T00:00:00Z"))
        );

        let run = h.pipeline.run(RunTrigger::Incremental).await.unwrap();
        assert_eq!(run.rows_written, 2);
        assert_eq!(h.target.rows(&schema()).await.len(), 2);
        assert_eq!(
            h.state.get_watermark(KEY).await.unwrap(),
            Some(wm("2024-04-01T00:00:00Z"))
        );
    }

    #[tokio::test]
    async fn unrecorded_success_marks_run_failed_and_skips_handoff() {
        let state = MemoryStateStore::new();
        let handoff = Arc::new(CountingHandoff {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let loader = IncrementalLoader::new(
            Arc::new(MemorySource::new(
                "memory",
                vec![rec("a", "2024-01-01T00:00:00.000")],
            )),
            Arc::new(MemoryTargetStore::new()),
            schema(),
            10,
        )
        .unwrap();
        let pipeline = LoadPipeline::new(loader, Arc::new(state.clone()), KEY)
            .unwrap()
            .with_handoff(handoff.clone());

        state.set_fail_success_records(true);
        let err = pipeline.run(RunTrigger::Incremental).await.unwrap_err();
        assert_eq!(err.kind(), "state");
        assert_eq!(handoff.calls.load(Ordering::SeqCst), 0);

        let runs = state.all_runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, LoadRunStatus::Failed);
        assert!(runs[0].error_message.is_some());
        // The load itself landed; a replay upserts the same row again.
        assert_eq!(
            state.get_watermark(KEY).await.unwrap(),
            Some(wm("2024-01-01T00:00:00Z"))
        );
    }

    struct CountingHandoff {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Handoff for CountingHandoff {
        async fn notify(&self, _run: &LoadRun) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::BackendMessage("dbt exited 1".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn handoff_runs_after_commit_even_for_noop_runs() {
        let source = MemorySource::new("memory", vec![rec("a", "2024-01-01T00:00:00.000")]);
        let state = MemoryStateStore::new();
        let handoff = Arc::new(CountingHandoff {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let loader = IncrementalLoader::new(
            Arc::new(source),
            Arc::new(MemoryTargetStore::new()),
            schema(),
            10,
        )
        .unwrap();
        let pipeline = LoadPipeline::new(loader, Arc::new(state.clone()), KEY)
            .unwrap()
            .with_handoff(handoff.clone());

        pipeline.run(RunTrigger::Incremental).await.unwrap();
        pipeline.run(RunTrigger::Incremental).await.unwrap();
        assert_eq!(handoff.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_handoff_fails_run_but_keeps_commit() {
        let source = MemorySource::new("memory", vec![rec("a", "2024-01-01T00:00:00.000")]);
        let state = MemoryStateStore::new();
        let loader = IncrementalLoader::new(
            Arc::new(source),
            Arc::new(MemoryTargetStore::new()),
            schema(),
            10,
        )
        .unwrap();
        let pipeline = LoadPipeline::new(loader, Arc::new(state.clone()), KEY)
            .unwrap()
            .with_handoff(Arc::new(CountingHandoff {
                calls: AtomicUsize::new(0),
                fail: true,
            }));

        let err = pipeline.run(RunTrigger::Incremental).await.unwrap_err();
        assert!(err.to_string().contains("handoff failed"));
        assert_eq!(
            state.get_watermark(KEY).await.unwrap(),
            Some(wm("2024-01-01T00:00:00Z"))
        );
        let runs = state.all_runs().await;
        assert_eq!(runs[0].status, LoadRunStatus::Failed);
        assert_eq!(runs[0].rows_written, 1);
    }

    #[test]
    fn constructor_validation() {
        let bad = IncrementalLoader::new(
            Arc::new(MemorySource::default()),
            Arc::new(MemoryTargetStore::new()),
            schema(),
            0,
        );
        assert!(bad.is_err());
    }
}

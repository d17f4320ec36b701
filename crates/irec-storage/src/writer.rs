use std::sync::Arc;

use irec_core::{CanonicalRecord, IssueKey, KeyError, EXPORT_COLUMN_COUNT};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

use crate::schema::{SchemaSpec, SCHEMA_VERSION};
use crate::{StorageError, TableStore, WriteMode};

pub const PROCESSING_STATUS_COMPLETED: &str = "completed";

/// Insert column list: the export columns in sheet order, then the two
/// metadata columns.
pub const UPSERT_COLUMNS: [&str; EXPORT_COLUMN_COUNT + 2] = [
    "project_id",
    "issue_id",
    "short_description",
    "long_description",
    "project_issue_class",
    "similar_issue_1_project_id",
    "similar_issue_1_issue_id",
    "similar_issue_1_name",
    "similar_issue_1_start_date",
    "similar_issue_1_resolution_time",
    "similar_issue_2_project_id",
    "similar_issue_2_issue_id",
    "similar_issue_2_name",
    "similar_issue_2_start_date",
    "similar_issue_2_resolution_time",
    "similar_issue_3_project_id",
    "similar_issue_3_issue_id",
    "similar_issue_3_name",
    "similar_issue_3_start_date",
    "similar_issue_3_resolution_time",
    "time_ai_predicted_timeline",
    "issue_start_date",
    "predicted_end_date",
    "timeline_resolution_rationale",
    "immediate_next_steps",
    "learn_from_similar_issues",
    "strategic_best_practice",
    "ml_pipeline_version",
    "processing_status",
];

pub const KEY_COLUMNS: [&str; 2] = ["project_id", "issue_id"];

/// Bind parameters one chunk may use.
pub const MAX_PLACEHOLDERS: usize = 65_535;

pub fn max_batch_size() -> usize {
    MAX_PLACEHOLDERS / UPSERT_COLUMNS.len()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("required field {column} is empty")]
    RequiredFieldEmpty { column: &'static str },
    #[error("column {column} is not declared by the table schema")]
    UndeclaredColumn { column: &'static str },
}

/// A record reduced to bind values aligned with [`UPSERT_COLUMNS`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRow {
    pub key: IssueKey,
    pub values: Vec<Option<String>>,
}

fn truncate_chars(value: &str, width: Option<usize>) -> String {
    match width {
        Some(width) if value.chars().count() > width => value.chars().take(width).collect(),
        _ => value.to_string(),
    }
}

/// Trims every field, truncates to declared widths, and maps empty values to
/// NULL. Key fields must be non-empty after trimming.
pub fn prepare_record(
    record: &CanonicalRecord,
    schema: &SchemaSpec,
    pipeline_version: &str,
) -> Result<PreparedRow, RecordError> {
    let cells = record.cells();
    let metadata = [pipeline_version, PROCESSING_STATUS_COMPLETED];
    let mut values = Vec::with_capacity(UPSERT_COLUMNS.len());

    for (&column, &raw) in UPSERT_COLUMNS.iter().zip(cells.iter().chain(metadata.iter())) {
        let spec = schema
            .column(column)
            .ok_or(RecordError::UndeclaredColumn { column })?;
        let value = truncate_chars(raw.trim(), spec.width());
        if value.is_empty() {
            if KEY_COLUMNS.contains(&column) {
                return Err(RecordError::RequiredFieldEmpty { column });
            }
            values.push(None);
        } else {
            values.push(Some(value));
        }
    }

    let key = IssueKey::new(
        values[0].clone().unwrap_or_default(),
        values[1].clone().unwrap_or_default(),
    )
    .map_err(|err| match err {
        KeyError::EmptyIssueId => RecordError::RequiredFieldEmpty { column: KEY_COLUMNS[1] },
        _ => RecordError::RequiredFieldEmpty { column: KEY_COLUMNS[0] },
    })?;
    Ok(PreparedRow { key, values })
}

#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub batch_size: usize,
    pub update_existing: bool,
    pub workers: usize,
    pub pipeline_version: String,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            update_existing: true,
            workers: 1,
            pipeline_version: SCHEMA_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistenceOutcome {
    pub total_records: usize,
    pub submitted_rows: usize,
    pub affected_rows: u64,
    pub preparation_errors: usize,
    pub database_errors: usize,
    pub batch_count: usize,
}

impl PersistenceOutcome {
    pub fn success_rate(&self) -> String {
        if self.total_records == 0 {
            return "0/0 (0%)".to_string();
        }
        let pct = self.submitted_rows as f64 * 100.0 / self.total_records as f64;
        format!("{}/{} ({pct:.1}%)", self.submitted_rows, self.total_records)
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("batch {batch} of {batches} failed")]
    Batch {
        batch: usize,
        batches: usize,
        partial: PersistenceOutcome,
        #[source]
        source: StorageError,
    },
    #[error("batch worker stopped unexpectedly")]
    Worker(#[from] tokio::task::JoinError),
}

impl WriteError {
    pub fn partial(&self) -> Option<&PersistenceOutcome> {
        match self {
            WriteError::Batch { partial, .. } => Some(partial),
            WriteError::Worker(_) => None,
        }
    }
}

/// Prepared rows grouped into persistence calls.
#[derive(Debug, Clone, Default)]
pub struct WritePlan {
    pub total_records: usize,
    pub preparation_errors: usize,
    pub chunks: Vec<Vec<PreparedRow>>,
}

pub struct BatchUpsertWriter {
    store: Arc<dyn TableStore>,
    settings: WriterSettings,
}

impl BatchUpsertWriter {
    pub fn new(store: Arc<dyn TableStore>, settings: WriterSettings) -> Self {
        let settings = WriterSettings {
            batch_size: settings.batch_size.clamp(1, max_batch_size()),
            workers: settings.workers.max(1),
            ..settings
        };
        Self { store, settings }
    }

    pub fn settings(&self) -> &WriterSettings {
        &self.settings
    }

    fn mode(&self) -> WriteMode {
        if self.settings.update_existing {
            WriteMode::Upsert
        } else {
            WriteMode::InsertOnly
        }
    }

    /// Prepares every record, then chunks the rows that survived.
    pub fn plan(&self, records: &[CanonicalRecord]) -> WritePlan {
        let schema = self.store.schema();
        let mut rows = Vec::with_capacity(records.len());
        let mut preparation_errors = 0;
        for (index, record) in records.iter().enumerate() {
            match prepare_record(record, schema, &self.settings.pipeline_version) {
                Ok(row) => rows.push(row),
                Err(err) => {
                    preparation_errors += 1;
                    warn!(position = index + 1, error = %err, "record skipped");
                }
            }
        }
        let chunks = rows
            .chunks(self.settings.batch_size)
            .map(<[PreparedRow]>::to_vec)
            .collect();
        WritePlan {
            total_records: records.len(),
            preparation_errors,
            chunks,
        }
    }

    pub async fn write(&self, records: &[CanonicalRecord]) -> Result<PersistenceOutcome, WriteError> {
        let plan = self.plan(records);
        let mut outcome = PersistenceOutcome {
            total_records: plan.total_records,
            preparation_errors: plan.preparation_errors,
            batch_count: plan.chunks.len(),
            ..PersistenceOutcome::default()
        };
        info!(
            table = %self.store.target().table,
            records = outcome.total_records,
            batches = outcome.batch_count,
            workers = self.settings.workers,
            "writing records"
        );

        if self.settings.workers <= 1 {
            self.write_sequential(plan.chunks, &mut outcome).await?;
        } else {
            self.write_parallel(plan.chunks, &mut outcome).await?;
        }

        info!(
            submitted = outcome.submitted_rows,
            affected = outcome.affected_rows,
            skipped = outcome.preparation_errors,
            "write complete"
        );
        Ok(outcome)
    }

    async fn write_sequential(
        &self,
        chunks: Vec<Vec<PreparedRow>>,
        outcome: &mut PersistenceOutcome,
    ) -> Result<(), WriteError> {
        let batches = chunks.len();
        let mode = self.mode();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let span = info_span!("upsert_batch", batch = index + 1, batches, rows = chunk.len());
            match self.store.upsert(&chunk, mode).instrument(span).await {
                Ok(affected) => {
                    outcome.affected_rows += affected;
                    outcome.submitted_rows += chunk.len();
                }
                Err(source) => {
                    outcome.database_errors += chunk.len();
                    error!(batch = index + 1, error = %source, "batch failed");
                    return Err(WriteError::Batch {
                        batch: index + 1,
                        batches,
                        partial: *outcome,
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    /// Runs chunks on up to `workers` concurrent connections. A failed chunk
    /// does not stop its siblings; the earliest failure is reported once all
    /// have settled.
    async fn write_parallel(
        &self,
        chunks: Vec<Vec<PreparedRow>>,
        outcome: &mut PersistenceOutcome,
    ) -> Result<(), WriteError> {
        let batches = chunks.len();
        let mode = self.mode();
        let limit = Arc::new(Semaphore::new(self.settings.workers));
        let mut tasks = JoinSet::new();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let store = Arc::clone(&self.store);
            let limit = Arc::clone(&limit);
            let span = info_span!("upsert_batch", batch = index + 1, batches, rows = chunk.len());
            tasks.spawn(
                async move {
                    let rows = chunk.len();
                    let result = match limit.acquire_owned().await {
                        Ok(_permit) => store.upsert(&chunk, mode).await,
                        Err(_) => Err(StorageError::Backend("worker pool closed".to_string())),
                    };
                    (index, rows, result)
                }
                .instrument(span),
            );
        }

        let mut first_failure: Option<(usize, StorageError)> = None;
        while let Some(joined) = tasks.join_next().await {
            let (index, rows, result) = joined?;
            match result {
                Ok(affected) => {
                    outcome.affected_rows += affected;
                    outcome.submitted_rows += rows;
                }
                Err(source) => {
                    outcome.database_errors += rows;
                    error!(batch = index + 1, error = %source, "batch failed");
                    if first_failure.as_ref().map_or(true, |(earliest, _)| index < *earliest) {
                        first_failure = Some((index, source));
                    }
                }
            }
        }

        match first_failure {
            Some((index, source)) => Err(WriteError::Batch {
                batch: index + 1,
                batches,
                partial: *outcome,
                source,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTableStore;
    use crate::schema::ML_RESULTS_SCHEMA;
    use crate::TableStore;

    fn record(project: &str, issue: &str) -> CanonicalRecord {
        CanonicalRecord {
            project_id: project.to_string(),
            issue_id: issue.to_string(),
            short_description: format!("summary of {issue}"),
            ..CanonicalRecord::default()
        }
    }

    async fn ready_store() -> Arc<MemoryTableStore> {
        let store = Arc::new(MemoryTableStore::new("ml_results", &ML_RESULTS_SCHEMA));
        store.create_table().await.expect("table");
        store
    }

    fn settings(batch_size: usize, workers: usize) -> WriterSettings {
        WriterSettings {
            batch_size,
            workers,
            ..WriterSettings::default()
        }
    }

    #[test]
    fn prepare_trims_truncates_and_nulls_empty_values() {
        let mut rec = record("  P1  ", " I-9 ");
        rec.issue_class = "x".repeat(310);
        rec.similar[0].start_date = "é".repeat(60);
        rec.long_description = "   ".to_string();

        let row = prepare_record(&rec, &ML_RESULTS_SCHEMA, "1.0.0").expect("prepared");
        assert_eq!(row.key, IssueKey::new("P1", "I-9").unwrap());
        assert_eq!(row.values.len(), UPSERT_COLUMNS.len());
        assert_eq!(row.values[0].as_deref(), Some("P1"));
        assert_eq!(row.values[3], None);
        assert_eq!(row.values[4].as_ref().map(|v| v.chars().count()), Some(300));
        assert_eq!(row.values[8].as_ref().map(|v| v.chars().count()), Some(50));
        assert_eq!(row.values[27].as_deref(), Some("1.0.0"));
        assert_eq!(row.values[28].as_deref(), Some("completed"));
    }

    #[test]
    fn prepare_truncates_long_keys() {
        let row = prepare_record(&record(&"p".repeat(150), "1"), &ML_RESULTS_SCHEMA, "1.0.0").expect("prepared");
        assert_eq!(row.key.project_id().len(), 100);
    }

    #[test]
    fn prepare_rejects_blank_keys() {
        assert_eq!(
            prepare_record(&record("   ", "I-1"), &ML_RESULTS_SCHEMA, "1.0.0"),
            Err(RecordError::RequiredFieldEmpty { column: "project_id" })
        );
        assert_eq!(
            prepare_record(&record("P1", ""), &ML_RESULTS_SCHEMA, "1.0.0"),
            Err(RecordError::RequiredFieldEmpty { column: "issue_id" })
        );
    }

    #[test]
    fn batch_size_respects_placeholder_limit() {
        assert_eq!(max_batch_size(), 2259);
        let store: Arc<dyn TableStore> = Arc::new(MemoryTableStore::new("ml_results", &ML_RESULTS_SCHEMA));
        let writer = BatchUpsertWriter::new(store, settings(100_000, 0));
        assert_eq!(writer.settings().batch_size, 2259);
        assert_eq!(writer.settings().workers, 1);
    }

    #[tokio::test]
    async fn writes_in_ceil_chunks_and_skips_invalid_records() {
        let store = ready_store().await;
        let mut records = (0..7).map(|i| record("P1", &format!("I-{i}"))).collect::<Vec<_>>();
        records.push(record("", "I-x"));

        let writer = BatchUpsertWriter::new(store.clone(), settings(3, 1));
        let outcome = writer.write(&records).await.expect("write");

        assert_eq!(outcome.total_records, 8);
        assert_eq!(outcome.preparation_errors, 1);
        assert_eq!(outcome.submitted_rows, 7);
        assert_eq!(outcome.affected_rows, 7);
        assert_eq!(outcome.batch_count, 3);
        assert_eq!(store.upsert_calls(), 3);
        assert_eq!(store.row_count().await.unwrap(), 7);
        assert_eq!(outcome.success_rate(), "7/8 (87.5%)");
    }

    #[tokio::test]
    async fn rewriting_updates_instead_of_duplicating() {
        let store = ready_store().await;
        let writer = BatchUpsertWriter::new(store.clone(), settings(10, 1));
        writer.write(&[record("P1", "I-1")]).await.expect("first");

        let mut changed = record("P1", "I-1");
        changed.short_description = "revised".to_string();
        let outcome = writer.write(&[changed]).await.expect("second");

        assert_eq!(outcome.affected_rows, 2);
        assert_eq!(store.row_count().await.unwrap(), 1);
        let stored = store.stored(&IssueKey::new("P1", "I-1").unwrap()).await.unwrap();
        assert_eq!(stored[2].as_deref(), Some("revised"));
    }

    #[tokio::test]
    async fn identical_rewrite_counts_refreshed_rows() {
        let store = ready_store().await;
        let writer = BatchUpsertWriter::new(store.clone(), settings(10, 1));
        let records = [record("P1", "I-1"), record("P1", "I-2")];
        writer.write(&records).await.expect("first");

        let outcome = writer.write(&records).await.expect("second");
        assert_eq!(outcome.submitted_rows, 2);
        assert_eq!(outcome.affected_rows, 4);
        assert_eq!(store.row_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn insert_only_mode_fails_on_existing_key() {
        let store = ready_store().await;
        BatchUpsertWriter::new(store.clone(), settings(10, 1))
            .write(&[record("P1", "I-1")])
            .await
            .expect("seed");

        let writer = BatchUpsertWriter::new(
            store.clone(),
            WriterSettings {
                update_existing: false,
                ..settings(10, 1)
            },
        );
        let err = writer.write(&[record("P1", "I-1")]).await.unwrap_err();
        assert!(matches!(
            err,
            WriteError::Batch {
                source: StorageError::DuplicateKey(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn sequential_failure_stops_and_reports_partial_counts() {
        let store = Arc::new(MemoryTableStore::new("ml_results", &ML_RESULTS_SCHEMA).fail_on_call(2));
        store.create_table().await.unwrap();
        let records = (0..5).map(|i| record("P1", &format!("I-{i}"))).collect::<Vec<_>>();

        let err = BatchUpsertWriter::new(store.clone(), settings(2, 1))
            .write(&records)
            .await
            .unwrap_err();
        let partial = *err.partial().expect("partial outcome");
        assert!(matches!(err, WriteError::Batch { batch: 2, batches: 3, .. }));
        assert_eq!(partial.submitted_rows, 2);
        assert_eq!(partial.database_errors, 2);
        assert_eq!(store.upsert_calls(), 2);
    }

    #[tokio::test]
    async fn parallel_failure_lets_siblings_finish() {
        let store = Arc::new(MemoryTableStore::new("ml_results", &ML_RESULTS_SCHEMA).fail_on_call(1));
        store.create_table().await.unwrap();
        let records = (0..6).map(|i| record("P1", &format!("I-{i}"))).collect::<Vec<_>>();

        let err = BatchUpsertWriter::new(store.clone(), settings(2, 3))
            .write(&records)
            .await
            .unwrap_err();
        let partial = *err.partial().expect("partial outcome");
        assert_eq!(store.upsert_calls(), 3);
        assert_eq!(partial.submitted_rows, 4);
        assert_eq!(partial.database_errors, 2);
        assert_eq!(store.row_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn parallel_success_matches_sequential_totals() {
        let store = ready_store().await;
        let records = (0..10).map(|i| record("P2", &format!("I-{i}"))).collect::<Vec<_>>();
        let outcome = BatchUpsertWriter::new(store.clone(), settings(3, 4))
            .write(&records)
            .await
            .expect("write");
        assert_eq!(outcome.batch_count, 4);
        assert_eq!(outcome.submitted_rows, 10);
        assert_eq!(store.row_count().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let store = ready_store().await;
        let outcome = BatchUpsertWriter::new(store.clone(), settings(10, 1))
            .write(&[])
            .await
            .expect("write");
        assert_eq!(outcome.batch_count, 0);
        assert_eq!(store.upsert_calls(), 0);
        assert_eq!(outcome.success_rate(), "0/0 (0%)");
    }
}

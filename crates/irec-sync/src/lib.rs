//! Run orchestration: the merge run (inputs to canonical export) and the
//! persist run (canonical records to the results table).

pub mod config;
pub mod export;
pub mod reconcile;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use irec_core::{
    ActionRecommendation, BaseIssue, CanonicalRecord, Classification, DatasetKind, Description, ReconciledRecord,
    SimilarIssueSet, TimelinePrediction,
};
use irec_inputs::{load_dataset, validate_results_file, DatasetSource, InputError, JsonFileSource};
use irec_storage::{
    resolve_region, AwsCliCatalog, BatchUpsertWriter, ConnectionDescriptor, ConnectionManager, DiscoveryError,
    EndpointResolver, ImdsClient, InstanceMetadata, MySqlTableStore, PersistenceOutcome, SchemaDrift,
    SchemaManager, StorageError, TableStatus, TableStore, WriteError, WriterSettings, ML_RESULTS_SCHEMA,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{ConfigError, PipelineConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
pub use export::{ExportManifest, ExportMetadata, ManifestFile};
pub use reconcile::{build_lookup, reconcile, MergeError, MergeSummary, ReconcileInput, Reconciler};

pub const CRATE_NAME: &str = "irec-sync";

/// Progress markers of a persist run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Init,
    ConnectionVerified,
    SchemaReady,
    InputsValidated,
    RecordsLoaded,
    Written,
    Done,
    Failed,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStage::Init => "init",
            RunStage::ConnectionVerified => "connection_verified",
            RunStage::SchemaReady => "schema_ready",
            RunStage::InputsValidated => "inputs_validated",
            RunStage::RecordsLoaded => "records_loaded",
            RunStage::Written => "written",
            RunStage::Done => "done",
            RunStage::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum RunFailure {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("database at {target} is not reachable")]
    ConnectionRefused { target: String },
    #[error("results loader stopped unexpectedly")]
    Loader(#[source] tokio::task::JoinError),
}

/// A fatal persist-run failure; `stage` is the last stage reached.
#[derive(Debug, Error)]
#[error("persist run failed after stage `{stage}`")]
pub struct RunError {
    pub stage: RunStage,
    #[source]
    pub source: RunFailure,
}

impl RunError {
    /// Rows already counted when a batch failed, if any.
    pub fn partial(&self) -> Option<&PersistenceOutcome> {
        match &self.source {
            RunFailure::Write(err) => err.partial(),
            _ => None,
        }
    }
}

struct StageTracker {
    stage: RunStage,
}

impl StageTracker {
    fn advance(&mut self, next: RunStage) {
        info!(from = %self.stage, to = %next, "run stage");
        self.stage = next;
    }

    fn fail(&self, source: impl Into<RunFailure>) -> RunError {
        let source = source.into();
        warn!(stage = %self.stage, error = %source, "run failed");
        RunError {
            stage: self.stage,
            source,
        }
    }
}

fn elapsed_seconds(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutputs {
    pub json: PathBuf,
    pub sheet: PathBuf,
    pub manifest: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub run_id: Uuid,
    pub status: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub dataset_counts: BTreeMap<DatasetKind, usize>,
    pub malformed_rows: BTreeMap<DatasetKind, usize>,
    pub summary: MergeSummary,
    pub output_files: MergeOutputs,
    pub manifest: Vec<ManifestFile>,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub report: MergeReport,
    pub records: Vec<ReconciledRecord>,
}

impl MergeOutcome {
    pub fn canonical_records(&self) -> Vec<CanonicalRecord> {
        self.records.iter().map(|r| r.record().clone()).collect()
    }
}

struct LoadedInputs {
    input: ReconcileInput,
    counts: BTreeMap<DatasetKind, usize>,
    malformed: BTreeMap<DatasetKind, usize>,
}

fn load_inputs(source: &dyn DatasetSource) -> Result<LoadedInputs, InputError> {
    let mut validated = source.validate()?;
    let counts = validated.counts();
    let mut malformed = BTreeMap::new();

    let base = load_dataset::<BaseIssue>(&mut validated)?;
    malformed.insert(DatasetKind::BaseIssues, base.malformed);
    let descriptions = load_dataset::<Description>(&mut validated)?;
    malformed.insert(DatasetKind::Descriptions, descriptions.malformed);
    let classifications = load_dataset::<Classification>(&mut validated)?;
    malformed.insert(DatasetKind::Classifications, classifications.malformed);
    let similar = load_dataset::<SimilarIssueSet>(&mut validated)?;
    malformed.insert(DatasetKind::SimilarIssues, similar.malformed);
    let timelines = load_dataset::<TimelinePrediction>(&mut validated)?;
    malformed.insert(DatasetKind::TimelinePredictions, timelines.malformed);
    let actions = load_dataset::<ActionRecommendation>(&mut validated)?;
    malformed.insert(DatasetKind::ActionRecommendations, actions.malformed);

    Ok(LoadedInputs {
        input: ReconcileInput {
            base_issues: base.rows,
            descriptions: descriptions.rows,
            classifications: classifications.rows,
            similar_issues: similar.rows,
            timelines: timelines.rows,
            actions: actions.rows,
        },
        counts,
        malformed,
    })
}

/// Validates and loads the six inputs, reconciles them and writes the
/// JSON document, the sheet and a manifest of both.
pub struct MergeRun {
    source: Arc<dyn DatasetSource>,
    json_path: PathBuf,
    sheet_path: PathBuf,
    pipeline_version: String,
}

impl MergeRun {
    pub fn new(
        source: Arc<dyn DatasetSource>,
        json_path: impl Into<PathBuf>,
        sheet_path: impl Into<PathBuf>,
        pipeline_version: impl Into<String>,
    ) -> Self {
        Self {
            source,
            json_path: json_path.into(),
            sheet_path: sheet_path.into(),
            pipeline_version: pipeline_version.into(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            Arc::new(JsonFileSource::new(config.data_paths.inputs())),
            config.data_paths.final_json_file.clone(),
            config.data_paths.final_sheet_file.clone(),
            config.pipeline.version.clone(),
        )
    }

    pub async fn run(&self) -> Result<MergeOutcome> {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id)
            .instrument(info_span!("merge_run", %run_id))
            .await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<MergeOutcome> {
        let started_at = Utc::now();
        let started = Instant::now();
        info!("starting merge run");

        let source = Arc::clone(&self.source);
        let loaded = tokio::task::spawn_blocking(move || load_inputs(&*source))
            .await
            .context("dataset loader stopped unexpectedly")?
            .context("loading merge inputs")?;

        let records = reconcile(loaded.input);
        let summary = reconcile::summarize(&records);
        let canonical = records.iter().map(|r| r.record().clone()).collect::<Vec<_>>();

        export::write_json_document(&self.json_path, &canonical, &self.pipeline_version).await?;
        export::write_sheet(&self.sheet_path, &canonical).await?;
        let (manifest_path, manifest) = export::write_manifest(&[
            ("json", self.json_path.as_path()),
            ("sheet", self.sheet_path.as_path()),
        ])
        .await?;

        info!(
            total = summary.total_issues,
            sentinels = summary.sentinel_count,
            "merge run complete"
        );
        let report = MergeReport {
            run_id,
            status: "success",
            started_at,
            finished_at: Utc::now(),
            elapsed_seconds: elapsed_seconds(started),
            dataset_counts: loaded.counts,
            malformed_rows: loaded.malformed,
            summary,
            output_files: MergeOutputs {
                json: self.json_path.clone(),
                sheet: self.sheet_path.clone(),
                manifest: manifest_path,
            },
            manifest: manifest.files,
        };
        Ok(MergeOutcome { report, records })
    }
}

/// Where a persist run takes its records from.
#[derive(Debug, Clone)]
pub enum RecordSource {
    /// A canonical JSON document written by a merge run.
    File(PathBuf),
    /// Records already in memory; validation and loading are trivially satisfied.
    Records(Vec<CanonicalRecord>),
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseReport {
    #[serde(rename = "type")]
    pub engine: &'static str,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub table: String,
    pub total_rows_in_table: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersistReport {
    pub run_id: Uuid,
    pub status: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub database: DatabaseReport,
    pub processing_stats: PersistenceOutcome,
    pub success_rate: String,
    pub table_status: TableStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_drift: Option<SchemaDrift>,
}

/// Drives one pass of the persist state machine against a [`TableStore`].
pub struct PersistRun {
    store: Arc<dyn TableStore>,
    settings: WriterSettings,
}

impl PersistRun {
    pub fn new(store: Arc<dyn TableStore>, settings: WriterSettings) -> Self {
        Self { store, settings }
    }

    pub async fn run(&self, source: RecordSource) -> Result<PersistReport, RunError> {
        let run_id = Uuid::new_v4();
        let result = self
            .run_inner(run_id, source)
            .instrument(info_span!("persist_run", %run_id))
            .await;
        self.store.close().await;
        result
    }

    async fn run_inner(&self, run_id: Uuid, source: RecordSource) -> Result<PersistReport, RunError> {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut tracker = StageTracker { stage: RunStage::Init };
        let target = self.store.target();
        info!(host = %target.host, database = %target.database, table = %target.table, "starting persist run");

        if !self.store.test_connection().await {
            return Err(tracker.fail(RunFailure::ConnectionRefused {
                target: format!("{}:{}", target.host, target.port),
            }));
        }
        tracker.advance(RunStage::ConnectionVerified);

        let schema = SchemaManager::new(self.store.as_ref());
        schema.ensure_database().await.map_err(|e| tracker.fail(e))?;
        let table_status = schema.ensure_table().await.map_err(|e| tracker.fail(e))?;
        let schema_drift = match table_status {
            TableStatus::Existing => Some(schema.validate().await.map_err(|e| tracker.fail(e))?),
            TableStatus::Created => None,
        };
        tracker.advance(RunStage::SchemaReady);

        let records = match source {
            RecordSource::File(path) => {
                let validated = tokio::task::spawn_blocking(move || validate_results_file(&path))
                    .await
                    .map_err(|e| tracker.fail(RunFailure::Loader(e)))?
                    .map_err(|e| tracker.fail(e))?;
                tracker.advance(RunStage::InputsValidated);
                validated.into_records()
            }
            RecordSource::Records(records) => {
                tracker.advance(RunStage::InputsValidated);
                records
            }
        };
        tracker.advance(RunStage::RecordsLoaded);

        let writer = BatchUpsertWriter::new(Arc::clone(&self.store), self.settings.clone());
        let outcome = writer.write(&records).await.map_err(|e| tracker.fail(e))?;
        tracker.advance(RunStage::Written);

        let total_rows_in_table = self.store.row_count().await.map_err(|e| tracker.fail(e))?;
        tracker.advance(RunStage::Done);

        let report = PersistReport {
            run_id,
            status: "success",
            started_at,
            finished_at: Utc::now(),
            elapsed_seconds: elapsed_seconds(started),
            database: DatabaseReport {
                engine: target.engine,
                host: target.host.clone(),
                port: target.port,
                database: target.database.clone(),
                table: target.table.clone(),
                total_rows_in_table,
            },
            processing_stats: outcome,
            success_rate: outcome.success_rate(),
            table_status,
            schema_drift,
        };
        info!(
            submitted = outcome.submitted_rows,
            affected = outcome.affected_rows,
            rejected = outcome.preparation_errors,
            total_rows_in_table,
            "persist run complete"
        );
        Ok(report)
    }
}

/// Endpoint resolver backed by the instance metadata service and the aws CLI.
pub async fn resolver_for(config: &PipelineConfig) -> Result<EndpointResolver> {
    let discovery = &config.discovery;
    let mut imds = ImdsClient::new(discovery.metadata_timeout())?;
    if let Some(url) = discovery.metadata_url.as_deref().filter(|u| !u.trim().is_empty()) {
        imds = imds.with_base_url(url);
    }
    let metadata = Arc::new(imds);
    let region = resolve_region(discovery.region.as_deref(), metadata.as_ref()).await;
    let catalog = AwsCliCatalog::new(region, discovery.describe_timeout());
    let instance_id = metadata.instance_id().await;
    info!(region = %catalog.region(), instance_id = ?instance_id, "discovery region");
    let catalog = Arc::new(catalog);
    Ok(EndpointResolver::new(catalog, metadata).with_engines(discovery.engines.clone()))
}

/// Explicit target when usable, otherwise discovery. The metadata service
/// and the catalog are only touched on the discovery path.
pub async fn resolve_endpoint(config: &PipelineConfig) -> Result<ConnectionDescriptor> {
    let request = config.endpoint_request();
    if let Some(descriptor) = request.explicit_target() {
        info!(host = %descriptor.host, database = %descriptor.database, "using explicit database target");
        return Ok(descriptor);
    }
    let resolver = resolver_for(config).await?;
    let descriptor = resolver
        .resolve(&request)
        .await
        .context("resolving database endpoint")?;
    Ok(descriptor)
}

pub async fn connection_manager(config: &PipelineConfig) -> Result<ConnectionManager> {
    let descriptor = resolve_endpoint(config).await?;
    info!(target = %descriptor.display_target(), "using database endpoint");
    let max_connections = u32::try_from(config.database.workers).unwrap_or(u32::MAX);
    ConnectionManager::new(descriptor, &config.connection_overrides(), max_connections)
        .context("configuring database connection")
}

/// MySQL-backed store for the configured table.
pub async fn connect_store(config: &PipelineConfig) -> Result<Arc<dyn TableStore>> {
    let manager = connection_manager(config).await?;
    let store = MySqlTableStore::new(manager, config.database.table_name.clone(), &ML_RESULTS_SCHEMA)
        .context("configuring results table")?;
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use irec_core::IssueKey;
    use irec_inputs::MemorySource;
    use irec_storage::{LiveColumn, MemoryTableStore};
    use serde_json::json;

    fn record(issue: &str) -> CanonicalRecord {
        let mut record = CanonicalRecord::empty_for(&IssueKey::new("P1", issue).unwrap());
        record.short_description = format!("issue {issue}");
        record
    }

    fn run_with(store: Arc<dyn TableStore>) -> PersistRun {
        PersistRun::new(store, WriterSettings::default())
    }

    fn explicit_config(metadata_url: String) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.database.enabled = true;
        config.database.host = Some("db.internal".to_string());
        config.discovery.metadata_url = Some(metadata_url);
        config
    }

    #[tokio::test]
    async fn explicit_target_never_contacts_metadata_service() {
        let server = wiremock::MockServer::start().await;
        let descriptor = resolve_endpoint(&explicit_config(server.uri())).await.unwrap();
        assert_eq!(descriptor.source, irec_storage::EndpointSource::Explicit);
        assert_eq!(descriptor.host, "db.internal");
        assert_eq!(descriptor.database, "issue_ai");
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn discovery_resolver_uses_configured_metadata_url() {
        let server = wiremock::MockServer::start().await;
        let mut config = explicit_config(server.uri());
        config.database.enabled = false;
        resolver_for(&config).await.unwrap();
        assert!(!server.received_requests().await.unwrap().is_empty());
    }

    #[test]
    fn stages_are_ordered_and_render_snake_case() {
        assert!(RunStage::Init < RunStage::ConnectionVerified);
        assert!(RunStage::RecordsLoaded < RunStage::Written);
        assert_eq!(RunStage::SchemaReady.to_string(), "schema_ready");
        assert_eq!(serde_json::to_value(RunStage::InputsValidated).unwrap(), "inputs_validated");
    }

    #[tokio::test]
    async fn merge_run_substitutes_sentinels_and_reports_them() {
        let dir = tempfile::tempdir().unwrap();
        let source = MemorySource::new()
            .with(
                DatasetKind::BaseIssues,
                vec![
                    json!({"projectId": "P1", "issueId": "1", "issueCreationDate": "2024-01-01"}),
                    json!({"projectId": "P1", "issueId": "2", "issueCreationDate": "2024-01-02"}),
                ],
            )
            .with(
                DatasetKind::Descriptions,
                vec![json!({"projectId": "P1", "issueId": "2", "shortDescription": {"nested": true}})],
            )
            .with(DatasetKind::Classifications, vec![json!({"projectId": "P9", "issueId": "9"})])
            .with(DatasetKind::SimilarIssues, vec![json!({"projectId": "P9", "issueId": "9"})])
            .with(DatasetKind::TimelinePredictions, vec![json!({"projectId": "P9", "issueId": "9"})])
            .with(DatasetKind::ActionRecommendations, vec![json!({"projectId": "P9", "issueId": "9"})]);

        let outcome = MergeRun::new(
            Arc::new(source),
            dir.path().join("final.json"),
            dir.path().join("final.csv"),
            "1.0.0",
        )
        .run()
        .await
        .unwrap();

        assert_eq!(outcome.records.len(), 2);
        assert!(!outcome.records[0].is_sentinel());
        assert!(outcome.records[1].is_sentinel());
        assert_eq!(outcome.report.summary.sentinel_count, 1);
        assert_eq!(outcome.report.dataset_counts[&DatasetKind::BaseIssues], 2);
        let sentinel = &outcome.canonical_records()[1];
        assert!(sentinel.short_description.starts_with("Processing error: "));
        assert_eq!(sentinel.issue_start_date, "2024-01-02");
    }

    #[tokio::test]
    async fn unreachable_store_fails_at_init() {
        let store = Arc::new(MemoryTableStore::new("ml_results", &ML_RESULTS_SCHEMA).unreachable());
        let err = run_with(store).run(RecordSource::Records(vec![record("1")])).await.unwrap_err();
        assert_eq!(err.stage, RunStage::Init);
        assert!(matches!(err.source, RunFailure::ConnectionRefused { .. }));
    }

    #[tokio::test]
    async fn fresh_table_is_created_and_filled() {
        let store = Arc::new(MemoryTableStore::new("ml_results", &ML_RESULTS_SCHEMA));
        let report = run_with(store.clone())
            .run(RecordSource::Records(vec![record("1"), record("2")]))
            .await
            .unwrap();
        assert_eq!(report.table_status, TableStatus::Created);
        assert!(report.schema_drift.is_none());
        assert_eq!(report.database.total_rows_in_table, 2);
        assert_eq!(report.processing_stats.affected_rows, 2);
        assert_eq!(report.success_rate, "2/2 (100.0%)");
        assert_eq!(store.upsert_calls(), 1);
    }

    #[tokio::test]
    async fn missing_results_file_fails_after_schema_ready() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryTableStore::new("ml_results", &ML_RESULTS_SCHEMA));
        let err = run_with(store.clone())
            .run(RecordSource::File(dir.path().join("absent.json")))
            .await
            .unwrap_err();
        assert_eq!(err.stage, RunStage::SchemaReady);
        assert!(matches!(err.source, RunFailure::Input(InputError::ResultsMissing(_))));
        assert_eq!(store.upsert_calls(), 0);
    }

    #[tokio::test]
    async fn results_file_is_read_off_the_runtime_and_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("final.json");
        let rows = json!({"data": [
            {"Project ID": "P1", "Issue ID": "1", "Short Description": "one"},
            {"Project ID": "P1", "Issue ID": "2"}
        ]});
        std::fs::write(&path, rows.to_string()).unwrap();

        let store = Arc::new(MemoryTableStore::new("ml_results", &ML_RESULTS_SCHEMA));
        let report = run_with(store.clone()).run(RecordSource::File(path)).await.unwrap();
        assert_eq!(report.processing_stats.total_records, 2);
        assert_eq!(report.database.total_rows_in_table, 2);
        let stored = store.stored(&IssueKey::new("P1", "1").unwrap()).await.unwrap();
        assert_eq!(stored[2].as_deref(), Some("one"));
    }

    #[tokio::test]
    async fn batch_failure_reports_partial_outcome() {
        let store = Arc::new(MemoryTableStore::new("ml_results", &ML_RESULTS_SCHEMA).fail_on_call(2));
        let settings = WriterSettings {
            batch_size: 1,
            ..WriterSettings::default()
        };
        let err = PersistRun::new(store, settings)
            .run(RecordSource::Records(vec![record("1"), record("2"), record("3")]))
            .await
            .unwrap_err();
        assert_eq!(err.stage, RunStage::RecordsLoaded);
        let partial = err.partial().unwrap();
        assert_eq!(partial.submitted_rows, 1);
        assert_eq!(partial.database_errors, 1);
    }

    #[tokio::test]
    async fn drift_on_existing_table_is_reported_not_fatal() {
        let live = ML_RESULTS_SCHEMA
            .columns
            .iter()
            .filter(|c| c.name != "timeline_resolution_rationale")
            .map(|c| LiveColumn::new(c.name, c.sql_type, c.nullable))
            .collect();
        let store = Arc::new(MemoryTableStore::new("ml_results", &ML_RESULTS_SCHEMA).with_live_columns(live));
        let report = run_with(store).run(RecordSource::Records(vec![record("1")])).await.unwrap();
        assert_eq!(report.table_status, TableStatus::Existing);
        let drift = report.schema_drift.unwrap();
        assert!(!drift.valid);
        assert_eq!(drift.missing_columns, vec!["timeline_resolution_rationale".to_string()]);
        assert_eq!(report.database.total_rows_in_table, 1);
    }
}

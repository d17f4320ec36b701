use std::path::Path;
use std::sync::Arc;

use irec_core::{CanonicalRecord, IssueKey};
use irec_inputs::{InputPaths, JsonFileSource};
use irec_storage::{MemoryTableStore, TableStatus, WriterSettings, ML_RESULTS_SCHEMA};
use irec_sync::{MergeRun, PersistRun, RecordSource};
use serde_json::{json, Value};

fn write_json(path: &Path, value: Value) {
    std::fs::write(path, serde_json::to_vec_pretty(&value).unwrap()).unwrap();
}

fn write_inputs(dir: &Path) -> InputPaths {
    let paths = InputPaths {
        base_issues: dir.join("all_issues_features.json"),
        descriptions: dir.join("description_output.json"),
        classifications: dir.join("classification_output.json"),
        similar_issues: dir.join("similar_issues_output.json"),
        timeline_predictions: dir.join("timeline_predictions_output.json"),
        action_recommendations: dir.join("action_recommendations_output.json"),
    };
    write_json(
        &paths.base_issues,
        json!([
            {"projectId": "P1", "issueId": "1", "issueCreationDate": "2024-01-01"},
            {"projectId": "P1", "issueId": "2", "issueCreationDate": "2024-01-02"},
            {"projectId": "P2", "issueId": 3, "issueCreationDate": "2024-01-03"}
        ]),
    );
    write_json(
        &paths.descriptions,
        json!([
            {"projectId": "P1", "issueId": "1", "shortDescription": "Pump leak", "longDescription": "Seal failure on pump 4"},
            {"projectId": "P2", "issueId": "3", "shortDescription": "Late permit", "longDescription": "Permit stuck in review"}
        ]),
    );
    write_json(
        &paths.classifications,
        json!([
            {"projectId": "P1", "issueId": "1", "classification": "Mechanical"},
            {"projectId": "P1", "issueId": "2", "classification": "Staffing"}
        ]),
    );
    write_json(
        &paths.similar_issues,
        json!([
            {
                "projectId": "P1", "issueId": "1",
                "similarIssue1ProjectId": "P9", "similarIssue1IssueId": "77",
                "similarIssue1Name": "Valve leak", "similarIssue1StartDate": "2023-05-01",
                "similarIssue1ResolutionTime": "12"
            }
        ]),
    );
    write_json(
        &paths.timeline_predictions,
        json!([
            {
                "projectId": "P1", "issueId": "1",
                "timeAiPredictedTimeline": 14, "issueStartDate": "2024-02-01",
                "predictedEndDate": "2024-02-15", "timelineReasoning": "Parts on hand"
            }
        ]),
    );
    write_json(
        &paths.action_recommendations,
        json!([
            {
                "projectId": "P1", "issueId": "2",
                "immediateNextSteps": ["Post opening", "Reassign shifts"],
                "learnFromSimilarIssues": "Cross-train early",
                "strategicBestPractice": "Keep a bench"
            }
        ]),
    );
    paths
}

fn record(project: &str, issue: &str) -> CanonicalRecord {
    CanonicalRecord::empty_for(&IssueKey::new(project, issue).unwrap())
}

#[tokio::test]
async fn merge_exports_one_row_per_base_issue() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_inputs(dir.path());
    let json_path = dir.path().join("out/final_results.json");
    let sheet_path = dir.path().join("out/final_results.csv");

    let outcome = MergeRun::new(Arc::new(JsonFileSource::new(paths)), &json_path, &sheet_path, "1.0.0")
        .run()
        .await
        .unwrap();

    let doc: Value = serde_json::from_slice(&std::fs::read(&json_path).unwrap()).unwrap();
    assert_eq!(doc["metadata"]["totalRecords"], 3);
    let data = doc["data"].as_array().unwrap();
    assert_eq!(data.len(), 3);

    assert_eq!(data[0]["Short Description"], "Pump leak");
    assert_eq!(data[0]["Similar Issue 1 Name"], "Valve leak");
    assert_eq!(data[0]["Similar Issue 2 Name"], "");
    assert_eq!(data[0]["Issue Start Date"], "2024-02-01");
    assert_eq!(data[0]["Time AI Predicted Timeline"], "14");

    assert_eq!(data[1]["Short Description"], "");
    assert_eq!(data[1]["Project Issue class"], "Staffing");
    assert_eq!(data[1]["Issue Start Date"], "2024-01-02");
    assert_eq!(data[1]["Immediate next steps"], "Post opening\nReassign shifts");

    assert_eq!(data[2]["Issue ID"], "3");
    assert_eq!(data[2]["Project Issue class"], "");
    assert_eq!(data[2]["Short Description"], "Late permit");

    let summary = &outcome.report.summary;
    assert_eq!(summary.total_issues, 3);
    assert_eq!(summary.sentinel_count, 0);
    assert_eq!(summary.completion_rates.descriptions, "2/3 (66.7%)");
    assert_eq!(summary.completion_rates.similar_issues, "1/3 (33.3%)");

    let mut sheet = csv::Reader::from_path(&sheet_path).unwrap();
    assert_eq!(sheet.records().count(), 3);
    assert_eq!(outcome.report.manifest.len(), 2);
    assert!(outcome.report.output_files.manifest.exists());
}

#[tokio::test]
async fn merge_names_every_missing_input() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_inputs(dir.path());
    std::fs::remove_file(&paths.descriptions).unwrap();
    std::fs::remove_file(&paths.action_recommendations).unwrap();

    let err = MergeRun::new(
        Arc::new(JsonFileSource::new(paths)),
        dir.path().join("final.json"),
        dir.path().join("final.csv"),
        "1.0.0",
    )
    .run()
    .await
    .unwrap_err();

    let message = format!("{err:#}");
    assert!(message.contains("Description Output"));
    assert!(message.contains("Action Recommendations Output"));
    assert!(!dir.path().join("final.json").exists());
}

#[tokio::test]
async fn merged_file_persists_and_reruns_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_inputs(dir.path());
    let json_path = dir.path().join("final_results.json");
    MergeRun::new(
        Arc::new(JsonFileSource::new(paths)),
        &json_path,
        dir.path().join("final_results.csv"),
        "1.0.0",
    )
    .run()
    .await
    .unwrap();

    let store = Arc::new(MemoryTableStore::new("ml_results", &ML_RESULTS_SCHEMA));
    let run = PersistRun::new(store.clone(), WriterSettings::default());

    let first = run.run(RecordSource::File(json_path.clone())).await.unwrap();
    assert_eq!(first.table_status, TableStatus::Created);
    assert_eq!(first.processing_stats.submitted_rows, 3);
    assert_eq!(first.database.total_rows_in_table, 3);
    assert_eq!(first.database.engine, "memory");

    let second = run.run(RecordSource::File(json_path)).await.unwrap();
    assert_eq!(second.table_status, TableStatus::Existing);
    assert!(second.schema_drift.as_ref().unwrap().valid);
    assert_eq!(second.processing_stats.submitted_rows, 3);
    assert_eq!(second.processing_stats.affected_rows, 6);
    assert_eq!(second.database.total_rows_in_table, 3);

    let stored = store.stored(&IssueKey::new("P1", "2").unwrap()).await.unwrap();
    assert_eq!(stored[2], None);
    assert_eq!(stored[4].as_deref(), Some("Staffing"));
}

#[tokio::test]
async fn persist_chunks_truncates_and_rejects_keyless_rows() {
    let store = Arc::new(MemoryTableStore::new("ml_results", &ML_RESULTS_SCHEMA));
    let settings = WriterSettings {
        batch_size: 2,
        pipeline_version: "2.0.0".to_string(),
        ..WriterSettings::default()
    };

    let mut long_class = record("P1", "1");
    long_class.issue_class = "x".repeat(400);
    let mut keyless = record("P1", "2");
    keyless.issue_id = "   ".to_string();
    let records = vec![long_class, keyless, record("P1", "3"), record("P1", "4"), record("P1", "5")];

    let report = PersistRun::new(store.clone(), settings)
        .run(RecordSource::Records(records))
        .await
        .unwrap();

    assert_eq!(report.processing_stats.total_records, 5);
    assert_eq!(report.processing_stats.preparation_errors, 1);
    assert_eq!(report.processing_stats.submitted_rows, 4);
    assert_eq!(report.processing_stats.batch_count, 2);
    assert_eq!(report.success_rate, "4/5 (80.0%)");
    assert_eq!(store.upsert_calls(), 2);

    let stored = store.stored(&IssueKey::new("P1", "1").unwrap()).await.unwrap();
    assert_eq!(stored[4].as_deref().map(str::len), Some(300));
    assert_eq!(stored[27].as_deref(), Some("2.0.0"));
    assert_eq!(stored[28].as_deref(), Some("completed"));
}

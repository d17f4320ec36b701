//! Core domain model for issue record reconciliation.

use std::fmt;

use serde::de::{DeserializeOwned, Error as DeError};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "irec-core";

pub const SENTINEL_SHORT_PREFIX: &str = "Processing error";
pub const SENTINEL_LONG_DESCRIPTION: &str = "Please contact support for assistance";

/// Business key shared by every dataset and by the table's unique index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IssueKey {
    project_id: String,
    issue_id: String,
}

impl IssueKey {
    pub fn new(project_id: impl Into<String>, issue_id: impl Into<String>) -> Result<Self, KeyError> {
        let project_id = project_id.into();
        let issue_id = issue_id.into();
        if project_id.is_empty() {
            return Err(KeyError::EmptyProjectId);
        }
        if issue_id.is_empty() {
            return Err(KeyError::EmptyIssueId);
        }
        Ok(Self {
            project_id,
            issue_id,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn issue_id(&self) -> &str {
        &self.issue_id
    }
}

impl fmt::Display for IssueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.issue_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("project id is empty")]
    EmptyProjectId,
    #[error("issue id is empty")]
    EmptyIssueId,
    #[error(transparent)]
    Shape(#[from] FieldShapeError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldShapeError {
    #[error("field `{field}` holds a JSON {kind}, expected text")]
    NotText { field: &'static str, kind: &'static str },
}

/// Render an upstream JSON value as text.
///
/// Absent and `null` values yield `None`. Strings pass through, numbers and
/// booleans are formatted, arrays of scalars are joined with newlines.
pub fn json_text(field: &'static str, value: Option<&Value>) -> Result<Option<String>, FieldShapeError> {
    let Some(value) = value else {
        return Ok(None);
    };
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Array(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Array(_) | Value::Object(_) => {
                        return Err(FieldShapeError::NotText {
                            field,
                            kind: "nested array",
                        })
                    }
                    other => {
                        if let Some(text) = json_text(field, Some(other))? {
                            parts.push(text);
                        }
                    }
                }
            }
            Ok(Some(parts.join("\n")))
        }
        Value::Object(_) => Err(FieldShapeError::NotText {
            field,
            kind: "object",
        }),
    }
}

fn text_or_empty(field: &'static str, value: Option<&Value>) -> Result<String, FieldShapeError> {
    Ok(json_text(field, value)?.unwrap_or_default())
}

/// Identifies one of the six files the merge run consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    BaseIssues,
    Descriptions,
    Classifications,
    SimilarIssues,
    TimelinePredictions,
    ActionRecommendations,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 6] = [
        DatasetKind::BaseIssues,
        DatasetKind::Descriptions,
        DatasetKind::Classifications,
        DatasetKind::SimilarIssues,
        DatasetKind::TimelinePredictions,
        DatasetKind::ActionRecommendations,
    ];

    pub fn label(self) -> &'static str {
        match self {
            DatasetKind::BaseIssues => "All Issues Features",
            DatasetKind::Descriptions => "Description Output",
            DatasetKind::Classifications => "Classification Output",
            DatasetKind::SimilarIssues => "Similar Issues Output",
            DatasetKind::TimelinePredictions => "Timeline Predictions Output",
            DatasetKind::ActionRecommendations => "Action Recommendations Output",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Key fields as they arrive from upstream, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawKey {
    #[serde(default)]
    pub project_id: Option<Value>,
    #[serde(default)]
    pub issue_id: Option<Value>,
}

impl RawKey {
    pub fn new(project_id: impl Into<String>, issue_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(Value::String(project_id.into())),
            issue_id: Some(Value::String(issue_id.into())),
        }
    }

    pub fn resolve(&self) -> Result<IssueKey, KeyError> {
        let project_id = json_text("projectId", self.project_id.as_ref())?.unwrap_or_default();
        let issue_id = json_text("issueId", self.issue_id.as_ref())?.unwrap_or_default();
        IssueKey::new(project_id, issue_id)
    }

    /// Best-effort text of the project id, ignoring shape errors.
    pub fn project_text(&self) -> Option<String> {
        json_text("projectId", self.project_id.as_ref())
            .ok()
            .flatten()
            .filter(|s| !s.is_empty())
    }

    pub fn issue_text(&self) -> Option<String> {
        json_text("issueId", self.issue_id.as_ref())
            .ok()
            .flatten()
            .filter(|s| !s.is_empty())
    }
}

/// A row of one upstream dataset, addressable by its raw key.
pub trait DatasetRow: DeserializeOwned + Send + Sync {
    const DATASET: DatasetKind;

    fn raw_key(&self) -> &RawKey;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseIssue {
    #[serde(flatten)]
    pub key: RawKey,
    #[serde(default)]
    pub issue_creation_date: Option<Value>,
}

impl BaseIssue {
    pub fn creation_date(&self) -> Result<String, FieldShapeError> {
        text_or_empty("issueCreationDate", self.issue_creation_date.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Description {
    #[serde(flatten)]
    pub key: RawKey,
    #[serde(default)]
    pub short_description: Option<Value>,
    #[serde(default)]
    pub long_description: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    #[serde(flatten)]
    pub key: RawKey,
    #[serde(default)]
    pub classification: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarIssueSet {
    #[serde(flatten)]
    pub key: RawKey,
    #[serde(default)]
    pub similar_issue1_project_id: Option<Value>,
    #[serde(default)]
    pub similar_issue1_issue_id: Option<Value>,
    #[serde(default)]
    pub similar_issue1_name: Option<Value>,
    #[serde(default)]
    pub similar_issue1_start_date: Option<Value>,
    #[serde(default)]
    pub similar_issue1_resolution_time: Option<Value>,
    #[serde(default)]
    pub similar_issue2_project_id: Option<Value>,
    #[serde(default)]
    pub similar_issue2_issue_id: Option<Value>,
    #[serde(default)]
    pub similar_issue2_name: Option<Value>,
    #[serde(default)]
    pub similar_issue2_start_date: Option<Value>,
    #[serde(default)]
    pub similar_issue2_resolution_time: Option<Value>,
    #[serde(default)]
    pub similar_issue3_project_id: Option<Value>,
    #[serde(default)]
    pub similar_issue3_issue_id: Option<Value>,
    #[serde(default)]
    pub similar_issue3_name: Option<Value>,
    #[serde(default)]
    pub similar_issue3_start_date: Option<Value>,
    #[serde(default)]
    pub similar_issue3_resolution_time: Option<Value>,
}

impl SimilarIssueSet {
    /// Ranked slots, best match first.
    pub fn slots(&self) -> Result<[SimilarIssueSlot; 3], FieldShapeError> {
        Ok([
            SimilarIssueSlot::from_values(
                [
                    ("similarIssue1ProjectId", self.similar_issue1_project_id.as_ref()),
                    ("similarIssue1IssueId", self.similar_issue1_issue_id.as_ref()),
                    ("similarIssue1Name", self.similar_issue1_name.as_ref()),
                    ("similarIssue1StartDate", self.similar_issue1_start_date.as_ref()),
                    ("similarIssue1ResolutionTime", self.similar_issue1_resolution_time.as_ref()),
                ],
            )?,
            SimilarIssueSlot::from_values(
                [
                    ("similarIssue2ProjectId", self.similar_issue2_project_id.as_ref()),
                    ("similarIssue2IssueId", self.similar_issue2_issue_id.as_ref()),
                    ("similarIssue2Name", self.similar_issue2_name.as_ref()),
                    ("similarIssue2StartDate", self.similar_issue2_start_date.as_ref()),
                    ("similarIssue2ResolutionTime", self.similar_issue2_resolution_time.as_ref()),
                ],
            )?,
            SimilarIssueSlot::from_values(
                [
                    ("similarIssue3ProjectId", self.similar_issue3_project_id.as_ref()),
                    ("similarIssue3IssueId", self.similar_issue3_issue_id.as_ref()),
                    ("similarIssue3Name", self.similar_issue3_name.as_ref()),
                    ("similarIssue3StartDate", self.similar_issue3_start_date.as_ref()),
                    ("similarIssue3ResolutionTime", self.similar_issue3_resolution_time.as_ref()),
                ],
            )?,
        ])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelinePrediction {
    #[serde(flatten)]
    pub key: RawKey,
    #[serde(default)]
    pub time_ai_predicted_timeline: Option<Value>,
    #[serde(default)]
    pub issue_start_date: Option<Value>,
    #[serde(default)]
    pub predicted_end_date: Option<Value>,
    #[serde(default)]
    pub timeline_reasoning: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecommendation {
    #[serde(flatten)]
    pub key: RawKey,
    #[serde(default)]
    pub immediate_next_steps: Option<Value>,
    #[serde(default)]
    pub learn_from_similar_issues: Option<Value>,
    #[serde(default)]
    pub strategic_best_practice: Option<Value>,
}

macro_rules! dataset_row {
    ($ty:ty, $kind:expr) => {
        impl DatasetRow for $ty {
            const DATASET: DatasetKind = $kind;

            fn raw_key(&self) -> &RawKey {
                &self.key
            }
        }
    };
}

dataset_row!(BaseIssue, DatasetKind::BaseIssues);
dataset_row!(Description, DatasetKind::Descriptions);
dataset_row!(Classification, DatasetKind::Classifications);
dataset_row!(SimilarIssueSet, DatasetKind::SimilarIssues);
dataset_row!(TimelinePrediction, DatasetKind::TimelinePredictions);
dataset_row!(ActionRecommendation, DatasetKind::ActionRecommendations);

impl Description {
    pub fn short_text(&self) -> Result<String, FieldShapeError> {
        text_or_empty("shortDescription", self.short_description.as_ref())
    }

    pub fn long_text(&self) -> Result<String, FieldShapeError> {
        text_or_empty("longDescription", self.long_description.as_ref())
    }
}

impl Classification {
    pub fn label(&self) -> Result<String, FieldShapeError> {
        text_or_empty("classification", self.classification.as_ref())
    }
}

impl TimelinePrediction {
    pub fn predicted_timeline(&self) -> Result<String, FieldShapeError> {
        text_or_empty("timeAiPredictedTimeline", self.time_ai_predicted_timeline.as_ref())
    }

    /// `None` when the stage did not provide a start date at all.
    pub fn start_date(&self) -> Result<Option<String>, FieldShapeError> {
        json_text("issueStartDate", self.issue_start_date.as_ref())
    }

    pub fn end_date(&self) -> Result<String, FieldShapeError> {
        text_or_empty("predictedEndDate", self.predicted_end_date.as_ref())
    }

    pub fn rationale(&self) -> Result<String, FieldShapeError> {
        text_or_empty("timelineReasoning", self.timeline_reasoning.as_ref())
    }
}

impl ActionRecommendation {
    pub fn next_steps(&self) -> Result<String, FieldShapeError> {
        text_or_empty("immediateNextSteps", self.immediate_next_steps.as_ref())
    }

    pub fn peer_learning(&self) -> Result<String, FieldShapeError> {
        text_or_empty("learnFromSimilarIssues", self.learn_from_similar_issues.as_ref())
    }

    pub fn strategic_practice(&self) -> Result<String, FieldShapeError> {
        text_or_empty("strategicBestPractice", self.strategic_best_practice.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimilarIssueSlot {
    pub project_id: String,
    pub issue_id: String,
    pub name: String,
    pub start_date: String,
    pub resolution_time: String,
}

impl SimilarIssueSlot {
    fn from_values(values: [(&'static str, Option<&Value>); 5]) -> Result<Self, FieldShapeError> {
        let [project_id, issue_id, name, start_date, resolution_time] = values;
        Ok(Self {
            project_id: text_or_empty(project_id.0, project_id.1)?,
            issue_id: text_or_empty(issue_id.0, issue_id.1)?,
            name: text_or_empty(name.0, name.1)?,
            start_date: text_or_empty(start_date.0, start_date.1)?,
            resolution_time: text_or_empty(resolution_time.0, resolution_time.1)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.project_id.is_empty()
            && self.issue_id.is_empty()
            && self.name.is_empty()
            && self.start_date.is_empty()
            && self.resolution_time.is_empty()
    }
}

pub const EXPORT_COLUMN_COUNT: usize = 27;

/// Header row of the canonical export, in sheet order.
pub const EXPORT_HEADERS: [&str; EXPORT_COLUMN_COUNT] = [
    "Project ID",
    "Issue ID",
    "Short Description",
    "Long Description",
    "Project Issue class",
    "Similar Issue 1 Project ID",
    "Similar Issue 1 Issue ID",
    "Similar Issue 1 Name",
    "Similar Issue 1 Start Date",
    "Similar Issue 1 Resolution Time",
    "Similar Issue 2 Project ID",
    "Similar Issue 2 Issue ID",
    "Similar Issue 2 Name",
    "Similar Issue 2 Start Date",
    "Similar Issue 2 Resolution Time",
    "Similar Issue 3 Project ID",
    "Similar Issue 3 Issue ID",
    "Similar Issue 3 Name",
    "Similar Issue 3 Start Date",
    "Similar Issue 3 Resolution Time",
    "Time AI Predicted Timeline",
    "Issue Start Date",
    "Predicted End Date",
    "Timeline Resolution Rationale",
    "Immediate next steps",
    "Learn from similar Issues",
    "Strategic Best practice",
];

/// One joined row per base issue. Every field but the key defaults to empty.
///
/// The key fields are kept as plain text so records read back from an export
/// can be rejected at write time instead of failing to parse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalRecord {
    pub project_id: String,
    pub issue_id: String,
    pub short_description: String,
    pub long_description: String,
    pub issue_class: String,
    pub similar: [SimilarIssueSlot; 3],
    pub predicted_timeline: String,
    pub issue_start_date: String,
    pub predicted_end_date: String,
    pub timeline_rationale: String,
    pub next_steps: String,
    pub peer_learning: String,
    pub strategic_practice: String,
}

impl CanonicalRecord {
    pub fn empty_for(key: &IssueKey) -> Self {
        Self {
            project_id: key.project_id().to_string(),
            issue_id: key.issue_id().to_string(),
            ..Default::default()
        }
    }

    /// Placeholder for an issue whose merge failed.
    pub fn sentinel(
        project_id: impl Into<String>,
        issue_id: impl Into<String>,
        issue_start_date: impl Into<String>,
        cause: &str,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            issue_id: issue_id.into(),
            short_description: format!("{SENTINEL_SHORT_PREFIX}: {cause}"),
            long_description: SENTINEL_LONG_DESCRIPTION.to_string(),
            issue_start_date: issue_start_date.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> Result<IssueKey, KeyError> {
        IssueKey::new(self.project_id.clone(), self.issue_id.clone())
    }

    /// Cell values aligned with [`EXPORT_HEADERS`].
    pub fn cells(&self) -> [&str; EXPORT_COLUMN_COUNT] {
        let [s1, s2, s3] = &self.similar;
        [
            &self.project_id,
            &self.issue_id,
            &self.short_description,
            &self.long_description,
            &self.issue_class,
            &s1.project_id,
            &s1.issue_id,
            &s1.name,
            &s1.start_date,
            &s1.resolution_time,
            &s2.project_id,
            &s2.issue_id,
            &s2.name,
            &s2.start_date,
            &s2.resolution_time,
            &s3.project_id,
            &s3.issue_id,
            &s3.name,
            &s3.start_date,
            &s3.resolution_time,
            &self.predicted_timeline,
            &self.issue_start_date,
            &self.predicted_end_date,
            &self.timeline_rationale,
            &self.next_steps,
            &self.peer_learning,
            &self.strategic_practice,
        ]
    }

    pub fn from_cells(cells: [String; EXPORT_COLUMN_COUNT]) -> Self {
        let [project_id, issue_id, short_description, long_description, issue_class, s1_project_id, s1_issue_id, s1_name, s1_start_date, s1_resolution_time, s2_project_id, s2_issue_id, s2_name, s2_start_date, s2_resolution_time, s3_project_id, s3_issue_id, s3_name, s3_start_date, s3_resolution_time, predicted_timeline, issue_start_date, predicted_end_date, timeline_rationale, next_steps, peer_learning, strategic_practice] =
            cells;
        Self {
            project_id,
            issue_id,
            short_description,
            long_description,
            issue_class,
            similar: [
                SimilarIssueSlot {
                    project_id: s1_project_id,
                    issue_id: s1_issue_id,
                    name: s1_name,
                    start_date: s1_start_date,
                    resolution_time: s1_resolution_time,
                },
                SimilarIssueSlot {
                    project_id: s2_project_id,
                    issue_id: s2_issue_id,
                    name: s2_name,
                    start_date: s2_start_date,
                    resolution_time: s2_resolution_time,
                },
                SimilarIssueSlot {
                    project_id: s3_project_id,
                    issue_id: s3_issue_id,
                    name: s3_name,
                    start_date: s3_start_date,
                    resolution_time: s3_resolution_time,
                },
            ],
            predicted_timeline,
            issue_start_date,
            predicted_end_date,
            timeline_rationale,
            next_steps,
            peer_learning,
            strategic_practice,
        }
    }
}

impl Serialize for CanonicalRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(EXPORT_COLUMN_COUNT))?;
        for (header, cell) in EXPORT_HEADERS.iter().zip(self.cells()) {
            map.serialize_entry(header, cell)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for CanonicalRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut raw = Map::<String, Value>::deserialize(deserializer)?;
        let mut cells: [String; EXPORT_COLUMN_COUNT] = Default::default();
        for (cell, header) in cells.iter_mut().zip(EXPORT_HEADERS) {
            let value = raw.remove(header);
            *cell = text_or_empty(header, value.as_ref()).map_err(D::Error::custom)?;
        }
        Ok(Self::from_cells(cells))
    }
}

/// Outcome of merging one base issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciledRecord {
    Merged(CanonicalRecord),
    /// Substituted placeholder; `position` is the 1-based input index.
    Sentinel {
        record: CanonicalRecord,
        position: usize,
        cause: String,
    },
}

impl ReconciledRecord {
    pub fn record(&self) -> &CanonicalRecord {
        match self {
            ReconciledRecord::Merged(record) => record,
            ReconciledRecord::Sentinel { record, .. } => record,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, ReconciledRecord::Sentinel { .. })
    }
}

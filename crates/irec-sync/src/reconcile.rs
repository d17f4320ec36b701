//! Joins the base issue list with the five annotation datasets.

use std::collections::HashMap;

use irec_core::{
    ActionRecommendation, BaseIssue, CanonicalRecord, Classification, DatasetRow, Description, FieldShapeError,
    IssueKey, KeyError, ReconciledRecord, SimilarIssueSet, TimelinePrediction,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("invalid issue key: {0}")]
    Key(#[from] KeyError),
    #[error(transparent)]
    Shape(#[from] FieldShapeError),
}

/// Key to row, last occurrence wins. Rows without a usable key are dropped.
pub fn build_lookup<T: DatasetRow>(rows: Vec<T>) -> HashMap<IssueKey, T> {
    let total = rows.len();
    let mut lookup = HashMap::with_capacity(total);
    let mut skipped = 0usize;
    for row in rows {
        match row.raw_key().resolve() {
            Ok(key) => {
                lookup.insert(key, row);
            }
            Err(_) => skipped += 1,
        }
    }
    debug!(dataset = %T::DATASET, total, keyed = lookup.len(), skipped, "built lookup");
    lookup
}

/// The five upstream datasets as consumed by [`reconcile`].
#[derive(Debug, Clone, Default)]
pub struct ReconcileInput {
    pub base_issues: Vec<BaseIssue>,
    pub descriptions: Vec<Description>,
    pub classifications: Vec<Classification>,
    pub similar_issues: Vec<SimilarIssueSet>,
    pub timelines: Vec<TimelinePrediction>,
    pub actions: Vec<ActionRecommendation>,
}

pub struct Reconciler {
    descriptions: HashMap<IssueKey, Description>,
    classifications: HashMap<IssueKey, Classification>,
    similar_issues: HashMap<IssueKey, SimilarIssueSet>,
    timelines: HashMap<IssueKey, TimelinePrediction>,
    actions: HashMap<IssueKey, ActionRecommendation>,
}

impl Reconciler {
    pub fn new(
        descriptions: Vec<Description>,
        classifications: Vec<Classification>,
        similar_issues: Vec<SimilarIssueSet>,
        timelines: Vec<TimelinePrediction>,
        actions: Vec<ActionRecommendation>,
    ) -> Self {
        let reconciler = Self {
            descriptions: build_lookup(descriptions),
            classifications: build_lookup(classifications),
            similar_issues: build_lookup(similar_issues),
            timelines: build_lookup(timelines),
            actions: build_lookup(actions),
        };
        info!(
            descriptions = reconciler.descriptions.len(),
            classifications = reconciler.classifications.len(),
            similar_issues = reconciler.similar_issues.len(),
            timelines = reconciler.timelines.len(),
            actions = reconciler.actions.len(),
            "annotation lookups ready"
        );
        reconciler
    }

    pub fn merge(&self, issue: &BaseIssue) -> Result<CanonicalRecord, MergeError> {
        let key = issue.key.resolve()?;
        let mut record = CanonicalRecord::empty_for(&key);

        if let Some(desc) = self.descriptions.get(&key) {
            record.short_description = desc.short_text()?;
            record.long_description = desc.long_text()?;
        }
        if let Some(class) = self.classifications.get(&key) {
            record.issue_class = class.label()?;
        }
        if let Some(similar) = self.similar_issues.get(&key) {
            record.similar = similar.slots()?;
        }

        let timeline_start = match self.timelines.get(&key) {
            Some(timeline) => {
                record.predicted_timeline = timeline.predicted_timeline()?;
                record.predicted_end_date = timeline.end_date()?;
                record.timeline_rationale = timeline.rationale()?;
                timeline.start_date()?
            }
            None => None,
        };
        record.issue_start_date = match timeline_start.filter(|d| !d.trim().is_empty()) {
            Some(start) => start,
            None => issue.creation_date()?,
        };

        if let Some(action) = self.actions.get(&key) {
            record.next_steps = action.next_steps()?;
            record.peer_learning = action.peer_learning()?;
            record.strategic_practice = action.strategic_practice()?;
        }
        Ok(record)
    }

    /// Merges one issue, substituting a sentinel when the merge fails.
    /// `position` is 1-based.
    pub fn reconcile_one(&self, position: usize, issue: &BaseIssue) -> ReconciledRecord {
        match self.merge(issue) {
            Ok(record) => ReconciledRecord::Merged(record),
            Err(err) => {
                let cause = err.to_string();
                warn!(position, error = %cause, "issue merge failed, substituting sentinel");
                let record = CanonicalRecord::sentinel(
                    issue.key.project_text().unwrap_or_else(|| "Unknown".to_string()),
                    issue.key.issue_text().unwrap_or_else(|| format!("Issue_{position}")),
                    issue.creation_date().unwrap_or_default(),
                    &cause,
                );
                ReconciledRecord::Sentinel {
                    record,
                    position,
                    cause,
                }
            }
        }
    }

    /// One output per base issue, in input order.
    pub fn reconcile(&self, base_issues: &[BaseIssue]) -> Vec<ReconciledRecord> {
        let total = base_issues.len();
        let out = base_issues
            .iter()
            .enumerate()
            .map(|(index, issue)| {
                let position = index + 1;
                if position % 100 == 0 {
                    debug!(position, total, "reconcile progress");
                }
                self.reconcile_one(position, issue)
            })
            .collect::<Vec<_>>();
        let sentinels = out.iter().filter(|r| r.is_sentinel()).count();
        info!(total, sentinels, "reconciliation complete");
        out
    }
}

pub fn reconcile(input: ReconcileInput) -> Vec<ReconciledRecord> {
    let ReconcileInput {
        base_issues,
        descriptions,
        classifications,
        similar_issues,
        timelines,
        actions,
    } = input;
    Reconciler::new(descriptions, classifications, similar_issues, timelines, actions).reconcile(&base_issues)
}

pub fn ratio(count: usize, total: usize) -> String {
    if total == 0 {
        return "0/0 (0%)".to_string();
    }
    format!("{count}/{total} ({:.1}%)", count as f64 * 100.0 / total as f64)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionRates {
    pub descriptions: String,
    pub classifications: String,
    pub similar_issues: String,
    pub timeline_predictions: String,
    pub action_recommendations: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub total_issues: usize,
    pub completion_rates: CompletionRates,
    pub sentinel_count: usize,
}

/// Per-stage coverage over merged records; sentinels count as uncovered.
pub fn summarize(records: &[ReconciledRecord]) -> MergeSummary {
    let total = records.len();
    let merged = records
        .iter()
        .filter_map(|r| match r {
            ReconciledRecord::Merged(record) => Some(record),
            ReconciledRecord::Sentinel { .. } => None,
        })
        .collect::<Vec<_>>();
    let covered = |has: fn(&CanonicalRecord) -> bool| ratio(merged.iter().filter(|r| has(r)).count(), total);

    MergeSummary {
        total_issues: total,
        completion_rates: CompletionRates {
            descriptions: covered(|r| !r.short_description.is_empty()),
            classifications: covered(|r| !r.issue_class.is_empty()),
            similar_issues: covered(|r| !r.similar[0].name.is_empty()),
            timeline_predictions: covered(|r| !r.predicted_timeline.is_empty()),
            action_recommendations: covered(|r| !r.next_steps.is_empty()),
        },
        sentinel_count: total - merged.len(),
    }
}

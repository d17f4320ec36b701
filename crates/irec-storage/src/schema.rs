//! Declared layout of the results table and drift detection against the live table.

use serde::Serialize;
use tracing::{info, warn};

use crate::{StorageError, TableStore};

pub const SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub sql_type: &'static str,
    pub nullable: bool,
    pub default: Option<&'static str>,
    pub auto_increment: bool,
    pub comment: &'static str,
}

impl ColumnSpec {
    const fn new(name: &'static str, sql_type: &'static str, nullable: bool, comment: &'static str) -> Self {
        Self {
            name,
            sql_type,
            nullable,
            default: None,
            auto_increment: false,
            comment,
        }
    }

    const fn with_default(mut self, default: &'static str) -> Self {
        self.default = Some(default);
        self
    }

    const fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Character width of a `VARCHAR(n)` / `CHAR(n)` column.
    pub fn width(&self) -> Option<usize> {
        if !matches!(TypeFamily::of(self.sql_type), TypeFamily::Varchar) {
            return None;
        }
        let open = self.sql_type.find('(')?;
        let close = self.sql_type[open..].find(')')? + open;
        self.sql_type[open + 1..close].trim().parse().ok()
    }

    fn definition(&self) -> String {
        let mut def = format!("{} {}", quote_ident(self.name), self.sql_type);
        def.push_str(if self.nullable { " NULL" } else { " NOT NULL" });
        if self.auto_increment {
            def.push_str(" AUTO_INCREMENT");
        }
        if let Some(default) = self.default {
            def.push_str(" DEFAULT ");
            def.push_str(default);
        }
        def.push_str(&format!(" COMMENT '{}'", self.comment.replace('\'', "''")));
        def
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    pub unique: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaSpec {
    pub version: &'static str,
    pub primary_key: &'static [&'static str],
    pub columns: &'static [ColumnSpec],
    pub indexes: &'static [IndexSpec],
}

pub static ML_RESULTS_SCHEMA: SchemaSpec = SchemaSpec {
    version: SCHEMA_VERSION,
    primary_key: &["id"],
    columns: &[
        ColumnSpec::new("id", "BIGINT", false, "Auto-incrementing primary key").auto_increment(),
        ColumnSpec::new("project_id", "VARCHAR(100)", false, "Project identifier - part of business key"),
        ColumnSpec::new("issue_id", "VARCHAR(100)", false, "Issue identifier - part of business key"),
        ColumnSpec::new("short_description", "TEXT", true, "Generated short description of the issue"),
        ColumnSpec::new("long_description", "LONGTEXT", true, "Generated detailed description of the issue"),
        ColumnSpec::new("project_issue_class", "VARCHAR(300)", true, "Classified issue category"),
        ColumnSpec::new("similar_issue_1_project_id", "VARCHAR(100)", true, "First similar issue project ID"),
        ColumnSpec::new("similar_issue_1_issue_id", "VARCHAR(100)", true, "First similar issue ID"),
        ColumnSpec::new("similar_issue_1_name", "TEXT", true, "First similar issue name"),
        ColumnSpec::new("similar_issue_1_start_date", "VARCHAR(50)", true, "First similar issue start date"),
        ColumnSpec::new("similar_issue_1_resolution_time", "VARCHAR(50)", true, "First similar issue resolution time"),
        ColumnSpec::new("similar_issue_2_project_id", "VARCHAR(100)", true, "Second similar issue project ID"),
        ColumnSpec::new("similar_issue_2_issue_id", "VARCHAR(100)", true, "Second similar issue ID"),
        ColumnSpec::new("similar_issue_2_name", "TEXT", true, "Second similar issue name"),
        ColumnSpec::new("similar_issue_2_start_date", "VARCHAR(50)", true, "Second similar issue start date"),
        ColumnSpec::new("similar_issue_2_resolution_time", "VARCHAR(50)", true, "Second similar issue resolution time"),
        ColumnSpec::new("similar_issue_3_project_id", "VARCHAR(100)", true, "Third similar issue project ID"),
        ColumnSpec::new("similar_issue_3_issue_id", "VARCHAR(100)", true, "Third similar issue ID"),
        ColumnSpec::new("similar_issue_3_name", "TEXT", true, "Third similar issue name"),
        ColumnSpec::new("similar_issue_3_start_date", "VARCHAR(50)", true, "Third similar issue start date"),
        ColumnSpec::new("similar_issue_3_resolution_time", "VARCHAR(50)", true, "Third similar issue resolution time"),
        ColumnSpec::new("time_ai_predicted_timeline", "VARCHAR(50)", true, "Predicted timeline in days"),
        ColumnSpec::new("issue_start_date", "VARCHAR(50)", true, "Issue creation/start date"),
        ColumnSpec::new("predicted_end_date", "VARCHAR(50)", true, "Predicted completion date"),
        ColumnSpec::new("timeline_resolution_rationale", "LONGTEXT", true, "Explanation for the timeline prediction"),
        ColumnSpec::new("immediate_next_steps", "LONGTEXT", true, "Recommended immediate next steps"),
        ColumnSpec::new("learn_from_similar_issues", "LONGTEXT", true, "Recommendations drawn from similar issues"),
        ColumnSpec::new("strategic_best_practice", "LONGTEXT", true, "Recommended strategic best practices"),
        ColumnSpec::new("created_at", "TIMESTAMP", false, "Record creation timestamp").with_default("CURRENT_TIMESTAMP"),
        ColumnSpec::new("updated_at", "TIMESTAMP", false, "Record last update timestamp")
            .with_default("CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP"),
        ColumnSpec::new("ml_pipeline_version", "VARCHAR(50)", true, "Pipeline version that produced the row")
            .with_default("'1.0.0'"),
        ColumnSpec::new(
            "processing_status",
            "ENUM('pending','completed','error')",
            true,
            "Processing status of the row",
        )
        .with_default("'completed'"),
    ],
    indexes: &[
        IndexSpec {
            name: "idx_project_issue",
            columns: &["project_id", "issue_id"],
            unique: true,
        },
        IndexSpec {
            name: "idx_created_at",
            columns: &["created_at"],
            unique: false,
        },
        IndexSpec {
            name: "idx_updated_at",
            columns: &["updated_at"],
            unique: false,
        },
        IndexSpec {
            name: "idx_issue_class",
            columns: &["project_issue_class"],
            unique: false,
        },
        IndexSpec {
            name: "idx_processing_status",
            columns: &["processing_status"],
            unique: false,
        },
    ],
};

impl SchemaSpec {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Idempotent DDL. Every index is declared inline so no follow-up
    /// `CREATE INDEX` statement is needed.
    pub fn create_table_sql(&self, table: &str) -> String {
        let mut parts = self
            .columns
            .iter()
            .map(ColumnSpec::definition)
            .collect::<Vec<_>>();
        if !self.primary_key.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", quote_list(self.primary_key)));
        }
        for index in self.indexes {
            let kind = if index.unique { "UNIQUE KEY" } else { "KEY" };
            parts.push(format!(
                "{kind} {} ({})",
                quote_ident(index.name),
                quote_list(index.columns)
            ));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  {}\n) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci COMMENT='Issue results - schema version {}'",
            quote_ident(table),
            parts.join(",\n  "),
            self.version
        )
    }
}

pub fn create_database_sql(database: &str) -> String {
    format!(
        "CREATE DATABASE IF NOT EXISTS {} CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci",
        quote_ident(database)
    )
}

pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn quote_list(names: &[&str]) -> String {
    names.iter().map(|n| quote_ident(n)).collect::<Vec<_>>().join(", ")
}

/// Names interpolated into DDL must be plain MySQL identifiers.
pub fn is_plain_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Engine-reported types are compared by family, not by exact spelling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeFamily {
    Integer,
    Varchar,
    Text,
    Temporal,
    Enum,
    Other(String),
}

impl TypeFamily {
    pub fn of(sql_type: &str) -> Self {
        let base = sql_type
            .trim()
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        match base.as_str() {
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" => TypeFamily::Integer,
            "CHAR" | "VARCHAR" => TypeFamily::Varchar,
            "TINYTEXT" | "TEXT" | "MEDIUMTEXT" | "LONGTEXT" => TypeFamily::Text,
            "TIMESTAMP" | "DATETIME" => TypeFamily::Temporal,
            "ENUM" => TypeFamily::Enum,
            _ => TypeFamily::Other(base),
        }
    }
}

pub fn types_compatible(expected: &str, actual: &str) -> bool {
    TypeFamily::of(expected) == TypeFamily::of(actual)
}

/// A column as reported by the live table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveColumn {
    pub name: String,
    pub column_type: String,
    pub nullable: bool,
}

impl LiveColumn {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
            nullable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeMismatch {
    pub column: String,
    pub expected: String,
    pub actual: String,
}

/// Differences between the declared schema and the live table.
///
/// Extra columns are reported but do not make the table invalid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaDrift {
    pub valid: bool,
    pub table_exists: bool,
    pub missing_columns: Vec<String>,
    pub extra_columns: Vec<String>,
    pub type_mismatches: Vec<TypeMismatch>,
}

impl SchemaDrift {
    pub fn table_missing(spec: &SchemaSpec) -> Self {
        Self {
            valid: false,
            table_exists: false,
            missing_columns: spec.columns.iter().map(|c| c.name.to_string()).collect(),
            extra_columns: Vec::new(),
            type_mismatches: Vec::new(),
        }
    }

    pub fn has_drift(&self) -> bool {
        !self.missing_columns.is_empty()
            || !self.extra_columns.is_empty()
            || !self.type_mismatches.is_empty()
    }
}

pub fn compare_columns(spec: &SchemaSpec, live: &[LiveColumn]) -> SchemaDrift {
    let missing_columns = spec
        .columns
        .iter()
        .filter(|c| !live.iter().any(|l| l.name.eq_ignore_ascii_case(c.name)))
        .map(|c| c.name.to_string())
        .collect::<Vec<_>>();

    let extra_columns = live
        .iter()
        .filter(|l| spec.column(&l.name).is_none())
        .map(|l| l.name.clone())
        .collect::<Vec<_>>();

    let type_mismatches = live
        .iter()
        .filter_map(|l| {
            let declared = spec.column(&l.name)?;
            (!types_compatible(declared.sql_type, &l.column_type)).then(|| TypeMismatch {
                column: declared.name.to_string(),
                expected: declared.sql_type.to_string(),
                actual: l.column_type.clone(),
            })
        })
        .collect::<Vec<_>>();

    SchemaDrift {
        valid: missing_columns.is_empty() && type_mismatches.is_empty(),
        table_exists: true,
        missing_columns,
        extra_columns,
        type_mismatches,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Created,
    Existing,
}

/// Snapshot of the live table for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    pub table: String,
    pub exists: bool,
    pub row_count: u64,
    pub columns: Vec<LiveColumn>,
}

/// Creates the database and table on demand and reports drift.
pub struct SchemaManager<'a> {
    store: &'a dyn TableStore,
}

impl<'a> SchemaManager<'a> {
    pub fn new(store: &'a dyn TableStore) -> Self {
        Self { store }
    }

    pub async fn ensure_database(&self) -> Result<(), StorageError> {
        let database = &self.store.target().database;
        self.store.create_database().await?;
        info!(database = %database, "database ready");
        Ok(())
    }

    pub async fn ensure_table(&self) -> Result<TableStatus, StorageError> {
        let table = &self.store.target().table;
        if self.store.table_exists().await? {
            info!(table = %table, "table already exists");
            return Ok(TableStatus::Existing);
        }
        info!(table = %table, "creating table");
        self.store.create_table().await?;
        Ok(TableStatus::Created)
    }

    pub async fn validate(&self) -> Result<SchemaDrift, StorageError> {
        let spec = self.store.schema();
        if !self.store.table_exists().await? {
            return Ok(SchemaDrift::table_missing(spec));
        }
        let live = self.store.live_columns().await?;
        let drift = compare_columns(spec, &live);
        if drift.has_drift() {
            warn!(
                table = %self.store.target().table,
                missing = ?drift.missing_columns,
                extra = ?drift.extra_columns,
                mismatched = drift.type_mismatches.len(),
                "schema drift detected"
            );
        }
        Ok(drift)
    }

    pub async fn table_info(&self) -> Result<TableInfo, StorageError> {
        let table = self.store.target().table.clone();
        if !self.store.table_exists().await? {
            return Ok(TableInfo {
                table,
                exists: false,
                row_count: 0,
                columns: Vec::new(),
            });
        }
        Ok(TableInfo {
            table,
            exists: true,
            row_count: self.store.row_count().await?,
            columns: self.store.live_columns().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTableStore;

    fn live_from_schema() -> Vec<LiveColumn> {
        ML_RESULTS_SCHEMA
            .columns
            .iter()
            .map(|c| LiveColumn::new(c.name, c.sql_type.to_ascii_lowercase(), c.nullable))
            .collect()
    }

    #[test]
    fn widths_come_from_varchar_declarations() {
        let spec = &ML_RESULTS_SCHEMA;
        assert_eq!(spec.column("project_id").unwrap().width(), Some(100));
        assert_eq!(spec.column("project_issue_class").unwrap().width(), Some(300));
        assert_eq!(spec.column("predicted_end_date").unwrap().width(), Some(50));
        assert_eq!(spec.column("long_description").unwrap().width(), None);
        assert_eq!(spec.column("processing_status").unwrap().width(), None);
    }

    #[test]
    fn create_table_declares_business_key_and_secondary_indexes() {
        let sql = ML_RESULTS_SCHEMA.create_table_sql("ml_results");
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS `ml_results`"));
        assert!(sql.contains("UNIQUE KEY `idx_project_issue` (`project_id`, `issue_id`)"));
        assert!(sql.contains("KEY `idx_processing_status` (`processing_status`)"));
        assert!(sql.contains("KEY `idx_created_at` (`created_at`)"));
        assert!(sql.contains("PRIMARY KEY (`id`)"));
        assert!(sql.contains("`id` BIGINT NOT NULL AUTO_INCREMENT"));
        assert!(sql.contains("DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP"));
        assert!(!sql.contains("CREATE INDEX"));
    }

    #[test]
    fn create_database_is_idempotent_and_quoted() {
        assert_eq!(
            create_database_sql("issue_ai"),
            "CREATE DATABASE IF NOT EXISTS `issue_ai` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci"
        );
    }

    #[test]
    fn identifiers_are_restricted() {
        assert!(is_plain_identifier("ml_results"));
        assert!(is_plain_identifier("db$2"));
        assert!(!is_plain_identifier("ml results"));
        assert!(!is_plain_identifier("x`; DROP TABLE y"));
        assert!(!is_plain_identifier(""));
    }

    #[test]
    fn type_families_absorb_engine_spelling() {
        assert!(types_compatible("BIGINT", "int(11)"));
        assert!(types_compatible("BIGINT", "bigint unsigned"));
        assert!(types_compatible("VARCHAR(100)", "varchar(255)"));
        assert!(types_compatible("VARCHAR(50)", "char(10)"));
        assert!(types_compatible("LONGTEXT", "mediumtext"));
        assert!(types_compatible("TIMESTAMP", "datetime"));
        assert!(types_compatible("ENUM('pending','completed','error')", "enum('a','b')"));
        assert!(!types_compatible("VARCHAR(100)", "text"));
        assert!(!types_compatible("TIMESTAMP", "varchar(50)"));
    }

    #[test]
    fn matching_table_has_no_drift() {
        let drift = compare_columns(&ML_RESULTS_SCHEMA, &live_from_schema());
        assert!(drift.valid);
        assert!(!drift.has_drift());
    }

    #[test]
    fn drift_classifies_missing_extra_and_mismatched() {
        let mut live = live_from_schema();
        live.retain(|c| c.name != "strategic_best_practice");
        live.push(LiveColumn::new("legacy_score", "double", true));
        for column in &mut live {
            if column.name == "issue_start_date" {
                column.column_type = "date".into();
            }
        }

        let drift = compare_columns(&ML_RESULTS_SCHEMA, &live);
        assert!(!drift.valid);
        assert_eq!(drift.missing_columns, vec!["strategic_best_practice".to_string()]);
        assert_eq!(drift.extra_columns, vec!["legacy_score".to_string()]);
        assert_eq!(drift.type_mismatches.len(), 1);
        assert_eq!(drift.type_mismatches[0].column, "issue_start_date");
        assert_eq!(drift.type_mismatches[0].actual, "date");
    }

    #[test]
    fn extra_columns_alone_keep_table_valid() {
        let mut live = live_from_schema();
        live.push(LiveColumn::new("reviewer_notes", "text", true));
        let drift = compare_columns(&ML_RESULTS_SCHEMA, &live);
        assert!(drift.valid);
        assert!(drift.has_drift());
    }

    #[test]
    fn missing_table_reports_every_column() {
        let drift = SchemaDrift::table_missing(&ML_RESULTS_SCHEMA);
        assert!(!drift.valid);
        assert!(!drift.table_exists);
        assert_eq!(drift.missing_columns.len(), ML_RESULTS_SCHEMA.columns.len());
    }

    #[tokio::test]
    async fn manager_creates_table_once_and_describes_it() {
        let store = MemoryTableStore::new("ml_results", &ML_RESULTS_SCHEMA);
        let manager = SchemaManager::new(&store);

        let before = manager.table_info().await.unwrap();
        assert!(!before.exists);
        assert!(!manager.validate().await.unwrap().table_exists);

        manager.ensure_database().await.unwrap();
        assert_eq!(manager.ensure_table().await.unwrap(), TableStatus::Created);
        assert_eq!(manager.ensure_table().await.unwrap(), TableStatus::Existing);

        let info = manager.table_info().await.unwrap();
        assert!(info.exists);
        assert_eq!(info.row_count, 0);
        assert_eq!(info.columns.len(), ML_RESULTS_SCHEMA.columns.len());
        assert!(manager.validate().await.unwrap().valid);
    }
}

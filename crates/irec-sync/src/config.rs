//! Pipeline configuration: YAML file overlaid with `IREC_*` environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use irec_inputs::InputPaths;
use irec_storage::endpoint::DEFAULT_ENGINES;
use irec_storage::schema::is_plain_identifier;
use irec_storage::writer::{MAX_PLACEHOLDERS, UPSERT_COLUMNS};
use irec_storage::{EndpointRequest, WriterSettings, SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "irec.yaml";
pub const CONFIG_PATH_ENV: &str = "IREC_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("environment variable {name} has invalid value `{value}`")]
    Env { name: &'static str, value: String },
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    pub logging: LoggingSection,
    pub data_paths: DataPaths,
    pub database: DatabaseSection,
    pub discovery: DiscoverySection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub version: String,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPaths {
    pub all_issues_features_file: PathBuf,
    pub descriptions_file: PathBuf,
    pub classifications_file: PathBuf,
    pub similar_issues_file: PathBuf,
    pub timeline_predictions_file: PathBuf,
    pub action_recommendations_file: PathBuf,
    pub final_json_file: PathBuf,
    pub final_sheet_file: PathBuf,
}

impl Default for DataPaths {
    fn default() -> Self {
        Self {
            all_issues_features_file: PathBuf::from("data/processed/all_issues_features.json"),
            descriptions_file: PathBuf::from("data/outputs/descriptions.json"),
            classifications_file: PathBuf::from("data/outputs/classifications.json"),
            similar_issues_file: PathBuf::from("data/outputs/similar_issues.json"),
            timeline_predictions_file: PathBuf::from("data/outputs/timeline_predictions.json"),
            action_recommendations_file: PathBuf::from("data/outputs/action_recommendations.json"),
            final_json_file: PathBuf::from("data/outputs/final_ml_results.json"),
            final_sheet_file: PathBuf::from("data/outputs/final_ml_results.csv"),
        }
    }
}

impl DataPaths {
    pub fn inputs(&self) -> InputPaths {
        InputPaths {
            base_issues: self.all_issues_features_file.clone(),
            descriptions: self.descriptions_file.clone(),
            classifications: self.classifications_file.clone(),
            similar_issues: self.similar_issues_file.clone(),
            timeline_predictions: self.timeline_predictions_file.clone(),
            action_recommendations: self.action_recommendations_file.clone(),
        }
    }

    fn named(&self) -> [(&'static str, &Path); 8] {
        [
            ("all_issues_features_file", self.all_issues_features_file.as_path()),
            ("descriptions_file", self.descriptions_file.as_path()),
            ("classifications_file", self.classifications_file.as_path()),
            ("similar_issues_file", self.similar_issues_file.as_path()),
            ("timeline_predictions_file", self.timeline_predictions_file.as_path()),
            ("action_recommendations_file", self.action_recommendations_file.as_path()),
            ("final_json_file", self.final_json_file.as_path()),
            ("final_sheet_file", self.final_sheet_file.as_path()),
        ]
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub enabled: bool,
    pub host: Option<String>,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub table_name: String,
    pub batch_size: usize,
    pub update_existing: bool,
    pub workers: usize,
    pub connect_timeout_secs: u64,
    pub connection_params: BTreeMap<String, serde_yaml::Value>,
}

impl std::fmt::Debug for DatabaseSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSection")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("table_name", &self.table_name)
            .field("batch_size", &self.batch_size)
            .field("update_existing", &self.update_existing)
            .field("workers", &self.workers)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("connection_params", &self.connection_params)
            .finish()
    }
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            enabled: false,
            host: None,
            port: 3306,
            database: "issue_ai".to_string(),
            username: None,
            password: None,
            table_name: "ml_results".to_string(),
            batch_size: 1000,
            update_existing: true,
            workers: 1,
            connect_timeout_secs: 30,
            connection_params: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    pub enabled: bool,
    pub engines: Vec<String>,
    pub region: Option<String>,
    /// Metadata service base URL; the link-local address when unset.
    pub metadata_url: Option<String>,
    pub metadata_timeout_secs: u64,
    pub describe_timeout_secs: u64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            enabled: true,
            engines: DEFAULT_ENGINES.iter().map(|e| e.to_string()).collect(),
            region: None,
            metadata_url: None,
            metadata_timeout_secs: 2,
            describe_timeout_secs: 30,
        }
    }
}

impl DiscoverySection {
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs.max(1))
    }

    pub fn describe_timeout(&self) -> Duration {
        Duration::from_secs(self.describe_timeout_secs.max(1))
    }
}

fn yaml_scalar_text(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Reads `path`, else `$IREC_CONFIG`, else `irec.yaml`. Only the implicit
    /// default may be absent, in which case built-in defaults apply.
    pub fn from_file(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var(CONFIG_PATH_ENV).ok().filter(|p| !p.is_empty());
        let (path, required) = match (path, env_path) {
            (Some(path), _) => (path.to_path_buf(), true),
            (None, Some(env_path)) => (PathBuf::from(env_path), true),
            (None, None) => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };
        if !required && !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_yaml_str(&text, &path)
    }

    /// File configuration overlaid with the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let db = &mut self.database;
        if let Some(host) = lookup("IREC_DB_HOST") {
            db.host = Some(host);
        }
        if let Some(port) = lookup("IREC_DB_PORT") {
            db.port = port.trim().parse().map_err(|_| ConfigError::Env {
                name: "IREC_DB_PORT",
                value: port.clone(),
            })?;
        }
        if let Some(name) = lookup("IREC_DB_NAME") {
            db.database = name;
        }
        if let Some(user) = lookup("IREC_DB_USER") {
            db.username = Some(user);
        }
        if let Some(password) = lookup("IREC_DB_PASSWORD") {
            db.password = Some(password);
        }
        if let Some(enabled) = lookup("IREC_DB_ENABLED") {
            db.enabled = match enabled.trim() {
                "1" | "true" | "TRUE" | "True" => true,
                "0" | "false" | "FALSE" | "False" => false,
                _ => {
                    return Err(ConfigError::Env {
                        name: "IREC_DB_ENABLED",
                        value: enabled,
                    })
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        let db = &self.database;
        if db.batch_size == 0 {
            problems.push("database.batch_size must be greater than zero".to_string());
        } else if db.batch_size.saturating_mul(UPSERT_COLUMNS.len()) > MAX_PLACEHOLDERS {
            problems.push(format!(
                "database.batch_size {} x {} columns exceeds {} bind parameters",
                db.batch_size,
                UPSERT_COLUMNS.len(),
                MAX_PLACEHOLDERS
            ));
        }
        if db.workers == 0 {
            problems.push("database.workers must be greater than zero".to_string());
        }
        if !is_plain_identifier(&db.table_name) {
            problems.push(format!("database.table_name `{}` is not a plain identifier", db.table_name));
        }
        if !is_plain_identifier(&db.database) {
            problems.push(format!("database.database `{}` is not a plain identifier", db.database));
        }
        for (name, path) in self.data_paths.named() {
            if path.as_os_str().is_empty() {
                problems.push(format!("data_paths.{name} is not set"));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn writer_settings(&self) -> WriterSettings {
        WriterSettings {
            batch_size: self.database.batch_size,
            update_existing: self.database.update_existing,
            workers: self.database.workers,
            pipeline_version: self.pipeline.version.clone(),
        }
    }

    /// Connection parameter overrides as text, with the configured connect
    /// timeout unless the map sets its own.
    pub fn connection_overrides(&self) -> BTreeMap<String, String> {
        let mut overrides = self
            .database
            .connection_params
            .iter()
            .map(|(k, v)| (k.clone(), yaml_scalar_text(v)))
            .collect::<BTreeMap<_, _>>();
        overrides
            .entry("connect_timeout".to_string())
            .or_insert_with(|| self.database.connect_timeout_secs.to_string());
        overrides
    }

    pub fn endpoint_request(&self) -> EndpointRequest {
        let db = &self.database;
        EndpointRequest {
            enabled: db.enabled,
            host: db.host.clone(),
            port: db.port,
            database: db.database.clone(),
            username: db.username.clone(),
            password: db.password.clone(),
            discovery_enabled: self.discovery.enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.database.table_name, "ml_results");
        assert_eq!(config.database.batch_size, 1000);
        assert_eq!(config.pipeline.version, "1.0.0");
        assert!(config.discovery.enabled);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = r#"
database:
  enabled: true
  host: db.internal
  batch_size: 250
  connection_params:
    connect_timeout: 10
    ssl_mode: DISABLED
logging:
  level: debug
"#;
        let config = PipelineConfig::from_yaml_str(yaml, Path::new("irec.yaml")).expect("parse");
        assert!(config.database.enabled);
        assert_eq!(config.database.host.as_deref(), Some("db.internal"));
        assert_eq!(config.database.batch_size, 250);
        assert_eq!(config.database.port, 3306);
        assert_eq!(config.logging.level, "debug");

        let overrides = config.connection_overrides();
        assert_eq!(overrides.get("connect_timeout").map(String::as_str), Some("10"));
        assert_eq!(overrides.get("ssl_mode").map(String::as_str), Some("DISABLED"));
    }

    #[test]
    fn env_overrides_database_target() {
        let mut config = PipelineConfig::default();
        config
            .apply_env(env(&[
                ("IREC_DB_HOST", "10.0.0.5"),
                ("IREC_DB_PORT", "3307"),
                ("IREC_DB_NAME", "issues"),
                ("IREC_DB_USER", "writer"),
                ("IREC_DB_PASSWORD", "pw"),
                ("IREC_DB_ENABLED", "true"),
            ]))
            .expect("env");

        let request = config.endpoint_request();
        assert!(request.enabled);
        assert_eq!(request.host.as_deref(), Some("10.0.0.5"));
        assert_eq!(request.port, 3307);
        assert_eq!(request.database, "issues");
        assert_eq!(request.password.as_deref(), Some("pw"));
        assert!(!format!("{:?}", config.database).contains("\"pw\""));
    }

    #[test]
    fn bad_env_values_are_rejected() {
        let mut config = PipelineConfig::default();
        assert!(matches!(
            config.apply_env(env(&[("IREC_DB_PORT", "mysql")])),
            Err(ConfigError::Env { name: "IREC_DB_PORT", .. })
        ));
        assert!(config.apply_env(env(&[("IREC_DB_ENABLED", "sometimes")])).is_err());
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = PipelineConfig::default();
        config.database.batch_size = 5000;
        config.database.workers = 0;
        config.database.table_name = "ml results".to_string();
        config.data_paths.final_json_file = PathBuf::new();

        let Err(ConfigError::Invalid(problems)) = config.validate() else {
            panic!("expected invalid configuration");
        };
        assert_eq!(problems.len(), 4);
        assert!(problems[0].contains("65535"));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("nope.yaml");
        assert!(matches!(
            PipelineConfig::from_file(Some(&missing)),
            Err(ConfigError::Read { .. })
        ));

        let present = dir.path().join("irec.yaml");
        std::fs::write(&present, "pipeline:\n  version: 2.1.0\n").expect("write");
        let config = PipelineConfig::from_file(Some(&present)).expect("load");
        assert_eq!(config.pipeline.version, "2.1.0");
        assert_eq!(config.writer_settings().pipeline_version, "2.1.0");
    }

    #[test]
    fn shipped_sample_config_is_valid() {
        let text = include_str!("../../../irec.yaml");
        let config = PipelineConfig::from_yaml_str(text, Path::new("irec.yaml")).expect("parse");
        config.validate().expect("valid");
        assert!(!config.database.enabled);
        assert_eq!(config.connection_overrides().get("autocommit").map(String::as_str), Some("true"));
        assert_eq!(config.discovery.engines, vec!["mysql", "aurora-mysql"]);
    }
}

//! MySQL persistence for reconciled issue records: endpoint resolution,
//! connection setup, schema management, and batched upserts.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

pub mod connection;
pub mod endpoint;
pub mod memory;
pub mod mysql;
pub mod schema;
pub mod writer;

pub use connection::{ConnectionManager, ConnectionParams, DEFAULT_SQL_MODE};
pub use endpoint::{
    resolve_region, AwsCliCatalog, ConnectionDescriptor, DbInstance, DiscoveryError, EndpointRequest,
    EndpointResolver, EndpointSource, ImdsClient, InstanceCatalog, InstanceMetadata, NoMetadata, RankedInstance,
    DEFAULT_ENGINES, DEFAULT_REGION,
};
pub use memory::MemoryTableStore;
pub use mysql::MySqlTableStore;
pub use schema::{
    compare_columns, LiveColumn, SchemaDrift, SchemaManager, SchemaSpec, TableInfo, TableStatus,
    ML_RESULTS_SCHEMA, SCHEMA_VERSION,
};
pub use writer::{
    BatchUpsertWriter, PersistenceOutcome, PreparedRow, RecordError, WriteError, WriterSettings, UPSERT_COLUMNS,
};

pub const CRATE_NAME: &str = "irec-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("invalid connection parameter {key}={value}")]
    InvalidParam { key: String, value: String },
    #[error("connecting to {target} timed out after {seconds}s")]
    ConnectTimeout { target: String, seconds: u64 },
    #[error("connecting to {target} failed")]
    Connect {
        target: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("{operation} on `{object}` failed")]
    Statement {
        operation: &'static str,
        object: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("duplicate business key {0}")]
    DuplicateKey(String),
    #[error("{0}")]
    Backend(String),
}

impl StorageError {
    pub(crate) fn statement(operation: &'static str, object: impl Into<String>) -> impl FnOnce(sqlx::Error) -> Self {
        let object = object.into();
        move |source| StorageError::Statement {
            operation,
            object,
            source,
        }
    }
}

/// Where rows end up, as shown in run reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetInfo {
    #[serde(rename = "type")]
    pub engine: &'static str,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub table: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Insert new keys and overwrite non-key columns of existing ones.
    Upsert,
    /// Plain insert; a duplicate key fails the batch.
    InsertOnly,
}

/// Table-level operations the schema manager and writer need from a backend.
#[async_trait]
pub trait TableStore: Send + Sync {
    fn target(&self) -> &TargetInfo;

    fn schema(&self) -> &'static SchemaSpec;

    /// Server-level round trip that does not require the database to exist.
    async fn ping(&self) -> Result<(), StorageError>;

    async fn create_database(&self) -> Result<(), StorageError>;

    async fn table_exists(&self) -> Result<bool, StorageError>;

    async fn create_table(&self) -> Result<(), StorageError>;

    async fn live_columns(&self) -> Result<Vec<LiveColumn>, StorageError>;

    /// Writes one chunk atomically and returns the engine's affected-row count.
    async fn upsert(&self, rows: &[PreparedRow], mode: WriteMode) -> Result<u64, StorageError>;

    async fn row_count(&self) -> Result<u64, StorageError>;

    /// Releases pooled connections. Later calls may reconnect.
    async fn close(&self) {}

    async fn test_connection(&self) -> bool {
        match self.ping().await {
            Ok(()) => true,
            Err(err) => {
                warn!(host = %self.target().host, error = %err, "connection test failed");
                false
            }
        }
    }
}

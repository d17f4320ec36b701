//! In-process table backend. Counts affected rows the way MySQL does for
//! the upsert statement `build_upsert` emits: 1 per inserted row and 2 per
//! existing key, since `updated_at` is refreshed even when no value changes.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use irec_core::IssueKey;
use tokio::sync::Mutex;

use crate::schema::{LiveColumn, SchemaSpec};
use crate::writer::PreparedRow;
use crate::{StorageError, TableStore, TargetInfo, WriteMode};

#[derive(Debug, Default)]
struct MemoryState {
    database_exists: bool,
    table_exists: bool,
    columns: Vec<LiveColumn>,
    rows: HashMap<IssueKey, Vec<Option<String>>>,
}

#[derive(Debug)]
pub struct MemoryTableStore {
    target: TargetInfo,
    schema: &'static SchemaSpec,
    reachable: bool,
    state: Mutex<MemoryState>,
    upsert_calls: AtomicUsize,
    failing_calls: BTreeSet<usize>,
}

impl MemoryTableStore {
    pub fn new(table: impl Into<String>, schema: &'static SchemaSpec) -> Self {
        Self {
            target: TargetInfo {
                engine: "memory",
                host: "localhost".to_string(),
                port: 0,
                database: "memory".to_string(),
                table: table.into(),
            },
            schema,
            reachable: true,
            state: Mutex::new(MemoryState::default()),
            upsert_calls: AtomicUsize::new(0),
            failing_calls: BTreeSet::new(),
        }
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    /// Starts with an existing table whose columns are `columns`.
    pub fn with_live_columns(self, columns: Vec<LiveColumn>) -> Self {
        let state = MemoryState {
            database_exists: true,
            table_exists: true,
            columns,
            rows: HashMap::new(),
        };
        Self {
            state: Mutex::new(state),
            ..self
        }
    }

    /// Makes the n-th upsert call (1-based) fail.
    pub fn fail_on_call(mut self, call: usize) -> Self {
        self.failing_calls.insert(call);
        self
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub async fn stored(&self, key: &IssueKey) -> Option<Vec<Option<String>>> {
        self.state.lock().await.rows.get(key).cloned()
    }

    fn declared_columns(&self) -> Vec<LiveColumn> {
        self.schema
            .columns
            .iter()
            .map(|c| LiveColumn::new(c.name, c.sql_type.to_ascii_lowercase(), c.nullable))
            .collect()
    }

    fn check_reachable(&self) -> Result<(), StorageError> {
        if self.reachable {
            Ok(())
        } else {
            Err(StorageError::Backend("memory store is unreachable".to_string()))
        }
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    fn target(&self) -> &TargetInfo {
        &self.target
    }

    fn schema(&self) -> &'static SchemaSpec {
        self.schema
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check_reachable()
    }

    async fn create_database(&self) -> Result<(), StorageError> {
        self.check_reachable()?;
        self.state.lock().await.database_exists = true;
        Ok(())
    }

    async fn table_exists(&self) -> Result<bool, StorageError> {
        self.check_reachable()?;
        Ok(self.state.lock().await.table_exists)
    }

    async fn create_table(&self) -> Result<(), StorageError> {
        self.check_reachable()?;
        let mut state = self.state.lock().await;
        if !state.table_exists {
            state.table_exists = true;
            state.database_exists = true;
            state.columns = self.declared_columns();
        }
        Ok(())
    }

    async fn live_columns(&self) -> Result<Vec<LiveColumn>, StorageError> {
        self.check_reachable()?;
        Ok(self.state.lock().await.columns.clone())
    }

    async fn upsert(&self, rows: &[PreparedRow], mode: WriteMode) -> Result<u64, StorageError> {
        let call = self.upsert_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.check_reachable()?;
        if self.failing_calls.contains(&call) {
            return Err(StorageError::Backend(format!("injected failure on upsert call {call}")));
        }

        let mut state = self.state.lock().await;
        if !state.table_exists {
            return Err(StorageError::Backend(format!("table `{}` does not exist", self.target.table)));
        }
        if mode == WriteMode::InsertOnly {
            let mut seen = BTreeSet::new();
            for row in rows {
                if state.rows.contains_key(&row.key) || !seen.insert(row.key.to_string()) {
                    return Err(StorageError::DuplicateKey(row.key.to_string()));
                }
            }
        }

        let mut affected = 0u64;
        for row in rows {
            match state.rows.get_mut(&row.key) {
                None => {
                    state.rows.insert(row.key.clone(), row.values.clone());
                    affected += 1;
                }
                Some(existing) => {
                    existing.clone_from(&row.values);
                    affected += 2;
                }
            }
        }
        Ok(affected)
    }

    async fn row_count(&self) -> Result<u64, StorageError> {
        self.check_reachable()?;
        Ok(self.state.lock().await.rows.len() as u64)
    }
}

use async_trait::async_trait;
use sqlx::mysql::{MySql, MySqlPool};
use sqlx::{Executor, QueryBuilder};
use tokio::sync::Mutex;
use tracing::debug;

use crate::connection::ConnectionManager;
use crate::schema::{create_database_sql, is_plain_identifier, quote_ident, LiveColumn, SchemaSpec};
use crate::writer::{PreparedRow, KEY_COLUMNS, UPSERT_COLUMNS};
use crate::{StorageError, TableStore, TargetInfo, WriteMode};

/// `INSERT ... VALUES (...), (...)` for one chunk. In upsert mode every
/// non-key column is overwritten and `updated_at` is refreshed.
pub fn build_upsert(table: &str, rows: &[PreparedRow], mode: WriteMode) -> QueryBuilder<'static, MySql> {
    let columns = UPSERT_COLUMNS
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let mut builder = QueryBuilder::new(format!("INSERT INTO {} ({columns}) ", quote_ident(table)));
    builder.push_values(rows, |mut tuple, row| {
        for value in &row.values {
            tuple.push_bind(value.clone());
        }
    });

    if mode == WriteMode::Upsert {
        let updates = UPSERT_COLUMNS
            .iter()
            .filter(|c| !KEY_COLUMNS.contains(*c))
            .map(|c| {
                let quoted = quote_ident(c);
                format!("{quoted} = VALUES({quoted})")
            })
            .chain(std::iter::once(format!("{} = CURRENT_TIMESTAMP", quote_ident("updated_at"))))
            .collect::<Vec<_>>()
            .join(", ");
        builder.push(" ON DUPLICATE KEY UPDATE ");
        builder.push(updates);
    }
    builder
}

/// Unique-key violations (MySQL 1062) become `DuplicateKey` so both
/// backends report a rejected insert the same way.
fn upsert_error(table: &str, err: sqlx::Error) -> StorageError {
    let duplicate = err
        .as_database_error()
        .filter(|db| db.is_unique_violation())
        .map(|db| db.message().to_string());
    match duplicate {
        Some(message) => StorageError::DuplicateKey(message),
        None => StorageError::Statement {
            operation: "upsert",
            object: table.to_string(),
            source: err,
        },
    }
}

/// Table store backed by a lazily opened MySQL pool.
pub struct MySqlTableStore {
    manager: ConnectionManager,
    target: TargetInfo,
    schema: &'static SchemaSpec,
    pool: Mutex<Option<MySqlPool>>,
}

impl MySqlTableStore {
    pub fn new(
        manager: ConnectionManager,
        table: impl Into<String>,
        schema: &'static SchemaSpec,
    ) -> Result<Self, StorageError> {
        let table = table.into();
        let descriptor = manager.descriptor();
        for name in [table.as_str(), descriptor.database.as_str()] {
            if !is_plain_identifier(name) {
                return Err(StorageError::InvalidIdentifier(name.to_string()));
            }
        }
        let target = TargetInfo {
            engine: "mysql",
            host: descriptor.host.clone(),
            port: descriptor.port,
            database: descriptor.database.clone(),
            table,
        };
        Ok(Self {
            manager,
            target,
            schema,
            pool: Mutex::new(None),
        })
    }

    async fn pool(&self) -> Result<MySqlPool, StorageError> {
        let mut slot = self.pool.lock().await;
        if let Some(pool) = slot.as_ref() {
            return Ok(pool.clone());
        }
        let pool = self.manager.connect().await?;
        *slot = Some(pool.clone());
        Ok(pool)
    }
}

#[async_trait]
impl TableStore for MySqlTableStore {
    fn target(&self) -> &TargetInfo {
        &self.target
    }

    fn schema(&self) -> &'static SchemaSpec {
        self.schema
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.manager.connect_server().await?;
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&mut conn)
            .await
            .map_err(StorageError::statement("SELECT 1", self.target.host.clone()))?;
        Ok(())
    }

    async fn create_database(&self) -> Result<(), StorageError> {
        let mut conn = self.manager.connect_server().await?;
        conn.execute(create_database_sql(&self.target.database).as_str())
            .await
            .map_err(StorageError::statement("CREATE DATABASE", self.target.database.clone()))?;
        Ok(())
    }

    async fn table_exists(&self) -> Result<bool, StorageError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(&self.target.table)
        .fetch_one(&self.pool().await?)
        .await
        .map_err(StorageError::statement("table lookup", self.target.table.clone()))?;
        Ok(count > 0)
    }

    async fn create_table(&self) -> Result<(), StorageError> {
        let ddl = self.schema.create_table_sql(&self.target.table);
        debug!(table = %self.target.table, "executing table DDL");
        self.pool()
            .await?
            .execute(ddl.as_str())
            .await
            .map_err(StorageError::statement("CREATE TABLE", self.target.table.clone()))?;
        Ok(())
    }

    async fn live_columns(&self) -> Result<Vec<LiveColumn>, StorageError> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT CAST(column_name AS CHAR), CAST(column_type AS CHAR), CAST(is_nullable AS CHAR) \
             FROM information_schema.columns \
             WHERE table_schema = DATABASE() AND table_name = ? \
             ORDER BY ordinal_position",
        )
        .bind(&self.target.table)
        .fetch_all(&self.pool().await?)
        .await
        .map_err(StorageError::statement("column lookup", self.target.table.clone()))?;

        Ok(rows
            .into_iter()
            .map(|(name, column_type, nullable)| {
                LiveColumn::new(name, column_type, nullable.eq_ignore_ascii_case("YES"))
            })
            .collect())
    }

    async fn upsert(&self, rows: &[PreparedRow], mode: WriteMode) -> Result<u64, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let failed = || StorageError::statement("upsert", self.target.table.clone());
        let mut tx = self.pool().await?.begin().await.map_err(failed())?;
        let mut builder = build_upsert(&self.target.table, rows, mode);
        let result = builder
            .build()
            .execute(&mut *tx)
            .await
            .map_err(|err| upsert_error(&self.target.table, err))?;
        tx.commit().await.map_err(failed())?;
        Ok(result.rows_affected())
    }

    async fn row_count(&self) -> Result<u64, StorageError> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&self.target.table));
        let count: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool().await?)
            .await
            .map_err(StorageError::statement("row count", self.target.table.clone()))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn close(&self) {
        if let Some(pool) = self.pool.lock().await.take() {
            pool.close().await;
            debug!(host = %self.target.host, "connection pool closed");
        }
    }
}

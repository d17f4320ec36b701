use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlPool, MySqlPoolOptions, MySqlSslMode};
use sqlx::{ConnectOptions, Executor};
use tracing::{debug, info, warn};

use crate::endpoint::ConnectionDescriptor;
use crate::StorageError;

pub const DEFAULT_SQL_MODE: &str = "STRICT_TRANS_TABLES,NO_ZERO_DATE,NO_ZERO_IN_DATE,ERROR_FOR_DIVISION_BY_ZERO";
const TLS_OVERRIDE_KEYS: [&str; 3] = ["sslmode", "ssl_mode", "ssl-mode"];

/// Session settings applied to every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionParams {
    pub charset: String,
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    pub autocommit: bool,
    pub sql_mode: String,
}

mod secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            charset: "utf8mb4".to_string(),
            connect_timeout: Duration::from_secs(30),
            autocommit: true,
            sql_mode: DEFAULT_SQL_MODE.to_string(),
        }
    }
}

impl ConnectionParams {
    /// Defaults overlaid with caller overrides. TLS mode keys are dropped
    /// since the transport security mode is fixed.
    pub fn merged(overrides: &BTreeMap<String, String>) -> Result<Self, StorageError> {
        let mut params = Self::default();
        for (key, value) in overrides {
            let invalid = || StorageError::InvalidParam {
                key: key.clone(),
                value: value.clone(),
            };
            let normalized = key.trim().to_ascii_lowercase();
            if TLS_OVERRIDE_KEYS.contains(&normalized.as_str()) {
                debug!(key = %key, "ignoring TLS mode override");
                continue;
            }
            match normalized.as_str() {
                "charset" => {
                    if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                        return Err(invalid());
                    }
                    params.charset = value.clone();
                }
                "connect_timeout" => {
                    let secs = value.trim().parse::<u64>().map_err(|_| invalid())?;
                    params.connect_timeout = Duration::from_secs(secs.max(1));
                }
                "autocommit" => {
                    params.autocommit = parse_flag(value).ok_or_else(invalid)?;
                }
                "sql_mode" => {
                    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ',') {
                        return Err(invalid());
                    }
                    params.sql_mode = value.clone();
                }
                _ => warn!(key = %key, "unknown connection parameter ignored"),
            }
        }
        Ok(params)
    }

    pub fn session_init_sql(&self) -> String {
        format!(
            "SET SESSION sql_mode = '{}', autocommit = {}",
            self.sql_mode,
            u8::from(self.autocommit)
        )
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Opens server-level connections and database pools for one descriptor.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    descriptor: ConnectionDescriptor,
    params: ConnectionParams,
    max_connections: u32,
}

impl ConnectionManager {
    pub fn new(
        descriptor: ConnectionDescriptor,
        overrides: &BTreeMap<String, String>,
        max_connections: u32,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            descriptor,
            params: ConnectionParams::merged(overrides)?,
            max_connections: max_connections.max(1),
        })
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    fn server_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.descriptor.host)
            .port(self.descriptor.port)
            .username(&self.descriptor.username)
            .password(&self.descriptor.password)
            .charset(&self.params.charset)
            .ssl_mode(MySqlSslMode::Preferred)
    }

    fn timeout_error(&self) -> StorageError {
        StorageError::ConnectTimeout {
            target: self.descriptor.display_target(),
            seconds: self.params.connect_timeout.as_secs(),
        }
    }

    /// Single connection without a default database, for setup statements
    /// that must run before the database exists.
    pub async fn connect_server(&self) -> Result<MySqlConnection, StorageError> {
        let target = format!("{}:{}", self.descriptor.host, self.descriptor.port);
        let mut conn = tokio::time::timeout(self.params.connect_timeout, self.server_options().connect())
            .await
            .map_err(|_| self.timeout_error())?
            .map_err(|source| StorageError::Connect {
                target: target.clone(),
                source,
            })?;
        conn.execute(self.params.session_init_sql().as_str())
            .await
            .map_err(|source| StorageError::Connect { target, source })?;
        Ok(conn)
    }

    /// Pool bound to the configured database. Each pooled connection gets the
    /// session settings on connect.
    pub async fn connect(&self) -> Result<MySqlPool, StorageError> {
        let options = self.server_options().database(&self.descriptor.database);
        let init_sql = self.params.session_init_sql();
        let pool = MySqlPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.params.connect_timeout)
            .after_connect(move |conn, _meta| {
                let init_sql = init_sql.clone();
                Box::pin(async move {
                    conn.execute(init_sql.as_str()).await?;
                    Ok(())
                })
            })
            .connect_with(options);

        let pool = tokio::time::timeout(self.params.connect_timeout, pool)
            .await
            .map_err(|_| self.timeout_error())?
            .map_err(|source| StorageError::Connect {
                target: self.descriptor.display_target(),
                source,
            })?;
        info!(
            target = %self.descriptor.display_target(),
            max_connections = self.max_connections,
            "database pool ready"
        );
        Ok(pool)
    }

    /// True when the server answers a trivial query. Never errors.
    pub async fn test_connection(&self) -> bool {
        let probe = async {
            let mut conn = self.connect_server().await?;
            let one: i64 = sqlx::query_scalar("SELECT 1")
                .fetch_one(&mut conn)
                .await
                .map_err(StorageError::statement("SELECT 1", self.descriptor.host.clone()))?;
            Ok::<_, StorageError>(one == 1)
        };
        match probe.await {
            Ok(ok) => ok,
            Err(err) => {
                warn!(host = %self.descriptor.host, error = %err, "connection test failed");
                false
            }
        }
    }
}

//! Picks the database endpoint: an explicit target when one is configured,
//! otherwise the best available managed MySQL instance in the account.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const IMDS_BASE_URL: &str = "http://169.254.169.254";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_ENGINES: [&str; 2] = ["mysql", "aurora-mysql"];
const IMDS_TOKEN_TTL_SECS: &str = "21600";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no database endpoint: {reason} and discovery found no available {engines} instance")]
    NotFound { reason: String, engines: String },
    #[error("describe-instances call failed: {0}")]
    Describe(String),
    #[error("describe-instances call timed out after {0:?}")]
    Timeout(Duration),
    #[error("describe-instances output could not be parsed")]
    Parse(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndpointSource {
    Explicit,
    Discovered { identifier: String },
}

/// Fully resolved connection target. The password is never serialized.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub source: EndpointSource,
}

impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

impl ConnectionDescriptor {
    pub fn display_target(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

/// Caller-side description of where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRequest {
    pub enabled: bool,
    pub host: Option<String>,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub discovery_enabled: bool,
}

impl Default for EndpointRequest {
    fn default() -> Self {
        Self {
            enabled: false,
            host: None,
            port: 3306,
            database: String::new(),
            username: None,
            password: None,
            discovery_enabled: true,
        }
    }
}

impl EndpointRequest {
    fn explicit_host(&self) -> Option<&str> {
        self.host.as_deref().map(str::trim).filter(|h| !h.is_empty())
    }

    /// Why the explicit target cannot be used, if it cannot.
    fn unusable_reason(&self) -> Option<&'static str> {
        if !self.enabled {
            Some("explicit target disabled")
        } else if self.explicit_host().is_none() {
            Some("explicit target has no host")
        } else if self.database.trim().is_empty() {
            Some("explicit target has no database")
        } else {
            None
        }
    }

    /// The configured target when it is enabled and names both a host and
    /// a database. Discovery is not consulted for such a request.
    pub fn explicit_target(&self) -> Option<ConnectionDescriptor> {
        if self.unusable_reason().is_some() {
            return None;
        }
        let host = self.explicit_host()?.to_string();
        Some(ConnectionDescriptor {
            host,
            port: self.port,
            database: self.database.clone(),
            username: self.username.clone().unwrap_or_default(),
            password: self.password.clone().unwrap_or_default(),
            source: EndpointSource::Explicit,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbInstance {
    pub identifier: String,
    pub engine: String,
    pub status: String,
    pub host: String,
    pub port: u16,
    pub availability_zone: Option<String>,
    pub allocated_storage_gb: i64,
    pub master_username: Option<String>,
    pub publicly_accessible: bool,
    pub storage_encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedInstance {
    pub instance: DbInstance,
    pub same_zone: bool,
}

#[async_trait]
pub trait InstanceCatalog: Send + Sync {
    async fn describe_instances(&self) -> Result<Vec<DbInstance>, DiscoveryError>;
}

/// Host metadata probe. Every lookup is best effort.
#[async_trait]
pub trait InstanceMetadata: Send + Sync {
    async fn availability_zone(&self) -> Option<String>;

    async fn instance_id(&self) -> Option<String>;
}

pub struct NoMetadata;

#[async_trait]
impl InstanceMetadata for NoMetadata {
    async fn availability_zone(&self) -> Option<String> {
        None
    }

    async fn instance_id(&self) -> Option<String> {
        None
    }
}

/// Reads the instance metadata service, preferring session tokens and
/// falling back to unauthenticated reads.
#[derive(Debug, Clone)]
pub struct ImdsClient {
    client: reqwest::Client,
    base_url: String,
}

impl ImdsClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .context("building metadata client")?;
        Ok(Self {
            client,
            base_url: IMDS_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn session_token(&self) -> Option<String> {
        let resp = self
            .client
            .put(format!("{}/latest/api/token", self.base_url))
            .header("X-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL_SECS)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.text().await.ok().filter(|t| !t.is_empty())
    }

    async fn read(&self, path: &str) -> Option<String> {
        let url = format!("{}/latest/meta-data/{path}", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(token) = self.session_token().await {
            request = request.header("X-aws-ec2-metadata-token", token);
        } else {
            debug!("metadata token unavailable, using unauthenticated read");
        }
        let resp = request.send().await.ok()?;
        if !resp.status().is_success() {
            debug!(path, status = resp.status().as_u16(), "metadata read refused");
            return None;
        }
        let body = resp.text().await.ok()?;
        let body = body.trim();
        (!body.is_empty()).then(|| body.to_string())
    }
}

#[async_trait]
impl InstanceMetadata for ImdsClient {
    async fn availability_zone(&self) -> Option<String> {
        self.read("placement/availability-zone").await
    }

    async fn instance_id(&self) -> Option<String> {
        self.read("instance-id").await
    }
}

/// Region for a zone name such as `us-west-2b`.
pub fn region_from_zone(zone: &str) -> Option<String> {
    let zone = zone.trim();
    let last = zone.chars().last()?;
    if !last.is_ascii_alphabetic() || zone.len() < 2 {
        return None;
    }
    Some(zone[..zone.len() - 1].to_string())
}

/// Configured region, then the host's zone, then `AWS_DEFAULT_REGION`.
pub async fn resolve_region(configured: Option<&str>, metadata: &dyn InstanceMetadata) -> String {
    if let Some(region) = configured.map(str::trim).filter(|r| !r.is_empty()) {
        return region.to_string();
    }
    if let Some(region) = metadata
        .availability_zone()
        .await
        .as_deref()
        .and_then(region_from_zone)
    {
        return region;
    }
    std::env::var("AWS_DEFAULT_REGION")
        .ok()
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_REGION.to_string())
}

#[derive(Debug, Deserialize)]
struct DescribeOutput {
    #[serde(rename = "DBInstances", default)]
    instances: Vec<DescribedInstance>,
}

#[derive(Debug, Deserialize)]
struct DescribedInstance {
    #[serde(rename = "DBInstanceIdentifier")]
    identifier: String,
    #[serde(rename = "Engine", default)]
    engine: String,
    #[serde(rename = "DBInstanceStatus", default)]
    status: String,
    #[serde(rename = "Endpoint")]
    endpoint: Option<DescribedEndpoint>,
    #[serde(rename = "AvailabilityZone")]
    availability_zone: Option<String>,
    #[serde(rename = "AllocatedStorage", default)]
    allocated_storage: i64,
    #[serde(rename = "MasterUsername")]
    master_username: Option<String>,
    #[serde(rename = "PubliclyAccessible", default)]
    publicly_accessible: bool,
    #[serde(rename = "StorageEncrypted", default)]
    storage_encrypted: bool,
}

#[derive(Debug, Deserialize)]
struct DescribedEndpoint {
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port", default = "default_port")]
    port: u16,
}

fn default_port() -> u16 {
    3306
}

/// Parses `describe-db-instances` JSON. Instances without an endpoint
/// (still creating, for example) are dropped.
pub fn parse_describe_output(bytes: &[u8]) -> Result<Vec<DbInstance>, DiscoveryError> {
    let parsed: DescribeOutput = serde_json::from_slice(bytes).map_err(DiscoveryError::Parse)?;
    Ok(parsed
        .instances
        .into_iter()
        .filter_map(|d| {
            let endpoint = d.endpoint?;
            Some(DbInstance {
                identifier: d.identifier,
                engine: d.engine,
                status: d.status,
                host: endpoint.address,
                port: endpoint.port,
                availability_zone: d.availability_zone,
                allocated_storage_gb: d.allocated_storage,
                master_username: d.master_username,
                publicly_accessible: d.publicly_accessible,
                storage_encrypted: d.storage_encrypted,
            })
        })
        .collect())
}

/// Lists instances through the `aws` command line tool.
#[derive(Debug, Clone)]
pub struct AwsCliCatalog {
    program: String,
    region: String,
    timeout: Duration,
}

impl AwsCliCatalog {
    pub fn new(region: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: "aws".to_string(),
            region: region.into(),
            timeout,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

#[async_trait]
impl InstanceCatalog for AwsCliCatalog {
    async fn describe_instances(&self) -> Result<Vec<DbInstance>, DiscoveryError> {
        let mut command = Command::new(&self.program);
        command
            .args(["rds", "describe-db-instances", "--output", "json", "--region"])
            .arg(&self.region)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| DiscoveryError::Timeout(self.timeout))?
            .map_err(|err| DiscoveryError::Describe(format!("{}: {err}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DiscoveryError::Describe(stderr.trim().to_string()));
        }
        parse_describe_output(&output.stdout)
    }
}

/// Chooses between the explicit target and discovered instances.
pub struct EndpointResolver {
    catalog: Arc<dyn InstanceCatalog>,
    metadata: Arc<dyn InstanceMetadata>,
    engines: Vec<String>,
}

impl EndpointResolver {
    pub fn new(catalog: Arc<dyn InstanceCatalog>, metadata: Arc<dyn InstanceMetadata>) -> Self {
        Self {
            catalog,
            metadata,
            engines: DEFAULT_ENGINES.iter().map(|e| e.to_string()).collect(),
        }
    }

    pub fn with_engines(mut self, engines: Vec<String>) -> Self {
        if !engines.is_empty() {
            self.engines = engines;
        }
        self
    }

    fn engine_matches(&self, engine: &str) -> bool {
        self.engines.iter().any(|e| e.eq_ignore_ascii_case(engine))
    }

    /// Available instances of an accepted engine, best first: same zone as
    /// this host, then larger storage. Never fails; errors mean no candidates.
    pub async fn candidates(&self) -> Vec<RankedInstance> {
        let instances = match self.catalog.describe_instances().await {
            Ok(instances) => instances,
            Err(err) => {
                warn!(error = %err, "instance discovery failed");
                return Vec::new();
            }
        };
        let local_zone = self.metadata.availability_zone().await;

        let mut ranked = instances
            .into_iter()
            .filter(|i| self.engine_matches(&i.engine))
            .filter(|i| i.status.eq_ignore_ascii_case("available"))
            .map(|instance| RankedInstance {
                same_zone: local_zone.is_some() && instance.availability_zone == local_zone,
                instance,
            })
            .collect::<Vec<_>>();
        ranked.sort_by(|a, b| {
            (b.same_zone, b.instance.allocated_storage_gb).cmp(&(a.same_zone, a.instance.allocated_storage_gb))
        });
        debug!(count = ranked.len(), zone = ?local_zone, "ranked discovery candidates");
        ranked
    }

    pub async fn resolve(&self, request: &EndpointRequest) -> Result<ConnectionDescriptor, DiscoveryError> {
        if let Some(descriptor) = request.explicit_target() {
            info!(host = %descriptor.host, database = %descriptor.database, "using explicit database target");
            return Ok(descriptor);
        }
        let reason = request.unusable_reason().unwrap_or("explicit target unusable");

        let not_found = || DiscoveryError::NotFound {
            reason: reason.to_string(),
            engines: self.engines.join("/"),
        };
        if !request.discovery_enabled || request.database.trim().is_empty() {
            return Err(not_found());
        }

        let best = self.candidates().await.into_iter().next().ok_or_else(not_found)?;
        let instance = best.instance;
        info!(
            identifier = %instance.identifier,
            host = %instance.host,
            same_zone = best.same_zone,
            "using discovered database instance"
        );
        Ok(ConnectionDescriptor {
            host: instance.host,
            port: instance.port,
            database: request.database.clone(),
            username: request
                .username
                .clone()
                .filter(|u| !u.is_empty())
                .or(instance.master_username)
                .unwrap_or_default(),
            password: request.password.clone().unwrap_or_default(),
            source: EndpointSource::Discovered {
                identifier: instance.identifier,
            },
        })
    }
}

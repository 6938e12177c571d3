//! DatabaseCluster CRD
//!
//! Declarative description of a database cluster: engine, proxy, monitoring
//! and backup schedules. The status block is written only by the
//! reconciling operator.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// DatabaseCluster CRD
// =============================================================================

/// DatabaseCluster declares a database engine deployment with its proxy layer
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "dbaas.controlplane.io",
    version = "v1alpha1",
    kind = "DatabaseCluster",
    plural = "databaseclusters",
    shortname = "dbc",
    status = "DatabaseClusterStatus",
    printcolumn = r#"{"name": "Engine", "type": "string", "jsonPath": ".spec.engine.type"}"#,
    printcolumn = r#"{"name": "Size", "type": "integer", "jsonPath": ".status.size"}"#,
    printcolumn = r#"{"name": "Ready", "type": "integer", "jsonPath": ".status.ready"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterSpec {
    /// Database engine settings
    pub engine: EngineSpec,

    /// Proxy / load balancer in front of the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySpec>,

    /// Monitoring instance binding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<MonitoringSpec>,

    /// Scheduled backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSpec>,

    /// Stop the cluster without deleting it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_unsafe_configuration: Option<bool>,
}

// =============================================================================
// Engine
// =============================================================================

/// Supported database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    Pxc,
    Psmdb,
    Postgresql,
}

impl EngineType {
    /// Parse the wire name, `None` for engines this control plane cannot run
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pxc" => Some(EngineType::Pxc),
            "psmdb" => Some(EngineType::Psmdb),
            "postgresql" => Some(EngineType::Postgresql),
            _ => None,
        }
    }

    /// Name of the operator (and engine descriptor) that runs this engine
    pub fn operator_name(&self) -> &'static str {
        match self {
            EngineType::Pxc => "percona-xtradb-cluster-operator",
            EngineType::Psmdb => "percona-server-mongodb-operator",
            EngineType::Postgresql => "percona-postgresql-operator",
        }
    }

    pub fn all() -> [EngineType; 3] {
        [EngineType::Pxc, EngineType::Psmdb, EngineType::Postgresql]
    }
}

impl std::fmt::Display for EngineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineType::Pxc => write!(f, "pxc"),
            EngineType::Psmdb => write!(f, "psmdb"),
            EngineType::Postgresql => write!(f, "postgresql"),
        }
    }
}

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EngineSpec {
    /// Engine type: pxc, psmdb or postgresql
    pub r#type: String,

    /// Engine version, must be offered by the engine descriptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    pub storage: StorageSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesSpec>,

    /// Raw engine configuration file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_secrets_name: Option<String>,
}

/// Quantity given either as a Kubernetes quantity string or a bare integer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ResourceQuantity {
    Int(i64),
    Str(String),
}

/// Persistent storage for the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    pub size: ResourceQuantity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

/// CPU and memory limits for each engine replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<ResourceQuantity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<ResourceQuantity>,
}

// =============================================================================
// Proxy
// =============================================================================

/// Proxy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    /// haproxy, proxysql, pgbouncer or mongos
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expose: Option<ExposeSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesSpec>,
}

/// How the proxy is exposed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExposeSpec {
    /// internal or external
    pub r#type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_source_ranges: Option<Vec<String>>,
}

// =============================================================================
// Monitoring & Backup
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSpec {
    /// Name of a monitoring instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring_config_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schedules: Vec<BackupSchedule>,
}

/// A cron-driven backup into a backup storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupSchedule {
    #[serde(default)]
    pub enabled: bool,
    pub name: String,
    pub backup_storage_name: String,
    /// Cron expression
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_copies: Option<i32>,
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of the cluster, written by the operator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterStatus {
    /// Number of pods of the cluster (engine plus proxy)
    #[serde(default)]
    pub size: i32,

    /// Number of ready pods
    #[serde(default)]
    pub ready: i32,

    /// initializing, ready, error, paused, ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Connection hostname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DatabaseCluster {
    /// Storage names referenced by backup schedules
    pub fn backup_storage_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .spec
            .backup
            .iter()
            .flat_map(|b| b.schedules.iter())
            .map(|s| s.backup_storage_name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Monitoring instance this cluster reports to, if any
    pub fn monitoring_instance(&self) -> Option<&str> {
        self.spec
            .monitoring
            .as_ref()
            .and_then(|m| m.monitoring_config_name.as_deref())
            .filter(|name| !name.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cluster_json() -> serde_json::Value {
        json!({
            "apiVersion": "dbaas.controlplane.io/v1alpha1",
            "kind": "DatabaseCluster",
            "metadata": { "name": "orders" },
            "spec": {
                "engine": {
                    "type": "psmdb",
                    "replicas": 1,
                    "version": "6.0.5-4",
                    "storage": { "size": "4G" },
                    "resources": { "cpu": "1", "memory": "1G" }
                },
                "proxy": { "type": "mongos", "replicas": 1, "expose": { "type": "internal" } },
                "monitoring": { "monitoringConfigName": "pmm-1" },
                "backup": {
                    "enabled": true,
                    "schedules": [
                        { "enabled": true, "name": "daily", "backupStorageName": "s3-a", "schedule": "0 0 * * *" },
                        { "enabled": true, "name": "hourly", "backupStorageName": "s3-a", "schedule": "0 * * * *" }
                    ]
                }
            }
        })
    }

    #[test]
    fn test_cluster_roundtrip_keeps_user_fields() {
        let input = cluster_json();
        let cluster: DatabaseCluster = serde_json::from_value(input.clone()).unwrap();
        assert!(cluster.status.is_none());

        let output = serde_json::to_value(&cluster).unwrap();
        assert_eq!(output["spec"], input["spec"]);
        assert_eq!(output["metadata"]["name"], "orders");
    }

    #[test]
    fn test_cluster_references() {
        let cluster: DatabaseCluster = serde_json::from_value(cluster_json()).unwrap();
        assert_eq!(cluster.backup_storage_names(), vec!["s3-a".to_string()]);
        assert_eq!(cluster.monitoring_instance(), Some("pmm-1"));
    }

    #[test]
    fn test_quantity_accepts_int_and_string() {
        let q: ResourceQuantity = serde_json::from_value(json!(2)).unwrap();
        assert_eq!(q, ResourceQuantity::Int(2));
        let q: ResourceQuantity = serde_json::from_value(json!("600m")).unwrap();
        assert_eq!(q, ResourceQuantity::Str("600m".into()));
    }

    #[test]
    fn test_engine_type_operator_names() {
        assert_eq!(EngineType::parse("pxc"), Some(EngineType::Pxc));
        assert_eq!(EngineType::parse("mysql"), None);
        assert_eq!(
            EngineType::Psmdb.operator_name(),
            "percona-server-mongodb-operator"
        );
    }
}

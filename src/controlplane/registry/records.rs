//! Registry records
//!
//! Global records (backup storages, monitoring instances) are control-plane
//! types holding secret references only. Scoped records are the declared
//! custom resources themselves, stored without status.

use crate::crd::{DatabaseCluster, DatabaseClusterBackup, DatabaseClusterRestore};
use crate::domain::ports::{ObjectKind, SecretRef};
use serde::{Deserialize, Serialize};

/// Every kind the registry stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    BackupStorage,
    MonitoringInstance,
    DatabaseCluster,
    DatabaseClusterBackup,
    DatabaseClusterRestore,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::BackupStorage => "BackupStorage",
            ResourceKind::MonitoringInstance => "MonitoringInstance",
            ResourceKind::DatabaseCluster => "DatabaseCluster",
            ResourceKind::DatabaseClusterBackup => "DatabaseClusterBackup",
            ResourceKind::DatabaseClusterRestore => "DatabaseClusterRestore",
        }
    }

    /// Orchestrator object kind records of this kind are projected as
    pub fn object_kind(&self) -> Option<ObjectKind> {
        match self {
            ResourceKind::DatabaseCluster => Some(ObjectKind::DatabaseCluster),
            ResourceKind::DatabaseClusterBackup => Some(ObjectKind::DatabaseClusterBackup),
            ResourceKind::DatabaseClusterRestore => Some(ObjectKind::DatabaseClusterRestore),
            ResourceKind::BackupStorage | ResourceKind::MonitoringInstance => None,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A value the registry can hold
pub trait Record: Clone + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn name(&self) -> &str;

    /// Owning cluster, used by filtered listings
    fn owner(&self) -> Option<&str> {
        None
    }
}

// =============================================================================
// Global Records
// =============================================================================

/// Object storage that backups are written to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageRecord {
    pub name: String,
    /// s3 or azure
    #[serde(rename = "type")]
    pub storage_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub bucket_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub access_key_id: SecretRef,
    pub secret_key_id: SecretRef,
    /// Namespaces allowed to use this storage, empty for all
    #[serde(default)]
    pub target_namespaces: Vec<String>,
}

impl BackupStorageRecord {
    pub fn admits_namespace(&self, namespace: &str) -> bool {
        self.target_namespaces.is_empty() || self.target_namespaces.iter().any(|n| n == namespace)
    }
}

impl Record for BackupStorageRecord {
    const KIND: ResourceKind = ResourceKind::BackupStorage;

    fn name(&self) -> &str {
        &self.name
    }
}

/// External monitoring endpoint clusters report to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringInstanceRecord {
    pub name: String,
    /// pmm
    #[serde(rename = "type")]
    pub instance_type: String,
    pub url: String,
    pub api_key_secret_id: SecretRef,
    #[serde(default)]
    pub target_namespaces: Vec<String>,
}

impl Record for MonitoringInstanceRecord {
    const KIND: ResourceKind = ResourceKind::MonitoringInstance;

    fn name(&self) -> &str {
        &self.name
    }
}

// =============================================================================
// Scoped Records
// =============================================================================

impl Record for DatabaseCluster {
    const KIND: ResourceKind = ResourceKind::DatabaseCluster;

    fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}

impl Record for DatabaseClusterBackup {
    const KIND: ResourceKind = ResourceKind::DatabaseClusterBackup;

    fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    fn owner(&self) -> Option<&str> {
        Some(&self.spec.db_cluster_name)
    }
}

impl Record for DatabaseClusterRestore {
    const KIND: ResourceKind = ResourceKind::DatabaseClusterRestore;

    fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    fn owner(&self) -> Option<&str> {
        Some(&self.spec.db_cluster_name)
    }
}

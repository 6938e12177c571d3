//! Backup, Restore and BackupStorage CRDs
//!
//! Backups and restores are declared by API callers. BackupStorage objects are
//! namespaced copies of the control plane's global backup storages, created
//! when something in the namespace starts referencing them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// DatabaseClusterBackup CRD
// =============================================================================

/// An on-demand backup of a database cluster into a backup storage
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "dbaas.controlplane.io",
    version = "v1alpha1",
    kind = "DatabaseClusterBackup",
    plural = "databaseclusterbackups",
    shortname = "dbbackup",
    status = "DatabaseClusterBackupStatus",
    printcolumn = r#"{"name": "Cluster", "type": "string", "jsonPath": ".spec.dbClusterName"}"#,
    printcolumn = r#"{"name": "Storage", "type": "string", "jsonPath": ".spec.backupStorageName"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterBackupSpec {
    /// Cluster being backed up
    pub db_cluster_name: String,
    /// Storage receiving the backup
    pub backup_storage_name: String,
}

/// Observed backup progress
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterBackupStatus {
    /// Starting, Running, Succeeded, Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<String>,
    /// Where the backup landed inside the bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

// =============================================================================
// DatabaseClusterRestore CRD
// =============================================================================

/// Restore of a database cluster from a backup
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "dbaas.controlplane.io",
    version = "v1alpha1",
    kind = "DatabaseClusterRestore",
    plural = "databaseclusterrestores",
    shortname = "dbrestore",
    status = "DatabaseClusterRestoreStatus",
    printcolumn = r#"{"name": "Cluster", "type": "string", "jsonPath": ".spec.dbClusterName"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterRestoreSpec {
    /// Cluster the data is restored into
    pub db_cluster_name: String,
    pub data_source: RestoreDataSource,
}

/// Where restored data comes from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestoreDataSource {
    /// An existing DatabaseClusterBackup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_cluster_backup_name: Option<String>,

    /// A backup that only exists inside a backup storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_source: Option<BackupSource>,
}

impl RestoreDataSource {
    /// Neither a backup nor a backup source is named
    pub fn is_empty(&self) -> bool {
        self.db_cluster_backup_name
            .as_deref()
            .map_or(true, str::is_empty)
            && self.backup_source.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupSource {
    pub path: String,
    pub backup_storage_name: String,
}

/// Observed restore progress
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterRestoreStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DatabaseClusterRestore {
    /// Backup storage named directly by the data source
    pub fn backup_storage_name(&self) -> Option<&str> {
        self.spec
            .data_source
            .backup_source
            .as_ref()
            .map(|s| s.backup_storage_name.as_str())
            .filter(|name| !name.is_empty())
    }
}

// =============================================================================
// BackupStorage CRD
// =============================================================================

/// Namespaced copy of a backup storage consumed by the database operators
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "dbaas.controlplane.io",
    version = "v1alpha1",
    kind = "BackupStorage",
    plural = "backupstorages",
    printcolumn = r#"{"name": "Type", "type": "string", "jsonPath": ".spec.type"}"#,
    printcolumn = r#"{"name": "Bucket", "type": "string", "jsonPath": ".spec.bucket"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageSpec {
    /// s3 or azure
    pub r#type: String,
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    /// Secret holding the access and secret keys
    pub credentials_secret_name: String,
}

//! Domain Ports - Core trait definitions for the control plane
//!
//! These traits define the boundaries between the control plane and the
//! systems it depends on. Adapters implement them to provide concrete
//! functionality (in-memory, Kubernetes, HTTP).

use crate::crd::DatabaseEngine;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Orchestrator Object Types
// =============================================================================

/// Kinds of objects projected into the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    DatabaseCluster,
    DatabaseClusterBackup,
    DatabaseClusterRestore,
    BackupStorage,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::DatabaseCluster => write!(f, "DatabaseCluster"),
            ObjectKind::DatabaseClusterBackup => write!(f, "DatabaseClusterBackup"),
            ObjectKind::DatabaseClusterRestore => write!(f, "DatabaseClusterRestore"),
            ObjectKind::BackupStorage => write!(f, "BackupStorage"),
        }
    }
}

/// Address of a single object inside the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Backup storage copy handed to the orchestrator, credentials included
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageProjection {
    pub name: String,
    pub storage_type: String,
    pub bucket_name: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    pub access_key: String,
    pub secret_key: String,
}

// =============================================================================
// Cluster Metadata Types
// =============================================================================

/// Orchestrator metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    /// Distribution flavour (generic, eks, minikube, ...)
    pub cluster_type: String,
    pub storage_class_names: Vec<String>,
}

/// CPU, memory and disk amounts in base units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAmounts {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub disk_size: u64,
}

impl ResourceAmounts {
    pub fn saturating_add(&self, other: &ResourceAmounts) -> ResourceAmounts {
        ResourceAmounts {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            disk_size: self.disk_size.saturating_add(other.disk_size),
        }
    }

    pub fn saturating_sub(&self, other: &ResourceAmounts) -> ResourceAmounts {
        ResourceAmounts {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            disk_size: self.disk_size.saturating_sub(other.disk_size),
        }
    }
}

/// Aggregate capacity and what is left of it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResources {
    pub capacity: ResourceAmounts,
    pub available: ResourceAmounts,
}

// =============================================================================
// Cluster Orchestrator Port
// =============================================================================

/// Port for the external reconciling orchestrator
#[async_trait]
pub trait ClusterOrchestrator: Send + Sync {
    /// Orchestrator flavour, for logs and health output
    fn orchestrator_name(&self) -> &str;

    /// Declare (create or replace) an object
    async fn apply(&self, object: &ObjectRef, manifest: serde_json::Value) -> Result<()>;

    /// Project a backup storage and its credentials into a namespace
    async fn apply_backup_storage(
        &self,
        namespace: &str,
        storage: &BackupStorageProjection,
    ) -> Result<()>;

    /// Remove an object, succeeding when it is already gone
    async fn remove(&self, object: &ObjectRef) -> Result<()>;

    /// Last status the orchestrator reported, `None` before the first reconcile
    async fn observed_status(&self, object: &ObjectRef) -> Result<Option<serde_json::Value>>;

    /// List declared objects of a kind in a namespace
    async fn list_objects(&self, kind: ObjectKind, namespace: &str)
        -> Result<Vec<serde_json::Value>>;

    /// List database engines installed for a namespace
    async fn list_engines(&self, namespace: &str) -> Result<Vec<DatabaseEngine>>;

    /// Get a database engine by its operator name
    async fn get_engine(&self, namespace: &str, name: &str) -> Result<Option<DatabaseEngine>>;

    /// Replace the allowed versions of an engine
    async fn update_engine_allowed_versions(
        &self,
        namespace: &str,
        name: &str,
        allowed_versions: Vec<String>,
    ) -> Result<DatabaseEngine>;

    /// Cluster type and storage classes
    async fn cluster_info(&self) -> Result<ClusterInfo>;

    /// Aggregate capacity and availability
    async fn cluster_resources(&self) -> Result<ClusterResources>;

    /// Check orchestrator connectivity
    async fn health_check(&self) -> Result<bool>;
}

// =============================================================================
// Secret Store Port
// =============================================================================

/// Opaque handle to a stored secret, safe to return to callers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretRef(pub String);

impl SecretRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SecretRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SecretRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Port for credential storage
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Store a new secret
    async fn put(&self, value: &str) -> Result<SecretRef>;

    /// Store a new value for an existing secret under a fresh reference.
    ///
    /// The previous reference stays readable; callers retire it with
    /// [`SecretStore::delete`] once the new reference is committed.
    async fn rotate(&self, reference: &SecretRef, value: &str) -> Result<SecretRef>;

    /// Read a secret value, never exposed through the API
    async fn get(&self, reference: &SecretRef) -> Result<String>;

    /// Delete a secret, reporting `SecretNotFound` when absent
    async fn delete(&self, reference: &SecretRef) -> Result<()>;
}

// =============================================================================
// Credential Prechecker Port
// =============================================================================

/// Port for verifying monitoring credentials against the monitoring endpoint
#[async_trait]
pub trait CredentialPrechecker: Send + Sync {
    /// Exchange user/password for a derived API key named `key_name`
    async fn obtain_api_key(
        &self,
        url: &str,
        user: &str,
        password: &str,
        key_name: &str,
    ) -> Result<String>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ClusterOrchestratorRef = Arc<dyn ClusterOrchestrator>;
pub type SecretStoreRef = Arc<dyn SecretStore>;
pub type CredentialPrecheckerRef = Arc<dyn CredentialPrechecker>;
